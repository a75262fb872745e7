//! Frame layout.
//!
//! ```text
//!  0               4       5       6               8              12
//!  +---------------+-------+-------+---------------+---------------+---------
//!  |    length     |version| flags |     type      |   stream id   | payload
//!  +---------------+-------+-------+---------------+---------------+---------
//! ```
//!
//! `length` covers header plus payload. It is negative while the frame is
//! being written and becomes positive once the frame is committed. Frames
//! start on `FRAME_ALIGNMENT` boundaries.

pub const LENGTH_OFFSET: usize = 0;
pub const VERSION_OFFSET: usize = 4;
pub const FLAGS_OFFSET: usize = 5;
pub const TYPE_OFFSET: usize = 6;
pub const STREAM_ID_OFFSET: usize = 8;

/// Size of the frame header in bytes.
pub const HEADER_LENGTH: usize = 12;

/// Frames start on multiples of this.
pub const FRAME_ALIGNMENT: usize = 8;

pub const FRAME_VERSION: u8 = 0;

/// Frame carrying a message.
pub const TYPE_MESSAGE: u16 = 0;

/// Frame to be skipped by readers (end-of-partition filler or aborted claim).
pub const TYPE_PADDING: u16 = 1;

#[inline]
pub const fn align(value: usize, alignment: usize) -> usize {
    (value + alignment - 1) & !(alignment - 1)
}

/// Header plus payload, unaligned.
#[inline]
pub const fn framed_length(payload_length: usize) -> usize {
    HEADER_LENGTH + payload_length
}

/// Space a frame with the given payload occupies in a partition.
#[inline]
pub const fn aligned_framed_length(payload_length: usize) -> usize {
    align(framed_length(payload_length), FRAME_ALIGNMENT)
}
