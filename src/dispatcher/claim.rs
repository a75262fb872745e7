//! Two-phase writes.

use super::frame::{HEADER_LENGTH, TYPE_PADDING};
use super::log_buffer::LogBufferPartition;

/// A reserved, not yet visible frame.
///
/// Readers stop at the frame until it is committed. Aborting turns it into
/// padding that readers skip. Dropping an unfinished claim aborts it.
pub struct ClaimedFragment<'a> {
    partition: &'a LogBufferPartition,
    offset: usize,
    frame_length: usize,
    done: bool,
}

impl<'a> ClaimedFragment<'a> {
    pub(crate) fn new(partition: &'a LogBufferPartition, offset: usize, frame_length: usize) -> Self {
        Self {
            partition,
            offset,
            frame_length,
            done: false,
        }
    }

    /// Payload capacity of the claim.
    pub fn len(&self) -> usize {
        self.frame_length - HEADER_LENGTH
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Writable payload window.
    pub fn buffer(&mut self) -> &mut [u8] {
        // SAFETY: the claim owns this reserved range exclusively until it
        // is committed or aborted, and `&mut self` prevents aliasing views.
        unsafe {
            self.partition
                .bytes_mut(self.offset + HEADER_LENGTH, self.len())
        }
    }

    /// Publish the frame to readers.
    pub fn commit(mut self) {
        self.partition
            .set_frame_length_ordered(self.offset, self.frame_length as i32);
        self.done = true;
    }

    /// Release the reservation as padding.
    pub fn abort(mut self) {
        self.abort_in_place();
    }

    fn abort_in_place(&mut self) {
        self.partition.put_header(self.offset, TYPE_PADDING, 0);
        self.partition
            .set_frame_length_ordered(self.offset, self.frame_length as i32);
        self.done = true;
    }
}

impl Drop for ClaimedFragment<'_> {
    fn drop(&mut self) {
        if !self.done {
            self.abort_in_place();
        }
    }
}
