//! Frame appender.
//!
//! Reservation is a single `fetch_add` on the partition tail, so concurrent
//! writers never overlap. A writer whose reservation runs past the usable end
//! of the partition fills the remainder with one padding frame (if it owns
//! the start of that remainder) and reports the partition as filled.

use super::claim::ClaimedFragment;
use super::frame::{aligned_framed_length, framed_length, HEADER_LENGTH, TYPE_MESSAGE, TYPE_PADDING};
use super::log_buffer::{LogBuffer, LogBufferPartition};

/// The partition has no room for the frame; roll and retry.
pub const RESULT_PARTITION_FILLED: i64 = -2;

/// The partition no longer accepts writes for the requested id.
pub const RESULT_STALE_PARTITION: i64 = -3;

/// Append `payload` as one committed frame.
///
/// Returns the partition offset just past the frame, or a negative result.
pub(crate) fn append_frame(
    log_buffer: &LogBuffer,
    partition_id: i32,
    payload: &[u8],
    stream_id: i32,
) -> i64 {
    let partition = log_buffer.partition(partition_id);
    if partition.partition_id() != partition_id {
        return RESULT_STALE_PARTITION;
    }

    let frame_length = framed_length(payload.len());
    let aligned = aligned_framed_length(payload.len());
    let offset = partition.reserve(aligned);
    let new_tail = offset + aligned;

    if new_tail <= log_buffer.max_frame_end() {
        partition.set_frame_length_ordered(offset, -(frame_length as i32));
        partition.put_header(offset, TYPE_MESSAGE, stream_id);
        partition.put_bytes(offset + HEADER_LENGTH, payload);
        partition.set_frame_length_ordered(offset, frame_length as i32);
        new_tail as i64
    } else {
        on_end_of_partition(log_buffer, partition, offset);
        RESULT_PARTITION_FILLED
    }
}

/// Reserve a frame for `length` payload bytes and hand it out uncommitted.
pub(crate) fn claim<'a>(
    log_buffer: &'a LogBuffer,
    partition_id: i32,
    length: usize,
    stream_id: i32,
) -> Result<(i64, ClaimedFragment<'a>), i64> {
    let partition = log_buffer.partition(partition_id);
    if partition.partition_id() != partition_id {
        return Err(RESULT_STALE_PARTITION);
    }

    let frame_length = framed_length(length);
    let aligned = aligned_framed_length(length);
    let offset = partition.reserve(aligned);
    let new_tail = offset + aligned;

    if new_tail <= log_buffer.max_frame_end() {
        partition.set_frame_length_ordered(offset, -(frame_length as i32));
        partition.put_header(offset, TYPE_MESSAGE, stream_id);
        Ok((
            new_tail as i64,
            ClaimedFragment::new(partition, offset, frame_length),
        ))
    } else {
        on_end_of_partition(log_buffer, partition, offset);
        Err(RESULT_PARTITION_FILLED)
    }
}

/// Pad from `offset` to the end if this writer's reservation started inside
/// the usable area.
fn on_end_of_partition(log_buffer: &LogBuffer, partition: &LogBufferPartition, offset: usize) {
    if offset <= log_buffer.max_frame_end() {
        let padding_length = partition.capacity() - offset;
        partition.set_frame_length_ordered(offset, -(padding_length as i32));
        partition.put_header(offset, TYPE_PADDING, 0);
        partition.set_frame_length_ordered(offset, padding_length as i32);
    }
}
