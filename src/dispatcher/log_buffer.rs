//! Pre-allocated ring of log partitions.
//!
//! Each physical partition is reused for partition ids `slot`, `slot + count`,
//! `slot + 2 * count`, ... A partition carries the id it currently accepts
//! writes for; it is re-armed for the next id only after every subscriber
//! has moved past it and it has been zeroed.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicI32, Ordering};

use super::frame::{
    FLAGS_OFFSET, FRAME_ALIGNMENT, FRAME_VERSION, HEADER_LENGTH, STREAM_ID_OFFSET, TYPE_OFFSET,
    VERSION_OFFSET,
};

/// One fixed-capacity segment of the log.
///
/// Backed by `u64` words so every frame start (8-byte aligned) can be
/// viewed as an `AtomicI32` length field.
pub struct LogBufferPartition {
    memory: Box<[UnsafeCell<u64>]>,
    capacity: usize,
    tail: AtomicI32,
    partition_id: AtomicI32,
}

// SAFETY: writers only touch the byte ranges they reserved through the tail
// counter; readers only touch frames whose length they observed committed
// with acquire ordering. Zeroing happens when no reader or writer can
// reach the partition.
unsafe impl Send for LogBufferPartition {}
unsafe impl Sync for LogBufferPartition {}

impl LogBufferPartition {
    pub fn new(capacity: usize, partition_id: i32) -> Self {
        let words = capacity / FRAME_ALIGNMENT;
        let memory = (0..words).map(|_| UnsafeCell::new(0u64)).collect();
        Self {
            memory,
            capacity,
            tail: AtomicI32::new(0),
            partition_id: AtomicI32::new(partition_id),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Partition id this physical partition currently holds.
    pub fn partition_id(&self) -> i32 {
        self.partition_id.load(Ordering::Acquire)
    }

    pub fn tail_volatile(&self) -> i32 {
        self.tail.load(Ordering::Acquire)
    }

    /// Reserve `length` bytes; returns the offset the reservation starts at.
    pub(crate) fn reserve(&self, length: usize) -> usize {
        self.tail.fetch_add(length as i32, Ordering::AcqRel) as usize
    }

    fn base(&self) -> *mut u8 {
        UnsafeCell::raw_get(self.memory.as_ptr()) as *mut u8
    }

    fn length_field(&self, offset: usize) -> &AtomicI32 {
        debug_assert!(offset % FRAME_ALIGNMENT == 0 && offset + 4 <= self.capacity);
        // SAFETY: offset is 8-byte aligned inside the allocation and the
        // field is only ever accessed atomically.
        unsafe { &*(self.base().add(offset) as *const AtomicI32) }
    }

    /// Frame length at `offset` as last published (acquire).
    pub fn frame_length_volatile(&self, offset: usize) -> i32 {
        self.length_field(offset).load(Ordering::Acquire)
    }

    pub(crate) fn set_frame_length_ordered(&self, offset: usize, length: i32) {
        self.length_field(offset).store(length, Ordering::Release);
    }

    /// Write the non-length header fields of the frame at `offset`.
    pub(crate) fn put_header(&self, offset: usize, frame_type: u16, stream_id: i32) {
        self.put_bytes(offset + VERSION_OFFSET, &[FRAME_VERSION]);
        self.put_bytes(offset + FLAGS_OFFSET, &[0]);
        self.put_bytes(offset + TYPE_OFFSET, &frame_type.to_le_bytes());
        self.put_bytes(offset + STREAM_ID_OFFSET, &stream_id.to_le_bytes());
    }

    pub(crate) fn put_bytes(&self, offset: usize, src: &[u8]) {
        assert!(offset + src.len() <= self.capacity);
        // SAFETY: bounds checked above; the range belongs to a reservation
        // held by the caller.
        unsafe {
            std::ptr::copy_nonoverlapping(src.as_ptr(), self.base().add(offset), src.len());
        }
    }

    pub fn frame_type(&self, offset: usize) -> u16 {
        u16::from_le_bytes([
            self.byte(offset + TYPE_OFFSET),
            self.byte(offset + TYPE_OFFSET + 1),
        ])
    }

    pub fn stream_id(&self, offset: usize) -> i32 {
        let mut raw = [0u8; 4];
        raw.copy_from_slice(self.bytes(offset + STREAM_ID_OFFSET, 4));
        i32::from_le_bytes(raw)
    }

    fn byte(&self, offset: usize) -> u8 {
        self.bytes(offset, 1)[0]
    }

    /// Read-only view of committed bytes.
    pub fn bytes(&self, offset: usize, length: usize) -> &[u8] {
        assert!(offset + length <= self.capacity);
        // SAFETY: bounds checked; callers only read frames they observed
        // committed, which are immutable until the partition is cleaned.
        unsafe { std::slice::from_raw_parts(self.base().add(offset), length) }
    }

    /// Writable view of a reserved range.
    ///
    /// # Safety
    /// The caller must hold the reservation covering the range and must not
    /// create another view of it.
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn bytes_mut(&self, offset: usize, length: usize) -> &mut [u8] {
        assert!(offset + length <= self.capacity);
        std::slice::from_raw_parts_mut(self.base().add(offset), length)
    }

    /// Zero the partition and re-arm it for `next_partition_id`.
    pub(crate) fn clean(&self, next_partition_id: i32) {
        // SAFETY: only called once every subscriber has left this partition
        // and the publisher limit keeps writers out.
        unsafe {
            std::ptr::write_bytes(self.base(), 0, self.capacity);
        }
        self.tail.store(0, Ordering::Release);
        self.partition_id.store(next_partition_id, Ordering::Release);
    }
}

/// The ring of partitions plus the active partition id.
pub struct LogBuffer {
    partitions: Box<[LogBufferPartition]>,
    partition_size: usize,
    initial_partition_id: i32,
    active_partition_id: AtomicI32,
}

impl LogBuffer {
    /// Allocate `partition_count` partitions of `partition_size` bytes.
    ///
    /// `partition_size` must be a multiple of the frame alignment.
    pub fn new(partition_count: usize, partition_size: usize, initial_partition_id: i32) -> Self {
        let partitions = (0..partition_count)
            .map(|slot| LogBufferPartition::new(partition_size, initial_partition_id + slot as i32))
            .collect();
        Self {
            partitions,
            partition_size,
            initial_partition_id,
            active_partition_id: AtomicI32::new(initial_partition_id),
        }
    }

    pub fn partition_size(&self) -> usize {
        self.partition_size
    }

    pub fn partition_count(&self) -> usize {
        self.partitions.len()
    }

    pub fn initial_partition_id(&self) -> i32 {
        self.initial_partition_id
    }

    pub fn active_partition_id_volatile(&self) -> i32 {
        self.active_partition_id.load(Ordering::Acquire)
    }

    /// Physical partition backing `partition_id`.
    pub fn partition(&self, partition_id: i32) -> &LogBufferPartition {
        let index = (partition_id - self.initial_partition_id) as usize % self.partitions.len();
        &self.partitions[index]
    }

    /// Roll the active partition after `filled_partition_id` ran out of space.
    ///
    /// Only the first caller for a given id moves the active partition.
    pub fn on_active_partition_filled(&self, filled_partition_id: i32) -> bool {
        self.active_partition_id
            .compare_exchange(
                filled_partition_id,
                filled_partition_id + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Largest offset a new frame may end at while still leaving room for a
    /// trailing padding header.
    pub(crate) fn max_frame_end(&self) -> usize {
        self.partition_size - HEADER_LENGTH
    }
}
