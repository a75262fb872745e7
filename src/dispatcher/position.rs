//! Log positions.
//!
//! A position packs `(partition_id, partition_offset)` into one `i64`:
//! the partition id in the high 32 bits, the offset in the low 32 bits.
//! Positions are strictly increasing per log and never reused.

use std::sync::atomic::{AtomicI64, Ordering};

/// Encode a partition id and offset into a log position.
#[inline]
pub const fn position(partition_id: i32, partition_offset: i32) -> i64 {
    ((partition_id as i64) << 32) | (partition_offset as i64 & 0xFFFF_FFFF)
}

/// Partition id component of a position.
#[inline]
pub const fn partition_id(position: i64) -> i32 {
    (position >> 32) as i32
}

/// Offset component of a position.
#[inline]
pub const fn partition_offset(position: i64) -> i32 {
    (position & 0xFFFF_FFFF) as i32
}

/// An atomically updated position counter.
///
/// `propose_max_ordered` is the only way concurrent writers should move a
/// shared bound: it never regresses the stored value.
#[derive(Debug)]
pub struct AtomicPosition {
    value: AtomicI64,
}

impl AtomicPosition {
    pub const fn new(initial: i64) -> Self {
        Self {
            value: AtomicI64::new(initial),
        }
    }

    /// Plain read.
    #[inline]
    pub fn get(&self) -> i64 {
        self.value.load(Ordering::Relaxed)
    }

    /// Read with acquire ordering.
    #[inline]
    pub fn get_volatile(&self) -> i64 {
        self.value.load(Ordering::Acquire)
    }

    /// Store with release ordering.
    #[inline]
    pub fn set_ordered(&self, value: i64) {
        self.value.store(value, Ordering::Release);
    }

    /// Advance to `value` if it is greater than the current value.
    ///
    /// Returns `true` if this call moved the position.
    pub fn propose_max_ordered(&self, value: i64) -> bool {
        let mut current = self.value.load(Ordering::Acquire);
        while current < value {
            match self.value.compare_exchange_weak(
                current,
                value,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
        false
    }
}

impl Default for AtomicPosition {
    fn default() -> Self {
        Self::new(0)
    }
}
