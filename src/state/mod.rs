//! Keyed transactional state.
//!
//! The durable side effect of stream processing. One [`Db`] is owned by the
//! stream processor of a partition; every record is processed inside one
//! [`Transaction`] that either commits all of its writes or none.
//!
//! Keys are namespaced by [`ColumnFamily`]. Numeric key parts are encoded so
//! that byte order equals numeric order, which keeps prefix scans and
//! iteration deterministic.

mod db;
mod key_generator;
pub mod migration;
mod snapshot;

pub use db::{Db, Transaction};
pub use key_generator::{KeyGenerator, LastProcessedPosition};
pub use snapshot::{recover_snapshot, write_snapshot};

/// Result type for state operations.
pub type Result<T> = std::result::Result<T, StateError>;

/// Errors that can occur during state operations.
#[derive(Debug, thiserror::Error)]
pub enum StateError {
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Corrupt snapshot: {0}")]
    CorruptSnapshot(String),
}

/// Key namespaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum ColumnFamily {
    Default = 0,
    ElementInstanceKey = 1,
    ElementInstanceChildParent = 2,
    ProcessCacheByKey = 3,
    ProcessLatestVersion = 4,
    ProcessCacheByIdAndVersion = 5,
    Variables = 6,
    Migrations = 7,
}

impl ColumnFamily {
    pub(crate) fn prefix(&self) -> u8 {
        *self as u8
    }
}

/// Order-preserving encoding of an `i64` key part.
pub fn long_key(value: i64) -> [u8; 8] {
    ((value as u64) ^ (1 << 63)).to_be_bytes()
}

/// Decode a key part produced by [`long_key`].
pub fn read_long_key(bytes: &[u8]) -> Option<i64> {
    let raw: [u8; 8] = bytes.get(..8)?.try_into().ok()?;
    Some((u64::from_be_bytes(raw) ^ (1 << 63)) as i64)
}

/// Two `i64` parts, ordered by the first, then the second.
pub fn composite_long_key(first: i64, second: i64) -> [u8; 16] {
    let mut key = [0u8; 16];
    key[..8].copy_from_slice(&long_key(first));
    key[8..].copy_from_slice(&long_key(second));
    key
}

/// An `i64` part followed by a string part.
pub fn long_string_key(first: i64, second: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(8 + second.len());
    key.extend_from_slice(&long_key(first));
    key.extend_from_slice(second.as_bytes());
    key
}
