//! Key generation and processing progress.

use super::{ColumnFamily, Result, Transaction};

const NEXT_KEY: &[u8] = b"nextKey";
const LAST_PROCESSED_POSITION: &[u8] = b"lastProcessedPosition";

/// Bits of a key reserved for the per-partition counter.
pub const KEY_BITS: u32 = 51;

/// Keys unique across partitions: the partition id in the high bits, a
/// persisted counter in the low 51 bits.
#[derive(Debug, Clone, Copy)]
pub struct KeyGenerator {
    partition_id: i32,
}

impl KeyGenerator {
    pub fn new(partition_id: i32) -> Self {
        Self { partition_id }
    }

    pub fn partition_id(&self) -> i32 {
        self.partition_id
    }

    fn start_key(&self) -> i64 {
        ((self.partition_id as i64) << KEY_BITS) + 1
    }

    /// Allocate the next key.
    pub fn next_key(&self, tx: &mut Transaction<'_>) -> Result<i64> {
        let key = tx
            .get_value::<i64>(ColumnFamily::Default, NEXT_KEY)?
            .unwrap_or_else(|| self.start_key());
        tx.put_value(ColumnFamily::Default, NEXT_KEY, &(key + 1))?;
        Ok(key)
    }

    /// Make sure keys seen during replay are never handed out again.
    pub fn observe(&self, tx: &mut Transaction<'_>, key: i64) -> Result<()> {
        if key < 0 || (key >> KEY_BITS) as i32 != self.partition_id {
            return Ok(());
        }
        let next = tx
            .get_value::<i64>(ColumnFamily::Default, NEXT_KEY)?
            .unwrap_or_else(|| self.start_key());
        if key >= next {
            tx.put_value(ColumnFamily::Default, NEXT_KEY, &(key + 1))?;
        }
        Ok(())
    }
}

/// Position of the last command whose processing committed.
pub struct LastProcessedPosition;

impl LastProcessedPosition {
    pub fn get(tx: &Transaction<'_>) -> Result<Option<i64>> {
        tx.get_value(ColumnFamily::Default, LAST_PROCESSED_POSITION)
    }

    pub fn set(tx: &mut Transaction<'_>, position: i64) -> Result<()> {
        tx.put_value(ColumnFamily::Default, LAST_PROCESSED_POSITION, &position)
    }
}
