//! In-memory transactional key/value store.

use std::collections::BTreeMap;
use std::ops::Bound;

use serde::de::DeserializeOwned;
use serde::Serialize;
use sha2::{Digest, Sha256};

use super::{ColumnFamily, Result};

fn full_key(cf: ColumnFamily, key: &[u8]) -> Vec<u8> {
    let mut full = Vec::with_capacity(key.len() + 1);
    full.push(cf.prefix());
    full.extend_from_slice(key);
    full
}

/// Committed state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Db {
    entries: BTreeMap<Vec<u8>, Vec<u8>>,
}

impl Db {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn from_entries(entries: BTreeMap<Vec<u8>, Vec<u8>>) -> Self {
        Self { entries }
    }

    /// Open a transaction. Writes become visible to `Db` readers on commit.
    pub fn transaction(&mut self) -> Transaction<'_> {
        Transaction {
            db: self,
            pending: BTreeMap::new(),
        }
    }

    pub fn get(&self, cf: ColumnFamily, key: &[u8]) -> Option<&[u8]> {
        self.entries.get(&full_key(cf, key)).map(Vec::as_slice)
    }

    pub fn get_value<T: DeserializeOwned>(&self, cf: ColumnFamily, key: &[u8]) -> Result<Option<T>> {
        self.get(cf, key)
            .map(|bytes| serde_json::from_slice(bytes))
            .transpose()
            .map_err(Into::into)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// All entries in key order, column family prefix included.
    pub fn entries(&self) -> impl Iterator<Item = (&[u8], &[u8])> {
        self.entries
            .iter()
            .map(|(k, v)| (k.as_slice(), v.as_slice()))
    }

    /// Hex SHA-256 over all entries in key order.
    pub fn checksum(&self) -> String {
        let mut hasher = Sha256::new();
        for (key, value) in &self.entries {
            hasher.update((key.len() as u32).to_be_bytes());
            hasher.update(key);
            hasher.update((value.len() as u32).to_be_bytes());
            hasher.update(value);
        }
        hex::encode(hasher.finalize())
    }
}

/// Pending writes over a [`Db`].
///
/// Reads see the transaction's own writes. Dropping without `commit`
/// discards them.
pub struct Transaction<'a> {
    db: &'a mut Db,
    pending: BTreeMap<Vec<u8>, Option<Vec<u8>>>,
}

impl Transaction<'_> {
    pub fn get(&self, cf: ColumnFamily, key: &[u8]) -> Option<&[u8]> {
        let full = full_key(cf, key);
        match self.pending.get(&full) {
            Some(Some(value)) => Some(value.as_slice()),
            Some(None) => None,
            None => self.db.entries.get(&full).map(Vec::as_slice),
        }
    }

    pub fn exists(&self, cf: ColumnFamily, key: &[u8]) -> bool {
        self.get(cf, key).is_some()
    }

    pub fn put(&mut self, cf: ColumnFamily, key: &[u8], value: Vec<u8>) {
        self.pending.insert(full_key(cf, key), Some(value));
    }

    pub fn delete(&mut self, cf: ColumnFamily, key: &[u8]) {
        self.pending.insert(full_key(cf, key), None);
    }

    pub fn get_value<T: DeserializeOwned>(&self, cf: ColumnFamily, key: &[u8]) -> Result<Option<T>> {
        self.get(cf, key)
            .map(|bytes| serde_json::from_slice(bytes))
            .transpose()
            .map_err(Into::into)
    }

    pub fn put_value<T: Serialize>(&mut self, cf: ColumnFamily, key: &[u8], value: &T) -> Result<()> {
        let bytes = serde_json::to_vec(value)?;
        self.put(cf, key, bytes);
        Ok(())
    }

    /// Entries of `cf` whose key starts with `prefix`, in key order.
    ///
    /// Returned keys exclude the column family byte.
    pub fn prefix_scan(&self, cf: ColumnFamily, prefix: &[u8]) -> Vec<(Vec<u8>, Vec<u8>)> {
        let start = full_key(cf, prefix);
        let in_range = |key: &Vec<u8>| key.starts_with(&start);

        let mut merged: BTreeMap<Vec<u8>, Vec<u8>> = self
            .db
            .entries
            .range::<Vec<u8>, _>((Bound::Included(&start), Bound::Unbounded))
            .take_while(|(k, _)| in_range(k))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        for (key, value) in self
            .pending
            .range::<Vec<u8>, _>((Bound::Included(&start), Bound::Unbounded))
            .take_while(|(k, _)| in_range(k))
        {
            match value {
                Some(value) => {
                    merged.insert(key.clone(), value.clone());
                }
                None => {
                    merged.remove(key);
                }
            }
        }

        merged
            .into_iter()
            .map(|(mut k, v)| {
                k.remove(0);
                (k, v)
            })
            .collect()
    }

    /// Number of pending writes.
    pub fn pending_writes(&self) -> usize {
        self.pending.len()
    }

    /// Apply all pending writes.
    pub fn commit(self) {
        let Transaction { db, pending } = self;
        for (key, value) in pending {
            match value {
                Some(value) => {
                    db.entries.insert(key, value);
                }
                None => {
                    db.entries.remove(&key);
                }
            }
        }
    }

    /// Discard all pending writes.
    pub fn rollback(self) {}
}
