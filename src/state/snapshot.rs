//! State snapshots.
//!
//! Layout: magic, format version, entry count, then length-prefixed key and
//! value pairs, followed by a SHA-256 over everything before it.

use std::collections::BTreeMap;
use std::path::Path;

use bytes::{Buf, BufMut, BytesMut};
use sha2::{Digest, Sha256};
use tracing::info;

use super::{Db, Result, StateError};

const MAGIC: &[u8; 8] = b"KEELSNAP";
const FORMAT_VERSION: u32 = 1;
const CHECKSUM_LENGTH: usize = 32;

/// Write `db` to `path`, replacing any existing snapshot atomically.
pub fn write_snapshot(db: &Db, path: &Path) -> Result<()> {
    let mut buf = BytesMut::new();
    buf.put_slice(MAGIC);
    buf.put_u32(FORMAT_VERSION);
    buf.put_u64(db.len() as u64);
    for (key, value) in db.entries() {
        buf.put_u32(key.len() as u32);
        buf.put_slice(key);
        buf.put_u32(value.len() as u32);
        buf.put_slice(value);
    }
    let checksum = Sha256::digest(&buf);
    buf.put_slice(&checksum);

    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, &buf)?;
    std::fs::rename(&tmp, path)?;

    info!(
        path = %path.display(),
        entries = db.len(),
        checksum = %hex::encode(checksum),
        "Snapshot written"
    );
    Ok(())
}

/// Read a snapshot written by [`write_snapshot`].
pub fn recover_snapshot(path: &Path) -> Result<Db> {
    let raw = std::fs::read(path)?;
    if raw.len() < MAGIC.len() + 4 + 8 + CHECKSUM_LENGTH {
        return Err(StateError::CorruptSnapshot(format!(
            "{} is too short",
            path.display()
        )));
    }

    let (content, checksum) = raw.split_at(raw.len() - CHECKSUM_LENGTH);
    if Sha256::digest(content).as_slice() != checksum {
        return Err(StateError::CorruptSnapshot(format!(
            "checksum mismatch in {}",
            path.display()
        )));
    }

    let mut buf = content;
    if &buf[..MAGIC.len()] != MAGIC {
        return Err(StateError::CorruptSnapshot("bad magic".to_string()));
    }
    buf.advance(MAGIC.len());

    let version = buf.get_u32();
    if version != FORMAT_VERSION {
        return Err(StateError::CorruptSnapshot(format!(
            "unsupported format version {version}"
        )));
    }

    let count = buf.get_u64();
    let mut entries = BTreeMap::new();
    for _ in 0..count {
        let key = read_chunk(&mut buf)?;
        let value = read_chunk(&mut buf)?;
        entries.insert(key, value);
    }

    info!(path = %path.display(), entries = entries.len(), "Snapshot recovered");
    Ok(Db::from_entries(entries))
}

fn read_chunk(buf: &mut &[u8]) -> Result<Vec<u8>> {
    if buf.remaining() < 4 {
        return Err(StateError::CorruptSnapshot("truncated length".to_string()));
    }
    let length = buf.get_u32() as usize;
    if buf.remaining() < length {
        return Err(StateError::CorruptSnapshot("truncated entry".to_string()));
    }
    let chunk = buf[..length].to_vec();
    buf.advance(length);
    Ok(chunk)
}
