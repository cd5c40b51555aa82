
use crate::*;
use anyhow::Result;
use config::CompressionCodec;
use std::path::{Path, PathBuf};

pub(crate) const LAYOUT: RecordLayout = RecordLayout {
    key_hash_size: 4,
    offset_size: 3,
};

/// Builds a 4-byte key hash from a number, big-endian so numeric order is
/// byte order.
pub(crate) fn kh(n: u32) -> [u8; 4] {
    n.to_be_bytes()
}

/// Writes an index file from `(key, pointer)` pairs; `None` writes a tombstone.
pub(crate) fn write_index(
    dir: &Path,
    name: &str,
    bits: u8,
    codec: CompressionCodec,
    entries: &[(u32, Option<u64>)],
) -> Result<PathBuf> {
    let path = dir.join(name);
    let mut w = CueballWriter::create(&path, LAYOUT, bits, codec)?;
    for &(key, pointer) in entries {
        match pointer {
            Some(p) => w.append_entry(&kh(key), p)?,
            None => w.append_tombstone(&kh(key))?,
        }
    }
    w.finish()?;
    Ok(path)
}

/// Reads an index back as `(key, pointer)` pairs.
pub(crate) fn read_all(path: &Path) -> Result<Vec<(u32, u64)>> {
    let reader = CueballReader::open(path)?;
    let layout = reader.layout();
    let mut out = Vec::new();
    for record in reader.records() {
        let record = record?;
        let mut key = [0u8; 4];
        key.copy_from_slice(layout.key_hash(&record));
        out.push((u32::from_be_bytes(key), layout.pointer(&record)));
    }
    Ok(out)
}
