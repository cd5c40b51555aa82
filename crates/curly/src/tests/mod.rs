mod format_tests;
mod reader_tests;

use crate::*;
use anyhow::Result;
use std::path::{Path, PathBuf};

pub(crate) const LAYOUT: ValueLayout = ValueLayout {
    key_hash_size: 4,
    value_length_size: 2,
};

/// Builds a 4-byte key hash from a number, big-endian so numeric order is
/// byte order.
pub(crate) fn kh(n: u32) -> [u8; 4] {
    n.to_be_bytes()
}

/// Writes a value log from `(key, value)` pairs; `None` writes a tombstone.
/// Returns the path and the offset of every record.
pub(crate) fn write_log(
    dir: &Path,
    name: &str,
    entries: &[(u32, Option<&str>)],
) -> Result<(PathBuf, Vec<u64>)> {
    let path = dir.join(name);
    let mut w = CurlyWriter::create(&path, LAYOUT)?;
    let mut offsets = Vec::with_capacity(entries.len());
    for &(key, value) in entries {
        offsets.push(w.append(&kh(key), value.map(str::as_bytes))?);
    }
    w.finish()?;
    Ok((path, offsets))
}

/// Reads a value log back as `(offset, key, value)` triples.
pub(crate) fn read_all(path: &Path) -> Result<Vec<(u64, u32, Option<String>)>> {
    let mut out = Vec::new();
    for located in CurlyIter::open(path, LAYOUT)? {
        let located = located?;
        let mut key = [0u8; 4];
        key.copy_from_slice(&located.record.key_hash);
        let value = located
            .record
            .value
            .map(|v| String::from_utf8_lossy(&v).into_owned());
        out.push((located.offset, u32::from_be_bytes(key), value));
    }
    Ok(out)
}
