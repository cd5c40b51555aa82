mod fetch_tests;

use crate::*;
use anyhow::{anyhow, ensure, Result};
use config::PartitionConfig;
use cueball::CueballReader;
use curly::{CurlyReader, ValueLayout};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use tempfile::{tempdir, TempDir};

/// Builds a 4-byte key hash from a number, big-endian so numeric order is
/// byte order.
pub(crate) fn kh(n: u32) -> [u8; 4] {
    n.to_be_bytes()
}

/// A local partition directory and a remote directory to fetch from.
pub(crate) struct Fixture {
    pub dir: TempDir,
    pub config: PartitionConfig,
}

impl Fixture {
    pub fn new() -> Result<Self> {
        let dir = tempdir()?;
        let remote = dir.path().join("remote");
        fs::create_dir_all(&remote)?;
        let config = PartitionConfig::new(dir.path().join("local"))
            .with_remote_root(remote)
            .with_key_hash_size(4)
            .with_offset_size(4)
            .with_hash_index_bits(4)
            .with_value_length_size(2);
        Ok(Self { dir, config })
    }

    pub fn local(&self) -> &Path {
        &self.config.local_partition_root
    }

    pub fn remote(&self) -> &Path {
        self.config
            .remote_partition_root
            .as_deref()
            .unwrap_or_else(|| self.dir.path())
    }

    pub fn remote_writer(&self) -> GenerationWriter {
        GenerationWriter::new(self.remote(), &self.config)
    }

    pub fn local_writer(&self) -> GenerationWriter {
        GenerationWriter::new(self.local(), &self.config)
    }

    pub fn updater(&self) -> Result<PartitionUpdater<LocalFileSource>> {
        Ok(PartitionUpdater::new(
            self.config.clone(),
            LocalFileSource::new(self.remote(), self.local()),
        )?)
    }

    /// Writes a base pair for `version` into the remote directory.
    pub fn remote_base(&self, version: u64, entries: &[(u32, &str)]) -> Result<FilePair> {
        self.remote_writer().write_base(version, &base_entries(entries))
    }

    /// Writes a delta pair for `version` into the remote directory.
    pub fn remote_delta(&self, version: u64, entries: &[(u32, Option<&str>)]) -> Result<FilePair> {
        self.remote_writer().write_delta(version, &delta_entries(entries))
    }
}

pub(crate) fn base_entries(entries: &[(u32, &str)]) -> Vec<([u8; 4], Vec<u8>)> {
    entries
        .iter()
        .map(|(k, v)| (kh(*k), v.as_bytes().to_vec()))
        .collect()
}

pub(crate) fn delta_entries(entries: &[(u32, Option<&str>)]) -> Vec<([u8; 4], Option<Vec<u8>>)> {
    entries
        .iter()
        .map(|(k, v)| (kh(*k), v.map(|v| v.as_bytes().to_vec())))
        .collect()
}

/// File names in `dir`, sorted, without the lock file.
pub(crate) fn names(dir: &Path) -> Result<Vec<String>> {
    let mut out = Vec::new();
    if !dir.exists() {
        return Ok(out);
    }
    for entry in fs::read_dir(dir)? {
        let name = entry?.file_name().to_string_lossy().into_owned();
        if name != layout::LOCK_FILE {
            out.push(name);
        }
    }
    out.sort();
    Ok(out)
}

/// Reads the whole current generation, checking that index record `j`
/// points at value record `j` and that both carry the same key.
pub(crate) fn dump(config: &PartitionConfig) -> Result<BTreeMap<u32, String>> {
    let root = config.local_partition_root.as_path();
    let generation = PartitionFiles::scan(root)?
        .current_generation()
        .ok_or_else(|| anyhow!("no generation in {}", root.display()))?;
    let index = CueballReader::open(generation.index_path(root)?)?;
    let values = CurlyReader::open(generation.value_path(root)?, ValueLayout::from_config(config))?;
    let layout = index.layout();

    let mut out = BTreeMap::new();
    let mut value_records = values.iter()?;
    for record in index.records() {
        let record = record?;
        let located = value_records
            .next()
            .ok_or_else(|| anyhow!("value log is shorter than the index"))??;
        ensure!(located.offset == layout.pointer(&record), "record pairing broken");
        ensure!(located.record.key_hash == layout.key_hash(&record), "key mismatch");
        let value = located
            .record
            .value
            .ok_or_else(|| anyhow!("tombstone in a base"))?;
        let mut key = [0u8; 4];
        key.copy_from_slice(layout.key_hash(&record));
        out.insert(u32::from_be_bytes(key), String::from_utf8(value)?);
    }
    ensure!(value_records.next().is_none(), "value log is longer than the index");
    Ok(out)
}

pub(crate) fn map(entries: &[(u32, &str)]) -> BTreeMap<u32, String> {
    entries.iter().map(|(k, v)| (*k, v.to_string())).collect()
}
