use anyhow::{anyhow, ensure, Result};
use config::PartitionConfig;
use cueball::{CueballReader, RecordLayout};
use curly::{CurlyReader, ValueLayout};
use std::path::{Path, PathBuf};

use crate::layout::{Generation, PartitionFiles};

/// Point lookups against a partition's current generation.
///
/// Opens the generation [`PartitionFiles::current_generation`] discovers:
/// a bucket select and binary search in the index, then one read in the
/// value log. Deltas newer than the generation are not consulted.
pub struct PartitionReader {
    root: PathBuf,
    generation: Generation,
    index: CueballReader,
    values: CurlyReader,
}

impl PartitionReader {
    /// Opens the partition under the config's local root.
    pub fn open(config: &PartitionConfig) -> Result<Self> {
        Self::open_dir(&config.local_partition_root, config)
    }

    /// Opens the partition in `root`, checking the index footer against the
    /// config's record layout.
    pub fn open_dir(root: &Path, config: &PartitionConfig) -> Result<Self> {
        let generation = PartitionFiles::scan(root)?
            .current_generation()
            .ok_or_else(|| anyhow!("no servable generation in {}", root.display()))?;
        let index = CueballReader::open_with_layout(
            generation.index_path(root)?,
            RecordLayout::from_config(config),
        )?;
        let values = CurlyReader::open(generation.value_path(root)?, ValueLayout::from_config(config))?;
        Ok(Self {
            root: root.to_path_buf(),
            generation,
            index,
            values,
        })
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[must_use]
    pub fn version(&self) -> u64 {
        self.generation.version
    }

    #[must_use]
    pub fn generation(&self) -> Generation {
        self.generation
    }

    /// Number of keys in the generation.
    #[must_use]
    pub fn len(&self) -> usize {
        self.index.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Returns the value stored for `key_hash`.
    ///
    /// # Errors
    ///
    /// Fails if the index points at a record for another key, which means
    /// the two files of the generation disagree.
    pub fn get(&self, key_hash: &[u8]) -> Result<Option<Vec<u8>>> {
        let pointer = match self.index.get(key_hash)? {
            Some(p) if p != self.index.layout().tombstone() => p,
            _ => return Ok(None),
        };
        let record = self.values.read_at(pointer)?;
        ensure!(
            record.key_hash == key_hash,
            "index entry for {:02x?} points at offset {} which holds {:02x?}",
            key_hash,
            pointer,
            record.key_hash
        );
        Ok(record.value)
    }
}
