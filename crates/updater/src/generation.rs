use anyhow::{ensure, Result};
use config::{CompressionCodec, PartitionConfig};
use cueball::{CueballWriter, RecordLayout};
use curly::{CurlyWriter, ValueLayout};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::layout::{FileKind, LogFile, LogKind};

/// The two files written for one version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilePair {
    pub index: PathBuf,
    pub value: PathBuf,
}

/// Writes a matching index and value log for one version.
///
/// Record `j` of the index points at record `j` of the value log and carries
/// the same key hash. Entries must be sorted by key hash; in a delta `None`
/// is a tombstone. Bases use the configured
/// compression codec, deltas are always written uncompressed.
#[derive(Debug, Clone)]
pub struct GenerationWriter {
    dir: PathBuf,
    value_layout: ValueLayout,
    index_layout: RecordLayout,
    hash_index_bits: u8,
    codec: CompressionCodec,
}

impl GenerationWriter {
    /// Writes into `dir` (which need not be the config's local root, so the
    /// same writer can stock a remote directory).
    pub fn new<P: Into<PathBuf>>(dir: P, config: &PartitionConfig) -> Self {
        Self {
            dir: dir.into(),
            value_layout: ValueLayout::from_config(config),
            index_layout: RecordLayout::from_config(config),
            hash_index_bits: config.hash_index_bits,
            codec: config.compression_codec,
        }
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn write_base<K, V>(&self, version: u64, entries: &[(K, V)]) -> Result<FilePair>
    where
        K: AsRef<[u8]>,
        V: AsRef<[u8]>,
    {
        self.write(
            FileKind::Base,
            version,
            entries.iter().map(|(k, v)| (k.as_ref(), Some(v.as_ref()))),
        )
    }

    pub fn write_delta<K, V>(&self, version: u64, entries: &[(K, Option<V>)]) -> Result<FilePair>
    where
        K: AsRef<[u8]>,
        V: AsRef<[u8]>,
    {
        self.write(
            FileKind::Delta,
            version,
            entries.iter().map(|(k, v)| (k.as_ref(), v.as_ref().map(AsRef::as_ref))),
        )
    }

    fn write<'a, I>(&self, kind: FileKind, version: u64, entries: I) -> Result<FilePair>
    where
        I: Iterator<Item = (&'a [u8], Option<&'a [u8]>)>,
    {
        let index_path = LogFile { version, kind, log: LogKind::Index }.path_in(&self.dir)?;
        let value_path = LogFile { version, kind, log: LogKind::Value }.path_in(&self.dir)?;
        let codec = match kind {
            FileKind::Base => self.codec,
            FileKind::Delta => CompressionCodec::None,
        };

        fs::create_dir_all(&self.dir)?;
        let mut values = CurlyWriter::create(&value_path, self.value_layout)?;
        let mut index = match CueballWriter::create(&index_path, self.index_layout, self.hash_index_bits, codec) {
            Ok(w) => w,
            Err(e) => {
                values.abort();
                return Err(e);
            }
        };

        let tombstone = self.index_layout.tombstone();
        let appended = entries.into_iter().try_for_each(|(key_hash, value)| -> Result<()> {
            let offset = values.append(key_hash, value)?;
            match value {
                Some(_) => {
                    ensure!(
                        offset < tombstone,
                        "value log offset {} does not fit {}-byte pointers",
                        offset,
                        self.index_layout.offset_size
                    );
                    index.append_entry(key_hash, offset)
                }
                None => index.append_tombstone(key_hash),
            }
        });
        if let Err(e) = appended {
            index.abort();
            values.abort();
            return Err(e);
        }

        let records = values.len();
        if let Err(e) = index.finish() {
            values.abort();
            return Err(e);
        }
        let bytes = values.finish()?;
        debug!(version, kind = kind.as_str(), records, bytes, "wrote generation files");

        Ok(FilePair {
            index: index_path,
            value: value_path,
        })
    }
}
