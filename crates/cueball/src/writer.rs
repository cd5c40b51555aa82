use anyhow::{bail, Context, Result};
use byteorder::{LittleEndian, WriteBytesExt};
use config::CompressionCodec;
use std::fs::{rename, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::format::{
    bucket_count, bucket_of, encode_pointer, write_footer, Footer, RecordLayout, EMPTY_BUCKET,
};

/// Returns `<path>.tmp`, the scratch name a file is written under before it
/// is renamed into place.
pub fn tmp_path_for(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

/// Streaming writer for a cueball index file.
///
/// Records must be appended in strictly ascending key-hash order. Records are
/// grouped into one block per bucket; a block is flushed (and compressed, if a
/// codec is configured) as soon as the first record of a later bucket arrives,
/// so memory stays bounded by the largest bucket.
///
/// # Crash Safety
///
/// Everything is written to `<path>.tmp`. [`finish`](CueballWriter::finish)
/// fsyncs it and atomically renames it to `path`; a crash before that leaves
/// only the temp file, which recovery removes.
pub struct CueballWriter {
    path: PathBuf,
    tmp_path: PathBuf,
    file: BufWriter<File>,
    layout: RecordLayout,
    hash_index_bits: u8,
    codec: CompressionCodec,
    /// Block start offset per bucket, filled in as blocks are flushed.
    buckets: Vec<u64>,
    current_bucket: usize,
    /// Raw records of the current bucket.
    block: Vec<u8>,
    last_key: Option<Vec<u8>>,
    record_count: u64,
    /// Bytes written so far (tracked by hand to avoid seeking the BufWriter).
    position: u64,
}

impl CueballWriter {
    /// Creates `<path>.tmp` and prepares to write records with `layout`.
    pub fn create(
        path: &Path,
        layout: RecordLayout,
        hash_index_bits: u8,
        codec: CompressionCodec,
    ) -> Result<Self> {
        layout.validate()?;
        if hash_index_bits > config::MAX_HASH_INDEX_BITS
            || hash_index_bits as usize > 8 * layout.key_hash_size
        {
            bail!("hash_index_bits {} out of range", hash_index_bits);
        }

        let tmp_path = tmp_path_for(path);
        let raw = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp_path)
            .with_context(|| format!("failed to create {}", tmp_path.display()))?;

        Ok(Self {
            path: path.to_path_buf(),
            tmp_path,
            file: BufWriter::new(raw),
            layout,
            hash_index_bits,
            codec,
            buckets: vec![EMPTY_BUCKET; bucket_count(hash_index_bits)],
            current_bucket: 0,
            block: Vec::with_capacity(4096),
            last_key: None,
            record_count: 0,
            position: 0,
        })
    }

    /// Appends a complete fixed-width record (`key_hash || pointer`).
    pub fn append(&mut self, record: &[u8]) -> Result<()> {
        if record.len() != self.layout.record_size() {
            bail!(
                "record is {} bytes, expected {}",
                record.len(),
                self.layout.record_size()
            );
        }
        let key = self.layout.key_hash(record);
        if let Some(last) = &self.last_key {
            if key <= last.as_slice() {
                bail!("records must be appended in strictly ascending key-hash order");
            }
        }

        let bucket = bucket_of(key, self.hash_index_bits);
        if bucket != self.current_bucket {
            self.flush_block()?;
            self.current_bucket = bucket;
        }

        self.block.extend_from_slice(record);
        match &mut self.last_key {
            Some(last) => {
                last.clear();
                last.extend_from_slice(key);
            }
            None => self.last_key = Some(key.to_vec()),
        }
        self.record_count += 1;
        Ok(())
    }

    /// Appends a record built from its parts.
    pub fn append_entry(&mut self, key_hash: &[u8], pointer: u64) -> Result<()> {
        if key_hash.len() != self.layout.key_hash_size {
            bail!(
                "key hash is {} bytes, expected {}",
                key_hash.len(),
                self.layout.key_hash_size
            );
        }
        let mut record = vec![0u8; self.layout.record_size()];
        record[..self.layout.key_hash_size].copy_from_slice(key_hash);
        encode_pointer(
            pointer,
            &mut record[self.layout.pointer_offset()..],
            self.layout.offset_size,
        )?;
        self.append(&record)
    }

    /// Appends a delta tombstone for `key_hash`.
    pub fn append_tombstone(&mut self, key_hash: &[u8]) -> Result<()> {
        let tombstone = self.layout.tombstone();
        self.append_entry(key_hash, tombstone)
    }

    /// Number of records appended so far.
    #[must_use]
    pub fn len(&self) -> u64 {
        self.record_count
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.record_count == 0
    }

    fn flush_block(&mut self) -> Result<()> {
        if self.block.is_empty() {
            return Ok(());
        }
        self.buckets[self.current_bucket] = self.position;
        match self.codec {
            CompressionCodec::None => {
                self.file.write_all(&self.block)?;
                self.position += self.block.len() as u64;
            }
            CompressionCodec::Lz4 => {
                let compressed = lz4_flex::compress_prepend_size(&self.block);
                self.file.write_u32::<LittleEndian>(compressed.len() as u32)?;
                self.file.write_all(&compressed)?;
                self.position += 4 + compressed.len() as u64;
            }
        }
        self.block.clear();
        Ok(())
    }

    /// Writes the bucket table and footer, fsyncs, and renames the temp file
    /// to its final path. Returns the number of records written.
    pub fn finish(mut self) -> Result<u64> {
        self.flush_block()?;

        let buckets_offset = self.position;
        for offset in &self.buckets {
            self.file.write_u64::<LittleEndian>(*offset)?;
        }
        write_footer(
            &mut self.file,
            &Footer {
                record_count: self.record_count,
                buckets_offset,
                layout: self.layout,
                hash_index_bits: self.hash_index_bits,
                codec: self.codec,
            },
        )?;

        self.file.flush()?;
        self.file
            .into_inner()
            .map_err(|e| e.into_error())?
            .sync_all()?;

        rename(&self.tmp_path, &self.path).with_context(|| {
            format!(
                "failed to rename {} to {}",
                self.tmp_path.display(),
                self.path.display()
            )
        })?;

        // A crash after rename but before the directory entry is durable can
        // lose the file on ext4/XFS.
        if let Some(parent) = self.path.parent() {
            if let Ok(dir) = File::open(parent) {
                let _ = dir.sync_all();
            }
        }

        Ok(self.record_count)
    }

    /// Discards the partially written temp file.
    pub fn abort(self) {
        let tmp_path = self.tmp_path.clone();
        drop(self);
        let _ = std::fs::remove_file(tmp_path);
    }
}
