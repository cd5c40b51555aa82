use anyhow::{bail, Context, Result};
use std::fs::{rename, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::format::{encode_record, ValueLayout};

/// Returns `<path>.tmp`.
pub fn tmp_path_for(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

/// Append-only writer for a curly value log.
///
/// Records must arrive in strictly ascending key-hash order, so that record
/// `j` of the value log lines up with record `j` of the index written next
/// to it. [`append`](CurlyWriter::append) returns the offset the record was
/// written at, which is the pointer the index stores for it.
///
/// Writes go to `<path>.tmp`; [`finish`](CurlyWriter::finish) fsyncs and
/// atomically renames.
pub struct CurlyWriter {
    path: PathBuf,
    tmp_path: PathBuf,
    file: BufWriter<File>,
    layout: ValueLayout,
    buf: Vec<u8>,
    last_key: Option<Vec<u8>>,
    position: u64,
    records: u64,
}

impl CurlyWriter {
    pub fn create(path: &Path, layout: ValueLayout) -> Result<Self> {
        layout.validate()?;
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
            buf: Vec::with_capacity(256),
            last_key: None,
            position: 0,
            records: 0,
        })
    }

    /// Appends a value (`Some`) or a tombstone (`None`) and returns the byte
    /// offset of the record.
    pub fn append(&mut self, key_hash: &[u8], value: Option<&[u8]>) -> Result<u64> {
        if let Some(last) = &self.last_key {
            if key_hash <= last.as_slice() {
                bail!("records must be appended in strictly ascending key-hash order");
            }
        }

        self.buf.clear();
        encode_record(&self.layout, key_hash, value, &mut self.buf)?;
        self.file.write_all(&self.buf)?;

        let offset = self.position;
        self.position += self.buf.len() as u64;
        self.records += 1;
        self.last_key = Some(key_hash.to_vec());
        Ok(offset)
    }

    /// Bytes written so far; also the offset the next record will get.
    #[must_use]
    pub fn position(&self) -> u64 {
        self.position
    }

    #[must_use]
    pub fn len(&self) -> u64 {
        self.records
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records == 0
    }

    /// Fsyncs and renames the temp file into place. Returns the file size.
    pub fn finish(mut self) -> Result<u64> {
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
        if let Some(parent) = self.path.parent() {
            if let Ok(dir) = File::open(parent) {
                let _ = dir.sync_all();
            }
        }
        Ok(self.position)
    }

    /// Discards the partially written temp file.
    pub fn abort(self) {
        let tmp_path = self.tmp_path.clone();
        drop(self);
        let _ = std::fs::remove_file(tmp_path);
    }
}
