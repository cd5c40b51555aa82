use anyhow::{anyhow, bail, Context, Result};
use byteorder::{ByteOrder, LittleEndian};
use crc32fast::Hasher as Crc32;
use std::fs::File;
use std::io::{self, BufReader, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::format::{ValueLayout, ValueRecord, KIND_TOMBSTONE, KIND_VALUE, MAX_VALUE_BYTES};

/// Fills `buf` completely, or returns `Ok(false)` if the reader was already
/// at EOF. A partial fill is an error.
fn read_exact_or_eof<R: Read>(r: &mut R, buf: &mut [u8]) -> Result<bool> {
    let mut filled = 0;
    while filled < buf.len() {
        match r.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    if filled == 0 {
        return Ok(false);
    }
    if filled < buf.len() {
        bail!("truncated value record header");
    }
    Ok(true)
}

/// Decodes one record, verifying its CRC. Returns the record and its encoded
/// length, or `None` at a clean end of file.
fn read_record<R: Read>(r: &mut R, layout: &ValueLayout) -> Result<Option<(ValueRecord, u64)>> {
    let mut crc_buf = [0u8; 4];
    if !read_exact_or_eof(r, &mut crc_buf)? {
        return Ok(None);
    }
    let stored_crc = u32::from_le_bytes(crc_buf);

    let mut body = vec![0u8; layout.key_hash_size + 1];
    r.read_exact(&mut body)
        .map_err(|e| anyhow!("truncated value record: {}", e))?;
    let kind = body[layout.key_hash_size];

    let value = match kind {
        KIND_VALUE => {
            let mut prefix = [0u8; 8];
            r.read_exact(&mut prefix[..layout.value_length_size])
                .map_err(|e| anyhow!("truncated value length: {}", e))?;
            let len = LittleEndian::read_uint(&prefix, layout.value_length_size);
            if len > MAX_VALUE_BYTES {
                bail!("corrupt value record: length {} exceeds maximum {}", len, MAX_VALUE_BYTES);
            }
            body.extend_from_slice(&prefix[..layout.value_length_size]);
            let mut payload = vec![0u8; len as usize];
            r.read_exact(&mut payload)
                .map_err(|e| anyhow!("truncated value payload: {}", e))?;
            body.extend_from_slice(&payload);
            Some(payload)
        }
        KIND_TOMBSTONE => None,
        other => bail!("corrupt value record: unknown kind {}", other),
    };

    let mut hasher = Crc32::new();
    hasher.update(&body);
    let actual_crc = hasher.finalize();
    if actual_crc != stored_crc {
        bail!(
            "CRC32 mismatch: expected {:#010x}, got {:#010x} (data corruption)",
            stored_crc,
            actual_crc
        );
    }

    let encoded_len = 4 + body.len() as u64;
    body.truncate(layout.key_hash_size);
    Ok(Some((
        ValueRecord {
            key_hash: body,
            value,
        },
        encoded_len,
    )))
}

/// Random-access and sequential reader for a curly value log.
///
/// The file carries no header; the layout comes from the domain config and
/// must match what the file was written with.
pub struct CurlyReader {
    path: PathBuf,
    layout: ValueLayout,
    len: u64,
    file: Mutex<BufReader<File>>,
}

impl CurlyReader {
    pub fn open<P: AsRef<Path>>(path: P, layout: ValueLayout) -> Result<Self> {
        layout.validate()?;
        let path = path.as_ref().to_path_buf();
        let f = File::open(&path).with_context(|| format!("failed to open {}", path.display()))?;
        let len = f.metadata()?.len();
        Ok(Self {
            path,
            layout,
            len,
            file: Mutex::new(BufReader::new(f)),
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// File size in bytes.
    #[must_use]
    pub fn file_len(&self) -> u64 {
        self.len
    }

    /// Reads the record starting at byte `offset` (what an index pointer holds).
    pub fn read_at(&self, offset: u64) -> Result<ValueRecord> {
        if offset >= self.len {
            bail!(
                "pointer {} is past the end of {} ({} bytes)",
                offset,
                self.path.display(),
                self.len
            );
        }
        let mut f = self
            .file
            .lock()
            .map_err(|e| anyhow!("lock poisoned: {}", e))?;
        f.seek(SeekFrom::Start(offset))?;
        match read_record(&mut *f, &self.layout)
            .with_context(|| format!("at offset {} of {}", offset, self.path.display()))?
        {
            Some((record, _)) => Ok(record),
            None => bail!("no record at offset {} of {}", offset, self.path.display()),
        }
    }

    /// Iterates the whole file from the start with a fresh handle.
    pub fn iter(&self) -> Result<CurlyIter> {
        CurlyIter::open(&self.path, self.layout)
    }
}

/// One record yielded by [`CurlyIter`], with the offset it was read from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocatedRecord {
    pub offset: u64,
    pub record: ValueRecord,
}

/// Sequential pass over a value log.
///
/// Verifies every CRC and that key hashes are strictly ascending. Yields
/// `Err` once and then stops if the file turns out to be malformed; a
/// truncated trailing record is malformed, not a clean end.
pub struct CurlyIter {
    path: PathBuf,
    rdr: BufReader<File>,
    layout: ValueLayout,
    offset: u64,
    last_key: Option<Vec<u8>>,
    done: bool,
}

impl CurlyIter {
    pub fn open<P: AsRef<Path>>(path: P, layout: ValueLayout) -> Result<Self> {
        layout.validate()?;
        let path = path.as_ref().to_path_buf();
        let f = File::open(&path).with_context(|| format!("failed to open {}", path.display()))?;
        Ok(Self {
            path,
            rdr: BufReader::new(f),
            layout,
            offset: 0,
            last_key: None,
            done: false,
        })
    }

    fn step(&mut self) -> Result<Option<LocatedRecord>> {
        let (record, encoded_len) = match read_record(&mut self.rdr, &self.layout)? {
            Some(r) => r,
            None => return Ok(None),
        };
        if let Some(last) = &self.last_key {
            if record.key_hash <= *last {
                bail!("records out of order at offset {}", self.offset);
            }
        }
        self.last_key = Some(record.key_hash.clone());
        let offset = self.offset;
        self.offset += encoded_len;
        Ok(Some(LocatedRecord { offset, record }))
    }
}

impl Iterator for CurlyIter {
    type Item = Result<LocatedRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.step() {
            Ok(Some(r)) => Some(Ok(r)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                let offset = self.offset;
                Some(Err(e.context(format!(
                    "corrupt value log {} near offset {}",
                    self.path.display(),
                    offset
                ))))
            }
        }
    }
}
