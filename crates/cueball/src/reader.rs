use anyhow::{anyhow, bail, Context, Result};
use byteorder::{LittleEndian, ReadBytesExt};
use config::CompressionCodec;
use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::format::{
    bucket_count, bucket_of, read_footer, Footer, RecordLayout, EMPTY_BUCKET, FOOTER_BYTES,
};

/// Reads a cueball index file.
///
/// On [`open`](CueballReader::open) only the footer and the bucket table are
/// loaded. Lookups read a single block: pick the bucket from the top
/// `hash_index_bits` of the key hash, then binary search inside it.
///
/// The file handle is wrapped in a `Mutex` so that lookups work through a
/// shared `&self`.
pub struct CueballReader {
    path: PathBuf,
    footer: Footer,
    /// Block start per bucket ([`EMPTY_BUCKET`] when the bucket has no records).
    buckets: Vec<u64>,
    /// Block end per bucket, derived from the next non-empty bucket.
    block_ends: Vec<u64>,
    file: Mutex<BufReader<File>>,
}

impl std::fmt::Debug for CueballReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CueballReader")
            .field("path", &self.path)
            .field("footer", &self.footer)
            .finish()
    }
}

impl CueballReader {
    /// Opens an index file, validating the footer and the bucket table.
    ///
    /// # Errors
    ///
    /// Returns an error if the magic is wrong, the bucket table does not fit
    /// between the blocks and the footer, or block offsets are not ascending.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut f =
            File::open(&path).with_context(|| format!("failed to open {}", path.display()))?;
        let filesize = f.metadata()?.len();

        let footer = read_footer(&mut f).with_context(|| format!("in {}", path.display()))?;
        let n_buckets = bucket_count(footer.hash_index_bits);
        let expected = footer
            .buckets_offset
            .checked_add(8 * n_buckets as u64 + FOOTER_BYTES);
        if expected != Some(filesize) {
            bail!(
                "corrupt index {}: bucket table at {} does not match file size {}",
                path.display(),
                footer.buckets_offset,
                filesize
            );
        }

        f.seek(SeekFrom::Start(footer.buckets_offset))?;
        let mut buckets = Vec::with_capacity(n_buckets);
        for _ in 0..n_buckets {
            buckets.push(f.read_u64::<LittleEndian>()?);
        }

        let mut block_ends = vec![EMPTY_BUCKET; n_buckets];
        let mut next_start = footer.buckets_offset;
        for b in (0..n_buckets).rev() {
            let start = buckets[b];
            if start == EMPTY_BUCKET {
                continue;
            }
            if start >= next_start {
                bail!(
                    "corrupt index {}: bucket {} starts at {} past {}",
                    path.display(),
                    b,
                    start,
                    next_start
                );
            }
            block_ends[b] = next_start;
            next_start = start;
        }

        f.seek(SeekFrom::Start(0))?;

        Ok(Self {
            path,
            footer,
            buckets,
            block_ends,
            file: Mutex::new(BufReader::new(f)),
        })
    }

    /// Opens an index file and checks it was written with `layout`.
    pub fn open_with_layout<P: AsRef<Path>>(path: P, layout: RecordLayout) -> Result<Self> {
        let reader = Self::open(path)?;
        if reader.layout() != layout {
            bail!(
                "index {} has layout {:?}, expected {:?}",
                reader.path.display(),
                reader.layout(),
                layout
            );
        }
        Ok(reader)
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub fn layout(&self) -> RecordLayout {
        self.footer.layout
    }

    #[must_use]
    pub fn hash_index_bits(&self) -> u8 {
        self.footer.hash_index_bits
    }

    #[must_use]
    pub fn codec(&self) -> CompressionCodec {
        self.footer.codec
    }

    /// Number of records in the file.
    #[must_use]
    pub fn len(&self) -> usize {
        self.footer.record_count as usize
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.footer.record_count == 0
    }

    /// Byte offset of the first block of `bucket`, if the bucket has records.
    #[must_use]
    pub fn bucket_offset(&self, bucket: usize) -> Option<u64> {
        self.buckets
            .get(bucket)
            .copied()
            .filter(|&o| o != EMPTY_BUCKET)
    }

    /// Reads and (if needed) decompresses the raw records of one bucket.
    pub fn read_bucket(&self, bucket: usize) -> Result<Vec<u8>> {
        let start = match self.bucket_offset(bucket) {
            Some(s) => s,
            None => return Ok(Vec::new()),
        };
        let end = self.block_ends[bucket];

        let mut f = self
            .file
            .lock()
            .map_err(|e| anyhow!("lock poisoned: {}", e))?;
        f.seek(SeekFrom::Start(start))?;

        let block = match self.footer.codec {
            CompressionCodec::None => {
                let mut raw = vec![0u8; (end - start) as usize];
                f.read_exact(&mut raw)?;
                raw
            }
            CompressionCodec::Lz4 => {
                let len = f.read_u32::<LittleEndian>()? as u64;
                if start + 4 + len != end {
                    bail!(
                        "corrupt index {}: compressed block of bucket {} has length {}",
                        self.path.display(),
                        bucket,
                        len
                    );
                }
                let mut compressed = vec![0u8; len as usize];
                f.read_exact(&mut compressed)?;
                lz4_flex::decompress_size_prepended(&compressed).map_err(|e| {
                    anyhow!(
                        "corrupt index {}: bucket {} failed to decompress: {}",
                        self.path.display(),
                        bucket,
                        e
                    )
                })?
            }
        };

        if block.is_empty() || block.len() % self.footer.layout.record_size() != 0 {
            bail!(
                "corrupt index {}: bucket {} holds {} bytes, not a whole number of records",
                self.path.display(),
                bucket,
                block.len()
            );
        }
        Ok(block)
    }

    /// Looks up `key_hash`, returning its raw pointer (which may be the
    /// tombstone value in a delta).
    pub fn get(&self, key_hash: &[u8]) -> Result<Option<u64>> {
        let layout = self.footer.layout;
        if key_hash.len() != layout.key_hash_size {
            bail!(
                "key hash is {} bytes, expected {}",
                key_hash.len(),
                layout.key_hash_size
            );
        }

        let block = self.read_bucket(bucket_of(key_hash, self.footer.hash_index_bits))?;
        let rs = layout.record_size();
        let (mut lo, mut hi) = (0usize, block.len() / rs);
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            let record = &block[mid * rs..(mid + 1) * rs];
            match layout.key_hash(record).cmp(key_hash) {
                std::cmp::Ordering::Less => lo = mid + 1,
                std::cmp::Ordering::Greater => hi = mid,
                std::cmp::Ordering::Equal => return Ok(Some(layout.pointer(record))),
            }
        }
        Ok(None)
    }

    /// Iterates every record in sorted order, validating ordering, bucket
    /// placement and the total record count as it goes.
    pub fn records(&self) -> Records<'_> {
        Records {
            reader: self,
            next_bucket: 0,
            block: Vec::new(),
            pos: 0,
            last_key: None,
            yielded: 0,
            done: false,
        }
    }
}

/// Iterator over the raw records of a [`CueballReader`].
///
/// Yields `Err` once and then stops if the file turns out to be malformed.
pub struct Records<'a> {
    reader: &'a CueballReader,
    next_bucket: usize,
    block: Vec<u8>,
    pos: usize,
    last_key: Option<Vec<u8>>,
    yielded: u64,
    done: bool,
}

impl Records<'_> {
    fn fail(&mut self, err: anyhow::Error) -> Option<Result<Vec<u8>>> {
        self.done = true;
        Some(Err(err))
    }
}

impl Iterator for Records<'_> {
    type Item = Result<Vec<u8>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let layout = self.reader.footer.layout;
        let rs = layout.record_size();

        loop {
            if self.pos < self.block.len() {
                let record = self.block[self.pos..self.pos + rs].to_vec();
                self.pos += rs;

                let key = layout.key_hash(&record);
                let bucket = self.next_bucket - 1;
                if bucket_of(key, self.reader.footer.hash_index_bits) != bucket {
                    let path = self.reader.path.display().to_string();
                    return self.fail(anyhow!("corrupt index {}: record in wrong bucket", path));
                }
                if let Some(last) = &self.last_key {
                    if key <= last.as_slice() {
                        let path = self.reader.path.display().to_string();
                        return self.fail(anyhow!(
                            "corrupt index {}: records out of order at record {}",
                            path,
                            self.yielded
                        ));
                    }
                }
                self.last_key = Some(key.to_vec());
                self.yielded += 1;
                return Some(Ok(record));
            }

            if self.next_bucket >= self.reader.buckets.len() {
                self.done = true;
                if self.yielded != self.reader.footer.record_count {
                    let path = self.reader.path.display().to_string();
                    let expected = self.reader.footer.record_count;
                    return self.fail(anyhow!(
                        "corrupt index {}: footer claims {} records, found {}",
                        path,
                        expected,
                        self.yielded
                    ));
                }
                return None;
            }

            match self.reader.read_bucket(self.next_bucket) {
                Ok(block) => {
                    self.block = block;
                    self.pos = 0;
                    self.next_bucket += 1;
                }
                Err(e) => return self.fail(e),
            }
        }
    }
}
