//! Cueball binary format constants, record layout and footer helpers.
//!
//! ## Footer (24 bytes) - magic `CUE1` (`0x4355_4531`)
//!
//! ```text
//! [record_count: u64 LE][buckets_offset: u64 LE]
//! [key_hash_size: u8][offset_size: u8][hash_index_bits: u8][codec: u8]
//! [magic: u32 LE]
//! ```
//!
//! The bucket table sits directly in front of the footer:
//! `2^hash_index_bits` little-endian `u64` block offsets, [`EMPTY_BUCKET`]
//! for buckets with no records.

use anyhow::{bail, Result};
use byteorder::{ByteOrder, LittleEndian, ReadBytesExt, WriteBytesExt};
use config::{CompressionCodec, PartitionConfig, MAX_OFFSET_SIZE};
use std::io::{Read, Seek, SeekFrom, Write};

/// Magic number identifying cueball index files (ASCII "CUE1").
pub const CUEBALL_MAGIC: u32 = 0x4355_4531;

/// Size of the footer in bytes.
pub const FOOTER_BYTES: u64 = 8 + 8 + 4 + 4;

/// Bucket table marker for a bucket without records.
pub const EMPTY_BUCKET: u64 = u64::MAX;

/// Fixed widths of one index record: `key_hash || pointer`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordLayout {
    pub key_hash_size: usize,
    pub offset_size: usize,
}

impl RecordLayout {
    pub fn new(key_hash_size: usize, offset_size: usize) -> Self {
        Self {
            key_hash_size,
            offset_size,
        }
    }

    pub fn from_config(config: &PartitionConfig) -> Self {
        Self::new(config.key_hash_size, config.offset_size)
    }

    #[must_use]
    pub fn record_size(&self) -> usize {
        self.key_hash_size + self.offset_size
    }

    /// Byte offset of the pointer field inside a record.
    #[must_use]
    pub fn pointer_offset(&self) -> usize {
        self.key_hash_size
    }

    /// The all-ones pointer, reserved for delta tombstones.
    #[must_use]
    pub fn tombstone(&self) -> u64 {
        max_pointer(self.offset_size)
    }

    /// Key hash portion of a record.
    pub fn key_hash<'a>(&self, record: &'a [u8]) -> &'a [u8] {
        &record[..self.key_hash_size]
    }

    /// Decodes the pointer of a record.
    pub fn pointer(&self, record: &[u8]) -> u64 {
        decode_pointer(&record[self.key_hash_size..], self.offset_size)
    }

    #[must_use]
    pub fn is_tombstone(&self, record: &[u8]) -> bool {
        self.pointer(record) == self.tombstone()
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.key_hash_size == 0 || self.key_hash_size > u8::MAX as usize {
            bail!("invalid key_hash_size {}", self.key_hash_size);
        }
        if self.offset_size == 0 || self.offset_size > MAX_OFFSET_SIZE {
            bail!("invalid offset_size {}", self.offset_size);
        }
        Ok(())
    }
}

/// Largest value an `offset_size`-byte pointer can hold.
#[must_use]
pub fn max_pointer(offset_size: usize) -> u64 {
    if offset_size >= 8 {
        u64::MAX
    } else {
        (1u64 << (8 * offset_size)) - 1
    }
}

/// Reads a little-endian fixed-width pointer from the front of `buf`.
pub fn decode_pointer(buf: &[u8], offset_size: usize) -> u64 {
    LittleEndian::read_uint(buf, offset_size)
}

/// Writes `value` as a little-endian fixed-width pointer into the front of
/// `buf`. Fails if `value` does not fit in `offset_size` bytes.
pub fn encode_pointer(value: u64, buf: &mut [u8], offset_size: usize) -> Result<()> {
    if value > max_pointer(offset_size) {
        bail!("pointer {} does not fit in {} bytes", value, offset_size);
    }
    LittleEndian::write_uint(buf, value, offset_size);
    Ok(())
}

/// Bucket of a key hash: its top `bits` bits, reading the leading bytes
/// big-endian so that bucket order matches byte-wise sort order.
#[must_use]
pub fn bucket_of(key_hash: &[u8], bits: u8) -> usize {
    if bits == 0 {
        return 0;
    }
    let mut prefix = [0u8; 4];
    let n = key_hash.len().min(4);
    prefix[..n].copy_from_slice(&key_hash[..n]);
    (u32::from_be_bytes(prefix) >> (32 - bits as u32)) as usize
}

/// Number of buckets for a given fan-out.
#[must_use]
pub fn bucket_count(bits: u8) -> usize {
    1usize << bits
}

/// Parsed cueball footer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Footer {
    pub record_count: u64,
    pub buckets_offset: u64,
    pub layout: RecordLayout,
    pub hash_index_bits: u8,
    pub codec: CompressionCodec,
}

/// Writes a cueball footer to `w`.
pub fn write_footer<W: Write>(w: &mut W, footer: &Footer) -> Result<()> {
    w.write_u64::<LittleEndian>(footer.record_count)?;
    w.write_u64::<LittleEndian>(footer.buckets_offset)?;
    w.write_u8(footer.layout.key_hash_size as u8)?;
    w.write_u8(footer.layout.offset_size as u8)?;
    w.write_u8(footer.hash_index_bits)?;
    w.write_u8(footer.codec.id())?;
    w.write_u32::<LittleEndian>(CUEBALL_MAGIC)?;
    Ok(())
}

/// Reads and validates the footer at the end of `r`.
pub fn read_footer<R: Read + Seek>(r: &mut R) -> Result<Footer> {
    let filesize = r.seek(SeekFrom::End(0))?;
    if filesize < FOOTER_BYTES {
        bail!("file too small for cueball footer ({} bytes)", filesize);
    }

    r.seek(SeekFrom::End(-(FOOTER_BYTES as i64)))?;
    let record_count = r.read_u64::<LittleEndian>()?;
    let buckets_offset = r.read_u64::<LittleEndian>()?;
    let key_hash_size = r.read_u8()? as usize;
    let offset_size = r.read_u8()? as usize;
    let hash_index_bits = r.read_u8()?;
    let codec_id = r.read_u8()?;
    let magic = r.read_u32::<LittleEndian>()?;

    if magic != CUEBALL_MAGIC {
        bail!("unknown cueball magic: {:#x}", magic);
    }
    let layout = RecordLayout::new(key_hash_size, offset_size);
    layout.validate()?;
    if hash_index_bits > config::MAX_HASH_INDEX_BITS {
        bail!("hash_index_bits {} exceeds maximum", hash_index_bits);
    }
    let codec = CompressionCodec::from_id(codec_id)?;

    Ok(Footer {
        record_count,
        buckets_offset,
        layout,
        hash_index_bits,
        codec,
    })
}
