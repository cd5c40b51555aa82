//! Value record encoding.
//!
//! ```text
//! [crc32: u32 LE][key_hash: K bytes][kind: u8][len: L bytes LE][payload]
//! ```
//!
//! `kind` is [`KIND_VALUE`] or [`KIND_TOMBSTONE`]; tombstones carry no
//! length and no payload. The CRC covers everything after itself.

use anyhow::{bail, Result};
use byteorder::{ByteOrder, LittleEndian};
use config::{PartitionConfig, MAX_VALUE_LENGTH_SIZE};
use crc32fast::Hasher as Crc32;

pub const KIND_TOMBSTONE: u8 = 0;
pub const KIND_VALUE: u8 = 1;

/// Largest payload we'll allocate while reading (64 MiB). Prevents OOM on
/// corrupt files.
pub const MAX_VALUE_BYTES: u64 = 64 * 1024 * 1024;

/// Fixed widths of a value record's header fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValueLayout {
    pub key_hash_size: usize,
    pub value_length_size: usize,
}

impl ValueLayout {
    pub fn new(key_hash_size: usize, value_length_size: usize) -> Self {
        Self {
            key_hash_size,
            value_length_size,
        }
    }

    pub fn from_config(config: &PartitionConfig) -> Self {
        Self::new(config.key_hash_size, config.value_length_size)
    }

    /// Bytes in front of the length prefix: crc + key hash + kind.
    #[must_use]
    pub fn header_size(&self) -> usize {
        4 + self.key_hash_size + 1
    }

    /// Largest payload the length prefix can describe.
    #[must_use]
    pub fn max_value_len(&self) -> u64 {
        if self.value_length_size >= 8 {
            u64::MAX
        } else {
            (1u64 << (8 * self.value_length_size)) - 1
        }
    }

    /// Encoded size of a record holding `value`.
    #[must_use]
    pub fn encoded_len(&self, value: Option<&[u8]>) -> usize {
        match value {
            Some(v) => self.header_size() + self.value_length_size + v.len(),
            None => self.header_size(),
        }
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.key_hash_size == 0 {
            bail!("key_hash_size must be positive");
        }
        if self.value_length_size == 0 || self.value_length_size > MAX_VALUE_LENGTH_SIZE {
            bail!("invalid value_length_size {}", self.value_length_size);
        }
        Ok(())
    }
}

/// A decoded value record. `value == None` is a tombstone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValueRecord {
    pub key_hash: Vec<u8>,
    pub value: Option<Vec<u8>>,
}

impl ValueRecord {
    #[must_use]
    pub fn is_tombstone(&self) -> bool {
        self.value.is_none()
    }
}

/// Appends the encoding of one record to `buf`.
pub fn encode_record(
    layout: &ValueLayout,
    key_hash: &[u8],
    value: Option<&[u8]>,
    buf: &mut Vec<u8>,
) -> Result<()> {
    if key_hash.len() != layout.key_hash_size {
        bail!(
            "key hash is {} bytes, expected {}",
            key_hash.len(),
            layout.key_hash_size
        );
    }

    let start = buf.len();
    buf.extend_from_slice(&[0u8; 4]);
    buf.extend_from_slice(key_hash);
    match value {
        Some(v) => {
            let len = v.len() as u64;
            if len > layout.max_value_len() {
                bail!(
                    "value of {} bytes does not fit a {}-byte length prefix",
                    len,
                    layout.value_length_size
                );
            }
            buf.push(KIND_VALUE);
            let mut prefix = [0u8; 8];
            LittleEndian::write_uint(&mut prefix, len, layout.value_length_size);
            buf.extend_from_slice(&prefix[..layout.value_length_size]);
            buf.extend_from_slice(v);
        }
        None => buf.push(KIND_TOMBSTONE),
    }

    let mut hasher = Crc32::new();
    hasher.update(&buf[start + 4..]);
    let crc = hasher.finalize();
    buf[start..start + 4].copy_from_slice(&crc.to_le_bytes());
    Ok(())
}
