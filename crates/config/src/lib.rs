//! # Config - Partition Storage Configuration
//!
//! Settings shared by every crate that reads or writes a partition's on-disk
//! state. All of them are fixed per domain: once a partition holds data, the
//! key hash width, pointer width, value length prefix width and bucket
//! fan-out must not change, because none of the files record them in a way
//! that lets a reader guess.
//!
//! ## Environment
//!
//! ```text
//! PARTITION_ROOT               local partition directory     (default: "data/partition")
//! PARTITION_REMOTE_ROOT        remote directory to fetch from (optional)
//! PARTITION_KEY_HASH_SIZE      key hash width in bytes        (default: 8)
//! PARTITION_OFFSET_SIZE        pointer width in bytes         (default: 5)
//! PARTITION_HASH_INDEX_BITS    bucket fan-out bits            (default: 8)
//! PARTITION_VALUE_LENGTH_SIZE  value length prefix in bytes   (default: 4)
//! PARTITION_COMPRESSION        "none" | "lz4"                 (default: "none")
//! ```

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use thiserror::Error;

/// Default width of a key hash in bytes.
pub const DEFAULT_KEY_HASH_SIZE: usize = 8;
/// Default width of an index pointer in bytes (addresses up to 1 TiB).
pub const DEFAULT_OFFSET_SIZE: usize = 5;
/// Default number of leading key-hash bits used to pick a bucket.
pub const DEFAULT_HASH_INDEX_BITS: u8 = 8;
/// Default width of the length prefix in front of every value payload.
pub const DEFAULT_VALUE_LENGTH_SIZE: usize = 4;

/// Largest key hash we accept.
pub const MAX_KEY_HASH_SIZE: usize = 32;
/// Pointers are decoded into a `u64`.
pub const MAX_OFFSET_SIZE: usize = 8;
/// Caps the bucket table at 2^20 entries (8 MiB).
pub const MAX_HASH_INDEX_BITS: u8 = 20;
/// Value lengths are decoded into a `u64`.
pub const MAX_VALUE_LENGTH_SIZE: usize = 8;

pub const ENV_ROOT: &str = "PARTITION_ROOT";
pub const ENV_REMOTE_ROOT: &str = "PARTITION_REMOTE_ROOT";
pub const ENV_KEY_HASH_SIZE: &str = "PARTITION_KEY_HASH_SIZE";
pub const ENV_OFFSET_SIZE: &str = "PARTITION_OFFSET_SIZE";
pub const ENV_HASH_INDEX_BITS: &str = "PARTITION_HASH_INDEX_BITS";
pub const ENV_VALUE_LENGTH_SIZE: &str = "PARTITION_VALUE_LENGTH_SIZE";
pub const ENV_COMPRESSION: &str = "PARTITION_COMPRESSION";

/// Errors raised while loading or validating a [`PartitionConfig`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    /// An environment variable held something that does not parse.
    #[error("invalid value {value:?} for {key}")]
    InvalidValue { key: &'static str, value: String },

    /// A setting is outside the range the on-disk formats can represent.
    #[error("{field} = {value} is out of range ({expected})")]
    OutOfRange {
        field: &'static str,
        value: u64,
        expected: String,
    },

    /// Unknown compression codec name or id.
    #[error("unknown compression codec: {0}")]
    UnknownCodec(String),
}

/// Compression applied to newly written index bases.
///
/// Deltas are always written uncompressed. The codec id is stored in every
/// index file footer so a reader never has to be told which one was used.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompressionCodec {
    #[default]
    None,
    Lz4,
}

impl CompressionCodec {
    /// Stable on-disk identifier.
    #[must_use]
    pub fn id(self) -> u8 {
        match self {
            CompressionCodec::None => 0,
            CompressionCodec::Lz4 => 1,
        }
    }

    /// Inverse of [`id`](CompressionCodec::id).
    pub fn from_id(id: u8) -> Result<Self, ConfigError> {
        match id {
            0 => Ok(CompressionCodec::None),
            1 => Ok(CompressionCodec::Lz4),
            other => Err(ConfigError::UnknownCodec(format!("id {}", other))),
        }
    }
}

impl FromStr for CompressionCodec {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" | "" => Ok(CompressionCodec::None),
            "lz4" => Ok(CompressionCodec::Lz4),
            other => Err(ConfigError::UnknownCodec(other.to_string())),
        }
    }
}

impl fmt::Display for CompressionCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CompressionCodec::None => write!(f, "none"),
            CompressionCodec::Lz4 => write!(f, "lz4"),
        }
    }
}

/// Per-partition storage settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionConfig {
    /// Directory holding this partition's bases and deltas.
    pub local_partition_root: PathBuf,
    /// Directory the default file source fetches from, if any.
    pub remote_partition_root: Option<PathBuf>,
    /// Width of every key hash, in bytes.
    pub key_hash_size: usize,
    /// Width of every index pointer, in bytes.
    pub offset_size: usize,
    /// Number of leading key-hash bits used to select an index bucket.
    pub hash_index_bits: u8,
    /// Width of the length prefix in front of each value payload.
    pub value_length_size: usize,
    /// Codec for newly written index bases.
    pub compression_codec: CompressionCodec,
}

impl PartitionConfig {
    /// Creates a config rooted at `local_partition_root` with default widths.
    pub fn new<P: Into<PathBuf>>(local_partition_root: P) -> Self {
        Self {
            local_partition_root: local_partition_root.into(),
            remote_partition_root: None,
            key_hash_size: DEFAULT_KEY_HASH_SIZE,
            offset_size: DEFAULT_OFFSET_SIZE,
            hash_index_bits: DEFAULT_HASH_INDEX_BITS,
            value_length_size: DEFAULT_VALUE_LENGTH_SIZE,
            compression_codec: CompressionCodec::None,
        }
    }

    pub fn with_remote_root<P: Into<PathBuf>>(mut self, remote: P) -> Self {
        self.remote_partition_root = Some(remote.into());
        self
    }

    pub fn with_key_hash_size(mut self, size: usize) -> Self {
        self.key_hash_size = size;
        self
    }

    pub fn with_offset_size(mut self, size: usize) -> Self {
        self.offset_size = size;
        self
    }

    pub fn with_hash_index_bits(mut self, bits: u8) -> Self {
        self.hash_index_bits = bits;
        self
    }

    pub fn with_value_length_size(mut self, size: usize) -> Self {
        self.value_length_size = size;
        self
    }

    pub fn with_compression(mut self, codec: CompressionCodec) -> Self {
        self.compression_codec = codec;
        self
    }

    /// Loads the config from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Loads the config from an arbitrary key lookup, falling back to the
    /// defaults for missing keys. Present but malformed values are errors.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let root = lookup(ENV_ROOT).unwrap_or_else(|| "data/partition".to_string());
        let mut config = Self::new(root);

        if let Some(remote) = lookup(ENV_REMOTE_ROOT).filter(|r| !r.trim().is_empty()) {
            config.remote_partition_root = Some(PathBuf::from(remote));
        }
        if let Some(v) = lookup(ENV_KEY_HASH_SIZE) {
            config.key_hash_size = parse_number(ENV_KEY_HASH_SIZE, &v)?;
        }
        if let Some(v) = lookup(ENV_OFFSET_SIZE) {
            config.offset_size = parse_number(ENV_OFFSET_SIZE, &v)?;
        }
        if let Some(v) = lookup(ENV_HASH_INDEX_BITS) {
            config.hash_index_bits = parse_number(ENV_HASH_INDEX_BITS, &v)?;
        }
        if let Some(v) = lookup(ENV_VALUE_LENGTH_SIZE) {
            config.value_length_size = parse_number(ENV_VALUE_LENGTH_SIZE, &v)?;
        }
        if let Some(v) = lookup(ENV_COMPRESSION) {
            config.compression_codec = v.parse()?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Checks every width against what the on-disk formats can encode.
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_range("key_hash_size", self.key_hash_size as u64, 1, MAX_KEY_HASH_SIZE as u64)?;
        check_range("offset_size", self.offset_size as u64, 1, MAX_OFFSET_SIZE as u64)?;
        check_range(
            "value_length_size",
            self.value_length_size as u64,
            1,
            MAX_VALUE_LENGTH_SIZE as u64,
        )?;
        let max_bits = (MAX_HASH_INDEX_BITS as u64).min(8 * self.key_hash_size as u64);
        check_range("hash_index_bits", self.hash_index_bits as u64, 0, max_bits)?;
        Ok(())
    }

    /// Size in bytes of one index record (`key_hash || pointer`).
    #[must_use]
    pub fn index_record_size(&self) -> usize {
        self.key_hash_size + self.offset_size
    }
}

fn parse_number<T: FromStr>(key: &'static str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key,
        value: value.to_string(),
    })
}

fn check_range(field: &'static str, value: u64, min: u64, max: u64) -> Result<(), ConfigError> {
    if value < min || value > max {
        return Err(ConfigError::OutOfRange {
            field,
            value,
            expected: format!("{}..={}", min, max),
        });
    }
    Ok(())
}
