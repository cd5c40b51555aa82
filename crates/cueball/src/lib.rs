//! # Cueball - Fixed-Width Hash Index
//!
//! The index half of a partition's on-disk state. Every record is a fixed
//! width `key_hash || pointer` pair; the pointer addresses a record in the
//! partition's value log (see the `curly` crate).
//!
//! Files are *write-once*: a base is a full snapshot, a delta layers
//! additions, overwrites and tombstones on top of it, and a merge folds a
//! base plus its deltas into a new base.
//!
//! ## File layout
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────┐
//! │ BLOCKS (one per non-empty bucket, buckets in ascending order) │
//! │                                                               │
//! │ uncompressed: key_hash | pointer, key_hash | pointer, ...     │
//! │ lz4:          compressed_len (u32) | lz4 block                │
//! ├───────────────────────────────────────────────────────────────┤
//! │ BUCKETS: 2^hash_index_bits x block_offset (u64)               │
//! │          u64::MAX marks an empty bucket                       │
//! ├───────────────────────────────────────────────────────────────┤
//! │ FOOTER (always last 24 bytes)                                 │
//! │                                                               │
//! │ record_count (u64) | buckets_offset (u64)                     │
//! │ key_hash_size (u8) | offset_size (u8)                         │
//! │ hash_index_bits (u8) | codec (u8) | magic (u32) "CUE1"        │
//! └───────────────────────────────────────────────────────────────┘
//! ```
//!
//! All integers are little-endian. Records are strictly ascending by key
//! hash, and a record's bucket is the top `hash_index_bits` bits of its key
//! hash, so a lookup is one bucket read plus a bounded binary search.
//!
//! A pointer with every byte set to `0xFF` is a tombstone. Tombstones only
//! appear in deltas; a merge never writes one into a base.

mod format;
mod merge;
mod reader;
mod writer;

pub use format::{
    bucket_count, bucket_of, decode_pointer, encode_pointer, max_pointer, Footer, RecordLayout,
    CUEBALL_MAGIC, EMPTY_BUCKET, FOOTER_BYTES,
};
pub use merge::{
    CueballMerger, IdentityTransform, IndexCompactor, IndexMergeOutput, MergeOptions,
    RecordTransform,
};
pub use reader::{CueballReader, Records};
pub use writer::{tmp_path_for, CueballWriter};

#[cfg(test)]
mod tests;
