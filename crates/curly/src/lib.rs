//! # Curly - Append-Only Value Log
//!
//! The value half of a partition's on-disk state. A curly file is a plain
//! sequence of CRC-protected records; the partition's index (see the
//! `cueball` crate) stores, for each key hash, the byte offset of its record
//! here.
//!
//! ## File layout
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │ RECORD 0                                                     │
//! │ crc32 (u32) | key_hash (K) | kind (u8) | len (L) | payload   │
//! ├──────────────────────────────────────────────────────────────┤
//! │ RECORD 1                                                     │
//! │ crc32 (u32) | key_hash (K) | kind (u8)       (tombstone)     │
//! ├──────────────────────────────────────────────────────────────┤
//! │ ...                                                          │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! There is no header or footer; `K` (key hash size) and `L` (value length
//! size) come from the partition config. Records are strictly ascending by
//! key hash, which keeps record `j` of a value log paired with record `j` of
//! the index written for the same version.
//!
//! Merging a base with its deltas produces a new base plus
//! [`OffsetAdjustments`], the per-record byte movement the index merge needs
//! to rewrite its pointers.

mod format;
mod merge;
mod reader;
mod writer;

pub use format::{encode_record, ValueLayout, ValueRecord, KIND_TOMBSTONE, KIND_VALUE, MAX_VALUE_BYTES};
pub use merge::{CurlyMerger, OffsetAdjustments, ValueLogCompactor, ValueMergeOutput};
pub use reader::{CurlyIter, CurlyReader, LocatedRecord};
pub use writer::{tmp_path_for, CurlyWriter};

#[cfg(test)]
mod tests;
