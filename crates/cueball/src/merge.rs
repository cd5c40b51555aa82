//! Sorted merge of one index base and its ordered deltas into a new base.
//!
//! Walks every input in key-hash order with a min-heap. When the same key
//! hash appears in several inputs, the record from the **newest** input
//! (highest position: base is 0, deltas follow in ascending version) wins. A
//! winning tombstone drops the key. Every surviving record is passed through
//! a [`RecordTransform`] before it is written, so pointer rewriting happens
//! in the same pass as the merge.
//!
//! ## Relative index
//!
//! Inputs are enumerated base first, then deltas in the order given. The
//! relative index of a record is `segment_start(source) + position`, where
//! `segment_start` is the sum of the record counts of all earlier inputs.
//! The value-log merge enumerates its inputs the same way, which is what lets
//! a transform correlate the two.

use anyhow::{bail, Context, Result};
use config::CompressionCodec;
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::format::RecordLayout;
use crate::reader::{CueballReader, Records};
use crate::writer::CueballWriter;

/// Per-record rewrite applied by the index merge.
pub trait RecordTransform {
    /// Rewrites the record in place. `pointer_offset` is where the pointer
    /// field starts inside `record`; `relative_index` identifies the record
    /// in the merge's input enumeration.
    fn transform(&self, record: &mut [u8], pointer_offset: usize, relative_index: usize)
        -> Result<()>;

    /// Called once with the record count of every input (base first) before
    /// anything is written. Lets a transform refuse inputs whose shape does
    /// not match what it was built for.
    fn check_sources(&self, _source_lengths: &[usize]) -> Result<()> {
        Ok(())
    }
}

/// Leaves every record untouched.
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityTransform;

impl RecordTransform for IdentityTransform {
    fn transform(&self, _record: &mut [u8], _pointer_offset: usize, _relative_index: usize)
        -> Result<()> {
        Ok(())
    }
}

/// Shape of the merged output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MergeOptions {
    pub layout: RecordLayout,
    pub hash_index_bits: u8,
    /// Applied to the new base only.
    pub codec: CompressionCodec,
}

impl MergeOptions {
    pub fn from_config(config: &config::PartitionConfig) -> Self {
        Self {
            layout: RecordLayout::from_config(config),
            hash_index_bits: config.hash_index_bits,
            codec: config.compression_codec,
        }
    }
}

/// Summary of a finished index merge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexMergeOutput {
    pub path: PathBuf,
    pub records_written: u64,
    /// Record count of every input, base first.
    pub source_lengths: Vec<usize>,
}

/// Folds an index base and its deltas into a new base.
pub trait IndexCompactor {
    fn merge<T: RecordTransform>(
        &self,
        base: &Path,
        deltas: &[PathBuf],
        destination: &Path,
        options: &MergeOptions,
        transform: &T,
    ) -> Result<IndexMergeOutput>;
}

/// The default [`IndexCompactor`].
#[derive(Debug, Clone, Copy, Default)]
pub struct CueballMerger;

/// A pending record from one input.
struct HeapEntry {
    record: Vec<u8>,
    key_len: usize,
    /// Index into the inputs (0 = base).
    source: usize,
    relative_index: usize,
}

impl HeapEntry {
    fn key(&self) -> &[u8] {
        &self.record[..self.key_len]
    }
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key() && self.source == other.source
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap: smallest key first, and on equal keys the
        // newest source first.
        other
            .key()
            .cmp(self.key())
            .then_with(|| self.source.cmp(&other.source))
    }
}

struct Source<'a> {
    records: Records<'a>,
    next_relative_index: usize,
}

fn advance(sources: &mut [Source<'_>], heap: &mut BinaryHeap<HeapEntry>, source: usize, key_len: usize)
    -> Result<()> {
    let src = &mut sources[source];
    if let Some(record) = src.records.next() {
        let record = record?;
        heap.push(HeapEntry {
            record,
            key_len,
            source,
            relative_index: src.next_relative_index,
        });
        src.next_relative_index += 1;
    }
    Ok(())
}

impl CueballMerger {
    fn merge_into<T: RecordTransform>(
        readers: &[CueballReader],
        writer: &mut CueballWriter,
        layout: RecordLayout,
        transform: &T,
    ) -> Result<()> {
        let key_len = layout.key_hash_size;
        let pointer_offset = layout.pointer_offset();
        let tombstone = layout.tombstone();

        let mut sources = Vec::with_capacity(readers.len());
        let mut segment_start = 0usize;
        for reader in readers {
            sources.push(Source {
                records: reader.records(),
                next_relative_index: segment_start,
            });
            segment_start += reader.len();
        }

        let mut heap = BinaryHeap::new();
        for source in 0..sources.len() {
            advance(&mut sources, &mut heap, source, key_len)?;
        }

        while let Some(top) = heap.pop() {
            // `top` is from the newest source holding this key; drain the
            // older duplicates.
            while heap.peek().map(|p| p.key() == top.key()).unwrap_or(false) {
                if let Some(dup) = heap.pop() {
                    advance(&mut sources, &mut heap, dup.source, key_len)?;
                }
            }
            advance(&mut sources, &mut heap, top.source, key_len)?;

            if layout.pointer(&top.record) == tombstone {
                continue;
            }

            let mut record = top.record;
            transform.transform(&mut record, pointer_offset, top.relative_index)?;
            if layout.pointer(&record) == tombstone {
                bail!(
                    "transform turned record {} into a tombstone",
                    top.relative_index
                );
            }
            writer.append(&record)?;
        }
        Ok(())
    }
}

impl IndexCompactor for CueballMerger {
    /// Merges `base` and `deltas` (ascending version order) into
    /// `destination`.
    ///
    /// # Errors
    ///
    /// Fails without touching `destination` if an input is malformed, was
    /// written with a different record layout, or the transform rejects a
    /// record.
    fn merge<T: RecordTransform>(
        &self,
        base: &Path,
        deltas: &[PathBuf],
        destination: &Path,
        options: &MergeOptions,
        transform: &T,
    ) -> Result<IndexMergeOutput> {
        let mut readers = Vec::with_capacity(deltas.len() + 1);
        for path in std::iter::once(base).chain(deltas.iter().map(PathBuf::as_path)) {
            let reader = CueballReader::open_with_layout(path, options.layout)
                .with_context(|| format!("cannot merge index {}", path.display()))?;
            readers.push(reader);
        }

        let source_lengths: Vec<usize> = readers.iter().map(CueballReader::len).collect();
        transform.check_sources(&source_lengths)?;

        let mut writer =
            CueballWriter::create(destination, options.layout, options.hash_index_bits, options.codec)?;
        if let Err(e) = Self::merge_into(&readers, &mut writer, options.layout, transform) {
            writer.abort();
            return Err(e);
        }
        let records_written = writer.finish()?;

        debug!(
            base = %base.display(),
            deltas = deltas.len(),
            records_written,
            destination = %destination.display(),
            "merged index"
        );

        Ok(IndexMergeOutput {
            path: destination.to_path_buf(),
            records_written,
            source_lengths,
        })
    }
}
