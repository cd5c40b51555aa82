//! Value-log compaction and the offset adjustments it reports.
//!
//! A merge reads one base and its deltas (ascending version order) and writes
//! a new base holding, for every key hash, the record from the newest input
//! that mentions it; a winning tombstone removes the key. Output is in
//! ascending key-hash order, so the base's surviving records keep their
//! relative order and the new file lines up record-for-record with the index
//! merge of the same inputs.
//!
//! Slots a delta introduces are not appended after the base's records: they
//! are placed at their key-hash position among them. Both logs must be
//! sorted by key hash for bucket lookups, and appending would break the
//! record-for-record pairing with the index.
//!
//! The merge does not know about the index. What it hands over is an
//! [`OffsetAdjustments`]: for every input record, by relative index (base
//! first, then each delta), how far the record moved, or that it did not
//! survive.

use anyhow::{ensure, Context, Result};
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::format::ValueLayout;
use crate::reader::CurlyIter;
use crate::writer::CurlyWriter;

/// Per-record byte movement caused by one value-log merge.
///
/// Indexed by relative index: records of input 0 (the base) come first,
/// followed by each delta's records in file order. `Some(delta)` means the
/// record survived and now lives at `old_offset + delta`; `None` means it
/// was superseded or tombstoned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OffsetAdjustments {
    adjustments: Vec<Option<i64>>,
    segment_lengths: Vec<usize>,
    base_layout_unchanged: bool,
}

impl OffsetAdjustments {
    /// Builds adjustments from an explicit array, e.g. for a synthetic test.
    ///
    /// `segment_lengths` must sum to `adjustments.len()`. The base layout is
    /// considered unchanged when every base record survived unmoved and no
    /// other record survived.
    pub fn from_parts(adjustments: Vec<Option<i64>>, segment_lengths: Vec<usize>) -> Result<Self> {
        let total: usize = segment_lengths.iter().sum();
        ensure!(
            total == adjustments.len(),
            "segments cover {} records but {} adjustments were given",
            total,
            adjustments.len()
        );
        let base_len = segment_lengths.first().copied().unwrap_or(0);
        let base_layout_unchanged = adjustments[..base_len].iter().all(|a| *a == Some(0))
            && adjustments[base_len..].iter().all(Option::is_none);
        Ok(Self {
            adjustments,
            segment_lengths,
            base_layout_unchanged,
        })
    }

    /// Total number of input records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.adjustments.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.adjustments.is_empty()
    }

    /// Byte delta for `relative_index`, or `None` if that record did not
    /// survive (or the index is out of range).
    #[must_use]
    pub fn get(&self, relative_index: usize) -> Option<i64> {
        self.adjustments.get(relative_index).copied().flatten()
    }

    #[must_use]
    pub fn is_retained(&self, relative_index: usize) -> bool {
        self.get(relative_index).is_some()
    }

    /// Record count of every input, base first.
    #[must_use]
    pub fn segment_lengths(&self) -> &[usize] {
        &self.segment_lengths
    }

    /// Relative index of the first record of input `source`.
    #[must_use]
    pub fn segment_start(&self, source: usize) -> usize {
        self.segment_lengths[..source.min(self.segment_lengths.len())]
            .iter()
            .sum()
    }

    /// Number of records that made it into the new base.
    #[must_use]
    pub fn retained_count(&self) -> usize {
        self.adjustments.iter().filter(|a| a.is_some()).count()
    }

    /// The `(relative_index, byte_delta)` pairs of every surviving record
    /// that moved.
    pub fn nonzero(&self) -> impl Iterator<Item = (usize, i64)> + '_ {
        self.adjustments
            .iter()
            .enumerate()
            .filter_map(|(i, a)| a.filter(|d| *d != 0).map(|d| (i, d)))
    }

    /// `true` when every key of the base survived at its old offset and no
    /// key was added, i.e. the old index base still addresses the new value
    /// base correctly.
    #[must_use]
    pub fn base_layout_unchanged(&self) -> bool {
        self.base_layout_unchanged
    }
}

/// Summary of a finished value-log merge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValueMergeOutput {
    pub path: PathBuf,
    pub adjustments: OffsetAdjustments,
    pub records_written: u64,
    pub bytes_written: u64,
}

/// Folds a value-log base and its deltas into a new base.
pub trait ValueLogCompactor {
    fn merge(
        &self,
        base: &Path,
        deltas: &[PathBuf],
        destination: &Path,
        layout: ValueLayout,
    ) -> Result<ValueMergeOutput>;
}

/// The default [`ValueLogCompactor`].
#[derive(Debug, Clone, Copy, Default)]
pub struct CurlyMerger;

struct HeapEntry {
    key_hash: Vec<u8>,
    value: Option<Vec<u8>>,
    old_offset: u64,
    source: usize,
    /// Position of the record inside its source.
    position: usize,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.key_hash == other.key_hash && self.source == other.source
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
        // Max-heap: smallest key first, newest source first on equal keys.
        other
            .key_hash
            .cmp(&self.key_hash)
            .then_with(|| self.source.cmp(&other.source))
    }
}

struct MergeState {
    iters: Vec<CurlyIter>,
    /// Per source, one slot per record read so far.
    per_source: Vec<Vec<Option<i64>>>,
    heap: BinaryHeap<HeapEntry>,
}

impl MergeState {
    fn advance(&mut self, source: usize) -> Result<()> {
        if let Some(next) = self.iters[source].next() {
            let located = next?;
            let position = self.per_source[source].len();
            self.per_source[source].push(None);
            self.heap.push(HeapEntry {
                key_hash: located.record.key_hash,
                value: located.record.value,
                old_offset: located.offset,
                source,
                position,
            });
        }
        Ok(())
    }
}

impl CurlyMerger {
    fn merge_into(state: &mut MergeState, writer: &mut CurlyWriter) -> Result<bool> {
        let mut base_offsets_kept = true;
        let mut slots_added = false;

        while let Some(top) = state.heap.pop() {
            let mut base_offset = (top.source == 0).then_some(top.old_offset);
            while state
                .heap
                .peek()
                .map(|p| p.key_hash == top.key_hash)
                .unwrap_or(false)
            {
                if let Some(dup) = state.heap.pop() {
                    if dup.source == 0 {
                        base_offset = Some(dup.old_offset);
                    }
                    state.advance(dup.source)?;
                }
            }
            state.advance(top.source)?;

            let value = match &top.value {
                Some(v) => v,
                None => {
                    if base_offset.is_some() {
                        base_offsets_kept = false;
                    }
                    continue;
                }
            };

            let new_offset = writer.append(&top.key_hash, Some(value))?;
            state.per_source[top.source][top.position] =
                Some(new_offset as i64 - top.old_offset as i64);

            match base_offset {
                Some(old) if old != new_offset => base_offsets_kept = false,
                Some(_) => {}
                None => slots_added = true,
            }
        }
        Ok(base_offsets_kept && !slots_added)
    }
}

impl ValueLogCompactor for CurlyMerger {
    /// Merges `base` and the non-empty, version-ordered `deltas` into
    /// `destination`.
    ///
    /// # Errors
    ///
    /// Fails without leaving `destination` behind if `deltas` is empty or
    /// any input is truncated, corrupt or out of order.
    fn merge(
        &self,
        base: &Path,
        deltas: &[PathBuf],
        destination: &Path,
        layout: ValueLayout,
    ) -> Result<ValueMergeOutput> {
        ensure!(
            !deltas.is_empty(),
            "value-log merge needs at least one delta; skip the merge instead"
        );

        let mut iters = Vec::with_capacity(deltas.len() + 1);
        for path in std::iter::once(base).chain(deltas.iter().map(PathBuf::as_path)) {
            iters.push(
                CurlyIter::open(path, layout)
                    .with_context(|| format!("cannot merge value log {}", path.display()))?,
            );
        }
        let n = iters.len();
        let mut state = MergeState {
            iters,
            per_source: vec![Vec::new(); n],
            heap: BinaryHeap::new(),
        };

        let mut writer = CurlyWriter::create(destination, layout)?;
        let merged = (0..n)
            .try_for_each(|source| state.advance(source))
            .and_then(|_| Self::merge_into(&mut state, &mut writer));
        let base_layout_unchanged = match merged {
            Ok(unchanged) => unchanged,
            Err(e) => {
                writer.abort();
                return Err(e);
            }
        };

        let records_written = writer.len();
        let bytes_written = writer.finish()?;

        let segment_lengths: Vec<usize> = state.per_source.iter().map(Vec::len).collect();
        let adjustments = OffsetAdjustments {
            adjustments: state.per_source.into_iter().flatten().collect(),
            segment_lengths,
            base_layout_unchanged,
        };

        debug!(
            base = %base.display(),
            deltas = deltas.len(),
            records_written,
            bytes_written,
            moved = adjustments.nonzero().count(),
            "merged value log"
        );

        Ok(ValueMergeOutput {
            path: destination.to_path_buf(),
            adjustments,
            records_written,
            bytes_written,
        })
    }
}
