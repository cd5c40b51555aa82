//! Bridges the value-log merge and the index merge.
//!
//! The value-log merge reports, per input record, how far it moved
//! ([`OffsetAdjustments`]). The index merge walks the same inputs in the
//! same enumeration and asks a [`RecordTransform`] to rewrite each surviving
//! record. [`OffsetTransform`] answers by adding the adjustment at the
//! record's relative index to its pointer.

use anyhow::{anyhow, ensure, Result};
use cueball::{decode_pointer, encode_pointer, max_pointer, RecordTransform};
use curly::OffsetAdjustments;

/// Applies value-log offset adjustments to index pointers.
#[derive(Debug, Clone, Copy)]
pub struct OffsetTransform<'a> {
    adjustments: &'a OffsetAdjustments,
    offset_size: usize,
}

impl<'a> OffsetTransform<'a> {
    pub fn new(adjustments: &'a OffsetAdjustments, offset_size: usize) -> Self {
        Self {
            adjustments,
            offset_size,
        }
    }
}

impl RecordTransform for OffsetTransform<'_> {
    /// The index inputs must have exactly as many records per file as the
    /// value-log inputs; otherwise relative indexes mean different records.
    fn check_sources(&self, source_lengths: &[usize]) -> Result<()> {
        ensure!(
            source_lengths == self.adjustments.segment_lengths(),
            "index inputs hold {:?} records but the value-log inputs held {:?}",
            source_lengths,
            self.adjustments.segment_lengths()
        );
        Ok(())
    }

    fn transform(&self, record: &mut [u8], pointer_offset: usize, relative_index: usize) -> Result<()> {
        let delta = self.adjustments.get(relative_index).ok_or_else(|| {
            anyhow!(
                "index record {} survived but its value record did not",
                relative_index
            )
        })?;
        if delta == 0 {
            return Ok(());
        }

        let end = pointer_offset + self.offset_size;
        ensure!(
            end <= record.len(),
            "record of {} bytes has no {}-byte pointer at {}",
            record.len(),
            self.offset_size,
            pointer_offset
        );
        let field = &mut record[pointer_offset..end];
        let pointer = decode_pointer(field, self.offset_size);
        let moved = i128::from(pointer) + i128::from(delta);
        // The all-ones pointer is the tombstone marker.
        ensure!(
            moved >= 0 && moved < i128::from(max_pointer(self.offset_size)),
            "pointer {} moved by {} leaves the {}-byte pointer range",
            pointer,
            delta,
            self.offset_size
        );
        encode_pointer(moved as u64, field, self.offset_size)
    }
}
