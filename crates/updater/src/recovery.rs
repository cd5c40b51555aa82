//! Start-up cleanup of an interrupted update.
//!
//! An update that dies before its commit rename can leave three kinds of
//! debris: `*.tmp` files from a copy or a merge, the `*.staged` value-log
//! merge output, and an index base newer than the newest value-log base
//! (written by an index merge, or fetched just before the value-log base
//! of the same pair failed to arrive). None of them is ever part of the
//! current generation, so all of them are removed. Nothing that belongs to
//! the current generation is touched.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::layout::{Generation, LogFile, LogKind, PartitionFiles, STAGED_SUFFIX, TMP_SUFFIX};

/// What [`recover`] found and removed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    pub removed: Vec<PathBuf>,
    /// The generation readers will see after recovery.
    pub generation: Option<Generation>,
}

/// Removes leftovers of an interrupted update from `root`.
///
/// # Errors
///
/// Fails if the directory cannot be listed or a leftover cannot be removed.
/// A missing directory is an empty partition.
pub fn recover(root: &Path) -> io::Result<RecoveryReport> {
    let mut report = RecoveryReport::default();

    let entries = match fs::read_dir(root) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(report),
        Err(e) => return Err(e),
    };
    for entry in entries {
        let path = entry?.path();
        let leftover = path
            .file_name()
            .and_then(|n| n.to_str())
            .map(|n| n.ends_with(TMP_SUFFIX) || n.ends_with(STAGED_SUFFIX))
            .unwrap_or(false);
        if leftover && path.is_file() {
            fs::remove_file(&path)?;
            report.removed.push(path);
        }
    }

    let files = PartitionFiles::scan(root)?;
    if let Some(value_version) = files.latest_base(LogKind::Value) {
        for version in files.bases(LogKind::Index).filter(|v| *v > value_version) {
            let path = root.join(LogFile::base(LogKind::Index, version).to_string());
            warn!(path = %path.display(), value_version, "removing uncommitted index base");
            fs::remove_file(&path)?;
            report.removed.push(path);
        }
    }

    report.generation = PartitionFiles::scan(root)?.current_generation();
    if !report.removed.is_empty() {
        info!(
            root = %root.display(),
            removed = report.removed.len(),
            "recovered partition directory"
        );
    }
    Ok(report)
}
