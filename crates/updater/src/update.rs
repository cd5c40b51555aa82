//! The per-partition update state machine.
//!
//! ```text
//! Idle ─► Fetching ─► CompactingValues ─► CompactingIndex ─► Renaming ─► Cleaning ─► Idle
//!            │               │                   │               │           │
//!            └───────────────┴───────────────────┴───────────────┴───────────┴──► Failed
//! ```
//!
//! When no delta is newer than the local base the two compaction states and
//! `Renaming` are skipped.
//!
//! ## Commit point
//!
//! The value-log merge writes `<v>.base.curly.staged` and the index merge
//! writes `<v>.base.cueball` (when the index has no deltas and no value
//! record moved, the old index base is copied there instead). Neither is visible to readers until the staged
//! value log is renamed to `<v>.base.curly`: discovery pairs the newest
//! value-log base with the newest index base not newer than it. A crash
//! before the rename leaves the old generation current and the debris is
//! removed by [`recover`](crate::recover); a crash after it leaves the new
//! generation current. Old files are only deleted once the rename is done.

use config::PartitionConfig;
use cueball::{tmp_path_for, CueballMerger, IndexCompactor, MergeOptions};
use curly::{CurlyMerger, ValueLayout, ValueLogCompactor};
use fs2::FileExt;
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, info, info_span, warn};

use crate::error::UpdateError;
use crate::fetch::{FileSelector, FileSource, Fetcher, VersionFileSelector};
use crate::layout::{
    staged_value_name, FileKind, LogFile, LogKind, PartitionFiles, LOCK_FILE, MAX_VERSION,
};
use crate::recovery::recover;
use crate::transform::OffsetTransform;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UpdateState {
    Idle,
    Fetching,
    CompactingValues,
    CompactingIndex,
    Renaming,
    Cleaning,
    Failed,
}

impl fmt::Display for UpdateState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            UpdateState::Idle => "idle",
            UpdateState::Fetching => "fetching",
            UpdateState::CompactingValues => "compacting-values",
            UpdateState::CompactingIndex => "compacting-index",
            UpdateState::Renaming => "renaming",
            UpdateState::Cleaning => "cleaning",
            UpdateState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Hooks for whoever schedules updates and reports their status.
pub trait UpdateObserver {
    fn on_transition(&self, _from: UpdateState, _to: UpdateState) {}

    fn on_complete(&self, _outcome: &UpdateOutcome) {}

    /// `state` is the step that failed.
    fn on_failure(&self, _state: UpdateState, _error: &UpdateError) {}
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopObserver;

impl UpdateObserver for NoopObserver {}

/// What a successful update did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpdateOutcome {
    /// Local version before the update, if there was one.
    pub previous_version: Option<u64>,
    /// Version now current.
    pub version: u64,
    /// Delta versions folded into the new bases.
    pub merged_deltas: Vec<u64>,
    pub values_compacted: bool,
    pub index_compacted: bool,
    /// Remote files copied in.
    pub fetched: Vec<String>,
    /// Obsolete files removed after the commit.
    pub deleted: Vec<PathBuf>,
}

impl UpdateOutcome {
    /// `true` if the update changed nothing on disk.
    #[must_use]
    pub fn is_noop(&self) -> bool {
        self.fetched.is_empty() && self.deleted.is_empty() && !self.values_compacted
    }
}

/// Brings one partition directory to a target version.
///
/// Not reentrant: an update holds an exclusive lock on `<root>/LOCK` for
/// its whole duration and a concurrent one fails with
/// [`UpdateError::Busy`].
pub struct PartitionUpdater<S, V = CurlyMerger, I = CueballMerger, F = VersionFileSelector> {
    config: PartitionConfig,
    fetcher: Fetcher<S, F>,
    values: V,
    index: I,
    state: UpdateState,
}

impl<S: FileSource> PartitionUpdater<S> {
    /// An updater with the default selector and merges.
    pub fn new(config: PartitionConfig, source: S) -> Result<Self, UpdateError> {
        let fetcher = Fetcher::new(source, config.local_partition_root.clone());
        Self::with_components(config, fetcher, CurlyMerger, CueballMerger)
    }
}

impl<S, V, I, F> PartitionUpdater<S, V, I, F>
where
    S: FileSource,
    V: ValueLogCompactor,
    I: IndexCompactor,
    F: FileSelector,
{
    pub fn with_components(
        config: PartitionConfig,
        fetcher: Fetcher<S, F>,
        values: V,
        index: I,
    ) -> Result<Self, UpdateError> {
        config
            .validate()
            .map_err(|e| UpdateError::Precondition(format!("invalid config: {}", e)))?;
        if fetcher.local_root() != config.local_partition_root.as_path() {
            return Err(UpdateError::Precondition(format!(
                "fetcher writes to {} but the partition lives in {}",
                fetcher.local_root().display(),
                config.local_partition_root.display()
            )));
        }
        Ok(Self {
            config,
            fetcher,
            values,
            index,
            state: UpdateState::Idle,
        })
    }

    #[must_use]
    pub fn config(&self) -> &PartitionConfig {
        &self.config
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.config.local_partition_root
    }

    #[must_use]
    pub fn state(&self) -> UpdateState {
        self.state
    }

    /// Version of the newest local value-log base.
    pub fn local_version(&self) -> Result<Option<u64>, UpdateError> {
        Ok(PartitionFiles::scan(self.root())?.latest_base(LogKind::Value))
    }

    pub fn update(&mut self, target: u64) -> Result<UpdateOutcome, UpdateError> {
        self.update_with(target, &NoopObserver)
    }

    /// Runs one update, reporting every state change to `observer`.
    pub fn update_with<O: UpdateObserver>(
        &mut self,
        target: u64,
        observer: &O,
    ) -> Result<UpdateOutcome, UpdateError> {
        let span = info_span!(
            "update",
            partition = %self.config.local_partition_root.display(),
            target
        );
        let _guard = span.enter();

        if self.state == UpdateState::Failed {
            self.enter(UpdateState::Idle, observer);
        }

        match self.run(target, observer) {
            Ok(outcome) => {
                self.enter(UpdateState::Idle, observer);
                info!(
                    version = outcome.version,
                    merged = outcome.merged_deltas.len(),
                    fetched = outcome.fetched.len(),
                    deleted = outcome.deleted.len(),
                    "update complete"
                );
                observer.on_complete(&outcome);
                Ok(outcome)
            }
            Err(err) => {
                let failed_in = self.state;
                self.enter(UpdateState::Failed, observer);
                warn!(state = %failed_in, error = %err, "update failed");
                observer.on_failure(failed_in, &err);
                Err(err)
            }
        }
    }

    fn enter<O: UpdateObserver>(&mut self, to: UpdateState, observer: &O) {
        let from = self.state;
        self.state = to;
        debug!(%from, %to, "state change");
        observer.on_transition(from, to);
    }

    fn run<O: UpdateObserver>(&mut self, target: u64, observer: &O) -> Result<UpdateOutcome, UpdateError> {
        if target > MAX_VERSION {
            return Err(UpdateError::Precondition(format!(
                "target version {} exceeds the maximum of {}",
                target, MAX_VERSION
            )));
        }
        let root = self.config.local_partition_root.clone();
        let _lock = lock_partition(&root)?;

        let recovered = recover(&root)?;
        if !recovered.removed.is_empty() {
            warn!(removed = recovered.removed.len(), "cleaned up an interrupted update");
        }

        self.enter(UpdateState::Fetching, observer);
        let previous = PartitionFiles::scan(&root)?.latest_base(LogKind::Value);
        if let Some(local) = previous {
            if local > target {
                return Err(UpdateError::Precondition(format!(
                    "local version {} is newer than target {}",
                    local, target
                )));
            }
        }
        let fetched = if previous == Some(target) {
            Vec::new()
        } else {
            self.fetcher.fetch(previous, target)?
        };

        let files = PartitionFiles::scan(&root)?;
        let value_base = files.latest_base(LogKind::Value).ok_or_else(|| {
            UpdateError::Precondition("no value-log base is present after fetching".into())
        })?;
        let index_base = files
            .latest_base_at_most(LogKind::Index, value_base)
            .ok_or_else(|| {
                UpdateError::Precondition(format!(
                    "no index base at or below version {} is present after fetching",
                    value_base
                ))
            })?;
        // Every committed generation and every fetched base is a pair.
        if index_base != value_base {
            return Err(UpdateError::Precondition(format!(
                "value-log base {} has no index base of the same version (newest is {})",
                value_base, index_base
            )));
        }

        let value_deltas = files.deltas_between(LogKind::Value, value_base, target);
        let expected: Vec<u64> = (value_base + 1..=target).collect();
        if value_deltas != expected {
            return Err(UpdateError::Precondition(format!(
                "value-log deltas {:?} do not cover versions {}..={}",
                value_deltas,
                value_base + 1,
                target
            )));
        }
        // Index deltas are selected with the old value-log base as cutoff.
        let index_deltas = files.deltas_between(LogKind::Index, value_base, target);
        if !index_deltas.is_empty() && index_deltas != value_deltas {
            return Err(UpdateError::Precondition(format!(
                "index deltas {:?} do not match value-log deltas {:?}",
                index_deltas, value_deltas
            )));
        }

        let mut outcome = UpdateOutcome {
            previous_version: previous,
            version: value_base,
            fetched,
            ..UpdateOutcome::default()
        };
        if value_deltas.is_empty() {
            debug!(version = value_base, "no deltas newer than the base; nothing to compact");
        } else {
            self.compact(
                &root,
                value_base,
                index_base,
                &value_deltas,
                &index_deltas,
                target,
                observer,
            )?;
            outcome.version = target;
            outcome.values_compacted = true;
            outcome.index_compacted = !index_deltas.is_empty();
            outcome.merged_deltas = value_deltas;
        }

        self.enter(UpdateState::Cleaning, observer);
        outcome.deleted = clean(&root, outcome.version)?;
        Ok(outcome)
    }

    /// Merges both logs into a new base pair at `target` and commits it.
    #[allow(clippy::too_many_arguments)]
    fn compact<O: UpdateObserver>(
        &mut self,
        root: &Path,
        value_base: u64,
        index_base: u64,
        value_deltas: &[u64],
        index_deltas: &[u64],
        target: u64,
        observer: &O,
    ) -> Result<(), UpdateError> {
        let value_layout = ValueLayout::from_config(&self.config);
        let options = MergeOptions::from_config(&self.config);

        self.enter(UpdateState::CompactingValues, observer);
        let staged = root.join(staged_value_name(target).map_err(precondition)?);
        let merged = self
            .values
            .merge(
                &log_path(root, LogFile::base(LogKind::Value, value_base))?,
                &log_paths(root, LogKind::Value, value_deltas)?,
                &staged,
                value_layout,
            )
            .map_err(UpdateError::Compaction)?;
        info!(
            records = merged.records_written,
            bytes = merged.bytes_written,
            moved = merged.adjustments.nonzero().count(),
            "value log merged"
        );

        self.enter(UpdateState::CompactingIndex, observer);
        if index_deltas.is_empty() {
            if !merged.adjustments.base_layout_unchanged() {
                discard(&staged);
                return Err(UpdateError::Precondition(format!(
                    "value-log deltas {:?} move or add records but there are no index deltas",
                    value_deltas
                )));
            }
            // Every pointer is still valid, so the index base is carried
            // forward unchanged under the new version.
            if let Err(e) = carry_index_base(root, index_base, target) {
                discard(&staged);
                return Err(e);
            }
            debug!(from = index_base, to = target, "no index deltas; index base carried forward");
        } else {
            let transform = OffsetTransform::new(&merged.adjustments, options.layout.offset_size);
            let merge = self.index.merge(
                &log_path(root, LogFile::base(LogKind::Index, index_base))?,
                &log_paths(root, LogKind::Index, index_deltas)?,
                &log_path(root, LogFile::base(LogKind::Index, target))?,
                &options,
                &transform,
            );
            match merge {
                Ok(out) => info!(records = out.records_written, "index merged"),
                Err(e) => {
                    discard(&staged);
                    return Err(UpdateError::Compaction(e));
                }
            }
        }

        self.enter(UpdateState::Renaming, observer);
        let committed = log_path(root, LogFile::base(LogKind::Value, target))?;
        fs::rename(&staged, &committed).map_err(|source| UpdateError::Rename {
            from: staged.clone(),
            to: committed.clone(),
            source,
        })?;
        sync_dir(root);
        info!(version = target, "committed new generation");
        Ok(())
    }
}

fn precondition(e: anyhow::Error) -> UpdateError {
    UpdateError::Precondition(format!("{:#}", e))
}

fn log_path(root: &Path, file: LogFile) -> Result<PathBuf, UpdateError> {
    file.path_in(root).map_err(precondition)
}

fn log_paths(root: &Path, log: LogKind, versions: &[u64]) -> Result<Vec<PathBuf>, UpdateError> {
    versions
        .iter()
        .map(|v| log_path(root, LogFile::delta(log, *v)))
        .collect()
}

/// Copies index base `from` to version `to` through a temp file.
fn carry_index_base(root: &Path, from: u64, to: u64) -> Result<(), UpdateError> {
    let src = log_path(root, LogFile::base(LogKind::Index, from))?;
    let dst = log_path(root, LogFile::base(LogKind::Index, to))?;
    let tmp = tmp_path_for(&dst);
    let copied = (|| -> io::Result<()> {
        fs::copy(&src, &tmp)?;
        File::open(&tmp)?.sync_all()?;
        fs::rename(&tmp, &dst)
    })();
    copied.map_err(|e| {
        discard(&tmp);
        UpdateError::Compaction(
            anyhow::Error::new(e)
                .context(format!("carrying index base {} forward to {}", from, to)),
        )
    })
}

fn discard(path: &Path) {
    if let Err(e) = fs::remove_file(path) {
        warn!(path = %path.display(), error = %e, "failed to discard merge output");
    }
}

fn sync_dir(dir: &Path) {
    if let Ok(d) = File::open(dir) {
        let _ = d.sync_all();
    }
}

/// Takes the partition's single-writer lock. Released when the file is
/// dropped.
fn lock_partition(root: &Path) -> Result<File, UpdateError> {
    fs::create_dir_all(root)?;
    let file = OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .open(root.join(LOCK_FILE))?;
    match file.try_lock_exclusive() {
        Ok(()) => Ok(file),
        Err(e) if e.kind() == fs2::lock_contended_error().kind() => {
            Err(UpdateError::Busy(root.to_path_buf()))
        }
        Err(e) => Err(UpdateError::Io(e)),
    }
}

/// Deletes every base older than the current one and every delta already
/// folded into it, in both logs. Newer files are left alone.
fn clean(root: &Path, version: u64) -> Result<Vec<PathBuf>, UpdateError> {
    let files = PartitionFiles::scan(root)?;
    let mut deleted = Vec::new();
    let mut failed = Vec::new();
    for file in files.files() {
        let obsolete = match file.kind {
            FileKind::Base => file.version < version,
            FileKind::Delta => file.version <= version,
        };
        if !obsolete {
            continue;
        }
        let path = root.join(file.to_string());
        match fs::remove_file(&path) {
            Ok(()) => deleted.push(path),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "failed to remove obsolete file");
                failed.push((path, e));
            }
        }
    }
    if !failed.is_empty() {
        return Err(UpdateError::Cleanup {
            version,
            failed,
        });
    }
    Ok(deleted)
}
