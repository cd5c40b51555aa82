//! Bringing remote files into the local partition directory.

use config::PartitionConfig;
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::error::TransportError;
use crate::layout::{LogFile, LogKind, PartitionFiles, TMP_SUFFIX};

/// A remote store holding a partition's bases and deltas.
pub trait FileSource {
    /// Names of every file available remotely.
    fn list_files(&self) -> Result<Vec<String>, TransportError>;

    /// Copies the named remote file into the local partition directory.
    fn copy_to_local(&self, name: &str) -> Result<(), TransportError>;
}

/// Serves a directory (a mount, a staging area) as the remote store.
#[derive(Debug, Clone)]
pub struct LocalFileSource {
    remote_root: PathBuf,
    local_root: PathBuf,
}

impl LocalFileSource {
    pub fn new<R: Into<PathBuf>, L: Into<PathBuf>>(remote_root: R, local_root: L) -> Self {
        Self {
            remote_root: remote_root.into(),
            local_root: local_root.into(),
        }
    }

    /// Uses the config's remote root, if one is set.
    pub fn from_config(config: &PartitionConfig) -> Option<Self> {
        config
            .remote_partition_root
            .as_ref()
            .map(|remote| Self::new(remote, &config.local_partition_root))
    }

    #[must_use]
    pub fn remote_root(&self) -> &Path {
        &self.remote_root
    }
}

impl FileSource for LocalFileSource {
    fn list_files(&self) -> Result<Vec<String>, TransportError> {
        let mut names = Vec::new();
        for entry in fs::read_dir(&self.remote_root).map_err(TransportError::List)? {
            let entry = entry.map_err(TransportError::List)?;
            if !entry.file_type().map_err(TransportError::List)?.is_file() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                names.push(name.to_string());
            }
        }
        names.sort();
        Ok(names)
    }

    /// Copies through `<name>.tmp` so an interrupted copy never leaves a
    /// file that looks complete.
    fn copy_to_local(&self, name: &str) -> Result<(), TransportError> {
        if Path::new(name).file_name().and_then(|n| n.to_str()) != Some(name) {
            return Err(TransportError::NotFound(name.to_string()));
        }
        let src = self.remote_root.join(name);
        if !src.is_file() {
            return Err(TransportError::NotFound(name.to_string()));
        }

        let dst = self.local_root.join(name);
        let tmp = self.local_root.join(format!("{}{}", name, TMP_SUFFIX));
        let copied = (|| -> io::Result<()> {
            fs::create_dir_all(&self.local_root)?;
            fs::copy(&src, &tmp)?;
            File::open(&tmp)?.sync_all()?;
            fs::rename(&tmp, &dst)
        })();
        copied.map_err(|source| {
            let _ = fs::remove_file(&tmp);
            TransportError::Copy {
                name: name.to_string(),
                source,
            }
        })
    }
}

/// Decides which remote files a partition needs.
pub trait FileSelector {
    /// Files from `remote` required to take a partition whose current
    /// version is `local_version` to `target`.
    fn select(&self, remote: &PartitionFiles, local_version: Option<u64>, target: u64)
        -> Vec<LogFile>;
}

/// Newest remote base not newer than the target, plus the deltas after it.
///
/// If the local version already covers that base, only the deltas in
/// `(local_version, target]` are selected. Files come back in version order,
/// index before value log within a version.
#[derive(Debug, Clone, Copy, Default)]
pub struct VersionFileSelector;

impl FileSelector for VersionFileSelector {
    fn select(
        &self,
        remote: &PartitionFiles,
        local_version: Option<u64>,
        target: u64,
    ) -> Vec<LogFile> {
        let mut wanted = Vec::new();
        for log in [LogKind::Value, LogKind::Index] {
            let after = match (remote.latest_base_at_most(log, target), local_version) {
                (Some(base), Some(local)) if local >= base => local,
                (Some(base), _) => {
                    wanted.push(LogFile::base(log, base));
                    base
                }
                (None, Some(local)) => local,
                (None, None) => continue,
            };
            wanted.extend(
                remote
                    .deltas_between(log, after, target)
                    .into_iter()
                    .map(|v| LogFile::delta(log, v)),
            );
        }
        // Per version the index file is copied first. A value-log base then
        // only ever lands next to its index base, and an interrupted fetch
        // leaves at worst an orphan index base, which recovery removes.
        wanted.sort_by_key(|f| (f.version, f.kind, f.log == LogKind::Value));
        wanted
    }
}

/// Lists the remote store, selects what is missing and copies it.
pub struct Fetcher<S, F = VersionFileSelector> {
    source: S,
    selector: F,
    local_root: PathBuf,
}

impl<S: FileSource> Fetcher<S> {
    pub fn new<P: Into<PathBuf>>(source: S, local_root: P) -> Self {
        Self::with_selector(source, VersionFileSelector, local_root)
    }
}

impl<S: FileSource, F: FileSelector> Fetcher<S, F> {
    pub fn with_selector<P: Into<PathBuf>>(source: S, selector: F, local_root: P) -> Self {
        Self {
            source,
            selector,
            local_root: local_root.into(),
        }
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    #[must_use]
    pub fn local_root(&self) -> &Path {
        &self.local_root
    }

    /// Copies every selected file not already present locally and returns
    /// the names copied. Safe to repeat: a second call with the same
    /// arguments copies nothing. A failure part way leaves the files copied
    /// so far in place.
    pub fn fetch(&self, local_version: Option<u64>, target: u64) -> Result<Vec<String>, TransportError> {
        let remote = PartitionFiles::from_names(self.source.list_files()?);
        let wanted = self.selector.select(&remote, local_version, target);

        let mut fetched = Vec::new();
        for file in wanted {
            let name = file.to_string();
            if self.local_root.join(&name).exists() {
                debug!(file = %name, "already present");
                continue;
            }
            self.source.copy_to_local(&name)?;
            debug!(file = %name, "fetched");
            fetched.push(name);
        }
        info!(?local_version, target_version = target, fetched = fetched.len(), "fetch complete");
        Ok(fetched)
    }
}
