use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Failure talking to the remote file store.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to list remote files: {0}")]
    List(#[source] io::Error),

    #[error("remote file {0} does not exist")]
    NotFound(String),

    #[error("failed to copy {name}: {source}")]
    Copy {
        name: String,
        #[source]
        source: io::Error,
    },
}

/// Why an update did not complete.
///
/// Everything except [`UpdateError::Cleanup`] leaves the previous generation
/// current. `Cleanup` is reported after the new generation has already been
/// committed.
#[derive(Debug, Error)]
pub enum UpdateError {
    /// The local files cannot produce the requested version. Nothing was
    /// changed.
    #[error("precondition failed: {0}")]
    Precondition(String),

    #[error("remote unavailable: {0}")]
    RemoteUnavailable(#[from] TransportError),

    /// A base or delta was malformed, or a merge could not be written.
    #[error("compaction failed: {0:#}")]
    Compaction(anyhow::Error),

    /// The commit rename did not happen. Needs an operator.
    #[error("failed to rename {} to {}: {source}", .from.display(), .to.display())]
    Rename {
        from: PathBuf,
        to: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Version `version` is current, but some obsolete files are still on
    /// disk.
    #[error("updated to version {version} but {} obsolete file(s) could not be removed", .failed.len())]
    Cleanup {
        version: u64,
        failed: Vec<(PathBuf, io::Error)>,
    },

    /// Another update holds the partition lock.
    #[error("partition {} is locked by another update", .0.display())]
    Busy(PathBuf),

    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

impl UpdateError {
    /// `true` if re-running the same update later may succeed without any
    /// operator action.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            UpdateError::RemoteUnavailable(_) | UpdateError::Busy(_) | UpdateError::Io(_)
        )
    }

    /// `true` if the partition may hold a half-installed generation.
    #[must_use]
    pub fn requires_operator(&self) -> bool {
        matches!(self, UpdateError::Rename { .. })
    }

    /// The version made current before the error happened, if any.
    #[must_use]
    pub fn committed_version(&self) -> Option<u64> {
        match self {
            UpdateError::Cleanup { version, .. } => Some(*version),
            _ => None,
        }
    }
}
