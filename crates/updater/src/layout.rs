//! Partition directory naming and discovery.
//!
//! ```text
//! 00007.base.curly      value-log base, version 7
//! 00007.base.cueball    index base, version 7
//! 00008.delta.curly     value-log delta, version 8
//! 00008.delta.cueball   index delta, version 8
//! 00008.base.curly.staged   merge output waiting for the commit rename
//! LOCK                  held while an update runs
//! ```
//!
//! Versions are zero-padded to five digits so that file name order equals
//! version order.

use anyhow::{bail, Result};
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Largest version that fits the five-digit file name prefix.
pub const MAX_VERSION: u64 = 99_999;

pub const LOCK_FILE: &str = "LOCK";
pub const STAGED_SUFFIX: &str = ".staged";
pub const TMP_SUFFIX: &str = ".tmp";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum LogKind {
    /// The curly value log.
    Value,
    /// The cueball index.
    Index,
}

impl LogKind {
    #[must_use]
    pub fn extension(self) -> &'static str {
        match self {
            LogKind::Value => "curly",
            LogKind::Index => "cueball",
        }
    }

    fn from_extension(ext: &str) -> Option<Self> {
        match ext {
            "curly" => Some(LogKind::Value),
            "cueball" => Some(LogKind::Index),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum FileKind {
    Base,
    Delta,
}

impl FileKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            FileKind::Base => "base",
            FileKind::Delta => "delta",
        }
    }
}

/// One parsed partition file name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LogFile {
    pub version: u64,
    pub kind: FileKind,
    pub log: LogKind,
}

impl LogFile {
    #[must_use]
    pub fn base(log: LogKind, version: u64) -> Self {
        Self {
            version,
            kind: FileKind::Base,
            log,
        }
    }

    #[must_use]
    pub fn delta(log: LogKind, version: u64) -> Self {
        Self {
            version,
            kind: FileKind::Delta,
            log,
        }
    }

    /// `<version:05>.<base|delta>.<curly|cueball>`.
    ///
    /// # Errors
    ///
    /// Fails if the version does not fit five digits.
    pub fn file_name(&self) -> Result<String> {
        check_version(self.version)?;
        Ok(format!(
            "{:05}.{}.{}",
            self.version,
            self.kind.as_str(),
            self.log.extension()
        ))
    }

    pub fn path_in(&self, dir: &Path) -> Result<PathBuf> {
        Ok(dir.join(self.file_name()?))
    }

    /// Parses a file name. Anything that is not exactly a partition base or
    /// delta name (temp files, staged output, the lock) yields `None`.
    #[must_use]
    pub fn parse(name: &str) -> Option<Self> {
        let mut parts = name.split('.');
        let version = parts.next()?;
        let kind = parts.next()?;
        let log = parts.next()?;
        if parts.next().is_some() {
            return None;
        }
        if version.len() != 5 || !version.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        let kind = match kind {
            "base" => FileKind::Base,
            "delta" => FileKind::Delta,
            _ => return None,
        };
        Some(Self {
            version: version.parse().ok()?,
            kind,
            log: LogKind::from_extension(log)?,
        })
    }
}

impl fmt::Display for LogFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:05}.{}.{}",
            self.version,
            self.kind.as_str(),
            self.log.extension()
        )
    }
}

fn check_version(version: u64) -> Result<()> {
    if version > MAX_VERSION {
        bail!("version {} exceeds the maximum of {}", version, MAX_VERSION);
    }
    Ok(())
}

/// Name the value-log merge writes to before the commit rename.
pub fn staged_value_name(version: u64) -> Result<String> {
    Ok(format!(
        "{}{}",
        LogFile::base(LogKind::Value, version).file_name()?,
        STAGED_SUFFIX
    ))
}

/// The generation readers should serve.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Generation {
    /// Version of the value-log base; the partition's version.
    pub version: u64,
    /// Version of the index base paired with it (never newer).
    pub index_version: u64,
}

impl Generation {
    pub fn value_path(&self, dir: &Path) -> Result<PathBuf> {
        LogFile::base(LogKind::Value, self.version).path_in(dir)
    }

    pub fn index_path(&self, dir: &Path) -> Result<PathBuf> {
        LogFile::base(LogKind::Index, self.index_version).path_in(dir)
    }
}

/// Snapshot of the partition files present in a directory, sorted by
/// version.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PartitionFiles {
    files: Vec<LogFile>,
}

impl PartitionFiles {
    /// Lists `dir`. A missing directory is an empty partition.
    pub fn scan(dir: &Path) -> io::Result<Self> {
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => return Err(e),
        };
        let mut names = Vec::new();
        for entry in entries {
            let entry = entry?;
            if let Some(name) = entry.file_name().to_str() {
                names.push(name.to_string());
            }
        }
        Ok(Self::from_names(names))
    }

    /// Builds a snapshot from bare names, ignoring anything unparseable.
    pub fn from_names<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut files: Vec<LogFile> = names
            .into_iter()
            .filter_map(|n| LogFile::parse(n.as_ref()))
            .collect();
        files.sort();
        files.dedup();
        Self { files }
    }

    #[must_use]
    pub fn files(&self) -> &[LogFile] {
        &self.files
    }

    #[must_use]
    pub fn contains(&self, file: &LogFile) -> bool {
        self.files.binary_search(file).is_ok()
    }

    fn versions(&self, log: LogKind, kind: FileKind) -> impl Iterator<Item = u64> + '_ {
        self.files
            .iter()
            .filter(move |f| f.log == log && f.kind == kind)
            .map(|f| f.version)
    }

    /// Versions of every base of `log`, ascending.
    pub fn bases(&self, log: LogKind) -> impl Iterator<Item = u64> + '_ {
        self.versions(log, FileKind::Base)
    }

    /// Versions of every delta of `log`, ascending.
    pub fn deltas(&self, log: LogKind) -> impl Iterator<Item = u64> + '_ {
        self.versions(log, FileKind::Delta)
    }

    #[must_use]
    pub fn latest_base(&self, log: LogKind) -> Option<u64> {
        self.bases(log).last()
    }

    #[must_use]
    pub fn latest_base_at_most(&self, log: LogKind, max: u64) -> Option<u64> {
        self.bases(log).filter(|v| *v <= max).last()
    }

    /// Delta versions of `log` in `(after, up_to]`, ascending.
    #[must_use]
    pub fn deltas_between(&self, log: LogKind, after: u64, up_to: u64) -> Vec<u64> {
        self.deltas(log)
            .filter(|v| *v > after && *v <= up_to)
            .collect()
    }

    /// The newest value-log base and the newest index base not newer than
    /// it. Index bases newer than the value base belong to an update that
    /// never reached its commit rename.
    #[must_use]
    pub fn current_generation(&self) -> Option<Generation> {
        let version = self.latest_base(LogKind::Value)?;
        let index_version = self.latest_base_at_most(LogKind::Index, version)?;
        Some(Generation {
            version,
            index_version,
        })
    }
}
