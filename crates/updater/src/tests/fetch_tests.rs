use super::*;
use crate::error::TransportError;
use std::cell::RefCell;

fn remote(names: &[&str]) -> PartitionFiles {
    PartitionFiles::from_names(names.iter().copied())
}

fn selected(files: Vec<LogFile>) -> Vec<String> {
    files.iter().map(LogFile::to_string).collect()
}

#[test]
fn fresh_partition_takes_newest_base_at_or_below_target() {
    let remote = remote(&[
        "00001.base.curly",
        "00001.base.cueball",
        "00002.delta.curly",
        "00002.delta.cueball",
        "00003.base.curly",
        "00003.base.cueball",
        "00004.delta.curly",
        "00004.delta.cueball",
        "00005.delta.curly",
        "00005.delta.cueball",
    ]);
    let picked = selected(VersionFileSelector.select(&remote, None, 4));
    assert_eq!(
        picked,
        vec![
            "00003.base.cueball",
            "00003.base.curly",
            "00004.delta.cueball",
            "00004.delta.curly",
        ]
    );
}

#[test]
fn covered_base_is_not_fetched_again() {
    let remote = remote(&[
        "00001.base.curly",
        "00001.base.cueball",
        "00002.delta.curly",
        "00003.delta.curly",
        "00004.delta.curly",
    ]);
    let picked = selected(VersionFileSelector.select(&remote, Some(2), 4));
    assert_eq!(picked, vec!["00003.delta.curly", "00004.delta.curly"]);
}

#[test]
fn newer_remote_base_replaces_stale_local() {
    let remote = remote(&["00003.base.curly", "00004.delta.curly", "00002.delta.curly"]);
    let picked = selected(VersionFileSelector.select(&remote, Some(1), 4));
    assert_eq!(picked, vec!["00003.base.curly", "00004.delta.curly"]);
}

#[test]
fn nothing_to_select_without_any_base() {
    let remote = remote(&["00002.delta.curly"]);
    assert!(VersionFileSelector.select(&remote, None, 2).is_empty());
}

#[test]
fn fetch_copies_missing_files_once() -> Result<()> {
    let fx = Fixture::new()?;
    fx.remote_base(1, &[(1, "a")])?;
    fx.remote_delta(2, &[(2, Some("b"))])?;
    fx.remote_delta(3, &[(3, Some("c"))])?;

    let fetcher = Fetcher::new(LocalFileSource::new(fx.remote(), fx.local()), fx.local());
    let first = fetcher.fetch(None, 2)?;
    assert_eq!(first.len(), 4);
    let after_first = names(fx.local())?;
    assert_eq!(
        after_first,
        vec![
            "00001.base.cueball",
            "00001.base.curly",
            "00002.delta.cueball",
            "00002.delta.curly",
        ]
    );

    let second = fetcher.fetch(None, 2)?;
    assert!(second.is_empty());
    assert_eq!(names(fx.local())?, after_first);
    Ok(())
}

#[test]
fn fetch_skips_files_already_present() -> Result<()> {
    let fx = Fixture::new()?;
    fx.remote_base(1, &[(1, "a")])?;
    fx.local_writer().write_base(1, &base_entries(&[(1, "a")]))?;
    fx.remote_delta(2, &[(2, Some("b"))])?;

    let fetcher = Fetcher::new(LocalFileSource::new(fx.remote(), fx.local()), fx.local());
    let fetched = fetcher.fetch(None, 2)?;
    assert_eq!(fetched, vec!["00002.delta.cueball", "00002.delta.curly"]);
    Ok(())
}

#[test]
fn copy_leaves_no_temp_file() -> Result<()> {
    let fx = Fixture::new()?;
    fx.remote_base(1, &[(1, "a")])?;
    let source = LocalFileSource::new(fx.remote(), fx.local());
    source.copy_to_local("00001.base.curly")?;
    assert_eq!(names(fx.local())?, vec!["00001.base.curly"]);
    assert_eq!(
        fs::read(fx.local().join("00001.base.curly"))?,
        fs::read(fx.remote().join("00001.base.curly"))?
    );
    Ok(())
}

#[test]
fn copy_of_missing_or_escaping_name_fails() -> Result<()> {
    let fx = Fixture::new()?;
    let source = LocalFileSource::new(fx.remote(), fx.local());
    assert!(matches!(
        source.copy_to_local("00009.base.curly"),
        Err(TransportError::NotFound(_))
    ));
    assert!(matches!(
        source.copy_to_local("../remote/x"),
        Err(TransportError::NotFound(_))
    ));
    Ok(())
}

#[test]
fn missing_remote_directory_fails_listing() -> Result<()> {
    let dir = tempdir()?;
    let source = LocalFileSource::new(dir.path().join("gone"), dir.path().join("local"));
    assert!(matches!(source.list_files(), Err(TransportError::List(_))));
    Ok(())
}

/// Serves a fixed listing and fails every copy after the first `ok` ones.
struct FlakySource {
    listing: Vec<String>,
    ok: usize,
    copied: RefCell<Vec<String>>,
    local: std::path::PathBuf,
}

impl FileSource for FlakySource {
    fn list_files(&self) -> Result<Vec<String>, TransportError> {
        Ok(self.listing.clone())
    }

    fn copy_to_local(&self, name: &str) -> Result<(), TransportError> {
        if self.copied.borrow().len() >= self.ok {
            return Err(TransportError::Copy {
                name: name.to_string(),
                source: std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset"),
            });
        }
        fs::create_dir_all(&self.local).map_err(TransportError::List)?;
        fs::write(self.local.join(name), b"").map_err(TransportError::List)?;
        self.copied.borrow_mut().push(name.to_string());
        Ok(())
    }
}

#[test]
fn partial_fetch_keeps_copied_files_and_retry_finishes() -> Result<()> {
    let dir = tempdir()?;
    let local = dir.path().join("local");
    let listing: Vec<String> = ["00001.base.curly", "00001.base.cueball", "00002.delta.curly"]
        .iter()
        .map(|s| s.to_string())
        .collect();

    let flaky = Fetcher::new(
        FlakySource {
            listing: listing.clone(),
            ok: 1,
            copied: RefCell::new(Vec::new()),
            local: local.clone(),
        },
        &local,
    );
    let err = flaky.fetch(None, 2).unwrap_err();
    assert!(matches!(err, TransportError::Copy { .. }));
    assert_eq!(names(&local)?.len(), 1);

    let retry = Fetcher::new(
        FlakySource {
            listing,
            ok: usize::MAX,
            copied: RefCell::new(Vec::new()),
            local: local.clone(),
        },
        &local,
    );
    let fetched = retry.fetch(None, 2)?;
    assert_eq!(fetched.len(), 2);
    assert_eq!(names(&local)?.len(), 3);
    Ok(())
}

#[test]
fn transport_errors_are_retryable_update_errors() {
    let err: UpdateError = TransportError::NotFound("x".into()).into();
    assert!(matches!(err, UpdateError::RemoteUnavailable(_)));
    assert!(err.is_retryable());
    assert!(!err.requires_operator());
    assert_eq!(err.committed_version(), None);
}
