mod common;

use std::fs;
use std::time::Duration;

use assert_matches::assert_matches;
use camino::Utf8PathBuf;

use nimbus_fetch::domain::{Credentials, SourceLocator};
use nimbus_fetch::error::{FailureClass, FetchError};
use nimbus_fetch::fetcher::{FetchPolicy, FetchStatus, Fetcher, SkipReason};
use nimbus_fetch::fs_util::partial_path;

use common::{Reply, ScriptedSource, utf8_dir};

const URL: &str = "https://mock.example/gfs.t00z.pgrb2.0p25.f000";

fn policy() -> FetchPolicy {
    FetchPolicy {
        backoff: Duration::ZERO,
        ..FetchPolicy::default()
    }
}

fn locator() -> SourceLocator {
    URL.parse().unwrap()
}

fn destination(dir: &tempfile::TempDir) -> Utf8PathBuf {
    utf8_dir(dir).join("f000.grib2")
}

#[test]
fn commits_under_final_name_only() {
    let dir = tempfile::tempdir().unwrap();
    let dest = destination(&dir);
    let source = ScriptedSource::new().script(URL, vec![Reply::Body(b"grib-bytes".to_vec())]);
    let policy = policy();

    let status = Fetcher::new(&source, &policy)
        .fetch(&locator(), None, &dest)
        .unwrap();

    assert_eq!(status, FetchStatus::Committed { bytes: 10, attempts: 1 });
    assert_eq!(fs::read(&dest).unwrap(), b"grib-bytes");
    assert!(!partial_path(&dest).exists());
}

#[test]
fn not_found_is_skipped_when_tolerated() {
    let dir = tempfile::tempdir().unwrap();
    let dest = destination(&dir);
    let source = ScriptedSource::new();
    let policy = policy();

    let status = Fetcher::new(&source, &policy)
        .fetch(&locator(), None, &dest)
        .unwrap();

    assert_eq!(status, FetchStatus::Skipped(SkipReason::NotFound));
    assert_eq!(source.calls(URL), 1);
    assert!(!dest.exists());
}

#[test]
fn not_found_fails_without_tolerance() {
    let dir = tempfile::tempdir().unwrap();
    let source = ScriptedSource::new();
    let policy = FetchPolicy {
        tolerate_not_found: false,
        ..policy()
    };

    let err = Fetcher::new(&source, &policy)
        .fetch(&locator(), None, &destination(&dir))
        .unwrap_err();

    assert_eq!(err.class(), FailureClass::NotFound);
    assert_eq!(source.calls(URL), 1);
}

#[test]
fn size_mismatch_is_retried_exactly_max_attempts_times() {
    let dir = tempfile::tempdir().unwrap();
    let dest = destination(&dir);
    let source = ScriptedSource::new().script(
        URL,
        vec![Reply::Short {
            declared: 100,
            body: b"truncated".to_vec(),
        }],
    );
    let policy = FetchPolicy {
        max_attempts: 3,
        ..policy()
    };

    let err = Fetcher::new(&source, &policy)
        .fetch(&locator(), None, &dest)
        .unwrap_err();

    assert_matches!(&err, FetchError::Exhausted { attempts: 3, last } => {
        assert_matches!(**last, FetchError::IncompleteTransfer { expected: 100, actual: 9 });
    });
    assert_eq!(err.class(), FailureClass::Exhausted);
    assert_eq!(source.calls(URL), 3);
    assert!(!dest.exists());
}

#[test]
fn interrupted_transfer_leaves_only_partial_file() {
    let dir = tempfile::tempdir().unwrap();
    let dest = destination(&dir);
    let source = ScriptedSource::new().script(URL, vec![Reply::Broken(vec![7; 4096])]);
    let policy = FetchPolicy {
        max_attempts: 1,
        ..policy()
    };

    let err = Fetcher::new(&source, &policy)
        .fetch(&locator(), None, &dest)
        .unwrap_err();

    assert_matches!(err, FetchError::Exhausted { attempts: 1, .. });
    assert!(!dest.exists());
    assert!(partial_path(&dest).exists());
}

#[test]
fn transient_failures_recover_before_exhaustion() {
    let dir = tempfile::tempdir().unwrap();
    let dest = destination(&dir);
    let source = ScriptedSource::new().script(
        URL,
        vec![
            Reply::Status(503),
            Reply::NoLength(b"data".to_vec()),
            Reply::Body(b"data".to_vec()),
        ],
    );
    let policy = policy();

    let status = Fetcher::new(&source, &policy)
        .fetch(&locator(), None, &dest)
        .unwrap();

    assert_eq!(status, FetchStatus::Committed { bytes: 4, attempts: 3 });
    assert_eq!(source.calls(URL), 3);
}

#[test]
fn occupied_destination_is_never_overwritten() {
    let dir = tempfile::tempdir().unwrap();
    let dest = destination(&dir);
    fs::write(&dest, b"earlier run").unwrap();
    let source = ScriptedSource::new().script(URL, vec![Reply::Body(b"new".to_vec())]);

    let strict = policy();
    let err = Fetcher::new(&source, &strict)
        .fetch(&locator(), None, &dest)
        .unwrap_err();
    assert_matches!(err, FetchError::DestinationConflict(path) if path == dest);

    let lenient = FetchPolicy {
        exist_ok: true,
        ..policy()
    };
    let status = Fetcher::new(&source, &lenient)
        .fetch(&locator(), None, &dest)
        .unwrap();
    assert_eq!(status, FetchStatus::Skipped(SkipReason::AlreadyPresent));

    assert_eq!(source.total_calls(), 0);
    assert_eq!(fs::read(&dest).unwrap(), b"earlier run");
}

#[test]
fn credentials_reach_the_source() {
    let dir = tempfile::tempdir().unwrap();
    let source = ScriptedSource::new().script(URL, vec![Reply::Body(b"x".to_vec())]);
    let policy = policy();
    let creds: Credentials = "earthdata:secret".parse().unwrap();

    Fetcher::new(&source, &policy)
        .fetch(&locator(), Some(&creds), &destination(&dir))
        .unwrap();

    assert_eq!(source.seen_users(), vec![Some("earthdata".to_string())]);
}
