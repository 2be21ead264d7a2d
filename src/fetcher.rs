use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::thread;
use std::time::Duration;

use camino::Utf8Path;
use serde::Serialize;
use tracing::{debug, error, trace, warn};

use crate::domain::{Credentials, SourceLocator};
use crate::error::FetchError;
use crate::fs_util::partial_path;
use crate::transport::RemoteSource;

pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;
pub const DEFAULT_BACKOFF: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchPolicy {
    /// Total requests made for one item before giving up.
    pub max_attempts: u32,
    pub backoff: Duration,
    /// A missing remote resource is a skip rather than a failure.
    pub tolerate_not_found: bool,
    /// An occupied destination is a skip rather than a failure. Never overwrites.
    pub exist_ok: bool,
}

impl Default for FetchPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            backoff: DEFAULT_BACKOFF,
            tolerate_not_found: true,
            exist_ok: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    NotFound,
    AlreadyPresent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchStatus {
    Committed { bytes: u64, attempts: u32 },
    Skipped(SkipReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FetchState {
    Requesting,
    Transferring,
    Verifying,
    Committed,
}

/// Retry loop around a single download that is only ever visible under its
/// final name once complete.
///
/// Bytes land in `<destination>.partial_` first. After the transfer the on-disk
/// size is compared to the length the remote declared up front, and only a
/// match is renamed into place. A mismatch is transient and triggers a full
/// re-fetch; there is no range resume.
pub struct Fetcher<'a, S: ?Sized> {
    source: &'a S,
    policy: &'a FetchPolicy,
}

impl<'a, S: RemoteSource + ?Sized> Fetcher<'a, S> {
    pub fn new(source: &'a S, policy: &'a FetchPolicy) -> Self {
        Self { source, policy }
    }

    pub fn fetch(
        &self,
        locator: &SourceLocator,
        credentials: Option<&Credentials>,
        destination: &Utf8Path,
    ) -> Result<FetchStatus, FetchError> {
        if destination.as_std_path().exists() {
            if !self.policy.exist_ok {
                return Err(FetchError::DestinationConflict(destination.to_path_buf()));
            }
            warn!(%destination, "destination already exists; leaving it untouched");
            return Ok(FetchStatus::Skipped(SkipReason::AlreadyPresent));
        }

        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.attempt(locator, credentials, destination) {
                Ok(bytes) => {
                    return Ok(FetchStatus::Committed {
                        bytes,
                        attempts: attempt,
                    });
                }
                Err(FetchError::NotFound(_)) if self.policy.tolerate_not_found => {
                    warn!(%locator, "remote resource does not exist; skipping");
                    return Ok(FetchStatus::Skipped(SkipReason::NotFound));
                }
                Err(err) if err.is_transient() && attempt < max_attempts => {
                    warn!(%locator, attempt, max_attempts, error = %err, "fetch attempt failed; retrying");
                    thread::sleep(self.policy.backoff);
                }
                Err(err) if err.is_transient() => {
                    error!(%locator, attempt, max_attempts, error = %err, "fetch attempts exhausted");
                    return Err(FetchError::Exhausted {
                        attempts: attempt,
                        last: Box::new(err),
                    });
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn attempt(
        &self,
        locator: &SourceLocator,
        credentials: Option<&Credentials>,
        destination: &Utf8Path,
    ) -> Result<u64, FetchError> {
        trace!(%locator, state = ?FetchState::Requesting);
        let payload = self.source.open(locator, credentials)?;
        let expected = payload
            .declared_len
            .ok_or_else(|| FetchError::MissingLength(locator.to_string()))?;

        trace!(%locator, state = ?FetchState::Transferring, expected);
        let partial = partial_path(destination);
        let file = File::create(partial.as_std_path())
            .map_err(|err| FetchError::Filesystem(format!("create {partial}: {err}")))?;
        let mut writer = BufWriter::new(file);
        let mut body = payload.body;
        io::copy(&mut body, &mut writer).map_err(|err| FetchError::Interrupted(err.to_string()))?;
        writer
            .flush()
            .map_err(|err| FetchError::Filesystem(format!("write {partial}: {err}")))?;
        writer
            .get_ref()
            .sync_all()
            .map_err(|err| FetchError::Filesystem(format!("sync {partial}: {err}")))?;
        drop(writer);

        trace!(%locator, state = ?FetchState::Verifying);
        let actual = fs::metadata(partial.as_std_path())
            .map_err(|err| FetchError::Filesystem(format!("stat {partial}: {err}")))?
            .len();
        if actual != expected {
            return Err(FetchError::IncompleteTransfer { expected, actual });
        }

        fs::rename(partial.as_std_path(), destination.as_std_path())
            .map_err(|err| FetchError::Filesystem(format!("rename {partial}: {err}")))?;
        debug!(%locator, %destination, bytes = actual, state = ?FetchState::Committed);
        Ok(actual)
    }
}
