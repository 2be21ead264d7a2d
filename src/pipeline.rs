use std::fs;
use std::panic::{self, AssertUnwindSafe};

use camino::{Utf8Path, Utf8PathBuf};
use thiserror::Error;
use tracing::{debug, info};

use crate::domain::{Credentials, SourceLocator};
use crate::error::{FailureClass, FetchError};
use crate::fetcher::{FetchPolicy, FetchStatus, Fetcher, SkipReason};
use crate::fs_util;
use crate::index::{InsertOutcome, PersistedIndex};
use crate::planner::PostFetchProcessor;
use crate::record::MetadataRecord;
use crate::transport::RemoteSource;

/// One candidate item, owned by the worker that executes it.
#[derive(Debug, Clone)]
pub struct TaskDescriptor {
    pub source: SourceLocator,
    pub staging: Option<Utf8PathBuf>,
    pub final_path: Utf8PathBuf,
    pub index_selector: Utf8PathBuf,
    pub credentials: Option<Credentials>,
}

impl TaskDescriptor {
    /// Where the fetcher writes: the staging path, or the final path when there is none.
    pub fn fetch_destination(&self) -> &Utf8Path {
        self.staging.as_deref().unwrap_or(&self.final_path)
    }
}

#[derive(Debug, Error)]
pub enum TaskFailure {
    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error("processor failed: {0}")]
    Processor(String),

    #[error("processor returned a record that does not match the task: {0}")]
    RecordMismatch(String),

    #[error("index already holds {0}")]
    IndexConflict(SourceLocator),

    #[error("index insert failed: {0}")]
    Index(String),

    #[error("filesystem error: {0}")]
    Filesystem(String),

    #[error("task panicked: {0}")]
    Panicked(String),
}

impl TaskFailure {
    pub fn class(&self) -> FailureClass {
        match self {
            TaskFailure::Fetch(err) => err.class(),
            TaskFailure::Processor(_) | TaskFailure::RecordMismatch(_) => {
                FailureClass::ProcessorFailure
            }
            TaskFailure::IndexConflict(_) => FailureClass::IndexConflict,
            TaskFailure::Index(_) => FailureClass::IndexError,
            TaskFailure::Filesystem(_) => FailureClass::Filesystem,
            TaskFailure::Panicked(_) => FailureClass::Panicked,
        }
    }
}

#[derive(Debug)]
pub enum TaskOutcome {
    Committed(MetadataRecord),
    Skipped(SkipReason),
    Failed(TaskFailure),
}

impl TaskOutcome {
    pub fn is_failed(&self) -> bool {
        matches!(self, TaskOutcome::Failed(_))
    }
}

/// Fetch, process, record: the unit of work for one candidate.
pub struct TaskPipeline<'a, S: ?Sized, P: ?Sized, I: ?Sized> {
    source: &'a S,
    processor: &'a P,
    index: &'a I,
    policy: &'a FetchPolicy,
}

impl<'a, S, P, I> TaskPipeline<'a, S, P, I>
where
    S: RemoteSource + ?Sized,
    P: PostFetchProcessor + ?Sized,
    I: PersistedIndex + ?Sized,
{
    pub fn new(source: &'a S, processor: &'a P, index: &'a I, policy: &'a FetchPolicy) -> Self {
        Self {
            source,
            processor,
            index,
            policy,
        }
    }

    /// Runs the task to an outcome. Never panics and never returns an error:
    /// every failure is reduced to [`TaskOutcome::Failed`].
    pub fn execute(&self, task: &TaskDescriptor) -> TaskOutcome {
        match panic::catch_unwind(AssertUnwindSafe(|| self.run(task))) {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(failure)) => TaskOutcome::Failed(failure),
            Err(payload) => {
                let message = payload
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                TaskOutcome::Failed(TaskFailure::Panicked(message))
            }
        }
    }

    fn run(&self, task: &TaskDescriptor) -> Result<TaskOutcome, TaskFailure> {
        let destination = task.fetch_destination();
        fs_util::ensure_parent(destination)
            .map_err(|err| TaskFailure::Filesystem(err.to_string()))?;

        if task.staging.is_some() && task.final_path.as_std_path().exists() {
            if !self.policy.exist_ok {
                return Err(FetchError::DestinationConflict(task.final_path.clone()).into());
            }
            return Ok(TaskOutcome::Skipped(SkipReason::AlreadyPresent));
        }

        let fetcher = Fetcher::new(self.source, self.policy);
        match fetcher.fetch(&task.source, task.credentials.as_ref(), destination)? {
            FetchStatus::Skipped(reason) => return Ok(TaskOutcome::Skipped(reason)),
            FetchStatus::Committed { bytes, attempts } => {
                debug!(source = %task.source, bytes, attempts, "fetched");
            }
        }

        let record = self
            .processor
            .process(&task.source, task.staging.as_deref(), &task.final_path)
            .map_err(|err| TaskFailure::Processor(err.to_string()))?;
        check_record(task, &record)?;

        match self.index.insert(&task.index_selector, &record) {
            Ok(InsertOutcome::Inserted) => {
                info!(source = %task.source, path = %record.final_path, "committed");
                Ok(TaskOutcome::Committed(record))
            }
            Ok(InsertOutcome::Conflict) => Err(TaskFailure::IndexConflict(task.source.clone())),
            Err(err) => Err(TaskFailure::Index(err.to_string())),
        }
    }
}

fn check_record(task: &TaskDescriptor, record: &MetadataRecord) -> Result<(), TaskFailure> {
    if record.source_locator != task.source {
        return Err(TaskFailure::RecordMismatch(format!(
            "source {} != {}",
            record.source_locator, task.source
        )));
    }
    if record.final_path != task.final_path {
        return Err(TaskFailure::RecordMismatch(format!(
            "final path {} != {}",
            record.final_path, task.final_path
        )));
    }
    let on_disk = fs::metadata(record.final_path.as_std_path())
        .map_err(|err| TaskFailure::RecordMismatch(format!("{}: {err}", record.final_path)))?
        .len();
    if on_disk != record.byte_size {
        return Err(TaskFailure::RecordMismatch(format!(
            "byte_size {} but {} holds {on_disk} bytes",
            record.byte_size, record.final_path
        )));
    }
    Ok(())
}
