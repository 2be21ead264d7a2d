use std::collections::{BTreeSet, HashSet};
use std::time::{Duration, Instant};

use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{error, info};

use crate::domain::{Credentials, ExecutionMode, RunMode, SourceLocator, TimeWindow};
use crate::error::{FailureClass, NimbusError};
use crate::fetcher::{FetchPolicy, SkipReason};
use crate::index::PersistedIndex;
use crate::pipeline::{TaskDescriptor, TaskOutcome, TaskPipeline};
use crate::planner::{CandidateSet, Product};
use crate::pool::{self, DEFAULT_WORKERS};
use crate::record::{FieldSchema, MetadataRecord};
use crate::store::StorageLayout;
use crate::transport::RemoteSource;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSettings {
    pub workers: usize,
    pub fetch: FetchPolicy,
}

impl Default for RunSettings {
    fn default() -> Self {
        Self {
            workers: DEFAULT_WORKERS,
            fetch: FetchPolicy::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunRequest {
    pub mode: RunMode,
    pub credentials: Option<Credentials>,
    pub execution: ExecutionMode,
}

impl RunRequest {
    pub fn new(mode: RunMode) -> Self {
        Self {
            mode,
            credentials: None,
            execution: ExecutionMode::Pooled,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    Committed,
    Skipped,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct ItemReport {
    pub source: SourceLocator,
    pub status: ItemStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub final_path: Option<Utf8PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skip_reason: Option<SkipReason>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureClass>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ItemReport {
    fn from_outcome(source: &SourceLocator, outcome: &TaskOutcome) -> Self {
        let mut item = ItemReport {
            source: source.clone(),
            status: ItemStatus::Committed,
            final_path: None,
            skip_reason: None,
            failure: None,
            message: None,
        };
        match outcome {
            TaskOutcome::Committed(record) => {
                item.final_path = Some(record.final_path.clone());
            }
            TaskOutcome::Skipped(reason) => {
                item.status = ItemStatus::Skipped;
                item.skip_reason = Some(*reason);
            }
            TaskOutcome::Failed(failure) => {
                item.status = ItemStatus::Failed;
                item.failure = Some(failure.class());
                item.message = Some(failure.to_string());
            }
        }
        item
    }
}

/// Summary of one run. Produced even when individual items failed.
#[derive(Debug, Clone, Serialize)]
pub struct BatchReport {
    pub mode: &'static str,
    pub window: TimeWindow,
    pub candidates: usize,
    pub new_items: usize,
    pub committed: usize,
    pub skipped: usize,
    pub failed: usize,
    pub items: Vec<ItemReport>,
}

impl BatchReport {
    fn new(mode: &'static str, window: TimeWindow, candidates: usize) -> Self {
        Self {
            mode,
            window,
            candidates,
            new_items: 0,
            committed: 0,
            skipped: 0,
            failed: 0,
            items: Vec::new(),
        }
    }

    fn push(&mut self, item: ItemReport) {
        match item.status {
            ItemStatus::Committed => self.committed += 1,
            ItemStatus::Skipped => self.skipped += 1,
            ItemStatus::Failed => self.failed += 1,
        }
        self.items.push(item);
    }

    pub fn failures(&self) -> impl Iterator<Item = &ItemReport> {
        self.items
            .iter()
            .filter(|item| item.status == ItemStatus::Failed)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct IndexExport {
    pub instance: Utf8PathBuf,
    pub records: Vec<MetadataRecord>,
}

#[derive(Debug, Clone)]
pub struct ProgressEvent {
    pub message: String,
    pub elapsed: Option<Duration>,
}

/// Receives coarse progress from a run. Called from worker threads.
pub trait ProgressSink: Sync {
    fn event(&self, event: ProgressEvent);
}

pub struct DownloadManager<P, S, I> {
    layout: StorageLayout,
    product: P,
    source: S,
    index: I,
    settings: RunSettings,
    schema: FieldSchema,
}

impl<P: Product, S: RemoteSource, I: PersistedIndex> DownloadManager<P, S, I> {
    pub fn new(layout: StorageLayout, product: P, source: S, index: I, settings: RunSettings) -> Self {
        let schema = product.schema();
        Self {
            layout,
            product,
            source,
            index,
            settings,
            schema,
        }
    }

    pub fn layout(&self) -> &StorageLayout {
        &self.layout
    }

    pub fn index(&self) -> &I {
        &self.index
    }

    pub fn settings(&self) -> &RunSettings {
        &self.settings
    }

    /// Candidate set for `window`, with every path resolved under its root.
    pub fn plan(&self, window: &TimeWindow) -> Result<CandidateSet, NimbusError> {
        let planned = self.product.plan(window)?;
        self.layout.resolve(planned)
    }

    pub fn run(
        &self,
        request: &RunRequest,
        sink: &dyn ProgressSink,
    ) -> Result<BatchReport, NimbusError> {
        self.run_at(request, Utc::now(), sink)
    }

    /// Plans, filters and fetches everything new for `request` as of `now`.
    ///
    /// Only input problems and index setup failures are returned as errors.
    /// Per-item failures are logged in submission order and reported in the
    /// [`BatchReport`].
    pub fn run_at(
        &self,
        request: &RunRequest,
        now: DateTime<Utc>,
        sink: &dyn ProgressSink,
    ) -> Result<BatchReport, NimbusError> {
        if request.execution == ExecutionMode::Sequential {
            return Err(NimbusError::UnsupportedExecution("sequential"));
        }
        let window = request.mode.window(now)?;

        info!(mode = request.mode.name(), start = %window.start, end = %window.end, "calculating filenames");
        sink.event(ProgressEvent {
            message: "phase=Plan; calculating filenames".to_string(),
            elapsed: None,
        });
        let candidates = self.plan(&window)?;
        let mut report = BatchReport::new(request.mode.name(), window, candidates.len());

        info!("checking index for already fetched items");
        self.layout.ensure_index_root()?;
        let selectors = candidates.index_selectors().iter().collect::<BTreeSet<_>>();
        for selector in selectors {
            self.index.init(selector, &self.schema)?;
        }
        let tasks = self.new_tasks(candidates, request.credentials.as_ref())?;
        report.new_items = tasks.len();

        info!("found {} new items", tasks.len());
        sink.event(ProgressEvent {
            message: format!(
                "phase=Filter; {} new of {} candidates",
                report.new_items, report.candidates
            ),
            elapsed: None,
        });
        if tasks.is_empty() {
            info!("completed downloading");
            return Ok(report);
        }

        let started = Instant::now();
        let pipeline = TaskPipeline::new(
            &self.source,
            &self.product,
            &self.index,
            &self.settings.fetch,
        );
        let outcomes = pool::run_bounded(&tasks, self.settings.workers, |_, task| {
            let outcome = pipeline.execute(task);
            sink.event(ProgressEvent {
                message: format!("phase=Fetch; done {}", task.source),
                elapsed: Some(started.elapsed()),
            });
            outcome
        });

        for (task, outcome) in tasks.iter().zip(&outcomes) {
            if let TaskOutcome::Failed(failure) = outcome {
                error!(source = %task.source, class = %failure.class(), error = %failure, "error occurred while processing item");
            }
            report.push(ItemReport::from_outcome(&task.source, outcome));
        }

        info!(
            committed = report.committed,
            skipped = report.skipped,
            failed = report.failed,
            "completed downloading"
        );
        sink.event(ProgressEvent {
            message: format!(
                "phase=Done; committed={} skipped={} failed={}",
                report.committed, report.skipped, report.failed
            ),
            elapsed: Some(started.elapsed()),
        });
        Ok(report)
    }

    fn new_tasks(
        &self,
        candidates: CandidateSet,
        credentials: Option<&Credentials>,
    ) -> Result<Vec<TaskDescriptor>, NimbusError> {
        let mut seen = HashSet::new();
        let mut tasks = Vec::new();
        for candidate in candidates.into_candidates() {
            if !seen.insert(candidate.source.clone()) {
                continue;
            }
            if self
                .index
                .exists(&candidate.index_selector, &candidate.source)?
            {
                continue;
            }
            tasks.push(TaskDescriptor {
                source: candidate.source,
                staging: candidate.staging,
                final_path: candidate.final_path,
                index_selector: candidate.index_selector,
                credentials: credentials.cloned(),
            });
        }
        Ok(tasks)
    }

    pub fn list_indexes(&self) -> Result<Vec<Utf8PathBuf>, NimbusError> {
        self.index.list_instances()
    }

    pub fn export_index(&self, instance: &Utf8Path) -> Result<IndexExport, NimbusError> {
        Ok(IndexExport {
            instance: instance.to_path_buf(),
            records: self.index.export(instance)?,
        })
    }

    pub fn export_indexes(&self) -> Result<Vec<IndexExport>, NimbusError> {
        self.list_indexes()?
            .iter()
            .map(|instance| self.export_index(instance))
            .collect()
    }

    /// Removes empty directories left under the staging root.
    pub fn prune_staging(&self) -> Result<usize, NimbusError> {
        self.layout.prune_staging()
    }
}
