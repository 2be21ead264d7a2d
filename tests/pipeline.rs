mod common;

use std::fs;
use std::time::Duration;

use assert_matches::assert_matches;
use camino::{Utf8Path, Utf8PathBuf};

use nimbus_fetch::domain::SourceLocator;
use nimbus_fetch::error::{FailureClass, NimbusError};
use nimbus_fetch::fetcher::{FetchPolicy, SkipReason};
use nimbus_fetch::index::{JsonlIndex, PersistedIndex};
use nimbus_fetch::pipeline::{TaskDescriptor, TaskFailure, TaskOutcome, TaskPipeline};
use nimbus_fetch::planner::PostFetchProcessor;
use nimbus_fetch::record::{FieldSchema, MetadataRecord};

use common::{FixedProduct, Reply, ScriptedSource, utf8_dir};

struct Workspace {
    _dir: tempfile::TempDir,
    root: Utf8PathBuf,
    index: JsonlIndex,
    selector: Utf8PathBuf,
}

impl Workspace {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let root = utf8_dir(&dir);
        let index = JsonlIndex::new(root.join("database"));
        let selector = root.join("database/2022_06.jsonl");
        index.init(&selector, &FieldSchema::core()).unwrap();
        Self {
            _dir: dir,
            root,
            index,
            selector,
        }
    }

    fn task(&self, name: &str, staged: bool) -> TaskDescriptor {
        TaskDescriptor {
            source: format!("https://mock.example/{name}").parse().unwrap(),
            staging: staged.then(|| self.root.join("staging").join(name)),
            final_path: self.root.join("data").join(format!("{name}.nc")),
            index_selector: self.selector.clone(),
            credentials: None,
        }
    }

    fn records(&self) -> Vec<MetadataRecord> {
        self.index.export(&self.selector).unwrap()
    }
}

fn policy() -> FetchPolicy {
    FetchPolicy {
        max_attempts: 3,
        backoff: Duration::ZERO,
        ..FetchPolicy::default()
    }
}

struct FailingProcessor;

impl PostFetchProcessor for FailingProcessor {
    fn process(
        &self,
        _source: &SourceLocator,
        _staging: Option<&Utf8Path>,
        _final_path: &Utf8Path,
    ) -> Result<MetadataRecord, NimbusError> {
        Err(NimbusError::Processor("corrupt grib message".to_string()))
    }
}

struct PanickingProcessor;

impl PostFetchProcessor for PanickingProcessor {
    fn process(
        &self,
        _source: &SourceLocator,
        _staging: Option<&Utf8Path>,
        _final_path: &Utf8Path,
    ) -> Result<MetadataRecord, NimbusError> {
        panic!("processor bug");
    }
}

#[test]
fn staged_item_is_moved_processed_and_indexed() {
    let ws = Workspace::new();
    let task = ws.task("a.grib2", true);
    let source =
        ScriptedSource::new().script(task.source.as_str(), vec![Reply::Body(b"abc".to_vec())]);
    let product = FixedProduct::new(Vec::new());
    let policy = policy();

    let outcome = TaskPipeline::new(&source, &product, &ws.index, &policy).execute(&task);

    let record = assert_matches!(outcome, TaskOutcome::Committed(record) => record);
    assert_eq!(record.byte_size, 3);
    assert_eq!(record.final_path, task.final_path);
    assert!(task.final_path.exists());
    assert!(!task.staging.as_ref().unwrap().exists());
    assert_eq!(ws.records(), vec![record]);
}

#[test]
fn missing_remote_skips_without_processing_or_indexing() {
    let ws = Workspace::new();
    let task = ws.task("missing.grib2", true);
    let source = ScriptedSource::new();
    let product = FixedProduct::new(Vec::new());
    let policy = policy();

    let outcome = TaskPipeline::new(&source, &product, &ws.index, &policy).execute(&task);

    assert_matches!(outcome, TaskOutcome::Skipped(SkipReason::NotFound));
    assert_eq!(product.processed(), 0);
    assert!(ws.records().is_empty());
}

#[test]
fn exhausted_fetch_records_nothing() {
    let ws = Workspace::new();
    let task = ws.task("short.grib2", false);
    let source = ScriptedSource::new().script(
        task.source.as_str(),
        vec![Reply::Short {
            declared: 64,
            body: b"short".to_vec(),
        }],
    );
    let product = FixedProduct::new(Vec::new());
    let policy = policy();

    let outcome = TaskPipeline::new(&source, &product, &ws.index, &policy).execute(&task);

    let failure = assert_matches!(outcome, TaskOutcome::Failed(failure) => failure);
    assert_eq!(failure.class(), FailureClass::Exhausted);
    assert_eq!(source.calls(task.source.as_str()), 3);
    assert_eq!(product.processed(), 0);
    assert!(ws.records().is_empty());
    assert!(!task.final_path.exists());
}

#[test]
fn processor_failure_is_not_retried() {
    let ws = Workspace::new();
    let task = ws.task("bad.grib2", true);
    let source =
        ScriptedSource::new().script(task.source.as_str(), vec![Reply::Body(b"abc".to_vec())]);
    let policy = policy();

    let outcome = TaskPipeline::new(&source, &FailingProcessor, &ws.index, &policy).execute(&task);

    let failure = assert_matches!(outcome, TaskOutcome::Failed(failure) => failure);
    assert_matches!(failure, TaskFailure::Processor(_));
    assert_eq!(failure.class(), FailureClass::ProcessorFailure);
    assert_eq!(source.calls(task.source.as_str()), 1);
    assert!(ws.records().is_empty());
}

#[test]
fn processor_panic_becomes_failed_outcome() {
    let ws = Workspace::new();
    let task = ws.task("boom.grib2", true);
    let source =
        ScriptedSource::new().script(task.source.as_str(), vec![Reply::Body(b"abc".to_vec())]);
    let policy = policy();

    let outcome =
        TaskPipeline::new(&source, &PanickingProcessor, &ws.index, &policy).execute(&task);

    let failure = assert_matches!(outcome, TaskOutcome::Failed(failure) => failure);
    assert_eq!(failure.class(), FailureClass::Panicked);
    assert!(failure.to_string().contains("processor bug"));
}

#[test]
fn occupied_final_path_conflicts_before_fetching() {
    let ws = Workspace::new();
    let task = ws.task("dup.grib2", true);
    fs::create_dir_all(ws.root.join("data")).unwrap();
    fs::write(&task.final_path, b"kept").unwrap();
    let source =
        ScriptedSource::new().script(task.source.as_str(), vec![Reply::Body(b"abc".to_vec())]);
    let product = FixedProduct::new(Vec::new());
    let policy = policy();

    let outcome = TaskPipeline::new(&source, &product, &ws.index, &policy).execute(&task);

    let failure = assert_matches!(outcome, TaskOutcome::Failed(failure) => failure);
    assert_eq!(failure.class(), FailureClass::DestinationConflict);
    assert_eq!(source.total_calls(), 0);
    assert_eq!(fs::read(&task.final_path).unwrap(), b"kept");
}

#[test]
fn second_insert_of_same_locator_conflicts() {
    let ws = Workspace::new();
    let first = ws.task("same.grib2", false);
    let mut second = ws.task("same.grib2", false);
    second.final_path = ws.root.join("data/other.nc");
    let source =
        ScriptedSource::new().script(first.source.as_str(), vec![Reply::Body(b"abc".to_vec())]);
    let product = FixedProduct::new(Vec::new());
    let policy = policy();
    let pipeline = TaskPipeline::new(&source, &product, &ws.index, &policy);

    assert_matches!(pipeline.execute(&first), TaskOutcome::Committed(_));
    let failure = assert_matches!(pipeline.execute(&second), TaskOutcome::Failed(failure) => failure);
    assert_eq!(failure.class(), FailureClass::IndexConflict);
    assert_eq!(ws.records().len(), 1);
}
