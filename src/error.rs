use std::fmt;

use camino::Utf8PathBuf;
use miette::Diagnostic;
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum NimbusError {
    #[error("invalid run mode: {0}")]
    InvalidMode(String),

    #[error("invalid time window: {0}")]
    InvalidWindow(String),

    #[error("invalid source locator: {0:?}")]
    InvalidLocator(String),

    #[error("invalid credentials: expected \"user:password\"")]
    InvalidCredentials,

    #[error("invalid product name: {0}")]
    InvalidProduct(String),

    #[error("storage root does not exist: {0}")]
    MissingStorageRoot(Utf8PathBuf),

    #[error("expected all {kind} paths under {root}, got {path}")]
    PathOutsideRoot {
        kind: &'static str,
        root: Utf8PathBuf,
        path: Utf8PathBuf,
    },

    #[error("planner produced staging path {0} but no staging root is configured")]
    UnexpectedStaging(Utf8PathBuf),

    #[error("candidate set columns differ in length: {0}")]
    RaggedCandidates(String),

    #[error("invalid log destination: {0}")]
    InvalidLogDestination(String),

    #[error("{0} execution is not supported")]
    #[diagnostic(help("run without --sequential to use the worker pool"))]
    UnsupportedExecution(&'static str),

    #[error("missing config file nimbus-fetch.json")]
    MissingConfig,

    #[error("failed to read config file at {0}")]
    ConfigRead(Utf8PathBuf),

    #[error("failed to parse JSON config: {0}")]
    ConfigParse(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("invalid partition request: {0}")]
    InvalidPartition(String),

    #[error("index instance not initialized: {0}")]
    IndexNotInitialized(Utf8PathBuf),

    #[error("index root does not exist: {0} (has anything been downloaded yet?)")]
    IndexRootMissing(Utf8PathBuf),

    #[error("index {path} is corrupt: {message}")]
    IndexCorrupt { path: Utf8PathBuf, message: String },

    #[error("schema mismatch: {0}")]
    SchemaMismatch(String),

    #[error("post-fetch processing failed: {0}")]
    Processor(String),

    #[error("required tool not found: {0}")]
    MissingTool(String),

    #[error("HTTP client setup failed: {0}")]
    Http(String),

    #[error("filesystem error: {0}")]
    Filesystem(String),
}

impl NimbusError {
    /// True for the errors that reject a run before any work starts.
    pub fn is_input_error(&self) -> bool {
        matches!(
            self,
            NimbusError::InvalidMode(_)
                | NimbusError::InvalidWindow(_)
                | NimbusError::InvalidLocator(_)
                | NimbusError::InvalidCredentials
                | NimbusError::InvalidProduct(_)
                | NimbusError::MissingStorageRoot(_)
                | NimbusError::PathOutsideRoot { .. }
                | NimbusError::UnexpectedStaging(_)
                | NimbusError::RaggedCandidates(_)
                | NimbusError::InvalidLogDestination(_)
                | NimbusError::UnsupportedExecution(_)
                | NimbusError::MissingConfig
                | NimbusError::ConfigRead(_)
                | NimbusError::ConfigParse(_)
                | NimbusError::InvalidConfig(_)
                | NimbusError::InvalidPartition(_)
        )
    }
}

/// Failure of a single fetch, classified for the retry loop.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("remote resource not found: {0}")]
    NotFound(String),

    #[error("remote returned status {status} for {locator}")]
    Status { status: u16, locator: String },

    #[error("request failed: {0}")]
    Http(String),

    #[error("transfer interrupted: {0}")]
    Interrupted(String),

    #[error("remote did not declare a content length for {0}")]
    MissingLength(String),

    #[error("incomplete transfer: expected {expected} bytes, found {actual}")]
    IncompleteTransfer { expected: u64, actual: u64 },

    #[error("filesystem error: {0}")]
    Filesystem(String),

    #[error("giving up after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: Box<FetchError> },

    #[error("destination already exists: {0}")]
    DestinationConflict(Utf8PathBuf),
}

impl FetchError {
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            FetchError::Status { .. }
                | FetchError::Http(_)
                | FetchError::Interrupted(_)
                | FetchError::MissingLength(_)
                | FetchError::IncompleteTransfer { .. }
                | FetchError::Filesystem(_)
        )
    }

    pub fn class(&self) -> FailureClass {
        match self {
            FetchError::NotFound(_) => FailureClass::NotFound,
            FetchError::Exhausted { .. } => FailureClass::Exhausted,
            FetchError::DestinationConflict(_) => FailureClass::DestinationConflict,
            _ => FailureClass::Transient,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    NotFound,
    Transient,
    Exhausted,
    DestinationConflict,
    ProcessorFailure,
    IndexConflict,
    IndexError,
    Filesystem,
    Panicked,
}

impl fmt::Display for FailureClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            FailureClass::NotFound => "not_found",
            FailureClass::Transient => "transient",
            FailureClass::Exhausted => "exhausted",
            FailureClass::DestinationConflict => "destination_conflict",
            FailureClass::ProcessorFailure => "processor_failure",
            FailureClass::IndexConflict => "index_conflict",
            FailureClass::IndexError => "index_error",
            FailureClass::Filesystem => "filesystem",
            FailureClass::Panicked => "panicked",
        };
        f.write_str(label)
    }
}
