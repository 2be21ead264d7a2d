use std::fs::OpenOptions;
use std::str::FromStr;
use std::sync::{Mutex, OnceLock};

use camino::Utf8PathBuf;
use tracing_subscriber::EnvFilter;

use crate::error::NimbusError;

/// Where log lines go: the console (stderr) or an append-only `.log` file.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum LogDestination {
    #[default]
    Console,
    File(Utf8PathBuf),
}

impl FromStr for LogDestination {
    type Err = NimbusError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim() {
            "stdout" | "stderr" | "console" | "-" => Ok(LogDestination::Console),
            other => {
                let path = Utf8PathBuf::from(other);
                if !path.is_absolute() {
                    return Err(NimbusError::InvalidLogDestination(format!(
                        "log file path must be absolute: {other}"
                    )));
                }
                if path.extension() != Some("log") {
                    return Err(NimbusError::InvalidLogDestination(format!(
                        "log file must end in .log: {other}"
                    )));
                }
                Ok(LogDestination::File(path))
            }
        }
    }
}

static INSTALLED: OnceLock<()> = OnceLock::new();

/// Installs the global subscriber once. Later calls return `Ok(())` without
/// touching the already installed one.
///
/// `RUST_LOG` wins over `default_directive` when set.
pub fn init_logging(destination: &LogDestination, default_directive: &str) -> Result<(), NimbusError> {
    if INSTALLED.get().is_some() {
        return Ok(());
    }
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);

    // A subscriber installed earlier by the host process stays in place.
    match destination {
        LogDestination::Console => {
            let _ = builder.with_writer(std::io::stderr).try_init();
        }
        LogDestination::File(path) => {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent.as_std_path()).map_err(|err| {
                    NimbusError::InvalidLogDestination(format!("create {parent}: {err}"))
                })?;
            }
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path.as_std_path())
                .map_err(|err| NimbusError::InvalidLogDestination(format!("open {path}: {err}")))?;
            let _ = builder
                .with_ansi(false)
                .with_writer(Mutex::new(file))
                .try_init();
        }
    }
    let _ = INSTALLED.set(());
    Ok(())
}
