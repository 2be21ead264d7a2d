use std::io::{self, Write};

use camino::Utf8PathBuf;
use serde::Serialize;
use tracing::{debug, info};

use crate::app::{BatchReport, IndexExport, ProgressEvent, ProgressSink};
use crate::partition::Partition;

pub struct JsonOutput;

impl JsonOutput {
    pub fn print_report(report: &BatchReport) -> io::Result<()> {
        Self::print_json(report)
    }

    pub fn print_exports(exports: &[IndexExport]) -> io::Result<()> {
        Self::print_json(&exports)
    }

    pub fn print_instances(instances: &[Utf8PathBuf]) -> io::Result<()> {
        Self::print_json(&instances)
    }

    pub fn print_partition(index: usize, partition: &Partition) -> io::Result<()> {
        #[derive(Serialize)]
        struct Unit<'a> {
            index: usize,
            partition: &'a Partition,
        }
        Self::print_json(&Unit { index, partition })
    }

    fn print_json<T: Serialize + ?Sized>(value: &T) -> io::Result<()> {
        let json = serde_json::to_string_pretty(value).map_err(io::Error::other)?;
        let mut stdout = io::stdout();
        stdout.write_all(json.as_bytes())?;
        stdout.write_all(b"\n")?;
        Ok(())
    }
}

/// Drops progress events; for library callers that only want the report.
pub struct NoProgress;

impl ProgressSink for NoProgress {
    fn event(&self, _event: ProgressEvent) {}
}

/// Forwards progress events to `tracing`.
pub struct LogSink;

impl ProgressSink for LogSink {
    fn event(&self, event: ProgressEvent) {
        match event.elapsed {
            Some(elapsed) => debug!(elapsed_ms = elapsed.as_millis() as u64, "{}", event.message),
            None => info!("{}", event.message),
        }
    }
}
