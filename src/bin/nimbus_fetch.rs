use std::process::ExitCode;

use camino::Utf8PathBuf;
use chrono::{DateTime, Utc};
use clap::{Args, Parser, Subcommand, ValueEnum};
use miette::IntoDiagnostic;
use tracing::info;

use nimbus_fetch::app::{DownloadManager, RunRequest};
use nimbus_fetch::config::{ConfigLoader, ResolvedConfig};
use nimbus_fetch::domain::{Credentials, ExecutionMode, RunMode};
use nimbus_fetch::error::NimbusError;
use nimbus_fetch::index::JsonlIndex;
use nimbus_fetch::logging::{LogDestination, init_logging};
use nimbus_fetch::output::{JsonOutput, LogSink};
use nimbus_fetch::partition::{AxisValue, PartitionIndex, parse_axis_spec, parse_int_range};
use nimbus_fetch::products::gfs::GfsForecast;
use nimbus_fetch::store::StorageLayout;
use nimbus_fetch::transport::HttpSource;

type Manager = DownloadManager<GfsForecast, HttpSource, JsonlIndex>;

#[derive(Parser)]
#[command(name = "nimbus-fetch")]
#[command(about = "Bulk fetcher for periodic forecast model output")]
#[command(version)]
struct Cli {
    /// Config file (default: ./nimbus-fetch.json, then the user config dir)
    #[arg(long, global = true)]
    config: Option<Utf8PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Fetch everything new for a run mode")]
    Download(DownloadArgs),
    #[command(about = "Print every indexed record as JSON")]
    Export,
    #[command(about = "List index instances")]
    List,
    #[command(about = "Remove empty directories under the staging root")]
    Cleanup,
    #[command(about = "Print one unit of a cartesian-product sweep")]
    Partition(PartitionArgs),
}

#[derive(Clone, Copy, ValueEnum)]
enum ModeArg {
    Latest,
    Monthly,
    Range,
}

#[derive(Args)]
struct DownloadArgs {
    #[arg(long, value_enum)]
    mode: Option<ModeArg>,

    #[arg(long)]
    backfill_hours: Option<i64>,

    #[arg(long)]
    year: Option<i32>,

    #[arg(long)]
    month: Option<u32>,

    /// RFC 3339, e.g. 2022-06-01T00:00:00Z
    #[arg(long)]
    start: Option<DateTime<Utc>>,

    #[arg(long)]
    end: Option<DateTime<Utc>>,

    /// Job-array task id; picks the (year, month) unit of --years, year-major
    #[arg(long, requires = "years", allow_negative_numbers = true)]
    array_task: Option<isize>,

    /// Year span for --array-task, e.g. 2002..=2025
    #[arg(long)]
    years: Option<String>,

    /// user:password
    #[arg(long, env = "NIMBUS_CREDENTIALS", hide_env_values = true)]
    credentials: Option<String>,

    #[arg(long)]
    sequential: bool,

    /// Keep empty staging directories after the run
    #[arg(long)]
    no_cleanup: bool,
}

#[derive(Args)]
struct PartitionArgs {
    /// name=a,b,c | name=lo..hi | name=lo..=hi; repeat for more axes
    #[arg(long = "axis", required = true)]
    axes: Vec<String>,

    /// Negative values count from the end
    #[arg(long, allow_negative_numbers = true)]
    index: isize,
}

fn main() -> ExitCode {
    if let Err(report) = run() {
        eprintln!("{report:?}");
        if let Some(err) = report.downcast_ref::<NimbusError>() {
            return ExitCode::from(map_exit_code(err));
        }
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

fn map_exit_code(error: &NimbusError) -> u8 {
    if error.is_input_error() { 2 } else { 1 }
}

fn run() -> miette::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Partition(args) => {
            init_logging(&LogDestination::Console, "warn")?;
            run_partition(args)
        }
        Commands::Download(args) => {
            let (resolved, manager) = load(cli.config)?;
            run_download(args, &resolved, &manager)
        }
        Commands::Export => {
            let (_, manager) = load(cli.config)?;
            let exports = if manager.layout().index_root().exists() {
                manager.export_indexes()?
            } else {
                Vec::new()
            };
            JsonOutput::print_exports(&exports).into_diagnostic()
        }
        Commands::List => {
            let (_, manager) = load(cli.config)?;
            let instances = manager.list_indexes()?;
            JsonOutput::print_instances(&instances).into_diagnostic()
        }
        Commands::Cleanup => {
            let (_, manager) = load(cli.config)?;
            let removed = manager.prune_staging()?;
            info!(removed, "pruned empty staging directories");
            Ok(())
        }
    }
}

fn load(config: Option<Utf8PathBuf>) -> Result<(ResolvedConfig, Manager), NimbusError> {
    let resolved = ConfigLoader::resolve(config.as_deref())?;
    init_logging(&resolved.log, "info")?;
    let manager = build_manager(&resolved)?;
    Ok((resolved, manager))
}

fn build_manager(resolved: &ResolvedConfig) -> Result<Manager, NimbusError> {
    let layout = StorageLayout::new(resolved.base_dir.clone(), resolved.staging_dir.clone())?;
    let index = JsonlIndex::new(layout.index_root());
    let source = HttpSource::new()?;
    Ok(DownloadManager::new(
        layout,
        resolved.product.clone(),
        source,
        index,
        resolved.settings.clone(),
    ))
}

fn run_download(
    args: DownloadArgs,
    resolved: &ResolvedConfig,
    manager: &Manager,
) -> miette::Result<()> {
    let mode = resolve_mode(&args, resolved.run.clone())?;
    let credentials = args
        .credentials
        .as_deref()
        .map(str::parse::<Credentials>)
        .transpose()?;
    let request = RunRequest {
        mode,
        credentials,
        execution: if args.sequential {
            ExecutionMode::Sequential
        } else {
            ExecutionMode::Pooled
        },
    };

    let report = manager.run(&request, &LogSink)?;
    if !args.no_cleanup {
        manager.prune_staging()?;
    }
    JsonOutput::print_report(&report).into_diagnostic()
}

fn resolve_mode(args: &DownloadArgs, default: Option<RunMode>) -> Result<RunMode, NimbusError> {
    if let Some(task) = args.array_task {
        let years = args.years.as_deref().unwrap_or_default();
        let years = parse_int_range(years)?.ok_or_else(|| {
            NimbusError::InvalidPartition(format!("--years must be a range, got {years:?}"))
        })?;
        let sweep = PartitionIndex::new()
            .axis("year", years)
            .axis("month", 1..=12i64);
        let unit = sweep.at(task).ok_or_else(|| {
            NimbusError::InvalidPartition(format!("task {task} is outside {sweep}"))
        })?;
        let year = unit.get("year").and_then(AxisValue::as_int);
        let month = unit.get("month").and_then(AxisValue::as_int);
        return match (year, month) {
            (Some(year), Some(month)) => Ok(RunMode::Monthly {
                year: i32::try_from(year)
                    .map_err(|_| NimbusError::InvalidMode(format!("year out of range: {year}")))?,
                month: u32::try_from(month)
                    .map_err(|_| NimbusError::InvalidMode(format!("month out of range: {month}")))?,
            }),
            _ => Err(NimbusError::InvalidPartition(format!("task {task} has no year/month"))),
        };
    }

    let missing = |mode: &str, flags: &str| {
        NimbusError::InvalidMode(format!("--mode {mode} requires {flags}"))
    };
    match args.mode {
        Some(ModeArg::Latest) => {
            let hours = args
                .backfill_hours
                .ok_or_else(|| missing("latest", "--backfill-hours"))?;
            RunMode::latest(hours)
        }
        Some(ModeArg::Monthly) => match (args.year, args.month) {
            (Some(year), Some(month)) => Ok(RunMode::Monthly { year, month }),
            _ => Err(missing("monthly", "--year and --month")),
        },
        Some(ModeArg::Range) => match (args.start, args.end) {
            (Some(start), Some(end)) => Ok(RunMode::Range { start, end }),
            _ => Err(missing("range", "--start and --end")),
        },
        None => default.ok_or_else(|| {
            NimbusError::InvalidMode("no --mode given and the config has no default run".to_string())
        }),
    }
}

fn run_partition(args: PartitionArgs) -> miette::Result<()> {
    let mut sweep = PartitionIndex::new();
    for spec in &args.axes {
        let (name, values) = parse_axis_spec(spec)?;
        sweep = sweep.axis(&name, values);
    }
    let len = sweep.len();
    let unit = sweep.at(args.index).ok_or_else(|| {
        NimbusError::InvalidPartition(format!("index {} is outside {sweep}", args.index))
    })?;
    let index = if args.index < 0 {
        len - args.index.unsigned_abs()
    } else {
        args.index.unsigned_abs()
    };
    JsonOutput::print_partition(index, &unit).into_diagnostic()
}
