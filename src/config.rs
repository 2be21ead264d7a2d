use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Utc};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};

use crate::app::RunSettings;
use crate::domain::RunMode;
use crate::error::NimbusError;
use crate::fetcher::{DEFAULT_BACKOFF, DEFAULT_MAX_ATTEMPTS, FetchPolicy};
use crate::logging::LogDestination;
use crate::pool::DEFAULT_WORKERS;
use crate::products::gfs::{DEFAULT_BASE_URL, DEFAULT_ISSUE_HOURS, DEFAULT_MAX_HORIZON, GfsForecast, Region};

pub const CONFIG_FILE_NAME: &str = "nimbus-fetch.json";

#[derive(Debug, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub schema_version: Option<u32>,
    pub base_dir: Utf8PathBuf,
    #[serde(default)]
    pub staging_dir: Option<Utf8PathBuf>,
    #[serde(default)]
    pub log: Option<String>,
    #[serde(default)]
    pub workers: Option<usize>,
    #[serde(default)]
    pub max_attempts: Option<u32>,
    #[serde(default)]
    pub backoff_secs: Option<u64>,
    #[serde(default)]
    pub tolerate_not_found: Option<bool>,
    #[serde(default)]
    pub exist_ok: Option<bool>,
    #[serde(default)]
    pub run: Option<RunModeConfig>,
    #[serde(default)]
    pub product: Option<ProductConfig>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum RunModeConfig {
    Latest { backfill_hours: i64 },
    Monthly { year: i32, month: u32 },
    Range { start: DateTime<Utc>, end: DateTime<Utc> },
}

impl RunModeConfig {
    pub fn into_run_mode(self) -> Result<RunMode, NimbusError> {
        Ok(match self {
            RunModeConfig::Latest { backfill_hours } => RunMode::latest(backfill_hours)?,
            RunModeConfig::Monthly { year, month } => RunMode::Monthly { year, month },
            RunModeConfig::Range { start, end } => RunMode::Range { start, end },
        })
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProductConfig {
    Gfs(GfsConfig),
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct GfsConfig {
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub issue_hours: Option<Vec<u32>>,
    #[serde(default)]
    pub horizons: Option<Vec<u32>>,
    #[serde(default)]
    pub variables: Vec<String>,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub wgrib2: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub schema_version: u32,
    pub base_dir: Utf8PathBuf,
    pub staging_dir: Option<Utf8PathBuf>,
    pub log: LogDestination,
    pub settings: RunSettings,
    pub run: Option<RunMode>,
    pub product: GfsForecast,
}

pub struct ConfigLoader;

impl ConfigLoader {
    /// Loads `path`, else `./nimbus-fetch.json`, else the per-user config file.
    pub fn resolve(path: Option<&Utf8Path>) -> Result<ResolvedConfig, NimbusError> {
        let config_path = match path {
            Some(path) => path.to_path_buf(),
            None => Self::default_path().ok_or(NimbusError::MissingConfig)?,
        };

        let content = fs::read_to_string(config_path.as_std_path())
            .map_err(|_| NimbusError::ConfigRead(config_path.clone()))?;
        let config: Config = serde_json::from_str(&content)
            .map_err(|err| NimbusError::ConfigParse(err.to_string()))?;

        Self::resolve_config(config)
    }

    fn default_path() -> Option<Utf8PathBuf> {
        let local = Utf8PathBuf::from(CONFIG_FILE_NAME);
        if local.exists() {
            return Some(local);
        }
        let dirs = ProjectDirs::from("", "", "nimbus-fetch")?;
        let user = Utf8PathBuf::from_path_buf(dirs.config_dir().join("config.json")).ok()?;
        user.exists().then_some(user)
    }

    pub fn resolve_config(config: Config) -> Result<ResolvedConfig, NimbusError> {
        let schema_version = config.schema_version.unwrap_or(1);
        if schema_version != 1 {
            return Err(NimbusError::InvalidConfig(format!(
                "unsupported schema_version {schema_version}"
            )));
        }

        let log = match config.log.as_deref() {
            Some(value) => value.parse()?,
            None => LogDestination::Console,
        };

        let workers = config.workers.unwrap_or(DEFAULT_WORKERS);
        if workers == 0 {
            return Err(NimbusError::InvalidConfig("workers must be at least 1".to_string()));
        }
        let max_attempts = config.max_attempts.unwrap_or(DEFAULT_MAX_ATTEMPTS);
        if max_attempts == 0 {
            return Err(NimbusError::InvalidConfig(
                "max_attempts must be at least 1".to_string(),
            ));
        }
        let defaults = FetchPolicy::default();
        let settings = RunSettings {
            workers,
            fetch: FetchPolicy {
                max_attempts,
                backoff: config
                    .backoff_secs
                    .map(Duration::from_secs)
                    .unwrap_or(DEFAULT_BACKOFF),
                tolerate_not_found: config
                    .tolerate_not_found
                    .unwrap_or(defaults.tolerate_not_found),
                exist_ok: config.exist_ok.unwrap_or(defaults.exist_ok),
            },
        };

        let product = match config.product {
            Some(ProductConfig::Gfs(gfs)) => resolve_gfs(gfs)?,
            None => resolve_gfs(GfsConfig::default())?,
        };
        if config.staging_dir.is_none() {
            return Err(NimbusError::InvalidConfig(
                "the gfs product needs a staging_dir".to_string(),
            ));
        }

        Ok(ResolvedConfig {
            schema_version,
            base_dir: config.base_dir,
            staging_dir: config.staging_dir,
            log,
            settings,
            run: config.run.map(RunModeConfig::into_run_mode).transpose()?,
            product,
        })
    }
}

fn resolve_gfs(config: GfsConfig) -> Result<GfsForecast, NimbusError> {
    let issue_hours = config
        .issue_hours
        .unwrap_or_else(|| DEFAULT_ISSUE_HOURS.to_vec());
    if let Some(hour) = issue_hours.iter().find(|hour| **hour > 23) {
        return Err(NimbusError::InvalidConfig(format!(
            "issue hour out of range: {hour}"
        )));
    }
    let region = config.region.as_deref().map(str::parse::<Region>).transpose()?;

    Ok(GfsForecast::new()
        .with_base_url(config.base_url.as_deref().unwrap_or(DEFAULT_BASE_URL))
        .with_issue_hours(issue_hours)
        .with_horizons(
            config
                .horizons
                .unwrap_or_else(|| (0..=DEFAULT_MAX_HORIZON).collect()),
        )
        .with_variables(config.variables)
        .with_region(region)
        .with_wgrib2(config.wgrib2))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_config_gets_defaults() {
        let config: Config =
            serde_json::from_str(r#"{"base_dir": "/data/gfs", "staging_dir": "/scratch/gfs"}"#)
                .unwrap();
        let resolved = ConfigLoader::resolve_config(config).unwrap();
        assert_eq!(resolved.schema_version, 1);
        assert_eq!(resolved.log, LogDestination::Console);
        assert_eq!(resolved.settings, RunSettings::default());
        assert!(resolved.run.is_none());
    }
}
