use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::LazyLock;

use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, DurationRound, NaiveDateTime, TimeDelta, Timelike, Utc};
use regex::Regex;
use tracing::debug;

use crate::domain::{DataKind, PeriodKey, ProductName, SourceLocator, TimeWindow};
use crate::error::NimbusError;
use crate::fs_util::{self, find_in_path, partial_path};
use crate::planner::{Candidate, CandidateSet, FilenamePlanner, PostFetchProcessor, Product};
use crate::record::{FieldSchema, FieldType, MetadataRecord};

pub const DEFAULT_BASE_URL: &str = "https://noaa-gfs-bdp-pds.s3.amazonaws.com";
pub const DEFAULT_ISSUE_HOURS: [u32; 4] = [0, 6, 12, 18];
pub const DEFAULT_MAX_HORIZON: u32 = 48;

/// `wgrib2 -small_grib` bounds, e.g. `198.5:207.5 17.5:23.5`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Region {
    lon: String,
    lat: String,
}

impl std::str::FromStr for Region {
    type Err = NimbusError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let parts = value.split_whitespace().collect::<Vec<_>>();
        match parts.as_slice() {
            [lon, lat] if lon.contains(':') && lat.contains(':') => Ok(Self {
                lon: lon.to_string(),
                lat: lat.to_string(),
            }),
            _ => Err(NimbusError::InvalidConfig(format!(
                "region must look like \"lon0:lon1 lat0:lat1\", got {value:?}"
            ))),
        }
    }
}

/// GFS 0.25 degree forecasts from the NOAA open-data bucket, subset with
/// `wgrib2` and stored as NetCDF.
#[derive(Debug, Clone)]
pub struct GfsForecast {
    base_url: String,
    issue_hours: Vec<u32>,
    horizons: Vec<u32>,
    variables: Vec<String>,
    region: Option<Region>,
    wgrib2: Option<PathBuf>,
}

impl Default for GfsForecast {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            issue_hours: DEFAULT_ISSUE_HOURS.to_vec(),
            horizons: (0..=DEFAULT_MAX_HORIZON).collect(),
            variables: Vec::new(),
            region: None,
            wgrib2: None,
        }
    }
}

impl GfsForecast {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_base_url(mut self, base_url: &str) -> Self {
        self.base_url = base_url.trim_end_matches('/').to_string();
        self
    }

    pub fn with_issue_hours(mut self, hours: Vec<u32>) -> Self {
        self.issue_hours = hours;
        self
    }

    pub fn with_horizons(mut self, horizons: Vec<u32>) -> Self {
        self.horizons = horizons;
        self
    }

    pub fn with_variables(mut self, variables: Vec<String>) -> Self {
        self.variables = variables;
        self
    }

    pub fn with_region(mut self, region: Option<Region>) -> Self {
        self.region = region;
        self
    }

    pub fn with_wgrib2(mut self, path: Option<PathBuf>) -> Self {
        self.wgrib2 = path;
        self
    }

    pub fn forecast_schema() -> FieldSchema {
        FieldSchema::core()
            .with_field("issue_timestamp", FieldType::DateTime)
            .with_field("horizon", FieldType::Int)
    }

    /// Issue instants on the hour within `[start, end]` whose hour is an issue hour.
    pub fn issue_instants(&self, window: &TimeWindow) -> Vec<DateTime<Utc>> {
        let Ok(mut t) = window.start.duration_trunc(TimeDelta::days(1)) else {
            return Vec::new();
        };
        let mut instants = Vec::new();
        while t <= window.end {
            if t >= window.start && self.issue_hours.contains(&t.hour()) {
                instants.push(t);
            }
            match t.checked_add_signed(TimeDelta::hours(1)) {
                Some(next) => t = next,
                None => break,
            }
        }
        instants
    }

    fn relative_source(issued: DateTime<Utc>, horizon: u32) -> String {
        format!(
            "{}.f{horizon:03}",
            issued.format("gfs.%Y%m%d/%H/atmos/gfs.t%Hz.pgrb2.0p25")
        )
    }

    fn wgrib2(&self) -> Result<PathBuf, NimbusError> {
        self.wgrib2
            .clone()
            .or_else(|| find_in_path("wgrib2"))
            .ok_or_else(|| NimbusError::MissingTool("wgrib2".to_string()))
    }

    fn subset_args(&self, input: &Utf8Path, output: &Path) -> Vec<String> {
        let mut args = vec![input.to_string()];
        if !self.variables.is_empty() {
            args.push("-match".to_string());
            args.push(self.variables.join("|"));
        }
        match &self.region {
            Some(region) => {
                args.push("-small_grib".to_string());
                args.push(region.lon.clone());
                args.push(region.lat.clone());
            }
            None => args.push("-grib".to_string()),
        }
        args.push(output.to_string_lossy().to_string());
        args
    }
}

impl FilenamePlanner for GfsForecast {
    fn plan(&self, window: &TimeWindow) -> Result<CandidateSet, NimbusError> {
        let mut set = CandidateSet::new();
        for issued in self.issue_instants(window) {
            let index_selector = Utf8PathBuf::from(PeriodKey::of(issued).index_file_name());
            for &horizon in &self.horizons {
                let relative = Self::relative_source(issued, horizon);
                set.push(Candidate {
                    source: format!("{}/{relative}", self.base_url).parse()?,
                    staging: Some(Utf8PathBuf::from(&relative)),
                    final_path: Utf8PathBuf::from(format!(
                        "{}_f{horizon:03}.nc",
                        issued.format("%Y_%m/%d/%Y_%m_%d_%H00")
                    )),
                    index_selector: index_selector.clone(),
                });
            }
        }
        Ok(set)
    }
}

impl PostFetchProcessor for GfsForecast {
    fn process(
        &self,
        source: &SourceLocator,
        staging: Option<&Utf8Path>,
        final_path: &Utf8Path,
    ) -> Result<MetadataRecord, NimbusError> {
        let staging = staging.ok_or_else(|| {
            NimbusError::Processor("GFS forecasts must be fetched into a staging area".to_string())
        })?;
        let (issued, horizon) = parse_locator(source)?;
        let wgrib2 = self.wgrib2()?;
        fs_util::ensure_parent(final_path)?;

        // Held until the end so the subset file is removed on every path.
        let subset = if self.variables.is_empty() && self.region.is_none() {
            None
        } else {
            let dir = staging.parent().unwrap_or(staging);
            let temp = tempfile::Builder::new()
                .prefix("gfs-subset")
                .suffix(".grib2")
                .tempfile_in(dir.as_std_path())
                .map_err(|err| NimbusError::Filesystem(err.to_string()))?;
            run_cmd(&wgrib2, &self.subset_args(staging, temp.path()))?;
            Some(temp)
        };
        let netcdf_input = match &subset {
            Some(temp) => temp.path().to_string_lossy().to_string(),
            None => staging.to_string(),
        };

        let partial = partial_path(final_path);
        run_cmd(
            &wgrib2,
            &[netcdf_input, "-netcdf".to_string(), partial.to_string()],
        )?;
        fs::rename(partial.as_std_path(), final_path.as_std_path())
            .map_err(|err| NimbusError::Filesystem(format!("rename {partial}: {err}")))?;
        fs::remove_file(staging.as_std_path())
            .map_err(|err| NimbusError::Filesystem(format!("remove {staging}: {err}")))?;
        drop(subset);
        debug!(%source, %final_path, "converted forecast to netcdf");

        Ok(
            MetadataRecord::for_file(ProductName::Gfs, DataKind::Forecast, source.clone(), final_path)?
                .with_field("issue_timestamp", issued)
                .with_field("horizon", i64::from(horizon)),
        )
    }
}

impl Product for GfsForecast {
    fn schema(&self) -> FieldSchema {
        Self::forecast_schema()
    }
}

/// Extracts the issue instant and forecast horizon from a GFS object URL such as
/// `.../gfs.20220626/00/atmos/gfs.t00z.pgrb2.0p25.f024`.
static LOCATOR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"gfs\.(\d{8})/(\d{2})/.*\.f(\d{3})$").expect("valid locator regex")
});

pub fn parse_locator(source: &SourceLocator) -> Result<(DateTime<Utc>, u32), NimbusError> {
    let caps = LOCATOR
        .captures(source.as_str())
        .ok_or_else(|| NimbusError::Processor(format!("not a GFS forecast locator: {source}")))?;
    let issued = NaiveDateTime::parse_from_str(&format!("{}{}00", &caps[1], &caps[2]), "%Y%m%d%H%M")
        .map_err(|err| NimbusError::Processor(format!("{source}: {err}")))?
        .and_utc();
    let horizon = caps[3]
        .parse::<u32>()
        .map_err(|err| NimbusError::Processor(format!("{source}: {err}")))?;
    Ok((issued, horizon))
}

fn run_cmd(program: &Path, args: &[String]) -> Result<(), NimbusError> {
    let output = Command::new(program)
        .args(args)
        .output()
        .map_err(|err| NimbusError::Processor(err.to_string()))?;
    if output.status.success() {
        return Ok(());
    }
    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
    let message = if stderr.is_empty() {
        format!("command failed: {}", program.display())
    } else {
        stderr
    };
    Err(NimbusError::Processor(message))
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use chrono::TimeZone;

    use super::*;

    fn at(y: i32, m: u32, d: u32, h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, 0, 0).unwrap()
    }

    #[test]
    fn plans_issue_times_within_window_inclusive() {
        let gfs = GfsForecast::new().with_horizons(vec![0, 3]);
        let window = TimeWindow::new(at(2022, 6, 30, 5), at(2022, 7, 1, 0)).unwrap();
        let set = gfs.plan(&window).unwrap();

        // 06, 12, 18 on the 30th and 00 on the 1st, two horizons each.
        assert_eq!(set.len(), 8);
        let (sources, staging, finals, selectors) = set.into_parts();
        assert_eq!(
            sources[0].as_str(),
            "https://noaa-gfs-bdp-pds.s3.amazonaws.com/gfs.20220630/06/atmos/gfs.t06z.pgrb2.0p25.f000"
        );
        assert_eq!(
            staging[1].as_deref(),
            Some(Utf8Path::new("gfs.20220630/06/atmos/gfs.t06z.pgrb2.0p25.f003"))
        );
        assert_eq!(finals[1], Utf8PathBuf::from("2022_06/30/2022_06_30_0600_f003.nc"));
        assert_eq!(selectors[0], Utf8PathBuf::from("2022_06.jsonl"));
        assert_eq!(selectors[7], Utf8PathBuf::from("2022_07.jsonl"));
    }

    #[test]
    fn plan_has_no_duplicates() {
        let gfs = GfsForecast::new();
        let window = TimeWindow::new(at(2022, 6, 1, 0), at(2022, 6, 3, 0)).unwrap();
        let set = gfs.plan(&window).unwrap();
        let unique = set
            .sources()
            .iter()
            .collect::<std::collections::HashSet<_>>();
        assert_eq!(unique.len(), set.len());
        // 2 days of four issues plus 00Z on the 3rd, 49 horizons each.
        assert_eq!(set.len(), 9 * 49);
    }

    #[test]
    fn parses_issue_and_horizon_from_locator() {
        let source: SourceLocator =
            "https://noaa-gfs-bdp-pds.s3.amazonaws.com/gfs.20220626/00/atmos/gfs.t00z.pgrb2.0p25.f024"
                .parse()
                .unwrap();
        let (issued, horizon) = parse_locator(&source).unwrap();
        assert_eq!(issued, at(2022, 6, 26, 0));
        assert_eq!(horizon, 24);

        let other: SourceLocator = "https://example.org/file.grib2".parse().unwrap();
        assert_matches!(parse_locator(&other), Err(NimbusError::Processor(_)));
    }

    #[test]
    fn region_needs_two_ranges() {
        let region: Region = "198.5:207.5 17.5:23.5".parse().unwrap();
        assert_eq!(region.lon, "198.5:207.5");
        assert!("198.5:207.5".parse::<Region>().is_err());
    }

    #[test]
    fn processor_requires_staging() {
        let source: SourceLocator =
            "https://host/gfs.20220626/00/atmos/gfs.t00z.pgrb2.0p25.f024".parse().unwrap();
        let err = GfsForecast::new()
            .process(&source, None, Utf8Path::new("/tmp/out.nc"))
            .unwrap_err();
        assert_matches!(err, NimbusError::Processor(_));
    }
}
