use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, DurationRound, TimeDelta, TimeZone, Utc};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use crate::error::NimbusError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "UPPERCASE")]
pub enum ProductName {
    Gfs,
    Hrrr,
    Goes,
}

impl ProductName {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProductName::Gfs => "GFS",
            ProductName::Hrrr => "HRRR",
            ProductName::Goes => "GOES",
        }
    }
}

impl fmt::Display for ProductName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProductName {
    type Err = NimbusError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_uppercase().as_str() {
            "GFS" => Ok(ProductName::Gfs),
            "HRRR" => Ok(ProductName::Hrrr),
            "GOES" => Ok(ProductName::Goes),
            _ => Err(NimbusError::InvalidProduct(value.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum DataKind {
    Observation,
    Forecast,
    Reanalysis,
}

impl DataKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DataKind::Observation => "observation",
            DataKind::Forecast => "forecast",
            DataKind::Reanalysis => "reanalysis",
        }
    }
}

impl fmt::Display for DataKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DataKind {
    type Err = NimbusError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim() {
            "observation" => Ok(DataKind::Observation),
            "forecast" => Ok(DataKind::Forecast),
            "reanalysis" => Ok(DataKind::Reanalysis),
            other => Err(NimbusError::InvalidProduct(format!("unknown data kind {other}"))),
        }
    }
}

/// Address of a remote artifact. Also the dedup key in the index.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SourceLocator(String);

impl SourceLocator {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SourceLocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for SourceLocator {
    type Err = NimbusError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        if trimmed.is_empty() || trimmed.chars().any(char::is_whitespace) {
            return Err(NimbusError::InvalidLocator(value.to_string()));
        }
        Ok(Self(trimmed.to_string()))
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    user: String,
    password: String,
}

impl Credentials {
    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn password(&self) -> &str {
        &self.password
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("user", &self.user)
            .field("password", &"***")
            .finish()
    }
}

impl FromStr for Credentials {
    type Err = NimbusError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let (user, password) = value
            .split_once(':')
            .ok_or(NimbusError::InvalidCredentials)?;
        if user.is_empty() {
            return Err(NimbusError::InvalidCredentials);
        }
        Ok(Self {
            user: user.to_string(),
            password: password.to_string(),
        })
    }
}

/// Half-open on paper, but planners keep instants equal to `end`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TimeWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeWindow {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Self, NimbusError> {
        if start >= end {
            return Err(NimbusError::InvalidWindow(format!(
                "start {start} must be before end {end}"
            )));
        }
        Ok(Self { start, end })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunMode {
    Latest { backfill: TimeDelta },
    Monthly { year: i32, month: u32 },
    Range {
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    },
}

impl RunMode {
    /// `latest` mode looking back `hours` from now.
    pub fn latest(hours: i64) -> Result<Self, NimbusError> {
        TimeDelta::try_hours(hours)
            .map(|backfill| RunMode::Latest { backfill })
            .ok_or_else(|| NimbusError::InvalidMode(format!("backfill of {hours} hours is out of range")))
    }

    pub fn name(&self) -> &'static str {
        match self {
            RunMode::Latest { .. } => "latest",
            RunMode::Monthly { .. } => "monthly",
            RunMode::Range { .. } => "range",
        }
    }

    /// Resolves the mode into a concrete window relative to `now`.
    pub fn window(&self, now: DateTime<Utc>) -> Result<TimeWindow, NimbusError> {
        match self {
            RunMode::Latest { backfill } => {
                if *backfill <= TimeDelta::zero() {
                    return Err(NimbusError::InvalidMode(
                        "latest mode needs a positive backfill".to_string(),
                    ));
                }
                let start = now.checked_sub_signed(*backfill).ok_or_else(|| {
                    NimbusError::InvalidWindow(format!("backfill {backfill} reaches before the calendar"))
                })?;
                TimeWindow::new(start, now)
            }
            RunMode::Monthly { year, month } => {
                let start = month_start(*year, *month)?;
                let next = if *month == 12 {
                    let following = year.checked_add(1).ok_or_else(|| {
                        NimbusError::InvalidMode(format!("year out of range: {year}"))
                    })?;
                    month_start(following, 1)?
                } else {
                    month_start(*year, month + 1)?
                };
                let last_hour = next - TimeDelta::hours(1);
                let now = now
                    .duration_trunc(TimeDelta::hours(1))
                    .map_err(|err| NimbusError::InvalidWindow(err.to_string()))?;
                if start > now {
                    return Err(NimbusError::InvalidWindow(format!(
                        "cannot plan a future month: {year}-{month:02}"
                    )));
                }
                TimeWindow::new(start, last_hour.min(now))
            }
            RunMode::Range { start, end } => TimeWindow::new(*start, *end),
        }
    }
}

fn month_start(year: i32, month: u32) -> Result<DateTime<Utc>, NimbusError> {
    if !(1..=12).contains(&month) {
        return Err(NimbusError::InvalidMode(format!(
            "month must be within 1..=12, got {month}"
        )));
    }
    Utc.with_ymd_and_hms(year, month, 1, 0, 0, 0)
        .single()
        .ok_or_else(|| NimbusError::InvalidMode(format!("invalid year/month {year}-{month}")))
}

/// Year-month period selecting which index instance governs an item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeriodKey {
    pub year: i32,
    pub month: u32,
}

impl PeriodKey {
    pub fn of(timestamp: DateTime<Utc>) -> Self {
        Self {
            year: timestamp.year(),
            month: timestamp.month(),
        }
    }

    pub fn index_file_name(&self) -> String {
        format!("{self}.jsonl")
    }
}

impl fmt::Display for PeriodKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}_{:02}", self.year, self.month)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum ExecutionMode {
    #[default]
    Pooled,
    Sequential,
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    fn at(y: i32, m: u32, d: u32, h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, 0, 0).unwrap()
    }

    #[test]
    fn monthly_window_covers_whole_past_month() {
        let mode = RunMode::Monthly {
            year: 2022,
            month: 2,
        };
        let window = mode.window(at(2024, 1, 1, 0)).unwrap();
        assert_eq!(window.start, at(2022, 2, 1, 0));
        assert_eq!(window.end, at(2022, 2, 28, 23));
    }

    #[test]
    fn monthly_window_is_clipped_to_now() {
        let mode = RunMode::Monthly {
            year: 2024,
            month: 12,
        };
        let now = Utc.with_ymd_and_hms(2024, 12, 10, 5, 42, 10).unwrap();
        let window = mode.window(now).unwrap();
        assert_eq!(window.end, at(2024, 12, 10, 5));
    }

    #[test]
    fn future_month_is_rejected() {
        let mode = RunMode::Monthly {
            year: 2030,
            month: 1,
        };
        let err = mode.window(at(2024, 1, 1, 0)).unwrap_err();
        assert_matches!(err, NimbusError::InvalidWindow(_));
        assert!(err.is_input_error());
    }

    #[test]
    fn oversized_backfill_is_an_input_error() {
        assert_matches!(RunMode::latest(i64::MAX), Err(NimbusError::InvalidMode(_)));

        let mode = RunMode::latest(100_000_000_000).unwrap();
        let err = mode.window(at(2024, 1, 1, 0)).unwrap_err();
        assert_matches!(err, NimbusError::InvalidWindow(_));
        assert!(err.is_input_error());
    }

    #[test]
    fn latest_window_ends_now() {
        let now = at(2024, 1, 1, 6);
        let window = RunMode::latest(6).unwrap().window(now).unwrap();
        assert_eq!(window.start, at(2024, 1, 1, 0));
        assert_eq!(window.end, now);
    }

    #[test]
    fn range_requires_start_before_end() {
        let mode = RunMode::Range {
            start: at(2024, 1, 2, 0),
            end: at(2024, 1, 1, 0),
        };
        assert_matches!(
            mode.window(Utc::now()),
            Err(NimbusError::InvalidWindow(_))
        );
    }

    #[test]
    fn credentials_debug_hides_password() {
        let creds: Credentials = "alice:s3cret".parse().unwrap();
        assert_eq!(creds.user(), "alice");
        assert!(!format!("{creds:?}").contains("s3cret"));
    }

    #[test]
    fn period_key_formats_index_file() {
        let key = PeriodKey::of(at(2022, 6, 26, 12));
        assert_eq!(key.index_file_name(), "2022_06.jsonl");
    }
}
