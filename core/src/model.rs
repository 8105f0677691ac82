use chrono::{DateTime, Datelike, NaiveDate, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::LazyLock;

static SERIES_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[0-9a-f-]+").expect("Invalid series id regex"));

/// Identifier of one recorded statistic on the controller, e.g. the UUID
/// prefix `0f1c3a2e-02a4-5d7c-ffff504f94000000` of its stats files.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize, Serialize)]
#[serde(transparent)]
pub struct SeriesId(String);

impl SeriesId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Extracts the identifier from a stats file name: the leading run of
    /// lowercase hex digits and dashes.
    pub fn from_file_name(name: &str) -> Option<Self> {
        SERIES_ID.find(name).map(|m| Self(m.as_str().to_string()))
    }
}

impl fmt::Display for SeriesId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SeriesId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// One stats file on the controller. A series is split into one file per
/// month, named `<id>.<yyyymm>.<format>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatsFile {
    pub name: String,
    /// First day of the month covered by the file, when the name carries one.
    pub period: Option<NaiveDate>,
}

impl StatsFile {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        let period = name
            .split('.')
            .nth(1)
            .filter(|segment| segment.len() == 6 && segment.chars().all(|c| c.is_ascii_digit()))
            .and_then(|segment| {
                let year = segment[..4].parse::<i32>().ok()?;
                let month = segment[4..].parse::<u32>().ok()?;
                NaiveDate::from_ymd_opt(year, month, 1)
            });

        Self { name, period }
    }

    /// Whether the file can hold samples at or after `since`. Files without a
    /// recognizable month are always considered relevant.
    pub fn may_contain_since(&self, since: DateTime<Utc>) -> bool {
        let Some(start) = self.period else {
            return true;
        };
        let next_month = if start.month0() == 11 {
            NaiveDate::from_ymd_opt(start.year() + 1, 1, 1)
        } else {
            NaiveDate::from_ymd_opt(start.year(), start.month() + 1, 1)
        };

        match next_month.and_then(|d| d.and_hms_opt(0, 0, 0)) {
            // One extra day absorbs the controller's local-time offset.
            Some(end) => end.and_utc() + chrono::Duration::days(1) > since,
            None => true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SeriesDescriptor {
    pub id: SeriesId,
    pub title: String,
    /// Native format hint, the stats file extension (`xml`).
    pub format: String,
    pub files: Vec<StatsFile>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum RawValue {
    Numeric(f64),
    Enumerated(String),
}

impl fmt::Display for RawValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RawValue::Numeric(v) => write!(f, "{}", v),
            RawValue::Enumerated(s) => f.write_str(s),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RawSample {
    pub timestamp: DateTime<Utc>,
    pub value: RawValue,
}

/// Undecoded statistics of one series: one page per stats file, in the order
/// the controller listed them.
#[derive(Debug, Clone)]
pub struct RawPayload {
    pub id: SeriesId,
    pub pages: Vec<Vec<u8>>,
    /// Samples before this instant are dropped while decoding.
    pub since: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct MappingRule {
    pub id: SeriesId,
    pub measurement: String,
    pub tags: BTreeMap<String, String>,
}

/// Identity of a point in the destination; a second write with the same key
/// overwrites the first.
pub type PointKey = (String, BTreeMap<String, String>, DateTime<Utc>);

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DatabasePoint {
    pub measurement: String,
    pub tags: BTreeMap<String, String>,
    pub timestamp: DateTime<Utc>,
    pub value: RawValue,
}

impl DatabasePoint {
    pub fn from_sample(rule: &MappingRule, sample: &RawSample) -> Self {
        Self {
            measurement: rule.measurement.clone(),
            tags: rule.tags.clone(),
            timestamp: sample.timestamp,
            value: sample.value.clone(),
        }
    }

    pub fn key(&self) -> PointKey {
        (self.measurement.clone(), self.tags.clone(), self.timestamp)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum SkipReason {
    Unmapped,
    NotFound,
    MalformedPayload(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum OutcomeStatus {
    Written,
    Skipped(SkipReason),
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SeriesOutcome {
    pub id: SeriesId,
    pub samples_fetched: usize,
    pub samples_written: usize,
    pub status: OutcomeStatus,
}

impl SeriesOutcome {
    pub fn skipped(id: SeriesId, reason: SkipReason) -> Self {
        Self {
            id,
            samples_fetched: 0,
            samples_written: 0,
            status: OutcomeStatus::Skipped(reason),
        }
    }
}

/// Result of one import pass, surfaced to the command line.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub outcomes: Vec<SeriesOutcome>,
    /// Mapped series for which a fetch was attempted.
    pub attempted: usize,
    pub skipped_unmapped: usize,
    pub skipped_error: usize,
    pub failed: usize,
    pub points_written: usize,
}

impl RunSummary {
    pub fn from_outcomes(outcomes: Vec<SeriesOutcome>) -> Self {
        let mut summary = RunSummary::default();
        for outcome in &outcomes {
            match &outcome.status {
                OutcomeStatus::Skipped(SkipReason::Unmapped) => summary.skipped_unmapped += 1,
                OutcomeStatus::Skipped(_) => {
                    summary.attempted += 1;
                    summary.skipped_error += 1;
                }
                OutcomeStatus::Failed(_) => {
                    summary.attempted += 1;
                    summary.failed += 1;
                }
                OutcomeStatus::Written => summary.attempted += 1,
            }
            summary.points_written += outcome.samples_written;
        }
        summary.outcomes = outcomes;
        summary
    }
}
