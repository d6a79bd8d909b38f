//! Core domain model for ethpulse: canonical daily records, run bookkeeping,
//! declarative metric specs, normalization and synthetic series generation.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub mod interpolate;
pub mod normalize;
pub mod spec;

pub use interpolate::{generate_regimes, interpolate, Anchor, Regime};
pub use normalize::{normalize, NormalizeError, RawDate, RawRow, RawValue};
pub use spec::{
    AnchorDate, AnchorSpec, CsvTier, DateEncoding, DateSpec, DerivedTier, FieldKind, FieldSpec,
    HistoryMode, InterpolateTier, KeyKind, MetricSpec, Pagination, RegimeSpec, RegimeTier,
    RestJsonTier, TierSpec,
};

pub const CRATE_NAME: &str = "ethpulse-core";

pub const SOURCE_INTERPOLATED: &str = "interpolated";
pub const SOURCE_ESTIMATED: &str = "estimated";

/// Canonical `YYYY-MM-DD` rendering of a calendar day.
pub fn format_day(date: NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}

/// Unix seconds at UTC midnight of `date`.
pub fn midnight_timestamp(date: NaiveDate) -> i64 {
    date.and_time(NaiveTime::MIN).and_utc().timestamp()
}

/// Typed value of one metric field, checked against the declared [`FieldKind`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Integer(i64),
    Float(f64),
    Text(String),
}

impl FieldValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            FieldValue::Integer(v) => Some(*v as f64),
            FieldValue::Float(v) => Some(*v),
            FieldValue::Text(_) => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            FieldValue::Text(v) => Some(v.as_str()),
            _ => None,
        }
    }
}

/// Which tier produced a record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum SourceTag {
    Live(String),
    Interpolated,
    Estimated,
}

impl SourceTag {
    pub fn live(name: impl Into<String>) -> Self {
        SourceTag::Live(name.into())
    }

    pub fn as_str(&self) -> &str {
        match self {
            SourceTag::Live(name) => name.as_str(),
            SourceTag::Interpolated => SOURCE_INTERPOLATED,
            SourceTag::Estimated => SOURCE_ESTIMATED,
        }
    }

    pub fn is_synthetic(&self) -> bool {
        !matches!(self, SourceTag::Live(_))
    }
}

impl From<String> for SourceTag {
    fn from(value: String) -> Self {
        match value.as_str() {
            SOURCE_INTERPOLATED => SourceTag::Interpolated,
            SOURCE_ESTIMATED => SourceTag::Estimated,
            _ => SourceTag::Live(value),
        }
    }
}

impl From<SourceTag> for String {
    fn from(value: SourceTag) -> Self {
        value.as_str().to_string()
    }
}

impl fmt::Display for SourceTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Natural key of a record: the day, plus the dimension for composite series.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RecordKey {
    pub date: NaiveDate,
    pub dimension: Option<String>,
}

/// One canonical row of a metric series.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub date: NaiveDate,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dimension: Option<String>,
    pub values: BTreeMap<String, FieldValue>,
    pub source: SourceTag,
}

impl Record {
    pub fn new(date: NaiveDate, source: SourceTag) -> Self {
        Self {
            date,
            timestamp: Some(midnight_timestamp(date)),
            dimension: None,
            values: BTreeMap::new(),
            source,
        }
    }

    pub fn with_dimension(mut self, dimension: Option<String>) -> Self {
        self.dimension = dimension;
        self
    }

    pub fn with_value(mut self, field: impl Into<String>, value: FieldValue) -> Self {
        self.values.insert(field.into(), value);
        self
    }

    pub fn key(&self) -> RecordKey {
        RecordKey {
            date: self.date,
            dimension: self.dimension.clone(),
        }
    }

    pub fn value(&self, field: &str) -> Option<&FieldValue> {
        self.values.get(field)
    }

    pub fn f64(&self, field: &str) -> Option<f64> {
        self.values.get(field).and_then(FieldValue::as_f64)
    }
}

/// Inclusive range of calendar days requested for a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryWindow {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl HistoryWindow {
    /// Window of `days` whole days ending on (and including) `end`.
    pub fn ending_on(end: NaiveDate, days: u32) -> Self {
        let span = i64::from(days.max(1)) - 1;
        Self {
            start: end - chrono::Duration::days(span),
            end,
        }
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        date >= self.start && date <= self.end
    }

    pub fn days(&self) -> usize {
        ((self.end - self.start).num_days() + 1).max(0) as usize
    }

    pub fn iter_days(&self) -> impl Iterator<Item = NaiveDate> {
        self.start.iter_days().take(self.days())
    }
}

/// Quality of a metric resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QualityTag {
    Success,
    Partial,
    Estimated,
}

impl QualityTag {
    pub fn as_str(self) -> &'static str {
        match self {
            QualityTag::Success => "success",
            QualityTag::Partial => "partial",
            QualityTag::Estimated => "estimated",
        }
    }

    /// Estimated series are persisted but never reported as a clean success.
    pub fn run_state(self) -> RunState {
        match self {
            QualityTag::Success => RunState::Success,
            QualityTag::Partial | QualityTag::Estimated => RunState::Partial,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Success,
    Partial,
    Failed,
}

impl RunState {
    pub fn as_str(self) -> &'static str {
        match self {
            RunState::Success => "success",
            RunState::Partial => "partial",
            RunState::Failed => "failed",
        }
    }
}

/// Per-metric bookkeeping row, upserted at the end of every run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunStatus {
    pub metric: String,
    pub run_id: Uuid,
    pub state: RunState,
    pub quality: Option<QualityTag>,
    pub record_count: u64,
    pub first_date: Option<NaiveDate>,
    pub last_date: Option<NaiveDate>,
    pub last_error: Option<String>,
    pub series_digest: Option<String>,
    pub last_run_at: DateTime<Utc>,
}

impl RunStatus {
    pub fn failed(metric: impl Into<String>, run_id: Uuid, error: impl fmt::Display) -> Self {
        Self {
            metric: metric.into(),
            run_id,
            state: RunState::Failed,
            quality: None,
            record_count: 0,
            first_date: None,
            last_date: None,
            last_error: Some(error.to_string()),
            series_digest: None,
            last_run_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

/// Diagnostic entry for the per-run log table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunLogEvent {
    pub run_id: Uuid,
    pub metric: Option<String>,
    pub level: LogLevel,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

impl RunLogEvent {
    pub fn new(
        run_id: Uuid,
        metric: Option<&str>,
        level: LogLevel,
        message: impl Into<String>,
    ) -> Self {
        Self {
            run_id,
            metric: metric.map(ToString::to_string),
            level,
            message: message.into(),
            created_at: Utc::now(),
        }
    }
}
