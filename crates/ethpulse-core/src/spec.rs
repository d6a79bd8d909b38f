//! Declarative per-metric specs, deserialized from the metric registry.

use std::collections::BTreeMap;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

pub const DEFAULT_PRECISION: u32 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryMode {
    /// Needs a long daily history; a tier must reach the row threshold.
    #[default]
    Long,
    /// Only the latest values matter; any non-empty tier is sufficient.
    Snapshot,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyKind {
    #[default]
    Date,
    DateDimension,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    Float,
    Integer,
    Text,
}

/// A typed value column plus its unit hints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldSpec {
    pub name: String,
    pub kind: FieldKind,
    #[serde(default)]
    pub precision: Option<u32>,
    /// Unconditional divisor applied to every raw value (e.g. Wei -> ETH).
    #[serde(default)]
    pub scale: Option<f64>,
    /// Magnitude guess: raw values above this are assumed to be in a smaller unit.
    #[serde(default)]
    pub rescale_above: Option<f64>,
    #[serde(default)]
    pub rescale_divisor: Option<f64>,
}

impl FieldSpec {
    pub fn float(name: impl Into<String>, precision: u32) -> Self {
        Self {
            name: name.into(),
            kind: FieldKind::Float,
            precision: Some(precision),
            scale: None,
            rescale_above: None,
            rescale_divisor: None,
        }
    }

    pub fn integer(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: FieldKind::Integer,
            precision: None,
            scale: None,
            rescale_above: None,
            rescale_divisor: None,
        }
    }

    pub fn text(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: FieldKind::Text,
            precision: None,
            scale: None,
            rescale_above: None,
            rescale_divisor: None,
        }
    }

    pub fn with_rescale(mut self, above: f64, divisor: f64) -> Self {
        self.rescale_above = Some(above);
        self.rescale_divisor = Some(divisor);
        self
    }

    pub fn precision(&self) -> u32 {
        self.precision.unwrap_or(DEFAULT_PRECISION)
    }

    pub fn is_numeric(&self) -> bool {
        !matches!(self.kind, FieldKind::Text)
    }
}

/// One tracked metric: its table, record shape and ordered source tiers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSpec {
    pub name: String,
    pub table: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub history: HistoryMode,
    #[serde(default)]
    pub key: KeyKind,
    #[serde(default)]
    pub dimensions: Vec<String>,
    #[serde(default)]
    pub min_rows: Option<usize>,
    pub fields: Vec<FieldSpec>,
    pub tiers: Vec<TierSpec>,
    #[serde(default)]
    pub enrichment: Option<TierSpec>,
}

impl MetricSpec {
    pub fn field(&self, name: &str) -> Option<&FieldSpec> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn is_composite(&self) -> bool {
        self.key == KeyKind::DateDimension
    }

    pub fn has_derived_tier(&self) -> bool {
        self.tiers.iter().any(|t| matches!(t, TierSpec::Derived(_)))
    }

    /// `[None]` for date-keyed metrics, one entry per dimension otherwise.
    pub fn sub_series(&self) -> Vec<Option<String>> {
        if self.is_composite() {
            self.dimensions.iter().cloned().map(Some).collect()
        } else {
            vec![None]
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TierSpec {
    RestJson(RestJsonTier),
    Csv(CsvTier),
    Interpolate(InterpolateTier),
    Regime(RegimeTier),
    Derived(DerivedTier),
}

impl TierSpec {
    pub fn source(&self) -> &str {
        match self {
            TierSpec::RestJson(t) => &t.source,
            TierSpec::Csv(t) => &t.source,
            TierSpec::Interpolate(_) => crate::SOURCE_INTERPOLATED,
            TierSpec::Regime(_) => crate::SOURCE_ESTIMATED,
            TierSpec::Derived(t) => &t.source,
        }
    }

    /// Interpolation and regime estimates never touch the network and always produce rows.
    pub fn is_synthetic(&self) -> bool {
        matches!(self, TierSpec::Interpolate(_) | TierSpec::Regime(_))
    }

    /// Field names this tier claims to produce.
    pub fn produced_fields(&self) -> Vec<&str> {
        match self {
            TierSpec::RestJson(t) => t.values.keys().map(String::as_str).collect(),
            TierSpec::Csv(t) => t.values.keys().map(String::as_str).collect(),
            TierSpec::Interpolate(t) => t
                .anchors
                .iter()
                .flat_map(|a| a.values.keys().map(String::as_str))
                .collect(),
            TierSpec::Regime(t) => t
                .regimes
                .iter()
                .flat_map(|r| r.bands.keys().map(String::as_str))
                .collect(),
            TierSpec::Derived(t) => vec![t.field.as_str()],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DateEncoding {
    #[default]
    Auto,
    UnixSeconds,
    UnixMillis,
    Mdy,
    Iso,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DateSpec {
    pub field: String,
    #[serde(default)]
    pub format: DateEncoding,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pagination {
    pub page_size: usize,
    #[serde(default)]
    pub max_pages: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RestJsonTier {
    pub source: String,
    pub url: String,
    /// Name of the configured API key substituted for `{api_key}`.
    #[serde(default)]
    pub api_key: Option<String>,
    /// Dotted path to the row array (or a single snapshot object). Body root when absent.
    #[serde(default)]
    pub rows_path: Option<String>,
    /// Date location inside each row. Rows are stamped with today when absent.
    #[serde(default)]
    pub date: Option<DateSpec>,
    /// Field name -> dotted path inside each row.
    pub values: BTreeMap<String, String>,
    #[serde(default)]
    pub pagination: Option<Pagination>,
    /// Application-level status path, compared against `ok_value`.
    #[serde(default)]
    pub status_path: Option<String>,
    #[serde(default)]
    pub ok_value: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CsvTier {
    pub source: String,
    pub url: String,
    #[serde(default)]
    pub api_key: Option<String>,
    pub date_column: String,
    #[serde(default)]
    pub date_format: DateEncoding,
    #[serde(default)]
    pub timestamp_column: Option<String>,
    /// Field name -> column header.
    pub values: BTreeMap<String, String>,
}

/// Anchor day as written in the registry: a fixed day or the run's "today".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum AnchorDate {
    Day(NaiveDate),
    Today,
}

impl AnchorDate {
    pub fn resolve(self, today: NaiveDate) -> NaiveDate {
        match self {
            AnchorDate::Day(d) => d,
            AnchorDate::Today => today,
        }
    }
}

impl TryFrom<String> for AnchorDate {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        let trimmed = value.trim();
        if trimmed.eq_ignore_ascii_case("today") {
            return Ok(AnchorDate::Today);
        }
        NaiveDate::parse_from_str(trimmed, "%Y-%m-%d")
            .map(AnchorDate::Day)
            .map_err(|e| format!("invalid anchor date {trimmed:?}: {e}"))
    }
}

impl From<AnchorDate> for String {
    fn from(value: AnchorDate) -> Self {
        match value {
            AnchorDate::Day(d) => crate::format_day(d),
            AnchorDate::Today => "today".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnchorSpec {
    pub date: AnchorDate,
    pub values: BTreeMap<String, f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InterpolateTier {
    pub anchors: Vec<AnchorSpec>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegimeSpec {
    pub from: NaiveDate,
    /// Open-ended through today when absent.
    #[serde(default)]
    pub to: Option<NaiveDate>,
    /// Field name -> `[min, max]`.
    pub bands: BTreeMap<String, [f64; 2]>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegimeTier {
    pub regimes: Vec<RegimeSpec>,
}

/// Rolling statistic computed from another metric's persisted series.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DerivedTier {
    pub source: String,
    pub from_table: String,
    pub from_field: String,
    pub field: String,
    pub window: usize,
    #[serde(default = "default_periods_per_year")]
    pub periods_per_year: f64,
}

fn default_periods_per_year() -> f64 {
    365.0
}
