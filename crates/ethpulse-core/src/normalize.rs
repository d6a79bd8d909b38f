//! Unit and date normalization from raw source rows into canonical [`Record`]s.
//!
//! Dates are always resolved to UTC calendar days. Numeric unit corrections are
//! driven by the hints declared on each [`FieldSpec`]; the magnitude-based
//! rescale is a guess about the source's unit, so it is only applied to fields
//! that opt in through `rescale_above`.

use chrono::{DateTime, NaiveDate};
use thiserror::Error;

use crate::spec::{DateEncoding, FieldKind, FieldSpec, MetricSpec};
use crate::{FieldValue, Record, SourceTag};

/// Raw timestamps above this are taken as milliseconds in `auto` mode.
const MILLIS_THRESHOLD: i64 = 100_000_000_000;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NormalizeError {
    #[error("unparseable date {raw:?}")]
    UnparseableDate { raw: String },
    #[error("unparseable number {raw:?} for field {field}")]
    UnparseableNumber { field: String, raw: String },
}

#[derive(Debug, Clone, PartialEq)]
pub enum RawDate {
    Text(String),
    Unix(i64),
    Day(NaiveDate),
}

#[derive(Debug, Clone, PartialEq)]
pub enum RawValue {
    Number(f64),
    Text(String),
    Missing,
}

/// A source row before normalization.
#[derive(Debug, Clone, PartialEq)]
pub struct RawRow {
    pub date: RawDate,
    pub date_format: DateEncoding,
    /// Secondary date source, used when `date` does not parse.
    pub fallback_timestamp: Option<i64>,
    pub dimension: Option<String>,
    pub values: Vec<(String, RawValue)>,
}

impl RawRow {
    pub fn new(date: RawDate) -> Self {
        Self {
            date,
            date_format: DateEncoding::Auto,
            fallback_timestamp: None,
            dimension: None,
            values: Vec::new(),
        }
    }

    pub fn with_format(mut self, format: DateEncoding) -> Self {
        self.date_format = format;
        self
    }

    pub fn with_value(mut self, field: impl Into<String>, value: RawValue) -> Self {
        self.values.push((field.into(), value));
        self
    }
}

fn unparseable_date(raw: impl Into<String>) -> NormalizeError {
    NormalizeError::UnparseableDate { raw: raw.into() }
}

fn unix_to_day(value: i64, millis: bool) -> Result<NaiveDate, NormalizeError> {
    let secs = if millis { value.div_euclid(1000) } else { value };
    DateTime::from_timestamp(secs, 0)
        .map(|dt| dt.date_naive())
        .ok_or_else(|| unparseable_date(value.to_string()))
}

fn parse_mdy(text: &str) -> Option<NaiveDate> {
    let head = text.split_whitespace().next()?;
    let mut parts = head.split('/');
    let month = parts.next()?.trim().parse::<u32>().ok()?;
    let day = parts.next()?.trim().parse::<u32>().ok()?;
    let year = parts.next()?.trim().parse::<i32>().ok()?;
    if parts.next().is_some() {
        return None;
    }
    NaiveDate::from_ymd_opt(year, month, day)
}

fn parse_iso(text: &str) -> Option<NaiveDate> {
    if let Ok(day) = NaiveDate::parse_from_str(text, "%Y-%m-%d") {
        return Some(day);
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return Some(dt.naive_utc().date());
    }
    // Naive date-times ("2024-03-09 00:00:00", "2024-03-09T00:00:00") are already UTC.
    text.get(..10)
        .filter(|_| matches!(text.as_bytes().get(10), Some(b'T' | b' ')))
        .and_then(|head| NaiveDate::parse_from_str(head, "%Y-%m-%d").ok())
}

/// `20240309`. Eight digits as epoch seconds would land in 1970-1973, which no
/// source reports, so the calendar reading wins.
fn compact_day(text: &str) -> Option<NaiveDate> {
    if text.len() != 8 {
        return None;
    }
    NaiveDate::parse_from_str(text, "%Y%m%d").ok()
}

/// Parse a textual date in any supported encoding.
pub fn parse_date_text(text: &str, format: DateEncoding) -> Result<NaiveDate, NormalizeError> {
    let text = text.trim();
    let parsed = match format {
        DateEncoding::UnixSeconds => {
            return text
                .parse::<i64>()
                .map_err(|_| unparseable_date(text))
                .and_then(|v| unix_to_day(v, false))
        }
        DateEncoding::UnixMillis => {
            return text
                .parse::<i64>()
                .map_err(|_| unparseable_date(text))
                .and_then(|v| unix_to_day(v, true))
        }
        DateEncoding::Mdy => parse_mdy(text),
        DateEncoding::Iso => parse_iso(text),
        DateEncoding::Auto => {
            if !text.is_empty() && text.bytes().all(|b| b.is_ascii_digit()) {
                if let Some(day) = compact_day(text) {
                    return Ok(day);
                }
                let value = text.parse::<i64>().map_err(|_| unparseable_date(text))?;
                return unix_to_day(value, value > MILLIS_THRESHOLD);
            }
            if text.contains('/') {
                parse_mdy(text)
            } else {
                parse_iso(text)
            }
        }
    };
    parsed.ok_or_else(|| unparseable_date(text))
}

pub fn parse_date(raw: &RawDate, format: DateEncoding) -> Result<NaiveDate, NormalizeError> {
    match raw {
        RawDate::Day(day) => Ok(*day),
        RawDate::Unix(value) => match format {
            DateEncoding::UnixMillis => unix_to_day(*value, true),
            DateEncoding::UnixSeconds => unix_to_day(*value, false),
            _ => match compact_day(&value.to_string()) {
                Some(day) => Ok(day),
                None => unix_to_day(*value, *value > MILLIS_THRESHOLD),
            },
        },
        RawDate::Text(text) => parse_date_text(text, format),
    }
}

/// Parse a raw numeric cell. `Ok(None)` means the value is absent.
pub fn parse_number(field: &str, raw: &RawValue) -> Result<Option<f64>, NormalizeError> {
    let bad = |raw: &str| NormalizeError::UnparseableNumber {
        field: field.to_string(),
        raw: raw.to_string(),
    };
    let value = match raw {
        RawValue::Missing => return Ok(None),
        RawValue::Number(v) => *v,
        RawValue::Text(text) => {
            let cleaned: String = text
                .trim()
                .trim_start_matches('$')
                .chars()
                .filter(|c| *c != ',' && !c.is_whitespace())
                .collect();
            if cleaned.is_empty() {
                return Ok(None);
            }
            cleaned.parse::<f64>().map_err(|_| bad(text))?
        }
    };
    if value.is_finite() {
        Ok(Some(value))
    } else {
        Err(bad(&value.to_string()))
    }
}

/// Apply the field's declared unit corrections.
pub fn apply_unit_hints(field: &FieldSpec, value: f64) -> f64 {
    let mut value = value;
    if let Some(scale) = field.scale.filter(|s| *s != 0.0) {
        value /= scale;
    }
    if let (Some(above), Some(divisor)) = (field.rescale_above, field.rescale_divisor) {
        if value.abs() > above && divisor != 0.0 {
            value /= divisor;
        }
    }
    value
}

pub fn round_to(value: f64, precision: u32) -> f64 {
    let factor = 10f64.powi(precision as i32);
    let rounded = (value * factor).round() / factor;
    // Avoid persisting "-0.0" for tiny negative inputs.
    if rounded == 0.0 {
        0.0
    } else {
        rounded
    }
}

/// Shape a finished numeric value into the field's declared kind.
pub fn typed_value(field: &FieldSpec, value: f64) -> FieldValue {
    match field.kind {
        FieldKind::Integer => FieldValue::Integer(value.round() as i64),
        FieldKind::Float | FieldKind::Text => FieldValue::Float(round_to(value, field.precision())),
    }
}

/// Convert one raw cell into a typed value for `field`.
pub fn coerce(field: &FieldSpec, raw: &RawValue) -> Result<Option<FieldValue>, NormalizeError> {
    if field.kind == FieldKind::Text {
        return Ok(match raw {
            RawValue::Missing => None,
            RawValue::Text(text) if text.trim().is_empty() => None,
            RawValue::Text(text) => Some(FieldValue::Text(text.trim().to_string())),
            RawValue::Number(v) => Some(FieldValue::Text(v.to_string())),
        });
    }
    let Some(value) = parse_number(&field.name, raw)? else {
        return Ok(None);
    };
    Ok(Some(typed_value(field, apply_unit_hints(field, value))))
}

/// Normalize a raw row against the metric's declared record shape.
pub fn normalize(
    raw: RawRow,
    metric: &MetricSpec,
    source: &SourceTag,
) -> Result<Record, NormalizeError> {
    let date = match parse_date(&raw.date, raw.date_format) {
        Ok(day) => day,
        Err(err) => match raw.fallback_timestamp {
            Some(ts) => unix_to_day(ts, ts > MILLIS_THRESHOLD)?,
            None => return Err(err),
        },
    };

    let mut record = Record::new(date, source.clone()).with_dimension(raw.dimension);
    for (name, value) in &raw.values {
        let Some(field) = metric.field(name) else {
            continue;
        };
        if let Some(typed) = coerce(field, value)? {
            record.values.insert(field.name.clone(), typed);
        }
    }

    if record.values.is_empty() {
        return Err(NormalizeError::UnparseableNumber {
            field: metric
                .fields
                .first()
                .map(|f| f.name.clone())
                .unwrap_or_default(),
            raw: "<no values>".to_string(),
        });
    }
    Ok(record)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spec::{HistoryMode, KeyKind};

    fn day(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    fn gas_metric() -> MetricSpec {
        MetricSpec {
            name: "gas_price".into(),
            table: "eth_gas_price_daily".into(),
            description: None,
            history: HistoryMode::Long,
            key: KeyKind::Date,
            dimensions: vec![],
            min_rows: None,
            fields: vec![
                FieldSpec::float("avg_gwei", 2).with_rescale(1_000_000.0, 1_000_000_000.0),
                FieldSpec::integer("tx_count"),
            ],
            tiers: vec![],
            enrichment: None,
        }
    }

    #[test]
    fn csv_style_dates_normalize_to_iso() {
        assert_eq!(
            parse_date_text("3/9/2024", DateEncoding::Auto).unwrap(),
            day("2024-03-09")
        );
        assert_eq!(
            parse_date_text("12/31/2015", DateEncoding::Mdy).unwrap(),
            day("2015-12-31")
        );
    }

    #[test]
    fn unix_and_iso_forms_are_accepted() {
        assert_eq!(
            parse_date(&RawDate::Unix(1_709_942_400), DateEncoding::Auto).unwrap(),
            day("2024-03-09")
        );
        assert_eq!(
            parse_date(&RawDate::Unix(1_709_942_400_000), DateEncoding::Auto).unwrap(),
            day("2024-03-09")
        );
        assert_eq!(
            parse_date_text("1709942400", DateEncoding::UnixSeconds).unwrap(),
            day("2024-03-09")
        );
        assert_eq!(
            parse_date_text("2024-03-09T23:59:59Z", DateEncoding::Auto).unwrap(),
            day("2024-03-09")
        );
        assert_eq!(
            parse_date_text("2024-03-09T23:30:00-02:00", DateEncoding::Iso).unwrap(),
            day("2024-03-10")
        );
        assert_eq!(
            parse_date_text("2024-03-09 00:00:00", DateEncoding::Auto).unwrap(),
            day("2024-03-09")
        );
    }

    #[test]
    fn compact_calendar_days_are_not_read_as_epoch_seconds() {
        assert_eq!(
            parse_date_text("20240309", DateEncoding::Auto).unwrap(),
            day("2024-03-09")
        );
        assert_eq!(
            parse_date(&RawDate::Unix(20_240_309), DateEncoding::Auto).unwrap(),
            day("2024-03-09")
        );
        // An explicit encoding is taken at its word.
        assert_eq!(
            parse_date_text("20240309", DateEncoding::UnixSeconds).unwrap(),
            day("1970-08-23")
        );
    }

    #[test]
    fn bad_dates_are_reported() {
        assert!(matches!(
            parse_date_text("13/45/2024", DateEncoding::Auto),
            Err(NormalizeError::UnparseableDate { .. })
        ));
        assert!(parse_date_text("not a date", DateEncoding::Auto).is_err());
        assert!(parse_date_text("", DateEncoding::Auto).is_err());
    }

    #[test]
    fn wei_gas_price_rescales_to_gwei() {
        let metric = gas_metric();
        let raw = RawRow::new(RawDate::Text("3/9/2024".into()))
            .with_value("avg_gwei", RawValue::Text("25000000000".into()));
        let record = normalize(raw, &metric, &SourceTag::live("etherscan")).unwrap();
        assert_eq!(record.date, day("2024-03-09"));
        assert_eq!(record.value("avg_gwei"), Some(&FieldValue::Float(25.0)));
    }

    #[test]
    fn gwei_gas_price_is_left_alone() {
        let field = FieldSpec::float("avg_gwei", 2).with_rescale(1_000_000.0, 1_000_000_000.0);
        assert_eq!(apply_unit_hints(&field, 31.456), 31.456);
        assert_eq!(
            coerce(&field, &RawValue::Number(31.456)).unwrap(),
            Some(FieldValue::Float(31.46))
        );
    }

    #[test]
    fn numbers_with_separators_parse() {
        assert_eq!(
            parse_number("v", &RawValue::Text("1,234,567".into())).unwrap(),
            Some(1_234_567.0)
        );
        assert_eq!(parse_number("v", &RawValue::Text(" $12.5 ".into())).unwrap(), Some(12.5));
        assert_eq!(parse_number("v", &RawValue::Text("".into())).unwrap(), None);
        assert!(parse_number("v", &RawValue::Text("n/a".into())).is_err());
        assert!(parse_number("v", &RawValue::Number(f64::NAN)).is_err());
    }

    #[test]
    fn integer_fields_round_and_unknown_fields_are_ignored() {
        let metric = gas_metric();
        let raw = RawRow::new(RawDate::Text("2024-03-09".into()))
            .with_value("tx_count", RawValue::Number(1_204_332.6))
            .with_value("unrelated", RawValue::Number(1.0));
        let record = normalize(raw, &metric, &SourceTag::live("etherscan")).unwrap();
        assert_eq!(record.value("tx_count"), Some(&FieldValue::Integer(1_204_333)));
        assert!(record.value("unrelated").is_none());
    }

    #[test]
    fn rows_without_values_are_rejected() {
        let metric = gas_metric();
        let raw = RawRow::new(RawDate::Text("2024-03-09".into()))
            .with_value("avg_gwei", RawValue::Missing);
        assert!(matches!(
            normalize(raw, &metric, &SourceTag::live("etherscan")),
            Err(NormalizeError::UnparseableNumber { .. })
        ));
    }

    #[test]
    fn fallback_timestamp_rescues_bad_date_column() {
        let metric = gas_metric();
        let mut raw = RawRow::new(RawDate::Text("garbage".into()))
            .with_value("tx_count", RawValue::Number(10.0));
        raw.fallback_timestamp = Some(1_709_942_400);
        let record = normalize(raw, &metric, &SourceTag::live("etherscan-csv")).unwrap();
        assert_eq!(record.date, day("2024-03-09"));
    }
}
