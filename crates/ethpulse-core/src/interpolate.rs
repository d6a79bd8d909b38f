//! Synthetic daily series: linear interpolation between anchors and bounded
//! pseudo-random regime estimates.

use std::collections::BTreeMap;

use chrono::NaiveDate;
use rand::{Rng, SeedableRng};
use rand_pcg::Pcg64Mcg;
use sha2::{Digest, Sha256};

use crate::normalize::{round_to, typed_value};
use crate::spec::{FieldKind, FieldSpec};
use crate::{HistoryWindow, Record, SourceTag};

/// A trusted value on a known day.
#[derive(Debug, Clone, PartialEq)]
pub struct Anchor {
    pub date: NaiveDate,
    pub values: BTreeMap<String, f64>,
}

impl Anchor {
    pub fn new(date: NaiveDate) -> Self {
        Self {
            date,
            values: BTreeMap::new(),
        }
    }

    pub fn with_value(mut self, field: impl Into<String>, value: f64) -> Self {
        self.values.insert(field.into(), value);
        self
    }
}

fn anchor_record(anchor: &Anchor, fields: &[FieldSpec]) -> Record {
    let mut record = Record::new(anchor.date, SourceTag::Interpolated);
    for field in fields.iter().filter(|f| f.is_numeric()) {
        if let Some(value) = anchor.values.get(&field.name) {
            record
                .values
                .insert(field.name.clone(), typed_value(field, *value));
        }
    }
    record
}

/// One record per day in `[d0, d1)` for every consecutive anchor pair, plus the
/// final anchor with its exact value. Intervals with `d1 <= d0` are skipped and
/// nothing is produced past the last anchor.
pub fn interpolate(anchors: &[Anchor], fields: &[FieldSpec]) -> Vec<Record> {
    let mut by_day: BTreeMap<NaiveDate, Record> = BTreeMap::new();

    for pair in anchors.windows(2) {
        let (start, end) = (&pair[0], &pair[1]);
        let span = (end.date - start.date).num_days();
        if span <= 0 {
            continue;
        }
        for offset in 0..span {
            let date = start.date + chrono::Duration::days(offset);
            let mut record = Record::new(date, SourceTag::Interpolated);
            for field in fields.iter().filter(|f| f.is_numeric()) {
                let (Some(v0), Some(v1)) =
                    (start.values.get(&field.name), end.values.get(&field.name))
                else {
                    continue;
                };
                let value = v0 + (v1 - v0) * (offset as f64) / (span as f64);
                record
                    .values
                    .insert(field.name.clone(), typed_value(field, value));
            }
            if !record.values.is_empty() {
                by_day.entry(date).or_insert(record);
            }
        }
    }

    if let Some(last) = anchors.last() {
        let record = anchor_record(last, fields);
        if !record.values.is_empty() {
            by_day.insert(last.date, record);
        }
    }

    by_day.into_values().collect()
}

/// A date range with a `(min, max)` band per field.
#[derive(Debug, Clone, PartialEq)]
pub struct Regime {
    pub from: NaiveDate,
    pub to: Option<NaiveDate>,
    pub bands: BTreeMap<String, (f64, f64)>,
}

impl Regime {
    pub fn covers(&self, date: NaiveDate) -> bool {
        date >= self.from && self.to.map_or(true, |to| date <= to)
    }
}

/// Stable per-day seed so repeated runs draw the same estimate for a given day.
fn day_seed(series: &str, dimension: Option<&str>, date: NaiveDate) -> u64 {
    let mut hasher = Sha256::new();
    hasher.update(series.as_bytes());
    hasher.update([0u8]);
    hasher.update(dimension.unwrap_or_default().as_bytes());
    hasher.update([0u8]);
    hasher.update(crate::format_day(date).as_bytes());
    let digest = hasher.finalize();
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    u64::from_le_bytes(bytes)
}

fn draw(rng: &mut Pcg64Mcg, field: &FieldSpec, min: f64, max: f64) -> f64 {
    let (lo, hi) = if min <= max { (min, max) } else { (max, min) };
    let raw = if lo == hi { lo } else { rng.gen_range(lo..=hi) };
    match field.kind {
        FieldKind::Integer if lo.ceil() <= hi.floor() => raw.round().clamp(lo.ceil(), hi.floor()),
        FieldKind::Integer => raw.round(),
        _ => round_to(raw, field.precision()).clamp(lo, hi),
    }
}

/// Draw one value per day of `window` from whichever regime covers that day.
/// Days covered by no regime are left out.
pub fn generate_regimes(
    series: &str,
    regimes: &[Regime],
    fields: &[FieldSpec],
    window: HistoryWindow,
    dimension: Option<&str>,
) -> Vec<Record> {
    let mut out = Vec::new();
    for date in window.iter_days() {
        let Some(regime) = regimes.iter().find(|r| r.covers(date)) else {
            continue;
        };
        let mut rng = Pcg64Mcg::seed_from_u64(day_seed(series, dimension, date));
        let mut record = Record::new(date, SourceTag::Estimated)
            .with_dimension(dimension.map(ToString::to_string));
        for field in fields.iter().filter(|f| f.is_numeric()) {
            let Some((min, max)) = regime.bands.get(&field.name) else {
                continue;
            };
            let value = draw(&mut rng, field, *min, *max);
            record
                .values
                .insert(field.name.clone(), typed_value(field, value));
        }
        if !record.values.is_empty() {
            out.push(record);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::FieldValue;

    fn day(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    fn staked() -> Vec<FieldSpec> {
        vec![FieldSpec::float("staked_eth", 2)]
    }

    #[test]
    fn interval_start_is_exact_and_end_is_not_duplicated() {
        let anchors = vec![
            Anchor::new(day("2020-12-01")).with_value("staked_eth", 524_288.0),
            Anchor::new(day("2021-06-01")).with_value("staked_eth", 5_000_000.0),
        ];
        let records = interpolate(&anchors, &staked());

        // 182 interpolated days plus the final anchor.
        assert_eq!(records.len(), 183);
        assert_eq!(records[0].date, day("2020-12-01"));
        assert_eq!(records[0].value("staked_eth"), Some(&FieldValue::Float(524_288.0)));

        let finals: Vec<_> = records.iter().filter(|r| r.date == day("2021-06-01")).collect();
        assert_eq!(finals.len(), 1);
        assert_eq!(finals[0].value("staked_eth"), Some(&FieldValue::Float(5_000_000.0)));
        assert!(records.iter().all(|r| r.source == SourceTag::Interpolated));
    }

    #[test]
    fn interpolated_values_stay_between_anchors() {
        let anchors = vec![
            Anchor::new(day("2022-01-01")).with_value("staked_eth", 9_000_000.0),
            Anchor::new(day("2022-03-01")).with_value("staked_eth", 10_500_000.0),
            Anchor::new(day("2022-05-01")).with_value("staked_eth", 10_100_000.0),
        ];
        let records = interpolate(&anchors, &staked());
        for pair in anchors.windows(2) {
            let (lo, hi) = {
                let a = pair[0].values["staked_eth"];
                let b = pair[1].values["staked_eth"];
                (a.min(b), a.max(b))
            };
            for record in records
                .iter()
                .filter(|r| r.date >= pair[0].date && r.date <= pair[1].date)
            {
                let v = record.f64("staked_eth").unwrap();
                assert!(v >= lo && v <= hi, "{v} outside [{lo}, {hi}] on {}", record.date);
            }
        }
        let dates: Vec<_> = records.iter().map(|r| r.date).collect();
        let mut sorted = dates.clone();
        sorted.dedup();
        assert_eq!(dates, sorted);
    }

    #[test]
    fn degenerate_intervals_are_skipped() {
        let anchors = vec![
            Anchor::new(day("2022-01-10")).with_value("staked_eth", 1.0),
            Anchor::new(day("2022-01-10")).with_value("staked_eth", 2.0),
            Anchor::new(day("2022-01-12")).with_value("staked_eth", 4.0),
        ];
        let records = interpolate(&anchors, &staked());
        let got: Vec<_> = records
            .iter()
            .map(|r| (r.date, r.f64("staked_eth").unwrap()))
            .collect();
        assert_eq!(
            got,
            vec![
                (day("2022-01-10"), 2.0),
                (day("2022-01-11"), 3.0),
                (day("2022-01-12"), 4.0),
            ]
        );
    }

    #[test]
    fn integer_fields_interpolate_to_whole_numbers() {
        let fields = vec![FieldSpec::integer("validators")];
        let anchors = vec![
            Anchor::new(day("2023-01-01")).with_value("validators", 0.0),
            Anchor::new(day("2023-01-04")).with_value("validators", 10.0),
        ];
        let values: Vec<_> = interpolate(&anchors, &fields)
            .into_iter()
            .map(|r| r.value("validators").cloned().unwrap())
            .collect();
        assert_eq!(
            values,
            vec![
                FieldValue::Integer(0),
                FieldValue::Integer(3),
                FieldValue::Integer(7),
                FieldValue::Integer(10),
            ]
        );
    }

    #[test]
    fn regime_draws_stay_in_band_and_are_stable_per_day() {
        let fields = vec![FieldSpec::float("dominance_pct", 2)];
        let regimes = vec![
            Regime {
                from: day("2023-01-01"),
                to: Some(day("2023-01-31")),
                bands: BTreeMap::from([("dominance_pct".to_string(), (17.0, 19.5))]),
            },
            Regime {
                from: day("2023-02-01"),
                to: None,
                bands: BTreeMap::from([("dominance_pct".to_string(), (15.0, 18.0))]),
            },
        ];
        let window = HistoryWindow::ending_on(day("2023-02-10"), 60);
        let records = generate_regimes("eth_dominance", &regimes, &fields, window, None);

        // Window starts 2022-12-13, before the first regime.
        assert_eq!(records.first().unwrap().date, day("2023-01-01"));
        assert_eq!(records.len(), 41);
        for record in &records {
            let v = record.f64("dominance_pct").unwrap();
            let (lo, hi) = if record.date <= day("2023-01-31") { (17.0, 19.5) } else { (15.0, 18.0) };
            assert!(v >= lo && v <= hi, "{v} outside band on {}", record.date);
            assert_eq!(record.source, SourceTag::Estimated);
        }

        let again = generate_regimes("eth_dominance", &regimes, &fields, window, None);
        assert_eq!(records, again);
    }
}
