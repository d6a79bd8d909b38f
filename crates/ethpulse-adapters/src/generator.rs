//! Network-free tiers: anchor interpolation, regime estimates and statistics
//! derived from another metric's persisted series.

use async_trait::async_trait;
use chrono::NaiveDate;
use ethpulse_core::normalize::typed_value;
use ethpulse_core::{
    generate_regimes, interpolate, Anchor, DerivedTier, FieldSpec, InterpolateTier, Record,
    Regime, RegimeTier, SourceTag, SOURCE_ESTIMATED, SOURCE_INTERPOLATED,
};
use ethpulse_storage::{QueryFilter, TableRef};
use tracing::debug;

use crate::{within_window, AdapterContext, FetchError, FetchRequest, SourceAdapter};

#[derive(Debug, Clone)]
pub struct InterpolateAdapter {
    spec: InterpolateTier,
}

impl InterpolateAdapter {
    pub fn new(spec: InterpolateTier) -> Self {
        Self { spec }
    }

    fn anchors(&self, today: NaiveDate) -> Vec<Anchor> {
        let mut anchors: Vec<Anchor> = self
            .spec
            .anchors
            .iter()
            .map(|a| Anchor {
                date: a.date.resolve(today),
                values: a.values.clone(),
            })
            .collect();
        anchors.sort_by_key(|a| a.date);
        anchors
    }
}

#[async_trait]
impl SourceAdapter for InterpolateAdapter {
    fn source(&self) -> &str {
        SOURCE_INTERPOLATED
    }

    fn is_synthetic(&self) -> bool {
        true
    }

    async fn fetch(
        &self,
        ctx: &AdapterContext<'_>,
        request: &FetchRequest<'_>,
    ) -> Result<Vec<Record>, FetchError> {
        let dimension = request.dimension.map(ToString::to_string);
        let records = interpolate(&self.anchors(ctx.today), &request.metric.fields)
            .into_iter()
            .map(|r| r.with_dimension(dimension.clone()))
            .collect();
        within_window(SOURCE_INTERPOLATED, records, request.window)
    }
}

#[derive(Debug, Clone)]
pub struct RegimeAdapter {
    spec: RegimeTier,
}

impl RegimeAdapter {
    pub fn new(spec: RegimeTier) -> Self {
        Self { spec }
    }

    fn regimes(&self) -> Vec<Regime> {
        self.spec
            .regimes
            .iter()
            .map(|r| Regime {
                from: r.from,
                to: r.to,
                bands: r
                    .bands
                    .iter()
                    .map(|(field, [lo, hi])| (field.clone(), (*lo, *hi)))
                    .collect(),
            })
            .collect()
    }
}

#[async_trait]
impl SourceAdapter for RegimeAdapter {
    fn source(&self) -> &str {
        SOURCE_ESTIMATED
    }

    fn is_synthetic(&self) -> bool {
        true
    }

    async fn fetch(
        &self,
        _ctx: &AdapterContext<'_>,
        request: &FetchRequest<'_>,
    ) -> Result<Vec<Record>, FetchError> {
        let records = generate_regimes(
            &request.metric.name,
            &self.regimes(),
            &request.metric.fields,
            request.window,
            request.dimension,
        );
        if records.is_empty() {
            return Err(FetchError::empty(SOURCE_ESTIMATED));
        }
        Ok(records)
    }
}

/// Annualized rolling volatility, in percent, of daily log returns.
///
/// `series` must be ascending by date. Each output point uses the `window`
/// returns ending on its date; non-positive values break the return chain.
pub fn rolling_volatility(
    series: &[(NaiveDate, f64)],
    window: usize,
    periods_per_year: f64,
) -> Vec<(NaiveDate, f64)> {
    let returns: Vec<(NaiveDate, f64)> = series
        .windows(2)
        .filter(|pair| pair[0].1 > 0.0 && pair[1].1 > 0.0)
        .map(|pair| (pair[1].0, (pair[1].1 / pair[0].1).ln()))
        .collect();

    let window = window.max(1);
    if returns.len() < window {
        return Vec::new();
    }

    returns
        .windows(window)
        .map(|slice| {
            let n = slice.len() as f64;
            let mean = slice.iter().map(|(_, r)| r).sum::<f64>() / n;
            let squares = slice.iter().map(|(_, r)| (r - mean).powi(2)).sum::<f64>();
            let variance = if slice.len() > 1 { squares / (n - 1.0) } else { 0.0 };
            let date = slice[slice.len() - 1].0;
            (date, variance.sqrt() * periods_per_year.sqrt() * 100.0)
        })
        .collect()
}

#[derive(Debug, Clone)]
pub struct DerivedAdapter {
    spec: DerivedTier,
}

impl DerivedAdapter {
    pub fn new(spec: DerivedTier) -> Self {
        Self { spec }
    }
}

#[async_trait]
impl SourceAdapter for DerivedAdapter {
    fn source(&self) -> &str {
        &self.spec.source
    }

    async fn fetch(
        &self,
        ctx: &AdapterContext<'_>,
        request: &FetchRequest<'_>,
    ) -> Result<Vec<Record>, FetchError> {
        let tier = &self.spec.source;
        let target = request.metric.field(&self.spec.field).ok_or_else(|| {
            FetchError::schema(tier, format!("metric has no field {:?}", self.spec.field))
        })?;

        let input_fields = [FieldSpec::float(self.spec.from_field.clone(), 8)];
        let lookback = chrono::Duration::days(self.spec.window as i64 + 1);
        let filter = QueryFilter {
            since: Some(request.window.start - lookback),
            until: Some(request.window.end),
            dimension: None,
        };
        let table = TableRef {
            table: &self.spec.from_table,
            fields: &input_fields,
            composite: false,
        };
        let rows = ctx
            .store
            .query(table, &filter)
            .await
            .map_err(|e| FetchError::unavailable(tier, e))?;

        let series: Vec<(NaiveDate, f64)> = rows
            .iter()
            .filter_map(|r| r.f64(&self.spec.from_field).map(|v| (r.date, v)))
            .collect();
        debug!(tier = %tier, input_rows = series.len(), "computing rolling volatility");

        let records = rolling_volatility(&series, self.spec.window, self.spec.periods_per_year)
            .into_iter()
            .map(|(date, vol)| {
                Record::new(date, SourceTag::live(tier))
                    .with_value(target.name.clone(), typed_value(target, vol))
            })
            .collect();
        within_window(tier, records, request.window)
    }
}
