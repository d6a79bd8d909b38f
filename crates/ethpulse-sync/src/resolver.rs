//! Tiered resolution of one metric: live tiers in priority order, synthetic
//! fill when no live tier is sufficient, optional same-day enrichment.

use std::fmt;

use ethpulse_adapters::{adapter_for_tier, AdapterContext, FetchRequest, SourceAdapter};
use ethpulse_core::{HistoryMode, HistoryWindow, MetricSpec, QualityTag, Record};
use tracing::{debug, info, warn};

use crate::control::{RunControl, RunLog};
use crate::merge::{overlay, SeriesMerger};
use crate::PipelineError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TierOutcome {
    /// The sub-series reached its row threshold with this tier.
    Sufficient,
    /// Rows were kept but the threshold is still unmet.
    Insufficient,
    /// The tier failed; the string is the fetch error kind.
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TierReport {
    pub source: String,
    pub dimension: Option<String>,
    pub rows: usize,
    pub outcome: TierOutcome,
    pub message: Option<String>,
}

impl fmt::Display for TierReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tier {}", self.source)?;
        if let Some(dim) = &self.dimension {
            write!(f, " [{dim}]")?;
        }
        match &self.outcome {
            TierOutcome::Sufficient => write!(f, ": {} rows, sufficient", self.rows),
            TierOutcome::Insufficient => write!(f, ": {} rows, insufficient", self.rows),
            TierOutcome::Failed(kind) => write!(
                f,
                ": failed ({kind}){}",
                self.message
                    .as_deref()
                    .map(|m| format!(": {m}"))
                    .unwrap_or_default()
            ),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Resolution {
    pub records: Vec<Record>,
    pub quality: QualityTag,
    pub tier_reports: Vec<TierReport>,
    pub failed_dimensions: Vec<String>,
}

struct SubSeries {
    records: Vec<Record>,
    synthetic: bool,
}

pub struct TieredResolver<'a> {
    ctx: AdapterContext<'a>,
    window: HistoryWindow,
    default_min_rows: usize,
    control: &'a RunControl,
    log: RunLog<'a>,
}

impl<'a> TieredResolver<'a> {
    pub fn new(
        ctx: AdapterContext<'a>,
        window: HistoryWindow,
        default_min_rows: usize,
        control: &'a RunControl,
    ) -> Self {
        Self {
            log: RunLog::new(ctx.store, ctx.run_id),
            ctx,
            window,
            default_min_rows,
            control,
        }
    }

    /// Distinct keys a sub-series needs before lower tiers are skipped.
    pub fn required_rows(&self, metric: &MetricSpec) -> usize {
        match metric.history {
            HistoryMode::Snapshot => 1,
            HistoryMode::Long => metric
                .min_rows
                .unwrap_or(self.default_min_rows)
                .min(self.window.days())
                .max(1),
        }
    }

    pub async fn resolve(&self, metric: &MetricSpec) -> Result<Resolution, PipelineError> {
        let adapters: Vec<Box<dyn SourceAdapter>> =
            metric.tiers.iter().map(adapter_for_tier).collect();
        let enrichment = metric.enrichment.as_ref().map(adapter_for_tier);
        self.resolve_with(metric, &adapters, enrichment.as_deref())
            .await
    }

    /// Resolve with explicit adapters, in priority order.
    pub async fn resolve_with(
        &self,
        metric: &MetricSpec,
        adapters: &[Box<dyn SourceAdapter>],
        enrichment: Option<&dyn SourceAdapter>,
    ) -> Result<Resolution, PipelineError> {
        let mut reports = Vec::new();
        let mut failed_dimensions = Vec::new();
        let mut failures = Vec::new();
        let mut merged = SeriesMerger::new();
        let mut synthetic = false;

        for dimension in metric.sub_series() {
            let sub = self
                .resolve_sub_series(metric, adapters, dimension.as_deref(), &mut reports)
                .await?;
            if sub.records.is_empty() {
                let label = dimension.clone().unwrap_or_else(|| metric.name.clone());
                warn!(metric = %metric.name, sub_series = %label, "every tier failed");
                failures.push(label.clone());
                if let Some(dim) = dimension {
                    failed_dimensions.push(dim);
                }
                continue;
            }
            synthetic |= sub.synthetic;
            merged.absorb(sub.records);
        }

        if merged.is_empty() {
            let detail = reports
                .iter()
                .filter_map(|r| match &r.outcome {
                    TierOutcome::Failed(_) => Some(r.to_string()),
                    _ => None,
                })
                .collect::<Vec<_>>()
                .join("; ");
            return Err(PipelineError::AllTiersExhausted {
                metric: metric.name.clone(),
                detail: if detail.is_empty() {
                    format!("no rows for {}", failures.join(", "))
                } else {
                    detail
                },
            });
        }

        let mut records = merged.into_records();
        if let Some(adapter) = enrichment {
            self.control.check()?;
            records = self
                .enrich(metric, adapter, records, &failed_dimensions, &mut reports)
                .await;
        }

        let quality = if synthetic {
            QualityTag::Estimated
        } else if !failed_dimensions.is_empty() {
            QualityTag::Partial
        } else {
            QualityTag::Success
        };

        Ok(Resolution {
            records,
            quality,
            tier_reports: reports,
            failed_dimensions,
        })
    }

    async fn resolve_sub_series(
        &self,
        metric: &MetricSpec,
        adapters: &[Box<dyn SourceAdapter>],
        dimension: Option<&str>,
        reports: &mut Vec<TierReport>,
    ) -> Result<SubSeries, PipelineError> {
        let required = self.required_rows(metric);
        let request = FetchRequest {
            metric,
            window: self.window,
            dimension,
        };
        let mut merger = SeriesMerger::new();

        for adapter in adapters.iter().filter(|a| !a.is_synthetic()) {
            self.control.check()?;
            let report = self.attempt(adapter.as_ref(), &request, &mut merger, required).await;
            let done = report.outcome == TierOutcome::Sufficient;
            self.report(metric, report, reports).await;
            if done {
                return Ok(SubSeries {
                    records: merger.into_records(),
                    synthetic: false,
                });
            }
        }

        let live_rows = merger.len();
        for adapter in adapters.iter().filter(|a| a.is_synthetic()) {
            self.control.check()?;
            let report = self.attempt(adapter.as_ref(), &request, &mut merger, required).await;
            self.report(metric, report, reports).await;
        }
        let synthetic = merger.len() > live_rows;
        if synthetic {
            debug!(
                metric = %metric.name,
                live_rows,
                filled = merger.len() - live_rows,
                "synthetic tiers filled the series"
            );
        }

        Ok(SubSeries {
            records: merger.into_records(),
            synthetic,
        })
    }

    async fn attempt(
        &self,
        adapter: &dyn SourceAdapter,
        request: &FetchRequest<'_>,
        merger: &mut SeriesMerger,
        required: usize,
    ) -> TierReport {
        let mut report = TierReport {
            source: adapter.source().to_string(),
            dimension: request.dimension.map(ToString::to_string),
            rows: 0,
            outcome: TierOutcome::Insufficient,
            message: None,
        };
        match adapter.fetch(&self.ctx, request).await {
            Ok(rows) => {
                report.rows = rows.len();
                merger.absorb(rows);
                if merger.len() >= required {
                    report.outcome = TierOutcome::Sufficient;
                }
            }
            Err(err) => {
                report.outcome = TierOutcome::Failed(err.kind().to_string());
                report.message = Some(err.to_string());
            }
        }
        report
    }

    async fn report(&self, metric: &MetricSpec, report: TierReport, reports: &mut Vec<TierReport>) {
        match report.outcome {
            TierOutcome::Failed(_) => {
                warn!(metric = %metric.name, "{report}");
                self.log.warn(&metric.name, report.to_string()).await;
            }
            _ => {
                info!(metric = %metric.name, "{report}");
                self.log.info(&metric.name, report.to_string()).await;
            }
        }
        reports.push(report);
    }

    /// Replace today's record of each resolved sub-series with the enrichment
    /// tier's snapshot. Failures are reported and otherwise ignored.
    async fn enrich(
        &self,
        metric: &MetricSpec,
        adapter: &dyn SourceAdapter,
        records: Vec<Record>,
        failed_dimensions: &[String],
        reports: &mut Vec<TierReport>,
    ) -> Vec<Record> {
        let window = HistoryWindow::ending_on(self.ctx.today, 1);
        let mut snapshots = Vec::new();

        for dimension in metric.sub_series() {
            if dimension.as_ref().is_some_and(|d| failed_dimensions.contains(d)) {
                continue;
            }
            let request = FetchRequest {
                metric,
                window,
                dimension: dimension.as_deref(),
            };
            let mut report = TierReport {
                source: adapter.source().to_string(),
                dimension: dimension.clone(),
                rows: 0,
                outcome: TierOutcome::Sufficient,
                message: Some("enrichment".to_string()),
            };
            match adapter.fetch(&self.ctx, &request).await {
                Ok(rows) => {
                    let today = rows
                        .into_iter()
                        .find(|r| r.date == self.ctx.today)
                        .map(|r| r.with_dimension(dimension.clone()));
                    report.rows = usize::from(today.is_some());
                    snapshots.extend(today);
                }
                Err(err) => {
                    report.outcome = TierOutcome::Failed(err.kind().to_string());
                    report.message = Some(format!("enrichment: {err}"));
                }
            }
            self.report(metric, report, reports).await;
        }

        overlay(records, snapshots)
    }
}
