//! Sync pipeline orchestration: registry-driven tiered resolution, batched
//! idempotent writes and per-metric run bookkeeping.

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use ethpulse_adapters::AdapterContext;
use ethpulse_core::{HistoryWindow, MetricSpec, QualityTag, RunState};
use ethpulse_storage::{
    HttpFetcher, HttpGet, MemoryStore, MetricStore, PgMetricStore, StoreError,
};
use futures_util::stream::{self, StreamExt};
use thiserror::Error;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

pub mod config;
pub mod control;
pub mod merge;
pub mod registry;
pub mod resolver;
pub mod writer;

pub use config::SyncConfig;
pub use control::{RunControl, RunLog};
pub use merge::{merge, overlay, SeriesMerger};
pub use registry::MetricRegistry;
pub use resolver::{Resolution, TierOutcome, TierReport, TieredResolver};
pub use writer::{series_digest, BatchWriter, WriteResult};

pub const CRATE_NAME: &str = "ethpulse-sync";

/// Metric-local failures. None of them abort the run.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("{metric}: all tiers exhausted: {detail}")]
    AllTiersExhausted { metric: String, detail: String },
    #[error("{metric}: write failed on batch {batch}/{batches}: {message}")]
    WriteFailure {
        metric: String,
        batch: usize,
        batches: usize,
        message: String,
    },
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("serializing series: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("run cancelled")]
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct MetricOutcome {
    pub metric: String,
    pub state: RunState,
    pub quality: Option<QualityTag>,
    pub records: usize,
    pub rows_written: u64,
    pub unchanged: bool,
    pub error: Option<String>,
    pub tier_reports: Vec<TierReport>,
}

impl MetricOutcome {
    fn failed(metric: &str, error: &PipelineError, tier_reports: Vec<TierReport>) -> Self {
        Self {
            metric: metric.to_string(),
            state: RunState::Failed,
            quality: None,
            records: 0,
            rows_written: 0,
            unchanged: false,
            error: Some(error.to_string()),
            tier_reports,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub succeeded: usize,
    pub partial: usize,
    pub failed: usize,
    pub estimated: usize,
    pub rows_written: u64,
    /// One entry per selected metric, in registry order.
    pub outcomes: Vec<MetricOutcome>,
}

impl RunSummary {
    pub fn has_failures(&self) -> bool {
        self.failed > 0
    }

    fn tally(&mut self, outcome: &MetricOutcome) {
        match outcome.state {
            RunState::Success => self.succeeded += 1,
            RunState::Partial => self.partial += 1,
            RunState::Failed => self.failed += 1,
        }
        if outcome.quality == Some(QualityTag::Estimated) {
            self.estimated += 1;
        }
        self.rows_written += outcome.rows_written;
    }
}

pub struct SyncPipeline {
    config: SyncConfig,
    registry: MetricRegistry,
    http: Arc<dyn HttpGet>,
    store: Arc<dyn MetricStore>,
    control: RunControl,
    today: Option<NaiveDate>,
}

impl SyncPipeline {
    pub fn new(
        config: SyncConfig,
        registry: MetricRegistry,
        http: Arc<dyn HttpGet>,
        store: Arc<dyn MetricStore>,
    ) -> Self {
        let control = RunControl::new(config.run_deadline());
        Self {
            config,
            registry,
            http,
            store,
            control,
            today: None,
        }
    }

    /// Load the registry and wire the real fetcher plus Postgres (or the
    /// in-memory store for dry runs).
    pub async fn from_config(config: SyncConfig) -> Result<Self> {
        let registry = MetricRegistry::load(&config.metrics_file).await?;
        let http: Arc<dyn HttpGet> = Arc::new(HttpFetcher::new(config.http_config())?);
        let store: Arc<dyn MetricStore> = if config.dry_run {
            info!("dry run: writing to an in-memory store");
            Arc::new(MemoryStore::new())
        } else {
            let store = PgMetricStore::connect(&config.store_config())
                .await
                .context("connecting to the metric store")?;
            store
                .ensure_schema(&registry.metrics)
                .await
                .context("preparing metric tables")?;
            Arc::new(store)
        };
        Ok(Self::new(config, registry, http, store))
    }

    pub fn with_control(mut self, control: RunControl) -> Self {
        self.control = control;
        self
    }

    /// Pin the run date instead of using the current UTC day.
    pub fn with_today(mut self, today: NaiveDate) -> Self {
        self.today = Some(today);
        self
    }

    pub fn control(&self) -> &RunControl {
        &self.control
    }

    pub fn registry(&self) -> &MetricRegistry {
        &self.registry
    }

    pub async fn run_once(&self) -> Result<RunSummary> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();
        let today = self.today.unwrap_or_else(|| started_at.date_naive());
        let window = HistoryWindow::ending_on(today, self.config.history_days);
        let selected = self.registry.select(&self.config.only)?;
        info!(
            %run_id,
            metrics = selected.len(),
            start = %window.start,
            end = %window.end,
            "sync run starting"
        );

        let (derived, independent): (Vec<_>, Vec<_>) = selected
            .iter()
            .enumerate()
            .partition(|(_, m)| m.has_derived_tier());

        let mut indexed = Vec::with_capacity(selected.len());
        for wave in [independent, derived] {
            let outcomes: Vec<(usize, MetricOutcome)> = stream::iter(wave)
                .map(|(index, metric)| async move {
                    let span = info_span!("metric", metric = %metric.name);
                    let outcome = self
                        .sync_metric(run_id, today, window, metric)
                        .instrument(span)
                        .await;
                    (index, outcome)
                })
                .buffer_unordered(self.config.metric_concurrency.max(1))
                .collect()
                .await;
            indexed.extend(outcomes);
        }
        indexed.sort_by_key(|(index, _)| *index);

        let mut summary = RunSummary {
            run_id,
            started_at,
            finished_at: started_at,
            succeeded: 0,
            partial: 0,
            failed: 0,
            estimated: 0,
            rows_written: 0,
            outcomes: Vec::with_capacity(indexed.len()),
        };
        for (_, outcome) in indexed {
            summary.tally(&outcome);
            summary.outcomes.push(outcome);
        }
        summary.finished_at = Utc::now();

        info!(
            %run_id,
            succeeded = summary.succeeded,
            partial = summary.partial,
            failed = summary.failed,
            estimated = summary.estimated,
            rows_written = summary.rows_written,
            "sync run finished"
        );
        Ok(summary)
    }

    async fn sync_metric(
        &self,
        run_id: Uuid,
        today: NaiveDate,
        window: HistoryWindow,
        metric: &MetricSpec,
    ) -> MetricOutcome {
        let store = self.store.as_ref();
        let log = RunLog::new(store, run_id);
        let writer = BatchWriter::new(
            store,
            self.config.batch_size,
            self.config.store_timeout(),
            &self.control,
        );

        let mut reports = Vec::new();
        let result = self
            .resolve_and_write(run_id, today, window, metric, &writer, &mut reports)
            .await;
        match result {
            Ok((resolution, written)) => {
                if written.unchanged {
                    log.info(&metric.name, format!("series unchanged ({})", written.digest))
                        .await;
                }
                MetricOutcome {
                    metric: metric.name.clone(),
                    state: resolution.quality.run_state(),
                    quality: Some(resolution.quality),
                    records: written.record_count,
                    rows_written: written.rows_written,
                    unchanged: written.unchanged,
                    error: None,
                    tier_reports: resolution.tier_reports,
                }
            }
            Err(err) => {
                warn!(metric = %metric.name, error = %err, "metric failed");
                log.error(&metric.name, err.to_string()).await;
                writer.record_failure(&metric.name, run_id, &err).await;
                MetricOutcome::failed(&metric.name, &err, reports)
            }
        }
    }

    async fn resolve_and_write(
        &self,
        run_id: Uuid,
        today: NaiveDate,
        window: HistoryWindow,
        metric: &MetricSpec,
        writer: &BatchWriter<'_>,
        reports: &mut Vec<TierReport>,
    ) -> Result<(Resolution, WriteResult), PipelineError> {
        self.control.check()?;
        let ctx = AdapterContext {
            run_id,
            http: self.http.as_ref(),
            store: self.store.as_ref(),
            today,
            api_keys: &self.config.api_keys,
        };
        let resolver = TieredResolver::new(ctx, window, self.config.min_rows, &self.control);
        let resolution = resolver.resolve(metric).await?;
        reports.clone_from(&resolution.tier_reports);

        let written = writer.write(metric, &resolution.records).await?;
        let note = (!resolution.failed_dimensions.is_empty()).then(|| {
            format!(
                "failed dimensions: {}",
                resolution.failed_dimensions.join(", ")
            )
        });
        writer
            .record_success(metric, run_id, resolution.quality, &written, note)
            .await?;
        Ok((resolution, written))
    }
}
