//! Sequential, bounded-batch upserts plus the per-metric status row.

use std::time::Duration;

use chrono::{NaiveDate, Utc};
use ethpulse_core::{MetricSpec, QualityTag, Record, RunStatus};
use ethpulse_storage::{MetricStore, StoreError};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::control::RunControl;
use crate::PipelineError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteResult {
    pub rows_written: u64,
    pub batches: usize,
    pub record_count: usize,
    pub first_date: Option<NaiveDate>,
    pub last_date: Option<NaiveDate>,
    pub digest: String,
    /// Digest matches the one recorded by the previous successful run.
    pub unchanged: bool,
}

/// SHA-256 over the canonical JSON of the series, hex encoded.
pub fn series_digest(records: &[Record]) -> Result<String, serde_json::Error> {
    let bytes = serde_json::to_vec(records)?;
    Ok(hex::encode(Sha256::digest(&bytes)))
}

pub struct BatchWriter<'a> {
    store: &'a dyn MetricStore,
    batch_size: usize,
    batch_timeout: Duration,
    control: &'a RunControl,
}

impl<'a> BatchWriter<'a> {
    pub fn new(
        store: &'a dyn MetricStore,
        batch_size: usize,
        batch_timeout: Duration,
        control: &'a RunControl,
    ) -> Self {
        Self {
            store,
            batch_size: batch_size.max(1),
            batch_timeout,
            control,
        }
    }

    pub async fn write(
        &self,
        metric: &MetricSpec,
        records: &[Record],
    ) -> Result<WriteResult, PipelineError> {
        let digest = series_digest(records)?;
        let previous = self
            .store
            .status(&metric.name)
            .await?
            .and_then(|s| s.series_digest);
        let unchanged = previous.as_deref() == Some(digest.as_str());

        let batches = records.len().div_ceil(self.batch_size);
        let mut rows_written = 0;
        for (index, chunk) in records.chunks(self.batch_size).enumerate() {
            self.control.check()?;
            let attempt = tokio::time::timeout(self.batch_timeout, self.store.upsert(metric, chunk))
                .await
                .unwrap_or(Err(StoreError::Timeout(self.batch_timeout)));
            match attempt {
                Ok(affected) => {
                    debug!(
                        metric = %metric.name,
                        batch = index + 1,
                        batches,
                        rows = chunk.len(),
                        "batch upserted"
                    );
                    rows_written += affected;
                }
                Err(err) => {
                    return Err(PipelineError::WriteFailure {
                        metric: metric.name.clone(),
                        batch: index + 1,
                        batches,
                        message: err.to_string(),
                    });
                }
            }
        }

        Ok(WriteResult {
            rows_written,
            batches,
            record_count: records.len(),
            first_date: records.iter().map(|r| r.date).min(),
            last_date: records.iter().map(|r| r.date).max(),
            digest,
            unchanged,
        })
    }

    pub async fn record_success(
        &self,
        metric: &MetricSpec,
        run_id: Uuid,
        quality: QualityTag,
        result: &WriteResult,
        note: Option<String>,
    ) -> Result<(), StoreError> {
        let status = RunStatus {
            metric: metric.name.clone(),
            run_id,
            state: quality.run_state(),
            quality: Some(quality),
            record_count: result.record_count as u64,
            first_date: result.first_date,
            last_date: result.last_date,
            last_error: note,
            series_digest: Some(result.digest.clone()),
            last_run_at: Utc::now(),
        };
        self.store.update_status(&status).await?;
        info!(
            metric = %metric.name,
            state = status.state.as_str(),
            quality = quality.as_str(),
            records = result.record_count,
            unchanged = result.unchanged,
            "status recorded"
        );
        Ok(())
    }

    /// Never propagates; a failed status write is only logged.
    pub async fn record_failure(&self, metric: &str, run_id: Uuid, error: &PipelineError) {
        let status = RunStatus::failed(metric, run_id, error);
        if let Err(err) = self.store.update_status(&status).await {
            warn!(metric, error = %err, "could not record failed status");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethpulse_core::{FieldSpec, FieldValue, HistoryMode, KeyKind, RunState, SourceTag};
    use ethpulse_storage::MemoryStore;

    fn metric() -> MetricSpec {
        MetricSpec {
            name: "gas_used".into(),
            table: "eth_gas_used_daily".into(),
            description: None,
            history: HistoryMode::Long,
            key: KeyKind::Date,
            dimensions: vec![],
            min_rows: None,
            fields: vec![FieldSpec::integer("gas_used")],
            tiers: vec![],
            enrichment: None,
        }
    }

    fn series(n: usize) -> Vec<Record> {
        NaiveDate::from_ymd_opt(2024, 1, 1)
            .unwrap()
            .iter_days()
            .take(n)
            .enumerate()
            .map(|(i, d)| {
                Record::new(d, SourceTag::live("etherscan"))
                    .with_value("gas_used", FieldValue::Integer(i as i64 * 1_000))
            })
            .collect()
    }

    #[tokio::test]
    async fn splits_into_sequential_batches() {
        let store = MemoryStore::new();
        let control = RunControl::new(None);
        let writer = BatchWriter::new(&store, 500, Duration::from_secs(5), &control);
        let result = writer.write(&metric(), &series(1200)).await.unwrap();
        assert_eq!(result.batches, 3);
        assert_eq!(result.rows_written, 1200);
        assert_eq!(store.upsert_calls("eth_gas_used_daily").await, 3);
        assert_eq!(result.first_date, NaiveDate::from_ymd_opt(2024, 1, 1));
        assert_eq!(result.digest.len(), 64);
    }

    #[tokio::test]
    async fn failing_batch_aborts_the_rest() {
        let store = MemoryStore::new();
        store.fail_upsert_on_call("eth_gas_used_daily", 1).await;
        let control = RunControl::new(None);
        let writer = BatchWriter::new(&store, 100, Duration::from_secs(5), &control);

        let err = writer.write(&metric(), &series(450)).await.unwrap_err();
        match err {
            PipelineError::WriteFailure { batch, batches, .. } => {
                assert_eq!(batch, 2);
                assert_eq!(batches, 5);
            }
            other => panic!("unexpected error {other}"),
        }
        assert_eq!(store.upsert_calls("eth_gas_used_daily").await, 2);
        assert_eq!(store.table_len("eth_gas_used_daily").await, 100);
    }

    #[tokio::test]
    async fn rewriting_the_same_series_is_idempotent_and_unchanged() {
        let store = MemoryStore::new();
        let control = RunControl::new(None);
        let writer = BatchWriter::new(&store, 50, Duration::from_secs(5), &control);
        let run_id = Uuid::new_v4();

        let first = writer.write(&metric(), &series(120)).await.unwrap();
        assert!(!first.unchanged);
        writer
            .record_success(&metric(), run_id, QualityTag::Success, &first, None)
            .await
            .unwrap();

        let second = writer.write(&metric(), &series(120)).await.unwrap();
        assert!(second.unchanged);
        assert_eq!(store.table_len("eth_gas_used_daily").await, 120);

        let status = store.status("gas_used").await.unwrap().unwrap();
        assert_eq!(status.state, RunState::Success);
        assert_eq!(status.series_digest, Some(first.digest));
    }

    #[tokio::test]
    async fn failure_status_keeps_previous_coverage() {
        let store = MemoryStore::new();
        let control = RunControl::new(None);
        let writer = BatchWriter::new(&store, 50, Duration::from_secs(5), &control);
        let run_id = Uuid::new_v4();
        let result = writer.write(&metric(), &series(10)).await.unwrap();
        writer
            .record_success(&metric(), run_id, QualityTag::Estimated, &result, None)
            .await
            .unwrap();

        writer
            .record_failure("gas_used", Uuid::new_v4(), &PipelineError::Cancelled)
            .await;
        let status = store.status("gas_used").await.unwrap().unwrap();
        assert_eq!(status.state, RunState::Failed);
        assert_eq!(status.record_count, 10);
        assert_eq!(status.last_error.as_deref(), Some("run cancelled"));
    }

    #[tokio::test]
    async fn cancellation_is_checked_before_each_batch() {
        let store = MemoryStore::new();
        let control = RunControl::new(None);
        control.cancel();
        let writer = BatchWriter::new(&store, 50, Duration::from_secs(5), &control);
        let err = writer.write(&metric(), &series(10)).await.unwrap_err();
        assert!(matches!(err, PipelineError::Cancelled));
        assert_eq!(store.upsert_calls("eth_gas_used_daily").await, 0);
    }
}
