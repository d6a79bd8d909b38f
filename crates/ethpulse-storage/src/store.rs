//! Metric store interface plus the in-memory implementation used by tests and
//! dry runs.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use ethpulse_core::{
    FieldSpec, MetricSpec, Record, RecordKey, RunLogEvent, RunState, RunStatus,
};
use thiserror::Error;
use tokio::sync::Mutex;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("store call timed out after {0:?}")]
    Timeout(Duration),
    #[error("invalid identifier {0:?}")]
    InvalidIdentifier(String),
    #[error("schema error: {0}")]
    Schema(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Table name plus the typed columns needed to decode its rows.
#[derive(Debug, Clone, Copy)]
pub struct TableRef<'a> {
    pub table: &'a str,
    pub fields: &'a [FieldSpec],
    pub composite: bool,
}

impl<'a> From<&'a MetricSpec> for TableRef<'a> {
    fn from(metric: &'a MetricSpec) -> Self {
        Self {
            table: &metric.table,
            fields: &metric.fields,
            composite: metric.is_composite(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryFilter {
    pub since: Option<NaiveDate>,
    pub until: Option<NaiveDate>,
    pub dimension: Option<String>,
}

impl QueryFilter {
    pub fn matches(&self, record: &Record) -> bool {
        self.since.map_or(true, |d| record.date >= d)
            && self.until.map_or(true, |d| record.date <= d)
            && self
                .dimension
                .as_deref()
                .map_or(true, |d| record.dimension.as_deref() == Some(d))
    }
}

/// Persistence seam for metric tables and the two bookkeeping tables.
#[async_trait]
pub trait MetricStore: Send + Sync {
    /// Rows of `table` matching `filter`, ascending by date then dimension.
    async fn query(&self, table: TableRef<'_>, filter: &QueryFilter)
        -> Result<Vec<Record>, StoreError>;

    /// Insert-or-replace keyed by the metric's natural key.
    async fn upsert(&self, metric: &MetricSpec, rows: &[Record]) -> Result<u64, StoreError>;

    async fn append_log(&self, event: &RunLogEvent) -> Result<(), StoreError>;

    /// Failed updates keep the previously recorded coverage and digest.
    async fn update_status(&self, status: &RunStatus) -> Result<(), StoreError>;

    async fn status(&self, metric: &str) -> Result<Option<RunStatus>, StoreError>;
}

/// Lowercase SQL identifier: `[a-z_][a-z0-9_]*`, at most 63 bytes.
pub fn validate_identifier(name: &str) -> Result<(), StoreError> {
    let mut chars = name.chars();
    let head_ok = chars
        .next()
        .map_or(false, |c| c.is_ascii_lowercase() || c == '_');
    let tail_ok = chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');
    if head_ok && tail_ok && name.len() <= 63 {
        Ok(())
    } else {
        Err(StoreError::InvalidIdentifier(name.to_string()))
    }
}

pub(crate) fn merge_failed_status(previous: Option<&RunStatus>, failed: &RunStatus) -> RunStatus {
    match previous {
        Some(prev) => RunStatus {
            run_id: failed.run_id,
            state: RunState::Failed,
            quality: None,
            last_error: failed.last_error.clone(),
            last_run_at: failed.last_run_at,
            ..prev.clone()
        },
        None => failed.clone(),
    }
}

/// Process-local store with optional failure injection.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: Mutex<HashMap<String, BTreeMap<RecordKey, Record>>>,
    statuses: Mutex<BTreeMap<String, RunStatus>>,
    log: Mutex<Vec<RunLogEvent>>,
    upsert_calls: Mutex<HashMap<String, usize>>,
    fail_upsert_on_call: Mutex<HashMap<String, usize>>,
    fail_logs: Mutex<bool>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the `nth` (zero-based) upsert into `table` fail.
    pub async fn fail_upsert_on_call(&self, table: &str, nth: usize) {
        self.fail_upsert_on_call
            .lock()
            .await
            .insert(table.to_string(), nth);
    }

    pub async fn fail_log_writes(&self) {
        *self.fail_logs.lock().await = true;
    }

    pub async fn seed(&self, table: &str, records: Vec<Record>) {
        let mut tables = self.tables.lock().await;
        let rows = tables.entry(table.to_string()).or_default();
        for record in records {
            rows.insert(record.key(), record);
        }
    }

    pub async fn records(&self, table: &str) -> Vec<Record> {
        self.tables
            .lock()
            .await
            .get(table)
            .map(|rows| rows.values().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn table_len(&self, table: &str) -> usize {
        self.tables.lock().await.get(table).map_or(0, BTreeMap::len)
    }

    pub async fn upsert_calls(&self, table: &str) -> usize {
        self.upsert_calls
            .lock()
            .await
            .get(table)
            .copied()
            .unwrap_or(0)
    }

    pub async fn log_events(&self) -> Vec<RunLogEvent> {
        self.log.lock().await.clone()
    }

    pub async fn statuses(&self) -> BTreeMap<String, RunStatus> {
        self.statuses.lock().await.clone()
    }
}

#[async_trait]
impl MetricStore for MemoryStore {
    async fn query(
        &self,
        table: TableRef<'_>,
        filter: &QueryFilter,
    ) -> Result<Vec<Record>, StoreError> {
        validate_identifier(table.table)?;
        let tables = self.tables.lock().await;
        Ok(tables
            .get(table.table)
            .map(|rows| rows.values().filter(|r| filter.matches(r)).cloned().collect())
            .unwrap_or_default())
    }

    async fn upsert(&self, metric: &MetricSpec, rows: &[Record]) -> Result<u64, StoreError> {
        validate_identifier(&metric.table)?;
        let call = {
            let mut calls = self.upsert_calls.lock().await;
            let count = calls.entry(metric.table.clone()).or_insert(0);
            let call = *count;
            *count += 1;
            call
        };
        if self.fail_upsert_on_call.lock().await.get(&metric.table) == Some(&call) {
            return Err(StoreError::Unavailable(format!(
                "injected upsert failure on call {call} for {}",
                metric.table
            )));
        }

        let mut tables = self.tables.lock().await;
        let table = tables.entry(metric.table.clone()).or_default();
        for row in rows {
            table.insert(row.key(), row.clone());
        }
        Ok(rows.len() as u64)
    }

    async fn append_log(&self, event: &RunLogEvent) -> Result<(), StoreError> {
        if *self.fail_logs.lock().await {
            return Err(StoreError::Unavailable("log table offline".to_string()));
        }
        self.log.lock().await.push(event.clone());
        Ok(())
    }

    async fn update_status(&self, status: &RunStatus) -> Result<(), StoreError> {
        let mut statuses = self.statuses.lock().await;
        let next = if status.state == RunState::Failed {
            merge_failed_status(statuses.get(&status.metric), status)
        } else {
            status.clone()
        };
        statuses.insert(status.metric.clone(), next);
        Ok(())
    }

    async fn status(&self, metric: &str) -> Result<Option<RunStatus>, StoreError> {
        Ok(self.statuses.lock().await.get(metric).cloned())
    }
}
