//! Postgres-backed [`MetricStore`].

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use ethpulse_core::{
    FieldKind, FieldSpec, FieldValue, MetricSpec, QualityTag, Record, RunLogEvent, RunState,
    RunStatus, SourceTag,
};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{Postgres, QueryBuilder, Row};
use tracing::{debug, info};

use crate::store::{validate_identifier, MetricStore, QueryFilter, StoreError, TableRef};

#[derive(Debug, Clone)]
pub struct PgStoreConfig {
    pub database_url: String,
    pub max_connections: u32,
    /// Upper bound for any single store call.
    pub call_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct PgMetricStore {
    pool: PgPool,
    call_timeout: Duration,
}

fn column_type(kind: FieldKind) -> &'static str {
    match kind {
        FieldKind::Float => "DOUBLE PRECISION",
        FieldKind::Integer => "BIGINT",
        FieldKind::Text => "TEXT",
    }
}

fn conflict_target(composite: bool) -> &'static str {
    if composite {
        "date, dimension"
    } else {
        "date"
    }
}

/// DDL for one metric table. The primary key is the natural key.
pub fn create_table_sql(metric: &MetricSpec) -> Result<String, StoreError> {
    validate_identifier(&metric.table)?;
    let mut columns = vec![
        "date DATE NOT NULL".to_string(),
        "\"timestamp\" BIGINT".to_string(),
    ];
    if metric.is_composite() {
        columns.push("dimension TEXT NOT NULL".to_string());
    }
    for field in &metric.fields {
        validate_identifier(&field.name)?;
        columns.push(format!("{} {}", field.name, column_type(field.kind)));
    }
    columns.push("source TEXT NOT NULL".to_string());
    columns.push("updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()".to_string());
    columns.push(format!(
        "PRIMARY KEY ({})",
        conflict_target(metric.is_composite())
    ));
    Ok(format!(
        "CREATE TABLE IF NOT EXISTS {} (\n    {}\n)",
        metric.table,
        columns.join(",\n    ")
    ))
}

fn bind_field<'args>(
    b: &mut sqlx::query_builder::Separated<'_, 'args, Postgres, &'static str>,
    field: &FieldSpec,
    value: Option<&FieldValue>,
) {
    match field.kind {
        FieldKind::Float => {
            b.push_bind(value.and_then(FieldValue::as_f64));
        }
        FieldKind::Integer => {
            let v = value.and_then(|v| match v {
                FieldValue::Integer(i) => Some(*i),
                FieldValue::Float(f) => Some(f.round() as i64),
                FieldValue::Text(_) => None,
            });
            b.push_bind(v);
        }
        FieldKind::Text => {
            b.push_bind(value.and_then(FieldValue::as_text).map(ToString::to_string));
        }
    }
}

fn decode_field(row: &PgRow, field: &FieldSpec) -> Result<Option<FieldValue>, sqlx::Error> {
    let name = field.name.as_str();
    Ok(match field.kind {
        FieldKind::Float => row.try_get::<Option<f64>, _>(name)?.map(FieldValue::Float),
        FieldKind::Integer => row.try_get::<Option<i64>, _>(name)?.map(FieldValue::Integer),
        FieldKind::Text => row.try_get::<Option<String>, _>(name)?.map(FieldValue::Text),
    })
}

fn parse_state(raw: &str) -> Result<RunState, StoreError> {
    match raw {
        "success" => Ok(RunState::Success),
        "partial" => Ok(RunState::Partial),
        "failed" => Ok(RunState::Failed),
        other => Err(StoreError::Schema(format!("unknown run status {other:?}"))),
    }
}

fn parse_quality(raw: &str) -> Result<QualityTag, StoreError> {
    match raw {
        "success" => Ok(QualityTag::Success),
        "partial" => Ok(QualityTag::Partial),
        "estimated" => Ok(QualityTag::Estimated),
        other => Err(StoreError::Schema(format!("unknown quality tag {other:?}"))),
    }
}

impl PgMetricStore {
    pub async fn connect(config: &PgStoreConfig) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections.max(1))
            .acquire_timeout(config.call_timeout)
            .connect(&config.database_url)
            .await?;
        Ok(Self {
            pool,
            call_timeout: config.call_timeout,
        })
    }

    pub fn from_pool(pool: PgPool, call_timeout: Duration) -> Self {
        Self { pool, call_timeout }
    }

    async fn bounded<T, F>(&self, fut: F) -> Result<T, StoreError>
    where
        F: Future<Output = Result<T, StoreError>>,
    {
        tokio::time::timeout(self.call_timeout, fut)
            .await
            .map_err(|_| StoreError::Timeout(self.call_timeout))?
    }

    /// Apply bookkeeping migrations, then create any missing metric tables
    /// and columns.
    pub async fn ensure_schema(&self, metrics: &[MetricSpec]) -> Result<(), StoreError> {
        sqlx::migrate!().run(&self.pool).await?;

        for metric in metrics {
            let ddl = create_table_sql(metric)?;
            sqlx::query(&ddl).execute(&self.pool).await?;
            for field in &metric.fields {
                let alter = format!(
                    "ALTER TABLE {} ADD COLUMN IF NOT EXISTS {} {}",
                    metric.table,
                    field.name,
                    column_type(field.kind)
                );
                sqlx::query(&alter).execute(&self.pool).await?;
            }
            debug!(table = %metric.table, "metric table ready");
        }
        info!(tables = metrics.len(), "schema ensured");
        Ok(())
    }
}

#[async_trait]
impl MetricStore for PgMetricStore {
    async fn query(
        &self,
        table: TableRef<'_>,
        filter: &QueryFilter,
    ) -> Result<Vec<Record>, StoreError> {
        validate_identifier(table.table)?;
        for field in table.fields {
            validate_identifier(&field.name)?;
        }

        let mut qb = QueryBuilder::<Postgres>::new("SELECT date, \"timestamp\", source");
        if table.composite {
            qb.push(", dimension");
        }
        for field in table.fields {
            qb.push(", ").push(&field.name);
        }
        qb.push(" FROM ").push(table.table).push(" WHERE TRUE");
        if let Some(since) = filter.since {
            qb.push(" AND date >= ").push_bind(since);
        }
        if let Some(until) = filter.until {
            qb.push(" AND date <= ").push_bind(until);
        }
        if let (true, Some(dimension)) = (table.composite, filter.dimension.clone()) {
            qb.push(" AND dimension = ").push_bind(dimension);
        }
        qb.push(" ORDER BY ").push(conflict_target(table.composite));

        let rows = self
            .bounded(async { Ok::<_, StoreError>(qb.build().fetch_all(&self.pool).await?) })
            .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let date: NaiveDate = row.try_get("date")?;
            let source: String = row.try_get("source")?;
            let mut record = Record::new(date, SourceTag::from(source));
            record.timestamp = row.try_get("timestamp")?;
            if table.composite {
                record.dimension = Some(row.try_get("dimension")?);
            }
            for field in table.fields {
                if let Some(value) = decode_field(&row, field)? {
                    record.values.insert(field.name.clone(), value);
                }
            }
            out.push(record);
        }
        Ok(out)
    }

    async fn upsert(&self, metric: &MetricSpec, rows: &[Record]) -> Result<u64, StoreError> {
        if rows.is_empty() {
            return Ok(0);
        }
        validate_identifier(&metric.table)?;
        for field in &metric.fields {
            validate_identifier(&field.name)?;
        }
        let composite = metric.is_composite();

        let mut qb = QueryBuilder::<Postgres>::new("INSERT INTO ");
        qb.push(&metric.table).push(" (date, \"timestamp\"");
        if composite {
            qb.push(", dimension");
        }
        for field in &metric.fields {
            qb.push(", ").push(&field.name);
        }
        qb.push(", source) ");

        qb.push_values(rows, |mut b, row| {
            b.push_bind(row.date);
            b.push_bind(row.timestamp);
            if composite {
                b.push_bind(row.dimension.clone().unwrap_or_default());
            }
            for field in &metric.fields {
                bind_field(&mut b, field, row.value(&field.name));
            }
            b.push_bind(row.source.as_str().to_string());
        });

        qb.push(" ON CONFLICT (")
            .push(conflict_target(composite))
            .push(") DO UPDATE SET \"timestamp\" = EXCLUDED.\"timestamp\"");
        for field in &metric.fields {
            qb.push(", ")
                .push(&field.name)
                .push(" = EXCLUDED.")
                .push(&field.name);
        }
        qb.push(", source = EXCLUDED.source, updated_at = NOW()");

        let result = self
            .bounded(async { Ok::<_, StoreError>(qb.build().execute(&self.pool).await?) })
            .await?;
        Ok(result.rows_affected())
    }

    async fn append_log(&self, event: &RunLogEvent) -> Result<(), StoreError> {
        self.bounded(async {
            sqlx::query(
                r#"
                INSERT INTO ingest_run_log (run_id, metric_name, level, message, created_at)
                VALUES ($1, $2, $3, $4, $5)
                "#,
            )
            .bind(event.run_id)
            .bind(event.metric.as_deref())
            .bind(event.level.as_str())
            .bind(&event.message)
            .bind(event.created_at)
            .execute(&self.pool)
            .await?;
            Ok::<_, StoreError>(())
        })
        .await
    }

    async fn update_status(&self, status: &RunStatus) -> Result<(), StoreError> {
        let sql = if status.state == RunState::Failed {
            r#"
            INSERT INTO metric_run_status
                (metric_name, run_id, status, quality, record_count, first_date, last_date,
                 last_error, series_digest, last_run_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (metric_name) DO UPDATE SET
                run_id = EXCLUDED.run_id,
                status = EXCLUDED.status,
                quality = NULL,
                last_error = EXCLUDED.last_error,
                last_run_at = EXCLUDED.last_run_at
            "#
        } else {
            r#"
            INSERT INTO metric_run_status
                (metric_name, run_id, status, quality, record_count, first_date, last_date,
                 last_error, series_digest, last_run_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (metric_name) DO UPDATE SET
                run_id = EXCLUDED.run_id,
                status = EXCLUDED.status,
                quality = EXCLUDED.quality,
                record_count = EXCLUDED.record_count,
                first_date = EXCLUDED.first_date,
                last_date = EXCLUDED.last_date,
                last_error = EXCLUDED.last_error,
                series_digest = EXCLUDED.series_digest,
                last_run_at = EXCLUDED.last_run_at
            "#
        };

        self.bounded(async {
            sqlx::query(sql)
                .bind(&status.metric)
                .bind(status.run_id)
                .bind(status.state.as_str())
                .bind(status.quality.map(QualityTag::as_str))
                .bind(i64::try_from(status.record_count).unwrap_or(i64::MAX))
                .bind(status.first_date)
                .bind(status.last_date)
                .bind(status.last_error.as_deref())
                .bind(status.series_digest.as_deref())
                .bind(status.last_run_at)
                .execute(&self.pool)
                .await?;
            Ok::<_, StoreError>(())
        })
        .await
    }

    async fn status(&self, metric: &str) -> Result<Option<RunStatus>, StoreError> {
        let row = self
            .bounded(async {
                Ok::<_, StoreError>(sqlx::query(
                    r#"
                    SELECT metric_name, run_id, status, quality, record_count, first_date,
                           last_date, last_error, series_digest, last_run_at
                      FROM metric_run_status
                     WHERE metric_name = $1
                    "#,
                )
                .bind(metric)
                .fetch_optional(&self.pool)
                .await?)
            })
            .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let state: String = row.try_get("status")?;
        let quality: Option<String> = row.try_get("quality")?;
        let record_count: i64 = row.try_get("record_count")?;
        Ok(Some(RunStatus {
            metric: row.try_get("metric_name")?,
            run_id: row.try_get("run_id")?,
            state: parse_state(&state)?,
            quality: quality.as_deref().map(parse_quality).transpose()?,
            record_count: record_count.max(0) as u64,
            first_date: row.try_get("first_date")?,
            last_date: row.try_get("last_date")?,
            last_error: row.try_get("last_error")?,
            series_digest: row.try_get("series_digest")?,
            last_run_at: row.try_get("last_run_at")?,
        }))
    }
}
