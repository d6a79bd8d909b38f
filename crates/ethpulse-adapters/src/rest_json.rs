//! REST-JSON source tier: templated GET, dotted-path extraction and
//! backward end-cursor pagination.

use async_trait::async_trait;
use chrono::NaiveDate;
use ethpulse_core::{midnight_timestamp, Pagination, RawDate, RawRow, RawValue, Record, RestJsonTier};
use serde_json::Value as JsonValue;
use tracing::{debug, warn};

use crate::{
    get_body, normalize_rows, render_url, window_vars, within_window, AdapterContext, FetchError,
    FetchRequest, SourceAdapter,
};

/// Walk a dotted path. Numeric segments index arrays; an empty path is the value itself.
pub fn json_path<'a>(value: &'a JsonValue, path: &str) -> Option<&'a JsonValue> {
    if path.is_empty() {
        return Some(value);
    }
    path.split('.').try_fold(value, |cur, segment| match cur {
        JsonValue::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => cur.get(segment),
    })
}

fn scalar_text(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::String(s) => Some(s.clone()),
        JsonValue::Number(n) => Some(n.to_string()),
        JsonValue::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn raw_value(value: Option<&JsonValue>) -> RawValue {
    match value {
        Some(JsonValue::Number(n)) => n.as_f64().map_or(RawValue::Missing, RawValue::Number),
        Some(JsonValue::String(s)) => RawValue::Text(s.clone()),
        _ => RawValue::Missing,
    }
}

fn raw_date(value: Option<&JsonValue>) -> RawDate {
    match value {
        Some(JsonValue::Number(n)) => match n.as_i64() {
            Some(v) => RawDate::Unix(v),
            None => RawDate::Unix(n.as_f64().unwrap_or_default() as i64),
        },
        Some(JsonValue::String(s)) => RawDate::Text(s.clone()),
        _ => RawDate::Text(String::new()),
    }
}

#[derive(Debug, Clone)]
pub struct RestJsonAdapter {
    spec: RestJsonTier,
}

impl RestJsonAdapter {
    pub fn new(spec: RestJsonTier) -> Self {
        Self { spec }
    }

    async fn fetch_json(
        &self,
        ctx: &AdapterContext<'_>,
        url: &str,
    ) -> Result<JsonValue, FetchError> {
        let body = get_body(ctx, &self.spec.source, url).await?;
        let json: JsonValue = serde_json::from_slice(&body)
            .map_err(|e| FetchError::schema(&self.spec.source, format!("invalid JSON: {e}")))?;
        self.check_status(&json)?;
        Ok(json)
    }

    /// Sources such as Etherscan report errors inside a 200 body.
    fn check_status(&self, body: &JsonValue) -> Result<(), FetchError> {
        let Some(path) = self.spec.status_path.as_deref() else {
            return Ok(());
        };
        let expected = self.spec.ok_value.as_deref().unwrap_or("1");
        let actual = json_path(body, path).and_then(scalar_text);
        if actual.as_deref() == Some(expected) {
            return Ok(());
        }
        let detail = ["message", "result", "error"]
            .iter()
            .find_map(|key| body.get(*key).and_then(scalar_text))
            .unwrap_or_default();
        Err(FetchError::unavailable(
            &self.spec.source,
            format!(
                "status {} at {path}: {detail}",
                actual.unwrap_or_else(|| "<missing>".to_string())
            ),
        ))
    }

    fn extract_rows(
        &self,
        body: &JsonValue,
        ctx: &AdapterContext<'_>,
        request: &FetchRequest<'_>,
    ) -> Result<Vec<RawRow>, FetchError> {
        let tier = &self.spec.source;
        let rows_path = self.spec.rows_path.as_deref().unwrap_or_default();
        let rows = json_path(body, rows_path)
            .ok_or_else(|| FetchError::schema(tier, format!("missing rows at {rows_path:?}")))?;
        let items: Vec<&JsonValue> = match rows {
            JsonValue::Array(items) => items.iter().collect(),
            JsonValue::Object(_) => vec![rows],
            other => {
                return Err(FetchError::schema(
                    tier,
                    format!("rows at {rows_path:?} are neither array nor object: {other}"),
                ))
            }
        };

        let any_value_present = items.iter().any(|item| {
            self.spec
                .values
                .values()
                .any(|path| json_path(item, path).map_or(false, |v| !v.is_null()))
        });
        if !items.is_empty() && !any_value_present {
            return Err(FetchError::schema(tier, "no configured value path present in rows"));
        }

        Ok(items
            .into_iter()
            .map(|item| {
                let mut raw = match &self.spec.date {
                    Some(date) => {
                        RawRow::new(raw_date(json_path(item, &date.field))).with_format(date.format)
                    }
                    None => RawRow::new(RawDate::Day(ctx.today)),
                };
                raw.dimension = request.dimension.map(ToString::to_string);
                for (field, path) in &self.spec.values {
                    raw = raw.with_value(field.clone(), raw_value(json_path(item, path)));
                }
                raw
            })
            .collect())
    }

    async fn fetch_pages(
        &self,
        ctx: &AdapterContext<'_>,
        request: &FetchRequest<'_>,
        pagination: Pagination,
    ) -> Result<Vec<Record>, FetchError> {
        let tier = &self.spec.source;
        let page_size = pagination.page_size.max(1);
        let max_pages = pagination
            .max_pages
            .unwrap_or_else(|| request.window.days().div_ceil(page_size) + 1);

        let mut vars = window_vars(ctx, request, self.spec.api_key.as_deref());
        vars.insert("limit", page_size.to_string());

        let mut gathered = Vec::new();
        let mut earliest_seen: Option<NaiveDate> = None;
        for page in 0..max_pages {
            let url = render_url(tier, &self.spec.url, &vars)?;
            let body = match self.fetch_json(ctx, &url).await {
                Ok(body) => body,
                Err(err) if page > 0 && !gathered.is_empty() => {
                    warn!(tier = %tier, page, error = %err, "stopping pagination early");
                    break;
                }
                Err(err) => return Err(err),
            };
            let rows = self.extract_rows(&body, ctx, request)?;
            let records = normalize_rows(tier, rows, request.metric);
            let Some(earliest) = records.iter().map(|r| r.date).min() else {
                break;
            };
            if earliest_seen.map_or(false, |seen| earliest >= seen) {
                debug!(tier = %tier, page, "cursor made no progress");
                break;
            }
            earliest_seen = Some(earliest);
            gathered.extend(records);
            if earliest <= request.window.start {
                break;
            }
            // Last second of the day before the earliest row.
            vars.insert("to_ts", (midnight_timestamp(earliest) - 1).to_string());
        }
        Ok(gathered)
    }
}

#[async_trait]
impl SourceAdapter for RestJsonAdapter {
    fn source(&self) -> &str {
        &self.spec.source
    }

    async fn fetch(
        &self,
        ctx: &AdapterContext<'_>,
        request: &FetchRequest<'_>,
    ) -> Result<Vec<Record>, FetchError> {
        let records = match self.spec.pagination {
            Some(pagination) => self.fetch_pages(ctx, request, pagination).await?,
            None => {
                let vars = window_vars(ctx, request, self.spec.api_key.as_deref());
                let url = render_url(&self.spec.source, &self.spec.url, &vars)?;
                let body = self.fetch_json(ctx, &url).await?;
                let rows = self.extract_rows(&body, ctx, request)?;
                normalize_rows(&self.spec.source, rows, request.metric)
            }
        };
        within_window(&self.spec.source, records, request.window)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{fixture, keys, CannedHttp};
    use ethpulse_core::{
        DateEncoding, DateSpec, FieldSpec, FieldValue, HistoryMode, HistoryWindow, KeyKind,
        MetricSpec, SourceTag,
    };
    use ethpulse_storage::MemoryStore;
    use std::collections::BTreeMap;
    use uuid::Uuid;

    fn day(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    fn metric(fields: Vec<FieldSpec>) -> MetricSpec {
        MetricSpec {
            name: "gas_price".into(),
            table: "eth_gas_price_daily".into(),
            description: None,
            history: HistoryMode::Long,
            key: KeyKind::Date,
            dimensions: vec![],
            min_rows: None,
            fields,
            tiers: vec![],
            enrichment: None,
        }
    }

    fn etherscan_tier() -> RestJsonTier {
        RestJsonTier {
            source: "etherscan".into(),
            url: "https://api.etherscan.io/api?module=stats&action=dailyavggasprice&startdate={start_date}&enddate={end_date}&apikey={api_key}".into(),
            api_key: Some("etherscan".into()),
            rows_path: Some("result".into()),
            date: Some(DateSpec {
                field: "unixTimeStamp".into(),
                format: DateEncoding::UnixSeconds,
            }),
            values: BTreeMap::from([("avg_gwei".to_string(), "avgGasPrice_Wei".to_string())]),
            pagination: None,
            status_path: Some("status".into()),
            ok_value: Some("1".into()),
        }
    }

    fn gas_fields() -> Vec<FieldSpec> {
        vec![FieldSpec::float("avg_gwei", 2).with_rescale(1_000_000.0, 1_000_000_000.0)]
    }

    #[tokio::test]
    async fn etherscan_rows_are_rescaled_to_gwei() {
        let http = CannedHttp::new().route("dailyavggasprice", fixture("etherscan_gas_price.json"));
        let store = MemoryStore::new();
        let api_keys = keys(&[("etherscan", "KEY123")]);
        let ctx = AdapterContext {
            run_id: Uuid::new_v4(),
            http: &http,
            store: &store,
            today: day("2024-03-09"),
            api_keys: &api_keys,
        };
        let metric = metric(gas_fields());
        let request = FetchRequest {
            metric: &metric,
            window: HistoryWindow::ending_on(day("2024-03-09"), 3),
            dimension: None,
        };

        let records = RestJsonAdapter::new(etherscan_tier())
            .fetch(&ctx, &request)
            .await
            .unwrap();

        let dates: Vec<_> = records.iter().map(|r| r.date).collect();
        assert_eq!(dates, vec![day("2024-03-07"), day("2024-03-08"), day("2024-03-09")]);
        assert_eq!(records[0].value("avg_gwei"), Some(&FieldValue::Float(25.0)));
        assert_eq!(records[0].source, SourceTag::live("etherscan"));
        assert!(http.calls()[0].contains("apikey=KEY123"));
        assert!(http.calls()[0].contains("startdate=2024-03-07"));
    }

    #[tokio::test]
    async fn application_error_inside_200_is_unavailable() {
        let http = CannedHttp::new().route(
            "dailyavggasprice",
            r#"{"status":"0","message":"NOTOK","result":"Invalid API Key"}"#,
        );
        let store = MemoryStore::new();
        let api_keys = keys(&[("etherscan", "bad")]);
        let ctx = AdapterContext {
            run_id: Uuid::new_v4(),
            http: &http,
            store: &store,
            today: day("2024-03-09"),
            api_keys: &api_keys,
        };
        let metric = metric(gas_fields());
        let request = FetchRequest {
            metric: &metric,
            window: HistoryWindow::ending_on(day("2024-03-09"), 3),
            dimension: None,
        };
        let err = RestJsonAdapter::new(etherscan_tier())
            .fetch(&ctx, &request)
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::SourceUnavailable { .. }));
        assert!(err.to_string().contains("NOTOK"));
    }

    #[tokio::test]
    async fn missing_api_key_fails_without_a_request() {
        let http = CannedHttp::new();
        let store = MemoryStore::new();
        let api_keys = BTreeMap::new();
        let ctx = AdapterContext {
            run_id: Uuid::new_v4(),
            http: &http,
            store: &store,
            today: day("2024-03-09"),
            api_keys: &api_keys,
        };
        let metric = metric(gas_fields());
        let request = FetchRequest {
            metric: &metric,
            window: HistoryWindow::ending_on(day("2024-03-09"), 3),
            dimension: None,
        };
        let err = RestJsonAdapter::new(etherscan_tier())
            .fetch(&ctx, &request)
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::SourceUnavailable { .. }));
        assert!(http.calls().is_empty());
    }

    #[tokio::test]
    async fn pagination_walks_the_cursor_back_to_the_window_start() {
        let http = CannedHttp::new()
            .route(
                "to_ts=1704585599",
                r#"[{"ts":1704326400,"v":4},{"ts":1704412800,"v":5},{"ts":1704499200,"v":6}]"#,
            )
            .route(
                "to_ts=1704326399",
                r#"[{"ts":1704067200,"v":1},{"ts":1704153600,"v":2},{"ts":1704240000,"v":3}]"#,
            );
        let store = MemoryStore::new();
        let api_keys = BTreeMap::new();
        let ctx = AdapterContext {
            run_id: Uuid::new_v4(),
            http: &http,
            store: &store,
            today: day("2024-01-06"),
            api_keys: &api_keys,
        };
        let metric = metric(vec![FieldSpec::integer("blocks")]);
        let request = FetchRequest {
            metric: &metric,
            window: HistoryWindow::ending_on(day("2024-01-06"), 6),
            dimension: None,
        };
        let tier = RestJsonTier {
            source: "blockscan".into(),
            url: "https://api.example.org/v1/blocks?to_ts={to_ts}&limit={limit}".into(),
            api_key: None,
            rows_path: None,
            date: Some(DateSpec {
                field: "ts".into(),
                format: DateEncoding::Auto,
            }),
            values: BTreeMap::from([("blocks".to_string(), "v".to_string())]),
            pagination: Some(Pagination {
                page_size: 3,
                max_pages: None,
            }),
            status_path: None,
            ok_value: None,
        };

        let mut records = RestJsonAdapter::new(tier).fetch(&ctx, &request).await.unwrap();
        records.sort_by_key(|r| r.date);

        assert_eq!(records.len(), 6);
        assert_eq!(records[0].date, day("2024-01-01"));
        assert_eq!(records[5].value("blocks"), Some(&FieldValue::Integer(6)));
        let calls = http.calls();
        assert_eq!(calls.len(), 2);
        assert!(calls[0].contains("limit=3"));
    }

    #[tokio::test]
    async fn composite_requests_substitute_and_stamp_the_dimension() {
        let http = CannedHttp::new().route(
            "historicalChainTvl/Ethereum",
            fixture("defillama_chain_tvl_ethereum.json"),
        );
        let store = MemoryStore::new();
        let api_keys = BTreeMap::new();
        let ctx = AdapterContext {
            run_id: Uuid::new_v4(),
            http: &http,
            store: &store,
            today: day("2024-03-09"),
            api_keys: &api_keys,
        };
        let mut metric = metric(vec![FieldSpec::float("tvl_usd", 0)]);
        metric.key = KeyKind::DateDimension;
        metric.dimensions = vec!["Ethereum".into()];
        let request = FetchRequest {
            metric: &metric,
            window: HistoryWindow::ending_on(day("2024-03-09"), 30),
            dimension: Some("Ethereum"),
        };
        let tier = RestJsonTier {
            source: "defillama".into(),
            url: "https://api.llama.fi/v2/historicalChainTvl/{dimension}".into(),
            api_key: None,
            rows_path: None,
            date: Some(DateSpec {
                field: "date".into(),
                format: DateEncoding::UnixSeconds,
            }),
            values: BTreeMap::from([("tvl_usd".to_string(), "tvl".to_string())]),
            pagination: None,
            status_path: None,
            ok_value: None,
        };

        let records = RestJsonAdapter::new(tier).fetch(&ctx, &request).await.unwrap();
        assert_eq!(records.len(), 3);
        assert!(records.iter().all(|r| r.dimension.as_deref() == Some("Ethereum")));
        assert_eq!(records[2].f64("tvl_usd"), Some(54_012_345_678.0));
    }

    #[tokio::test]
    async fn nested_array_rows_and_snapshot_objects_are_supported() {
        let http = CannedHttp::new()
            .route(
                "market_chart",
                r#"{"prices":[[1709856000000,3890.12],[1709942400000,3912.55]]}"#,
            )
            .route("simple/price", r#"{"ethereum":{"usd":3921.4,"usd_market_cap":470000000000}}"#);
        let store = MemoryStore::new();
        let api_keys = BTreeMap::new();
        let ctx = AdapterContext {
            run_id: Uuid::new_v4(),
            http: &http,
            store: &store,
            today: day("2024-03-09"),
            api_keys: &api_keys,
        };
        let metric = metric(vec![FieldSpec::float("price_usd", 2)]);
        let request = FetchRequest {
            metric: &metric,
            window: HistoryWindow::ending_on(day("2024-03-09"), 7),
            dimension: None,
        };

        let history = RestJsonTier {
            source: "coingecko".into(),
            url: "https://api.coingecko.com/api/v3/coins/ethereum/market_chart?days={days}".into(),
            api_key: None,
            rows_path: Some("prices".into()),
            date: Some(DateSpec {
                field: "0".into(),
                format: DateEncoding::UnixMillis,
            }),
            values: BTreeMap::from([("price_usd".to_string(), "1".to_string())]),
            pagination: None,
            status_path: None,
            ok_value: None,
        };
        let records = RestJsonAdapter::new(history).fetch(&ctx, &request).await.unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].date, day("2024-03-09"));
        assert_eq!(records[1].f64("price_usd"), Some(3912.55));
        assert!(http.calls()[0].ends_with("days=7"));

        let snapshot = RestJsonTier {
            source: "coingecko".into(),
            url: "https://api.coingecko.com/api/v3/simple/price?ids=ethereum".into(),
            api_key: None,
            rows_path: Some("ethereum".into()),
            date: None,
            values: BTreeMap::from([("price_usd".to_string(), "usd".to_string())]),
            pagination: None,
            status_path: None,
            ok_value: None,
        };
        let records = RestJsonAdapter::new(snapshot).fetch(&ctx, &request).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].date, day("2024-03-09"));
        assert_eq!(records[0].f64("price_usd"), Some(3921.4));
    }

    #[tokio::test]
    async fn absent_value_paths_are_a_schema_mismatch() {
        let http = CannedHttp::new().route("v1", r#"[{"ts":1704067200,"other":1}]"#);
        let store = MemoryStore::new();
        let api_keys = BTreeMap::new();
        let ctx = AdapterContext {
            run_id: Uuid::new_v4(),
            http: &http,
            store: &store,
            today: day("2024-01-01"),
            api_keys: &api_keys,
        };
        let metric = metric(vec![FieldSpec::integer("blocks")]);
        let request = FetchRequest {
            metric: &metric,
            window: HistoryWindow::ending_on(day("2024-01-01"), 1),
            dimension: None,
        };
        let tier = RestJsonTier {
            source: "blockscan".into(),
            url: "https://api.example.org/v1/blocks".into(),
            api_key: None,
            rows_path: None,
            date: Some(DateSpec {
                field: "ts".into(),
                format: DateEncoding::Auto,
            }),
            values: BTreeMap::from([("blocks".to_string(), "v".to_string())]),
            pagination: None,
            status_path: None,
            ok_value: None,
        };
        let err = RestJsonAdapter::new(tier).fetch(&ctx, &request).await.unwrap_err();
        assert!(matches!(err, FetchError::SchemaMismatch { .. }));
    }

    #[test]
    fn json_paths_index_into_arrays() {
        let value: JsonValue = serde_json::json!({"a": {"b": [10, {"c": "x"}]}});
        assert_eq!(json_path(&value, "a.b.0"), Some(&serde_json::json!(10)));
        assert_eq!(json_path(&value, "a.b.1.c"), Some(&serde_json::json!("x")));
        assert_eq!(json_path(&value, "a.z"), None);
        assert_eq!(json_path(&value, ""), Some(&value));
    }
}
