//! Source adapter contract plus the REST-JSON, CSV-over-HTTP and deterministic
//! generator implementations.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::NaiveDate;
use ethpulse_core::{
    midnight_timestamp, normalize, HistoryWindow, MetricSpec, RawRow, Record, SourceTag, TierSpec,
};
use ethpulse_storage::{HttpError, HttpGet, MetricStore};
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

pub mod csv_http;
pub mod generator;
pub mod rest_json;

pub use csv_http::CsvAdapter;
pub use generator::{rolling_volatility, DerivedAdapter, InterpolateAdapter, RegimeAdapter};
pub use rest_json::{json_path, RestJsonAdapter};

pub const CRATE_NAME: &str = "ethpulse-adapters";

const SECONDS_PER_DAY: i64 = 86_400;

/// Tier-local failures. All of them send the resolver on to the next tier.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("{tier}: source unavailable: {message}")]
    SourceUnavailable { tier: String, message: String },
    #[error("{tier}: schema mismatch: {message}")]
    SchemaMismatch { tier: String, message: String },
    #[error("{tier}: no usable rows")]
    EmptyResult { tier: String },
}

impl FetchError {
    pub fn unavailable(tier: &str, message: impl ToString) -> Self {
        FetchError::SourceUnavailable {
            tier: tier.to_string(),
            message: message.to_string(),
        }
    }

    pub fn schema(tier: &str, message: impl ToString) -> Self {
        FetchError::SchemaMismatch {
            tier: tier.to_string(),
            message: message.to_string(),
        }
    }

    pub fn empty(tier: &str) -> Self {
        FetchError::EmptyResult {
            tier: tier.to_string(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            FetchError::SourceUnavailable { .. } => "source_unavailable",
            FetchError::SchemaMismatch { .. } => "schema_mismatch",
            FetchError::EmptyResult { .. } => "empty_result",
        }
    }
}

/// Shared, per-run collaborators handed to every adapter call.
#[derive(Clone, Copy)]
pub struct AdapterContext<'a> {
    pub run_id: Uuid,
    pub http: &'a dyn HttpGet,
    pub store: &'a dyn MetricStore,
    pub today: NaiveDate,
    /// Configured API keys by lowercase name.
    pub api_keys: &'a BTreeMap<String, String>,
}

/// One sub-series request: the metric, its window and (for composite
/// metrics) the dimension value.
#[derive(Debug, Clone, Copy)]
pub struct FetchRequest<'a> {
    pub metric: &'a MetricSpec,
    pub window: HistoryWindow,
    pub dimension: Option<&'a str>,
}

#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn source(&self) -> &str;

    fn is_synthetic(&self) -> bool {
        false
    }

    async fn fetch(
        &self,
        ctx: &AdapterContext<'_>,
        request: &FetchRequest<'_>,
    ) -> Result<Vec<Record>, FetchError>;
}

pub fn adapter_for_tier(tier: &TierSpec) -> Box<dyn SourceAdapter> {
    match tier {
        TierSpec::RestJson(spec) => Box::new(RestJsonAdapter::new(spec.clone())),
        TierSpec::Csv(spec) => Box::new(CsvAdapter::new(spec.clone())),
        TierSpec::Interpolate(spec) => Box::new(InterpolateAdapter::new(spec.clone())),
        TierSpec::Regime(spec) => Box::new(RegimeAdapter::new(spec.clone())),
        TierSpec::Derived(spec) => Box::new(DerivedAdapter::new(spec.clone())),
    }
}

/// Substitute `{name}` placeholders. Unknown placeholders are returned as the error.
pub fn expand_template(template: &str, vars: &BTreeMap<&str, String>) -> Result<String, String> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        let Some(close) = after.find('}') else {
            out.push_str(&rest[open..]);
            rest = "";
            break;
        };
        let name = &after[..close];
        let value = vars.get(name).ok_or_else(|| name.to_string())?;
        out.push_str(value);
        rest = &after[close + 1..];
    }
    out.push_str(rest);
    Ok(out)
}

/// Placeholder values derived from the request window. `{to_ts}` starts at the window end.
pub(crate) fn window_vars(
    ctx: &AdapterContext<'_>,
    request: &FetchRequest<'_>,
    api_key: Option<&str>,
) -> BTreeMap<&'static str, String> {
    let window = request.window;
    let end_ts = midnight_timestamp(window.end) + SECONDS_PER_DAY - 1;
    let mut vars = BTreeMap::from([
        ("start_date", ethpulse_core::format_day(window.start)),
        ("end_date", ethpulse_core::format_day(window.end)),
        ("start_ts", midnight_timestamp(window.start).to_string()),
        ("end_ts", end_ts.to_string()),
        ("to_ts", end_ts.to_string()),
        ("days", window.days().to_string()),
    ]);
    if let Some(dimension) = request.dimension {
        vars.insert("dimension", dimension.to_string());
    }
    if let Some(key) = api_key.and_then(|name| ctx.api_keys.get(&name.to_ascii_lowercase())) {
        vars.insert("api_key", key.clone());
    }
    vars
}

pub(crate) fn render_url(
    tier: &str,
    template: &str,
    vars: &BTreeMap<&str, String>,
) -> Result<String, FetchError> {
    expand_template(template, vars).map_err(|name| {
        if name == "api_key" {
            FetchError::unavailable(tier, "API key not configured")
        } else {
            FetchError::unavailable(tier, format!("unresolved placeholder {{{name}}}"))
        }
    })
}

pub(crate) async fn get_body(
    ctx: &AdapterContext<'_>,
    tier: &str,
    url: &str,
) -> Result<Vec<u8>, FetchError> {
    ctx.http
        .get(tier, url)
        .await
        .map(|resp| resp.body)
        .map_err(|err: HttpError| FetchError::unavailable(tier, err))
}

/// Normalize raw rows, dropping the ones that fail to parse. Shared by every
/// live tier; paging needs the unwindowed result to move its cursor.
pub(crate) fn normalize_rows(tier: &str, rows: Vec<RawRow>, metric: &MetricSpec) -> Vec<Record> {
    let tag = SourceTag::live(tier);
    let total = rows.len();
    let out: Vec<Record> = rows
        .into_iter()
        .filter_map(|row| match normalize(row, metric, &tag) {
            Ok(record) => Some(record),
            Err(err) => {
                debug!(tier, error = %err, "dropping unparseable row");
                None
            }
        })
        .collect();
    if out.len() < total {
        debug!(
            tier,
            dropped = total - out.len(),
            kept = out.len(),
            "normalization dropped rows"
        );
    }
    out
}

/// Records inside `window`. Nothing left means the tier came up empty.
pub(crate) fn within_window(
    tier: &str,
    records: Vec<Record>,
    window: HistoryWindow,
) -> Result<Vec<Record>, FetchError> {
    let kept: Vec<Record> = records
        .into_iter()
        .filter(|r| window.contains(r.date))
        .collect();
    if kept.is_empty() {
        return Err(FetchError::empty(tier));
    }
    Ok(kept)
}

#[cfg(test)]
pub(crate) mod testing {
    use std::collections::BTreeMap;
    use std::path::{Path, PathBuf};
    use std::sync::Mutex;

    use async_trait::async_trait;
    use ethpulse_storage::{FetchedResponse, HttpError, HttpGet};

    pub fn fixture(name: &str) -> Vec<u8> {
        let path: PathBuf = Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("../../fixtures")
            .join(name);
        std::fs::read(&path).unwrap_or_else(|e| panic!("reading {}: {e}", path.display()))
    }

    /// Serves queued bodies per URL substring, in order; unmatched URLs 404.
    #[derive(Default)]
    pub struct CannedHttp {
        routes: Mutex<Vec<(String, Vec<Vec<u8>>)>>,
        pub calls: Mutex<Vec<String>>,
    }

    impl CannedHttp {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn route(self, needle: &str, body: impl Into<Vec<u8>>) -> Self {
            {
                let mut routes = self.routes.lock().unwrap();
                match routes.iter_mut().find(|(n, _)| n.as_str() == needle) {
                    Some((_, bodies)) => bodies.push(body.into()),
                    None => routes.push((needle.to_string(), vec![body.into()])),
                }
            }
            self
        }

        pub fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl HttpGet for CannedHttp {
        async fn get(&self, _class: &str, url: &str) -> Result<FetchedResponse, HttpError> {
            self.calls.lock().unwrap().push(url.to_string());
            let mut routes = self.routes.lock().unwrap();
            if let Some((_, bodies)) = routes.iter_mut().find(|(n, _)| url.contains(n.as_str())) {
                let body = if bodies.len() > 1 {
                    bodies.remove(0)
                } else {
                    bodies[0].clone()
                };
                return Ok(FetchedResponse::ok(url, body));
            }
            Err(HttpError::HttpStatus {
                status: 404,
                url: url.to_string(),
            })
        }
    }

    pub fn keys(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }
}
