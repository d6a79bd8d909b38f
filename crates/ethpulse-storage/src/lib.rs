//! Persistence and network plumbing for ethpulse: the metric store seam with
//! Postgres and in-memory backends, plus the paced, retrying HTTP fetcher.

pub mod http;
pub mod postgres;
pub mod store;

pub use http::{
    AttemptVerdict, FetchedResponse, HttpClientConfig, HttpError, HttpFetcher, HttpGet,
    RequestPacer, RetryPolicy,
};
pub use postgres::{PgMetricStore, PgStoreConfig};
pub use store::{validate_identifier, MemoryStore, MetricStore, QueryFilter, StoreError, TableRef};

pub const CRATE_NAME: &str = "ethpulse-storage";
