//! HTTP fetch utilities: retries with backoff, manual redirect following and
//! per-source-class request pacing that reacts to upstream rate limiting.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, LOCATION, RETRY_AFTER};
use reqwest::{StatusCode, Url};
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tokio::time::Instant;
use tracing::{debug, info_span, warn, Instrument};

/// How a failed attempt against a data source should be treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptVerdict {
    /// The source is throttling us. Carries its `Retry-After` hint, if any.
    Throttled(Option<Duration>),
    /// Upstream hiccup (5xx, timeout, dropped connection).
    Transient,
    /// Retrying cannot change the answer.
    Fatal,
}

pub fn judge_status(status: StatusCode, retry_after: Option<Duration>) -> AttemptVerdict {
    match status {
        StatusCode::TOO_MANY_REQUESTS => AttemptVerdict::Throttled(retry_after),
        // Free-tier explorers answer 503 + Retry-After when a key is over quota.
        StatusCode::SERVICE_UNAVAILABLE if retry_after.is_some() => {
            AttemptVerdict::Throttled(retry_after)
        }
        StatusCode::REQUEST_TIMEOUT => AttemptVerdict::Transient,
        s if s.is_server_error() => AttemptVerdict::Transient,
        _ => AttemptVerdict::Fatal,
    }
}

pub fn judge_transport_error(err: &reqwest::Error) -> AttemptVerdict {
    if err.is_timeout() || err.is_connect() {
        AttemptVerdict::Transient
    } else {
        AttemptVerdict::Fatal
    }
}

/// Parse a `Retry-After` value: delta seconds or an HTTP date.
pub fn parse_retry_after(value: &str, now: DateTime<Utc>) -> Option<Duration> {
    let value = value.trim();
    if let Ok(secs) = value.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    let when = DateTime::parse_from_rfc2822(value).ok()?;
    Some(
        when.with_timezone(&Utc)
            .signed_duration_since(now)
            .to_std()
            .unwrap_or(Duration::ZERO),
    )
}

fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| parse_retry_after(v, Utc::now()))
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Ceiling on how long a `Retry-After` hint may hold a source class.
    pub max_throttle_wait: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
            max_throttle_wait: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    /// Doubling delay before retry number `retry` (0-based), capped at `max_delay`.
    pub fn backoff(&self, retry: u32) -> Duration {
        self.base_delay
            .saturating_mul(2u32.saturating_pow(retry))
            .min(self.max_delay)
    }

    /// Honor the source's hint but never wait less than the plain backoff.
    pub fn throttle_wait(&self, retry: u32, hint: Option<Duration>) -> Duration {
        let floor = self.backoff(retry);
        hint.map_or(floor, |h| h.max(floor))
            .min(self.max_throttle_wait)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub global_concurrency: usize,
    /// Minimum spacing between two requests of the same source class.
    pub request_interval: Duration,
    pub max_redirects: usize,
    pub retry: RetryPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            global_concurrency: 4,
            request_interval: Duration::from_millis(300),
            max_redirects: 5,
            retry: RetryPolicy::default(),
        }
    }
}

/// Spaces out successive requests per source class.
#[derive(Debug)]
pub struct RequestPacer {
    min_interval: Duration,
    next_slot: Mutex<HashMap<String, Instant>>,
}

impl RequestPacer {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            next_slot: Mutex::new(HashMap::new()),
        }
    }

    /// Reserve the next slot for `class` and sleep until it opens.
    pub async fn wait_turn(&self, class: &str) {
        let now = Instant::now();
        let slot = {
            let mut slots = self.next_slot.lock().await;
            let slot = slots.get(class).copied().map_or(now, |s| s.max(now));
            slots.insert(class.to_string(), slot + self.min_interval);
            slot
        };
        if slot > now {
            tokio::time::sleep_until(slot).await;
        }
    }

    /// Push the next slot of `class` out by `wait`. Every caller pacing on
    /// that class backs off, not only the request that got throttled.
    pub async fn hold(&self, class: &str, wait: Duration) {
        let until = Instant::now() + wait;
        let mut slots = self.next_slot.lock().await;
        let slot = slots.entry(class.to_string()).or_insert(until);
        *slot = (*slot).max(until);
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

impl FetchedResponse {
    pub fn ok(url: impl Into<String>, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status: StatusCode::OK,
            final_url: url.into(),
            body: body.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum HttpError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("rate limited by {url}")]
    RateLimited {
        url: String,
        retry_after: Option<Duration>,
    },
    #[error("http client is shutting down")]
    Closed,
    #[error("invalid url {url}: {message}")]
    InvalidUrl { url: String, message: String },
    #[error("redirect from {url} has no usable Location header")]
    MissingRedirectLocation { url: String },
    #[error("more than {limit} redirects starting at {url}")]
    TooManyRedirects { url: String, limit: usize },
}

/// Minimal GET seam the source adapters depend on.
#[async_trait]
pub trait HttpGet: Send + Sync {
    async fn get(&self, class: &str, url: &str) -> Result<FetchedResponse, HttpError>;
}

/// Resolve a `Location` header against the URL that produced it.
pub fn resolve_redirect(base: &Url, location: &str) -> Result<Url, HttpError> {
    base.join(location.trim()).map_err(|e| HttpError::InvalidUrl {
        url: location.to_string(),
        message: e.to_string(),
    })
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
    pacer: RequestPacer,
    max_redirects: usize,
    retry: RetryPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .redirect(reqwest::redirect::Policy::none())
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;

        Ok(Self {
            client,
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            pacer: RequestPacer::new(config.request_interval),
            max_redirects: config.max_redirects,
            retry: config.retry,
        })
    }

    async fn send_following_redirects(&self, url: &str) -> Result<reqwest::Response, HttpError> {
        let mut current = Url::parse(url).map_err(|e| HttpError::InvalidUrl {
            url: url.to_string(),
            message: e.to_string(),
        })?;

        for hop in 0..=self.max_redirects {
            let resp = self.client.get(current.clone()).send().await?;
            if !resp.status().is_redirection() {
                return Ok(resp);
            }
            if hop == self.max_redirects {
                break;
            }
            let location = resp
                .headers()
                .get(LOCATION)
                .and_then(|v| v.to_str().ok())
                .ok_or_else(|| HttpError::MissingRedirectLocation {
                    url: current.to_string(),
                })?;
            current = resolve_redirect(&current, location)?;
            debug!(hop = hop + 1, to = %current, "following redirect");
        }

        Err(HttpError::TooManyRedirects {
            url: url.to_string(),
            limit: self.max_redirects,
        })
    }

    /// One request, redirects included, judged for retry.
    async fn attempt(&self, url: &str) -> Result<FetchedResponse, (HttpError, AttemptVerdict)> {
        let resp = match self.send_following_redirects(url).await {
            Ok(resp) => resp,
            Err(HttpError::Request(err)) => {
                let verdict = judge_transport_error(&err);
                return Err((HttpError::Request(err), verdict));
            }
            Err(other) => return Err((other, AttemptVerdict::Fatal)),
        };

        let status = resp.status();
        let final_url = resp.url().to_string();
        if !status.is_success() {
            let hint = retry_after(resp.headers());
            let verdict = judge_status(status, hint);
            let err = match verdict {
                AttemptVerdict::Throttled(retry_after) => HttpError::RateLimited {
                    url: final_url,
                    retry_after,
                },
                _ => HttpError::HttpStatus {
                    status: status.as_u16(),
                    url: final_url,
                },
            };
            return Err((err, verdict));
        }

        match resp.bytes().await {
            Ok(body) => Ok(FetchedResponse {
                status,
                final_url,
                body: body.to_vec(),
            }),
            Err(err) => {
                let verdict = judge_transport_error(&err);
                Err((HttpError::Request(err), verdict))
            }
        }
    }

    pub async fn fetch_bytes(&self, class: &str, url: &str) -> Result<FetchedResponse, HttpError> {
        let _permit = self
            .global_limit
            .acquire()
            .await
            .map_err(|_| HttpError::Closed)?;

        let mut retry = 0;
        loop {
            self.pacer.wait_turn(class).await;
            let (err, verdict) = match self.attempt(url).await {
                Ok(resp) => return Ok(resp),
                Err(failed) => failed,
            };
            if retry >= self.retry.retries {
                return Err(err);
            }
            match verdict {
                AttemptVerdict::Fatal => return Err(err),
                AttemptVerdict::Throttled(hint) => {
                    let wait = self.retry.throttle_wait(retry, hint);
                    warn!(
                        class,
                        retry,
                        wait_ms = wait.as_millis() as u64,
                        "source is rate limiting, holding class"
                    );
                    self.pacer.hold(class, wait).await;
                }
                AttemptVerdict::Transient => {
                    let wait = self.retry.backoff(retry);
                    debug!(retry, error = %err, wait_ms = wait.as_millis() as u64, "retrying");
                    tokio::time::sleep(wait).await;
                }
            }
            retry += 1;
        }
    }
}

#[async_trait]
impl HttpGet for HttpFetcher {
    async fn get(&self, class: &str, url: &str) -> Result<FetchedResponse, HttpError> {
        let span = info_span!("http_fetch", class, url);
        self.fetch_bytes(class, url).instrument(span).await
    }
}
