//! Run-level cancellation and the best-effort run log.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use ethpulse_core::{LogLevel, RunLogEvent};
use ethpulse_storage::MetricStore;
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::PipelineError;

/// Shared cancel flag plus an optional deadline, checked between metrics,
/// tiers and batches.
#[derive(Debug, Clone, Default)]
pub struct RunControl {
    cancelled: Arc<AtomicBool>,
    deadline: Option<Instant>,
}

impl RunControl {
    pub fn new(deadline: Option<Duration>) -> Self {
        Self {
            cancelled: Arc::new(AtomicBool::new(false)),
            deadline: deadline.map(|d| Instant::now() + d),
        }
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
            || self.deadline.map_or(false, |d| Instant::now() >= d)
    }

    pub fn check(&self) -> Result<(), PipelineError> {
        if self.is_cancelled() {
            Err(PipelineError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Cancel the run on the first Ctrl-C.
    pub fn cancel_on_ctrl_c(&self) {
        let control = self.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupt received; finishing current step and cancelling the run");
                control.cancel();
            }
        });
    }
}

/// Appends diagnostic events for one run. Failures never reach the caller.
#[derive(Clone, Copy)]
pub struct RunLog<'a> {
    store: &'a dyn MetricStore,
    run_id: Uuid,
}

impl<'a> RunLog<'a> {
    pub fn new(store: &'a dyn MetricStore, run_id: Uuid) -> Self {
        Self { store, run_id }
    }

    pub async fn record(&self, metric: Option<&str>, level: LogLevel, message: impl Into<String>) {
        let event = RunLogEvent::new(self.run_id, metric, level, message);
        if let Err(err) = self.store.append_log(&event).await {
            debug!(error = %err, "run log write failed");
        }
    }

    pub async fn info(&self, metric: &str, message: impl Into<String>) {
        self.record(Some(metric), LogLevel::Info, message).await;
    }

    pub async fn warn(&self, metric: &str, message: impl Into<String>) {
        self.record(Some(metric), LogLevel::Warn, message).await;
    }

    pub async fn error(&self, metric: &str, message: impl Into<String>) {
        self.record(Some(metric), LogLevel::Error, message).await;
    }
}
