//! Retry with bounded exponential backoff.

use crate::cancel::CancelFlag;
use crate::config::RetryConfig;
use crate::error::{SyncError, SyncResult};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Executes operations under a bounded exponential backoff schedule.
///
/// Failures are classified before retrying: fatal errors rethrow
/// immediately, conflicts are returned to the caller as first-class
/// outcomes, and only transient errors consume the retry budget. The
/// backoff delay is a cancellable suspension point, not a blocking sleep.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    config: RetryConfig,
    retries: Arc<AtomicU64>,
}

impl RetryPolicy {
    /// Creates a policy from the given configuration.
    pub fn new(config: RetryConfig) -> Self {
        Self::with_counter(config, Arc::new(AtomicU64::new(0)))
    }

    /// Creates a policy that reports retries into a shared counter.
    pub fn with_counter(config: RetryConfig, retries: Arc<AtomicU64>) -> Self {
        Self { config, retries }
    }

    /// Total retries performed through this policy.
    pub fn retries_attempted(&self) -> u64 {
        self.retries.load(Ordering::Relaxed)
    }

    /// Runs `operation`, retrying transient failures up to the configured
    /// budget.
    ///
    /// The attempt counter is zero-based; an operation that always fails
    /// transiently is invoked `max_retries + 1` times before the last error
    /// is rethrown.
    pub async fn execute<T, F, Fut>(&self, cancel: &CancelFlag, mut operation: F) -> SyncResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = SyncResult<T>>,
    {
        let mut attempt: u32 = 0;
        loop {
            if cancel.is_cancelled() {
                return Err(SyncError::Cancelled);
            }

            match operation().await {
                Ok(value) => return Ok(value),
                Err(error) => {
                    if !error.is_retriable() || attempt >= self.config.max_retries {
                        return Err(error);
                    }

                    let delay = self.config.delay_for_attempt(attempt);
                    tracing::debug!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "transient failure, backing off"
                    );
                    self.retries.fetch_add(1, Ordering::Relaxed);

                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = cancel.cancelled() => return Err(SyncError::Cancelled),
                    }
                    attempt += 1;
                }
            }
        }
    }
}
