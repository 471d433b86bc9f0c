//! Retry Logic with Exponential Backoff
//!
//! Per-file download retries. A batch issues hundreds of small transfers;
//! a single reset connection should cost one backoff, not a whole batch
//! retry delay.
//!
//! ```text
//! ┌──────────────────────────────┐
//! │  RetryPolicy                 │
//! │  - max_retries: 3            │
//! │  - initial_backoff: 1s       │
//! │  - max_backoff: 30s          │
//! │  - backoff_multiplier: 2.0   │
//! └──────┬───────────────────────┘
//!        │
//!        ├─→ Attempt 1: Immediate
//!        ├─→ Attempt 2: Wait 1s
//!        ├─→ Attempt 3: Wait 2s
//!        └─→ Attempt 4: Wait 4s
//! ```
//!
//! ## Retryable vs Non-Retryable Errors
//!
//! **Retryable**: timeouts, connection failures, 5xx responses, truncated bodies.
//!
//! **Non-Retryable**: 4xx responses (the file does not exist yet, or the URL
//! is wrong), local write failures, cancellation.
//!
//! Backoff sleeps race against the shutdown handle; a shutdown during a
//! backoff returns [`FetchError::Cancelled`] immediately.

use std::future::Future;
use std::time::Duration;

use tracing::{debug, warn};

use crate::config::TimingConfig;
use crate::error::FetchError;
use crate::shutdown::ShutdownHandle;

/// Retry policy configuration for exponential backoff.
///
/// ```text
/// backoff = min(initial_backoff * multiplier^attempt, max_backoff)
/// ```
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of retry attempts
    pub max_retries: usize,

    /// Initial backoff duration
    pub initial_backoff: Duration,

    /// Maximum backoff duration
    pub max_backoff: Duration,

    /// Backoff multiplier for exponential growth
    pub backoff_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Download policy derived from the timing settings.
    pub fn for_downloads(timing: &TimingConfig) -> Self {
        Self {
            max_retries: timing.download_retries,
            initial_backoff: timing.download_backoff(),
            ..Default::default()
        }
    }

    /// Calculate backoff duration for a given attempt number (0-indexed).
    pub fn backoff(&self, attempt: usize) -> Duration {
        let backoff_ms =
            self.initial_backoff.as_millis() as f64 * self.backoff_multiplier.powi(attempt as i32);
        let backoff = Duration::from_millis(backoff_ms as u64);
        backoff.min(self.max_backoff)
    }
}

/// Retry a transfer with exponential backoff.
///
/// 1. Try operation
/// 2. If success, return result
/// 3. If error is non-retryable, return error immediately
/// 4. If retries remain, sleep for the backoff (or return `Cancelled` on
///    shutdown) and retry
/// 5. If all retries are exhausted, return the last error
pub async fn retry_with_backoff<F, Fut, T>(
    policy: &RetryPolicy,
    shutdown: &ShutdownHandle,
    mut operation: F,
) -> Result<T, FetchError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, FetchError>>,
{
    let mut attempt = 0;

    loop {
        match operation().await {
            Ok(result) => {
                if attempt > 0 {
                    debug!(attempt = attempt + 1, "Transfer succeeded after retry");
                }
                return Ok(result);
            }
            Err(err) => {
                if !err.is_retryable() {
                    return Err(err);
                }

                if attempt >= policy.max_retries {
                    warn!(
                        attempt = attempt + 1,
                        max_retries = policy.max_retries,
                        reason = err.reason(),
                        error = %err,
                        "Max retries exhausted, giving up"
                    );
                    return Err(err);
                }

                let backoff = policy.backoff(attempt);
                warn!(
                    attempt = attempt + 1,
                    max_retries = policy.max_retries,
                    backoff_ms = backoff.as_millis() as u64,
                    reason = err.reason(),
                    error = %err,
                    "Retryable error, backing off"
                );

                if !shutdown.sleep(backoff).await {
                    return Err(FetchError::Cancelled {
                        url: failed_url(&err),
                    });
                }
                attempt += 1;
            }
        }
    }
}

fn failed_url(err: &FetchError) -> String {
    match err {
        FetchError::Timeout { url }
        | FetchError::Connect { url, .. }
        | FetchError::Status { url, .. }
        | FetchError::Body { url, .. }
        | FetchError::Request { url, .. }
        | FetchError::Cancelled { url } => url.clone(),
        FetchError::Io { path, .. } => path.display().to_string(),
    }
}
