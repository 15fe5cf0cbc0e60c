//! Retry utilities: backoff configuration and transient error classification.
//!
//! Uses `backon` for exponential backoff with jitter. Storage contention
//! (lock timeouts, busy databases) is retried; everything else fails fast.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use backon::{BackoffBuilder, ExponentialBuilder};
use serde::Deserialize;
use tracing::{debug, error, warn};

/// Backoff settings for transient storage failures.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Delay before the first retry.
    pub min_delay_ms: u64,
    /// Delay cap.
    pub max_delay_ms: u64,
    /// Retries after the initial attempt.
    pub max_times: usize,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            min_delay_ms: 10,
            max_delay_ms: 2000,
            max_times: 10,
        }
    }
}

impl RetryConfig {
    /// Exponential backoff with jitter.
    ///
    /// - Min delay: `min_delay_ms`
    /// - Max delay: `max_delay_ms`
    /// - Max attempts: `max_times`
    pub fn backoff(&self) -> ExponentialBuilder {
        ExponentialBuilder::default()
            .with_min_delay(Duration::from_millis(self.min_delay_ms))
            .with_max_delay(Duration::from_millis(self.max_delay_ms))
            .with_max_times(self.max_times)
            .with_jitter()
    }
}

/// Errors that may clear up if the whole operation is retried.
pub trait Transient {
    fn is_transient(&self) -> bool;
}

/// Run `attempt` until it succeeds, fails permanently, or the backoff runs out.
///
/// Each attempt must be self-contained (its own transaction), so a retry
/// never observes half of a previous attempt. On exhaustion the last error
/// is returned.
pub async fn retry_transient<T, E, F, Fut>(
    operation: &str,
    backoff: ExponentialBuilder,
    attempt: F,
) -> Result<T, E>
where
    E: Transient + Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    retry_transient_until(operation, backoff, std::future::pending(), attempt).await
}

/// Like [`retry_transient`], but gives up as soon as `stop` resolves while
/// waiting between attempts, returning the error it yields.
///
/// An attempt already in flight always runs to completion.
pub async fn retry_transient_until<T, E, F, Fut, S>(
    operation: &str,
    backoff: ExponentialBuilder,
    stop: S,
    mut attempt: F,
) -> Result<T, E>
where
    E: Transient + Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    S: Future<Output = E>,
{
    let mut delays = backoff.build();
    let mut retries = 0u32;
    tokio::pin!(stop);

    loop {
        match attempt().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() => match delays.next() {
                Some(delay) => {
                    warn!(
                        operation,
                        attempt = retries,
                        error = %e,
                        "Transient storage failure, retrying"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        stopped = &mut stop => {
                            debug!(operation, attempt = retries, "Retry interrupted");
                            return Err(stopped);
                        }
                    }
                    retries += 1;
                }
                None => {
                    error!(operation, error = %e, "Retries exhausted");
                    return Err(e);
                }
            },
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests;
