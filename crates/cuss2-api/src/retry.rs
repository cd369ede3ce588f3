//! Exponential backoff shared by the authentication and socket-connect loops.
//!
//! Single request/response exchanges are never retried here; only
//! establishing a session is.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::error::Error;

// ── RetryPolicy ──────────────────────────────────────────────────────

/// Exponential backoff configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one. Default: 10.
    pub max_attempts: u32,

    /// Delay before the first retry. Default: 1s.
    pub min_timeout: Duration,

    /// Upper bound on backoff delay. Default: 64s.
    pub max_timeout: Duration,

    /// Growth factor between consecutive delays. Default: 2.0.
    pub multiplier: f64,

    /// Spread delays by up to +-25%. Default: true.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            min_timeout: Duration::from_secs(1),
            max_timeout: Duration::from_secs(64),
            multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Delay to wait after the `retry`-th failure (zero-based).
    ///
    /// `delay = min(min_timeout * multiplier^retry, max_timeout) * jitter`
    pub fn backoff(&self, retry: u32) -> Duration {
        let exponent = i32::try_from(retry).unwrap_or(i32::MAX);
        let base = self.min_timeout.as_secs_f64() * self.multiplier.powi(exponent);
        let capped = base.min(self.max_timeout.as_secs_f64());

        if !self.jitter {
            return Duration::from_secs_f64(capped.max(0.0));
        }

        // Deterministic "jitter" seeded from the attempt number.
        // Not cryptographically random, but good enough for backoff spread.
        let jitter_factor = 1.0 + 0.25 * (f64::from(retry) * 7.3).sin();
        Duration::from_secs_f64((capped * jitter_factor).max(0.0))
    }
}

// ── Retry loop ───────────────────────────────────────────────────────

/// Run `op` until it succeeds, fails with a non-transient error, or the
/// policy's attempt budget is spent. `op` receives the 1-based attempt number.
///
/// Cancelling `cancel` during a backoff sleep returns the last error.
pub(crate) async fn retry<T, F, Fut>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    mut op: F,
) -> Result<T, Error>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, Error>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt: u32 = 0;

    loop {
        attempt += 1;

        let err = match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(e) => e,
        };

        if !err.is_transient() {
            return Err(err);
        }

        if attempt >= max_attempts {
            warn!(error = %err, max_attempts, "retry budget exhausted");
            return Err(err);
        }

        let delay = policy.backoff(attempt - 1);
        warn!(
            error = %err,
            attempt,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            "attempt failed, backing off"
        );

        tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(err),
            () = tokio::time::sleep(delay) => {}
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────────
