//! Bounded exponential backoff for the connection handshake.

use std::future::Future;
use std::time::Duration;

use steward_protocol::{StreamError, StreamResult};
use tokio::time::sleep;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    /// Delay after failed attempt `attempt` (1-based): `base * 2^(attempt-1)`,
    /// capped at `max_delay`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2_u32.saturating_pow(attempt.saturating_sub(1));
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

/// Run `operation` until it succeeds, fails with a non-connection error, or
/// exhausts the policy. Exhaustion surfaces as `StreamingFailed`.
pub(crate) async fn with_retry<F, Fut, T>(policy: &RetryPolicy, mut operation: F) -> StreamResult<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = StreamResult<T>>,
{
    let mut attempt = 1;
    loop {
        match operation(attempt).await {
            Ok(value) => {
                if attempt > 1 {
                    debug!(attempt, "handshake succeeded after retry");
                }
                return Ok(value);
            }
            Err(error) if !error.is_connection_failure() => {
                debug!(attempt, error = %error, "non-retryable handshake error");
                return Err(error);
            }
            Err(error) if attempt >= policy.max_attempts => {
                warn!(
                    attempts = attempt,
                    error = %error,
                    "handshake retries exhausted"
                );
                return Err(StreamError::StreamingFailed {
                    attempts: attempt,
                    message: error.to_string(),
                });
            }
            Err(error) => {
                let delay = policy.backoff(attempt);
                warn!(
                    attempt,
                    max_attempts = policy.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "handshake failed; retrying"
                );
                sleep(delay).await;
                attempt += 1;
            }
        }
    }
}
