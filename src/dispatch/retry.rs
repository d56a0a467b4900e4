//! Exponential backoff with jitter
//!
//! Shared by command dispatch (3 attempts, 1 s base) and the heartbeat
//! probe (2 attempts, 2 s base). Only transient failures are retried;
//! anything else surfaces immediately.

use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::{error, warn};

/// Errors that know whether a retry can help.
pub trait Retriable {
    fn is_retriable(&self) -> bool;
}

/// Backoff parameters.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Fractional jitter applied to each delay (±jitter × delay).
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
            jitter: 0.1,
        }
    }
}

impl RetryPolicy {
    /// Heartbeat probe policy: two quick attempts.
    pub fn heartbeat() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_secs(2),
            ..Self::default()
        }
    }

    /// Delay before retry number `attempt` (1-based), jittered.
    fn delay_for(&self, attempt: u32) -> Duration {
        let exp = self.base_delay.as_secs_f64() * 2f64.powi(attempt.saturating_sub(1) as i32);
        let capped = exp.min(self.max_delay.as_secs_f64());
        let jittered = if self.jitter > 0.0 {
            let spread = self.jitter * capped;
            capped + rand::thread_rng().gen_range(-spread..=spread)
        } else {
            capped
        };
        Duration::from_secs_f64(jittered.max(0.0))
    }
}

/// Run `op` until it succeeds, the error is non-retriable, or the policy's
/// retry budget is spent. The last error is returned on exhaustion.
pub async fn retry_with_backoff<T, E, F, Fut>(
    policy: RetryPolicy,
    label: &str,
    mut op: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Retriable + std::fmt::Display,
{
    let mut attempt = 0u32;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retriable() && attempt < policy.max_retries => {
                attempt += 1;
                let delay = policy.delay_for(attempt);
                warn!(
                    label,
                    attempt,
                    max_retries = policy.max_retries,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Attempt failed, backing off"
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => {
                if attempt > 0 {
                    error!(label, attempts = attempt + 1, error = %e, "All attempts failed");
                }
                return Err(e);
            }
        }
    }
}
