use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::warn;

/// Bounded exponential backoff for transient collaborator errors.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first one. Zero is treated as one.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based): `base * 2^(attempt-1)`,
    /// capped at `max_delay`, with up to 10% jitter.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let raw = self.base_delay.saturating_mul(1u32 << exp);
        let capped = raw.min(self.max_delay);
        let jitter_ms = (capped.as_millis() as u64) / 10;
        if jitter_ms == 0 {
            return capped;
        }
        capped + Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
    }
}

/// Errors that may succeed when repeated.
pub trait IsTransient {
    fn is_transient(&self) -> bool;

    /// Server-requested wait, when the error carries one.
    fn retry_after(&self) -> Option<Duration> {
        None
    }
}

/// Run `op` until it succeeds, fails permanently, or the attempt budget is
/// spent. The last error is returned on exhaustion.
pub async fn with_retry<T, E, F, Fut>(policy: &RetryPolicy, operation: &str, mut op: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: IsTransient + std::fmt::Display,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) if e.is_transient() && attempt < max_attempts => {
                let delay = e
                    .retry_after()
                    .map(|d| d.min(policy.max_delay))
                    .unwrap_or_else(|| policy.delay_for(attempt));
                warn!(
                    operation,
                    attempt,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    "transient error: {e}; retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
