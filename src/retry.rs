// Bounded retry with exponential backoff and jitter.
//
// Used for the two places a failure is expected to clear by itself:
// authorization failures during a crawl (the next attempt rotates to a
// different credential) and establishing the relational store connection.
// Retries are an explicit loop with an attempt counter, never recursion.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::warn;

/// Backoff schedule: `base * 2^(attempt - 1)`, capped at `max`, with
/// +/- 25% jitter, for at most `max_retries` retries after the first try.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub base: Duration,
    pub max: Duration,
    pub max_retries: u32,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(2),
            max: Duration::from_secs(60),
            max_retries: 5,
        }
    }
}

impl Backoff {
    /// Un-jittered delay before retry number `attempt` (1-based).
    pub fn ceiling_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.base.saturating_mul(1u32 << exponent).min(self.max)
    }

    /// Jittered delay before retry number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let ceiling = self.ceiling_for(attempt);
        let jitter_factor = rand::rng().random_range(0.75..=1.25);
        Duration::from_secs_f64(ceiling.as_secs_f64() * jitter_factor)
    }
}

/// Run `operation` until it succeeds, fails with an error `should_retry`
/// rejects, or the retry budget is spent. The last error is returned.
pub async fn with_retry<F, Fut, T, E, P>(
    policy: &Backoff,
    what: &str,
    should_retry: P,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    P: Fn(&E) -> bool,
{
    let mut attempt = 0u32;

    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                if !should_retry(&err) || attempt >= policy.max_retries {
                    return Err(err);
                }

                attempt += 1;
                let delay = policy.delay_for(attempt);

                warn!(
                    attempt,
                    max_retries = policy.max_retries,
                    backoff_secs = delay.as_secs_f64(),
                    error = %err,
                    "{what} failed, retrying in {:.1}s (attempt {}/{})",
                    delay.as_secs_f64(),
                    attempt,
                    policy.max_retries,
                );

                tokio::time::sleep(delay).await;
            }
        }
    }
}
