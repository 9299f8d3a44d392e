//! Bounded exponential backoff with jitter.

use std::{fmt::Display, future::Future, time::Duration};

use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Upper bound of the uniform jitter added to each delay.
    pub jitter: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(4),
            jitter: Duration::from_millis(100),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryError<E> {
    /// The operation failed with an error that must not be retried.
    Fatal(E),
    Exhausted { attempts: u32, last: E },
}

impl RetryPolicy {
    /// Delay after the failed attempt `attempt` (0-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let jitter_ms = u64::try_from(self.jitter.as_millis()).unwrap_or(u64::MAX);
        let jitter = if jitter_ms == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(rand::random_range(0..=jitter_ms))
        };
        self.backoff(attempt, jitter)
    }

    fn backoff(&self, attempt: u32, jitter: Duration) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        self.base_delay
            .saturating_mul(factor)
            .saturating_add(jitter)
            .min(self.max_delay)
    }

    /// Run `operation` until it succeeds, fails fatally, or runs out of
    /// attempts. The closure receives the 0-based attempt index.
    pub async fn run<T, E, F, Fut>(
        &self,
        op: &'static str,
        mut operation: F,
        is_transient: impl Fn(&E) -> bool,
    ) -> Result<T, RetryError<E>>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            let err = match operation(attempt).await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };
            if !is_transient(&err) {
                return Err(RetryError::Fatal(err));
            }

            let attempts = attempt + 1;
            if attempts >= max_attempts {
                return Err(RetryError::Exhausted {
                    attempts,
                    last: err,
                });
            }

            let delay = self.delay_for(attempt);
            warn!(
                target = "application::render::retry",
                op,
                attempt = attempts,
                max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Transient failure; retrying"
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}
