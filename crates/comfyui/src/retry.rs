//! Exponential-backoff retry for network calls.
//!
//! Every retryable operation (submit, history poll, download) goes through
//! [`RetryContext::run`], which races each attempt and each backoff sleep
//! against the client's cancellation token and, when set, the execution
//! [`Deadline`].

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::clock::Clock;
use crate::error::ComfyUIError;
use crate::observer::{ExecutionEvent, ExecutionObserver};

/// Tunable parameters for the exponential-backoff strategy.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    /// Delay after the first failure.
    pub base_delay: Duration,
    /// Upper bound on the delay between attempts.
    pub max_delay: Duration,
    /// Factor by which the delay grows after each failure.
    pub multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Delay to wait after failed attempt number `attempt` (1-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let mut delay = self.base_delay.min(self.max_delay);
        for _ in 1..attempt {
            delay = next_delay(delay, self);
        }
        delay
    }
}

/// Calculate the next backoff delay from the current delay and config.
///
/// The result is clamped to [`RetryConfig::max_delay`].
pub fn next_delay(current: Duration, config: &RetryConfig) -> Duration {
    let next_ms = (current.as_millis() as f64 * config.multiplier) as u64;
    Duration::from_millis(next_ms).min(config.max_delay)
}

/// Hard end of one execution, in [`Clock::now`] time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deadline {
    started: Duration,
    at: Duration,
}

impl Deadline {
    pub fn new(started: Duration, timeout: Duration) -> Self {
        Self {
            started,
            at: started + timeout,
        }
    }

    pub fn started(&self) -> Duration {
        self.started
    }

    /// Time left at `now`; zero once the deadline has passed.
    pub fn remaining(&self, now: Duration) -> Duration {
        self.at.saturating_sub(now)
    }

    pub fn elapsed(&self, now: Duration) -> Duration {
        now.saturating_sub(self.started)
    }
}

/// Everything a retried call needs, borrowed from the owning client.
#[derive(Clone, Copy)]
pub struct RetryContext<'a> {
    pub config: &'a RetryConfig,
    pub clock: &'a dyn Clock,
    pub cancel: &'a CancellationToken,
    pub observer: &'a dyn ExecutionObserver,
    /// When set, attempts and backoff never run past it.
    pub deadline: Option<Deadline>,
}

impl<'a> RetryContext<'a> {
    pub fn with_deadline(mut self, deadline: Deadline) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Time left before the deadline, or `None` when there is no deadline.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline.map(|d| d.remaining(self.clock.now()))
    }

    /// Run `attempt` until it succeeds, fails with a non-retryable error,
    /// runs out of attempts, the token is cancelled, or the deadline passes.
    ///
    /// Exhaustion yields `Network { "<operation> failed after N attempts: <last error>" }`
    /// carrying the last HTTP status. A passed deadline yields `Timeout`, even
    /// with a request still in flight.
    pub async fn run<T, E, F, Fut>(&self, operation: &str, mut attempt: F) -> Result<T, ComfyUIError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        ComfyUIError: From<E>,
    {
        let max_attempts = self.config.max_attempts.max(1);
        let mut number = 0u32;

        loop {
            if self.cancel.is_cancelled() {
                return Err(ComfyUIError::Cancelled);
            }
            let remaining = self.remaining();
            if remaining.is_some_and(|r| r.is_zero()) {
                return Err(self.timed_out());
            }
            number += 1;

            let outcome = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(ComfyUIError::Cancelled),
                result = attempt() => result.map_err(ComfyUIError::from),
                _ = self.expire(remaining) => {
                    tracing::warn!(operation, attempt = number, "Deadline passed during request");
                    return Err(self.timed_out());
                }
            };

            let err = match outcome {
                Ok(value) => return Ok(value),
                Err(err) if !err.is_retryable() => return Err(err),
                Err(err) => err,
            };

            if number >= max_attempts {
                tracing::warn!(operation, attempts = number, error = %err, "Giving up");
                let noun = if number == 1 { "attempt" } else { "attempts" };
                return Err(ComfyUIError::Network {
                    message: format!("{operation} failed after {number} {noun}: {}", err.detail()),
                    status: err.status(),
                });
            }

            let mut delay = self.config.delay_for_attempt(number);
            if let Some(remaining) = self.remaining() {
                delay = delay.min(remaining);
            }
            self.observer.on_event(&ExecutionEvent::Retrying {
                operation: operation.to_string(),
                attempt: number,
                delay_ms: delay.as_millis() as u64,
                error: err.detail(),
            });

            tokio::select! {
                _ = self.cancel.cancelled() => return Err(ComfyUIError::Cancelled),
                _ = self.clock.sleep(delay) => {}
            }
        }
    }

    /// Resolves once `remaining` has elapsed; never without a deadline.
    async fn expire(&self, remaining: Option<Duration>) {
        match remaining {
            Some(remaining) => self.clock.sleep(remaining).await,
            None => std::future::pending().await,
        }
    }

    fn timed_out(&self) -> ComfyUIError {
        let now = self.clock.now();
        ComfyUIError::Timeout {
            elapsed: self.deadline.map(|d| d.elapsed(now)).unwrap_or_default(),
        }
    }
}
