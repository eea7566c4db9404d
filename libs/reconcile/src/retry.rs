//! Retry driver.
//!
//! An operation is expressed as a [`Retryable`]: one attempt, reporting both
//! its outcome and whether a failure is worth trying again. Strategies own
//! the pacing and the give-up rule.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::time::{sleep, Instant};
use tracing::debug;

type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// A single bounded operation that a strategy may repeat.
#[async_trait]
pub trait Retryable: Send + Sync {
    /// Runs one attempt.
    ///
    /// Returns `(is_retryable, result)`. `is_retryable` is only consulted when
    /// `result` is an error.
    async fn attempt(&self) -> (bool, anyhow::Result<()>);
}

/// Why a strategy stopped retrying.
#[derive(Debug, Error)]
pub enum RetryError {
    /// Every allowed attempt failed.
    #[error("gave up after {attempts} attempts")]
    AttemptsExhausted {
        attempts: u32,
        #[source]
        source: BoxError,
    },

    /// The deadline passed before an attempt succeeded.
    #[error("timed out after {elapsed:?} ({attempts} attempts)")]
    Timeout {
        elapsed: Duration,
        attempts: u32,
        #[source]
        source: BoxError,
    },

    /// An attempt failed and said it should not be repeated.
    #[error("attempt failed and is not retryable")]
    NotRetryable {
        #[source]
        source: BoxError,
    },
}

impl RetryError {
    /// Returns true if the strategy gave up because of its time bound.
    pub fn is_timeout(&self) -> bool {
        matches!(self, RetryError::Timeout { .. })
    }
}

/// Retries up to a fixed number of attempts with a constant delay.
///
/// Zero attempts succeeds without calling the retryable.
#[derive(Debug, Clone)]
pub struct AttemptRetryStrategy {
    max_attempts: u32,
    delay: Duration,
}

impl AttemptRetryStrategy {
    pub fn new(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            delay,
        }
    }

    pub async fn try_run<R: Retryable + ?Sized>(&self, retryable: &R) -> Result<(), RetryError> {
        let mut last_err = None;

        for attempt in 1..=self.max_attempts {
            debug!(attempt, max_attempts = self.max_attempts, "Making attempt");

            match retryable.attempt().await {
                (_, Ok(())) => return Ok(()),
                (false, Err(e)) => return Err(RetryError::NotRetryable { source: e.into() }),
                (true, Err(e)) => last_err = Some(e),
            }

            if attempt < self.max_attempts {
                sleep(self.delay).await;
            }
        }

        match last_err {
            Some(e) => Err(RetryError::AttemptsExhausted {
                attempts: self.max_attempts,
                source: e.into(),
            }),
            None => Ok(()),
        }
    }
}

/// Retries until a deadline with a constant delay between attempts.
#[derive(Debug, Clone)]
pub struct TimeoutRetryStrategy {
    timeout: Duration,
    delay: Duration,
}

impl TimeoutRetryStrategy {
    pub fn new(timeout: Duration, delay: Duration) -> Self {
        Self { timeout, delay }
    }

    pub async fn try_run<R: Retryable + ?Sized>(&self, retryable: &R) -> Result<(), RetryError> {
        let started = Instant::now();
        let deadline = started + self.timeout;
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            debug!(attempt = attempts, "Making attempt");

            let err = match retryable.attempt().await {
                (_, Ok(())) => return Ok(()),
                (false, Err(e)) => return Err(RetryError::NotRetryable { source: e.into() }),
                (true, Err(e)) => e,
            };

            if Instant::now() + self.delay > deadline {
                return Err(RetryError::Timeout {
                    elapsed: started.elapsed(),
                    attempts,
                    source: err.into(),
                });
            }

            sleep(self.delay).await;
        }
    }
}

/// Retries for as long as attempts report themselves retryable.
#[derive(Debug, Clone)]
pub struct UnlimitedRetryStrategy {
    delay: Duration,
}

impl UnlimitedRetryStrategy {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }

    pub async fn try_run<R: Retryable + ?Sized>(&self, retryable: &R) -> Result<(), RetryError> {
        let mut attempts = 0u64;

        loop {
            attempts += 1;
            debug!(attempt = attempts, "Making attempt");

            match retryable.attempt().await {
                (_, Ok(())) => return Ok(()),
                (false, Err(e)) => return Err(RetryError::NotRetryable { source: e.into() }),
                (true, Err(_)) => sleep(self.delay).await,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    /// Fails `failures` times with the given retryability, then succeeds.
    struct Flaky {
        failures: u32,
        retryable: bool,
        calls: AtomicU32,
    }

    impl Flaky {
        fn new(failures: u32, retryable: bool) -> Self {
            Self {
                failures,
                retryable,
                calls: AtomicU32::new(0),
            }
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Retryable for Flaky {
        async fn attempt(&self) -> (bool, anyhow::Result<()>) {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call <= self.failures {
                (self.retryable, Err(anyhow::anyhow!("fake-error-{call}")))
            } else {
                (true, Ok(()))
            }
        }
    }

    fn root_message(err: &RetryError) -> String {
        std::error::Error::source(err)
            .map(|s| s.to_string())
            .unwrap_or_default()
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempt_strategy_stops_on_success() {
        let flaky = Flaky::new(2, true);
        let strategy = AttemptRetryStrategy::new(5, Duration::from_secs(1));

        strategy.try_run(&flaky).await.unwrap();
        assert_eq!(flaky.calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempt_strategy_returns_last_error() {
        let flaky = Flaky::new(10, true);
        let strategy = AttemptRetryStrategy::new(3, Duration::from_secs(1));

        let started = Instant::now();
        let err = strategy.try_run(&flaky).await.unwrap_err();
        assert_eq!(flaky.calls(), 3);
        assert!(matches!(err, RetryError::AttemptsExhausted { attempts: 3, .. }));
        assert_eq!(root_message(&err), "fake-error-3");
        // No sleep after the final attempt.
        assert_eq!(started.elapsed(), Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempt_strategy_zero_attempts() {
        let flaky = Flaky::new(10, true);
        let strategy = AttemptRetryStrategy::new(0, Duration::from_secs(1));

        strategy.try_run(&flaky).await.unwrap();
        assert_eq!(flaky.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_not_retryable_stops_immediately() {
        let flaky = Flaky::new(10, false);
        let strategy = AttemptRetryStrategy::new(5, Duration::from_secs(1));

        let err = strategy.try_run(&flaky).await.unwrap_err();
        assert_eq!(flaky.calls(), 1);
        assert!(matches!(err, RetryError::NotRetryable { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_strategy_gives_up_at_deadline() {
        let flaky = Flaky::new(u32::MAX, true);
        let strategy =
            TimeoutRetryStrategy::new(Duration::from_secs(10), Duration::from_millis(500));

        let err = strategy.try_run(&flaky).await.unwrap_err();
        assert!(err.is_timeout());
        assert_eq!(flaky.calls(), 21);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_strategy_succeeds_before_deadline() {
        let flaky = Flaky::new(4, true);
        let strategy =
            TimeoutRetryStrategy::new(Duration::from_secs(10), Duration::from_millis(500));

        strategy.try_run(&flaky).await.unwrap();
        assert_eq!(flaky.calls(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unlimited_strategy() {
        let flaky = Flaky::new(100, true);
        let strategy = UnlimitedRetryStrategy::new(Duration::from_millis(10));

        strategy.try_run(&flaky).await.unwrap();
        assert_eq!(flaky.calls(), 101);
    }
}
