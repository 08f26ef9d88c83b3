//! Bounded retries with a pluggable backoff.
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use streambot::retry::{FixedDelay, Retry};
//!
//! # tokio_test::block_on(async {
//! let retry = Retry::builder()
//!     .max_attempts(3)
//!     .backoff(FixedDelay(Duration::from_millis(1)))
//!     .build();
//! let value = retry
//!     .run(|attempt| async move {
//!         if attempt < 2 { Err("not yet") } else { Ok(attempt) }
//!     })
//!     .await
//!     .unwrap();
//! assert_eq!(value, 2);
//! # })
//! ```

use std::fmt::{Debug, Display};
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use typed_builder::TypedBuilder;

/// The number of attempts made by [Retry::default]: one try plus five retries.
pub const DEFAULT_MAX_ATTEMPTS: usize = 6;

/// Decides how long to wait before the next attempt.
pub trait Backoff: Send + Sync {
    /// The pause after failed attempt number `attempt` (counting from zero).
    fn delay(&self, attempt: usize) -> Duration;
}

/// Retry straight away.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Immediate;

impl Backoff for Immediate {
    fn delay(&self, _attempt: usize) -> Duration {
        Duration::ZERO
    }
}

/// Wait the same amount of time between every attempt.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FixedDelay(pub Duration);

impl Backoff for FixedDelay {
    fn delay(&self, _attempt: usize) -> Duration {
        self.0
    }
}

/// Returned when every attempt has failed.
#[derive(Debug, Error)]
pub enum RetryError<E> {
    #[error("Gave up after {attempts} attempts: {last}")]
    Exhausted { attempts: usize, last: E },
    #[error("Retry requires at least one attempt")]
    NoAttempts,
}

impl<E> RetryError<E> {
    /// The error of the final attempt, if any attempt was made.
    pub fn into_last(self) -> Option<E> {
        match self {
            RetryError::Exhausted { last, .. } => Some(last),
            RetryError::NoAttempts => None,
        }
    }
}

/// A bounded retry policy.
#[derive(Debug, Clone, TypedBuilder)]
pub struct Retry<B = Immediate> {
    /// Total number of attempts, including the first.
    #[builder(default = DEFAULT_MAX_ATTEMPTS)]
    max_attempts: usize,
    backoff: B,
}

impl Default for Retry<Immediate> {
    fn default() -> Self {
        Retry {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            backoff: Immediate,
        }
    }
}

impl<B: Backoff> Retry<B> {
    pub fn max_attempts(&self) -> usize {
        self.max_attempts
    }

    /// Run `op` until it succeeds or the attempts run out.
    ///
    /// `op` receives the zero based attempt number.
    pub async fn run<F, Fut, T, E>(&self, mut op: F) -> Result<T, RetryError<E>>
    where
        F: FnMut(usize) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display + Debug,
    {
        let mut attempt = 0;
        loop {
            if attempt >= self.max_attempts {
                return Err(RetryError::NoAttempts);
            }
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(e) if attempt + 1 >= self.max_attempts => {
                    return Err(RetryError::Exhausted {
                        attempts: attempt + 1,
                        last: e,
                    })
                }
                Err(e) => {
                    let delay = self.backoff.delay(attempt);
                    tracing::warn!(
                        "Attempt {} of {} failed, retrying in {:?}: {}",
                        attempt + 1,
                        self.max_attempts,
                        delay,
                        e
                    );
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                }
            }
            attempt += 1;
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use assert_matches::assert_matches;
    use std::sync::atomic::{AtomicUsize, Ordering};

    async fn fail_times(retry: &Retry<impl Backoff>, failures: usize) -> (Result<usize, RetryError<String>>, usize) {
        let calls = AtomicUsize::new(0);
        let result = retry
            .run(|attempt| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt < failures {
                        Err(format!("failure {attempt}"))
                    } else {
                        Ok(attempt)
                    }
                }
            })
            .await;
        (result, calls.load(Ordering::SeqCst))
    }

    #[tokio::test]
    async fn test_first_attempt_succeeds() {
        let (result, calls) = fail_times(&Retry::default(), 0).await;
        assert_eq!(result.unwrap(), 0);
        assert_eq!(calls, 1);
    }

    #[tokio::test]
    async fn test_recovers_after_transient_failures() {
        let (result, calls) = fail_times(&Retry::default(), 4).await;
        assert_eq!(result.unwrap(), 4);
        assert_eq!(calls, 5);
    }

    #[tokio::test]
    async fn test_gives_up() {
        let (result, calls) = fail_times(&Retry::default(), 6).await;
        assert_eq!(calls, DEFAULT_MAX_ATTEMPTS);
        let e = result.unwrap_err();
        assert_eq!(e.to_string(), "Gave up after 6 attempts: failure 5");
        assert_eq!(e.into_last().as_deref(), Some("failure 5"));
    }

    #[tokio::test]
    async fn test_zero_attempts() {
        let retry = Retry::builder().max_attempts(0).backoff(Immediate).build();
        let (result, calls) = fail_times(&retry, 0).await;
        assert_matches!(result, Err(RetryError::NoAttempts));
        assert_eq!(calls, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fixed_delay_between_attempts() {
        let retry = Retry::builder()
            .max_attempts(3)
            .backoff(FixedDelay(Duration::from_secs(2)))
            .build();
        let start = tokio::time::Instant::now();
        let (result, calls) = fail_times(&retry, 2).await;
        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls, 3);
        assert_eq!(start.elapsed(), Duration::from_secs(4));
    }
}
