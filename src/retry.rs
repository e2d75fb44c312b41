//! Retry policy shared by the fetch, upload and authentication paths.
//!
//! A single value object decides *whether* a failed attempt is retried and
//! *how long* to wait first, so the three call sites do not each grow their
//! own loop.
//!
//! | Error kind        | Retried?                         |
//! |-------------------|----------------------------------|
//! | NetworkTransient  | until `max_attempts` is reached  |
//! | IoFailure         | once                             |
//! | anything else     | never                            |

use crate::error::{ErrorKind, ItemError};
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::warn;

/// Delay schedule between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    /// Same delay before every retry.
    Fixed(Duration),
    /// `base * 2^(n-1)` before retry `n`, capped at `max`.
    Exponential { base: Duration, max: Duration },
}

impl Backoff {
    /// Delay to wait after failed attempt number `attempt` (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        match *self {
            Backoff::Fixed(d) => d,
            Backoff::Exponential { base, max } => {
                let shift = attempt.saturating_sub(1).min(16);
                base.saturating_mul(1u32 << shift).min(max)
            }
        }
    }
}

/// How many times to try an operation and how to space the attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Maximum number of attempts, including the first. Always ≥ 1.
    pub max_attempts: u32,
    pub backoff: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Backoff::Exponential {
                base: Duration::from_millis(1000),
                max: Duration::from_secs(30),
            },
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            backoff: Backoff::Fixed(Duration::ZERO),
        }
    }

    /// Whether attempt number `attempt` (1-based) that failed with `err`
    /// should be followed by another one.
    pub fn should_retry(&self, attempt: u32, err: &ItemError) -> bool {
        match err.kind() {
            ErrorKind::NetworkTransient => attempt < self.max_attempts,
            ErrorKind::IoFailure => attempt < 2,
            _ => false,
        }
    }

    /// Run `op` until it succeeds or the policy gives up.
    ///
    /// `op` receives the 1-based attempt number. Returns the final outcome
    /// together with the number of attempts made.
    pub async fn run<T, F, Fut>(&self, label: &str, mut op: F) -> (Result<T, ItemError>, u32)
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, ItemError>>,
    {
        let mut attempt = 1u32;
        loop {
            match op(attempt).await {
                Ok(v) => return (Ok(v), attempt),
                Err(e) if self.should_retry(attempt, &e) => {
                    let delay = self.backoff.delay(attempt);
                    warn!(
                        "{}: attempt {}/{} failed ({}), retrying in {}ms",
                        label,
                        attempt,
                        self.max_attempts,
                        e,
                        delay.as_millis()
                    );
                    if !delay.is_zero() {
                        sleep(delay).await;
                    }
                    attempt += 1;
                }
                Err(e) => return (Err(e), attempt),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn instant_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            backoff: Backoff::Fixed(Duration::ZERO),
        }
    }

    #[test]
    fn exponential_backoff_grows_and_is_capped() {
        let b = Backoff::Exponential {
            base: Duration::from_millis(500),
            max: Duration::from_secs(3),
        };
        assert_eq!(b.delay(1), Duration::from_millis(500));
        assert_eq!(b.delay(2), Duration::from_millis(1000));
        assert_eq!(b.delay(3), Duration::from_millis(2000));
        assert_eq!(b.delay(4), Duration::from_secs(3));
        assert_eq!(b.delay(40), Duration::from_secs(3));
    }

    #[test]
    fn only_transient_and_io_are_retried() {
        let p = instant_policy(3);
        assert!(p.should_retry(1, &ItemError::transient("reset")));
        assert!(p.should_retry(2, &ItemError::transient("reset")));
        assert!(!p.should_retry(3, &ItemError::transient("reset")));

        let io = ItemError::Io {
            detail: "disk full".into(),
        };
        assert!(p.should_retry(1, &io));
        assert!(!p.should_retry(2, &io));

        assert!(!p.should_retry(1, &ItemError::permanent("404")));
        assert!(!p.should_retry(1, &ItemError::SizeExceeded { size: 2, limit: 1 }));
        assert!(!p.should_retry(1, &ItemError::Auth { detail: "bad".into() }));
    }

    #[test]
    fn run_retries_transient_until_success() {
        let calls = AtomicU32::new(0);
        let (result, attempts) = tokio_test::block_on(instant_policy(3).run("t", |_| {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(ItemError::transient("flaky"))
                } else {
                    Ok(n)
                }
            }
        }));
        assert_eq!(result, Ok(2));
        assert_eq!(attempts, 3);
    }

    #[test]
    fn run_stops_on_permanent_error() {
        let calls = AtomicU32::new(0);
        let (result, attempts) = tokio_test::block_on(instant_policy(5).run("t", |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>(ItemError::permanent("HTTP 404")) }
        }));
        assert!(result.is_err());
        assert_eq!(attempts, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn run_gives_up_after_max_attempts() {
        let (result, attempts) = tokio_test::block_on(
            instant_policy(4).run("t", |_| async { Err::<(), _>(ItemError::transient("down")) }),
        );
        assert_eq!(result.unwrap_err().kind(), ErrorKind::NetworkTransient);
        assert_eq!(attempts, 4);
    }
}
