//! Retry with jittered exponential backoff for transient write conflicts.
//!
//! The unit of work must be re-runnable from scratch: every attempt opens its
//! own transaction and re-reads all state, so nothing computed by a failed
//! attempt leaks into the next one.

use rand::Rng;
use std::fmt;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;

/// Bounds for re-running a unit of work.
///
/// `max_attempts` counts every invocation, including the first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(20),
            max_delay: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    /// Window `[base·2^k, base·2^(k+1))` for retry index `k`, capped at `max_delay`.
    pub fn backoff_window(&self, retry: u32) -> (Duration, Duration) {
        let factor = 1u32 << retry.min(20);
        let low = self.base_delay.saturating_mul(factor).min(self.max_delay);
        let high = self.base_delay.saturating_mul(factor.saturating_mul(2)).min(self.max_delay);
        (low, high)
    }

    /// Random delay inside the backoff window, so colliding callers spread out.
    pub fn delay_for_retry(&self, retry: u32) -> Duration {
        let (low, high) = self.backoff_window(retry);
        if low >= high {
            return low;
        }
        let nanos = rand::thread_rng().gen_range(low.as_nanos() as u64..high.as_nanos() as u64);
        Duration::from_nanos(nanos)
    }
}

/// Why a retried operation gave up.
#[derive(Debug, thiserror::Error)]
pub enum RetryError<E> {
    /// The predicate classified the failure as permanent.
    #[error("{0}")]
    Permanent(E),

    #[error("gave up after {attempts} attempt(s): {last}")]
    Exhausted { attempts: u32, last: E },
}

/// Run `operation` until it succeeds, fails permanently, or the policy's
/// attempts are spent. Only failures for which `is_transient` holds are
/// retried. There is no sleep after the final attempt.
pub async fn retry_with_predicate<F, Fut, T, E, P>(
    policy: &RetryPolicy,
    mut operation: F,
    is_transient: P,
) -> Result<T, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: fmt::Display,
    P: Fn(&E) -> bool,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        attempt += 1;
        match operation().await {
            Ok(value) => {
                if attempt > 1 {
                    tracing::info!(attempt, "Operation succeeded after retry");
                }
                return Ok(value);
            }
            Err(err) if !is_transient(&err) => return Err(RetryError::Permanent(err)),
            Err(err) => {
                if attempt >= max_attempts {
                    tracing::error!(attempt, error = %err, "Transient failure, retries exhausted");
                    return Err(RetryError::Exhausted { attempts: attempt, last: err });
                }

                let delay = policy.delay_for_retry(attempt - 1);
                tracing::warn!(
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "Transient failure, retrying"
                );
                sleep(delay).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::new(max_attempts, Duration::from_millis(1))
    }

    #[test]
    fn test_backoff_window_doubles() {
        let policy = RetryPolicy::new(5, Duration::from_millis(10));
        assert_eq!(policy.backoff_window(0), (Duration::from_millis(10), Duration::from_millis(20)));
        assert_eq!(policy.backoff_window(1), (Duration::from_millis(20), Duration::from_millis(40)));
        assert_eq!(policy.backoff_window(2), (Duration::from_millis(40), Duration::from_millis(80)));
    }

    #[test]
    fn test_delay_stays_in_window() {
        let policy = RetryPolicy::new(5, Duration::from_millis(10));
        for retry in 0..4 {
            let (low, high) = policy.backoff_window(retry);
            for _ in 0..50 {
                let delay = policy.delay_for_retry(retry);
                assert!(delay >= low && delay < high, "{:?} outside [{:?}, {:?})", delay, low, high);
            }
        }
    }

    #[test]
    fn test_delay_is_capped() {
        let policy = RetryPolicy::new(30, Duration::from_millis(100)).with_max_delay(Duration::from_millis(250));
        assert_eq!(policy.delay_for_retry(10), Duration::from_millis(250));
    }

    #[test]
    fn test_zero_attempts_clamped_to_one() {
        assert_eq!(RetryPolicy::new(0, Duration::ZERO).max_attempts, 1);
    }

    #[tokio::test]
    async fn test_succeeds_after_transient_failures() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);

        let result = retry_with_predicate(
            &fast(3),
            || {
                let c = Arc::clone(&counter);
                async move {
                    if c.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err("deadlock".to_string())
                    } else {
                        Ok(7)
                    }
                }
            },
            |_: &String| true,
        )
        .await;

        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_permanent_failure_is_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);

        let result: Result<(), _> = retry_with_predicate(
            &fast(5),
            || {
                let c = Arc::clone(&counter);
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Err("seat taken".to_string())
                }
            },
            |e: &String| e.contains("deadlock"),
        )
        .await;

        assert!(matches!(result, Err(RetryError::Permanent(ref e)) if e == "seat taken"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_exhaustion_reports_attempts() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);

        let result: Result<(), _> = retry_with_predicate(
            &fast(3),
            || {
                let c = Arc::clone(&counter);
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Err("deadlock".to_string())
                }
            },
            |_: &String| true,
        )
        .await;

        match result {
            Err(RetryError::Exhausted { attempts, last }) => {
                assert_eq!(attempts, 3);
                assert_eq!(last, "deadlock");
            }
            other => panic!("unexpected: {:?}", other.map(|_| ())),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
