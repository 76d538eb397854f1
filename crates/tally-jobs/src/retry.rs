//! Retry policy for external pipeline steps.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio::time::Instant;
use tracing::{debug, warn};

use tally_core::defaults::{
    RETRY_ATTEMPTS, RETRY_BASE_DELAY_MS, RETRY_MAX_DELAY_MS, RETRY_MULTIPLIER,
};
use tally_core::{Error, PipelineConfig, Result};

/// Exponential backoff for transient failures.
///
/// Only errors whose kind is [`tally_core::ErrorKind::Transient`] are retried.
/// No attempt starts once the run deadline has passed.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Attempts per step, including the first.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    /// Randomize each delay within `[delay / 2, delay]`.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: RETRY_ATTEMPTS,
            base_delay: Duration::from_millis(RETRY_BASE_DELAY_MS),
            max_delay: Duration::from_millis(RETRY_MAX_DELAY_MS),
            multiplier: RETRY_MULTIPLIER,
            jitter: true,
        }
    }
}

/// Result of a retried step together with the attempts it took.
#[derive(Debug)]
pub struct Attempted<T> {
    pub result: Result<T>,
    pub attempts: u32,
}

impl RetryPolicy {
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            max_attempts: config.retry_attempts.max(1),
            base_delay: Duration::from_millis(config.retry_base_delay_ms),
            max_delay: Duration::from_millis(config.retry_max_delay_ms),
            ..Self::default()
        }
    }

    /// A policy that never retries.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Backoff before retry number `retry` (1 for the first retry), without jitter.
    pub fn base_delay_for(&self, retry: u32) -> Duration {
        let factor = self.multiplier.powi(retry.saturating_sub(1) as i32);
        let millis = (self.base_delay.as_millis() as f64 * factor)
            .min(self.max_delay.as_millis() as f64);
        Duration::from_millis(millis as u64)
    }

    fn delay_for(&self, retry: u32) -> Duration {
        let delay = self.base_delay_for(retry);
        if !self.jitter || delay.is_zero() {
            return delay;
        }
        let half = delay / 2;
        half + rand::thread_rng().gen_range(Duration::ZERO..=half)
    }

    /// Run `step` until it succeeds, fails permanently, or attempts run out.
    pub async fn run<T, F, Fut>(&self, op: &str, deadline: Option<Instant>, step: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.run_counted(op, deadline, step).await.result
    }

    /// Like [`run`](Self::run), also reporting how many attempts were made.
    pub async fn run_counted<T, F, Fut>(
        &self,
        op: &str,
        deadline: Option<Instant>,
        mut step: F,
    ) -> Attempted<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            let err = match step().await {
                Ok(value) => {
                    return Attempted {
                        result: Ok(value),
                        attempts: attempt,
                    }
                }
                Err(e) => e,
            };

            if !err.is_transient() || attempt >= max_attempts {
                if err.is_transient() {
                    warn!(
                        subsystem = "jobs",
                        component = "retry",
                        op,
                        attempt,
                        error = %err,
                        "Retry attempts exhausted"
                    );
                }
                return Attempted {
                    result: Err(err),
                    attempts: attempt,
                };
            }

            let delay = self.delay_for(attempt);
            if let Some(deadline) = deadline {
                if Instant::now() + delay >= deadline {
                    warn!(
                        subsystem = "jobs",
                        component = "retry",
                        op,
                        attempt,
                        error = %err,
                        "Run deadline reached, not retrying"
                    );
                    return Attempted {
                        result: Err(Error::DeadlineExceeded),
                        attempts: attempt,
                    };
                }
            }

            debug!(
                subsystem = "jobs",
                component = "retry",
                op,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Transient failure, retrying"
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}

/// Bound a step by a timeout; expiry becomes a transient [`Error::Timeout`].
pub async fn with_timeout<T, Fut>(op: &str, timeout: Duration, fut: Fut) -> Result<T>
where
    Fut: Future<Output = Result<T>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(Error::Timeout(format!(
            "{} timed out after {}ms",
            op,
            timeout.as_millis()
        ))),
    }
}

/// Error unless the deadline is still ahead.
pub fn check_deadline(deadline: Instant) -> Result<()> {
    if Instant::now() >= deadline {
        Err(Error::DeadlineExceeded)
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(250),
            multiplier: 2.0,
            jitter: false,
        }
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let p = policy();
        assert_eq!(p.base_delay_for(1), Duration::from_millis(100));
        assert_eq!(p.base_delay_for(2), Duration::from_millis(200));
        assert_eq!(p.base_delay_for(3), Duration::from_millis(250));
        assert_eq!(p.base_delay_for(10), Duration::from_millis(250));
    }

    #[test]
    fn test_jitter_stays_within_half_to_full() {
        let p = policy().with_jitter(true);
        for _ in 0..50 {
            let d = p.delay_for(2);
            assert!(d >= Duration::from_millis(100) && d <= Duration::from_millis(200));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_error_is_retried_until_success() {
        let calls = AtomicU32::new(0);
        let out = policy()
            .run_counted("download", None, || async {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(Error::Timeout("slow".into()))
                } else {
                    Ok(7)
                }
            })
            .await;
        assert_eq!(out.result.unwrap(), 7);
        assert_eq!(out.attempts, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_error_is_not_retried() {
        let calls = AtomicU32::new(0);
        let out = policy()
            .run_counted("extract", None, || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(Error::validation("invoice_number", "missing"))
            })
            .await;
        assert!(out.result.is_err());
        assert_eq!(out.attempts, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempts_are_bounded() {
        let calls = AtomicU32::new(0);
        let err = policy()
            .run("download", None, || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(Error::RateLimited("429".into()))
            })
            .await
            .unwrap_err();
        assert!(err.is_transient());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_retry_starts_after_deadline() {
        let calls = AtomicU32::new(0);
        let deadline = Instant::now() + Duration::from_millis(50);
        let err = policy()
            .run("download", Some(deadline), || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(Error::Unavailable("down".into()))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::DeadlineExceeded));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_is_transient() {
        let err = with_timeout("download", Duration::from_secs(1), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await
        .unwrap_err();
        assert!(err.is_transient());
        assert!(err.to_string().contains("download timed out"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_check_deadline() {
        let deadline = Instant::now() + Duration::from_secs(1);
        assert!(check_deadline(deadline).is_ok());
        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(matches!(check_deadline(deadline), Err(Error::DeadlineExceeded)));
    }
}
