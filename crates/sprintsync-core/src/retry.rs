//! Bounded retry with exponential backoff for tracker calls.
//!
//! How often a call is retried depends on the error class:
//!
//! | error          | attempts              |
//! |----------------|-----------------------|
//! | `RateLimited`  | up to `max_attempts`  |
//! | `Unknown`      | 2 (one retry)         |
//! | `Duplicate`    | 1                     |
//! | `AuthFailed`   | 1                     |
//!
//! A `retry_after` hint from the tracker raises the backoff delay to at
//! least the hinted duration.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;

use crate::sync::pacing::Pacer;
use crate::tracker::TrackerError;

/// Attempts allowed for errors the tracker could not classify.
const UNKNOWN_ERROR_ATTEMPTS: u32 = 2;

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
            multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Same attempt budget, no waiting between attempts.
    #[must_use]
    pub fn immediate() -> Self {
        Self {
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            jitter: false,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    #[must_use]
    pub fn with_initial_delay(mut self, initial_delay: Duration) -> Self {
        self.initial_delay = initial_delay;
        self
    }

    #[must_use]
    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    #[must_use]
    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    #[must_use]
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Total attempts permitted once `error` has been observed.
    pub fn attempts_for(&self, error: &TrackerError) -> u32 {
        let max = self.max_attempts.max(1);
        match error {
            TrackerError::RateLimited { .. } => max,
            TrackerError::Unknown(_) => UNKNOWN_ERROR_ATTEMPTS.min(max),
            TrackerError::Duplicate | TrackerError::AuthFailed(_) => 1,
        }
    }

    /// Delay before the attempt following attempt number `attempt` (1-based).
    pub fn delay_after(&self, attempt: u32, error: &TrackerError) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32) as i32;
        let factor = self.multiplier.max(1.0).powi(exponent);
        let mut delay = self
            .initial_delay
            .mul_f64(factor)
            .min(self.max_delay);
        if self.jitter && !delay.is_zero() {
            delay = delay.mul_f64(rand::rng().random_range(0.5..=1.0));
        }
        if let TrackerError::RateLimited {
            retry_after: Some(hint),
        } = error
        {
            delay = delay.max(*hint);
        }
        delay
    }
}

/// Result of a retried call plus how many attempts it took.
#[derive(Debug)]
pub struct Attempted<T> {
    pub result: Result<T, TrackerError>,
    pub attempts: u32,
    /// Cancellation arrived while waiting to retry.
    pub interrupted: bool,
}

/// Run `operation` under `policy`.
///
/// When a `pacer` is given, every attempt (including retries) waits for
/// it first. Cancellation is honored only between attempts; an attempt in
/// flight always runs to completion.
pub async fn execute_with_retry<T, Op, Fut>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    mut pacer: Option<&mut Pacer>,
    mut operation: Op,
) -> Attempted<T>
where
    Op: FnMut() -> Fut,
    Fut: Future<Output = Result<T, TrackerError>>,
{
    let mut attempts: u32 = 0;
    loop {
        if let Some(pacer) = pacer.as_deref_mut() {
            pacer.ready().await;
        }
        attempts += 1;
        match operation().await {
            Ok(value) => {
                return Attempted {
                    result: Ok(value),
                    attempts,
                    interrupted: false,
                };
            }
            Err(error) if attempts < policy.attempts_for(&error) => {
                let delay = policy.delay_after(attempts, &error);
                tracing::warn!(
                    attempt = attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "tracker call failed with retryable error; retrying"
                );
                tokio::select! {
                    _ = cancel.cancelled() => {
                        return Attempted {
                            result: Err(error),
                            attempts,
                            interrupted: true,
                        };
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            Err(error) => {
                return Attempted {
                    result: Err(error),
                    attempts,
                    interrupted: false,
                };
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{
        Arc,
        atomic::{AtomicU32, Ordering},
    };

    fn failing_then_ok(
        calls: Arc<AtomicU32>,
        failures: u32,
        error: TrackerError,
    ) -> impl FnMut() -> std::future::Ready<Result<&'static str, TrackerError>> {
        move || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            if n < failures {
                std::future::ready(Err(error.clone()))
            } else {
                std::future::ready(Ok("ok"))
            }
        }
    }

    #[tokio::test]
    async fn rate_limited_retries_then_succeeds() {
        let calls = Arc::new(AtomicU32::new(0));
        let op = failing_then_ok(
            Arc::clone(&calls),
            1,
            TrackerError::RateLimited { retry_after: None },
        );
        let out =
            execute_with_retry(&RetryPolicy::immediate(), &CancellationToken::new(), None, op)
                .await;
        assert_eq!(out.result.unwrap(), "ok");
        assert_eq!(out.attempts, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn rate_limited_gives_up_after_max_attempts() {
        let calls = Arc::new(AtomicU32::new(0));
        let op = failing_then_ok(
            Arc::clone(&calls),
            10,
            TrackerError::RateLimited { retry_after: None },
        );
        let policy = RetryPolicy::immediate().with_max_attempts(4);
        let out = execute_with_retry(&policy, &CancellationToken::new(), None, op).await;
        assert!(matches!(out.result, Err(TrackerError::RateLimited { .. })));
        assert_eq!(out.attempts, 4);
    }

    #[tokio::test]
    async fn unknown_retries_exactly_once() {
        let calls = Arc::new(AtomicU32::new(0));
        let op = failing_then_ok(Arc::clone(&calls), 10, TrackerError::Unknown("boom".into()));
        let policy = RetryPolicy::immediate().with_max_attempts(5);
        let out = execute_with_retry(&policy, &CancellationToken::new(), None, op).await;
        assert_eq!(out.attempts, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn duplicate_and_auth_never_retry() {
        for error in [TrackerError::Duplicate, TrackerError::AuthFailed("401".into())] {
            let calls = Arc::new(AtomicU32::new(0));
            let op = failing_then_ok(Arc::clone(&calls), 10, error);
            let out =
                execute_with_retry(&RetryPolicy::immediate(), &CancellationToken::new(), None, op)
                    .await;
            assert!(out.result.is_err());
            assert_eq!(out.attempts, 1);
        }
    }

    #[tokio::test]
    async fn cancellation_interrupts_backoff() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let calls = Arc::new(AtomicU32::new(0));
        let op = failing_then_ok(
            Arc::clone(&calls),
            10,
            TrackerError::RateLimited { retry_after: None },
        );
        let policy = RetryPolicy::default().with_initial_delay(Duration::from_secs(60));
        let out = execute_with_retry(&policy, &cancel, None, op).await;
        assert!(out.interrupted);
        assert_eq!(out.attempts, 1);
    }

    #[test]
    fn backoff_grows_and_caps() {
        let policy = RetryPolicy::default().with_jitter(false);
        let err = TrackerError::Unknown("x".into());
        assert_eq!(policy.delay_after(1, &err), Duration::from_millis(500));
        assert_eq!(policy.delay_after(2, &err), Duration::from_millis(1000));
        assert_eq!(policy.delay_after(3, &err), Duration::from_millis(2000));
        assert_eq!(policy.delay_after(20, &err), Duration::from_secs(8));
    }

    #[test]
    fn retry_after_hint_raises_delay() {
        let policy = RetryPolicy::default().with_jitter(false);
        let err = TrackerError::RateLimited {
            retry_after: Some(Duration::from_secs(30)),
        };
        assert_eq!(policy.delay_after(1, &err), Duration::from_secs(30));
    }

    #[test]
    fn jitter_stays_within_half_to_full_delay() {
        let policy = RetryPolicy::default();
        let err = TrackerError::Unknown("x".into());
        for _ in 0..50 {
            let d = policy.delay_after(2, &err);
            assert!(d >= Duration::from_millis(500) && d <= Duration::from_millis(1000));
        }
    }
}
