//! Retry with exponential backoff and jitter
//!
//! Attempt `n` (0-indexed retry) waits
//! `min(max_delay, base_delay * exponential_base^n * jitter)` where jitter is
//! uniform in [0.75, 1.25] when enabled. The first attempt never waits.

use crate::{
    classifier::{DefaultRetryClassifier, RetryClassifier, Retryable},
    errors::AttemptTimeout,
};
use rand::Rng;
use serde::Serialize;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Backoff parameters for one service
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RetryConfig {
    /// Retries after the first attempt
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub exponential_base: f64,
    /// Multiply each delay by a random factor in [0.75, 1.25]
    pub jitter: bool,
    /// Deadline applied to every attempt on its own
    pub attempt_timeout: Option<Duration>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            exponential_base: 2.0,
            jitter: true,
            attempt_timeout: None,
        }
    }
}

impl RetryConfig {
    /// Single attempt, no delay
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }
}

/// Retry configuration plus the classifier deciding eligibility
#[derive(Clone)]
pub struct RetryPolicy {
    config: RetryConfig,
    classifier: Arc<dyn RetryClassifier>,
    label: String,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self {
            config,
            classifier: Arc::new(DefaultRetryClassifier),
            label: String::from("default"),
        }
    }

    /// Replace the default transient-error classification
    pub fn with_classifier(mut self, classifier: Arc<dyn RetryClassifier>) -> Self {
        self.classifier = classifier;
        self
    }

    /// Name reported in retry log lines
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Total attempts including the first one
    pub fn max_attempts(&self) -> u32 {
        self.config.max_retries.saturating_add(1)
    }

    /// Delay before retry number `attempt` (0 for the first retry)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let factor = if self.config.jitter {
            rand::rng().random_range(0.75..=1.25)
        } else {
            1.0
        };

        let secs = self.config.base_delay.as_secs_f64()
            * self.config.exponential_base.powi(exponent)
            * factor;
        let capped = secs.min(self.config.max_delay.as_secs_f64());

        Duration::try_from_secs_f64(capped).unwrap_or(self.config.max_delay)
    }

    /// Run `op` until it succeeds, attempts run out, or the error is not retryable
    ///
    /// The last error is returned unchanged.
    pub async fn run<T, E, F, Fut>(&self, mut op: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Retryable + From<AttemptTimeout>,
    {
        let max_attempts = self.max_attempts();
        let mut attempt = 0;

        loop {
            attempt += 1;

            let result = match self.config.attempt_timeout {
                Some(limit) => match tokio::time::timeout(limit, op()).await {
                    Ok(result) => result,
                    Err(_elapsed) => Err(E::from(AttemptTimeout(limit))),
                },
                None => op().await,
            };

            let error = match result {
                Ok(value) => return Ok(value),
                Err(error) => error,
            };

            if attempt >= max_attempts || !self.classifier.should_retry(&error) {
                return Err(error);
            }

            let delay = self.delay_for(attempt - 1);
            tracing::warn!(
                policy = %self.label,
                attempt,
                max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "attempt failed, retrying"
            );
            tokio::time::sleep(delay).await;
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(RetryConfig::default())
    }
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("label", &self.label)
            .field("config", &self.config)
            .field("classifier", &self.classifier)
            .finish()
    }
}

/// An operation bound to a retry policy
pub struct Retry<F> {
    op: F,
    policy: RetryPolicy,
}

/// Wrap `op` so every invocation goes through `policy`
pub fn with_retry<F>(op: F, policy: RetryPolicy) -> Retry<F> {
    Retry { op, policy }
}

impl<F> Retry<F> {
    pub async fn call<T, E, Fut>(&self) -> Result<T, E>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Retryable + From<AttemptTimeout>,
    {
        self.policy.run(|| (self.op)()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ServiceError;
    use crate::classifier::PredicateRetryClassifier;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::time::Instant;

    fn no_jitter() -> RetryConfig {
        RetryConfig {
            jitter: false,
            ..RetryConfig::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_schedule_and_last_error() {
        let policy = RetryPolicy::new(no_jitter());
        let start = Instant::now();
        let log = Mutex::new(Vec::new());
        let attempts = &log;

        let result: Result<(), _> = policy
            .run(move || async move {
                let mut attempts = attempts.lock();
                attempts.push(start.elapsed());
                Err(ServiceError::status(503, format!("attempt {}", attempts.len())))
            })
            .await;

        assert_eq!(result, Err(ServiceError::status(503, "attempt 4")));
        assert_eq!(
            log.lock().as_slice(),
            &[
                Duration::ZERO,
                Duration::from_millis(1000),
                Duration::from_millis(3000),
                Duration::from_millis(7000),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_retryable_error_runs_once() {
        let policy = RetryPolicy::new(no_jitter());
        let counter = AtomicU32::new(0);
        let calls = &counter;

        let result: Result<(), _> = policy
            .run(move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(ServiceError::status(400, "bad request"))
            })
            .await;

        assert!(result.is_err());
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovers_after_transient_failure() {
        let policy = RetryPolicy::new(no_jitter());
        let counter = AtomicU32::new(0);
        let calls = &counter;

        let result = policy
            .run(move || async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(ServiceError::network("ECONNRESET", "reset by peer"))
                } else {
                    Ok("done")
                }
            })
            .await;

        assert_eq!(result, Ok("done"));
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempt_timeout_is_retried() {
        let policy = RetryPolicy::new(RetryConfig {
            attempt_timeout: Some(Duration::from_millis(100)),
            ..no_jitter()
        });
        let counter = AtomicU32::new(0);
        let calls = &counter;

        let result = policy
            .run(move || async move {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                }
                Ok::<_, ServiceError>("second try")
            })
            .await;

        assert_eq!(result, Ok("second try"));
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempt_timeout_surfaces_as_timeout_error() {
        let policy = RetryPolicy::new(RetryConfig {
            max_retries: 1,
            attempt_timeout: Some(Duration::from_millis(50)),
            ..no_jitter()
        });

        let result: Result<(), ServiceError> = policy
            .run(|| async {
                tokio::time::sleep(Duration::from_secs(1)).await;
                Ok(())
            })
            .await;

        assert_eq!(result, Err(ServiceError::Timeout(Duration::from_millis(50))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_predicate_replaces_default() {
        let policy = RetryPolicy::new(no_jitter()).with_classifier(Arc::new(
            PredicateRetryClassifier::new(|error: &dyn Retryable| error.status_code() == Some(409)),
        ));
        let counter = AtomicU32::new(0);
        let calls = &counter;

        let _: Result<(), _> = policy
            .run(move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(ServiceError::status(409, "conflict"))
            })
            .await;
        assert_eq!(counter.load(Ordering::SeqCst), 4);

        counter.store(0, Ordering::SeqCst);
        let _: Result<(), _> = policy
            .run(move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(ServiceError::status(503, "unavailable"))
            })
            .await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_is_never_retried() {
        let policy = RetryPolicy::new(no_jitter())
            .with_classifier(Arc::new(PredicateRetryClassifier::new(|_: &dyn Retryable| true)));
        let counter = AtomicU32::new(0);
        let calls = &counter;

        let result: Result<(), _> = policy
            .run(move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(ServiceError::Cancelled)
            })
            .await;

        assert_eq!(result, Err(ServiceError::Cancelled));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_with_retry_wrapper_is_reusable() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let wrapped = with_retry(
            move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(ServiceError::status(502, "bad gateway"))
            },
            RetryPolicy::new(RetryConfig {
                max_retries: 1,
                ..no_jitter()
            }),
        );

        assert!(wrapped.call().await.is_err());
        assert!(wrapped.call().await.is_err());
        assert_eq!(counter.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn test_delay_is_capped() {
        let policy = RetryPolicy::new(RetryConfig {
            max_delay: Duration::from_secs(5),
            ..no_jitter()
        });

        assert_eq!(policy.delay_for(0), Duration::from_secs(1));
        assert_eq!(policy.delay_for(2), Duration::from_secs(4));
        assert_eq!(policy.delay_for(3), Duration::from_secs(5));
        assert_eq!(policy.delay_for(200), Duration::from_secs(5));
    }

    #[test]
    fn test_jitter_stays_within_quarter() {
        let policy = RetryPolicy::new(RetryConfig::default());

        for _ in 0..100 {
            let delay = policy.delay_for(0);
            assert!(
                (Duration::from_millis(750)..=Duration::from_millis(1250)).contains(&delay),
                "jittered delay {:?} out of range",
                delay
            );
        }
    }

    #[test]
    fn test_no_retry_config() {
        assert_eq!(RetryPolicy::new(RetryConfig::no_retry()).max_attempts(), 1);
    }
}
