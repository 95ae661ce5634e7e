//! Retry Coordination
//!
//! Classifies step failures and retries transient ones with exponential
//! backoff:
//!
//! - delay before retry `n` = `min(cap, base * 2^(n-1))`
//! - plus jitter drawn from `[0, jitter_ratio * delay)`
//!
//! Permanent failures are never retried. Every attempt is logged and kept
//! as an [`AttemptRecord`] for the audit trail.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::RetryConfig;

use super::registry::StepFailure;

/// Whether a failure is worth retrying.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    Transient,
    Permanent,
}

impl fmt::Display for FailureClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureClass::Transient => write!(f, "transient"),
            FailureClass::Permanent => write!(f, "permanent"),
        }
    }
}

/// Decides whether a step failure is transient or permanent.
pub trait FailureClassifier: Send + Sync {
    fn classify(&self, failure: &StepFailure) -> FailureClass;
}

const PERMANENT_SIGNALS: &[&str] = &[
    "validation",
    "invalid",
    "malformed",
    "unauthorized",
    "forbidden",
    "auth",
    "parse",
    "schema",
];

const TRANSIENT_SIGNALS: &[&str] = &[
    "timeout",
    "timed out",
    "rate limit",
    "429",
    "503",
    "unavailable",
    "temporarily",
    "contention",
    "busy",
    "deadlock",
    "connection reset",
];

/// Classifies by keywords in the failure message.
///
/// An explicit hint wins. Otherwise permanent keywords are checked first,
/// then transient ones; anything unrecognised is treated as transient.
#[derive(Debug, Clone)]
pub struct KeywordClassifier {
    permanent: Vec<String>,
    transient: Vec<String>,
}

impl Default for KeywordClassifier {
    fn default() -> Self {
        Self {
            permanent: PERMANENT_SIGNALS.iter().map(|s| s.to_string()).collect(),
            transient: TRANSIENT_SIGNALS.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl KeywordClassifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_permanent(mut self, keyword: impl Into<String>) -> Self {
        self.permanent.push(keyword.into().to_lowercase());
        self
    }

    pub fn with_transient(mut self, keyword: impl Into<String>) -> Self {
        self.transient.push(keyword.into().to_lowercase());
        self
    }
}

impl FailureClassifier for KeywordClassifier {
    fn classify(&self, failure: &StepFailure) -> FailureClass {
        if let Some(hint) = failure.hint {
            return hint;
        }
        let message = failure.message.to_lowercase();
        if self.permanent.iter().any(|k| message.contains(k.as_str())) {
            return FailureClass::Permanent;
        }
        if !self.transient.iter().any(|k| message.contains(k.as_str())) {
            debug!("Unrecognised failure treated as transient: {}", failure.message);
        }
        FailureClass::Transient
    }
}

/// Backoff schedule.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter_ratio: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            jitter_ratio: config.jitter_ratio,
        }
    }

    /// Delay before retry `retry` (1-based), without jitter.
    pub fn delay_for(&self, retry: u32) -> Duration {
        if retry == 0 {
            return Duration::ZERO;
        }
        let factor = 2u32.checked_pow(retry - 1).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Delay before retry `retry` with jitter applied.
    pub fn jittered_delay(&self, retry: u32) -> Duration {
        let delay = self.delay_for(retry);
        if self.jitter_ratio <= 0.0 || delay.is_zero() {
            return delay;
        }
        let jitter = rand::thread_rng().gen_range(0.0..self.jitter_ratio);
        delay + delay.mul_f64(jitter)
    }
}

/// How one attempt ended.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum AttemptOutcome {
    Succeeded,
    Failed { class: FailureClass, error: String },
}

/// Audit entry for one attempt.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct AttemptRecord {
    /// 1-based attempt number
    pub attempt: u32,
    /// Backoff waited before this attempt
    pub delay_ms: u64,
    #[serde(flatten)]
    pub outcome: AttemptOutcome,
    pub duration_ms: u64,
}

/// Result of a retried operation.
#[derive(Debug)]
pub struct RetryOutcome<T> {
    pub result: Result<T, StepFailure>,
    pub attempts: Vec<AttemptRecord>,
    /// True if cancellation cut the retries short
    pub cancelled: bool,
}

/// Runs an operation, retrying transient failures.
#[derive(Clone)]
pub struct RetryCoordinator {
    policy: RetryPolicy,
    classifier: Arc<dyn FailureClassifier>,
}

impl Default for RetryCoordinator {
    fn default() -> Self {
        Self::new(RetryPolicy::default())
    }
}

impl fmt::Debug for RetryCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryCoordinator").field("policy", &self.policy).finish()
    }
}

impl RetryCoordinator {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            classifier: Arc::new(KeywordClassifier::default()),
        }
    }

    pub fn with_classifier(mut self, classifier: Arc<dyn FailureClassifier>) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn classify(&self, failure: &StepFailure) -> FailureClass {
        self.classifier.classify(failure)
    }

    /// Runs `operation` up to `1 + max_retries` times.
    ///
    /// `operation` receives the 1-based attempt number. Backoff waits end
    /// early if `cancel` fires, returning the last failure.
    pub async fn run<T, F, Fut>(
        &self,
        label: &str,
        max_retries: u32,
        cancel: &CancellationToken,
        mut operation: F,
    ) -> RetryOutcome<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, StepFailure>>,
    {
        let max_attempts = max_retries + 1;
        let mut attempts = Vec::new();
        let mut attempt = 1;
        let mut delay = Duration::ZERO;

        loop {
            let started = Instant::now();
            let result = operation(attempt).await;
            let duration_ms = started.elapsed().as_millis() as u64;

            let failure = match result {
                Ok(value) => {
                    if attempt > 1 {
                        info!("{}: attempt {}/{} succeeded", label, attempt, max_attempts);
                    } else {
                        debug!("{}: attempt 1/{} succeeded", label, max_attempts);
                    }
                    attempts.push(AttemptRecord {
                        attempt,
                        delay_ms: delay.as_millis() as u64,
                        outcome: AttemptOutcome::Succeeded,
                        duration_ms,
                    });
                    return RetryOutcome {
                        result: Ok(value),
                        attempts,
                        cancelled: false,
                    };
                }
                Err(failure) => failure,
            };

            let class = self.classify(&failure);
            attempts.push(AttemptRecord {
                attempt,
                delay_ms: delay.as_millis() as u64,
                outcome: AttemptOutcome::Failed {
                    class,
                    error: failure.message.clone(),
                },
                duration_ms,
            });

            if class == FailureClass::Permanent {
                warn!(
                    "{}: attempt {}/{} failed permanently: {}",
                    label, attempt, max_attempts, failure
                );
                return RetryOutcome {
                    result: Err(failure),
                    attempts,
                    cancelled: false,
                };
            }

            if attempt >= max_attempts {
                warn!(
                    "{}: attempt {}/{} failed ({}), retries exhausted: {}",
                    label, attempt, max_attempts, class, failure
                );
                return RetryOutcome {
                    result: Err(failure),
                    attempts,
                    cancelled: false,
                };
            }

            delay = self.policy.jittered_delay(attempt);
            warn!(
                "{}: attempt {}/{} failed ({}): {}; retrying in {}ms",
                label,
                attempt,
                max_attempts,
                class,
                failure,
                delay.as_millis()
            );

            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!("{}: retry abandoned, execution cancelled", label);
                    return RetryOutcome {
                        result: Err(failure),
                        attempts,
                        cancelled: true,
                    };
                }
                _ = tokio::time::sleep(delay) => {}
            }
            attempt += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn policy(base_ms: u64, cap_ms: u64, jitter: f64) -> RetryPolicy {
        RetryPolicy {
            base_delay: Duration::from_millis(base_ms),
            max_delay: Duration::from_millis(cap_ms),
            jitter_ratio: jitter,
        }
    }

    #[test]
    fn test_classifier_keywords() {
        let classifier = KeywordClassifier::default();
        let classify = |m: &str| classifier.classify(&StepFailure::new(m));

        assert_eq!(classify("Schema validation failed"), FailureClass::Permanent);
        assert_eq!(classify("401 Unauthorized"), FailureClass::Permanent);
        assert_eq!(classify("upstream timed out"), FailureClass::Transient);
        assert_eq!(classify("HTTP 503"), FailureClass::Transient);
        assert_eq!(classify("something odd"), FailureClass::Transient);
        // permanent wins over transient
        assert_eq!(classify("invalid response after timeout"), FailureClass::Permanent);
    }

    #[test]
    fn test_hint_overrides_keywords() {
        let classifier = KeywordClassifier::default();
        let failure = StepFailure::transient("invalid but retryable");
        assert_eq!(classifier.classify(&failure), FailureClass::Transient);

        let failure = StepFailure::permanent("service busy");
        assert_eq!(classifier.classify(&failure), FailureClass::Permanent);
    }

    #[test]
    fn test_custom_keywords() {
        let classifier = KeywordClassifier::new().with_permanent("Quota");
        assert_eq!(
            classifier.classify(&StepFailure::new("quota exceeded")),
            FailureClass::Permanent
        );
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let p = policy(1000, 5000, 0.0);
        assert_eq!(p.delay_for(1), Duration::from_millis(1000));
        assert_eq!(p.delay_for(2), Duration::from_millis(2000));
        assert_eq!(p.delay_for(3), Duration::from_millis(4000));
        assert_eq!(p.delay_for(4), Duration::from_millis(5000));
        assert_eq!(p.delay_for(40), Duration::from_millis(5000));
    }

    #[test]
    fn test_backoff_non_decreasing() {
        let p = policy(250, 30_000, 0.0);
        let delays: Vec<Duration> = (1..=20).map(|n| p.delay_for(n)).collect();
        assert!(delays.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(*delays.last().unwrap(), Duration::from_millis(30_000));
    }

    #[test]
    fn test_jitter_bounds() {
        let p = policy(1000, 30_000, 0.1);
        for _ in 0..200 {
            let d = p.jittered_delay(2).as_millis();
            assert!((2000..2200).contains(&d), "delay {} out of range", d);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_retries_with_backoff() {
        let coordinator = RetryCoordinator::new(policy(1000, 30_000, 0.1));
        let calls = AtomicU32::new(0);
        let cancel = CancellationToken::new();
        let started = tokio::time::Instant::now();

        let outcome = coordinator
            .run("step 1", 2, &cancel, |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(StepFailure::new("service unavailable")) }
            })
            .await;

        assert!(outcome.result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(outcome.attempts.len(), 3);
        assert_eq!(outcome.attempts[0].delay_ms, 0);
        assert!((1000..1100).contains(&outcome.attempts[1].delay_ms));
        assert!((2000..2200).contains(&outcome.attempts[2].delay_ms));

        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(3000));
        assert!(elapsed < Duration::from_millis(3300));
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_on_third_attempt() {
        let coordinator = RetryCoordinator::new(policy(1000, 30_000, 0.1));
        let cancel = CancellationToken::new();

        let outcome = coordinator
            .run("step 1", 2, &cancel, |attempt| async move {
                if attempt < 3 {
                    Err(StepFailure::transient("busy"))
                } else {
                    Ok(attempt)
                }
            })
            .await;

        assert_eq!(outcome.result.unwrap(), 3);
        assert_eq!(outcome.attempts.last().unwrap().outcome, AttemptOutcome::Succeeded);
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_not_retried() {
        let coordinator = RetryCoordinator::default();
        let cancel = CancellationToken::new();

        let outcome = coordinator
            .run("step 1", 5, &cancel, |_| async {
                Err::<(), _>(StepFailure::new("malformed payload"))
            })
            .await;

        assert_eq!(outcome.attempts.len(), 1);
        assert!(matches!(
            outcome.attempts[0].outcome,
            AttemptOutcome::Failed { class: FailureClass::Permanent, .. }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_interrupts_backoff() {
        let coordinator = RetryCoordinator::default();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let outcome = coordinator
            .run("step 1", 3, &cancel, |_| async {
                Err::<(), _>(StepFailure::transient("busy"))
            })
            .await;

        assert!(outcome.cancelled);
        assert_eq!(outcome.attempts.len(), 1);
    }
}
