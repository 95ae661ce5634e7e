//! Individual Step Execution
//!
//! Resolves one step completely before the scheduler sees it:
//! - Skip-condition evaluation
//! - Parameter resolution from the input mapping
//! - Per-attempt deadline with the step's timeout strategy
//! - Retries of transient failures
//! - The step's `on_error` policy once local handling is exhausted
//!
//! The result is always a [`StepReport`]; a step never returns an error to
//! the scheduler.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::expression::{resolve_value, CacheKey, ConditionCache};
use crate::execution::context::ExecutionContext;
use crate::workflow::model::{OnError, StepDefinition, TimeoutStrategy};

use super::registry::{StepFailure, StepFunction, StepInvocation};
use super::retry::{AttemptRecord, RetryCoordinator};
use super::timeout::{CleanupRegistry, Deadline, TimeoutSupervisor};

/// Final state of a step within one execution.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    /// Never reached
    Pending,
    Completed,
    /// Finished with a substituted fallback value
    CompletedWithFallback,
    Skipped,
    Failed,
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StepStatus::Pending => "pending",
            StepStatus::Completed => "completed",
            StepStatus::CompletedWithFallback => "completed_with_fallback",
            StepStatus::Skipped => "skipped",
            StepStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Why a step was skipped.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// Its condition evaluated false
    Condition,
    /// It failed and `on_error: skip` dropped it
    OnError,
    /// It timed out under `on_timeout: skip`
    Timeout,
    /// The execution was cancelled while it ran
    Cancelled,
}

/// Audit entry for one step.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct StepReport {
    pub step_number: u32,
    pub name: String,
    pub function: String,
    pub output_variable: String,
    pub status: StepStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_reason: Option<SkipReason>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attempts: Vec<AttemptRecord>,
    /// A definition defect, not a runtime failure
    #[serde(default)]
    pub fatal: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub duration_ms: u64,
}

impl StepReport {
    /// A report for a step that has not run.
    pub fn pending(step: &StepDefinition) -> Self {
        Self {
            step_number: step.step_number,
            name: step.name.clone(),
            function: step.function.clone(),
            output_variable: step.output_variable.clone(),
            status: StepStatus::Pending,
            output: None,
            error: None,
            skip_reason: None,
            attempts: Vec::new(),
            fatal: false,
            started_at: None,
            duration_ms: 0,
        }
    }

    fn skipped(step: &StepDefinition, reason: SkipReason) -> Self {
        let mut report = Self::pending(step);
        report.status = StepStatus::Skipped;
        report.skip_reason = Some(reason);
        report
    }

    /// A step that failed outside its own retry and error handling.
    pub(crate) fn failed(step: &StepDefinition, message: impl Into<String>) -> Self {
        let mut report = Self::pending(step);
        report.status = StepStatus::Failed;
        report.error = Some(message.into());
        report
    }

    /// A definition defect found while preparing the step.
    pub(crate) fn fatal(step: &StepDefinition, message: impl Into<String>) -> Self {
        let mut report = Self::failed(step, message);
        report.fatal = true;
        report
    }

    /// Attempts beyond the first.
    pub fn retries(&self) -> usize {
        self.attempts.len().saturating_sub(1)
    }

    /// True if the step produced a value for its output variable.
    pub fn stores_output(&self) -> bool {
        matches!(
            self.status,
            StepStatus::Completed | StepStatus::CompletedWithFallback
        ) && self.output.is_some()
    }

    /// True if this step stops the execution.
    pub fn aborts_execution(&self) -> bool {
        self.status == StepStatus::Failed
    }
}

/// What the scheduler does with a step before spawning it.
#[derive(Debug)]
pub enum Preparation {
    /// Run with these resolved parameters
    Ready(Map<String, Value>),
    /// Already resolved (skipped by condition, or a definition defect)
    Resolved(StepReport),
}

/// Cache key for a step's skip-condition.
pub fn condition_key(workflow_id: &str, version: &str, step_number: u32) -> CacheKey {
    CacheKey::new(format!("{}/step/{}", workflow_id, step_number), version)
}

/// Evaluates the skip-condition and resolves parameters against the
/// context as it stood at the last barrier.
pub fn prepare(
    step: &StepDefinition,
    key: &CacheKey,
    ctx: &ExecutionContext,
    cache: &ConditionCache,
) -> Preparation {
    if let Some(source) = &step.condition {
        let runs = match cache.get_or_parse(key, source) {
            Ok(condition) => condition.evaluate(ctx),
            Err(e) => {
                warn!("Step {} condition '{}' is unparsable: {}", step.step_number, source, e);
                false
            }
        };
        if !runs {
            info!("Step {} '{}' skipped: condition is false", step.step_number, step.name);
            return Preparation::Resolved(StepReport::skipped(step, SkipReason::Condition));
        }
    }

    let mut params = Map::new();
    for (param, mapping) in &step.input_mapping {
        match resolve_value(mapping, ctx) {
            Ok(value) => {
                params.insert(param.clone(), value);
            }
            Err(e) => {
                error!(
                    "Step {} '{}' cannot resolve parameter '{}': {}",
                    step.step_number, step.name, param, e
                );
                return Preparation::Resolved(StepReport::fatal(
                    step,
                    format!("parameter '{}': {}", param, e),
                ));
            }
        }
    }
    Preparation::Ready(params)
}

/// A prepared step, ready to be spawned.
pub struct StepTask {
    pub execution_id: String,
    pub step: StepDefinition,
    pub params: Map<String, Value>,
    pub function: Arc<dyn StepFunction>,
    pub retry: RetryCoordinator,
    pub cancel: CancellationToken,
}

enum AttemptResult {
    Output(Value),
    TimedOut,
    Cancelled,
}

/// Runs a prepared step through its retry, timeout and error policies.
pub async fn execute_step(task: StepTask) -> StepReport {
    let StepTask {
        execution_id,
        step,
        params,
        function,
        retry,
        cancel,
    } = task;

    let mut report = StepReport::pending(&step);
    report.started_at = Some(Utc::now());
    let started = Instant::now();

    let supervisor = TimeoutSupervisor::from_secs(step.timeout);
    let strategy = step.on_timeout;
    let label = format!("step {} ({})", step.step_number, step.name);

    let outcome = retry
        .run(&label, step.error_handling.retry_count, &cancel, |attempt| {
            let cleanup = CleanupRegistry::new();
            let invocation =
                StepInvocation::new(&execution_id, step.step_number, &step.name, params.clone())
                    .with_attempt(attempt)
                    .with_cleanup(cleanup.clone())
                    .with_cancellation(cancel.clone());
            let function = Arc::clone(&function);
            let cancel = cancel.clone();
            let timeout_secs = step.timeout;

            async move {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        supervisor.abandon(&cleanup);
                        Ok(AttemptResult::Cancelled)
                    }
                    deadline = supervisor.supervise(&cleanup, function.call(invocation)) => {
                        match deadline {
                            Deadline::Completed(result) => result.map(AttemptResult::Output),
                            Deadline::Expired => match strategy {
                                TimeoutStrategy::Fail => Err(StepFailure::timeout(timeout_secs)),
                                TimeoutStrategy::Fallback | TimeoutStrategy::Skip => {
                                    Ok(AttemptResult::TimedOut)
                                }
                            },
                        }
                    }
                }
            }
        })
        .await;

    report.attempts = outcome.attempts;

    match outcome.result {
        Ok(AttemptResult::Output(value)) => {
            report.status = StepStatus::Completed;
            report.output = Some(value);
        }
        Ok(AttemptResult::TimedOut) => {
            let message = format!("timed out after {}s", step.timeout);
            report.error = Some(message.clone());
            if strategy == TimeoutStrategy::Fallback {
                warn!("{} {}; using fallback value", label, message);
                report.status = StepStatus::CompletedWithFallback;
                report.output = Some(step.fallback_value());
            } else {
                warn!("{} {}; skipping", label, message);
                report.status = StepStatus::Skipped;
                report.skip_reason = Some(SkipReason::Timeout);
            }
        }
        Ok(AttemptResult::Cancelled) => {
            // the interrupted attempt has no outcome
            report.attempts.pop();
            report.status = StepStatus::Skipped;
            report.skip_reason = Some(SkipReason::Cancelled);
        }
        Err(failure) if outcome.cancelled => {
            report.status = StepStatus::Skipped;
            report.skip_reason = Some(SkipReason::Cancelled);
            report.error = Some(failure.message);
        }
        Err(failure) => {
            report.error = Some(failure.message.clone());
            match step.error_handling.on_error {
                OnError::Fail => {
                    error!("{} failed: {}", label, failure);
                    report.status = StepStatus::Failed;
                }
                OnError::Skip => {
                    warn!("{} failed, output dropped: {}", label, failure);
                    report.status = StepStatus::Skipped;
                    report.skip_reason = Some(SkipReason::OnError);
                }
                OnError::Continue => {
                    warn!("{} failed, continuing with fallback: {}", label, failure);
                    report.status = StepStatus::CompletedWithFallback;
                    report.output = Some(step.fallback_value());
                }
            }
        }
    }

    report.duration_ms = started.elapsed().as_millis() as u64;
    debug!("{} resolved as {} in {}ms", label, report.status, report.duration_ms);
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::context::ContextMetadata;
    use crate::execution::registry::FnStep;
    use crate::execution::retry::RetryPolicy;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn ctx(steps: &[StepDefinition], input: Value) -> ExecutionContext {
        ExecutionContext::new(steps, input, ContextMetadata::new("exec-test"))
    }

    fn fast_retry() -> RetryCoordinator {
        RetryCoordinator::new(RetryPolicy {
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(100),
            jitter_ratio: 0.0,
        })
    }

    fn task(step: StepDefinition, function: impl StepFunction + 'static) -> StepTask {
        StepTask {
            execution_id: "exec-test".to_string(),
            step,
            params: Map::new(),
            function: Arc::new(function),
            retry: fast_retry(),
            cancel: CancellationToken::new(),
        }
    }

    #[test]
    fn test_prepare_resolves_params() {
        let step = StepDefinition::new(1, "calc", "f", "calc")
            .with_input("load", "$input.load")
            .with_literal("factor", json!(1.5));
        let context = ctx(&[step.clone()], json!({"load": 40}));
        let cache = ConditionCache::new();

        match prepare(&step, &condition_key("wf", "1", 1), &context, &cache) {
            Preparation::Ready(params) => {
                assert_eq!(params["load"], json!(40));
                assert_eq!(params["factor"], json!(1.5));
            }
            other => panic!("expected ready, got {:?}", other),
        }
    }

    #[test]
    fn test_prepare_false_condition_skips() {
        let step = StepDefinition::new(1, "calc", "f", "calc").with_condition("$input.load > 100");
        let context = ctx(&[step.clone()], json!({"load": 40}));
        let cache = ConditionCache::new();

        match prepare(&step, &condition_key("wf", "1", 1), &context, &cache) {
            Preparation::Resolved(report) => {
                assert_eq!(report.status, StepStatus::Skipped);
                assert_eq!(report.skip_reason, Some(SkipReason::Condition));
                assert!(!report.stores_output());
            }
            other => panic!("expected skip, got {:?}", other),
        }
    }

    #[test]
    fn test_prepare_missing_path_is_fatal() {
        let step = StepDefinition::new(1, "calc", "f", "calc").with_input("load", "$input.missing");
        let context = ctx(&[step.clone()], json!({}));
        let cache = ConditionCache::new();

        match prepare(&step, &condition_key("wf", "1", 1), &context, &cache) {
            Preparation::Resolved(report) => {
                assert!(report.fatal);
                assert_eq!(report.status, StepStatus::Failed);
            }
            other => panic!("expected fatal, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_execute_success() {
        let step = StepDefinition::new(1, "ok", "f", "ok");
        let report = execute_step(task(step, FnStep::new(|_| async { Ok(json!({"v": 1})) }))).await;
        assert_eq!(report.status, StepStatus::Completed);
        assert_eq!(report.output, Some(json!({"v": 1})));
        assert_eq!(report.attempts.len(), 1);
        assert!(report.stores_output());
    }

    #[tokio::test(start_paused = true)]
    async fn test_on_error_policies() {
        let failing = || FnStep::new(|_| async { Err(StepFailure::permanent("invalid load")) });

        let fail = StepDefinition::new(1, "a", "f", "a");
        let report = execute_step(task(fail, failing())).await;
        assert_eq!(report.status, StepStatus::Failed);
        assert!(report.aborts_execution());
        assert!(!report.fatal);

        let skip = StepDefinition::new(1, "a", "f", "a").on_error(OnError::Skip);
        let report = execute_step(task(skip, failing())).await;
        assert_eq!(report.skip_reason, Some(SkipReason::OnError));
        assert!(report.output.is_none());

        let cont = StepDefinition::new(1, "a", "f", "a")
            .on_error(OnError::Continue)
            .with_fallback(json!({"v": 0}));
        let report = execute_step(task(cont, failing())).await;
        assert_eq!(report.status, StepStatus::CompletedWithFallback);
        assert_eq!(report.output, Some(json!({"v": 0})));
        assert_eq!(report.error.as_deref(), Some("invalid load"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_strategies() {
        let slow = || {
            FnStep::new(|_| async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(json!(1))
            })
        };

        let fallback = StepDefinition::new(1, "a", "f", "a")
            .with_timeout(1)
            .with_retries(3)
            .on_timeout(TimeoutStrategy::Fallback)
            .with_fallback(json!("default"));
        let report = execute_step(task(fallback, slow())).await;
        assert_eq!(report.status, StepStatus::CompletedWithFallback);
        assert_eq!(report.output, Some(json!("default")));
        assert_eq!(report.attempts.len(), 1);

        let skip = StepDefinition::new(1, "a", "f", "a")
            .with_timeout(1)
            .on_timeout(TimeoutStrategy::Skip);
        let report = execute_step(task(skip, slow())).await;
        assert_eq!(report.skip_reason, Some(SkipReason::Timeout));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_fail_is_retried() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let function = FnStep::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(json!(1))
            }
        });

        let step = StepDefinition::new(1, "a", "f", "a").with_timeout(2).with_retries(1);
        let report = execute_step(task(step, function)).await;
        assert_eq!(report.status, StepStatus::Failed);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(report.retries(), 1);
        assert_eq!(report.error.as_deref(), Some("timed out after 2s"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_runs_step_cleanup() {
        let cleaned = Arc::new(AtomicUsize::new(0));
        let flag = Arc::clone(&cleaned);
        let function = FnStep::new(move |inv: StepInvocation| {
            let flag = Arc::clone(&flag);
            async move {
                inv.on_cancel(move || {
                    flag.fetch_add(1, Ordering::SeqCst);
                });
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(json!(1))
            }
        });

        let step = StepDefinition::new(1, "a", "f", "a")
            .with_timeout(1)
            .on_timeout(TimeoutStrategy::Skip);
        execute_step(task(step, function)).await;
        assert_eq!(cleaned.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_step_is_skipped() {
        let step = StepDefinition::new(1, "a", "f", "a");
        let mut t = task(
            step,
            FnStep::new(|_| async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(json!(1))
            }),
        );
        let cancel = CancellationToken::new();
        t.cancel = cancel.clone();

        let handle = tokio::spawn(execute_step(t));
        tokio::time::sleep(Duration::from_secs(1)).await;
        cancel.cancel();

        let report = handle.await.unwrap();
        assert_eq!(report.skip_reason, Some(SkipReason::Cancelled));
        assert!(report.attempts.is_empty());
    }
}
