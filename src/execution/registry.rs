//! Step Function Registry
//!
//! Maps function identifiers to invocable units. The engine never knows what
//! a step computes: it hands the function a resolved parameter map and gets
//! back an output value or a typed [`StepFailure`].

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use super::retry::FailureClass;
use super::timeout::CleanupRegistry;

/// A failure reported by a step function.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{message}")]
pub struct StepFailure {
    pub message: String,
    /// Overrides keyword classification when set
    pub hint: Option<FailureClass>,
}

impl StepFailure {
    /// A failure left to the classifier.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            hint: None,
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            hint: Some(FailureClass::Transient),
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            hint: Some(FailureClass::Permanent),
        }
    }

    /// An attempt that ran past its deadline.
    pub fn timeout(secs: u64) -> Self {
        Self::transient(format!("timed out after {}s", secs))
    }
}

/// Everything a step function receives for one attempt.
#[derive(Clone)]
pub struct StepInvocation {
    pub execution_id: String,
    pub step_number: u32,
    pub step_name: String,
    /// 1-based attempt number
    pub attempt: u32,
    pub params: Map<String, Value>,
    cleanup: CleanupRegistry,
    cancel: CancellationToken,
}

impl StepInvocation {
    pub fn new(
        execution_id: impl Into<String>,
        step_number: u32,
        step_name: impl Into<String>,
        params: Map<String, Value>,
    ) -> Self {
        Self {
            execution_id: execution_id.into(),
            step_number,
            step_name: step_name.into(),
            attempt: 1,
            params,
            cleanup: CleanupRegistry::new(),
            cancel: CancellationToken::new(),
        }
    }

    pub(crate) fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = attempt;
        self
    }

    pub(crate) fn with_cleanup(mut self, cleanup: CleanupRegistry) -> Self {
        self.cleanup = cleanup;
        self
    }

    pub(crate) fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Registers work to undo if this attempt is abandoned on timeout.
    pub fn on_cancel(&self, cleanup: impl FnOnce() + Send + 'static) {
        self.cleanup.register(cleanup);
    }

    pub fn param(&self, name: &str) -> Option<&Value> {
        self.params.get(name)
    }

    /// Fires when the execution is cancelled.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }
}

impl fmt::Debug for StepInvocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StepInvocation")
            .field("execution_id", &self.execution_id)
            .field("step_number", &self.step_number)
            .field("step_name", &self.step_name)
            .field("attempt", &self.attempt)
            .field("params", &self.params)
            .finish()
    }
}

/// An invocable step implementation.
#[async_trait]
pub trait StepFunction: Send + Sync {
    async fn call(&self, invocation: StepInvocation) -> Result<Value, StepFailure>;
}

/// Adapts an async closure into a [`StepFunction`].
pub struct FnStep<F>(F);

impl<F> FnStep<F> {
    pub fn new<Fut>(f: F) -> Self
    where
        F: Fn(StepInvocation) -> Fut + Send + Sync,
        Fut: Future<Output = Result<Value, StepFailure>> + Send + 'static,
    {
        Self(f)
    }
}

#[async_trait]
impl<F, Fut> StepFunction for FnStep<F>
where
    F: Fn(StepInvocation) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, StepFailure>> + Send + 'static,
{
    async fn call(&self, invocation: StepInvocation) -> Result<Value, StepFailure> {
        (self.0)(invocation).await
    }
}

/// Function identifier -> implementation.
#[derive(Clone, Default)]
pub struct StepRegistry {
    functions: HashMap<String, Arc<dyn StepFunction>>,
}

impl StepRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an implementation, replacing any previous one with this id.
    pub fn register(&mut self, id: impl Into<String>, function: impl StepFunction + 'static) {
        self.functions.insert(id.into(), Arc::new(function));
    }

    /// Registers an async closure.
    ///
    /// ```
    /// use riskflow::execution::registry::StepRegistry;
    /// use serde_json::json;
    ///
    /// let mut registry = StepRegistry::new();
    /// registry.register_fn("const.one", |_| async { Ok(json!(1)) });
    /// assert!(registry.contains("const.one"));
    /// ```
    pub fn register_fn<F, Fut>(&mut self, id: impl Into<String>, f: F)
    where
        F: Fn(StepInvocation) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, StepFailure>> + Send + 'static,
    {
        self.register(id, FnStep::new(f));
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn StepFunction>> {
        self.functions.get(id).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.functions.contains_key(id)
    }

    /// Registered identifiers, sorted.
    pub fn ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.functions.keys().map(String::as_str).collect();
        ids.sort_unstable();
        ids
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }
}

impl fmt::Debug for StepRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StepRegistry").field("functions", &self.ids()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_register_and_call() {
        let mut registry = StepRegistry::new();
        registry.register_fn("double", |inv: StepInvocation| async move {
            let x = inv.param("x").and_then(Value::as_f64).unwrap_or(0.0);
            Ok(json!({ "value": x * 2.0 }))
        });

        let mut params = Map::new();
        params.insert("x".to_string(), json!(21));
        let invocation = StepInvocation::new("exec-1", 1, "double", params);

        let function = registry.get("double").unwrap();
        let output = function.call(invocation).await.unwrap();
        assert_eq!(output, json!({ "value": 42.0 }));
        assert!(registry.get("missing").is_none());
    }

    #[test]
    fn test_ids_sorted() {
        let mut registry = StepRegistry::new();
        registry.register_fn("b", |_| async { Ok(Value::Null) });
        registry.register_fn("a", |_| async { Ok(Value::Null) });
        assert_eq!(registry.ids(), vec!["a", "b"]);
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_failure_constructors() {
        assert_eq!(StepFailure::new("x").hint, None);
        assert_eq!(StepFailure::permanent("x").hint, Some(FailureClass::Permanent));
        let timeout = StepFailure::timeout(30);
        assert_eq!(timeout.hint, Some(FailureClass::Transient));
        assert_eq!(timeout.to_string(), "timed out after 30s");
    }

    #[test]
    fn test_on_cancel_registers_cleanup() {
        let cleanup = CleanupRegistry::new();
        let invocation =
            StepInvocation::new("e", 1, "s", Map::new()).with_cleanup(cleanup.clone());
        invocation.on_cancel(|| {});
        assert_eq!(cleanup.len(), 1);
    }
}
