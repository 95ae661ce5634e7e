//! Builtin step functions available to every registry the CLI builds.
//!
//! - `builtin.echo`: returns its parameters unchanged
//! - `builtin.sum`: adds numeric parameters (and arrays of numbers) into `total`

use serde_json::{json, Map, Value};

use super::registry::{StepFailure, StepInvocation, StepRegistry};

pub const ECHO: &str = "builtin.echo";
pub const SUM: &str = "builtin.sum";

/// Registers every builtin.
pub fn register_builtins(registry: &mut StepRegistry) {
    registry.register_fn(ECHO, |inv: StepInvocation| async move { Ok(echo(inv.params)) });
    registry.register_fn(SUM, |inv: StepInvocation| async move { sum(&inv.params) });
}

/// A registry holding only the builtins.
pub fn builtin_registry() -> StepRegistry {
    let mut registry = StepRegistry::new();
    register_builtins(&mut registry);
    registry
}

fn echo(params: Map<String, Value>) -> Value {
    Value::Object(params)
}

fn sum(params: &Map<String, Value>) -> Result<Value, StepFailure> {
    let mut total = 0.0;
    for (name, value) in params {
        total += numeric(value).ok_or_else(|| {
            StepFailure::permanent(format!("invalid parameter '{}': expected numbers", name))
        })?;
    }
    Ok(json!({ "total": total }))
}

fn numeric(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::Array(items) => items.iter().map(numeric).sum(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn invoke(params: Value) -> StepInvocation {
        let params = params.as_object().cloned().unwrap_or_default();
        StepInvocation::new("exec", 1, "test", params)
    }

    #[tokio::test]
    async fn test_echo() {
        let registry = builtin_registry();
        let echo = registry.get(ECHO).unwrap();
        let output = echo.call(invoke(json!({"a": 1, "b": "x"}))).await.unwrap();
        assert_eq!(output, json!({"a": 1, "b": "x"}));
    }

    #[tokio::test]
    async fn test_sum() {
        let registry = builtin_registry();
        let sum = registry.get(SUM).unwrap();
        let output = sum.call(invoke(json!({"a": 1, "b": [2, 3.5]}))).await.unwrap();
        assert_eq!(output, json!({"total": 6.5}));
    }

    #[tokio::test]
    async fn test_sum_rejects_text() {
        let registry = builtin_registry();
        let sum = registry.get(SUM).unwrap();
        let failure = sum.call(invoke(json!({"a": "ten"}))).await.unwrap_err();
        assert!(failure.message.contains("'a'"));
    }
}
