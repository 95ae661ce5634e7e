//! Variable References
//!
//! Parses and resolves `$`-prefixed references against an
//! [`ExecutionContext`]:
//!
//! - `$input.load.max` - workflow input
//! - `$context.actor` - execution metadata
//! - `$step3.result` - output of step number 3
//! - `$steps.beam_check.ok` - output stored under an output variable
//!
//! Path segments made only of digits index into arrays. Resolution is pure:
//! it never mutates the context.

use std::fmt;

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use thiserror::Error;

use crate::execution::context::ExecutionContext;

static STEP_HEAD: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^step([0-9]+)$").expect("step reference pattern is valid"));

/// Errors raised while resolving a reference.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ResolveError {
    #[error("unresolved variable '{reference}': {reason}")]
    UnresolvedVariable { reference: String, reason: String },

    #[error("path not found for '{reference}': missing '{segment}'")]
    PathNotFound { reference: String, segment: String },
}

/// Where a reference starts its traversal.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Source {
    Input,
    Context,
    /// `$step<N>`
    Step(u32),
    /// `$steps.<output_variable>`
    StepVariable(String),
}

/// A parsed variable reference.
#[derive(Debug, Clone, PartialEq)]
pub struct VariableRef {
    raw: String,
    source: Source,
    path: Vec<String>,
}

/// Returns true if a string is written as a reference.
pub fn is_reference(text: &str) -> bool {
    text.starts_with('$')
}

impl VariableRef {
    /// Parses a reference string such as `$step2.result.value`.
    pub fn parse(raw: &str) -> Result<Self, ResolveError> {
        let unresolved = |reason: &str| ResolveError::UnresolvedVariable {
            reference: raw.to_string(),
            reason: reason.to_string(),
        };

        let body = raw
            .trim()
            .strip_prefix('$')
            .ok_or_else(|| unresolved("references must start with '$'"))?;

        let segments: Vec<&str> = body.split('.').collect();
        if segments.iter().any(|s| s.is_empty()) {
            return Err(unresolved("empty path segment"));
        }

        let (source, rest) = match segments[0] {
            "input" => (Source::Input, &segments[1..]),
            "context" => (Source::Context, &segments[1..]),
            "steps" => {
                let var = segments
                    .get(1)
                    .ok_or_else(|| unresolved("'$steps' needs an output variable name"))?;
                (Source::StepVariable(var.to_string()), &segments[2..])
            }
            head => {
                let number = STEP_HEAD
                    .captures(head)
                    .and_then(|c| c.get(1))
                    .and_then(|m| m.as_str().parse::<u32>().ok())
                    .ok_or_else(|| unresolved(&format!("unknown source '{}'", head)))?;
                (Source::Step(number), &segments[1..])
            }
        };

        Ok(Self {
            raw: raw.trim().to_string(),
            source,
            path: rest.iter().map(|s| s.to_string()).collect(),
        })
    }

    /// The reference's starting point.
    pub fn source(&self) -> &Source {
        &self.source
    }

    /// The dot-separated path after the source.
    pub fn path(&self) -> &[String] {
        &self.path
    }

    /// Resolves the reference against a context.
    pub fn resolve<'a>(&self, ctx: &'a ExecutionContext) -> Result<&'a Value, ResolveError> {
        let root = match &self.source {
            Source::Input => ctx.input(),
            Source::Context => ctx.context(),
            Source::Step(number) => {
                if !ctx.steps().declares_step(*number) {
                    return Err(ResolveError::UnresolvedVariable {
                        reference: self.raw.clone(),
                        reason: format!("workflow has no step {}", number),
                    });
                }
                ctx.steps()
                    .get_by_step(*number)
                    .ok_or_else(|| ResolveError::PathNotFound {
                        reference: self.raw.clone(),
                        segment: format!("step{}", number),
                    })?
            }
            Source::StepVariable(var) => {
                if !ctx.steps().declares_variable(var) {
                    return Err(ResolveError::UnresolvedVariable {
                        reference: self.raw.clone(),
                        reason: format!("no step produces '{}'", var),
                    });
                }
                ctx.steps()
                    .get(var)
                    .ok_or_else(|| ResolveError::PathNotFound {
                        reference: self.raw.clone(),
                        segment: var.clone(),
                    })?
            }
        };

        self.path.iter().try_fold(root, |current, segment| {
            let next = match current {
                Value::Object(map) => map.get(segment),
                Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
                _ => None,
            };
            next.ok_or_else(|| ResolveError::PathNotFound {
                reference: self.raw.clone(),
                segment: segment.clone(),
            })
        })
    }
}

impl fmt::Display for VariableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// Parses and resolves a reference string in one call.
pub fn resolve(reference: &str, ctx: &ExecutionContext) -> Result<Value, ResolveError> {
    VariableRef::parse(reference)?.resolve(ctx).cloned()
}

/// Resolves a mapping value: reference strings are looked up, arrays and
/// objects are resolved element-wise, everything else is a literal.
pub fn resolve_value(value: &Value, ctx: &ExecutionContext) -> Result<Value, ResolveError> {
    match value {
        Value::String(s) if is_reference(s) => resolve(s, ctx),
        Value::Array(items) => items
            .iter()
            .map(|item| resolve_value(item, ctx))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        Value::Object(map) => map
            .iter()
            .map(|(k, v)| resolve_value(v, ctx).map(|v| (k.clone(), v)))
            .collect::<Result<serde_json::Map<_, _>, _>>()
            .map(Value::Object),
        other => Ok(other.clone()),
    }
}

/// Collects every reference written inside a mapping value.
pub fn collect_references(value: &Value, out: &mut Vec<VariableRef>) -> Result<(), ResolveError> {
    match value {
        Value::String(s) if is_reference(s) => out.push(VariableRef::parse(s)?),
        Value::Array(items) => {
            for item in items {
                collect_references(item, out)?;
            }
        }
        Value::Object(map) => {
            for v in map.values() {
                collect_references(v, out)?;
            }
        }
        _ => {}
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::context::ContextMetadata;
    use crate::workflow::model::StepDefinition;
    use serde_json::json;

    fn context() -> ExecutionContext {
        let steps = vec![
            StepDefinition::new(1, "first", "f", "first_out"),
            StepDefinition::new(2, "second", "f", "second_out"),
        ];
        let mut ctx = ExecutionContext::new(
            &steps,
            json!({"load": 100, "beam": {"span": [3, 4, 5]}}),
            ContextMetadata::new("exec-9").with_actor("bob"),
        );
        ctx.store("first_out", json!({"result": {"value": 42}})).unwrap();
        ctx
    }

    #[test]
    fn test_parse_sources() {
        assert_eq!(VariableRef::parse("$input.load").unwrap().source(), &Source::Input);
        assert_eq!(VariableRef::parse("$context.actor").unwrap().source(), &Source::Context);
        assert_eq!(VariableRef::parse("$step12.x").unwrap().source(), &Source::Step(12));
        assert_eq!(
            VariableRef::parse("$steps.first_out.result").unwrap().source(),
            &Source::StepVariable("first_out".to_string())
        );
    }

    #[test]
    fn test_parse_rejects_unknown_source() {
        let err = VariableRef::parse("$output.x").unwrap_err();
        assert!(matches!(err, ResolveError::UnresolvedVariable { .. }));
        assert!(VariableRef::parse("input.x").is_err());
        assert!(VariableRef::parse("$input..x").is_err());
        assert!(VariableRef::parse("$stepX.y").is_err());
    }

    #[test]
    fn test_resolve_input_and_context() {
        let ctx = context();
        assert_eq!(resolve("$input.load", &ctx).unwrap(), json!(100));
        assert_eq!(resolve("$input.beam.span.1", &ctx).unwrap(), json!(4));
        assert_eq!(resolve("$context.actor", &ctx).unwrap(), json!("bob"));
        assert_eq!(resolve("$context.execution_id", &ctx).unwrap(), json!("exec-9"));
    }

    #[test]
    fn test_resolve_step_output() {
        let ctx = context();
        assert_eq!(resolve("$step1.result.value", &ctx).unwrap(), json!(42));
        assert_eq!(resolve("$steps.first_out.result.value", &ctx).unwrap(), json!(42));
    }

    #[test]
    fn test_missing_key_is_path_not_found() {
        let ctx = context();
        let err = resolve("$input.missing", &ctx).unwrap_err();
        assert_eq!(
            err,
            ResolveError::PathNotFound {
                reference: "$input.missing".to_string(),
                segment: "missing".to_string()
            }
        );
    }

    #[test]
    fn test_unwritten_step_is_path_not_found() {
        let ctx = context();
        assert!(matches!(
            resolve("$step2.anything", &ctx),
            Err(ResolveError::PathNotFound { .. })
        ));
    }

    #[test]
    fn test_undeclared_step_is_unresolved() {
        let ctx = context();
        assert!(matches!(
            resolve("$step7.anything", &ctx),
            Err(ResolveError::UnresolvedVariable { .. })
        ));
        assert!(matches!(
            resolve("$steps.ghost", &ctx),
            Err(ResolveError::UnresolvedVariable { .. })
        ));
    }

    #[test]
    fn test_resolve_value_nested() {
        let ctx = context();
        let mapping = json!({"pair": ["$input.load", 7], "label": "plain"});
        let resolved = resolve_value(&mapping, &ctx).unwrap();
        assert_eq!(resolved, json!({"pair": [100, 7], "label": "plain"}));
    }

    #[test]
    fn test_collect_references() {
        let mut refs = Vec::new();
        collect_references(&json!(["$step1.a", {"b": "$input.c"}, 3]), &mut refs).unwrap();
        assert_eq!(refs.len(), 2);
        assert_eq!(refs[0].to_string(), "$step1.a");
    }

    #[test]
    fn test_resolution_does_not_mutate() {
        let ctx = context();
        let before = ctx.snapshot();
        let _ = resolve("$step1.result", &ctx);
        let _ = resolve("$input.nothing", &ctx);
        assert_eq!(ctx.snapshot(), before);
    }
}
