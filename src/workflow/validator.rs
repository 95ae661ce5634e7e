//! Workflow Validation
//!
//! Load-time checks for workflow definitions:
//! - Step numbering, required fields and policy bounds
//! - Output variable uniqueness
//! - Reference integrity (mappings, conditions, output mapping, risk profile)
//! - Risk rule configuration
//! - Dependency cycles
//!
//! Every problem found is collected; nothing short-circuits on the first.

use std::collections::{HashMap, HashSet};

use log::{debug, info, warn};
use thiserror::Error;

use super::graph::DependencyGraph;
use super::model::{OnError, TimeoutStrategy, WorkflowDefinition, MAX_RETRY_COUNT, MAX_TIMEOUT_SECS};
use crate::expression::reference::{collect_references, ResolveError, Source, VariableRef};
use crate::expression::{Condition, ConditionError};
use crate::risk::assessment::Dimension;
use crate::risk::rules::RuleKind;

/// Reasons a workflow definition is rejected.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DefinitionError {
    #[error("workflow has no steps")]
    EmptyWorkflow,

    #[error("workflow id is empty")]
    EmptyId,

    #[error("step at position {position} has step_number {found}, expected {expected}")]
    StepNumberGap {
        position: usize,
        expected: u32,
        found: u32,
    },

    #[error("step {step} has an empty {field}")]
    EmptyField { step: u32, field: &'static str },

    #[error("output variable '{variable}' is declared by steps {first} and {second}")]
    DuplicateOutputVariable {
        variable: String,
        first: u32,
        second: u32,
    },

    #[error("step {step}: retry_count {count} exceeds maximum {max}")]
    RetryCountOutOfRange { step: u32, count: u32, max: u32 },

    #[error("step {step}: timeout {timeout}s must be between 1 and {max}s")]
    TimeoutOutOfRange { step: u32, timeout: u64, max: u64 },

    #[error("{owner}: invalid condition '{expression}': {error}")]
    InvalidCondition {
        owner: String,
        expression: String,
        error: ConditionError,
    },

    #[error("step {step}: {error}")]
    InvalidReference { step: u32, error: ResolveError },

    #[error("step {step} references '{reference}', which no step produces")]
    UnknownStepReference { step: u32, reference: String },

    #[error("dependency cycle detected: {}", format_cycle(.cycle))]
    CycleDetected { cycle: Vec<u32> },

    #[error("step {step}: function '{function}' is not registered")]
    UnknownFunction { step: u32, function: String },

    #[error("duplicate risk rule id '{0}'")]
    DuplicateRuleId(String),

    #[error("risk rule '{rule}': {reason}")]
    InvalidRule { rule: String, reason: String },

    #[error("{which} schema: {problem}")]
    InvalidSchema { which: &'static str, problem: String },

    #[error("output '{name}': {reason}")]
    InvalidOutputMapping { name: String, reason: String },

    #[error("risk dimension {dimension}: {reason}")]
    InvalidDimension { dimension: Dimension, reason: String },
}

fn format_cycle(cycle: &[u32]) -> String {
    cycle
        .iter()
        .map(|s| format!("step {}", s))
        .collect::<Vec<_>>()
        .join(" -> ")
}

/// Checks that a reference points at something the workflow can produce.
fn check_target(reference: &VariableRef, definition: &WorkflowDefinition) -> Result<(), String> {
    match reference.source() {
        Source::Input | Source::Context => Ok(()),
        Source::Step(n) if definition.get_step(*n).is_some() => Ok(()),
        Source::StepVariable(var) if definition.step_for_variable(var).is_some() => Ok(()),
        _ => Err(format!("'{}' does not point at any step", reference)),
    }
}

fn validate_steps(definition: &WorkflowDefinition, errors: &mut Vec<DefinitionError>) {
    let mut outputs: HashMap<&str, u32> = HashMap::new();

    for (position, step) in definition.steps.iter().enumerate() {
        let expected = position as u32 + 1;
        if step.step_number != expected {
            errors.push(DefinitionError::StepNumberGap {
                position: position + 1,
                expected,
                found: step.step_number,
            });
        }

        for (field, value) in [
            ("name", &step.name),
            ("function", &step.function),
            ("output_variable", &step.output_variable),
        ] {
            if value.trim().is_empty() {
                errors.push(DefinitionError::EmptyField {
                    step: step.step_number,
                    field,
                });
            }
        }

        if !step.output_variable.is_empty() {
            if let Some(&first) = outputs.get(step.output_variable.as_str()) {
                errors.push(DefinitionError::DuplicateOutputVariable {
                    variable: step.output_variable.clone(),
                    first,
                    second: step.step_number,
                });
            } else {
                outputs.insert(&step.output_variable, step.step_number);
            }
        }

        if step.error_handling.retry_count > MAX_RETRY_COUNT {
            errors.push(DefinitionError::RetryCountOutOfRange {
                step: step.step_number,
                count: step.error_handling.retry_count,
                max: MAX_RETRY_COUNT,
            });
        }

        if step.timeout == 0 || step.timeout > MAX_TIMEOUT_SECS {
            errors.push(DefinitionError::TimeoutOutOfRange {
                step: step.step_number,
                timeout: step.timeout,
                max: MAX_TIMEOUT_SECS,
            });
        }

        let needs_fallback = step.error_handling.on_error == OnError::Continue
            || step.on_timeout == TimeoutStrategy::Fallback;
        if needs_fallback && step.error_handling.fallback.is_none() {
            warn!(
                "Step {} ('{}') uses a fallback policy but declares no fallback value; null will be stored",
                step.step_number, step.name
            );
        }

        if step.input_mapping.is_empty() {
            debug!("Step {} ('{}') takes no inputs", step.step_number, step.name);
        }
    }
}

fn validate_rules(definition: &WorkflowDefinition, errors: &mut Vec<DefinitionError>) {
    let mut seen: HashSet<&str> = HashSet::new();

    for rule in &definition.risk_rules {
        let invalid = |reason: String| DefinitionError::InvalidRule {
            rule: rule.id.clone(),
            reason,
        };

        if rule.id.trim().is_empty() {
            errors.push(invalid("rule id is empty".to_string()));
        } else if !seen.insert(&rule.id) {
            errors.push(DefinitionError::DuplicateRuleId(rule.id.clone()));
        }

        if !(0.0..=1.0).contains(&rule.risk_factor) {
            errors.push(invalid(format!(
                "risk_factor {} must be within [0, 1]",
                rule.risk_factor
            )));
        }

        if let Some(threshold) = rule.auto_approve_threshold {
            if !(0.0..=1.0).contains(&threshold) {
                errors.push(invalid(format!(
                    "auto_approve_threshold {} must be within [0, 1]",
                    threshold
                )));
            }
        }

        match (rule.kind, rule.step) {
            (RuleKind::Step, None) => {
                errors.push(invalid("step rules must name the step they follow".to_string()))
            }
            (RuleKind::Step, Some(n)) if definition.get_step(n).is_none() => {
                errors.push(invalid(format!("step {} does not exist", n)))
            }
            (kind, Some(n)) if kind != RuleKind::Step => {
                warn!("Rule '{}' is a {} rule; its step {} is ignored", rule.id, kind, n)
            }
            _ => {}
        }

        let condition = match Condition::parse(&rule.condition) {
            Ok(condition) => condition,
            Err(error) => {
                errors.push(DefinitionError::InvalidCondition {
                    owner: format!("risk rule '{}'", rule.id),
                    expression: rule.condition.clone(),
                    error,
                });
                continue;
            }
        };

        for reference in condition.expr().references() {
            if let Err(reason) = check_target(reference, definition) {
                errors.push(invalid(reason));
                continue;
            }
            let reads_steps = matches!(
                reference.source(),
                Source::Step(_) | Source::StepVariable(_)
            );
            if rule.kind == RuleKind::Global && reads_steps {
                errors.push(invalid(format!(
                    "global rules are evaluated before any step runs and cannot read '{}'",
                    reference
                )));
            }
        }
    }
}

fn validate_outputs(definition: &WorkflowDefinition, errors: &mut Vec<DefinitionError>) {
    for (which, schema) in [
        ("input", &definition.input_schema),
        ("output", &definition.output_schema),
    ] {
        if let Some(schema) = schema {
            for problem in schema.lint() {
                errors.push(DefinitionError::InvalidSchema { which, problem });
            }
        }
    }

    if let Some(mapping) = &definition.output {
        for (name, value) in mapping {
            let mut refs = Vec::new();
            if let Err(e) = collect_references(value, &mut refs) {
                errors.push(DefinitionError::InvalidOutputMapping {
                    name: name.clone(),
                    reason: e.to_string(),
                });
                continue;
            }
            for reference in &refs {
                if let Err(reason) = check_target(reference, definition) {
                    errors.push(DefinitionError::InvalidOutputMapping {
                        name: name.clone(),
                        reason,
                    });
                }
            }
        }
    }

    let profile_refs = definition
        .risk
        .dimensions
        .iter()
        .map(|(d, r)| (*d, r))
        .chain(definition.risk.anomaly_metric.iter().map(|r| (Dimension::Anomaly, r)));

    for (dimension, raw) in profile_refs {
        let result = VariableRef::parse(raw)
            .map_err(|e| e.to_string())
            .and_then(|r| check_target(&r, definition));
        if let Err(reason) = result {
            errors.push(DefinitionError::InvalidDimension { dimension, reason });
        }
    }
}

/// Validates a workflow definition and builds its dependency graph.
///
/// Performs the following checks:
/// 1. Workflow has an id and at least one step
/// 2. Step numbers run 1..=n without gaps
/// 3. Steps have a name, function and output variable, with bounded policies
/// 4. Output variables are unique
/// 5. Risk rules are well formed and reference existing steps
/// 6. Schemas, output mapping and risk profile references are valid
/// 7. The reference graph is acyclic
pub fn validate_definition(
    definition: &WorkflowDefinition,
) -> Result<DependencyGraph, Vec<DefinitionError>> {
    info!(
        "Validating workflow '{}' v{} with {} steps",
        definition.id,
        definition.version,
        definition.steps.len()
    );

    let mut errors = Vec::new();

    if definition.id.trim().is_empty() {
        errors.push(DefinitionError::EmptyId);
    }
    if definition.steps.is_empty() {
        errors.push(DefinitionError::EmptyWorkflow);
        return Err(errors);
    }

    validate_steps(definition, &mut errors);
    validate_rules(definition, &mut errors);
    validate_outputs(definition, &mut errors);

    match DependencyGraph::build(definition) {
        Ok(graph) if errors.is_empty() => {
            info!(
                "Workflow '{}' validated: {} steps in {} levels",
                definition.id,
                graph.len(),
                graph.depth()
            );
            Ok(graph)
        }
        Ok(_) => Err(errors),
        Err(e) => {
            errors.push(e);
            Err(errors)
        }
    }
}

/// Steps whose function `is_registered` does not know, in step order.
pub fn validate_functions(
    definition: &WorkflowDefinition,
    is_registered: impl Fn(&str) -> bool,
) -> Vec<DefinitionError> {
    definition
        .steps
        .iter()
        .filter(|step| !is_registered(&step.function))
        .map(|step| DefinitionError::UnknownFunction {
            step: step.step_number,
            function: step.function.clone(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::risk::rules::RiskRule;
    use crate::validation::{Schema, SchemaType};
    use crate::workflow::model::StepDefinition;

    fn valid() -> WorkflowDefinition {
        WorkflowDefinition::from_steps(
            "beam",
            vec![
                StepDefinition::new(1, "loads", "calc.loads", "loads").with_input("load", "$input.load"),
                StepDefinition::new(2, "check", "calc.check", "check").with_input("max", "$step1.max"),
            ],
        )
    }

    #[test]
    fn test_unregistered_functions() {
        let errors = validate_functions(&valid(), |f| f == "calc.loads");
        assert_eq!(
            errors,
            vec![DefinitionError::UnknownFunction {
                step: 2,
                function: "calc.check".to_string(),
            }]
        );
        assert_eq!(errors[0].to_string(), "step 2: function 'calc.check' is not registered");
        assert!(validate_functions(&valid(), |_| true).is_empty());
    }

    #[test]
    fn test_valid_workflow() {
        let graph = validate_definition(&valid()).unwrap();
        assert_eq!(graph.depth(), 2);
    }

    #[test]
    fn test_empty_workflow() {
        let errors = validate_definition(&WorkflowDefinition::new("empty")).unwrap_err();
        assert_eq!(errors, vec![DefinitionError::EmptyWorkflow]);
    }

    #[test]
    fn test_duplicate_output_variable() {
        let mut workflow = valid();
        workflow.steps[1].output_variable = "loads".to_string();
        workflow.steps[1].input_mapping.clear();

        let errors = validate_definition(&workflow).unwrap_err();
        assert!(errors.contains(&DefinitionError::DuplicateOutputVariable {
            variable: "loads".to_string(),
            first: 1,
            second: 2,
        }));
    }

    #[test]
    fn test_step_number_gap() {
        let mut workflow = valid();
        workflow.steps[1].step_number = 3;
        workflow.steps[1].input_mapping.clear();

        let errors = validate_definition(&workflow).unwrap_err();
        assert!(errors.contains(&DefinitionError::StepNumberGap {
            position: 2,
            expected: 2,
            found: 3,
        }));
    }

    #[test]
    fn test_policy_bounds() {
        let mut workflow = valid();
        workflow.steps[0].error_handling.retry_count = 6;
        workflow.steps[1].timeout = 7200;

        let errors = validate_definition(&workflow).unwrap_err();
        assert_eq!(errors.len(), 2);
        assert!(errors[0].to_string().contains("retry_count 6 exceeds maximum 5"));
        assert!(errors[1].to_string().contains("timeout 7200s"));
    }

    #[test]
    fn test_empty_fields_collected() {
        let workflow = WorkflowDefinition::from_steps("blank", vec![StepDefinition::new(1, "", "", "")]);
        let errors = validate_definition(&workflow).unwrap_err();
        assert_eq!(
            errors
                .iter()
                .filter(|e| matches!(e, DefinitionError::EmptyField { .. }))
                .count(),
            3
        );
    }

    #[test]
    fn test_cyclic_dependency() {
        let workflow = WorkflowDefinition::from_steps(
            "cycle",
            vec![
                StepDefinition::new(1, "a", "f", "a").with_input("v", "$step2.v"),
                StepDefinition::new(2, "b", "f", "b").with_input("v", "$step1.v"),
            ],
        );
        let errors = validate_definition(&workflow).unwrap_err();
        assert!(matches!(errors.last(), Some(DefinitionError::CycleDetected { .. })));
        assert!(errors
            .last()
            .map(|e| e.to_string().contains("step 1 -> step 2 -> step 1"))
            .unwrap_or(false));
    }

    #[test]
    fn test_invalid_step_condition() {
        let mut workflow = valid();
        workflow.steps[1].condition = Some("$step1.max >".to_string());
        let errors = validate_definition(&workflow).unwrap_err();
        assert!(matches!(errors[0], DefinitionError::InvalidCondition { .. }));
    }

    #[test]
    fn test_global_rule_cannot_read_steps() {
        let workflow = valid().with_rule(RiskRule::global("early", "$step1.max > 10", 0.2));
        let errors = validate_definition(&workflow).unwrap_err();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].to_string().contains("global rules"));
    }

    #[test]
    fn test_step_rule_needs_existing_step() {
        let workflow = valid()
            .with_rule(RiskRule::after_step("late", 9, "$input.load > 1", 0.1))
            .with_rule(RiskRule::after_step("late", 1, "$input.load > 1", 0.1));
        let errors = validate_definition(&workflow).unwrap_err();
        assert!(errors.contains(&DefinitionError::InvalidRule {
            rule: "late".to_string(),
            reason: "step 9 does not exist".to_string(),
        }));
        assert!(errors.contains(&DefinitionError::DuplicateRuleId("late".to_string())));
    }

    #[test]
    fn test_rule_factor_bounds() {
        let workflow = valid().with_rule(RiskRule::global("big", "$input.load > 1", 1.5));
        let errors = validate_definition(&workflow).unwrap_err();
        assert!(errors[0].to_string().contains("risk_factor 1.5"));
    }

    #[test]
    fn test_bad_schema_pattern() {
        let schema = Schema::of_type(SchemaType::Object).with_property(
            "code",
            Schema {
                pattern: Some("[".to_string()),
                ..Schema::default()
            },
        );
        let workflow = valid().with_input_schema(schema);
        let errors = validate_definition(&workflow).unwrap_err();
        assert!(matches!(errors[0], DefinitionError::InvalidSchema { which: "input", .. }));
    }

    #[test]
    fn test_output_mapping_and_dimensions() {
        let mut workflow = valid().with_dimension(Dimension::Safety, "$steps.nothing.ratio");
        workflow.output = Some(
            [("verdict".to_string(), serde_json::json!("$step5.ok"))]
                .into_iter()
                .collect(),
        );
        let errors = validate_definition(&workflow).unwrap_err();
        assert_eq!(errors.len(), 2);
        assert!(matches!(errors[0], DefinitionError::InvalidOutputMapping { .. }));
        assert!(matches!(
            errors[1],
            DefinitionError::InvalidDimension {
                dimension: Dimension::Safety,
                ..
            }
        ));
    }
}
