//! Workflow Data Model
//!
//! Core data structures describing a workflow definition and its steps.
//!
//! # Example YAML Format
//!
//! ```yaml
//! id: beam_design
//! version: "3"
//! input_schema:
//!   type: object
//!   required: [load]
//!   properties:
//!     load: { type: number, minimum: 0 }
//!
//! steps:
//!   - step_number: 1
//!     name: compute_loads
//!     function: calc.loads
//!     input_mapping:
//!       load: $input.load
//!     output_variable: loads
//!
//!   - step_number: 2
//!     name: check_deflection
//!     function: calc.deflection
//!     input_mapping:
//!       max_load: $step1.max
//!     output_variable: deflection
//!     condition: $input.load > 0
//!     error_handling:
//!       retry_count: 2
//!       on_error: continue
//!       fallback: { ok: false }
//!     timeout: 30
//!
//! risk_rules:
//!   - id: heavy_load
//!     kind: global
//!     condition: $input.load > 5000
//!     risk_factor: 0.2
//! ```

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::risk::assessment::Dimension;
use crate::risk::rules::RiskRule;
use crate::validation::Schema;

/// Default per-step timeout in seconds.
pub const DEFAULT_TIMEOUT_SECS: u64 = 300;

/// Largest accepted per-step timeout in seconds.
pub const MAX_TIMEOUT_SECS: u64 = 3600;

/// Largest accepted retry count.
pub const MAX_RETRY_COUNT: u32 = 5;

/// What happens when a step fails after its retries are exhausted.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum OnError {
    /// Abort the execution at the next level barrier
    #[default]
    Fail,
    /// Drop the step's output and keep going
    Skip,
    /// Store the declared fallback value and keep going
    Continue,
}

/// What happens when a step attempt runs past its deadline.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutStrategy {
    /// Treat expiry as a (retryable) failure
    #[default]
    Fail,
    /// Store the fallback value and mark the step completed-with-fallback
    Fallback,
    /// Mark the step skipped
    Skip,
}

/// Per-step failure policy.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct ErrorHandling {
    /// Extra attempts for transient failures (0-5)
    #[serde(default)]
    pub retry_count: u32,

    #[serde(default)]
    pub on_error: OnError,

    /// Value used by `on_error: continue` and `on_timeout: fallback`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback: Option<Value>,
}

/// A single step in a workflow.
///
/// A step is known to the engine only by its function identifier, the
/// parameters it is handed (resolved from `input_mapping`) and the name its
/// output is stored under.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct StepDefinition {
    /// Position in the workflow, sequential from 1
    pub step_number: u32,

    pub name: String,

    /// Registry identifier of the function to invoke
    pub function: String,

    /// Parameter name -> reference string or literal value
    #[serde(default)]
    pub input_mapping: BTreeMap<String, Value>,

    /// Name the step's output is stored under (unique per workflow)
    pub output_variable: String,

    /// Skip-condition; the step runs only when it evaluates true
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,

    #[serde(default)]
    pub error_handling: ErrorHandling,

    /// Per-attempt deadline in seconds
    #[serde(default = "default_timeout")]
    pub timeout: u64,

    #[serde(default)]
    pub on_timeout: TimeoutStrategy,
}

fn default_timeout() -> u64 {
    DEFAULT_TIMEOUT_SECS
}

fn default_version() -> String {
    "1".to_string()
}

impl StepDefinition {
    /// Creates a step with no inputs, no condition and default policies.
    ///
    /// # Example
    ///
    /// ```
    /// use riskflow::workflow::StepDefinition;
    ///
    /// let step = StepDefinition::new(2, "check", "calc.check", "check")
    ///     .with_input("load", "$step1.max")
    ///     .with_retries(2)
    ///     .with_timeout(30);
    /// assert_eq!(step.error_handling.retry_count, 2);
    /// ```
    pub fn new(
        step_number: u32,
        name: impl Into<String>,
        function: impl Into<String>,
        output_variable: impl Into<String>,
    ) -> Self {
        Self {
            step_number,
            name: name.into().trim().to_string(),
            function: function.into().trim().to_string(),
            input_mapping: BTreeMap::new(),
            output_variable: output_variable.into().trim().to_string(),
            condition: None,
            error_handling: ErrorHandling::default(),
            timeout: DEFAULT_TIMEOUT_SECS,
            on_timeout: TimeoutStrategy::Fail,
        }
    }

    /// Maps a parameter to a reference string (or a literal string).
    pub fn with_input(mut self, param: impl Into<String>, reference: impl Into<String>) -> Self {
        self.input_mapping
            .insert(param.into(), Value::String(reference.into()));
        self
    }

    /// Maps a parameter to a literal JSON value.
    pub fn with_literal(mut self, param: impl Into<String>, value: Value) -> Self {
        self.input_mapping.insert(param.into(), value);
        self
    }

    /// Sets the skip-condition.
    pub fn with_condition(mut self, condition: impl Into<String>) -> Self {
        self.condition = Some(condition.into());
        self
    }

    /// Sets the retry count for transient failures.
    pub fn with_retries(mut self, retry_count: u32) -> Self {
        self.error_handling.retry_count = retry_count;
        self
    }

    /// Sets the on-error policy.
    pub fn on_error(mut self, on_error: OnError) -> Self {
        self.error_handling.on_error = on_error;
        self
    }

    /// Sets the fallback value.
    pub fn with_fallback(mut self, fallback: Value) -> Self {
        self.error_handling.fallback = Some(fallback);
        self
    }

    /// Sets the per-attempt timeout in seconds.
    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout = secs;
        self
    }

    /// Sets the timeout strategy.
    pub fn on_timeout(mut self, strategy: TimeoutStrategy) -> Self {
        self.on_timeout = strategy;
        self
    }

    /// The value stored when a fallback applies (`null` if none is declared).
    pub fn fallback_value(&self) -> Value {
        self.error_handling.fallback.clone().unwrap_or(Value::Null)
    }
}

/// How the fixed risk dimensions are scored for a workflow.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct RiskProfile {
    /// Dimension -> reference resolved against the final context
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub dimensions: BTreeMap<Dimension, String>,

    /// Reference to the metric tracked by anomaly detection
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub anomaly_metric: Option<String>,
}

/// A complete, versioned workflow definition.
///
/// Immutable once loaded; executions share it behind an `Arc`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct WorkflowDefinition {
    pub id: String,

    #[serde(default = "default_version")]
    pub version: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_schema: Option<Schema>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_schema: Option<Schema>,

    /// Output name -> reference; when absent the output is every stored step output
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<BTreeMap<String, Value>>,

    /// Ordered steps
    pub steps: Vec<StepDefinition>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub risk_rules: Vec<RiskRule>,

    #[serde(default)]
    pub risk: RiskProfile,
}

impl WorkflowDefinition {
    /// Creates an empty definition.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            version: default_version(),
            name: None,
            description: None,
            input_schema: None,
            output_schema: None,
            output: None,
            steps: Vec::new(),
            risk_rules: Vec::new(),
            risk: RiskProfile::default(),
        }
    }

    /// Creates a definition from a list of steps.
    pub fn from_steps(id: impl Into<String>, steps: Vec<StepDefinition>) -> Self {
        let mut definition = Self::new(id);
        definition.steps = steps;
        definition
    }

    /// Sets the version.
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    /// Appends a step.
    pub fn with_step(mut self, step: StepDefinition) -> Self {
        self.steps.push(step);
        self
    }

    /// Sets the input schema.
    pub fn with_input_schema(mut self, schema: Schema) -> Self {
        self.input_schema = Some(schema);
        self
    }

    /// Sets the output schema.
    pub fn with_output_schema(mut self, schema: Schema) -> Self {
        self.output_schema = Some(schema);
        self
    }

    /// Appends a risk rule.
    pub fn with_rule(mut self, rule: RiskRule) -> Self {
        self.risk_rules.push(rule);
        self
    }

    /// Maps a risk dimension to a reference.
    pub fn with_dimension(mut self, dimension: Dimension, reference: impl Into<String>) -> Self {
        self.risk.dimensions.insert(dimension, reference.into());
        self
    }

    /// Gets a step by number.
    pub fn get_step(&self, step_number: u32) -> Option<&StepDefinition> {
        self.steps.iter().find(|s| s.step_number == step_number)
    }

    /// Gets a step by output variable.
    pub fn step_for_variable(&self, output_variable: &str) -> Option<&StepDefinition> {
        self.steps
            .iter()
            .find(|s| s.output_variable == output_variable)
    }

    /// Distinct function identifiers used by the steps, sorted.
    pub fn functions(&self) -> Vec<&str> {
        let mut functions: Vec<&str> = self.steps.iter().map(|s| s.function.as_str()).collect();
        functions.sort_unstable();
        functions.dedup();
        functions
    }

    /// Display label: the name if present, else the id.
    pub fn label(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }

    /// Returns the number of steps.
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Returns true if the workflow has no steps.
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}
