//! Execution Context
//!
//! Holds the state a running workflow reads from: the validated input, the
//! outputs of steps that have resolved so far, and execution metadata.
//!
//! Step outputs live in a [`StepArena`]: one pre-allocated, write-once slot
//! per `output_variable`. Because output variable names are unique within a
//! definition, every slot has exactly one possible writer, and the scheduler
//! fills slots only after a level's barrier. Concurrent step tasks share the
//! context read-only.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::workflow::model::StepDefinition;

/// Errors raised when writing into the step arena.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ArenaError {
    #[error("no step declares output variable '{0}'")]
    UnknownVariable(String),

    #[error("output variable '{0}' has already been written")]
    AlreadyWritten(String),
}

/// Metadata describing one execution (exposed to references as `$context`).
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct ContextMetadata {
    /// Execution identifier
    pub execution_id: String,

    /// Who started the execution
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actor: Option<String>,

    /// Any additional caller-supplied values
    #[serde(default, flatten)]
    pub extra: Map<String, Value>,
}

impl ContextMetadata {
    /// Creates metadata for an execution id.
    pub fn new(execution_id: impl Into<String>) -> Self {
        Self {
            execution_id: execution_id.into(),
            actor: None,
            extra: Map::new(),
        }
    }

    /// Sets the actor who started the execution.
    pub fn with_actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = Some(actor.into());
        self
    }

    /// Adds an extra metadata value.
    pub fn with_value(mut self, key: impl Into<String>, value: Value) -> Self {
        self.extra.insert(key.into(), value);
        self
    }

    fn to_value(&self) -> Value {
        let mut map = self.extra.clone();
        map.insert(
            "execution_id".to_string(),
            Value::String(self.execution_id.clone()),
        );
        if let Some(actor) = &self.actor {
            map.insert("actor".to_string(), Value::String(actor.clone()));
        }
        Value::Object(map)
    }
}

#[derive(Debug, Clone)]
struct Slot {
    output_variable: String,
    value: Option<Value>,
}

/// Write-once storage for step outputs, keyed by output variable.
#[derive(Debug, Clone, Default)]
pub struct StepArena {
    slots: Vec<Slot>,
    by_variable: HashMap<String, usize>,
    by_step: HashMap<u32, usize>,
}

impl StepArena {
    /// Allocates one empty slot per step definition.
    pub fn from_steps(steps: &[StepDefinition]) -> Self {
        let mut arena = Self::default();
        for step in steps {
            let index = arena.slots.len();
            arena.slots.push(Slot {
                output_variable: step.output_variable.clone(),
                value: None,
            });
            arena.by_variable.insert(step.output_variable.clone(), index);
            arena.by_step.insert(step.step_number, index);
        }
        arena
    }

    /// Stores a step's output. Each slot accepts exactly one write.
    pub fn insert(&mut self, output_variable: &str, value: Value) -> Result<(), ArenaError> {
        let index = *self
            .by_variable
            .get(output_variable)
            .ok_or_else(|| ArenaError::UnknownVariable(output_variable.to_string()))?;

        let slot = &mut self.slots[index];
        if slot.value.is_some() {
            return Err(ArenaError::AlreadyWritten(output_variable.to_string()));
        }
        slot.value = Some(value);
        Ok(())
    }

    /// Returns true if some step declares this output variable.
    pub fn declares_variable(&self, output_variable: &str) -> bool {
        self.by_variable.contains_key(output_variable)
    }

    /// Returns true if the workflow has a step with this number.
    pub fn declares_step(&self, step_number: u32) -> bool {
        self.by_step.contains_key(&step_number)
    }

    /// Gets the stored output for a variable, if written.
    pub fn get(&self, output_variable: &str) -> Option<&Value> {
        self.by_variable
            .get(output_variable)
            .and_then(|&i| self.slots[i].value.as_ref())
    }

    /// Gets the stored output of a step by number, if written.
    pub fn get_by_step(&self, step_number: u32) -> Option<&Value> {
        self.by_step
            .get(&step_number)
            .and_then(|&i| self.slots[i].value.as_ref())
    }

    /// Returns the output variable declared by a step.
    pub fn output_variable(&self, step_number: u32) -> Option<&str> {
        self.by_step
            .get(&step_number)
            .map(|&i| self.slots[i].output_variable.as_str())
    }

    /// Number of slots that have been written.
    pub fn written(&self) -> usize {
        self.slots.iter().filter(|s| s.value.is_some()).count()
    }

    /// All written outputs keyed by output variable. Keys iterate in
    /// lexical order, not step order.
    pub fn to_map(&self) -> Map<String, Value> {
        self.slots
            .iter()
            .filter_map(|s| {
                s.value
                    .as_ref()
                    .map(|v| (s.output_variable.clone(), v.clone()))
            })
            .collect()
    }
}

/// The state visible to variable references during one execution.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    input: Value,
    steps: StepArena,
    metadata: ContextMetadata,
    context: Value,
}

impl ExecutionContext {
    /// Creates a context for a workflow's steps with the given input.
    pub fn new(steps: &[StepDefinition], input: Value, metadata: ContextMetadata) -> Self {
        let context = metadata.to_value();
        Self {
            input,
            steps: StepArena::from_steps(steps),
            metadata,
            context,
        }
    }

    /// The workflow input (`$input`).
    pub fn input(&self) -> &Value {
        &self.input
    }

    /// Step outputs (`$stepN`, `$steps.<var>`).
    pub fn steps(&self) -> &StepArena {
        &self.steps
    }

    /// Execution metadata as a JSON object (`$context`).
    pub fn context(&self) -> &Value {
        &self.context
    }

    /// Execution metadata.
    pub fn metadata(&self) -> &ContextMetadata {
        &self.metadata
    }

    /// Appends a resolved step's output.
    pub fn store(&mut self, output_variable: &str, value: Value) -> Result<(), ArenaError> {
        self.steps.insert(output_variable, value)
    }

    /// A JSON snapshot of input and stored outputs, used for rule audits.
    pub fn snapshot(&self) -> Value {
        serde_json::json!({
            "input": self.input,
            "steps": Value::Object(self.steps.to_map()),
        })
    }
}
