//! Stream Events
//!
//! Lifecycle events published for one execution. Wire shape:
//! `{event_kind, execution_id, timestamp, step_number?, data}`.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::execution::step::StepReport;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    ExecutionStarted,
    StepStarted,
    StepCompleted,
    StepFailed,
    ProgressUpdate,
    ExecutionCompleted,
    ExecutionFailed,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::ExecutionStarted => "execution_started",
            EventKind::StepStarted => "step_started",
            EventKind::StepCompleted => "step_completed",
            EventKind::StepFailed => "step_failed",
            EventKind::ProgressUpdate => "progress_update",
            EventKind::ExecutionCompleted => "execution_completed",
            EventKind::ExecutionFailed => "execution_failed",
        }
    }

    /// True for the last event an execution emits.
    pub fn is_terminal(&self) -> bool {
        matches!(self, EventKind::ExecutionCompleted | EventKind::ExecutionFailed)
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct StreamEvent {
    pub event_kind: EventKind,
    pub execution_id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_number: Option<u32>,
    #[serde(default)]
    pub data: Value,
}

impl StreamEvent {
    pub fn new(kind: EventKind, execution_id: impl Into<String>, data: Value) -> Self {
        Self {
            event_kind: kind,
            execution_id: execution_id.into(),
            timestamp: Utc::now(),
            step_number: None,
            data,
        }
    }

    pub fn for_step(mut self, step_number: u32) -> Self {
        self.step_number = Some(step_number);
        self
    }

    pub fn execution_started(execution_id: &str, workflow_id: &str, total_steps: usize) -> Self {
        Self::new(
            EventKind::ExecutionStarted,
            execution_id,
            json!({ "workflow_id": workflow_id, "total_steps": total_steps }),
        )
    }

    pub fn step_started(execution_id: &str, step_number: u32, name: &str, level: usize) -> Self {
        Self::new(
            EventKind::StepStarted,
            execution_id,
            json!({ "name": name, "level": level }),
        )
        .for_step(step_number)
    }

    /// `step_failed` for failed steps, `step_completed` for every other outcome.
    pub fn step_resolved(execution_id: &str, report: &StepReport) -> Self {
        let kind = if report.aborts_execution() {
            EventKind::StepFailed
        } else {
            EventKind::StepCompleted
        };
        Self::new(
            kind,
            execution_id,
            json!({
                "name": report.name,
                "status": report.status,
                "skip_reason": report.skip_reason,
                "error": report.error,
                "attempts": report.attempts.len(),
                "duration_ms": report.duration_ms,
            }),
        )
        .for_step(report.step_number)
    }

    pub fn progress(execution_id: &str, percent: u8, resolved: usize, total: usize) -> Self {
        Self::new(
            EventKind::ProgressUpdate,
            execution_id,
            json!({ "percent": percent, "resolved": resolved, "total": total }),
        )
    }

    pub fn execution_completed(execution_id: &str, status: &str, action: Option<&str>) -> Self {
        Self::new(
            EventKind::ExecutionCompleted,
            execution_id,
            json!({ "status": status, "routing_action": action }),
        )
    }

    pub fn execution_failed(execution_id: &str, root_cause: &str) -> Self {
        Self::new(
            EventKind::ExecutionFailed,
            execution_id,
            json!({ "status": "failed", "root_cause": root_cause }),
        )
    }

    /// Percent carried by a progress update.
    pub fn percent(&self) -> Option<u8> {
        if self.event_kind != EventKind::ProgressUpdate {
            return None;
        }
        self.data
            .get("percent")
            .and_then(Value::as_u64)
            .map(|p| p.min(100) as u8)
    }
}
