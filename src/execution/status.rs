//! Execution Status
//!
//! The per-execution state machine:
//!
//! ```text
//! pending -> running -> completed
//!    |          |-----> failed
//!    |          '-----> awaiting_approval -> completed | failed
//!    '-> failed (rejected before start)
//! ```

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::risk::routing::ApprovalOutcome;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Completed,
    Failed,
    AwaitingApproval,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Pending => "pending",
            ExecutionStatus::Running => "running",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::AwaitingApproval => "awaiting_approval",
        }
    }

    /// Final for the engine. `awaiting_approval` is final for a run but
    /// can still be resolved by an approver.
    pub fn is_settled(&self) -> bool {
        !matches!(self, ExecutionStatus::Pending | ExecutionStatus::Running)
    }

    pub fn can_transition_to(&self, next: ExecutionStatus) -> bool {
        use ExecutionStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Failed)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, AwaitingApproval)
                | (AwaitingApproval, Completed)
                | (AwaitingApproval, Failed)
        )
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
#[error("invalid status transition {from} -> {to}")]
pub struct TransitionError {
    pub from: ExecutionStatus,
    pub to: ExecutionStatus,
}

/// One recorded transition.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct StatusChange {
    pub status: ExecutionStatus,
    pub at: DateTime<Utc>,
}

/// Guards the transitions of one execution.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct StatusTracker {
    current: ExecutionStatus,
    history: Vec<StatusChange>,
}

impl Default for StatusTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusTracker {
    pub fn new() -> Self {
        Self {
            current: ExecutionStatus::Pending,
            history: vec![StatusChange {
                status: ExecutionStatus::Pending,
                at: Utc::now(),
            }],
        }
    }

    /// Rebuilds a tracker from a recorded history. `None` if it is empty.
    pub fn from_history(history: Vec<StatusChange>) -> Option<Self> {
        let current = history.last()?.status;
        Some(Self { current, history })
    }

    pub fn current(&self) -> ExecutionStatus {
        self.current
    }

    pub fn history(&self) -> &[StatusChange] {
        &self.history
    }

    pub fn transition(&mut self, next: ExecutionStatus) -> Result<(), TransitionError> {
        if !self.current.can_transition_to(next) {
            return Err(TransitionError {
                from: self.current,
                to: next,
            });
        }
        self.current = next;
        self.history.push(StatusChange {
            status: next,
            at: Utc::now(),
        });
        Ok(())
    }

    /// Applies an approver's answer to an execution awaiting approval.
    ///
    /// Approval completes it; rejection or a revision request fails it.
    pub fn resolve_approval(
        &mut self,
        outcome: &ApprovalOutcome,
    ) -> Result<ExecutionStatus, TransitionError> {
        let next = match outcome {
            ApprovalOutcome::Approved => ExecutionStatus::Completed,
            ApprovalOutcome::Rejected { .. } | ApprovalOutcome::Revise { .. } => {
                ExecutionStatus::Failed
            }
        };
        if self.current != ExecutionStatus::AwaitingApproval {
            return Err(TransitionError {
                from: self.current,
                to: next,
            });
        }
        self.transition(next)?;
        Ok(next)
    }
}
