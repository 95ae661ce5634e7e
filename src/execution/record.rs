//! Execution Records
//!
//! The outcome of an execution and the sinks that keep it for audit.
//! A sink receives a start record when an execution begins and the final
//! [`ExecutionResult`] when it settles. Sink failures are logged by the
//! engine and never affect the execution.
//!
//! [`JsonFileSink`] writes `<dir>/<execution_id>.json`, overwriting the start
//! record with the final one.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use log::debug;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};
use crate::execution::status::{ExecutionStatus, StatusChange};
use crate::execution::step::{StepReport, StepStatus};
use crate::risk::anomaly::AnomalyScore;
use crate::risk::assessment::RiskAssessment;
use crate::risk::routing::RoutingDecision;
use crate::risk::rules::RuleEvaluation;
use crate::validation::Violation;

/// Written when an execution begins.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct StartRecord {
    pub execution_id: String,
    pub workflow_id: String,
    pub workflow_version: String,
    pub input: Value,
    pub started_at: DateTime<Utc>,
}

/// Everything known about a settled execution.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ExecutionResult {
    pub execution_id: String,
    pub workflow_id: String,
    pub workflow_version: String,
    pub status: ExecutionStatus,
    pub status_history: Vec<StatusChange>,

    /// Highest step number whose output was stored
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub furthest_completed_step: Option<u32>,

    /// Single root cause when the execution failed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root_cause: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,

    /// Input or output schema violations
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub violations: Vec<Violation>,

    /// Per-step audit trail, in step order
    pub steps: Vec<StepReport>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rule_evaluations: Vec<RuleEvaluation>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub anomaly: Option<AnomalyScore>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assessment: Option<RiskAssessment>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decision: Option<RoutingDecision>,

    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: u64,
}

impl ExecutionResult {
    pub fn is_completed(&self) -> bool {
        self.status == ExecutionStatus::Completed
    }

    pub fn is_failed(&self) -> bool {
        self.status == ExecutionStatus::Failed
    }

    pub fn is_awaiting_approval(&self) -> bool {
        self.status == ExecutionStatus::AwaitingApproval
    }

    pub fn step(&self, step_number: u32) -> Option<&StepReport> {
        self.steps.iter().find(|s| s.step_number == step_number)
    }

    /// Steps that reached each status, for summaries.
    pub fn count(&self, status: StepStatus) -> usize {
        self.steps.iter().filter(|s| s.status == status).count()
    }
}

/// A stored record.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "phase", rename_all = "snake_case")]
pub enum ExecutionRecord {
    Started(StartRecord),
    Finished(Box<ExecutionResult>),
}

impl ExecutionRecord {
    pub fn execution_id(&self) -> &str {
        match self {
            ExecutionRecord::Started(s) => &s.execution_id,
            ExecutionRecord::Finished(r) => &r.execution_id,
        }
    }
}

/// Audit storage for execution records.
pub trait RecordSink: Send + Sync {
    fn record_start(&self, record: &StartRecord) -> Result<()>;

    fn record_result(&self, result: &ExecutionResult) -> Result<()>;
}

/// Writes one JSON file per execution.
#[derive(Debug, Clone)]
pub struct JsonFileSink {
    dir: PathBuf,
}

impl JsonFileSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the record for an execution.
    pub fn path_for(&self, execution_id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", execution_id))
    }

    /// Reads back the stored record for an execution.
    pub fn load(&self, execution_id: &str) -> Result<ExecutionRecord> {
        let path = self.path_for(execution_id);
        let content = fs::read_to_string(&path).map_err(|source| Error::Io { path, source })?;
        Ok(serde_json::from_str(&content)?)
    }

    fn write(&self, record: &ExecutionRecord) -> Result<()> {
        fs::create_dir_all(&self.dir).map_err(|source| Error::Io {
            path: self.dir.clone(),
            source,
        })?;

        let path = self.path_for(record.execution_id());
        let json = serde_json::to_string_pretty(record)?;
        fs::write(&path, json).map_err(|source| Error::Io {
            path: path.clone(),
            source,
        })?;

        debug!("Saved execution record to {}", path.display());
        Ok(())
    }
}

impl RecordSink for JsonFileSink {
    fn record_start(&self, record: &StartRecord) -> Result<()> {
        self.write(&ExecutionRecord::Started(record.clone()))
    }

    fn record_result(&self, result: &ExecutionResult) -> Result<()> {
        self.write(&ExecutionRecord::Finished(Box::new(result.clone())))
    }
}

/// Keeps records in memory, in arrival order.
#[derive(Debug, Default)]
pub struct MemorySink {
    records: Mutex<Vec<ExecutionRecord>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<ExecutionRecord> {
        self.records.lock().map(|r| r.clone()).unwrap_or_default()
    }

    /// The final result stored for an execution, if it has settled.
    pub fn result(&self, execution_id: &str) -> Option<ExecutionResult> {
        self.records().into_iter().rev().find_map(|r| match r {
            ExecutionRecord::Finished(result) if result.execution_id == execution_id => {
                Some(*result)
            }
            _ => None,
        })
    }

    fn push(&self, record: ExecutionRecord) {
        if let Ok(mut records) = self.records.lock() {
            records.push(record);
        }
    }
}

impl RecordSink for MemorySink {
    fn record_start(&self, record: &StartRecord) -> Result<()> {
        self.push(ExecutionRecord::Started(record.clone()));
        Ok(())
    }

    fn record_result(&self, result: &ExecutionResult) -> Result<()> {
        self.push(ExecutionRecord::Finished(Box::new(result.clone())));
        Ok(())
    }
}
