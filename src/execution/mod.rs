//! Workflow Execution Module
//!
//! Provides the core execution engine for running workflow steps,
//! including level-by-level parallel scheduling, per-step retry and
//! timeout handling, and the records an execution leaves behind.
//!
//! # Architecture
//!
//! - [`engine`]: Main execution engine orchestrating workflow runs
//! - [`step`]: Individual step execution logic
//! - [`context`]: Input, step outputs and metadata visible to references
//! - [`registry`]: Step functions keyed by id
//! - [`retry`]: Failure classification and backoff
//! - [`timeout`]: Per-attempt deadlines and cleanup
//! - [`status`]: The per-execution state machine
//! - [`record`]: Execution results and record sinks
//! - [`builtin`]: Functions every CLI registry carries

pub mod builtin;
pub mod context;
pub mod engine;
pub mod record;
pub mod registry;
pub mod retry;
pub mod status;
pub mod step;
pub mod timeout;

pub use builtin::{builtin_registry, register_builtins};
pub use context::{ContextMetadata, ExecutionContext};
pub use engine::Engine;
pub use record::{ExecutionRecord, ExecutionResult, JsonFileSink, MemorySink, RecordSink};
pub use registry::{FnStep, StepFailure, StepFunction, StepInvocation, StepRegistry};
pub use retry::{FailureClass, FailureClassifier, KeywordClassifier, RetryCoordinator, RetryPolicy};
pub use status::{ExecutionStatus, StatusTracker};
pub use step::{SkipReason, StepReport, StepStatus};
