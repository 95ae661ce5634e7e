//! RiskFlow - Workflow Execution Engine with Risk Routing
//!
//! Interprets declarative workflows of named steps, runs independent steps
//! concurrently, applies retry, timeout and validation policies, and folds
//! the outcome into a rule-based risk score that decides whether a human
//! must approve the result before it counts.
//!
//! # Architecture
//!
//! The library is organized into these modules:
//!
//! - [`workflow`]: Definitions, YAML loading, validation and dependency graphs
//! - [`expression`]: Variable references and condition expressions
//! - [`execution`]: Core execution engine with level-by-level scheduling
//! - [`validation`]: Input and output schemas
//! - [`risk`]: Risk dimensions, rules, anomaly detection and routing
//! - [`monitoring`]: Live execution events and step timelines
//! - [`config`]: Engine configuration
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use riskflow::execution::{builtin_registry, Engine};
//! use riskflow::load_definition;
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Load a workflow from YAML
//!     let definition = Arc::new(load_definition("beam_design.yaml")?);
//!
//!     // Create execution engine
//!     let mut engine = Engine::new(builtin_registry());
//!     engine.set_max_parallel(4);
//!
//!     // Execute the workflow
//!     let result = engine.execute(definition, json!({"load": 12.5})).await;
//!     println!("{} ({:?})", result.status, result.decision.map(|d| d.action));
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod execution;
pub mod expression;
pub mod monitoring;
pub mod risk;
pub mod validation;
pub mod workflow;

// Re-export commonly used types
pub use config::EngineConfig;
pub use error::{Error, Result};
pub use execution::engine::Engine;
pub use execution::record::ExecutionResult;
pub use execution::registry::{StepFailure, StepInvocation, StepRegistry};
pub use execution::status::ExecutionStatus;
pub use risk::routing::{RoutingAction, RoutingDecision};
pub use workflow::model::{StepDefinition, WorkflowDefinition};
pub use workflow::parser::{load_definition, load_input, parse_definition};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
pub const APP_NAME: &str = "RiskFlow";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_library_version() {
        assert!(!VERSION.is_empty());
        assert!(VERSION.contains('.'));
    }

    #[test]
    fn test_app_name() {
        assert_eq!(APP_NAME, "RiskFlow");
    }

    #[test]
    fn test_module_exports_step() {
        let step = StepDefinition::new(1, "check", "builtin.echo", "check");
        assert_eq!(step.step_number, 1);
        assert_eq!(step.function, "builtin.echo");
    }

    #[test]
    fn test_module_exports_workflow() {
        let workflow = WorkflowDefinition::new("empty");
        assert!(workflow.is_empty());
    }

    #[test]
    fn test_version_format() {
        let parts: Vec<&str> = VERSION.split('.').collect();
        assert!(parts.len() >= 2, "Version should have at least major.minor");
        for part in parts {
            assert!(part.parse::<u32>().is_ok(), "Version components should be numeric");
        }
    }
}
