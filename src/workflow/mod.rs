//! Workflow Definition Module
//!
//! Provides data structures and utilities for defining, loading and
//! validating workflows.
//!
//! # Structure
//!
//! - [`model`]: Core data structures (WorkflowDefinition, StepDefinition)
//! - [`parser`]: YAML loading and definition sources
//! - [`validator`]: Load-time validation rules
//! - [`graph`]: Dependency levels, cycle detection and critical path

pub mod graph;
pub mod model;
pub mod parser;
pub mod validator;

pub use graph::{DependencyGraph, GraphCache};
pub use model::{
    ErrorHandling, OnError, RiskProfile, StepDefinition, TimeoutStrategy, WorkflowDefinition,
};
pub use parser::{
    load_definition, load_input, parse_definition, save_definition, DefinitionSource,
    DirectorySource, MemorySource,
};
pub use validator::{validate_definition, validate_functions, DefinitionError};
