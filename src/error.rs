//! Crate-level errors for loading definitions, inputs and configuration.
//!
//! Step-level problems never surface here: an execution always ends in an
//! `ExecutionResult`, whatever happened to its steps.

use std::path::PathBuf;

use thiserror::Error;

use crate::config::ConfigError;
use crate::workflow::validator::DefinitionError;

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to read '{}': {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("failed to parse JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid workflow definition:\n{}", join_lines(.0))]
    Definition(Vec<DefinitionError>),

    #[error("workflow '{0}' not found")]
    WorkflowNotFound(String),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl From<Vec<DefinitionError>> for Error {
    fn from(errors: Vec<DefinitionError>) -> Self {
        Error::Definition(errors)
    }
}

impl From<DefinitionError> for Error {
    fn from(error: DefinitionError) -> Self {
        Error::Definition(vec![error])
    }
}

fn join_lines(errors: &[DefinitionError]) -> String {
    errors
        .iter()
        .map(|e| format!("  - {}", e))
        .collect::<Vec<_>>()
        .join("\n")
}

pub type Result<T> = std::result::Result<T, Error>;
