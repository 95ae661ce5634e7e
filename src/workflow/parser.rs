//! Workflow Parser
//!
//! Loads workflow definitions from YAML and workflow inputs from JSON or
//! YAML. Every definition is validated before it is handed out, so a
//! definition with a reference cycle or a malformed rule never reaches the
//! engine.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use log::{debug, info, warn};
use serde_json::Value;

use super::model::WorkflowDefinition;
use super::validator::validate_definition;
use crate::error::{Error, Result};

fn read_file(path: &Path) -> Result<String> {
    fs::read_to_string(path).map_err(|source| Error::Io {
        path: path.to_path_buf(),
        source,
    })
}

/// Parses and validates a workflow definition from YAML text.
pub fn parse_definition(yaml: &str) -> Result<WorkflowDefinition> {
    let definition: WorkflowDefinition = serde_yaml::from_str(yaml)?;
    info!(
        "Parsed workflow '{}' v{}: {} steps, {} risk rules",
        definition.id,
        definition.version,
        definition.steps.len(),
        definition.risk_rules.len()
    );

    validate_definition(&definition)?;
    Ok(definition)
}

/// Loads a workflow definition from a YAML file.
///
/// # Example
///
/// ```rust,no_run
/// use riskflow::workflow::load_definition;
///
/// fn main() -> riskflow::Result<()> {
///     let definition = load_definition("beam_design.yaml")?;
///     println!("Loaded {} steps", definition.steps.len());
///     Ok(())
/// }
/// ```
pub fn load_definition(path: impl AsRef<Path>) -> Result<WorkflowDefinition> {
    let path = path.as_ref();
    info!("Loading workflow from: {}", path.display());

    let yaml = read_file(path)?;
    debug!("YAML content loaded ({} bytes)", yaml.len());
    parse_definition(&yaml)
}

/// Loads a workflow input document. `.json` files are parsed as JSON,
/// anything else as YAML.
pub fn load_input(path: impl AsRef<Path>) -> Result<Value> {
    let path = path.as_ref();
    let content = read_file(path)?;

    let is_json = path
        .extension()
        .map(|ext| ext.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    let value = if is_json {
        serde_json::from_str(&content)?
    } else {
        serde_yaml::from_str(&content)?
    };
    Ok(value)
}

/// Saves a workflow definition to a YAML file.
pub fn save_definition(definition: &WorkflowDefinition, path: impl AsRef<Path>) -> Result<()> {
    let path = path.as_ref();
    let yaml = serde_yaml::to_string(definition)?;
    fs::write(path, yaml).map_err(|source| Error::Io {
        path: path.to_path_buf(),
        source,
    })?;
    info!("Workflow saved to: {}", path.display());
    Ok(())
}

/// Supplies immutable, versioned workflow definitions by workflow id.
pub trait DefinitionSource: Send + Sync {
    fn load(&self, workflow_id: &str) -> Result<Arc<WorkflowDefinition>>;
}

/// Loads `<dir>/<workflow_id>.yaml` (or `.yml`), caching each definition
/// after its first successful load.
#[derive(Debug)]
pub struct DirectorySource {
    root: PathBuf,
    loaded: RwLock<HashMap<String, Arc<WorkflowDefinition>>>,
}

impl DirectorySource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            loaded: RwLock::new(HashMap::new()),
        }
    }

    fn path_for(&self, workflow_id: &str) -> Option<PathBuf> {
        ["yaml", "yml"]
            .iter()
            .map(|ext| self.root.join(format!("{}.{}", workflow_id, ext)))
            .find(|p| p.is_file())
    }
}

impl DefinitionSource for DirectorySource {
    fn load(&self, workflow_id: &str) -> Result<Arc<WorkflowDefinition>> {
        if let Ok(loaded) = self.loaded.read() {
            if let Some(definition) = loaded.get(workflow_id) {
                return Ok(Arc::clone(definition));
            }
        }

        let path = self
            .path_for(workflow_id)
            .ok_or_else(|| Error::WorkflowNotFound(workflow_id.to_string()))?;
        let definition = load_definition(&path)?;
        if definition.id != workflow_id {
            warn!(
                "File {} declares workflow id '{}', expected '{}'",
                path.display(),
                definition.id,
                workflow_id
            );
        }

        let definition = Arc::new(definition);
        if let Ok(mut loaded) = self.loaded.write() {
            loaded.insert(workflow_id.to_string(), Arc::clone(&definition));
        }
        Ok(definition)
    }
}

/// In-memory definitions, validated on insertion.
#[derive(Debug, Default)]
pub struct MemorySource {
    definitions: HashMap<String, Arc<WorkflowDefinition>>,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validates and stores a definition under its id.
    pub fn insert(&mut self, definition: WorkflowDefinition) -> Result<()> {
        validate_definition(&definition)?;
        self.definitions
            .insert(definition.id.clone(), Arc::new(definition));
        Ok(())
    }
}

impl DefinitionSource for MemorySource {
    fn load(&self, workflow_id: &str) -> Result<Arc<WorkflowDefinition>> {
        self.definitions
            .get(workflow_id)
            .cloned()
            .ok_or_else(|| Error::WorkflowNotFound(workflow_id.to_string()))
    }
}
