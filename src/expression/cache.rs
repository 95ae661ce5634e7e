//! Parsed Condition Cache
//!
//! Conditions are parsed once and shared. Entries are keyed by an owner id
//! (a rule id, or a workflow step key) plus a version; an entry whose stored
//! source text no longer matches is re-parsed and replaced.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use log::debug;

use super::condition::{Condition, ConditionError};

/// Cache key: owner id and version.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub id: String,
    pub version: String,
}

impl CacheKey {
    pub fn new(id: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            version: version.into(),
        }
    }
}

/// Thread-safe store of parsed conditions.
#[derive(Debug, Default)]
pub struct ConditionCache {
    entries: RwLock<HashMap<CacheKey, Arc<Condition>>>,
}

impl ConditionCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the parsed condition for a key, parsing it on first use.
    pub fn get_or_parse(&self, key: &CacheKey, source: &str) -> Result<Arc<Condition>, ConditionError> {
        if let Ok(entries) = self.entries.read() {
            if let Some(cond) = entries.get(key) {
                if cond.source() == source {
                    return Ok(Arc::clone(cond));
                }
                debug!("Condition text changed for {}@{}, re-parsing", key.id, key.version);
            }
        }

        let parsed = Arc::new(Condition::parse(source)?);
        if let Ok(mut entries) = self.entries.write() {
            entries.insert(key.clone(), Arc::clone(&parsed));
        }
        Ok(parsed)
    }

    /// Number of cached conditions.
    pub fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or(0)
    }

    /// Returns true if nothing is cached.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops every cached entry.
    pub fn clear(&self) {
        if let Ok(mut entries) = self.entries.write() {
            entries.clear();
        }
    }
}
