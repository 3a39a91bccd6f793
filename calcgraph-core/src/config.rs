//! Engine Configuration

use std::time::Duration;

use indexmap::IndexMap;
use serde::Deserialize;

use crate::expr::{Table, Value};

/// Tunables for the recompute pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Quiet period after the last edit before pending nodes are flushed.
    pub debounce_ms: u64,
    /// Name given to the preview worker thread.
    pub worker_thread_name: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            debounce_ms: 1000,
            worker_thread_name: "calc-preview".to_string(),
        }
    }
}

impl EngineConfig {
    /// Parse a JSON document; missing keys take their defaults.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }
}

/// Values made available to every calculation of a model.
///
/// Resolved once per flush and shared read-only with the preview worker.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Environment {
    /// Input columns, bound as `arg`.
    pub input: Table,
    /// Extra names bound directly, e.g. constants contributed by plugins.
    pub globals: IndexMap<String, Value>,
}

impl Environment {
    pub fn new(input: Table) -> Self {
        Self {
            input,
            globals: IndexMap::new(),
        }
    }

    pub fn with_global(mut self, name: impl Into<String>, value: Value) -> Self {
        self.globals.insert(name.into(), value);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_values() {
        let config = EngineConfig::default();
        assert_eq!(config.debounce_ms, 1000);
        assert_eq!(config.debounce(), Duration::from_secs(1));
        assert_eq!(config.worker_thread_name, "calc-preview");
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let config = EngineConfig::from_json(r#"{"debounce_ms": 50}"#).unwrap();
        assert_eq!(config.debounce_ms, 50);
        assert_eq!(config.worker_thread_name, "calc-preview");
    }

    #[test]
    fn rejects_malformed_json() {
        assert!(EngineConfig::from_json("{debounce_ms: 50").is_err());
    }
}
