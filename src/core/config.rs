//! Environment configuration — per-(stack, environment) named overrides
//! merged over hard-coded defaults.
//!
//! Resolution is a pure function so environment-conditional defaults ("prod
//! gets HA NAT, dev gets a single NAT") stay independently testable.
//! Precedence, highest first: explicit per-stack config > environment default
//! (the value the stack code passes as `default`) > component default (the
//! component args' `Default` impl).

use std::path::Path;

use indexmap::IndexMap;
use serde_json::Value;

use crate::core::stack::Environment;
use crate::error::{Error, Result};

/// Raw override map loaded from `<config_dir>/<stack>-<env>.yaml`.
#[derive(Debug, Clone, Default)]
pub struct ConfigMap {
    values: IndexMap<String, Value>,
}

impl ConfigMap {
    pub fn from_values(values: IndexMap<String, Value>) -> Self {
        Self { values }
    }

    /// Load overrides for one stack. A missing file means no overrides.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path)?;
        let values: IndexMap<String, Value> = serde_yaml_ng::from_str(&text)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
        Ok(Self { values })
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Resolved configuration for one (stack, environment).
#[derive(Debug, Clone)]
pub struct StackConfig {
    environment: Environment,
    overrides: ConfigMap,
}

impl StackConfig {
    pub fn resolve(environment: Environment, overrides: ConfigMap) -> Self {
        Self {
            environment,
            overrides,
        }
    }

    pub fn environment(&self) -> Environment {
        self.environment
    }

    pub fn is_prod(&self) -> bool {
        self.environment.is_prod()
    }

    /// Explicit override if present, else the caller's environment default.
    pub fn str_or(&self, key: &str, default: impl Into<String>) -> String {
        match self.overrides.get(key).and_then(Value::as_str) {
            Some(s) => s.to_string(),
            None => default.into(),
        }
    }

    pub fn bool_or(&self, key: &str, default: bool) -> bool {
        self.overrides
            .get(key)
            .and_then(Value::as_bool)
            .unwrap_or(default)
    }

    pub fn usize_or(&self, key: &str, default: usize) -> usize {
        self.overrides
            .get(key)
            .and_then(Value::as_u64)
            .map(|n| n as usize)
            .unwrap_or(default)
    }

    pub fn u64_or(&self, key: &str, default: u64) -> u64 {
        self.overrides
            .get(key)
            .and_then(Value::as_u64)
            .unwrap_or(default)
    }

    pub fn str_list_or(&self, key: &str, default: &[&str]) -> Vec<String> {
        match self.overrides.get(key).and_then(Value::as_array) {
            Some(items) => items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect(),
            None => default.iter().map(|s| s.to_string()).collect(),
        }
    }
}
