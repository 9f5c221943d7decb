//! App configuration mapping.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::errors::ConfigError;

/// Keys the orchestrator writes at construction. Collaborators may read them
/// but not change them.
pub const RESERVED_KEYS: [&str; 3] = ["name", "nodename", "appid"];

/// An App's private configuration: string keys to JSON-like values.
///
/// This is the only channel through which a collaborator and the core
/// exchange derived facts such as ports, paths, addresses and commands.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AppConfig(Map<String, Value>);

impl AppConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(Value::as_str)
    }

    pub fn get_u64(&self, key: &str) -> Option<u64> {
        self.0.get(key).and_then(Value::as_u64)
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.0.get(key).and_then(Value::as_bool)
    }

    pub fn require_str(&self, key: &str) -> Result<&str, ConfigError> {
        match self.0.get(key) {
            None => Err(ConfigError::MissingKey { key: key.into() }),
            Some(value) => value.as_str().ok_or_else(|| ConfigError::WrongType {
                key: key.into(),
                expected: "string",
            }),
        }
    }

    pub fn require_u64(&self, key: &str) -> Result<u64, ConfigError> {
        match self.0.get(key) {
            None => Err(ConfigError::MissingKey { key: key.into() }),
            Some(value) => value.as_u64().ok_or_else(|| ConfigError::WrongType {
                key: key.into(),
                expected: "unsigned integer",
            }),
        }
    }

    /// Set `key`, refusing the orchestrator-owned keys.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) -> Result<(), ConfigError> {
        let key = key.into();
        if RESERVED_KEYS.contains(&key.as_str()) {
            return Err(ConfigError::ReservedKey { key });
        }
        self.0.insert(key, value.into());
        Ok(())
    }

    /// Set `key` only if it is not present yet.
    pub fn set_default(&mut self, key: &str, value: impl Into<Value>) -> Result<(), ConfigError> {
        if self.contains_key(key) {
            return Ok(());
        }
        self.set(key, value)
    }

    pub(crate) fn set_reserved(&mut self, key: &str, value: impl Into<Value>) {
        self.0.insert(key.to_string(), value.into());
    }

    /// True if `key` is present and equal to `value`.
    pub fn matches(&self, key: &str, value: &Value) -> bool {
        self.0.get(key) == Some(value)
    }

    /// Plain-text rendering of a value, as used for command lines and
    /// templates: strings verbatim, everything else as JSON.
    pub fn render(&self, key: &str) -> Option<String> {
        self.0.get(key).map(|value| match value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        })
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Map<String, Value>> for AppConfig {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}
