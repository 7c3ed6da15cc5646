//! Typed access to tool call arguments.

use crate::error::WardenError;

/// Wrapper around tool call arguments providing typed extraction.
#[derive(Debug, Clone)]
pub struct ToolArguments {
    value: serde_json::Value,
}

impl ToolArguments {
    /// Wrap raw arguments. A JSON-encoded string (as some providers send) is decoded first.
    pub fn new(value: serde_json::Value) -> Self {
        let value = match value {
            serde_json::Value::String(raw) if raw.trim().is_empty() => serde_json::json!({}),
            serde_json::Value::String(raw) => {
                serde_json::from_str(raw.trim()).unwrap_or(serde_json::Value::String(raw))
            }
            other => other,
        };
        Self { value }
    }

    /// Get the raw JSON value.
    pub fn raw(&self) -> &serde_json::Value {
        &self.value
    }

    /// Get a string argument by key.
    pub fn get_str(&self, key: &str) -> Result<&str, WardenError> {
        self.value
            .get(key)
            .and_then(|v| v.as_str())
            .ok_or_else(|| WardenError::InvalidArgument(format!("Missing string argument: {key}")))
    }

    /// Get an optional string argument.
    pub fn get_str_opt(&self, key: &str) -> Option<&str> {
        self.value.get(key).and_then(|v| v.as_str())
    }

    /// Get an optional integer argument.
    pub fn get_u64_opt(&self, key: &str) -> Option<u64> {
        self.value.get(key).and_then(|v| v.as_u64())
    }

    /// Get a boolean argument, falling back to `default` when absent.
    pub fn get_bool_or(&self, key: &str, default: bool) -> bool {
        self.value
            .get(key)
            .and_then(|v| v.as_bool())
            .unwrap_or(default)
    }

    /// Deserialize the entire arguments into a typed struct.
    pub fn deserialize<T: serde::de::DeserializeOwned>(&self) -> Result<T, WardenError> {
        serde_json::from_value(self.value.clone()).map_err(|e| {
            WardenError::InvalidArgument(format!("Failed to deserialize arguments: {e}"))
        })
    }
}
