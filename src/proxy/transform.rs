//! Per-tool request transformation rules.
//!
//! Optional argument renames and defaults applied to `tools/call` payloads
//! before routing. Configured programmatically by the embedder.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Transformation applied to one tool's call arguments.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolTransform {
    /// Rename argument keys: old name → new name.
    #[serde(default)]
    pub argument_mapping: HashMap<String, String>,
    /// Fill these arguments when the caller omitted them.
    #[serde(default)]
    pub default_arguments: HashMap<String, Value>,
}

/// Per-tool transformation table.
#[derive(Debug, Clone, Default)]
pub struct TransformRules {
    rules: HashMap<String, ToolTransform>,
}

impl TransformRules {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a transform for a tool (keyed by its published name).
    pub fn set(&mut self, tool: impl Into<String>, transform: ToolTransform) {
        self.rules.insert(tool.into(), transform);
    }

    /// Apply the tool's transform to a call payload, if one is registered.
    pub fn apply(&self, tool: &str, payload: &Value) -> Value {
        let Some(rule) = self.rules.get(tool) else {
            return payload.clone();
        };

        let mut payload = payload.clone();
        let Some(object) = payload.as_object_mut() else {
            return payload;
        };
        let arguments = object
            .entry("arguments")
            .or_insert_with(|| Value::Object(serde_json::Map::new()));
        let Some(arguments) = arguments.as_object_mut() else {
            return payload;
        };

        for (old, new) in &rule.argument_mapping {
            if let Some(value) = arguments.remove(old) {
                arguments.insert(new.clone(), value);
            }
        }
        for (name, default) in &rule.default_arguments {
            if !arguments.contains_key(name) {
                arguments.insert(name.clone(), default.clone());
            }
        }
        payload
    }
}
