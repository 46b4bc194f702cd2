use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Result, TollgateError};

/// The data bag threaded through every step of one workflow instance.
///
/// Keys are field names; values are JSON. Fields are added by the steps that
/// produce them. Reads that a step depends on should go through
/// [`StateRecord::require`] so an absent field surfaces as
/// [`TollgateError::MissingField`] instead of a silent default.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StateRecord {
    fields: BTreeMap<String, Value>,
}

impl StateRecord {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a record from a JSON object. Non-object values yield an empty record.
    pub fn from_json(value: Value) -> Self {
        match value {
            Value::Object(map) => Self {
                fields: map.into_iter().collect(),
            },
            _ => Self::default(),
        }
    }

    /// Start a record with a single field set.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set(key, value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    /// Get a value as a string, if it's a string.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.fields.get(key).and_then(|v| v.as_str())
    }

    /// Get a value as a bool, if it's a bool.
    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.fields.get(key).and_then(|v| v.as_bool())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.fields.contains_key(key)
    }

    /// Read a field a step depends on.
    pub fn require(&self, step: &str, key: &str) -> Result<&Value> {
        self.fields.get(key).ok_or_else(|| TollgateError::MissingField {
            step: step.to_string(),
            field: key.to_string(),
        })
    }

    /// Read a string field a step depends on.
    pub fn require_str(&self, step: &str, key: &str) -> Result<&str> {
        self.require(step, key)?
            .as_str()
            .ok_or_else(|| TollgateError::FieldType {
                step: step.to_string(),
                field: key.to_string(),
                expected: "a string",
            })
    }

    /// Read a bool field a step depends on.
    pub fn require_bool(&self, step: &str, key: &str) -> Result<bool> {
        self.require(step, key)?
            .as_bool()
            .ok_or_else(|| TollgateError::FieldType {
                step: step.to_string(),
                field: key.to_string(),
                expected: "a bool",
            })
    }

    pub fn set(&mut self, key: impl Into<String>, value: Value) {
        self.fields.insert(key.into(), value);
    }

    pub fn set_str(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.fields.insert(key.into(), Value::String(value.into()));
    }

    pub fn set_bool(&mut self, key: impl Into<String>, value: bool) {
        self.fields.insert(key.into(), Value::Bool(value));
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.fields.remove(key)
    }

    /// Increment an integer counter field, returning the new value.
    /// Missing or non-numeric fields count as zero.
    pub fn bump(&mut self, key: &str) -> u64 {
        let next = self.fields.get(key).and_then(|v| v.as_u64()).unwrap_or(0) + 1;
        self.fields.insert(key.to_string(), Value::from(next));
        next
    }

    /// Merge another record into this one (overwrites on conflict).
    pub fn merge(&mut self, other: &StateRecord) {
        for (k, v) in &other.fields {
            self.fields.insert(k.clone(), v.clone());
        }
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.fields.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn to_json(&self) -> Value {
        Value::Object(self.fields.clone().into_iter().collect())
    }
}

/// Field names derived from an artifact under review.
///
/// An approval gate for artifact `image` writes `image_approved`,
/// `image_feedback`, `image_decision` and `image_reviews`; the step that
/// regenerates the artifact reads `image_feedback`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactFields {
    pub artifact: String,
    pub approved: String,
    pub feedback: String,
    pub decision: String,
    pub reviews: String,
}

impl ArtifactFields {
    pub fn new(artifact: impl Into<String>) -> Self {
        let artifact = artifact.into();
        Self {
            approved: format!("{artifact}_approved"),
            feedback: format!("{artifact}_feedback"),
            decision: format!("{artifact}_decision"),
            reviews: format!("{artifact}_reviews"),
            artifact,
        }
    }
}
