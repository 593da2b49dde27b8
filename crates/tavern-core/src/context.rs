//! Session metadata carried alongside a conversation.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Free-form metadata attached to a session.
///
/// The scheduler never interprets these values; they travel with the
/// session to presentation collaborators and in `conversation-start`
/// announcements (topic, location, mood and so on).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionMetadata {
    entries: HashMap<String, Value>,
}

impl SessionMetadata {
    /// Create empty metadata.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set(key, value);
        self
    }

    /// Get a metadata value by key.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries.get(key)
    }

    /// Set a metadata value.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.entries.insert(key.into(), value.into());
    }

    /// Whether no metadata is present.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Render as a JSON object.
    #[must_use]
    pub fn to_value(&self) -> Value {
        Value::Object(
            self.entries
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        )
    }
}

impl From<Value> for SessionMetadata {
    /// Objects keep their fields; any other JSON value yields empty metadata.
    fn from(value: Value) -> Self {
        match value {
            Value::Object(map) => Self {
                entries: map.into_iter().collect(),
            },
            _ => Self::default(),
        }
    }
}

impl From<HashMap<String, Value>> for SessionMetadata {
    fn from(entries: HashMap<String, Value>) -> Self {
        Self { entries }
    }
}
