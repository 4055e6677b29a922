//! The request-scoped session handle.

use crate::document::{SessionData, SessionDocument};
use crate::error::{SessionError, SessionResult};
use serde::{Deserialize, Serialize};

/// Live view of a session during one request.
///
/// Mutations set the `changed` flag; only changed sessions are written back
/// and only they get a fresh cookie.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Session {
    id: Option<String>,
    data: SessionData,
    changed: bool,
}

impl Session {
    /// Fresh, empty session bound to `id`.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            data: SessionData::new(),
            changed: false,
        }
    }

    /// A session with no id. Saving it is a no-op.
    pub fn detached() -> Self {
        Self::default()
    }

    /// Populate a session from a stored document.
    pub fn from_document(document: SessionDocument) -> Self {
        Self {
            id: Some(document.id),
            data: document.data,
            changed: false,
        }
    }

    /// Session id, if bound.
    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    /// Whether the data was modified since load.
    pub fn is_changed(&self) -> bool {
        self.changed
    }

    /// Force a write on save.
    pub fn mark_changed(&mut self) {
        self.changed = true;
    }

    /// Raw session data.
    pub fn data(&self) -> &SessionData {
        &self.data
    }

    /// Get a value from the session data.
    pub fn get<T: for<'de> Deserialize<'de>>(&self, key: &str) -> Option<T> {
        self.data
            .get(key)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    /// Set a value in the session data.
    pub fn set<T: Serialize>(&mut self, key: &str, value: T) -> SessionResult<()> {
        let json_value = serde_json::to_value(value)
            .map_err(|e| SessionError::Serialization(e.to_string()))?;
        self.data.insert(key.to_string(), json_value);
        self.changed = true;
        Ok(())
    }

    /// Remove a value from the session data.
    pub fn remove(&mut self, key: &str) -> Option<serde_json::Value> {
        let removed = self.data.remove(key);
        if removed.is_some() {
            self.changed = true;
        }
        removed
    }

    /// Check if a key exists in the session data.
    pub fn contains(&self, key: &str) -> bool {
        self.data.contains_key(key)
    }

    /// Get all keys in the session data.
    pub fn keys(&self) -> Vec<&String> {
        self.data.keys().collect()
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether the session holds no data.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Clear all session data.
    pub fn clear(&mut self) {
        if !self.data.is_empty() {
            self.data.clear();
            self.changed = true;
        }
    }
}
