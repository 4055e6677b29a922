//! The persisted session record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Application-visible session payload.
pub type SessionData = HashMap<String, serde_json::Value>;

/// Bytes of entropy in a generated session id.
const SESSION_ID_BYTES: usize = 32;

/// A session as stored in the document store.
///
/// `lastAccessed` is serialized as epoch milliseconds so that every backend
/// can range-scan it numerically.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionDocument {
    /// Unique session identifier, immutable once created
    pub id: String,
    /// Last access timestamp
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub last_accessed: DateTime<Utc>,
    /// Session data as key-value pairs
    #[serde(default)]
    pub data: SessionData,
}

impl SessionDocument {
    /// A new, empty document stamped with `now`.
    pub fn new(id: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            last_accessed: now,
            data: SessionData::new(),
        }
    }
}

/// Generate a new unguessable session ID (256 random bits, lowercase hex).
///
/// Hex keeps ids valid as document ids everywhere; CouchDB, for one, rejects
/// ids starting with `_`.
pub fn generate_session_id() -> String {
    let bytes: [u8; SESSION_ID_BYTES] = rand::random();
    hex::encode(bytes)
}
