//! Error types for session operations.

use thiserror::Error;

/// Result type for session operations.
pub type SessionResult<T> = Result<T, SessionError>;

/// Session-specific errors.
///
/// Cookie integrity failures are deliberately absent: a tampered or
/// malformed cookie is not an error, it simply yields a fresh session.
#[derive(Debug, Error)]
pub enum SessionError {
    /// Configuration rejected at construction time
    #[error("Configuration error: {0}")]
    Config(String),

    /// The document store reported a failed read or write
    #[error("Store error: {0}")]
    Store(String),

    /// Backend could not be reached
    #[error("Connection error: {0}")]
    Connection(String),

    /// HTTP request error (CouchDB)
    #[cfg(feature = "couchdb")]
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Deserialization error
    #[error("Deserialization error: {0}")]
    Deserialization(String),

    /// Encryption provider failure
    #[error("Cryptography error: {0}")]
    Crypto(String),

    /// Settings file or environment could not be parsed
    #[error("Settings error: {0}")]
    Settings(String),

    /// A cookie header could not be built
    #[error("Invalid header: {0}")]
    Header(String),
}

impl SessionError {
    /// Whether this error originated in the backing store.
    pub fn is_store_error(&self) -> bool {
        match self {
            SessionError::Store(_) | SessionError::Connection(_) => true,
            #[cfg(feature = "couchdb")]
            SessionError::Http(_) => true,
            _ => false,
        }
    }
}
