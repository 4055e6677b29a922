//! Document-store backed sessions for Armature applications.
//!
//! Session data lives in a document store; the browser only holds an opaque
//! cookie carrying the session id, encrypted and HMAC-authenticated. A
//! [`SessionManager`] sits in front of the request pipeline:
//!
//! - **Load** reads the cookie, verifies and decrypts it, and fetches the
//!   session document. Anything that fails along the way yields a fresh
//!   session instead of an error page.
//! - **Save** writes the session back only when it was modified, and only
//!   then issues a new cookie.
//! - **Expiry** is enforced by an opportunistic sweep on the request path,
//!   throttled so that at most one sweep runs per check interval.
//!
//! With rolling sessions enabled every load refreshes the session's
//! `lastAccessed` timestamp, so only idle sessions expire. Otherwise a
//! session expires a fixed time after it was created.
//!
//! # Features
//!
//! - `couchdb` - CouchDB document backend (enabled by default)
//!
//! The in-memory backend is always available and is what the tests use.
//!
//! # Examples
//!
//! ```
//! use armature_docsession::*;
//! use http::HeaderMap;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # tokio_test::block_on(async {
//! let config = SessionConfig::builder()
//!     .with_connection(Arc::new(MemoryBackend::new()))
//!     .with_cryptography(CryptographyConfig::random()?)
//!     .with_expiry(Duration::from_secs(30 * 60))
//!     .build()?;
//!
//! let manager = SessionManager::enable(config).await?;
//!
//! // First request: no cookie, so a new session is created.
//! let mut session = manager.load(&HeaderMap::new()).await?;
//! session.set("user_id", 42)?;
//!
//! let mut response_headers = HeaderMap::new();
//! assert!(manager.save(Some(&session), &mut response_headers).await?);
//! assert!(response_headers.contains_key(http::header::SET_COOKIE));
//! # Ok::<(), SessionError>(())
//! # }).unwrap();
//! ```
//!
//! ## Configuration from the environment
//!
//! ```no_run
//! use armature_docsession::*;
//! use std::sync::Arc;
//!
//! # fn main() -> Result<(), SessionError> {
//! // ARMATURE_SESSION_DATABASE, ARMATURE_SESSION_EXPIRY_SECS, ...
//! let settings = SessionSettings::from_env()?;
//!
//! let config = SessionConfig::builder()
//!     .with_settings(&settings)
//!     .with_connection(Arc::new(MemoryBackend::new()))
//!     .with_cryptography(CryptographyConfig::from_passphrase("correct horse", b"battery staple")?)
//!     .build()?;
//! # let _ = config;
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod clock;
pub mod codec;
pub mod config;
pub mod cookie;
pub mod crypto;
pub mod document;
pub mod error;
pub mod logging;
pub mod manager;
pub mod memory;
pub mod session;
pub mod store;

#[cfg(feature = "couchdb")]
pub mod couchdb;

pub use backend::{DocumentBackend, DocumentPatch, StoreLocation, WriteResult};
pub use clock::{Clock, ManualClock, SystemClock};
pub use codec::CookieCodec;
pub use config::{CookieSettings, SameSite, SessionConfig, SessionConfigBuilder, SessionSettings};
pub use crypto::{
    AesGcmEncryptionProvider, CryptographyConfig, EncryptionProvider, HmacProvider,
    HmacSha256Provider,
};
pub use document::{SessionData, SessionDocument, generate_session_id};
pub use error::{SessionError, SessionResult};
pub use logging::LogConfig;
pub use manager::SessionManager;
pub use memory::MemoryBackend;
pub use session::Session;
pub use store::{DocumentSessionStore, SessionStore};

#[cfg(feature = "couchdb")]
pub use couchdb::CouchDbBackend;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::{SessionConfig, SessionSettings};
    pub use crate::crypto::CryptographyConfig;
    pub use crate::error::{SessionError, SessionResult};
    pub use crate::manager::SessionManager;
    pub use crate::memory::MemoryBackend;
    pub use crate::session::Session;
    pub use crate::store::SessionStore;

    #[cfg(feature = "couchdb")]
    pub use crate::couchdb::CouchDbBackend;
}
