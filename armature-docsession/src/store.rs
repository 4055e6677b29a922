//! Session store trait definition.

use crate::backend::{DocumentBackend, DocumentPatch, StoreLocation};
use crate::clock::Clock;
use crate::config::SessionConfig;
use crate::document::{SessionData, SessionDocument};
use crate::error::SessionResult;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::debug;

/// Persistence operations the session manager relies on.
///
/// Every call is one round trip to the store. Nothing is cached and nothing
/// is retried: a failure is returned to the caller as-is.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Create the database, table and `lastAccessed` index if they are missing.
    ///
    /// Safe to call any number of times.
    async fn ensure_schema(&self) -> SessionResult<()>;

    /// Insert an empty session stamped with the current time.
    ///
    /// A duplicate id is an error.
    async fn create(&self, session_id: &str) -> SessionResult<()>;

    /// Get a session by ID.
    ///
    /// Returns `Ok(None)` when no document matches.
    async fn retrieve(&self, session_id: &str) -> SessionResult<Option<SessionDocument>>;

    /// Set `lastAccessed` to now without touching the data.
    async fn touch_last_accessed(&self, session_id: &str) -> SessionResult<()>;

    /// Replace the session data wholesale.
    ///
    /// Under rolling expiry `lastAccessed` is refreshed in the same write.
    async fn update(&self, session_id: &str, data: &SessionData) -> SessionResult<()>;

    /// Delete every session last accessed before `cutoff`.
    ///
    /// Returns the number of deleted sessions.
    async fn delete_expired(&self, cutoff: DateTime<Utc>) -> SessionResult<usize>;

    /// Get the number of stored sessions.
    async fn count(&self) -> SessionResult<usize>;
}

/// [`SessionStore`] over any [`DocumentBackend`].
///
/// # Examples
///
/// ```
/// use armature_docsession::*;
/// use std::sync::Arc;
///
/// # tokio_test::block_on(async {
/// let config = SessionConfig::builder()
///     .with_connection(Arc::new(MemoryBackend::new()))
///     .with_cryptography(CryptographyConfig::random().unwrap())
///     .build()
///     .unwrap();
///
/// let store = DocumentSessionStore::new(&config);
/// store.ensure_schema().await.unwrap();
/// store.create("abc").await.unwrap();
/// assert!(store.retrieve("abc").await.unwrap().is_some());
/// # });
/// ```
pub struct DocumentSessionStore {
    backend: Arc<dyn DocumentBackend>,
    location: StoreLocation,
    use_rolling_sessions: bool,
    clock: Arc<dyn Clock>,
}

impl DocumentSessionStore {
    /// Create a store from the session configuration.
    pub fn new(config: &SessionConfig) -> Self {
        Self {
            backend: Arc::clone(&config.connection),
            location: config.location(),
            use_rolling_sessions: config.use_rolling_sessions,
            clock: Arc::clone(&config.clock),
        }
    }

    /// Where the documents live.
    pub fn location(&self) -> &StoreLocation {
        &self.location
    }
}

#[async_trait]
impl SessionStore for DocumentSessionStore {
    async fn ensure_schema(&self) -> SessionResult<()> {
        let location = &self.location;

        if !self.backend.database_exists(&location.database).await? {
            debug!(database = %location.database, "Creating session database");
            self.backend
                .create_database(&location.database)
                .await?
                .into_result("create session database")?;
        }

        if !self.backend.table_exists(location).await? {
            debug!(table = %location, "Creating session table");
            self.backend
                .create_table(location)
                .await?
                .into_result("create session table")?;
        }

        if !self.backend.index_exists(location).await? {
            debug!(table = %location, index = %location.index, "Creating session index");
            self.backend
                .create_index(location)
                .await?
                .into_result("create session index")?;
        }

        Ok(())
    }

    async fn create(&self, session_id: &str) -> SessionResult<()> {
        let document = SessionDocument::new(session_id, self.clock.now());
        self.backend
            .insert(&self.location, &document)
            .await?
            .into_result("insert session")?;
        Ok(())
    }

    async fn retrieve(&self, session_id: &str) -> SessionResult<Option<SessionDocument>> {
        self.backend.get(&self.location, session_id).await
    }

    async fn touch_last_accessed(&self, session_id: &str) -> SessionResult<()> {
        let patch = DocumentPatch::touch(self.clock.now());
        self.backend
            .update(&self.location, session_id, &patch)
            .await?
            .into_result("touch session")?;
        Ok(())
    }

    async fn update(&self, session_id: &str, data: &SessionData) -> SessionResult<()> {
        let patch = DocumentPatch {
            data: Some(data.clone()),
            last_accessed: self.use_rolling_sessions.then(|| self.clock.now()),
        };
        self.backend
            .update(&self.location, session_id, &patch)
            .await?
            .into_result("update session")?;
        Ok(())
    }

    async fn delete_expired(&self, cutoff: DateTime<Utc>) -> SessionResult<usize> {
        let result = self
            .backend
            .delete_before(&self.location, cutoff)
            .await?
            .into_result("delete expired sessions")?;
        Ok(result.deleted)
    }

    async fn count(&self) -> SessionResult<usize> {
        self.backend.count(&self.location).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::WriteResult;
    use crate::clock::ManualClock;
    use crate::crypto::CryptographyConfig;
    use crate::error::SessionError;
    use crate::memory::MemoryBackend;

    struct Fixture {
        store: DocumentSessionStore,
        backend: Arc<MemoryBackend>,
        clock: Arc<ManualClock>,
    }

    fn fixture(rolling: bool) -> Fixture {
        let backend = Arc::new(MemoryBackend::new());
        let clock = Arc::new(ManualClock::default());
        let config = SessionConfig::builder()
            .with_connection(backend.clone())
            .with_cryptography(CryptographyConfig::random().unwrap())
            .with_clock(clock.clone())
            .with_rolling_sessions(rolling)
            .build()
            .unwrap();

        Fixture {
            store: DocumentSessionStore::new(&config),
            backend,
            clock,
        }
    }

    fn data(key: &str, value: serde_json::Value) -> SessionData {
        let mut data = SessionData::new();
        data.insert(key.to_string(), value);
        data
    }

    #[tokio::test]
    async fn test_ensure_schema_is_idempotent() {
        let f = fixture(true);
        f.store.ensure_schema().await.unwrap();
        f.store.ensure_schema().await.unwrap();

        let location = f.store.location();
        assert!(f.backend.database_exists(&location.database).await.unwrap());
        assert!(f.backend.table_exists(location).await.unwrap());
        assert!(f.backend.index_exists(location).await.unwrap());
    }

    #[tokio::test]
    async fn test_ensure_schema_fills_partial_schema() {
        let f = fixture(true);
        let location = f.store.location().clone();
        f.backend.create_database(&location.database).await.unwrap();

        f.store.ensure_schema().await.unwrap();
        assert!(f.backend.index_exists(&location).await.unwrap());
    }

    #[tokio::test]
    async fn test_create_and_retrieve() {
        let f = fixture(true);
        f.store.ensure_schema().await.unwrap();
        f.store.create("abc").await.unwrap();

        let doc = f.store.retrieve("abc").await.unwrap().unwrap();
        assert_eq!(doc.id, "abc");
        assert!(doc.data.is_empty());
        assert_eq!(doc.last_accessed, f.clock.now());

        assert!(f.store.retrieve("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_duplicate_create_is_store_error() {
        let f = fixture(true);
        f.store.ensure_schema().await.unwrap();
        f.store.create("abc").await.unwrap();

        let err = f.store.create("abc").await.unwrap_err();
        assert!(matches!(err, SessionError::Store(_)));
    }

    #[tokio::test]
    async fn test_missing_schema_surfaces_error() {
        let f = fixture(true);
        assert!(f.store.create("abc").await.is_err());
        assert!(f.store.retrieve("abc").await.is_err());
    }

    #[tokio::test]
    async fn test_touch_updates_only_timestamp() {
        let f = fixture(true);
        f.store.ensure_schema().await.unwrap();
        f.store.create("abc").await.unwrap();
        f.store
            .update("abc", &data("user", serde_json::json!("alice")))
            .await
            .unwrap();

        f.clock.advance(chrono::Duration::minutes(10));
        f.store.touch_last_accessed("abc").await.unwrap();

        let doc = f.store.retrieve("abc").await.unwrap().unwrap();
        assert_eq!(doc.last_accessed, f.clock.now());
        assert_eq!(doc.data["user"], "alice");
    }

    #[tokio::test]
    async fn test_update_rolling_refreshes_timestamp() {
        let f = fixture(true);
        f.store.ensure_schema().await.unwrap();
        f.store.create("abc").await.unwrap();

        f.clock.advance(chrono::Duration::minutes(5));
        f.store
            .update("abc", &data("n", serde_json::json!(1)))
            .await
            .unwrap();

        let doc = f.store.retrieve("abc").await.unwrap().unwrap();
        assert_eq!(doc.last_accessed, f.clock.now());
        assert_eq!(doc.data["n"], 1);
    }

    #[tokio::test]
    async fn test_update_fixed_keeps_creation_timestamp() {
        let f = fixture(false);
        f.store.ensure_schema().await.unwrap();
        let created = f.clock.now();
        f.store.create("abc").await.unwrap();

        f.clock.advance(chrono::Duration::minutes(5));
        f.store
            .update("abc", &data("n", serde_json::json!(1)))
            .await
            .unwrap();

        let doc = f.store.retrieve("abc").await.unwrap().unwrap();
        assert_eq!(doc.last_accessed, created);
        assert_eq!(doc.data["n"], 1);
    }

    #[tokio::test]
    async fn test_update_replaces_data_wholesale() {
        let f = fixture(true);
        f.store.ensure_schema().await.unwrap();
        f.store.create("abc").await.unwrap();
        f.store
            .update("abc", &data("a", serde_json::json!(1)))
            .await
            .unwrap();
        f.store
            .update("abc", &data("b", serde_json::json!(2)))
            .await
            .unwrap();

        let doc = f.store.retrieve("abc").await.unwrap().unwrap();
        assert!(!doc.data.contains_key("a"));
        assert_eq!(doc.data["b"], 2);
    }

    #[tokio::test]
    async fn test_delete_expired() {
        let f = fixture(true);
        f.store.ensure_schema().await.unwrap();
        let start = f.clock.now();

        f.store.create("old").await.unwrap();
        f.clock.advance(chrono::Duration::minutes(90));
        f.store.create("recent").await.unwrap();
        f.clock.advance(chrono::Duration::minutes(30));

        let cutoff = f.clock.now() - chrono::Duration::hours(1);
        assert!(start < cutoff);

        assert_eq!(f.store.delete_expired(cutoff).await.unwrap(), 1);
        assert!(f.store.retrieve("old").await.unwrap().is_none());
        assert!(f.store.retrieve("recent").await.unwrap().is_some());
        assert_eq!(f.store.count().await.unwrap(), 1);
    }

    struct FailingBackend;

    #[async_trait]
    impl DocumentBackend for FailingBackend {
        async fn database_exists(&self, _: &str) -> SessionResult<bool> {
            Ok(true)
        }
        async fn create_database(&self, _: &str) -> SessionResult<WriteResult> {
            Ok(WriteResult::default())
        }
        async fn table_exists(&self, _: &StoreLocation) -> SessionResult<bool> {
            Ok(true)
        }
        async fn create_table(&self, _: &StoreLocation) -> SessionResult<WriteResult> {
            Ok(WriteResult::default())
        }
        async fn index_exists(&self, _: &StoreLocation) -> SessionResult<bool> {
            Ok(false)
        }
        async fn create_index(&self, _: &StoreLocation) -> SessionResult<WriteResult> {
            Ok(WriteResult::error("index build failed"))
        }
        async fn get(&self, _: &StoreLocation, _: &str) -> SessionResult<Option<SessionDocument>> {
            Err(SessionError::Connection("store unreachable".into()))
        }
        async fn insert(&self, _: &StoreLocation, _: &SessionDocument) -> SessionResult<WriteResult> {
            Ok(WriteResult::error("disk full"))
        }
        async fn update(
            &self,
            _: &StoreLocation,
            _: &str,
            _: &DocumentPatch,
        ) -> SessionResult<WriteResult> {
            Ok(WriteResult::error("disk full"))
        }
        async fn delete_before(
            &self,
            _: &StoreLocation,
            _: DateTime<Utc>,
        ) -> SessionResult<WriteResult> {
            let mut result = WriteResult {
                deleted: 3,
                ..Default::default()
            };
            result.push_error("replica unavailable");
            Ok(result)
        }
        async fn count(&self, _: &StoreLocation) -> SessionResult<usize> {
            Ok(0)
        }
    }

    #[tokio::test]
    async fn test_reported_errors_become_store_errors() {
        let config = SessionConfig::builder()
            .with_connection(Arc::new(FailingBackend))
            .with_cryptography(CryptographyConfig::random().unwrap())
            .build()
            .unwrap();
        let store = DocumentSessionStore::new(&config);

        assert!(matches!(store.ensure_schema().await, Err(SessionError::Store(_))));
        assert!(matches!(store.create("a").await, Err(SessionError::Store(_))));
        assert!(matches!(store.touch_last_accessed("a").await, Err(SessionError::Store(_))));
        assert!(matches!(
            store.update("a", &SessionData::new()).await,
            Err(SessionError::Store(_))
        ));
        assert!(matches!(
            store.delete_expired(Utc::now()).await,
            Err(SessionError::Store(_))
        ));
        assert!(matches!(store.retrieve("a").await, Err(SessionError::Connection(_))));
    }
}
