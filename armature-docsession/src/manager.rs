//! Loading and saving sessions around a request.

use crate::clock::Clock;
use crate::codec::CookieCodec;
use crate::config::SessionConfig;
use crate::cookie::{append_set_cookie, read_cookie};
use crate::document::generate_session_id;
use crate::error::{SessionError, SessionResult};
use crate::session::Session;
use crate::store::{DocumentSessionStore, SessionStore};
use chrono::{DateTime, Utc};
use http::HeaderMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use tracing::{debug, info, warn};

/// `last_expiry_check` value meaning no sweep has run yet.
const NEVER_CHECKED: i64 = i64::MIN;

/// Binds requests to stored sessions through the session cookie.
///
/// One instance per application, shared between requests.
///
/// # Examples
///
/// ```
/// use armature_docsession::*;
/// use http::HeaderMap;
/// use std::sync::Arc;
///
/// # tokio_test::block_on(async {
/// let config = SessionConfig::builder()
///     .with_connection(Arc::new(MemoryBackend::new()))
///     .with_cryptography(CryptographyConfig::random().unwrap())
///     .build()
///     .unwrap();
/// let manager = SessionManager::enable(config).await.unwrap();
///
/// // Before the handler runs
/// let mut session = manager.load(&HeaderMap::new()).await.unwrap();
/// session.set("user_id", 42).unwrap();
///
/// // After the handler ran
/// let mut response_headers = HeaderMap::new();
/// assert!(manager.save(Some(&session), &mut response_headers).await.unwrap());
/// assert!(response_headers.contains_key(http::header::SET_COOKIE));
/// # });
/// ```
pub struct SessionManager {
    config: Arc<SessionConfig>,
    store: Arc<dyn SessionStore>,
    codec: CookieCodec,
    clock: Arc<dyn Clock>,
    expiry: chrono::Duration,
    expiry_check_frequency_ms: i64,
    /// Epoch milliseconds of the last sweep.
    last_expiry_check: AtomicI64,
}

impl SessionManager {
    /// Manager over a [`DocumentSessionStore`] built from `config`.
    ///
    /// The schema is not touched; see [`SessionManager::enable`].
    pub fn new(config: SessionConfig) -> SessionResult<Self> {
        let store = Arc::new(DocumentSessionStore::new(&config));
        Self::with_store(config, store)
    }

    /// Manager over any [`SessionStore`].
    pub fn with_store(config: SessionConfig, store: Arc<dyn SessionStore>) -> SessionResult<Self> {
        let expiry = chrono::Duration::from_std(config.expiry)
            .map_err(|_| SessionError::Config("Session expiry is out of range".to_string()))?;
        let expiry_check_frequency_ms =
            i64::try_from(config.expiry_check_frequency.as_millis()).unwrap_or(i64::MAX);

        Ok(Self {
            codec: CookieCodec::new(config.cryptography.clone()),
            clock: Arc::clone(&config.clock),
            config: Arc::new(config),
            store,
            expiry,
            expiry_check_frequency_ms,
            last_expiry_check: AtomicI64::new(NEVER_CHECKED),
        })
    }

    /// Build the manager and make sure the schema exists.
    pub async fn enable(config: SessionConfig) -> SessionResult<Self> {
        let manager = Self::new(config)?;
        manager.store.ensure_schema().await?;
        info!(
            database = %manager.config.database,
            table = %manager.config.table,
            rolling = manager.config.use_rolling_sessions,
            "Document sessions enabled"
        );
        Ok(manager)
    }

    /// The configuration in use.
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// The underlying store.
    pub fn store(&self) -> &Arc<dyn SessionStore> {
        &self.store
    }

    /// The cookie codec.
    pub fn codec(&self) -> &CookieCodec {
        &self.codec
    }

    /// Load the session for an incoming request.
    ///
    /// A missing, invalid or stale cookie yields a brand-new empty session.
    /// Store failures are returned.
    pub async fn load(&self, request_headers: &HeaderMap) -> SessionResult<Session> {
        self.expire_old_sessions().await?;

        let Some(cookie) = read_cookie(request_headers, &self.config.cookie.name) else {
            return self.new_session().await;
        };

        let Some(session_id) = self.codec.decode(&cookie) else {
            debug!("Session cookie rejected, starting a new session");
            return self.new_session().await;
        };

        let Some(document) = self.store.retrieve(&session_id).await? else {
            debug!("Session cookie refers to a missing session, starting a new session");
            return self.new_session().await;
        };

        if self.config.use_rolling_sessions {
            self.store.touch_last_accessed(&document.id).await?;
        }

        Ok(Session::from_document(document))
    }

    /// Persist a changed session and attach its cookie to the response.
    ///
    /// Returns `true` when a write happened. Unchanged (or absent) sessions
    /// are left alone and get no cookie.
    pub async fn save(
        &self,
        session: Option<&Session>,
        response_headers: &mut HeaderMap,
    ) -> SessionResult<bool> {
        self.expire_old_sessions().await?;

        let Some(session) = session.filter(|s| s.is_changed()) else {
            return Ok(false);
        };

        let Some(session_id) = session.id() else {
            warn!("Changed session has no id, skipping save");
            return Ok(false);
        };

        self.store.update(session_id, session.data()).await?;

        let cookie = self.codec.encode(session_id)?;
        append_set_cookie(response_headers, &self.config.cookie, &cookie)?;
        Ok(true)
    }

    /// [`SessionManager::load`] for an `http::Request`.
    pub async fn load_request<B>(&self, request: &http::Request<B>) -> SessionResult<Session> {
        self.load(request.headers()).await
    }

    /// [`SessionManager::save`] for an `http::Response`.
    pub async fn save_response<B>(
        &self,
        session: Option<&Session>,
        response: &mut http::Response<B>,
    ) -> SessionResult<bool> {
        self.save(session, response.headers_mut()).await
    }

    /// Delete expired sessions, at most once per `expiry_check_frequency`.
    ///
    /// Returns whether a sweep ran. The check timestamp is claimed with a
    /// compare-exchange before deleting, so concurrent callers that observe
    /// the same stale timestamp do not all sweep.
    pub async fn expire_old_sessions(&self) -> SessionResult<bool> {
        let now = self.clock.now();
        let now_ms = now.timestamp_millis();
        let last = self.last_expiry_check.load(Ordering::Acquire);

        if now_ms.saturating_sub(last) <= self.expiry_check_frequency_ms {
            return Ok(false);
        }

        if self
            .last_expiry_check
            .compare_exchange(last, now_ms, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("Expiry sweep claimed by a concurrent request");
            return Ok(false);
        }

        // An expiry reaching past the representable range expires nothing.
        let cutoff = now
            .checked_sub_signed(self.expiry)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let deleted = self.store.delete_expired(cutoff).await?;
        if deleted > 0 {
            info!(deleted, cutoff = %cutoff, "Expired sessions removed");
        } else {
            debug!(cutoff = %cutoff, "Expiry sweep found nothing to remove");
        }

        Ok(true)
    }

    async fn new_session(&self) -> SessionResult<Session> {
        let session_id = generate_session_id();
        self.store.create(&session_id).await?;
        debug!("New session created");
        Ok(Session::new(session_id))
    }
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("config", &self.config)
            .field(
                "last_expiry_check",
                &self.last_expiry_check.load(Ordering::Relaxed),
            )
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::crypto::CryptographyConfig;
    use crate::document::{SessionData, SessionDocument};
    use crate::memory::MemoryBackend;
    use http::header::{COOKIE, HeaderValue, SET_COOKIE};
    use std::time::Duration;

    struct Fixture {
        manager: SessionManager,
        clock: Arc<ManualClock>,
    }

    async fn fixture(rolling: bool) -> Fixture {
        let clock = Arc::new(ManualClock::default());
        let config = SessionConfig::builder()
            .with_connection(Arc::new(MemoryBackend::new()))
            .with_cryptography(CryptographyConfig::random().unwrap())
            .with_clock(clock.clone())
            .with_rolling_sessions(rolling)
            .with_expiry(Duration::from_secs(3600))
            .with_expiry_check_frequency(Duration::from_secs(60))
            .build()
            .unwrap();

        Fixture {
            manager: SessionManager::enable(config).await.unwrap(),
            clock,
        }
    }

    fn cookie_from(response: &HeaderMap) -> HeaderMap {
        let set_cookie = response.get(SET_COOKIE).unwrap().to_str().unwrap();
        let pair = set_cookie.split(';').next().unwrap();
        let mut request = HeaderMap::new();
        request.insert(COOKIE, HeaderValue::from_str(pair).unwrap());
        request
    }

    #[tokio::test]
    async fn test_load_without_cookie_creates_session() {
        let f = fixture(true).await;
        let session = f.manager.load(&HeaderMap::new()).await.unwrap();

        assert!(session.is_empty());
        let id = session.id().unwrap();
        assert!(f.manager.store().retrieve(id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_save_then_load_roundtrip() {
        let f = fixture(true).await;
        let mut session = f.manager.load(&HeaderMap::new()).await.unwrap();
        session.set("user", "alice").unwrap();

        let mut response = HeaderMap::new();
        assert!(f.manager.save(Some(&session), &mut response).await.unwrap());
        assert_eq!(response.get_all(SET_COOKIE).iter().count(), 1);

        let loaded = f.manager.load(&cookie_from(&response)).await.unwrap();
        assert_eq!(loaded.id(), session.id());
        assert_eq!(loaded.get::<String>("user").as_deref(), Some("alice"));
        assert!(!loaded.is_changed());
    }

    #[tokio::test]
    async fn test_unchanged_or_absent_session_is_not_saved() {
        let f = fixture(true).await;
        let session = f.manager.load(&HeaderMap::new()).await.unwrap();

        let mut response = HeaderMap::new();
        assert!(!f.manager.save(Some(&session), &mut response).await.unwrap());
        assert!(!f.manager.save(None, &mut response).await.unwrap());
        assert!(response.is_empty());
    }

    #[tokio::test]
    async fn test_changed_session_without_id_is_skipped() {
        let f = fixture(true).await;
        let mut session = Session::detached();
        session.set("k", 1).unwrap();

        let mut response = HeaderMap::new();
        assert!(!f.manager.save(Some(&session), &mut response).await.unwrap());
        assert!(response.is_empty());
    }

    #[tokio::test]
    async fn test_garbage_cookie_starts_new_session() {
        let f = fixture(true).await;
        let mut request = HeaderMap::new();
        request.insert(COOKIE, HeaderValue::from_static("_nsid=not-a-real-cookie"));

        let session = f.manager.load(&request).await.unwrap();
        assert!(session.is_empty());
        assert!(session.id().is_some());
    }

    #[tokio::test]
    async fn test_rolling_load_touches_document() {
        let f = fixture(true).await;
        let mut session = f.manager.load(&HeaderMap::new()).await.unwrap();
        session.set("k", 1).unwrap();
        let mut response = HeaderMap::new();
        f.manager.save(Some(&session), &mut response).await.unwrap();

        f.clock.advance(chrono::Duration::minutes(10));
        f.manager.load(&cookie_from(&response)).await.unwrap();

        let doc = f
            .manager
            .store()
            .retrieve(session.id().unwrap())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(doc.last_accessed, f.clock.now());
    }

    #[tokio::test]
    async fn test_fixed_load_keeps_creation_time() {
        let f = fixture(false).await;
        let created = f.clock.now();
        let mut session = f.manager.load(&HeaderMap::new()).await.unwrap();
        session.set("k", 1).unwrap();
        let mut response = HeaderMap::new();
        f.manager.save(Some(&session), &mut response).await.unwrap();

        f.clock.advance(chrono::Duration::minutes(10));
        f.manager.load(&cookie_from(&response)).await.unwrap();

        let doc = f
            .manager
            .store()
            .retrieve(session.id().unwrap())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(doc.last_accessed, created);
    }

    #[tokio::test]
    async fn test_sweep_throttle() {
        let f = fixture(true).await;

        // First check after startup always sweeps.
        assert!(f.manager.expire_old_sessions().await.unwrap());
        assert!(!f.manager.expire_old_sessions().await.unwrap());

        f.clock.advance(chrono::Duration::seconds(60));
        assert!(!f.manager.expire_old_sessions().await.unwrap());

        f.clock.advance(chrono::Duration::milliseconds(1));
        assert!(f.manager.expire_old_sessions().await.unwrap());
        assert!(!f.manager.expire_old_sessions().await.unwrap());
    }

    #[tokio::test]
    async fn test_http_hooks() {
        let f = fixture(true).await;
        let request = http::Request::builder().uri("/").body(()).unwrap();
        let mut session = f.manager.load_request(&request).await.unwrap();
        session.set("n", 1).unwrap();

        let mut response = http::Response::new(());
        assert!(
            f.manager
                .save_response(Some(&session), &mut response)
                .await
                .unwrap()
        );
        assert!(response.headers().contains_key(SET_COOKIE));
    }

    #[tokio::test]
    async fn test_huge_expiry_does_not_overflow_cutoff() {
        let config = SessionConfig::builder()
            .with_connection(Arc::new(MemoryBackend::new()))
            .with_cryptography(CryptographyConfig::random().unwrap())
            .with_expiry(Duration::from_secs(10_000_000_000_000))
            .build()
            .unwrap();
        let manager = SessionManager::enable(config).await.unwrap();

        let session = manager.load(&HeaderMap::new()).await.unwrap();
        assert!(
            manager
                .store()
                .retrieve(session.id().unwrap())
                .await
                .unwrap()
                .is_some()
        );
    }

    /// Store whose selected operations fail.
    #[derive(Default)]
    struct FailingStore {
        fail_retrieve: bool,
        fail_update: bool,
        fail_sweep: bool,
    }

    fn store_down() -> SessionError {
        SessionError::Connection("store unavailable".to_string())
    }

    #[async_trait::async_trait]
    impl SessionStore for FailingStore {
        async fn ensure_schema(&self) -> SessionResult<()> {
            Ok(())
        }

        async fn create(&self, _: &str) -> SessionResult<()> {
            Ok(())
        }

        async fn retrieve(&self, id: &str) -> SessionResult<Option<SessionDocument>> {
            if self.fail_retrieve {
                return Err(store_down());
            }
            Ok(Some(SessionDocument::new(id, chrono::Utc::now())))
        }

        async fn touch_last_accessed(&self, _: &str) -> SessionResult<()> {
            Ok(())
        }

        async fn update(&self, _: &str, _: &SessionData) -> SessionResult<()> {
            if self.fail_update {
                return Err(store_down());
            }
            Ok(())
        }

        async fn delete_expired(&self, _: chrono::DateTime<chrono::Utc>) -> SessionResult<usize> {
            if self.fail_sweep {
                return Err(store_down());
            }
            Ok(0)
        }

        async fn count(&self) -> SessionResult<usize> {
            Ok(0)
        }
    }

    fn failing_manager(store: FailingStore) -> SessionManager {
        let config = SessionConfig::builder()
            .with_connection(Arc::new(MemoryBackend::new()))
            .with_cryptography(CryptographyConfig::random().unwrap())
            .build()
            .unwrap();
        SessionManager::with_store(config, Arc::new(store)).unwrap()
    }

    fn valid_cookie(manager: &SessionManager, id: &str) -> HeaderMap {
        let value = manager.codec().encode(id).unwrap();
        let mut headers = HeaderMap::new();
        headers.insert(
            COOKIE,
            HeaderValue::from_str(&format!("_nsid={}", value)).unwrap(),
        );
        headers
    }

    #[tokio::test]
    async fn test_load_propagates_retrieve_failure() {
        let manager = failing_manager(FailingStore {
            fail_retrieve: true,
            ..Default::default()
        });

        let result = manager.load(&valid_cookie(&manager, "abc")).await;
        assert!(matches!(result, Err(SessionError::Connection(_))));
    }

    #[tokio::test]
    async fn test_save_propagates_update_failure() {
        let manager = failing_manager(FailingStore {
            fail_update: true,
            ..Default::default()
        });

        let mut session = manager.load(&valid_cookie(&manager, "abc")).await.unwrap();
        assert_eq!(session.id(), Some("abc"));
        session.set("k", 1).unwrap();

        let mut response = HeaderMap::new();
        assert!(manager.save(Some(&session), &mut response).await.is_err());
        assert!(response.get(SET_COOKIE).is_none());
    }

    #[tokio::test]
    async fn test_sweep_failure_surfaces_from_load() {
        let manager = failing_manager(FailingStore {
            fail_sweep: true,
            ..Default::default()
        });

        assert!(manager.load(&HeaderMap::new()).await.is_err());
    }
}
