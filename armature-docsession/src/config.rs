//! Session configuration.

use crate::backend::{DocumentBackend, StoreLocation};
use crate::clock::{Clock, SystemClock};
use crate::crypto::CryptographyConfig;
use crate::error::{SessionError, SessionResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Default database (namespace) name.
pub const DEFAULT_DATABASE: &str = "NancySession";

/// Default table (collection) name.
pub const DEFAULT_TABLE: &str = "Session";

/// Default name of the `lastAccessed` index.
pub const DEFAULT_INDEX: &str = "lastAccessed";

/// Default session cookie name.
pub const DEFAULT_COOKIE_NAME: &str = "_nsid";

/// Prefix of the environment variables read by [`SessionSettings::from_env`].
pub const ENV_PREFIX: &str = "ARMATURE_SESSION";

/// Cookie SameSite attribute
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SameSite {
    Strict,
    Lax,
    None,
}

impl SameSite {
    /// Attribute value as written in `Set-Cookie`
    pub fn as_str(&self) -> &'static str {
        match self {
            SameSite::Strict => "Strict",
            SameSite::Lax => "Lax",
            SameSite::None => "None",
        }
    }
}

/// Attributes of the session cookie.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CookieSettings {
    /// Cookie name
    pub name: String,
    /// Cookie domain
    pub domain: Option<String>,
    /// Cookie path
    pub path: String,
    /// Cookie secure flag (HTTPS only)
    pub secure: bool,
    /// Cookie HttpOnly flag
    pub http_only: bool,
    /// Cookie SameSite policy
    pub same_site: SameSite,
}

impl Default for CookieSettings {
    fn default() -> Self {
        Self {
            name: DEFAULT_COOKIE_NAME.to_string(),
            domain: None,
            path: "/".to_string(),
            secure: false,
            http_only: true,
            same_site: SameSite::Lax,
        }
    }
}

/// Validated, immutable session configuration.
///
/// Built once per application with [`SessionConfig::builder`] and shared
/// read-only between requests.
#[derive(Clone)]
pub struct SessionConfig {
    /// Database (namespace) holding the session table
    pub database: String,
    /// Session table (collection) name
    pub table: String,
    /// Name of the `lastAccessed` index
    pub index: String,
    /// Renew `lastAccessed` on every load
    pub use_rolling_sessions: bool,
    /// How long a session lives after its last renewal
    pub expiry: Duration,
    /// Minimum time between two expiry sweeps
    pub expiry_check_frequency: Duration,
    /// Session cookie attributes
    pub cookie: CookieSettings,
    /// Encryption and HMAC providers
    pub cryptography: CryptographyConfig,
    /// Document store connection
    pub connection: Arc<dyn DocumentBackend>,
    /// Time source
    pub clock: Arc<dyn Clock>,
}

impl SessionConfig {
    /// Start building a configuration.
    ///
    /// # Examples
    ///
    /// ```
    /// use armature_docsession::{CryptographyConfig, MemoryBackend, SessionConfig};
    /// use std::sync::Arc;
    /// use std::time::Duration;
    ///
    /// let config = SessionConfig::builder()
    ///     .with_connection(Arc::new(MemoryBackend::new()))
    ///     .with_cryptography(CryptographyConfig::random().unwrap())
    ///     .with_expiry(Duration::from_secs(3600))
    ///     .with_cookie_name("sid")
    ///     .build()
    ///     .unwrap();
    ///
    /// assert_eq!(config.table, "Session");
    /// assert!(config.use_rolling_sessions);
    /// ```
    pub fn builder() -> SessionConfigBuilder {
        SessionConfigBuilder::default()
    }

    /// Where the session documents are stored.
    pub fn location(&self) -> StoreLocation {
        StoreLocation::new(&self.database, &self.table, &self.index)
    }
}

impl fmt::Debug for SessionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionConfig")
            .field("database", &self.database)
            .field("table", &self.table)
            .field("index", &self.index)
            .field("use_rolling_sessions", &self.use_rolling_sessions)
            .field("expiry", &self.expiry)
            .field("expiry_check_frequency", &self.expiry_check_frequency)
            .field("cookie", &self.cookie)
            .field("cryptography", &self.cryptography)
            .field("clock", &self.clock)
            .finish_non_exhaustive()
    }
}

/// Builder for [`SessionConfig`].
pub struct SessionConfigBuilder {
    database: String,
    table: String,
    index: String,
    use_rolling_sessions: bool,
    expiry: Duration,
    expiry_check_frequency: Duration,
    cookie: CookieSettings,
    cryptography: Option<CryptographyConfig>,
    connection: Option<Arc<dyn DocumentBackend>>,
    clock: Arc<dyn Clock>,
}

impl Default for SessionConfigBuilder {
    fn default() -> Self {
        Self {
            database: DEFAULT_DATABASE.to_string(),
            table: DEFAULT_TABLE.to_string(),
            index: DEFAULT_INDEX.to_string(),
            use_rolling_sessions: true,
            expiry: Duration::from_secs(2 * 60 * 60), // 2 hours
            expiry_check_frequency: Duration::from_secs(60), // 1 minute
            cookie: CookieSettings::default(),
            cryptography: None,
            connection: None,
            clock: Arc::new(SystemClock),
        }
    }
}

impl SessionConfigBuilder {
    /// Set the database name
    pub fn with_database(mut self, database: impl Into<String>) -> Self {
        self.database = database.into();
        self
    }

    /// Set the table name
    pub fn with_table(mut self, table: impl Into<String>) -> Self {
        self.table = table.into();
        self
    }

    /// Set the `lastAccessed` index name
    pub fn with_index(mut self, index: impl Into<String>) -> Self {
        self.index = index.into();
        self
    }

    /// Enable or disable rolling expiry
    pub fn with_rolling_sessions(mut self, enabled: bool) -> Self {
        self.use_rolling_sessions = enabled;
        self
    }

    /// Set the session lifetime
    pub fn with_expiry(mut self, expiry: Duration) -> Self {
        self.expiry = expiry;
        self
    }

    /// Set the minimum time between expiry sweeps
    pub fn with_expiry_check_frequency(mut self, frequency: Duration) -> Self {
        self.expiry_check_frequency = frequency;
        self
    }

    /// Set cookie name
    pub fn with_cookie_name(mut self, name: impl Into<String>) -> Self {
        self.cookie.name = name.into();
        self
    }

    /// Set cookie domain
    pub fn with_cookie_domain(mut self, domain: impl Into<String>) -> Self {
        self.cookie.domain = Some(domain.into());
        self
    }

    /// Set cookie path
    pub fn with_cookie_path(mut self, path: impl Into<String>) -> Self {
        self.cookie.path = path.into();
        self
    }

    /// Set cookie secure flag
    pub fn with_cookie_secure(mut self, secure: bool) -> Self {
        self.cookie.secure = secure;
        self
    }

    /// Set cookie HttpOnly flag
    pub fn with_cookie_http_only(mut self, http_only: bool) -> Self {
        self.cookie.http_only = http_only;
        self
    }

    /// Set cookie SameSite policy
    pub fn with_cookie_same_site(mut self, same_site: SameSite) -> Self {
        self.cookie.same_site = same_site;
        self
    }

    /// Set the encryption and HMAC providers
    pub fn with_cryptography(mut self, cryptography: CryptographyConfig) -> Self {
        self.cryptography = Some(cryptography);
        self
    }

    /// Set the document store connection
    pub fn with_connection(mut self, connection: Arc<dyn DocumentBackend>) -> Self {
        self.connection = Some(connection);
        self
    }

    /// Replace the time source
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Apply every value present in `settings`.
    pub fn with_settings(mut self, settings: &SessionSettings) -> Self {
        if let Some(database) = &settings.database {
            self.database = database.clone();
        }
        if let Some(table) = &settings.table {
            self.table = table.clone();
        }
        if let Some(rolling) = settings.use_rolling_sessions {
            self.use_rolling_sessions = rolling;
        }
        if let Some(secs) = settings.expiry_secs {
            self.expiry = Duration::from_secs(secs);
        }
        if let Some(secs) = settings.expiry_check_frequency_secs {
            self.expiry_check_frequency = Duration::from_secs(secs);
        }
        if let Some(name) = &settings.cookie_name {
            self.cookie.name = name.clone();
        }
        if let Some(domain) = &settings.cookie_domain {
            self.cookie.domain = Some(domain.clone());
        }
        if let Some(path) = &settings.cookie_path {
            self.cookie.path = path.clone();
        }
        if let Some(secure) = settings.cookie_secure {
            self.cookie.secure = secure;
        }
        self
    }

    /// Validate and build.
    pub fn build(self) -> SessionResult<SessionConfig> {
        for (field, value) in [
            ("database", &self.database),
            ("table", &self.table),
            ("index", &self.index),
            ("cookie name", &self.cookie.name),
            ("cookie path", &self.cookie.path),
        ] {
            if value.trim().is_empty() {
                return Err(SessionError::Config(format!("Session {} must not be empty", field)));
            }
        }

        if self.expiry.is_zero() {
            return Err(SessionError::Config(
                "Session expiry must be greater than zero".to_string(),
            ));
        }

        chrono::Duration::from_std(self.expiry)
            .map_err(|_| SessionError::Config("Session expiry is out of range".to_string()))?;

        let connection = self.connection.ok_or_else(|| {
            SessionError::Config("A document store connection is required".to_string())
        })?;
        let cryptography = self.cryptography.ok_or_else(|| {
            SessionError::Config("A cryptography configuration is required".to_string())
        })?;

        Ok(SessionConfig {
            database: self.database,
            table: self.table,
            index: self.index,
            use_rolling_sessions: self.use_rolling_sessions,
            expiry: self.expiry,
            expiry_check_frequency: self.expiry_check_frequency,
            cookie: self.cookie,
            cryptography,
            connection,
            clock: self.clock,
        })
    }
}

/// Plain, optional session settings loaded from a file or the environment.
///
/// ```toml
/// database = "MyApp"
/// table = "Sessions"
/// use_rolling_sessions = false
/// expiry_secs = 3600
/// expiry_check_frequency_secs = 30
/// cookie_name = "sid"
/// cookie_secure = true
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SessionSettings {
    /// Database name (`ARMATURE_SESSION_DATABASE`)
    pub database: Option<String>,
    /// Table name (`ARMATURE_SESSION_TABLE`)
    pub table: Option<String>,
    /// Rolling expiry (`ARMATURE_SESSION_ROLLING`)
    pub use_rolling_sessions: Option<bool>,
    /// Session lifetime in seconds (`ARMATURE_SESSION_EXPIRY_SECS`)
    pub expiry_secs: Option<u64>,
    /// Seconds between expiry sweeps (`ARMATURE_SESSION_EXPIRY_CHECK_SECS`)
    pub expiry_check_frequency_secs: Option<u64>,
    /// Cookie name (`ARMATURE_SESSION_COOKIE_NAME`)
    pub cookie_name: Option<String>,
    /// Cookie domain (`ARMATURE_SESSION_COOKIE_DOMAIN`)
    pub cookie_domain: Option<String>,
    /// Cookie path (`ARMATURE_SESSION_COOKIE_PATH`)
    pub cookie_path: Option<String>,
    /// Cookie secure flag (`ARMATURE_SESSION_COOKIE_SECURE`)
    pub cookie_secure: Option<bool>,
}

impl SessionSettings {
    /// Parse TOML text.
    pub fn from_toml_str(text: &str) -> SessionResult<Self> {
        toml::from_str(text).map_err(|e| SessionError::Settings(e.to_string()))
    }

    /// Read and parse a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> SessionResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| SessionError::Settings(format!("{}: {}", path.display(), e)))?;
        Self::from_toml_str(&text)
    }

    /// Read `ARMATURE_SESSION_*` environment variables.
    pub fn from_env() -> SessionResult<Self> {
        Self::from_vars(std::env::vars())
    }

    /// Read settings from key/value pairs named like environment variables.
    ///
    /// Unrelated keys are ignored.
    pub fn from_vars<I, K, V>(vars: I) -> SessionResult<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<String>,
    {
        let mut settings = Self::default();

        for (key, value) in vars {
            let Some(name) = key
                .as_ref()
                .strip_prefix(ENV_PREFIX)
                .and_then(|rest| rest.strip_prefix('_'))
            else {
                continue;
            };
            let value: String = value.into();

            match name {
                "DATABASE" => settings.database = Some(value),
                "TABLE" => settings.table = Some(value),
                "ROLLING" => settings.use_rolling_sessions = Some(parse_bool(name, &value)?),
                "EXPIRY_SECS" => settings.expiry_secs = Some(parse_secs(name, &value)?),
                "EXPIRY_CHECK_SECS" => {
                    settings.expiry_check_frequency_secs = Some(parse_secs(name, &value)?)
                }
                "COOKIE_NAME" => settings.cookie_name = Some(value),
                "COOKIE_DOMAIN" => settings.cookie_domain = Some(value),
                "COOKIE_PATH" => settings.cookie_path = Some(value),
                "COOKIE_SECURE" => settings.cookie_secure = Some(parse_bool(name, &value)?),
                _ => {}
            }
        }

        Ok(settings)
    }
}

fn parse_bool(name: &str, value: &str) -> SessionResult<bool> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(SessionError::Settings(format!(
            "{}_{}: expected a boolean, got `{}`",
            ENV_PREFIX, name, other
        ))),
    }
}

fn parse_secs(name: &str, value: &str) -> SessionResult<u64> {
    value.trim().parse().map_err(|_| {
        SessionError::Settings(format!(
            "{}_{}: expected a number of seconds, got `{}`",
            ENV_PREFIX, name, value
        ))
    })
}
