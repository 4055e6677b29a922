//! Remote document store abstraction.
//!
//! A [`DocumentBackend`] is the thin I/O surface the session store needs:
//! schema existence checks and creation, point reads, inserts, field patches
//! and a range delete over the `lastAccessed` index. Writes report their
//! outcome as a [`WriteResult`] instead of failing outright, mirroring how
//! document databases report per-document errors.

use crate::document::{SessionData, SessionDocument};
use crate::error::{SessionError, SessionResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Where session documents live.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StoreLocation {
    /// Database (namespace) name
    pub database: String,
    /// Table (collection) name
    pub table: String,
    /// Name of the secondary index on `lastAccessed`
    pub index: String,
}

impl StoreLocation {
    /// Build a location.
    pub fn new(
        database: impl Into<String>,
        table: impl Into<String>,
        index: impl Into<String>,
    ) -> Self {
        Self {
            database: database.into(),
            table: table.into(),
            index: index.into(),
        }
    }
}

impl std::fmt::Display for StoreLocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.database, self.table)
    }
}

/// Outcome counters of a write.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteResult {
    /// Objects created (documents, tables, databases, indexes)
    pub inserted: usize,
    /// Documents modified
    pub replaced: usize,
    /// Documents matched but left identical
    pub unchanged: usize,
    /// Documents that did not exist
    pub skipped: usize,
    /// Documents removed
    pub deleted: usize,
    /// Failed objects
    pub errors: usize,
    /// Text of the first failure, if any
    pub first_error: Option<String>,
}

impl WriteResult {
    /// A result holding a single failure.
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            errors: 1,
            first_error: Some(message.into()),
            ..Default::default()
        }
    }

    /// Record one more failure, keeping the first message.
    pub fn push_error(&mut self, message: impl Into<String>) {
        self.errors += 1;
        if self.first_error.is_none() {
            self.first_error = Some(message.into());
        }
    }

    /// Whether no errors were reported.
    pub fn is_ok(&self) -> bool {
        self.errors == 0
    }

    /// Turn a result with `errors > 0` into a [`SessionError::Store`].
    pub fn into_result(self, operation: &str) -> SessionResult<Self> {
        if self.is_ok() {
            return Ok(self);
        }

        Err(SessionError::Store(format!(
            "{} reported {} error(s): {}",
            operation,
            self.errors,
            self.first_error.as_deref().unwrap_or("unknown error")
        )))
    }
}

/// Fields to change on an existing document. `None` leaves a field alone.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DocumentPatch {
    /// Replacement payload
    pub data: Option<SessionData>,
    /// New access timestamp
    pub last_accessed: Option<DateTime<Utc>>,
}

impl DocumentPatch {
    /// Patch touching only `lastAccessed`.
    pub fn touch(at: DateTime<Utc>) -> Self {
        Self {
            data: None,
            last_accessed: Some(at),
        }
    }

    /// Apply the patch to a document; returns whether anything changed.
    pub fn apply(&self, document: &mut SessionDocument) -> bool {
        let mut changed = false;

        if let Some(data) = &self.data
            && &document.data != data
        {
            document.data = data.clone();
            changed = true;
        }

        if let Some(at) = self.last_accessed
            && document.last_accessed != at
        {
            document.last_accessed = at;
            changed = true;
        }

        changed
    }
}

/// The remote document store the sessions are persisted in.
///
/// Implementations must be safe to share between concurrent requests; any
/// pooling or multiplexing is the client library's business.
#[async_trait]
pub trait DocumentBackend: Send + Sync {
    /// Check whether a database exists.
    async fn database_exists(&self, database: &str) -> SessionResult<bool>;

    /// Create a database. Creating an existing one reports an error.
    async fn create_database(&self, database: &str) -> SessionResult<WriteResult>;

    /// Check whether the session table exists.
    async fn table_exists(&self, location: &StoreLocation) -> SessionResult<bool>;

    /// Create the session table.
    async fn create_table(&self, location: &StoreLocation) -> SessionResult<WriteResult>;

    /// Check whether the `lastAccessed` index exists.
    async fn index_exists(&self, location: &StoreLocation) -> SessionResult<bool>;

    /// Create the `lastAccessed` index.
    async fn create_index(&self, location: &StoreLocation) -> SessionResult<WriteResult>;

    /// Point lookup. A miss is `Ok(None)`.
    async fn get(
        &self,
        location: &StoreLocation,
        id: &str,
    ) -> SessionResult<Option<SessionDocument>>;

    /// Insert a new document. Duplicate ids report an error.
    async fn insert(
        &self,
        location: &StoreLocation,
        document: &SessionDocument,
    ) -> SessionResult<WriteResult>;

    /// Patch fields of an existing document. A missing document is `skipped`.
    async fn update(
        &self,
        location: &StoreLocation,
        id: &str,
        patch: &DocumentPatch,
    ) -> SessionResult<WriteResult>;

    /// Delete every document whose `lastAccessed` is strictly before `cutoff`.
    async fn delete_before(
        &self,
        location: &StoreLocation,
        cutoff: DateTime<Utc>,
    ) -> SessionResult<WriteResult>;

    /// Number of session documents.
    async fn count(&self, location: &StoreLocation) -> SessionResult<usize>;
}
