//! CouchDB document backend.
//!
//! This module requires the `couchdb` feature flag.
//!
//! CouchDB has no namespace above databases, so a [`StoreLocation`] maps to a
//! single CouchDB database named `<database>_<table>` (lowercased). The
//! `lastAccessed` index is a design document whose view emits
//! `lastAccessed` (epoch milliseconds) as key and the revision as value,
//! which is all a range delete needs.

use crate::backend::{DocumentBackend, DocumentPatch, StoreLocation, WriteResult};
use crate::document::{SessionData, SessionDocument};
use crate::error::{SessionError, SessionResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, Method, RequestBuilder, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Name of the view inside the index design document.
const VIEW_NAME: &str = "by_last_accessed";

/// CouchDB document wrapper for sessions.
#[derive(Debug, Serialize, Deserialize)]
struct CouchDbSession {
    #[serde(rename = "_id")]
    id: String,
    #[serde(rename = "_rev", skip_serializing_if = "Option::is_none")]
    rev: Option<String>,
    #[serde(rename = "lastAccessed", with = "chrono::serde::ts_milliseconds")]
    last_accessed: DateTime<Utc>,
    #[serde(default)]
    data: SessionData,
}

impl CouchDbSession {
    fn from_document(document: &SessionDocument, rev: Option<String>) -> Self {
        Self {
            id: document.id.clone(),
            rev,
            last_accessed: document.last_accessed,
            data: document.data.clone(),
        }
    }

    fn into_document(self) -> SessionDocument {
        SessionDocument {
            id: self.id,
            last_accessed: self.last_accessed,
            data: self.data,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ViewResponse {
    #[serde(default)]
    total_rows: usize,
    #[serde(default)]
    rows: Vec<ViewRow>,
}

#[derive(Debug, Deserialize)]
struct ViewRow {
    id: String,
    value: String,
}

#[derive(Debug, Serialize)]
struct Tombstone<'a> {
    #[serde(rename = "_id")]
    id: &'a str,
    #[serde(rename = "_rev")]
    rev: &'a str,
    #[serde(rename = "_deleted")]
    deleted: bool,
}

#[derive(Debug, Deserialize)]
struct BulkResult {
    #[serde(default)]
    ok: bool,
    error: Option<String>,
    reason: Option<String>,
}

/// Attempts at a read-patch-write cycle before a conflict is reported.
const MAX_UPDATE_ATTEMPTS: usize = 3;

/// Classify the status of a single-document write.
fn write_outcome(status: StatusCode, body: &str, success: fn(&mut WriteResult)) -> WriteResult {
    if status.is_success() {
        let mut result = WriteResult::default();
        success(&mut result);
        return result;
    }

    let reason = match status {
        StatusCode::CONFLICT => "Document update conflict".to_string(),
        StatusCode::PRECONDITION_FAILED => "Database already exists".to_string(),
        _ => format!("CouchDB returned {}: {}", status, body),
    };
    WriteResult::error(reason)
}

/// Tally `_bulk_docs` deletion outcomes.
///
/// A `conflict` means the document was written after the view was read,
/// i.e. the session was renewed; it is skipped, not an error.
fn bulk_delete_outcome(outcomes: Vec<BulkResult>) -> WriteResult {
    let mut result = WriteResult::default();
    for outcome in outcomes {
        match outcome.error {
            Some(error) if !outcome.ok && error == "conflict" => result.skipped += 1,
            Some(error) if !outcome.ok => result.push_error(format!(
                "{}: {}",
                error,
                outcome.reason.unwrap_or_default()
            )),
            _ => result.deleted += 1,
        }
    }
    result
}

/// Design document defining the `lastAccessed` view.
fn design_document() -> serde_json::Value {
    serde_json::json!({
        "language": "javascript",
        "views": {
            VIEW_NAME: {
                "map": "function (doc) { if (typeof doc.lastAccessed === 'number') { emit(doc.lastAccessed, doc._rev); } }"
            }
        }
    })
}

/// CouchDB-backed document store.
///
/// # Feature Flag
///
/// This requires the `couchdb` feature (enabled by default):
///
/// ```toml
/// [dependencies]
/// armature-docsession = { version = "0.1", features = ["couchdb"] }
/// ```
///
/// # Examples
///
/// ```no_run
/// use armature_docsession::*;
/// use std::sync::Arc;
///
/// #[tokio::main]
/// async fn main() -> Result<(), SessionError> {
///     let backend = CouchDbBackend::new("http://localhost:5984")?
///         .with_auth("admin", "password");
///
///     let config = SessionConfig::builder()
///         .with_connection(Arc::new(backend))
///         .with_cryptography(CryptographyConfig::from_passphrase("s3cret phrase", b"app-salt")?)
///         .build()?;
///
///     let manager = SessionManager::enable(config).await?;
///     # let _ = manager;
///     Ok(())
/// }
/// ```
#[derive(Debug, Clone)]
pub struct CouchDbBackend {
    client: Client,
    url: String,
    username: Option<String>,
    password: Option<String>,
}

impl CouchDbBackend {
    /// Create a backend for the CouchDB server at `url`.
    pub fn new(url: &str) -> SessionResult<Self> {
        if !url.starts_with("http://") && !url.starts_with("https://") {
            return Err(SessionError::Config(
                "CouchDB URL must start with http:// or https://".to_string(),
            ));
        }

        let client = Client::builder()
            .build()
            .map_err(|e| SessionError::Connection(e.to_string()))?;

        Ok(Self {
            client,
            url: url.trim_end_matches('/').to_string(),
            username: None,
            password: None,
        })
    }

    /// Set CouchDB authentication credentials.
    pub fn with_auth(mut self, username: &str, password: &str) -> Self {
        self.username = Some(username.to_string());
        self.password = Some(password.to_string());
        self
    }

    /// Name of the CouchDB database holding `location`.
    pub fn database_name(location: &StoreLocation) -> String {
        format!("{}_{}", location.database, location.table).to_lowercase()
    }

    fn database_url(&self, location: &StoreLocation) -> String {
        format!(
            "{}/{}",
            self.url,
            urlencoding::encode(&Self::database_name(location))
        )
    }

    fn document_url(&self, location: &StoreLocation, id: &str) -> String {
        format!("{}/{}", self.database_url(location), urlencoding::encode(id))
    }

    fn design_url(&self, location: &StoreLocation) -> String {
        format!(
            "{}/_design/{}",
            self.database_url(location),
            urlencoding::encode(&location.index)
        )
    }

    fn view_url(&self, location: &StoreLocation) -> String {
        format!("{}/_view/{}", self.design_url(location), VIEW_NAME)
    }

    /// Build an authenticated request.
    fn request(&self, method: Method, url: &str) -> RequestBuilder {
        let mut request = self.client.request(method, url);

        if let (Some(username), Some(password)) = (&self.username, &self.password) {
            request = request.basic_auth(username, Some(password));
        }

        request
    }

    async fn send(&self, request: RequestBuilder) -> SessionResult<reqwest::Response> {
        request.send().await.map_err(|e| {
            if e.is_connect() || e.is_timeout() {
                SessionError::Connection(e.to_string())
            } else {
                SessionError::Http(e)
            }
        })
    }

    async fn exists(&self, url: &str) -> SessionResult<bool> {
        let response = self.send(self.request(Method::HEAD, url)).await?;
        match response.status() {
            status if status.is_success() => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            status => Err(SessionError::Store(format!(
                "Unexpected CouchDB status {} for {}",
                status, url
            ))),
        }
    }

    /// Map a write response to a [`WriteResult`].
    async fn write_result(
        response: reqwest::Response,
        success: fn(&mut WriteResult),
    ) -> WriteResult {
        let status = response.status();
        let body = if status.is_success() {
            String::new()
        } else {
            response.text().await.unwrap_or_default()
        };
        write_outcome(status, &body, success)
    }

    async fn get_raw(
        &self,
        location: &StoreLocation,
        id: &str,
    ) -> SessionResult<Option<CouchDbSession>> {
        let url = self.document_url(location, id);
        let response = self.send(self.request(Method::GET, &url)).await?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }

        if !response.status().is_success() {
            return Err(SessionError::Store(format!(
                "Failed to get session: {}",
                response.status()
            )));
        }

        let doc = response
            .json()
            .await
            .map_err(|e| SessionError::Deserialization(e.to_string()))?;
        Ok(Some(doc))
    }
}

#[async_trait]
impl DocumentBackend for CouchDbBackend {
    async fn database_exists(&self, _database: &str) -> SessionResult<bool> {
        // No namespace layer; the server being up is all there is to check.
        let response = self.send(self.request(Method::GET, &self.url)).await?;
        if !response.status().is_success() {
            return Err(SessionError::Connection(format!(
                "CouchDB server at {} answered {}",
                self.url,
                response.status()
            )));
        }
        Ok(true)
    }

    async fn create_database(&self, _database: &str) -> SessionResult<WriteResult> {
        Ok(WriteResult::default())
    }

    async fn table_exists(&self, location: &StoreLocation) -> SessionResult<bool> {
        self.exists(&self.database_url(location)).await
    }

    async fn create_table(&self, location: &StoreLocation) -> SessionResult<WriteResult> {
        let response = self
            .send(self.request(Method::PUT, &self.database_url(location)))
            .await?;
        Ok(Self::write_result(response, |r| r.inserted = 1).await)
    }

    async fn index_exists(&self, location: &StoreLocation) -> SessionResult<bool> {
        self.exists(&self.design_url(location)).await
    }

    async fn create_index(&self, location: &StoreLocation) -> SessionResult<WriteResult> {
        let response = self
            .send(
                self.request(Method::PUT, &self.design_url(location))
                    .json(&design_document()),
            )
            .await?;
        Ok(Self::write_result(response, |r| r.inserted = 1).await)
    }

    async fn get(
        &self,
        location: &StoreLocation,
        id: &str,
    ) -> SessionResult<Option<SessionDocument>> {
        Ok(self
            .get_raw(location, id)
            .await?
            .map(CouchDbSession::into_document))
    }

    async fn insert(
        &self,
        location: &StoreLocation,
        document: &SessionDocument,
    ) -> SessionResult<WriteResult> {
        let body = CouchDbSession::from_document(document, None);
        let response = self
            .send(
                self.request(Method::PUT, &self.document_url(location, &document.id))
                    .json(&body),
            )
            .await?;
        Ok(Self::write_result(response, |r| r.inserted = 1).await)
    }

    async fn update(
        &self,
        location: &StoreLocation,
        id: &str,
        patch: &DocumentPatch,
    ) -> SessionResult<WriteResult> {
        // Concurrent requests sharing a session race on `_rev`; re-read and retry.
        for attempt in 1..=MAX_UPDATE_ATTEMPTS {
            let Some(current) = self.get_raw(location, id).await? else {
                return Ok(WriteResult {
                    skipped: 1,
                    ..Default::default()
                });
            };

            let rev = current.rev.clone();
            let mut document = current.into_document();
            if !patch.apply(&mut document) {
                return Ok(WriteResult {
                    unchanged: 1,
                    ..Default::default()
                });
            }

            let body = CouchDbSession::from_document(&document, rev);
            let response = self
                .send(
                    self.request(Method::PUT, &self.document_url(location, id))
                        .json(&body),
                )
                .await?;

            if response.status() == StatusCode::CONFLICT && attempt < MAX_UPDATE_ATTEMPTS {
                debug!(attempt, "Session update conflicted, retrying");
                continue;
            }

            return Ok(Self::write_result(response, |r| r.replaced = 1).await);
        }

        Ok(WriteResult::error("Document update conflict"))
    }

    async fn delete_before(
        &self,
        location: &StoreLocation,
        cutoff: DateTime<Utc>,
    ) -> SessionResult<WriteResult> {
        let response = self
            .send(
                self.request(Method::GET, &self.view_url(location)).query(&[
                    ("endkey", cutoff.timestamp_millis().to_string()),
                    ("inclusive_end", "false".to_string()),
                ]),
            )
            .await?;

        if response.status() == StatusCode::NOT_FOUND {
            return Err(SessionError::Store(format!(
                "Index `{}` was not found on `{}`",
                location.index,
                Self::database_name(location)
            )));
        }

        if !response.status().is_success() {
            return Err(SessionError::Store(format!(
                "Failed to query expired sessions: {}",
                response.status()
            )));
        }

        let view: ViewResponse = response
            .json()
            .await
            .map_err(|e| SessionError::Deserialization(e.to_string()))?;

        if view.rows.is_empty() {
            return Ok(WriteResult::default());
        }

        let docs: Vec<Tombstone<'_>> = view
            .rows
            .iter()
            .map(|row| Tombstone {
                id: &row.id,
                rev: &row.value,
                deleted: true,
            })
            .collect();
        debug!(count = docs.len(), "Deleting expired CouchDB sessions");

        let url = format!("{}/_bulk_docs", self.database_url(location));
        let response = self
            .send(
                self.request(Method::POST, &url)
                    .json(&serde_json::json!({ "docs": docs })),
            )
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Ok(WriteResult::error(format!(
                "Bulk delete failed with {}: {}",
                status, text
            )));
        }

        let outcomes: Vec<BulkResult> = response
            .json()
            .await
            .map_err(|e| SessionError::Deserialization(e.to_string()))?;

        Ok(bulk_delete_outcome(outcomes))
    }

    async fn count(&self, location: &StoreLocation) -> SessionResult<usize> {
        let response = self
            .send(
                self.request(Method::GET, &self.view_url(location))
                    .query(&[("limit", "0")]),
            )
            .await?;

        if !response.status().is_success() {
            return Err(SessionError::Store(format!(
                "Failed to count sessions: {}",
                response.status()
            )));
        }

        let view: ViewResponse = response
            .json()
            .await
            .map_err(|e| SessionError::Deserialization(e.to_string()))?;
        Ok(view.total_rows)
    }
}
