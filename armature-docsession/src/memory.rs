//! In-process document backend.
//!
//! Behaves like a schema-enforcing document database: reads and writes
//! against a table that was never created fail, and range deletes need the
//! `lastAccessed` index. Useful in tests and single-process deployments.

use crate::backend::{DocumentBackend, DocumentPatch, StoreLocation, WriteResult};
use crate::document::SessionDocument;
use crate::error::{SessionError, SessionResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use tokio::sync::RwLock;

#[derive(Debug, Default)]
struct Table {
    documents: HashMap<String, SessionDocument>,
    indexes: HashSet<String>,
}

#[derive(Debug, Default)]
struct Inner {
    databases: HashSet<String>,
    tables: HashMap<(String, String), Table>,
}

/// Document backend held in memory.
///
/// # Examples
///
/// ```
/// use armature_docsession::{DocumentBackend, MemoryBackend, StoreLocation};
///
/// # tokio_test::block_on(async {
/// let backend = MemoryBackend::new();
/// let location = StoreLocation::new("app", "sessions", "lastAccessed");
///
/// assert!(!backend.database_exists("app").await.unwrap());
/// backend.create_database("app").await.unwrap();
/// backend.create_table(&location).await.unwrap();
/// assert!(backend.table_exists(&location).await.unwrap());
/// # });
/// ```
#[derive(Debug, Default)]
pub struct MemoryBackend {
    inner: RwLock<Inner>,
}

impl MemoryBackend {
    /// Empty backend with no databases.
    pub fn new() -> Self {
        Self::default()
    }
}

fn table_key(location: &StoreLocation) -> (String, String) {
    (location.database.clone(), location.table.clone())
}

fn missing_table(location: &StoreLocation) -> SessionError {
    SessionError::Store(format!("Table `{}` does not exist", location))
}

#[async_trait]
impl DocumentBackend for MemoryBackend {
    async fn database_exists(&self, database: &str) -> SessionResult<bool> {
        Ok(self.inner.read().await.databases.contains(database))
    }

    async fn create_database(&self, database: &str) -> SessionResult<WriteResult> {
        let mut inner = self.inner.write().await;
        if !inner.databases.insert(database.to_string()) {
            return Ok(WriteResult::error(format!(
                "Database `{}` already exists",
                database
            )));
        }

        Ok(WriteResult {
            inserted: 1,
            ..Default::default()
        })
    }

    async fn table_exists(&self, location: &StoreLocation) -> SessionResult<bool> {
        Ok(self
            .inner
            .read()
            .await
            .tables
            .contains_key(&table_key(location)))
    }

    async fn create_table(&self, location: &StoreLocation) -> SessionResult<WriteResult> {
        let mut inner = self.inner.write().await;

        if !inner.databases.contains(&location.database) {
            return Err(SessionError::Store(format!(
                "Database `{}` does not exist",
                location.database
            )));
        }

        let key = table_key(location);
        if inner.tables.contains_key(&key) {
            return Ok(WriteResult::error(format!(
                "Table `{}` already exists",
                location
            )));
        }

        inner.tables.insert(key, Table::default());
        Ok(WriteResult {
            inserted: 1,
            ..Default::default()
        })
    }

    async fn index_exists(&self, location: &StoreLocation) -> SessionResult<bool> {
        let inner = self.inner.read().await;
        let table = inner
            .tables
            .get(&table_key(location))
            .ok_or_else(|| missing_table(location))?;
        Ok(table.indexes.contains(&location.index))
    }

    async fn create_index(&self, location: &StoreLocation) -> SessionResult<WriteResult> {
        let mut inner = self.inner.write().await;
        let table = inner
            .tables
            .get_mut(&table_key(location))
            .ok_or_else(|| missing_table(location))?;

        if !table.indexes.insert(location.index.clone()) {
            return Ok(WriteResult::error(format!(
                "Index `{}` already exists on table `{}`",
                location.index, location
            )));
        }

        Ok(WriteResult {
            inserted: 1,
            ..Default::default()
        })
    }

    async fn get(
        &self,
        location: &StoreLocation,
        id: &str,
    ) -> SessionResult<Option<SessionDocument>> {
        let inner = self.inner.read().await;
        let table = inner
            .tables
            .get(&table_key(location))
            .ok_or_else(|| missing_table(location))?;
        Ok(table.documents.get(id).cloned())
    }

    async fn insert(
        &self,
        location: &StoreLocation,
        document: &SessionDocument,
    ) -> SessionResult<WriteResult> {
        let mut inner = self.inner.write().await;
        let table = inner
            .tables
            .get_mut(&table_key(location))
            .ok_or_else(|| missing_table(location))?;

        if table.documents.contains_key(&document.id) {
            return Ok(WriteResult::error(format!(
                "Duplicate primary key `{}`",
                document.id
            )));
        }

        table
            .documents
            .insert(document.id.clone(), document.clone());
        Ok(WriteResult {
            inserted: 1,
            ..Default::default()
        })
    }

    async fn update(
        &self,
        location: &StoreLocation,
        id: &str,
        patch: &DocumentPatch,
    ) -> SessionResult<WriteResult> {
        let mut inner = self.inner.write().await;
        let table = inner
            .tables
            .get_mut(&table_key(location))
            .ok_or_else(|| missing_table(location))?;

        let mut result = WriteResult::default();
        match table.documents.get_mut(id) {
            Some(document) => {
                if patch.apply(document) {
                    result.replaced = 1;
                } else {
                    result.unchanged = 1;
                }
            }
            None => result.skipped = 1,
        }

        Ok(result)
    }

    async fn delete_before(
        &self,
        location: &StoreLocation,
        cutoff: DateTime<Utc>,
    ) -> SessionResult<WriteResult> {
        let mut inner = self.inner.write().await;
        let table = inner
            .tables
            .get_mut(&table_key(location))
            .ok_or_else(|| missing_table(location))?;

        if !table.indexes.contains(&location.index) {
            return Err(SessionError::Store(format!(
                "Index `{}` was not found on table `{}`",
                location.index, location
            )));
        }

        let before = table.documents.len();
        table
            .documents
            .retain(|_, document| document.last_accessed >= cutoff);

        Ok(WriteResult {
            deleted: before - table.documents.len(),
            ..Default::default()
        })
    }

    async fn count(&self, location: &StoreLocation) -> SessionResult<usize> {
        let inner = self.inner.read().await;
        let table = inner
            .tables
            .get(&table_key(location))
            .ok_or_else(|| missing_table(location))?;
        Ok(table.documents.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::SessionData;

    fn location() -> StoreLocation {
        StoreLocation::new("db", "sessions", "lastAccessed")
    }

    async fn backend_with_schema() -> MemoryBackend {
        let backend = MemoryBackend::new();
        backend.create_database("db").await.unwrap();
        backend.create_table(&location()).await.unwrap();
        backend.create_index(&location()).await.unwrap();
        backend
    }

    #[tokio::test]
    async fn test_schema_creation_is_not_idempotent_by_itself() {
        let backend = backend_with_schema().await;
        assert!(!backend.create_database("db").await.unwrap().is_ok());
        assert!(!backend.create_table(&location()).await.unwrap().is_ok());
        assert!(!backend.create_index(&location()).await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_table_requires_database() {
        let backend = MemoryBackend::new();
        assert!(backend.create_table(&location()).await.is_err());
        assert!(backend.get(&location(), "x").await.is_err());
    }

    #[tokio::test]
    async fn test_insert_get_and_duplicate() {
        let backend = backend_with_schema().await;
        let doc = SessionDocument::new("a", Utc::now());

        let result = backend.insert(&location(), &doc).await.unwrap();
        assert_eq!(result.inserted, 1);
        assert_eq!(backend.get(&location(), "a").await.unwrap(), Some(doc.clone()));
        assert_eq!(backend.get(&location(), "b").await.unwrap(), None);

        let dup = backend.insert(&location(), &doc).await.unwrap();
        assert_eq!(dup.errors, 1);
    }

    #[tokio::test]
    async fn test_update_counts() {
        let backend = backend_with_schema().await;
        let now = Utc::now();
        backend
            .insert(&location(), &SessionDocument::new("a", now))
            .await
            .unwrap();

        let mut data = SessionData::new();
        data.insert("k".into(), serde_json::json!("v"));
        let patch = DocumentPatch {
            data: Some(data),
            last_accessed: None,
        };

        assert_eq!(backend.update(&location(), "a", &patch).await.unwrap().replaced, 1);
        assert_eq!(backend.update(&location(), "a", &patch).await.unwrap().unchanged, 1);
        assert_eq!(backend.update(&location(), "zz", &patch).await.unwrap().skipped, 1);
    }

    #[tokio::test]
    async fn test_delete_before_is_strict_and_needs_index() {
        let backend = backend_with_schema().await;
        let cutoff = Utc::now();
        for (id, offset) in [("old", -10), ("edge", 0), ("new", 10)] {
            let doc = SessionDocument::new(id, cutoff + chrono::Duration::seconds(offset));
            backend.insert(&location(), &doc).await.unwrap();
        }

        let result = backend.delete_before(&location(), cutoff).await.unwrap();
        assert_eq!(result.deleted, 1);
        assert_eq!(backend.count(&location()).await.unwrap(), 2);
        assert!(backend.get(&location(), "edge").await.unwrap().is_some());

        let unindexed = StoreLocation::new("db", "sessions", "other");
        assert!(backend.delete_before(&unindexed, cutoff).await.is_err());
    }
}
