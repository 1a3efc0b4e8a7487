//! Store implementations.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use lcm_id::BlueprintId;
use rusqlite::{params, Connection, OptionalExtension};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::debug;

use crate::blueprint::BlueprintInstance;

/// Errors from store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid state: {0}")]
    Invalid(String),
}

/// Durable storage of blueprint documents.
#[async_trait]
pub trait BlueprintStore: Send + Sync {
    async fn load(&self, id: &BlueprintId) -> Result<Option<BlueprintInstance>, StoreError>;

    /// Insert or replace the document.
    async fn save(&self, instance: &BlueprintInstance) -> Result<(), StoreError>;

    /// All documents, optionally only those of one type, oldest first.
    async fn list(&self, blueprint_type: Option<&str>)
        -> Result<Vec<BlueprintInstance>, StoreError>;

    /// Remove the document. Returns whether it existed.
    async fn delete(&self, id: &BlueprintId) -> Result<bool, StoreError>;
}

/// SQLite store.
pub struct SqliteBlueprintStore {
    conn: Mutex<Connection>,
}

impl SqliteBlueprintStore {
    /// Open or create a store at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;

        // Enable WAL mode for better concurrency
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;

        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    /// Open an in-memory store (for testing).
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let store = Self {
            conn: Mutex::new(Connection::open_in_memory()?),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn
            .lock()
            .map_err(|_| StoreError::Invalid("connection lock poisoned".to_string()))
    }

    fn init_schema(&self) -> Result<(), StoreError> {
        self.conn()?.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS blueprints (
                id TEXT PRIMARY KEY,
                blueprint_type TEXT NOT NULL,
                document TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_blueprints_type ON blueprints(blueprint_type);
            "#,
        )?;

        debug!("Blueprint store schema initialized");
        Ok(())
    }

    fn decode(document: &str) -> Result<BlueprintInstance, StoreError> {
        Ok(serde_json::from_str(document)?)
    }
}

#[async_trait]
impl BlueprintStore for SqliteBlueprintStore {
    async fn load(&self, id: &BlueprintId) -> Result<Option<BlueprintInstance>, StoreError> {
        let conn = self.conn()?;
        let document: Option<String> = conn
            .query_row(
                "SELECT document FROM blueprints WHERE id = ?1",
                params![id.to_string()],
                |row| row.get(0),
            )
            .optional()?;
        document.as_deref().map(Self::decode).transpose()
    }

    async fn save(&self, instance: &BlueprintInstance) -> Result<(), StoreError> {
        let document = serde_json::to_string(instance)?;
        self.conn()?.execute(
            r#"
            INSERT INTO blueprints (id, blueprint_type, document, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(id) DO UPDATE SET
                document = excluded.document,
                updated_at = excluded.updated_at
            "#,
            params![
                instance.id.to_string(),
                instance.blueprint_type,
                document,
                instance.created_at.timestamp_millis(),
                instance.updated_at.timestamp_millis(),
            ],
        )?;
        Ok(())
    }

    async fn list(
        &self,
        blueprint_type: Option<&str>,
    ) -> Result<Vec<BlueprintInstance>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT document FROM blueprints
             WHERE ?1 IS NULL OR blueprint_type = ?1
             ORDER BY created_at, id",
        )?;
        let documents = stmt
            .query_map(params![blueprint_type], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        documents.iter().map(|d| Self::decode(d)).collect()
    }

    async fn delete(&self, id: &BlueprintId) -> Result<bool, StoreError> {
        let removed = self
            .conn()?
            .execute("DELETE FROM blueprints WHERE id = ?1", params![id.to_string()])?;
        Ok(removed > 0)
    }
}

/// In-memory store. Documents are kept serialized, so a loaded instance
/// never aliases the one that was saved.
#[derive(Debug, Default)]
pub struct MemoryBlueprintStore {
    documents: RwLock<BTreeMap<BlueprintId, String>>,
}

impl MemoryBlueprintStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn contains(&self, id: &BlueprintId) -> bool {
        self.documents.read().await.contains_key(id)
    }

    pub async fn len(&self) -> usize {
        self.documents.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.documents.read().await.is_empty()
    }
}

#[async_trait]
impl BlueprintStore for MemoryBlueprintStore {
    async fn load(&self, id: &BlueprintId) -> Result<Option<BlueprintInstance>, StoreError> {
        let documents = self.documents.read().await;
        documents
            .get(id)
            .map(|d| serde_json::from_str(d).map_err(StoreError::from))
            .transpose()
    }

    async fn save(&self, instance: &BlueprintInstance) -> Result<(), StoreError> {
        let document = serde_json::to_string(instance)?;
        self.documents.write().await.insert(instance.id, document);
        Ok(())
    }

    async fn list(
        &self,
        blueprint_type: Option<&str>,
    ) -> Result<Vec<BlueprintInstance>, StoreError> {
        let documents = self.documents.read().await;
        let mut instances = documents
            .values()
            .map(|d| serde_json::from_str::<BlueprintInstance>(d))
            .collect::<Result<Vec<_>, _>>()?;
        instances.retain(|i| blueprint_type.is_none_or(|t| i.blueprint_type == t));
        instances.sort_by(|a, b| (a.created_at, a.id).cmp(&(b.created_at, b.id)));
        Ok(instances)
    }

    async fn delete(&self, id: &BlueprintId) -> Result<bool, StoreError> {
        Ok(self.documents.write().await.remove(id).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lcm_events::BlueprintStatus;

    async fn exercise(store: &dyn BlueprintStore) {
        let mut router = BlueprintInstance::new(BlueprintId::new(), "router");
        let topology = BlueprintInstance::new(BlueprintId::new(), "vm_topology");

        store.save(&router).await.unwrap();
        store.save(&topology).await.unwrap();

        router.status = BlueprintStatus::failed("boom");
        store.save(&router).await.unwrap();

        let loaded = store.load(&router.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, router.status);

        assert_eq!(store.list(None).await.unwrap().len(), 2);
        let routers = store.list(Some("router")).await.unwrap();
        assert_eq!(routers.len(), 1);
        assert_eq!(routers[0].id, router.id);

        assert!(store.delete(&router.id).await.unwrap());
        assert!(!store.delete(&router.id).await.unwrap());
        assert!(store.load(&router.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_sqlite_store() {
        let store = SqliteBlueprintStore::open_in_memory().unwrap();
        exercise(&store).await;
    }

    #[tokio::test]
    async fn test_memory_store() {
        let store = MemoryBlueprintStore::new();
        exercise(&store).await;
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn test_sqlite_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.db");
        let instance = BlueprintInstance::new(BlueprintId::new(), "router");

        {
            let store = SqliteBlueprintStore::open(&path).unwrap();
            store.save(&instance).await.unwrap();
        }

        let store = SqliteBlueprintStore::open(&path).unwrap();
        let loaded = store.load(&instance.id).await.unwrap().unwrap();
        assert_eq!(loaded.blueprint_type, "router");
        assert_eq!(loaded.id, instance.id);
    }
}
