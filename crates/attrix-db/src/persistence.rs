//! [`PersistenceStore`] backends: in-memory, JSON files, and PostgreSQL.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use sqlx::postgres::{PgPool, PgPoolOptions};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

use attrix_core::defaults::PG_RECORD_TABLE;
use attrix_core::{Error, PersistenceStore, Result};

// =============================================================================
// MEMORY
// =============================================================================

/// Volatile store, mainly for tests. Clones share the same records.
#[derive(Clone, Default)]
pub struct MemoryPersistence {
    records: Arc<RwLock<HashMap<String, JsonValue>>>,
    writes: Arc<AtomicUsize>,
}

impl MemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of `store` calls so far.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PersistenceStore for MemoryPersistence {
    async fn load(&self, record: &str) -> Result<Option<JsonValue>> {
        Ok(self.records.read().await.get(record).cloned())
    }

    async fn store(&self, record: &str, value: &JsonValue) -> Result<()> {
        self.records
            .write()
            .await
            .insert(record.to_string(), value.clone());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn name(&self) -> &str {
        "memory"
    }
}

// =============================================================================
// FILESYSTEM
// =============================================================================

/// One pretty-printed JSON file per record under a base directory.
///
/// Path format: `{base_path}/{record}.json`. Each write goes to its own
/// temp file (`{record}.json.{uuid}.tmp`) that is renamed into place, so
/// concurrent writers of one record never share a partial file.
pub struct FilesystemPersistence {
    base_path: PathBuf,
}

impl FilesystemPersistence {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
        }
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    fn record_path(&self, record: &str) -> Result<PathBuf> {
        let valid = !record.is_empty()
            && !record.starts_with('.')
            && record
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));
        if !valid {
            return Err(Error::InvalidInput(format!("Invalid record name: {}", record)));
        }
        Ok(self.base_path.join(format!("{}.json", record)))
    }
}

#[async_trait]
impl PersistenceStore for FilesystemPersistence {
    async fn load(&self, record: &str) -> Result<Option<JsonValue>> {
        let path = self.record_path(record)?;
        if !fs::try_exists(&path).await? {
            return Ok(None);
        }
        let bytes = fs::read(&path).await?;
        let value = serde_json::from_slice(&bytes)?;
        debug!(record, path = %path.display(), "Record loaded");
        Ok(Some(value))
    }

    async fn store(&self, record: &str, value: &JsonValue) -> Result<()> {
        let path = self.record_path(record)?;
        fs::create_dir_all(&self.base_path).await.map_err(|e| {
            warn!(base_path = %self.base_path.display(), error = %e, "create_dir_all failed");
            e
        })?;

        let data = serde_json::to_vec_pretty(value)?;
        let temp_path = path.with_extension(format!("json.{}.tmp", Uuid::now_v7()));
        let written: std::io::Result<()> = async {
            let mut file = fs::File::create(&temp_path).await?;
            file.write_all(&data).await?;
            file.sync_all().await?;
            drop(file);
            fs::rename(&temp_path, &path).await
        }
        .await;

        if let Err(e) = written {
            warn!(from = %temp_path.display(), to = %path.display(), error = %e, "Record write failed");
            let _ = fs::remove_file(&temp_path).await;
            return Err(e.into());
        }
        debug!(record, size = data.len(), "Record stored");
        Ok(())
    }

    fn name(&self) -> &str {
        "filesystem"
    }
}

// =============================================================================
// POSTGRES
// =============================================================================

/// Records stored as JSONB rows keyed by record name.
#[derive(Clone)]
pub struct PgPersistence {
    pool: PgPool,
}

impl PgPersistence {
    /// Connect and make sure the record table exists.
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(2)
            .connect(database_url)
            .await?;
        Self::new(pool).await
    }

    pub async fn new(pool: PgPool) -> Result<Self> {
        let store = Self { pool };
        store.ensure_table().await?;
        info!(table = PG_RECORD_TABLE, "PostgreSQL persistence ready");
        Ok(store)
    }

    async fn ensure_table(&self) -> Result<()> {
        let ddl = format!(
            "CREATE TABLE IF NOT EXISTS {} (
                key TEXT PRIMARY KEY,
                value JSONB NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )",
            PG_RECORD_TABLE
        );
        sqlx::query(&ddl).execute(&self.pool).await?;
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl PersistenceStore for PgPersistence {
    async fn load(&self, record: &str) -> Result<Option<JsonValue>> {
        let sql = format!("SELECT value FROM {} WHERE key = $1", PG_RECORD_TABLE);
        let row: Option<(JsonValue,)> = sqlx::query_as(&sql)
            .bind(record)
            .fetch_optional(&self.pool)
            .await
            .map_err(Error::Database)?;
        Ok(row.map(|(value,)| value))
    }

    async fn store(&self, record: &str, value: &JsonValue) -> Result<()> {
        let sql = format!(
            "INSERT INTO {} (key, value, updated_at) VALUES ($1, $2, NOW())
             ON CONFLICT (key) DO UPDATE SET value = $2, updated_at = NOW()",
            PG_RECORD_TABLE
        );
        sqlx::query(&sql)
            .bind(record)
            .bind(value)
            .execute(&self.pool)
            .await
            .map_err(Error::Database)?;
        debug!(record, "Record persisted to database");
        Ok(())
    }

    fn name(&self) -> &str {
        "postgres"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_memory_roundtrip() {
        let store = MemoryPersistence::new();
        assert!(store.load("attrix.jobs").await.unwrap().is_none());

        store.store("attrix.jobs", &json!([1, 2])).await.unwrap();
        assert_eq!(store.load("attrix.jobs").await.unwrap(), Some(json!([1, 2])));
        assert_eq!(store.write_count(), 1);
    }

    #[tokio::test]
    async fn test_filesystem_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FilesystemPersistence::new(dir.path().join("nested"));
        assert!(store.load("attrix.schema").await.unwrap().is_none());

        store
            .store("attrix.schema", &json!({"items": []}))
            .await
            .unwrap();
        store
            .store("attrix.schema", &json!({"items": [1]}))
            .await
            .unwrap();

        assert_eq!(
            store.load("attrix.schema").await.unwrap(),
            Some(json!({"items": [1]}))
        );
        assert!(dir.path().join("nested/attrix.schema.json").exists());
        let leftovers = std::fs::read_dir(dir.path().join("nested"))
            .unwrap()
            .filter(|e| e.as_ref().unwrap().path().extension() == Some(std::ffi::OsStr::new("tmp")))
            .count();
        assert_eq!(leftovers, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_filesystem_concurrent_writers_leave_valid_json() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FilesystemPersistence::new(dir.path()));

        let mut handles = Vec::new();
        for i in 0..16 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                let values: Vec<String> = (0..=i).map(|n| format!("VALUE_{n}")).collect();
                store.store("attrix.schema", &json!({ "values": values })).await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let loaded = store.load("attrix.schema").await.unwrap().unwrap();
        assert!(loaded["values"].as_array().is_some_and(|v| !v.is_empty()));
        let files: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(files.len(), 1);
    }

    #[tokio::test]
    async fn test_filesystem_rejects_path_like_records() {
        let dir = tempfile::tempdir().unwrap();
        let store = FilesystemPersistence::new(dir.path());
        assert!(store.load("../etc/passwd").await.is_err());
        assert!(store.store("a/b", &json!(null)).await.is_err());
    }

    #[tokio::test]
    async fn test_filesystem_corrupt_record_is_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("attrix.jobs.json"), b"{not json").unwrap();
        let store = FilesystemPersistence::new(dir.path());
        assert!(matches!(
            store.load("attrix.jobs").await,
            Err(Error::Serialization(_))
        ));
    }
}
