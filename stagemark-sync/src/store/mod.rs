//! Local SQLite store for offline-first operations
//!
//! Provides:
//! - Named collections of JSON records with `synced`/owner indexes
//! - The persisted sync queue (see `queue.rs`)
//! - A small key-value table for settings blobs (see `kv.rs`)
//!
//! Every write is a single statement, so a record is observable either in
//! its previous or its new form, and is durable once the call returns.

mod kv;
mod queue;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use std::str::FromStr;

use crate::config::StoreConfig;
use crate::error::{SyncError, SyncResult};

/// One locally durable object: a mutation draft or a cached remote entity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalRecord {
    pub id: String,
    pub collection: String,
    /// Owning resource (e.g. the session a comment belongs to)
    pub owner_id: Option<String>,
    pub payload: serde_json::Value,
    pub last_modified: DateTime<Utc>,
    pub synced: bool,
}

impl LocalRecord {
    /// New unsynced record stamped with the current time
    pub fn new(collection: impl Into<String>, id: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            id: id.into(),
            collection: collection.into(),
            owner_id: None,
            payload,
            last_modified: Utc::now(),
            synced: false,
        }
    }

    pub fn with_owner(mut self, owner_id: impl Into<String>) -> Self {
        self.owner_id = Some(owner_id.into());
        self
    }

    pub fn with_synced(mut self, synced: bool) -> Self {
        self.synced = synced;
        self
    }
}

/// Secondary index lookups supported by [`LocalStore::get_all_by_index`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordIndex {
    Synced(bool),
    Owner(String),
}

/// Local database handle
#[derive(Debug, Clone)]
pub struct LocalStore {
    pool: SqlitePool,
}

impl LocalStore {
    /// Open (creating if needed) the store described by `config`
    pub async fn open(config: &StoreConfig) -> SyncResult<Self> {
        if config.db_path == ":memory:" {
            return Self::in_memory().await;
        }

        let mut options = SqliteConnectOptions::new()
            .filename(&config.db_path)
            .create_if_missing(true)
            .foreign_keys(true);
        if config.enable_wal {
            options = options.journal_mode(SqliteJournalMode::Wal);
        }

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.initialize_schema().await?;

        tracing::debug!(db_path = %config.db_path, "Opened local store");
        Ok(store)
    }

    /// Private in-memory store. A single pinned connection keeps the
    /// database alive for the lifetime of the pool.
    pub async fn in_memory() -> SyncResult<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.initialize_schema().await?;
        Ok(store)
    }

    /// Initialize database schema
    async fn initialize_schema(&self) -> SyncResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS records (
                collection TEXT NOT NULL,
                id TEXT NOT NULL,
                owner_id TEXT,
                payload TEXT NOT NULL,
                last_modified TEXT NOT NULL,
                synced INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (collection, id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_records_synced ON records(collection, synced)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_records_owner ON records(collection, owner_id)")
            .execute(&self.pool)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS sync_queue (
                id TEXT PRIMARY KEY,
                resource_kind TEXT NOT NULL,
                action TEXT NOT NULL,
                payload TEXT NOT NULL,
                draft_collection TEXT,
                draft_id TEXT,
                enqueued_at TEXT NOT NULL,
                retry_count INTEGER NOT NULL DEFAULT 0,
                last_error TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_sync_queue_enqueued ON sync_queue(enqueued_at)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_sync_queue_kind ON sync_queue(resource_kind)")
            .execute(&self.pool)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS kv_store (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Upsert by `(collection, id)`
    pub async fn put(&self, record: &LocalRecord) -> SyncResult<()> {
        sqlx::query(
            r#"
            INSERT INTO records (collection, id, owner_id, payload, last_modified, synced)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(collection, id) DO UPDATE SET
                owner_id = excluded.owner_id,
                payload = excluded.payload,
                last_modified = excluded.last_modified,
                synced = excluded.synced
            "#,
        )
        .bind(&record.collection)
        .bind(&record.id)
        .bind(&record.owner_id)
        .bind(record.payload.to_string())
        .bind(format_timestamp(&record.last_modified))
        .bind(record.synced)
        .execute(&self.pool)
        .await?;

        tracing::trace!(collection = %record.collection, id = %record.id, "Stored record");
        Ok(())
    }

    pub async fn get(&self, collection: &str, id: &str) -> SyncResult<Option<LocalRecord>> {
        let row = sqlx::query(
            r#"
            SELECT collection, id, owner_id, payload, last_modified, synced
            FROM records
            WHERE collection = ? AND id = ?
            "#,
        )
        .bind(collection)
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(record_from_row).transpose()
    }

    pub async fn get_all_by_index(&self, collection: &str, index: &RecordIndex) -> SyncResult<Vec<LocalRecord>> {
        let base = r#"
            SELECT collection, id, owner_id, payload, last_modified, synced
            FROM records
            WHERE collection = ?
        "#;

        let rows = match index {
            RecordIndex::Synced(synced) => {
                let sql = format!("{} AND synced = ? ORDER BY last_modified ASC", base);
                sqlx::query(&sql)
                    .bind(collection)
                    .bind(*synced)
                    .fetch_all(&self.pool)
                    .await?
            }
            RecordIndex::Owner(owner_id) => {
                let sql = format!("{} AND owner_id = ? ORDER BY last_modified ASC", base);
                sqlx::query(&sql)
                    .bind(collection)
                    .bind(owner_id)
                    .fetch_all(&self.pool)
                    .await?
            }
        };

        rows.iter().map(record_from_row).collect()
    }

    /// Every record of a collection, oldest first
    pub async fn get_all(&self, collection: &str) -> SyncResult<Vec<LocalRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT collection, id, owner_id, payload, last_modified, synced
            FROM records
            WHERE collection = ?
            ORDER BY last_modified ASC
            "#,
        )
        .bind(collection)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(record_from_row).collect()
    }

    pub async fn delete(&self, collection: &str, id: &str) -> SyncResult<bool> {
        let result = sqlx::query("DELETE FROM records WHERE collection = ? AND id = ?")
            .bind(collection)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn clear(&self, collection: &str) -> SyncResult<u64> {
        let result = sqlx::query("DELETE FROM records WHERE collection = ?")
            .bind(collection)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    /// Flag a record as confirmed by the server. Returns false if it no
    /// longer exists.
    pub async fn mark_synced(&self, collection: &str, id: &str) -> SyncResult<bool> {
        let result = sqlx::query("UPDATE records SET synced = 1 WHERE collection = ? AND id = ?")
            .bind(collection)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Unsynced records across all collections
    pub async fn count_unsynced(&self) -> SyncResult<u64> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM records WHERE synced = 0")
            .fetch_one(&self.pool)
            .await?;
        let n: i64 = row.try_get("n")?;
        Ok(u64::try_from(n).unwrap_or_default())
    }

    /// Names of every collection holding at least one record
    pub async fn collections(&self) -> SyncResult<Vec<String>> {
        let rows = sqlx::query("SELECT DISTINCT collection FROM records ORDER BY collection")
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| row.try_get::<String, _>("collection").map_err(SyncError::from))
            .collect()
    }

    /// Delete records last modified before `cutoff`
    pub async fn prune_older_than(&self, collection: &str, cutoff: DateTime<Utc>) -> SyncResult<u64> {
        let result = sqlx::query("DELETE FROM records WHERE collection = ? AND last_modified < ?")
            .bind(collection)
            .bind(format_timestamp(&cutoff))
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    /// Get database pool
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn is_closed(&self) -> bool {
        self.pool.is_closed()
    }

    /// Close database connections. Later calls fail with a storage error.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

/// Fixed-width RFC 3339 so lexical order matches chronological order
pub(crate) fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

pub(crate) fn parse_timestamp(raw: &str) -> SyncResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| SyncError::Deserialization(format!("Invalid timestamp {}: {}", raw, e)))
}

fn record_from_row(row: &SqliteRow) -> SyncResult<LocalRecord> {
    let payload: String = row.try_get("payload")?;
    let last_modified: String = row.try_get("last_modified")?;

    Ok(LocalRecord {
        id: row.try_get("id")?,
        collection: row.try_get("collection")?,
        owner_id: row.try_get("owner_id")?,
        payload: serde_json::from_str(&payload)
            .map_err(|e| SyncError::Deserialization(e.to_string()))?,
        last_modified: parse_timestamp(&last_modified)?,
        synced: row.try_get("synced")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    async fn create_test_store() -> LocalStore {
        LocalStore::in_memory().await.unwrap()
    }

    #[tokio::test]
    async fn test_put_and_get() {
        let store = create_test_store().await;
        let record = LocalRecord::new("evaluations", "E1", json!({"score": 8}));

        store.put(&record).await.unwrap();

        let loaded = store.get("evaluations", "E1").await.unwrap().unwrap();
        assert_eq!(loaded.payload, json!({"score": 8}));
        assert!(!loaded.synced);
        assert!(store.get("evaluations", "missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_put_is_idempotent_upsert() {
        let store = create_test_store().await;

        store.put(&LocalRecord::new("comments", "C1", json!({"text": "first"}))).await.unwrap();
        store.put(&LocalRecord::new("comments", "C1", json!({"text": "second"}))).await.unwrap();

        let all = store.get_all("comments").await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].payload, json!({"text": "second"}));
    }

    #[tokio::test]
    async fn test_same_id_in_different_collections() {
        let store = create_test_store().await;

        store.put(&LocalRecord::new("comments", "X", json!(1))).await.unwrap();
        store.put(&LocalRecord::new("templates", "X", json!(2))).await.unwrap();

        assert_eq!(store.get("comments", "X").await.unwrap().unwrap().payload, json!(1));
        assert_eq!(store.get("templates", "X").await.unwrap().unwrap().payload, json!(2));
    }

    #[tokio::test]
    async fn test_get_all_by_index() {
        let store = create_test_store().await;

        store.put(&LocalRecord::new("comments", "C1", json!({})).with_owner("S1")).await.unwrap();
        store.put(&LocalRecord::new("comments", "C2", json!({})).with_owner("S1").with_synced(true)).await.unwrap();
        store.put(&LocalRecord::new("comments", "C3", json!({})).with_owner("S2")).await.unwrap();

        let unsynced = store.get_all_by_index("comments", &RecordIndex::Synced(false)).await.unwrap();
        let ids: Vec<_> = unsynced.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["C1", "C3"]);

        let owned = store.get_all_by_index("comments", &RecordIndex::Owner("S1".into())).await.unwrap();
        assert_eq!(owned.len(), 2);
    }

    #[tokio::test]
    async fn test_delete_clear_and_mark_synced() {
        let store = create_test_store().await;
        store.put(&LocalRecord::new("comments", "C1", json!({}))).await.unwrap();
        store.put(&LocalRecord::new("comments", "C2", json!({}))).await.unwrap();

        assert_eq!(store.count_unsynced().await.unwrap(), 2);
        assert!(store.mark_synced("comments", "C1").await.unwrap());
        assert_eq!(store.count_unsynced().await.unwrap(), 1);

        assert!(store.delete("comments", "C2").await.unwrap());
        assert!(!store.delete("comments", "C2").await.unwrap());

        assert_eq!(store.clear("comments").await.unwrap(), 1);
        assert!(store.get_all("comments").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_prune_older_than() {
        let store = create_test_store().await;
        let mut old = LocalRecord::new("cache:session", "S1", json!({}));
        old.last_modified = Utc::now() - chrono::Duration::days(30);
        store.put(&old).await.unwrap();
        store.put(&LocalRecord::new("cache:session", "S2", json!({}))).await.unwrap();

        let cutoff = Utc::now() - chrono::Duration::days(7);
        assert_eq!(store.prune_older_than("cache:session", cutoff).await.unwrap(), 1);
        assert!(store.get("cache:session", "S2").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_records_survive_reopen() {
        let dir = TempDir::new().unwrap();
        let config = StoreConfig {
            db_path: dir.path().join("local.db").to_str().unwrap().to_string(),
            ..StoreConfig::default()
        };

        let store = LocalStore::open(&config).await.unwrap();
        store.put(&LocalRecord::new("comments", "C1", json!({"text": "kept"}))).await.unwrap();
        store.close().await;

        let reopened = LocalStore::open(&config).await.unwrap();
        let record = reopened.get("comments", "C1").await.unwrap().unwrap();
        assert_eq!(record.payload, json!({"text": "kept"}));
    }

    #[tokio::test]
    async fn test_closed_store_reports_storage_error() {
        let store = create_test_store().await;
        store.close().await;

        let err = store.put(&LocalRecord::new("comments", "C1", json!({}))).await.unwrap_err();
        assert!(err.is_storage());
    }
}
