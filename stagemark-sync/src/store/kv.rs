//! Key-value blobs (settings and other small persisted state)

use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sqlx::Row;

use super::{format_timestamp, LocalStore};
use crate::error::{SyncError, SyncResult};

impl LocalStore {
    pub async fn kv_get<T: DeserializeOwned>(&self, key: &str) -> SyncResult<Option<T>> {
        let row = sqlx::query("SELECT value FROM kv_store WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => {
                let raw: String = row.try_get("value")?;
                serde_json::from_str(&raw)
                    .map(Some)
                    .map_err(|e| SyncError::Deserialization(e.to_string()))
            }
            None => Ok(None),
        }
    }

    pub async fn kv_put<T: Serialize>(&self, key: &str, value: &T) -> SyncResult<()> {
        let raw = serde_json::to_string(value)?;
        sqlx::query(
            r#"
            INSERT INTO kv_store (key, value, updated_at)
            VALUES (?, ?, ?)
            ON CONFLICT(key) DO UPDATE SET
                value = excluded.value,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(key)
        .bind(raw)
        .bind(format_timestamp(&Utc::now()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
