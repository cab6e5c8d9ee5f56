//! Persistence of sync queue items

use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use uuid::Uuid;

use super::{format_timestamp, parse_timestamp, LocalStore};
use crate::error::{SyncError, SyncResult};
use crate::queue::{DraftRef, MutationAction, SyncQueueItem};

impl LocalStore {
    pub async fn insert_queue_item(&self, item: &SyncQueueItem) -> SyncResult<()> {
        let (draft_collection, draft_id) = match &item.draft {
            Some(draft) => (Some(draft.collection.as_str()), Some(draft.id.as_str())),
            None => (None, None),
        };

        sqlx::query(
            r#"
            INSERT INTO sync_queue (
                id, resource_kind, action, payload, draft_collection, draft_id,
                enqueued_at, retry_count, last_error
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(item.id.to_string())
        .bind(&item.resource_kind)
        .bind(item.action.as_str())
        .bind(item.payload.to_string())
        .bind(draft_collection)
        .bind(draft_id)
        .bind(format_timestamp(&item.enqueued_at))
        .bind(i64::from(item.retry_count))
        .bind(&item.last_error)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// All queued items in enqueue order
    pub async fn queue_items(&self) -> SyncResult<Vec<SyncQueueItem>> {
        let rows = sqlx::query(
            r#"
            SELECT id, resource_kind, action, payload, draft_collection, draft_id,
                   enqueued_at, retry_count, last_error
            FROM sync_queue
            ORDER BY enqueued_at ASC, rowid ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(queue_item_from_row).collect()
    }

    /// Queued items of one resource kind, in enqueue order
    pub async fn queue_items_by_kind(&self, resource_kind: &str) -> SyncResult<Vec<SyncQueueItem>> {
        let rows = sqlx::query(
            r#"
            SELECT id, resource_kind, action, payload, draft_collection, draft_id,
                   enqueued_at, retry_count, last_error
            FROM sync_queue
            WHERE resource_kind = ?
            ORDER BY enqueued_at ASC, rowid ASC
            "#,
        )
        .bind(resource_kind)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(queue_item_from_row).collect()
    }

    /// Persist a new retry count and the error that caused it
    pub async fn set_queue_retry(&self, id: Uuid, retry_count: u32, last_error: &str) -> SyncResult<()> {
        sqlx::query(
            r#"
            UPDATE sync_queue
            SET retry_count = ?,
                last_error = ?
            WHERE id = ?
            "#,
        )
        .bind(i64::from(retry_count))
        .bind(last_error)
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn remove_queue_item(&self, id: Uuid) -> SyncResult<bool> {
        let result = sqlx::query("DELETE FROM sync_queue WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn queue_len(&self) -> SyncResult<u64> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM sync_queue")
            .fetch_one(&self.pool)
            .await?;
        let n: i64 = row.try_get("n")?;
        Ok(u64::try_from(n).unwrap_or_default())
    }
}

fn queue_item_from_row(row: &SqliteRow) -> SyncResult<SyncQueueItem> {
    let id: String = row.try_get("id")?;
    let action: String = row.try_get("action")?;
    let payload: String = row.try_get("payload")?;
    let draft_collection: Option<String> = row.try_get("draft_collection")?;
    let draft_id: Option<String> = row.try_get("draft_id")?;
    let enqueued_at: String = row.try_get("enqueued_at")?;
    let retry_count: i64 = row.try_get("retry_count")?;

    let draft = match (draft_collection, draft_id) {
        (Some(collection), Some(id)) => Some(DraftRef { collection, id }),
        _ => None,
    };

    Ok(SyncQueueItem {
        id: Uuid::parse_str(&id)
            .map_err(|e| SyncError::Deserialization(format!("Invalid UUID: {}", e)))?,
        resource_kind: row.try_get("resource_kind")?,
        action: action.parse::<MutationAction>()?,
        payload: serde_json::from_str(&payload)
            .map_err(|e| SyncError::Deserialization(e.to_string()))?,
        draft,
        enqueued_at: parse_timestamp(&enqueued_at)?,
        retry_count: u32::try_from(retry_count)
            .map_err(|_| SyncError::Deserialization(format!("Invalid retry count: {}", retry_count)))?,
        last_error: row.try_get("last_error")?,
    })
}
