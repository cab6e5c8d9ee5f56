//! Notification hub for sync and offline events
//!
//! Bounded, in-memory log of user-facing events plus a broadcast channel so
//! the UI can react without polling. Which kinds are recorded is controlled
//! by the persisted [`NotificationSettings`].

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::error::SyncResult;
use crate::store::LocalStore;

const SETTINGS_KEY: &str = "notification_settings";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    DataSaved,
    SyncCompleted,
    SyncFailed,
    /// The client went offline
    OfflineMode,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OfflineNotification {
    pub id: Uuid,
    pub kind: NotificationKind,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

/// Per-kind user preferences
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct NotificationSettings {
    pub offline_mode: bool,
    pub sync_completed: bool,
    pub sync_failed: bool,
    pub data_saved: bool,
}

impl Default for NotificationSettings {
    fn default() -> Self {
        Self {
            offline_mode: true,
            sync_completed: true,
            sync_failed: true,
            data_saved: true,
        }
    }
}

impl NotificationSettings {
    pub fn allows(&self, kind: NotificationKind) -> bool {
        match kind {
            NotificationKind::DataSaved => self.data_saved,
            NotificationKind::SyncCompleted => self.sync_completed,
            NotificationKind::SyncFailed => self.sync_failed,
            NotificationKind::OfflineMode => self.offline_mode,
        }
    }

    /// Load persisted settings merged over the defaults
    pub async fn load(store: &LocalStore) -> SyncResult<Self> {
        Ok(store.kv_get::<Self>(SETTINGS_KEY).await?.unwrap_or_default())
    }

    pub async fn save(&self, store: &LocalStore) -> SyncResult<()> {
        store.kv_put(SETTINGS_KEY, self).await
    }

    fn apply(&mut self, update: &NotificationSettingsUpdate) {
        if let Some(v) = update.offline_mode {
            self.offline_mode = v;
        }
        if let Some(v) = update.sync_completed {
            self.sync_completed = v;
        }
        if let Some(v) = update.sync_failed {
            self.sync_failed = v;
        }
        if let Some(v) = update.data_saved {
            self.data_saved = v;
        }
    }
}

/// Partial update; `None` fields keep their current value
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationSettingsUpdate {
    pub offline_mode: Option<bool>,
    pub sync_completed: Option<bool>,
    pub sync_failed: Option<bool>,
    pub data_saved: Option<bool>,
}

pub struct NotificationHub {
    buffer: Mutex<VecDeque<OfflineNotification>>,
    capacity: usize,
    settings: RwLock<NotificationSettings>,
    broadcast_tx: broadcast::Sender<OfflineNotification>,
}

impl NotificationHub {
    pub fn new(capacity: usize, settings: NotificationSettings) -> Self {
        let capacity = capacity.max(1);
        let (broadcast_tx, _) = broadcast::channel(capacity);
        Self {
            buffer: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            settings: RwLock::new(settings),
            broadcast_tx,
        }
    }

    /// Record and broadcast a notification if its kind is enabled.
    /// Returns the stored notification, or `None` when it was filtered out.
    pub fn notify(&self, kind: NotificationKind, message: impl Into<String>) -> Option<OfflineNotification> {
        if !self.settings.read().allows(kind) {
            return None;
        }

        let notification = OfflineNotification {
            id: Uuid::new_v4(),
            kind,
            message: message.into(),
            timestamp: Utc::now(),
        };

        {
            let mut buffer = self.buffer.lock();
            buffer.push_back(notification.clone());
            while buffer.len() > self.capacity {
                buffer.pop_front();
            }
        }

        // No subscribers is not an error
        let _ = self.broadcast_tx.send(notification.clone());
        tracing::debug!(kind = ?kind, message = %notification.message, "Notification emitted");
        Some(notification)
    }

    /// Oldest first
    pub fn list(&self) -> Vec<OfflineNotification> {
        self.buffer.lock().iter().cloned().collect()
    }

    pub fn clear(&self) {
        self.buffer.lock().clear();
    }

    pub fn subscribe(&self) -> broadcast::Receiver<OfflineNotification> {
        self.broadcast_tx.subscribe()
    }

    pub fn settings(&self) -> NotificationSettings {
        *self.settings.read()
    }

    /// Apply a partial update in memory and return the merged settings
    pub fn update_settings(&self, update: &NotificationSettingsUpdate) -> NotificationSettings {
        let mut settings = self.settings.write();
        settings.apply(update);
        *settings
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
