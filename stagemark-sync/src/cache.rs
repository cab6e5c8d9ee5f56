//! Read-through cache of remote entities
//!
//! Each entity kind lives in its own `cache:<kind>` collection of the local
//! store. Callers write after every successful authoritative read and read
//! back while offline. Nothing expires on read; [`CacheManager::cleanup`]
//! evicts old entries on its own schedule.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

use crate::error::SyncError;
use crate::notify::{NotificationHub, NotificationKind};
use crate::store::{LocalRecord, LocalStore};

const COLLECTION_PREFIX: &str = "cache:";

/// Last known server-confirmed state of a remote entity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub id: String,
    pub payload: Value,
    pub last_modified: DateTime<Utc>,
    pub cached: bool,
}

impl From<LocalRecord> for CacheEntry {
    fn from(record: LocalRecord) -> Self {
        Self {
            id: record.id,
            payload: record.payload,
            last_modified: record.last_modified,
            cached: true,
        }
    }
}

fn collection_for(kind: &str) -> String {
    format!("{}{}", COLLECTION_PREFIX, kind)
}

pub struct CacheManager {
    store: LocalStore,
    hub: Arc<NotificationHub>,
    /// Entries written while the store was failing, keyed by (kind, id)
    degraded: RwLock<HashMap<(String, String), CacheEntry>>,
    storage_failing: AtomicBool,
}

impl CacheManager {
    pub fn new(store: LocalStore, hub: Arc<NotificationHub>) -> Self {
        Self {
            store,
            hub,
            degraded: RwLock::new(HashMap::new()),
            storage_failing: AtomicBool::new(false),
        }
    }

    /// Store or overwrite the cached value, stamped with the current time
    pub async fn cache_entity(&self, kind: &str, id: &str, payload: Value) {
        let record = LocalRecord::new(collection_for(kind), id, payload).with_synced(true);

        match self.store.put(&record).await {
            Ok(()) => {
                self.recover();
                self.degraded.write().remove(&(kind.to_string(), id.to_string()));
                tracing::trace!(kind, id, "Entity cached");
            }
            Err(e) => {
                self.degrade(&e, "write");
                self.degraded
                    .write()
                    .insert((kind.to_string(), id.to_string()), CacheEntry::from(record));
            }
        }
    }

    /// Last cached payload, or `None` if the entity was never cached
    pub async fn get_cached_entity(&self, kind: &str, id: &str) -> Option<Value> {
        self.get_cache_entry(kind, id).await.map(|entry| entry.payload)
    }

    pub async fn get_cache_entry(&self, kind: &str, id: &str) -> Option<CacheEntry> {
        let key = (kind.to_string(), id.to_string());
        match self.store.get(&collection_for(kind), id).await {
            Ok(Some(record)) => Some(record.into()),
            Ok(None) => self.degraded.read().get(&key).cloned(),
            Err(e) => {
                self.degrade(&e, "read");
                self.degraded.read().get(&key).cloned()
            }
        }
    }

    /// Clear one kind, or every kind when `kind` is `None`
    pub async fn clear_cache(&self, kind: Option<&str>) {
        let kinds = match kind {
            Some(kind) => vec![kind.to_string()],
            None => self.kinds().await,
        };

        for kind in &kinds {
            match self.store.clear(&collection_for(kind)).await {
                Ok(removed) => tracing::debug!(kind = %kind, removed, "Cache cleared"),
                Err(e) => self.degrade(&e, "clear"),
            }
        }

        let mut degraded = self.degraded.write();
        match kind {
            Some(kind) => degraded.retain(|(k, _), _| k != kind),
            None => degraded.clear(),
        }
    }

    /// Entity kinds with at least one persisted entry
    pub async fn kinds(&self) -> Vec<String> {
        match self.store.collections().await {
            Ok(collections) => collections
                .into_iter()
                .filter_map(|c| c.strip_prefix(COLLECTION_PREFIX).map(str::to_string))
                .collect(),
            Err(e) => {
                self.degrade(&e, "list");
                Vec::new()
            }
        }
    }

    /// Evict entries last written more than `max_age` ago, across all kinds
    pub async fn cleanup(&self, max_age: Duration) -> u64 {
        let cutoff = match chrono::Duration::from_std(max_age) {
            Ok(age) => Utc::now() - age,
            Err(_) => return 0,
        };

        let mut evicted = 0;
        for kind in self.kinds().await {
            match self.store.prune_older_than(&collection_for(&kind), cutoff).await {
                Ok(n) => evicted += n,
                Err(e) => self.degrade(&e, "cleanup"),
            }
        }

        let dropped = {
            let mut degraded = self.degraded.write();
            let before = degraded.len();
            degraded.retain(|_, entry| entry.last_modified >= cutoff);
            before - degraded.len()
        };
        evicted += u64::try_from(dropped).unwrap_or_default();

        if evicted > 0 {
            tracing::info!(evicted, max_age_secs = max_age.as_secs(), "Cache cleanup");
        }
        evicted
    }

    /// Run [`Self::cleanup`] every `interval` until the task is aborted
    pub fn spawn_cleanup(self: &Arc<Self>, interval: Duration, max_age: Duration) -> JoinHandle<()> {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                cache.cleanup(max_age).await;
            }
        })
    }

    /// Log every failure; notify once per outage
    fn degrade(&self, error: &SyncError, operation: &str) {
        tracing::warn!(operation, error = %error, "Cache storage unavailable, using memory");
        if !self.storage_failing.swap(true, Ordering::AcqRel) {
            self.hub.notify(
                NotificationKind::SyncFailed,
                "Offline storage is unavailable. Some data may not be available offline.",
            );
        }
    }

    fn recover(&self) {
        if self.storage_failing.swap(false, Ordering::AcqRel) {
            tracing::info!("Cache storage recovered");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::NetworkMonitor;
    use serde_json::json;

    async fn manager() -> (LocalStore, Arc<NotificationHub>, CacheManager) {
        let store = LocalStore::in_memory().await.unwrap();
        let hub = Arc::new(NotificationHub::new(50, Default::default()));
        let cache = CacheManager::new(store.clone(), hub.clone());
        (store, hub, cache)
    }

    #[tokio::test]
    async fn test_offline_read_fallback() {
        let (_store, _hub, cache) = manager().await;
        let network = NetworkMonitor::new(true);

        cache.cache_entity("session", "S1", json!({"name": "X"})).await;
        network.set_online(false);

        assert!(!network.get_online_status());
        assert_eq!(cache.get_cached_entity("session", "S1").await, Some(json!({"name": "X"})));
        assert_eq!(cache.get_cached_entity("session", "S2").await, None);
    }

    #[tokio::test]
    async fn test_overwrite_and_entry_metadata() {
        let (store, _hub, cache) = manager().await;
        cache.cache_entity("template", "T1", json!({"v": 1})).await;
        cache.cache_entity("template", "T1", json!({"v": 2})).await;

        let entry = cache.get_cache_entry("template", "T1").await.unwrap();
        assert_eq!(entry.payload, json!({"v": 2}));
        assert!(entry.cached);

        // Cached entities never count as unsynced drafts
        assert_eq!(store.count_unsynced().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_clear_one_kind_or_all() {
        let (_store, _hub, cache) = manager().await;
        cache.cache_entity("session", "S1", json!(1)).await;
        cache.cache_entity("video", "V1", json!(2)).await;
        cache.cache_entity("template", "T1", json!(3)).await;

        cache.clear_cache(Some("session")).await;
        assert_eq!(cache.get_cached_entity("session", "S1").await, None);
        assert!(cache.get_cached_entity("video", "V1").await.is_some());

        cache.clear_cache(None).await;
        assert!(cache.kinds().await.is_empty());
    }

    #[tokio::test]
    async fn test_cleanup_evicts_old_entries() {
        let (store, _hub, cache) = manager().await;
        let mut old = LocalRecord::new(collection_for("session"), "OLD", json!({})).with_synced(true);
        old.last_modified = Utc::now() - chrono::Duration::days(10);
        store.put(&old).await.unwrap();
        cache.cache_entity("session", "NEW", json!({})).await;

        let evicted = cache.cleanup(Duration::from_secs(7 * 24 * 60 * 60)).await;

        assert_eq!(evicted, 1);
        assert_eq!(cache.get_cached_entity("session", "OLD").await, None);
        assert!(cache.get_cached_entity("session", "NEW").await.is_some());
    }

    #[tokio::test]
    async fn test_storage_failure_degrades_to_memory() {
        let (store, hub, cache) = manager().await;
        store.close().await;

        cache.cache_entity("session", "S1", json!({"name": "X"})).await;

        assert_eq!(cache.get_cached_entity("session", "S1").await, Some(json!({"name": "X"})));
        assert!(hub.list().iter().any(|n| n.kind == NotificationKind::SyncFailed));
    }

    #[tokio::test]
    async fn test_outage_is_announced_once() {
        let (store, hub, cache) = manager().await;
        store.close().await;

        cache.cache_entity("session", "S1", json!({"name": "X"})).await;
        for _ in 0..60 {
            cache.get_cached_entity("session", "S1").await;
        }

        let alerts = hub
            .list()
            .iter()
            .filter(|n| n.kind == NotificationKind::SyncFailed)
            .count();
        assert_eq!(alerts, 1);
    }

    #[tokio::test]
    async fn test_cleanup_task_evicts_on_its_own() {
        let (store, _hub, cache) = manager().await;
        let cache = Arc::new(cache);
        let mut old = LocalRecord::new(collection_for("video"), "V-OLD", json!({})).with_synced(true);
        old.last_modified = Utc::now() - chrono::Duration::days(30);
        store.put(&old).await.unwrap();
        cache.cache_entity("video", "V-NEW", json!({})).await;

        let task = cache.spawn_cleanup(Duration::from_millis(20), Duration::from_secs(7 * 24 * 60 * 60));
        for _ in 0..100 {
            if cache.get_cache_entry("video", "V-OLD").await.is_none() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        task.abort();

        assert_eq!(cache.get_cached_entity("video", "V-OLD").await, None);
        assert!(cache.get_cached_entity("video", "V-NEW").await.is_some());
    }
}
