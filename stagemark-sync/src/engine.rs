//! Engine service object
//!
//! [`OfflineEngine`] owns one instance of every component and wires them
//! together: the online listener that drains the queue, the periodic sync
//! timer and the cache cleanup timer. Tests build isolated engines; nothing
//! here is global.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::cache::CacheManager;
use crate::config::EngineConfig;
use crate::error::{SyncError, SyncResult};
use crate::network::NetworkMonitor;
use crate::notify::{NotificationHub, NotificationKind, NotificationSettings, NotificationSettingsUpdate};
use crate::observer::Subscription;
use crate::queue::{DraftRef, DrainOutcome, MutationAction, MutationRoutes, SyncQueue, SyncQueueItem};
use crate::request::{ResilientClient, Transport};
use crate::store::{LocalRecord, LocalStore};

/// Counts shown by the sync indicator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    /// Local drafts not yet confirmed by the server
    pub unsynced_count: u64,
    pub queued_count: usize,
    pub is_online: bool,
    pub sync_in_progress: bool,
}

/// Where a saved draft ended up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveOutcome {
    /// Confirmed by the server right away
    Synced,
    /// Queued for the next drain
    Queued(Uuid),
}

pub struct OfflineEngine {
    config: EngineConfig,
    store: LocalStore,
    network: Arc<NetworkMonitor>,
    hub: Arc<NotificationHub>,
    client: Arc<ResilientClient>,
    cache: Arc<CacheManager>,
    queue: Arc<SyncQueue>,
    online_subscription: Mutex<Option<Subscription>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    disposed: AtomicBool,
}

impl OfflineEngine {
    /// Build every component and start the background tasks.
    ///
    /// `network` is owned by the host, which feeds it platform events and
    /// may attach a battery probe. Must be called from within a Tokio runtime.
    pub async fn init(
        config: EngineConfig,
        transport: Arc<dyn Transport>,
        network: Arc<NetworkMonitor>,
    ) -> SyncResult<Self> {
        Self::init_with_routes(config, transport, network, None).await
    }

    pub async fn init_with_routes(
        config: EngineConfig,
        transport: Arc<dyn Transport>,
        network: Arc<NetworkMonitor>,
        routes: Option<Arc<dyn MutationRoutes>>,
    ) -> SyncResult<Self> {
        config.validate()?;
        let runtime = Handle::try_current()
            .map_err(|e| SyncError::Configuration(format!("No Tokio runtime: {}", e)))?;

        let store = LocalStore::open(&config.store).await?;
        let settings = match NotificationSettings::load(&store).await {
            Ok(settings) => settings,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to load notification settings, using defaults");
                NotificationSettings::default()
            }
        };

        let hub = Arc::new(NotificationHub::new(config.notifications.capacity, settings));
        let client = Arc::new(ResilientClient::new(
            transport,
            network.clone(),
            config.request.clone(),
            &config.cache,
        ));
        let cache = Arc::new(CacheManager::new(store.clone(), hub.clone()));

        let mut queue = SyncQueue::new(
            store.clone(),
            client.clone(),
            network.clone(),
            hub.clone(),
            config.queue.clone(),
        );
        if let Some(routes) = routes {
            queue = queue.with_routes(routes);
        }
        let queue = Arc::new(queue);

        let subscription = Self::watch_network(&network, Arc::downgrade(&queue), hub.clone(), runtime);
        let tasks = vec![
            queue.spawn_periodic(config.queue.sync_interval),
            cache.spawn_cleanup(config.cache.cleanup_interval, config.cache.max_age),
        ];

        tracing::info!(
            db_path = %config.store.db_path,
            online = network.get_online_status(),
            sync_interval_secs = config.queue.sync_interval.as_secs(),
            "Offline engine started"
        );

        Ok(Self {
            config,
            store,
            network,
            hub,
            client,
            cache,
            queue,
            online_subscription: Mutex::new(Some(subscription)),
            tasks: Mutex::new(tasks),
            disposed: AtomicBool::new(false),
        })
    }

    /// Drain once on every transition to online; announce going offline
    fn watch_network(
        network: &NetworkMonitor,
        queue: Weak<SyncQueue>,
        hub: Arc<NotificationHub>,
        runtime: Handle,
    ) -> Subscription {
        network.add_online_listener(move |online| {
            if !online {
                hub.notify(
                    NotificationKind::OfflineMode,
                    "You are offline. Changes will be saved on this device.",
                );
                return;
            }

            if let Some(queue) = queue.upgrade() {
                runtime.spawn(async move {
                    let outcome = queue.drain().await;
                    tracing::debug!(?outcome, "Drain after reconnect");
                });
            }
        })
    }

    /// Stop timers, drop listeners and close the store. Idempotent.
    pub async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }

        if let Some(subscription) = self.online_subscription.lock().take() {
            subscription.unsubscribe();
        }
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        self.store.close().await;
        tracing::info!("Offline engine disposed");
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    fn ensure_active(&self) -> SyncResult<()> {
        if self.is_disposed() {
            Err(SyncError::Disposed)
        } else {
            Ok(())
        }
    }

    /// Queue a mutation for the next drain
    pub async fn enqueue(
        &self,
        resource_kind: &str,
        action: MutationAction,
        payload: Value,
        draft: Option<DraftRef>,
    ) -> SyncResult<Uuid> {
        self.ensure_active()?;
        Ok(self.queue.enqueue(resource_kind, action, payload, draft).await)
    }

    pub async fn drain(&self) -> DrainOutcome {
        self.queue.drain().await
    }

    /// Optimistic write of a local draft followed by either an immediate
    /// dispatch (when the link allows syncing) or a queued mutation.
    pub async fn save_draft(
        &self,
        draft: LocalRecord,
        resource_kind: &str,
        action: MutationAction,
    ) -> SyncResult<SaveOutcome> {
        self.ensure_active()?;

        let draft = draft.with_synced(false);
        if let Err(e) = self.store.put(&draft).await {
            tracing::warn!(collection = %draft.collection, id = %draft.id, error = %e, "Draft not persisted");
            self.hub.notify(
                NotificationKind::SyncFailed,
                "Local storage is unavailable. Your change may be lost if the app closes.",
            );
        }

        let draft_ref = DraftRef::new(&draft.collection, &draft.id);
        if self.network.should_sync_now() {
            let item = SyncQueueItem::new(resource_kind, action, draft.payload.clone()).with_draft(draft_ref.clone());
            match self.queue.dispatch_direct(&item).await {
                Ok(()) => return Ok(SaveOutcome::Synced),
                Err(message) => {
                    tracing::info!(kind = resource_kind, error = %message, "Direct save failed, queueing");
                }
            }
        }

        let id = self
            .queue
            .enqueue(resource_kind, action, draft.payload, Some(draft_ref))
            .await;
        Ok(SaveOutcome::Queued(id))
    }

    pub async fn sync_status(&self) -> SyncStatus {
        let unsynced_count = match self.store.count_unsynced().await {
            Ok(n) => n,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to count unsynced records");
                0
            }
        };

        SyncStatus {
            unsynced_count,
            queued_count: self.queue.queued_count().await,
            is_online: self.network.get_online_status(),
            sync_in_progress: self.queue.is_draining(),
        }
    }

    pub fn notification_settings(&self) -> NotificationSettings {
        self.hub.settings()
    }

    /// Merge `update` into the current settings and persist the result.
    /// A failed write keeps the new settings for this session only.
    pub async fn update_notification_settings(&self, update: &NotificationSettingsUpdate) -> NotificationSettings {
        let settings = self.hub.update_settings(update);
        if let Err(e) = settings.save(&self.store).await {
            tracing::warn!(error = %e, "Failed to persist notification settings");
        }
        settings
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &LocalStore {
        &self.store
    }

    pub fn network(&self) -> &Arc<NetworkMonitor> {
        &self.network
    }

    pub fn notifications(&self) -> &Arc<NotificationHub> {
        &self.hub
    }

    pub fn client(&self) -> &Arc<ResilientClient> {
        &self.client
    }

    pub fn cache(&self) -> &Arc<CacheManager> {
        &self.cache
    }

    pub fn queue(&self) -> &Arc<SyncQueue> {
        &self.queue
    }
}
