//! Durable queue of pending mutations
//!
//! Mutations that could not be confirmed with the server are persisted here
//! and replayed by [`SyncQueue::drain`]. Each item follows
//! `Pending -> InFlight -> Success | RetryScheduled -> Pending | Failed`.
//! Success and Failed are terminal and remove the item; a retry only bumps
//! `retry_count`, the backoff itself happens inside the request layer while
//! the item is being dispatched.

use chrono::{DateTime, Utc};
use error_common::{sanitize_for_logging, RequestError};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::config::QueueConfig;
use crate::error::{SyncError, SyncResult};
use crate::network::NetworkMonitor;
use crate::notify::{NotificationHub, NotificationKind};
use crate::request::{AbortSignal, RequestClass, ResilientClient, RetryPolicy, TransportRequest};
use crate::store::LocalStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationAction {
    Create,
    Update,
    Delete,
}

impl MutationAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            MutationAction::Create => "create",
            MutationAction::Update => "update",
            MutationAction::Delete => "delete",
        }
    }
}

impl FromStr for MutationAction {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "create" => Ok(MutationAction::Create),
            "update" => Ok(MutationAction::Update),
            "delete" => Ok(MutationAction::Delete),
            _ => Err(SyncError::InvalidOperation(format!("Unknown mutation action: {}", s))),
        }
    }
}

/// Local record that becomes `synced` once its mutation is confirmed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DraftRef {
    pub collection: String,
    pub id: String,
}

impl DraftRef {
    pub fn new(collection: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            id: id.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncQueueItem {
    pub id: Uuid,
    pub resource_kind: String,
    pub action: MutationAction,
    pub payload: Value,
    pub draft: Option<DraftRef>,
    pub enqueued_at: DateTime<Utc>,
    pub retry_count: u32,
    pub last_error: Option<String>,
}

impl SyncQueueItem {
    pub fn new(resource_kind: impl Into<String>, action: MutationAction, payload: Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            resource_kind: resource_kind.into(),
            action,
            payload,
            draft: None,
            enqueued_at: Utc::now(),
            retry_count: 0,
            last_error: None,
        }
    }

    pub fn with_draft(mut self, draft: DraftRef) -> Self {
        self.draft = Some(draft);
        self
    }

    /// Resource id from `payload.id`, falling back to the linked draft
    pub fn resource_id(&self) -> Option<String> {
        match self.payload.get("id") {
            Some(Value::String(id)) => Some(id.clone()),
            Some(Value::Number(id)) => Some(id.to_string()),
            _ => self.draft.as_ref().map(|draft| draft.id.clone()),
        }
    }
}

/// Turns a queued mutation into a transport request
pub trait MutationRoutes: Send + Sync {
    fn request_for(&self, item: &SyncQueueItem) -> SyncResult<TransportRequest>;
}

/// `POST /{kind}`, `PUT /{kind}/{id}`, `DELETE /{kind}/{id}`
#[derive(Debug, Clone, Default)]
pub struct RestRoutes {
    prefix: String,
}

impl RestRoutes {
    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into().trim_end_matches('/').to_string(),
        }
    }
}

impl MutationRoutes for RestRoutes {
    fn request_for(&self, item: &SyncQueueItem) -> SyncResult<TransportRequest> {
        let collection = format!("{}/{}", self.prefix, item.resource_kind);
        if item.action == MutationAction::Create {
            return Ok(TransportRequest::post(collection, item.payload.clone()));
        }

        let id = item.resource_id().ok_or_else(|| {
            SyncError::InvalidOperation(format!(
                "{} on {} has no resource id",
                item.action.as_str(),
                item.resource_kind
            ))
        })?;
        let url = format!("{}/{}", collection, id);

        Ok(match item.action {
            MutationAction::Update => TransportRequest::put(url, item.payload.clone()),
            _ => TransportRequest::delete(url),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    AlreadyRunning,
    /// Offline, poor link or low battery
    NotSyncable,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub attempted: usize,
    pub succeeded: usize,
    pub retry_scheduled: usize,
    pub failed: usize,
    /// The link dropped mid-pass; remaining items stay pending
    pub interrupted: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainOutcome {
    Skipped(SkipReason),
    Completed(DrainReport),
}

/// Outcome of one failed dispatch
enum FailureState {
    RetryScheduled,
    Failed,
}

/// Releases the single-flight flag when the pass ends
struct DrainGuard<'a>(&'a AtomicBool);

impl<'a> DrainGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| DrainGuard(flag))
    }
}

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct SyncQueue {
    store: LocalStore,
    client: Arc<ResilientClient>,
    network: Arc<NetworkMonitor>,
    hub: Arc<NotificationHub>,
    routes: Arc<dyn MutationRoutes>,
    config: QueueConfig,
    in_progress: AtomicBool,
    /// Items whose persistence failed; drained like persisted ones
    fallback: Mutex<Vec<SyncQueueItem>>,
    /// Retry counts the store refused to persist
    retry_overrides: Mutex<HashMap<Uuid, (u32, String)>>,
    storage_failing: AtomicBool,
}

impl SyncQueue {
    pub fn new(
        store: LocalStore,
        client: Arc<ResilientClient>,
        network: Arc<NetworkMonitor>,
        hub: Arc<NotificationHub>,
        config: QueueConfig,
    ) -> Self {
        Self {
            store,
            client,
            network,
            hub,
            routes: Arc::new(RestRoutes::default()),
            config,
            in_progress: AtomicBool::new(false),
            fallback: Mutex::new(Vec::new()),
            retry_overrides: Mutex::new(HashMap::new()),
            storage_failing: AtomicBool::new(false),
        }
    }

    pub fn with_routes(mut self, routes: Arc<dyn MutationRoutes>) -> Self {
        self.routes = routes;
        self
    }

    pub fn is_draining(&self) -> bool {
        self.in_progress.load(Ordering::Acquire)
    }

    /// Append a mutation with `retry_count = 0`. Never performs network I/O
    /// and never fails: if the store rejects the write the item is kept in
    /// memory until it can be drained.
    pub async fn enqueue(
        &self,
        resource_kind: &str,
        action: MutationAction,
        payload: Value,
        draft: Option<DraftRef>,
    ) -> Uuid {
        let mut item = SyncQueueItem::new(resource_kind, action, payload);
        item.draft = draft;
        let id = item.id;

        match self.store.insert_queue_item(&item).await {
            Ok(()) => {
                tracing::info!(item_id = %id, kind = resource_kind, action = action.as_str(), "Mutation queued");
            }
            Err(e) => {
                tracing::warn!(
                    item_id = %id,
                    kind = resource_kind,
                    error = %e,
                    "Failed to persist queue item, holding it in memory"
                );
                self.fallback.lock().push(item);
                self.hub.notify(
                    NotificationKind::SyncFailed,
                    "Local storage is unavailable. Your change is kept until the app closes.",
                );
            }
        }

        self.hub
            .notify(NotificationKind::DataSaved, "Saved on this device. It will sync when you are back online.");
        id
    }

    /// All queued items, persisted and in-memory, in enqueue order
    pub async fn items(&self) -> Vec<SyncQueueItem> {
        let mut items = match self.store.queue_items().await {
            Ok(items) => items,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to read sync queue");
                Vec::new()
            }
        };
        {
            let overrides = self.retry_overrides.lock();
            for item in items.iter_mut() {
                if let Some((retry_count, last_error)) = overrides.get(&item.id) {
                    item.retry_count = *retry_count;
                    item.last_error = Some(last_error.clone());
                }
            }
        }
        items.extend(self.fallback.lock().iter().cloned());
        items.sort_by_key(|item| item.enqueued_at);
        items
    }

    pub async fn queued_count(&self) -> usize {
        self.items().await.len()
    }

    /// One pass over the queue.
    ///
    /// Returns immediately when another pass is running or the network
    /// monitor says syncing should wait. Emits at most one aggregated
    /// `sync_completed` and one aggregated `sync_failed` notification.
    pub async fn drain(&self) -> DrainOutcome {
        let Some(_guard) = DrainGuard::acquire(&self.in_progress) else {
            tracing::debug!("Drain already in progress");
            return DrainOutcome::Skipped(SkipReason::AlreadyRunning);
        };

        if !self.network.should_sync_now() {
            tracing::debug!(quality = ?self.network.get_network_quality(), "Sync deferred");
            return DrainOutcome::Skipped(SkipReason::NotSyncable);
        }

        let items = self.items().await;
        let policy = self.dispatch_policy();
        let mut report = DrainReport::default();

        for item in items {
            if !self.network.get_online_status() {
                tracing::info!(processed = report.attempted, "Network lost during drain, stopping");
                report.interrupted = true;
                break;
            }

            report.attempted += 1;
            match self.dispatch(&item, &policy).await {
                Ok(()) => {
                    self.complete(&item).await;
                    report.succeeded += 1;
                }
                Err(message) => match self.record_failure(item, message).await {
                    FailureState::RetryScheduled => report.retry_scheduled += 1,
                    FailureState::Failed => report.failed += 1,
                },
            }
        }

        if report.succeeded > 0 {
            let noun = if report.succeeded == 1 { "item" } else { "items" };
            self.hub
                .notify(NotificationKind::SyncCompleted, format!("{} {} synced", report.succeeded, noun));
        }
        if report.failed > 0 {
            let noun = if report.failed == 1 { "change" } else { "changes" };
            self.hub.notify(
                NotificationKind::SyncFailed,
                format!("{} {} could not be synced. Please try again.", report.failed, noun),
            );
        }

        tracing::info!(
            attempted = report.attempted,
            succeeded = report.succeeded,
            retry_scheduled = report.retry_scheduled,
            failed = report.failed,
            interrupted = report.interrupted,
            "Drain finished"
        );
        DrainOutcome::Completed(report)
    }

    async fn dispatch(&self, item: &SyncQueueItem, policy: &RetryPolicy) -> Result<(), String> {
        let request = self.routes.request_for(item).map_err(|e| e.to_string())?;
        let class = match item.action {
            MutationAction::Create | MutationAction::Update => RequestClass::WriteHeavy,
            MutationAction::Delete => RequestClass::Default,
        };

        match self
            .client
            .send_with_policy(&request, class, policy, AbortSignal::never())
            .await
        {
            Ok(_) => {
                tracing::debug!(item_id = %item.id, url = %request.url, "Dispatch succeeded");
                Ok(())
            }
            Err(e) => Err(describe_failure(&e)),
        }
    }

    async fn complete(&self, item: &SyncQueueItem) {
        self.retry_overrides.lock().remove(&item.id);
        if !self.take_fallback(item.id) {
            match self.store.remove_queue_item(item.id).await {
                Ok(_) => self.storage_recovered(),
                Err(e) => {
                    tracing::error!(item_id = %item.id, error = %e, "Failed to remove synced item");
                    self.storage_failed();
                }
            }
        }

        self.mark_draft_synced(item).await;
    }

    /// Flag the linked draft synced unless another queued mutation still
    /// carries a newer edit of it
    async fn mark_draft_synced(&self, item: &SyncQueueItem) {
        let Some(draft) = &item.draft else {
            return;
        };

        if self.has_pending_edit(draft, item.id).await {
            tracing::debug!(
                collection = %draft.collection,
                id = %draft.id,
                "Draft has a pending edit, leaving it unsynced"
            );
            return;
        }

        match self.store.mark_synced(&draft.collection, &draft.id).await {
            Ok(_) => self.storage_recovered(),
            Err(e) => {
                tracing::warn!(collection = %draft.collection, id = %draft.id, error = %e, "Failed to mark draft synced");
                self.storage_failed();
            }
        }
    }

    async fn has_pending_edit(&self, draft: &DraftRef, except: Uuid) -> bool {
        let references = |other: &SyncQueueItem| other.id != except && other.draft.as_ref() == Some(draft);

        if self.fallback.lock().iter().any(&references) {
            return true;
        }
        match self.store.queue_items().await {
            Ok(items) => items.iter().any(&references),
            Err(e) => {
                // Unknown queue state; leave the draft unsynced
                tracing::warn!(error = %e, "Failed to read sync queue");
                true
            }
        }
    }

    /// Send an item that was never queued, marking its draft synced on success
    pub(crate) async fn dispatch_direct(&self, item: &SyncQueueItem) -> Result<(), String> {
        self.dispatch(item, &self.dispatch_policy()).await?;
        self.mark_draft_synced(item).await;
        Ok(())
    }

    fn dispatch_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.config.dispatch_retries, self.config.dispatch_base_delay)
    }

    async fn record_failure(&self, mut item: SyncQueueItem, message: String) -> FailureState {
        item.retry_count += 1;

        if item.retry_count >= self.config.max_retries {
            tracing::warn!(
                item_id = %item.id,
                kind = %item.resource_kind,
                retries = item.retry_count,
                error = %message,
                "Mutation abandoned"
            );
            self.complete_failed(&item).await;
            return FailureState::Failed;
        }

        tracing::info!(item_id = %item.id, retry_count = item.retry_count, error = %message, "Retry scheduled");
        let in_memory = {
            let mut fallback = self.fallback.lock();
            match fallback.iter_mut().find(|held| held.id == item.id) {
                Some(held) => {
                    held.retry_count = item.retry_count;
                    held.last_error = Some(message.clone());
                    true
                }
                None => false,
            }
        };
        if !in_memory {
            match self.store.set_queue_retry(item.id, item.retry_count, &message).await {
                Ok(()) => {
                    self.retry_overrides.lock().remove(&item.id);
                    self.storage_recovered();
                }
                Err(e) => {
                    tracing::error!(item_id = %item.id, error = %e, "Failed to persist retry count");
                    self.retry_overrides
                        .lock()
                        .insert(item.id, (item.retry_count, message));
                    self.storage_failed();
                }
            }
        }
        FailureState::RetryScheduled
    }

    async fn complete_failed(&self, item: &SyncQueueItem) {
        self.retry_overrides.lock().remove(&item.id);
        if !self.take_fallback(item.id) {
            match self.store.remove_queue_item(item.id).await {
                Ok(_) => self.storage_recovered(),
                Err(e) => {
                    tracing::error!(item_id = %item.id, error = %e, "Failed to remove abandoned item");
                    self.storage_failed();
                }
            }
        }
    }

    /// Announce the first storage failure of an outage
    fn storage_failed(&self) {
        if !self.storage_failing.swap(true, Ordering::AcqRel) {
            self.hub.notify(
                NotificationKind::SyncFailed,
                "Local storage is unavailable. Sync progress may be lost if the app closes.",
            );
        }
    }

    fn storage_recovered(&self) {
        if self.storage_failing.swap(false, Ordering::AcqRel) {
            tracing::info!("Sync queue storage recovered");
        }
    }

    fn take_fallback(&self, id: Uuid) -> bool {
        let mut fallback = self.fallback.lock();
        let before = fallback.len();
        fallback.retain(|held| held.id != id);
        fallback.len() != before
    }

    /// Drain on a fixed interval until the task is aborted
    pub fn spawn_periodic(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let queue = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // First tick fires immediately
            ticker.tick().await;

            loop {
                ticker.tick().await;
                if let DrainOutcome::Skipped(reason) = queue.drain().await {
                    tracing::trace!(?reason, "Periodic drain skipped");
                }
            }
        })
    }
}

fn describe_failure(error: &RequestError) -> String {
    sanitize_for_logging(&error.to_string())
}
