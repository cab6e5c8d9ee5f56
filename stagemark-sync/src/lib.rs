//! Offline-first synchronization engine for Stagemark
//!
//! Provides:
//! - Network monitor with online/offline listeners and link quality
//! - Local SQLite store for drafts, cached entities and the sync queue
//! - Read-through entity cache for offline reads
//! - Durable mutation queue with single-flight draining and a retry cap
//! - Resilient request client (adaptive timeouts, backoff, cancellation,
//!   stale-while-revalidate response cache)
//! - Notification hub for user-facing sync events
//!
//! [`OfflineEngine`] wires everything together:
//!
//! ```no_run
//! use std::sync::Arc;
//! use stagemark_sync::{EngineConfig, HttpTransport, NetworkMonitor, OfflineEngine};
//!
//! # async fn run() -> stagemark_sync::SyncResult<()> {
//! let transport = Arc::new(HttpTransport::new("https://api.stagemark.app/v1")?);
//! let network = Arc::new(NetworkMonitor::new(true));
//! let engine = OfflineEngine::init(EngineConfig::from_env()?, transport, network.clone()).await?;
//!
//! network.set_online(false);
//! // ... writes are queued and replayed once the host reports the link back
//! network.set_online(true);
//!
//! engine.dispose().await;
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod config;
pub mod engine;
pub mod error;
pub mod logging;
pub mod network;
pub mod notify;
pub mod observer;
pub mod queue;
pub mod request;
pub mod store;

pub use cache::{CacheEntry, CacheManager};
pub use config::{CacheConfig, EngineConfig, NotificationConfig, QueueConfig, RequestConfig, StoreConfig};
pub use engine::{OfflineEngine, SaveOutcome, SyncStatus};
pub use error::{SyncError, SyncResult};
pub use logging::{init_tracing, LogFormat};
pub use network::{BatteryProbe, BatteryStatus, LinkType, NetworkMonitor, NetworkQuality, NetworkSpeed, NetworkState};
pub use notify::{
    NotificationHub, NotificationKind, NotificationSettings, NotificationSettingsUpdate, OfflineNotification,
};
pub use observer::{Subject, Subscription};
pub use queue::{
    DrainOutcome, DrainReport, DraftRef, MutationAction, MutationRoutes, RestRoutes, SkipReason, SyncQueue,
    SyncQueueItem,
};
pub use request::{
    CacheOptions, HttpTransport, Method, Priority, RequestClass, ResilientClient, RetryPolicy, TimeoutContext,
    Transport, TransportRequest,
};
pub use store::{LocalRecord, LocalStore, RecordIndex};

pub use error_common::RequestError;
