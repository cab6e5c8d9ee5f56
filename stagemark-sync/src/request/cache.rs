//! In-memory response cache backing `cached_request`

use error_common::RequestResult;
use futures::future::{BoxFuture, Shared};
use moka::future::Cache;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

use super::retry::RetryPolicy;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Priority {
    /// Prefer freshness: one extra retry, half the stale window
    High,
    #[default]
    Normal,
    /// One retry fewer
    Low,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheOptions {
    /// Age until which a cached value is served without revalidation
    pub ttl: Duration,
    /// Age after which a cached value is never served
    pub max_stale_age: Duration,
    pub force_refresh: bool,
    pub priority: Priority,
}

impl CacheOptions {
    pub fn new(ttl: Duration, max_stale_age: Duration) -> Self {
        Self {
            ttl,
            max_stale_age,
            force_refresh: false,
            priority: Priority::Normal,
        }
    }

    pub fn force_refresh(mut self) -> Self {
        self.force_refresh = true;
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn effective_max_stale_age(&self) -> Duration {
        match self.priority {
            Priority::High => self.max_stale_age / 2,
            Priority::Normal | Priority::Low => self.max_stale_age,
        }
    }

    pub fn retry_policy(&self, base: &RetryPolicy) -> RetryPolicy {
        match self.priority {
            Priority::High => base.adjusted(1),
            Priority::Normal => *base,
            Priority::Low => base.adjusted(-1),
        }
    }
}

pub(crate) enum Lookup {
    Fresh(Value),
    /// Past its TTL but inside the stale window; serve and revalidate
    Stale(Value),
    Missing,
}

#[derive(Clone)]
struct CachedValue {
    value: Value,
    stored_at: Instant,
}

pub(crate) type SharedFetch = Shared<BoxFuture<'static, RequestResult<Value>>>;

/// Bounded response store with per-call freshness windows.
///
/// `moka` enforces the capacity and the retention ceiling; the fresh/stale
/// split is decided per lookup from `stored_at`.
pub(crate) struct ResponseCache {
    entries: Cache<String, CachedValue>,
    in_flight: Mutex<HashMap<String, SharedFetch>>,
}

impl ResponseCache {
    pub(crate) fn new(max_entries: u64, retention: Duration) -> Self {
        let entries = Cache::builder()
            .max_capacity(max_entries)
            .time_to_live(retention)
            .build();

        Self {
            entries,
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) async fn lookup(&self, key: &str, ttl: Duration, max_stale_age: Duration) -> Lookup {
        let Some(entry) = self.entries.get(key).await else {
            return Lookup::Missing;
        };

        let age = entry.stored_at.elapsed();
        if age >= max_stale_age {
            self.entries.invalidate(key).await;
            Lookup::Missing
        } else if age < ttl {
            Lookup::Fresh(entry.value)
        } else {
            Lookup::Stale(entry.value)
        }
    }

    pub(crate) async fn store(&self, key: &str, value: Value) {
        self.entries
            .insert(
                key.to_string(),
                CachedValue {
                    value,
                    stored_at: Instant::now(),
                },
            )
            .await;
    }

    pub(crate) async fn invalidate(&self, key: &str) -> bool {
        self.entries.remove(key).await.is_some()
    }

    pub(crate) fn clear(&self) {
        self.entries.invalidate_all();
    }

    pub(crate) async fn len(&self) -> u64 {
        self.entries.run_pending_tasks().await;
        self.entries.entry_count()
    }

    /// Join an in-flight fetch for `key`, or register the one built by `start`
    pub(crate) fn join_or_start<F>(&self, key: &str, start: F) -> SharedFetch
    where
        F: FnOnce() -> SharedFetch,
    {
        let mut in_flight = self.in_flight.lock();
        if let Some(existing) = in_flight.get(key) {
            return existing.clone();
        }
        let fetch = start();
        in_flight.insert(key.to_string(), fetch.clone());
        fetch
    }

    pub(crate) fn finish(&self, key: &str) {
        self.in_flight.lock().remove(key);
    }
}
