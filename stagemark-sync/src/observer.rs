//! Minimal subject/observer registry
//!
//! Replaces platform event buses: handlers are registered on a [`Subject`]
//! and receive every published value exactly once.

use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

type Handler<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct Registry<T> {
    handlers: RwLock<BTreeMap<u64, Handler<T>>>,
    next_id: AtomicU64,
}

/// A set of registered handlers for values of type `T`
pub struct Subject<T> {
    inner: Arc<Registry<T>>,
}

impl<T: 'static> Subject<T> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Registry {
                handlers: RwLock::new(BTreeMap::new()),
                next_id: AtomicU64::new(0),
            }),
        }
    }

    /// Register a handler; keep the returned [`Subscription`] to remove it later
    pub fn subscribe<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&T) + Send + Sync + 'static,
        T: Send + Sync,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.handlers.write().insert(id, Arc::new(handler));

        let registry: Weak<Registry<T>> = Arc::downgrade(&self.inner);
        Subscription {
            remove: Some(Box::new(move || {
                if let Some(registry) = registry.upgrade() {
                    registry.handlers.write().remove(&id);
                }
            })),
        }
    }

    /// Deliver `value` to every handler registered at call time
    pub fn publish(&self, value: &T) {
        // Snapshot so handlers may (un)subscribe without deadlocking
        let handlers: Vec<Handler<T>> = self.inner.handlers.read().values().cloned().collect();
        for handler in handlers {
            handler(value);
        }
    }

    pub fn len(&self) -> usize {
        self.inner.handlers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.inner.handlers.write().clear();
    }
}

impl<T: 'static> Default for Subject<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// De-registration handle returned by [`Subject::subscribe`]
///
/// Dropping the handle does not unsubscribe; call [`Subscription::unsubscribe`].
#[must_use = "keep the subscription to be able to unsubscribe"]
pub struct Subscription {
    remove: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    pub fn unsubscribe(mut self) {
        if let Some(remove) = self.remove.take() {
            remove();
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.remove.is_some())
            .finish()
    }
}
