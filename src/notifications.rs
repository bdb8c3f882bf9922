//! In-process notification bus keyed by request or resource identity.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use slab::Slab;
use tracing::trace;

use crate::identity::NotificationKey;

/// What happened to the notified identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationOp {
    /// Cached data for the identity is stale.
    Invalidated,
    /// A request for the identity changed lifecycle state.
    State,
    /// A resource was added.
    Added,
    /// A resource was updated.
    Updated,
    /// A resource was removed.
    Removed,
}

/// Subscriber callback.
pub type NotificationCallback = Arc<dyn Fn(&NotificationKey, NotificationOp) + Send + Sync>;

/// Token returned by [`NotificationManager::subscribe`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle {
    index: usize,
    serial: u64,
}

struct Subscriber {
    serial: u64,
    key: NotificationKey,
    callback: NotificationCallback,
}

#[derive(Default)]
struct Registry {
    subscribers: Slab<Subscriber>,
    by_key: HashMap<NotificationKey, Vec<usize>, ahash::RandomState>,
}

/// Delivers lifecycle events to subscribers of an identity.
///
/// Callbacks run on the notifying thread, after the registry lock is
/// released, so a callback may subscribe, unsubscribe or notify again.
#[derive(Default)]
pub struct NotificationManager {
    registry: Mutex<Registry>,
    next_serial: AtomicU64,
}

impl fmt::Debug for NotificationManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NotificationManager")
            .field("subscribers", &self.registry.lock().subscribers.len())
            .finish()
    }
}

impl NotificationManager {
    /// An empty bus.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `callback` for events on `key`.
    pub fn subscribe(
        &self,
        key: impl Into<NotificationKey>,
        callback: impl Fn(&NotificationKey, NotificationOp) + Send + Sync + 'static,
    ) -> SubscriptionHandle {
        let key = key.into();
        let serial = self.next_serial.fetch_add(1, Ordering::Relaxed);
        let mut registry = self.registry.lock();
        let index = registry.subscribers.insert(Subscriber {
            serial,
            key: key.clone(),
            callback: Arc::new(callback),
        });
        trace!(%key, index, "subscribed");
        registry.by_key.entry(key).or_default().push(index);
        SubscriptionHandle { index, serial }
    }

    /// Remove a subscription. Returns `false` if it was already removed.
    pub fn unsubscribe(&self, handle: &SubscriptionHandle) -> bool {
        let mut registry = self.registry.lock();
        match registry.subscribers.get(handle.index) {
            Some(subscriber) if subscriber.serial == handle.serial => {}
            _ => return false,
        }
        let subscriber = registry.subscribers.remove(handle.index);
        if let Some(indices) = registry.by_key.get_mut(&subscriber.key) {
            indices.retain(|&index| index != handle.index);
            if indices.is_empty() {
                registry.by_key.remove(&subscriber.key);
            }
        }
        trace!(key = %subscriber.key, index = handle.index, "unsubscribed");
        true
    }

    /// Deliver `op` to every subscriber of `key`.
    pub fn notify(&self, key: impl Into<NotificationKey>, op: NotificationOp) {
        let key = key.into();
        let callbacks: Vec<NotificationCallback> = {
            let registry = self.registry.lock();
            registry
                .by_key
                .get(&key)
                .into_iter()
                .flatten()
                .filter_map(|&index| registry.subscribers.get(index))
                .map(|subscriber| subscriber.callback.clone())
                .collect()
        };
        trace!(%key, ?op, subscribers = callbacks.len(), "notify");
        for callback in callbacks {
            callback(&key, op);
        }
    }

    /// Number of live subscriptions on `key`.
    pub fn subscriber_count(&self, key: impl Into<NotificationKey>) -> usize {
        let key = key.into();
        self.registry.lock().by_key.get(&key).map_or(0, Vec::len)
    }
}
