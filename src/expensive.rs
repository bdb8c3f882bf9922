//! Coarse change notification for consumers that re-derive everything.
//!
//! An [`ExpensiveSubscription`] listens on a request's identity and on every
//! resource its result refers to. Any event schedules the callback once on
//! the next task turn; events arriving before it ran are merged into that
//! single call.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tracing::trace;

use crate::document::ResourceKeys;
use crate::future::RequestFuture;
use crate::identity::NotificationKey;
use crate::notifications::SubscriptionHandle;
use crate::subscription::Store;

#[derive(Default)]
struct Watch {
    keys: Vec<NotificationKey>,
    handles: Vec<SubscriptionHandle>,
    scheduled: bool,
    disposed: bool,
}

struct Shared<T: 'static> {
    store: Arc<dyn Store<T>>,
    future: RequestFuture<T>,
    callback: Box<dyn Fn() + Send + Sync>,
    watch: Mutex<Watch>,
}

impl<T: 'static> Drop for Shared<T> {
    fn drop(&mut self) {
        let notifications = self.store.notifications();
        for handle in self.watch.get_mut().handles.drain(..) {
            notifications.unsubscribe(&handle);
        }
    }
}

/// Calls back once per burst of notifications touching a request or any of
/// its resources.
pub struct ExpensiveSubscription<T: 'static> {
    shared: Arc<Shared<T>>,
}

impl<T: 'static> Clone for ExpensiveSubscription<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T: 'static> fmt::Debug for ExpensiveSubscription<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let watch = self.shared.watch.lock();
        f.debug_struct("ExpensiveSubscription")
            .field("future", &self.shared.future)
            .field("keys", &watch.keys)
            .field("disposed", &watch.disposed)
            .finish()
    }
}

impl<T> ExpensiveSubscription<T>
where
    T: ResourceKeys + Send + Sync + 'static,
{
    /// Watch `future` and, once it resolves, the resources it refers to.
    pub fn new(
        store: Arc<dyn Store<T>>,
        future: RequestFuture<T>,
        callback: impl Fn() + Send + Sync + 'static,
    ) -> Self {
        let subscription = Self {
            shared: Arc::new(Shared {
                store,
                future: future.clone(),
                callback: Box::new(callback),
                watch: Mutex::new(Watch::default()),
            }),
        };
        subscription.resubscribe();

        let weak = Arc::downgrade(&subscription.shared);
        future.on_settle(move |_| {
            if let Some(shared) = weak.upgrade() {
                ExpensiveSubscription { shared }.resubscribe();
            }
        });
        subscription
    }

    /// Identities currently listened on.
    pub fn keys(&self) -> Vec<NotificationKey> {
        self.shared.watch.lock().keys.clone()
    }

    /// Move the bus subscriptions to the current result's resources.
    ///
    /// Call after the cached result changed shape; no-op if the set of
    /// identities is unchanged.
    pub fn resubscribe(&self) {
        let keys = self.wanted_keys();
        let stale = {
            let mut watch = self.shared.watch.lock();
            if watch.disposed || watch.keys == keys {
                return;
            }
            watch.keys = keys.clone();
            std::mem::take(&mut watch.handles)
        };

        let notifications = self.shared.store.notifications();
        for handle in &stale {
            notifications.unsubscribe(handle);
        }
        let handles: Vec<_> = keys
            .iter()
            .map(|key| {
                let weak = Arc::downgrade(&self.shared);
                notifications.subscribe(key.clone(), move |_, _| {
                    if let Some(shared) = weak.upgrade() {
                        ExpensiveSubscription { shared }.schedule();
                    }
                })
            })
            .collect();
        trace!(keys = keys.len(), "expensive subscription resubscribed");

        let mut watch = self.shared.watch.lock();
        if watch.disposed {
            drop(watch);
            for handle in &handles {
                notifications.unsubscribe(handle);
            }
            return;
        }
        watch.handles = handles;
    }

    /// Stop listening. Idempotent; a scheduled callback no longer runs.
    pub fn dispose(&self) {
        let handles = {
            let mut watch = self.shared.watch.lock();
            if watch.disposed {
                return;
            }
            watch.disposed = true;
            watch.keys.clear();
            std::mem::take(&mut watch.handles)
        };
        let notifications = self.shared.store.notifications();
        for handle in &handles {
            notifications.unsubscribe(handle);
        }
    }

    fn wanted_keys(&self) -> Vec<NotificationKey> {
        let mut keys: Vec<NotificationKey> = Vec::new();
        if let Some(lid) = self.shared.future.lid() {
            keys.push(lid.clone().into());
        }
        if let Some(Ok(doc)) = self.shared.future.peek() {
            for key in doc.content.resource_keys() {
                let key = NotificationKey::from(key);
                if !keys.contains(&key) {
                    keys.push(key);
                }
            }
        }
        keys
    }

    fn schedule(&self) {
        {
            let mut watch = self.shared.watch.lock();
            if watch.scheduled || watch.disposed {
                return;
            }
            watch.scheduled = true;
        }
        match Handle::try_current() {
            Ok(runtime) => {
                let this = self.clone();
                runtime.spawn(async move { this.run() });
            }
            Err(_) => self.run(),
        }
    }

    fn run(&self) {
        {
            let mut watch = self.shared.watch.lock();
            watch.scheduled = false;
            if watch.disposed {
                return;
            }
        }
        (self.shared.callback)();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::RequestInfo;
    use crate::future::Requester;
    use crate::identity::{RequestKey, ResourceKey};
    use crate::notifications::{NotificationManager, NotificationOp};
    use crate::subscription::RequestPriority;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Members(Vec<&'static str>);

    impl ResourceKeys for Members {
        fn resource_keys(&self) -> Vec<ResourceKey> {
            self.0.iter().map(|id| ResourceKey::new("user", *id)).collect()
        }
    }

    #[derive(Default)]
    struct Bus(NotificationManager);

    impl Requester<Members> for Bus {
        fn request(&self, info: RequestInfo) -> RequestFuture<Members> {
            RequestFuture::builder(info).build().0
        }
    }

    impl Store<Members> for Bus {
        fn notifications(&self) -> &NotificationManager {
            &self.0
        }

        fn in_flight_priority(&self, _: &RequestKey) -> Option<RequestPriority> {
            None
        }
    }

    #[tokio::test]
    async fn coalesces_a_burst_into_one_call() {
        let store = Arc::new(Bus::default());
        let (future, resolver) = RequestFuture::builder(RequestInfo::get("/users"))
            .lid(RequestKey::new("users"))
            .build();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let subscription = ExpensiveSubscription::new(store.clone(), future, move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(subscription.keys().len(), 1);

        resolver.resolve(Members(vec!["1", "2", "1"]), None);
        assert_eq!(subscription.keys().len(), 3);

        let bus = &store.0;
        bus.notify(RequestKey::new("users"), NotificationOp::State);
        bus.notify(ResourceKey::new("user", "1"), NotificationOp::Updated);
        bus.notify(ResourceKey::new("user", "2"), NotificationOp::Removed);
        tokio::task::yield_now().await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        bus.notify(ResourceKey::new("user", "2"), NotificationOp::Updated);
        tokio::task::yield_now().await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        subscription.dispose();
        subscription.dispose();
        bus.notify(RequestKey::new("users"), NotificationOp::State);
        tokio::task::yield_now().await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(bus.subscriber_count(ResourceKey::new("user", "1")), 0);
    }
}
