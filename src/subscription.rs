//! Autonomous refresh control loop for one logical request slot.
//!
//! A [`RequestSubscription`] owns the "current request" of a slot. The
//! request is either supplied by the caller (a future or a query) or reissued
//! by the subscription itself when one of its [`AutorefreshPolicy`] conditions
//! holds: the request was invalidated, the network came back after a long
//! outage, or the polling interval elapsed.
//!
//! [`AutorefreshPolicy`]: crate::AutorefreshPolicy

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::connectivity::{Connectivity, NetworkStatus};
use crate::document::{RequestInfo, StructuredDataDocument};
use crate::error::SubscriptionError;
use crate::future::{RequestFuture, Requester};
use crate::identity::{FutureId, RequestKey};
use crate::notifications::{NotificationManager, NotificationOp, SubscriptionHandle};
use crate::options::{RefreshMode, SubscriptionOptions};
use crate::request_state::{get_request_state, RequestState};
use crate::signal::Signal;

// ============================================================================
// Collaborators
// ============================================================================

/// Priority of the request in flight for an identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RequestPriority {
    /// The request must be fulfilled from the network and consumers block
    /// on it.
    pub blocking: bool,
}

/// A requester that also owns a notification bus and knows which requests
/// are in flight.
pub trait Store<T>: Requester<T> {
    /// The bus request and resource lifecycle events are published on.
    fn notifications(&self) -> &NotificationManager;

    /// Priority of the request currently in flight for `key`, if any.
    fn in_flight_priority(&self, key: &RequestKey) -> Option<RequestPriority>;
}

// ============================================================================
// Arguments
// ============================================================================

/// Where the slot's request comes from.
pub enum RequestSource<T> {
    /// A request issued by the caller.
    Request(RequestFuture<T>),
    /// A query the subscription issues through the store.
    Query(RequestInfo),
}

impl<T> Clone for RequestSource<T> {
    fn clone(&self) -> Self {
        match self {
            RequestSource::Request(future) => RequestSource::Request(future.clone()),
            RequestSource::Query(info) => RequestSource::Query(info.clone()),
        }
    }
}

impl<T> fmt::Debug for RequestSource<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestSource::Request(future) => f.debug_tuple("Request").field(future).finish(),
            RequestSource::Query(info) => f.debug_tuple("Query").field(info).finish(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum SourceIdentity {
    Request(FutureId),
    Query(RequestInfo),
}

impl<T: Send + Sync + 'static> RequestSource<T> {
    fn identity(&self) -> SourceIdentity {
        match self {
            RequestSource::Request(future) => SourceIdentity::Request(future.id()),
            RequestSource::Query(info) => SourceIdentity::Query(info.clone()),
        }
    }
}

/// Inputs of a [`RequestSubscription`], replaceable with
/// [`RequestSubscription::set_args`].
pub struct SubscriptionArgs<T> {
    /// The request or query to follow; `None` leaves the slot idle.
    pub source: Option<RequestSource<T>>,
    /// Autorefresh settings.
    pub options: SubscriptionOptions,
}

impl<T> SubscriptionArgs<T> {
    /// Follow an issued request.
    pub fn request(future: RequestFuture<T>) -> Self {
        Self {
            source: Some(RequestSource::Request(future)),
            options: SubscriptionOptions::default(),
        }
    }

    /// Issue and follow a query.
    pub fn query(info: RequestInfo) -> Self {
        Self {
            source: Some(RequestSource::Query(info)),
            options: SubscriptionOptions::default(),
        }
    }

    /// Follow nothing.
    pub fn idle() -> Self {
        Self {
            source: None,
            options: SubscriptionOptions::default(),
        }
    }

    /// Replace the autorefresh settings.
    pub fn with_options(mut self, options: SubscriptionOptions) -> Self {
        self.options = options;
        self
    }
}

impl<T> Clone for SubscriptionArgs<T> {
    fn clone(&self) -> Self {
        Self {
            source: self.source.clone(),
            options: self.options.clone(),
        }
    }
}

impl<T> fmt::Debug for SubscriptionArgs<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionArgs")
            .field("source", &self.source)
            .field("options", &self.options)
            .finish()
    }
}

/// What an error view needs to offer recovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ErrorFeatures {
    /// The network is reachable.
    pub is_online: bool,
    /// The surface is in the background.
    pub is_hidden: bool,
}

/// What a content view needs to offer refreshing.
#[derive(Debug)]
pub struct ContentFeatures<T> {
    /// The network is reachable.
    pub is_online: bool,
    /// The surface is in the background.
    pub is_hidden: bool,
    /// A background refresh is in flight; it can be cancelled with
    /// [`RequestSubscription::abort_refresh`].
    pub is_refreshing: bool,
    /// The latest request issued by the subscription.
    pub latest_request: Option<RequestFuture<T>>,
}

// ============================================================================
// Subscription
// ============================================================================

struct Slot<T> {
    args: SubscriptionArgs<T>,
    /// Identity of the source the current request was resolved from.
    adopted: Option<SourceIdentity>,
    resolved: Option<RequestFuture<T>>,
    /// Latest blocking reissue; shadows `resolved` while the source is
    /// unchanged.
    local_request: Option<RequestFuture<T>>,
    latest_request: Option<RequestFuture<T>>,
    subscribed_to: Option<RequestKey>,
    subscription: Option<SubscriptionHandle>,
    status: NetworkStatus,
    is_refreshing: bool,
    unavailable_since: Option<Instant>,
    interval_start: Option<Instant>,
    invalidated: bool,
    is_updating: bool,
    is_disposed: bool,
    interval: Option<JoinHandle<()>>,
    listener: Option<JoinHandle<()>>,
}

impl<T> Slot<T> {
    fn new(args: SubscriptionArgs<T>, status: NetworkStatus) -> Self {
        Self {
            args,
            adopted: None,
            resolved: None,
            local_request: None,
            latest_request: None,
            subscribed_to: None,
            subscription: None,
            status,
            is_refreshing: false,
            unavailable_since: (!status.online).then(Instant::now),
            interval_start: None,
            invalidated: false,
            is_updating: false,
            is_disposed: false,
            interval: None,
            listener: None,
        }
    }

    fn clear_interval(&mut self) {
        if let Some(task) = self.interval.take() {
            task.abort();
        }
        self.interval_start = None;
    }

    /// Stop timers and listeners and hand back the bus subscription.
    fn teardown(&mut self) -> Option<SubscriptionHandle> {
        self.is_disposed = true;
        self.clear_interval();
        if let Some(listener) = self.listener.take() {
            listener.abort();
        }
        self.subscribed_to = None;
        self.subscription.take()
    }
}

struct Shared<T: 'static> {
    store: Arc<dyn Store<T>>,
    slot: Mutex<Slot<T>>,
    signal: Signal,
}

impl<T: 'static> Drop for Shared<T> {
    fn drop(&mut self) {
        if let Some(handle) = self.slot.get_mut().teardown() {
            self.store.notifications().unsubscribe(&handle);
        }
    }
}

/// Keeps one logical request slot fresh.
///
/// Cheap to clone; clones drive the same slot. The slot is torn down by
/// [`dispose`](Self::dispose) or when the last clone is dropped. Timers and
/// the connectivity listener run on the tokio runtime the subscription was
/// created on.
pub struct RequestSubscription<T: 'static> {
    shared: Arc<Shared<T>>,
}

impl<T: 'static> Clone for RequestSubscription<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T: 'static> fmt::Debug for RequestSubscription<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let slot = self.shared.slot.lock();
        f.debug_struct("RequestSubscription")
            .field("args", &slot.args)
            .field("subscribed_to", &slot.subscribed_to)
            .field("status", &slot.status)
            .field("is_refreshing", &slot.is_refreshing)
            .field("is_disposed", &slot.is_disposed)
            .finish()
    }
}

impl<T> RequestSubscription<T>
where
    T: Send + Sync + 'static,
{
    /// Start following `args`.
    ///
    /// With a `connectivity` signal the `online` policy becomes active and
    /// explicit reissues are refused while offline or hidden.
    pub fn new(
        store: Arc<dyn Store<T>>,
        args: SubscriptionArgs<T>,
        connectivity: Option<Arc<Connectivity>>,
    ) -> Self {
        let status = connectivity
            .as_ref()
            .map(|connectivity| connectivity.snapshot())
            .unwrap_or_default();
        let subscription = Self {
            shared: Arc::new(Shared {
                store,
                slot: Mutex::new(Slot::new(args, status)),
                signal: Signal::new(),
            }),
        };
        if let Some(connectivity) = connectivity {
            subscription.install_listener(&connectivity);
        }
        subscription.begin_polling();
        subscription
    }

    /// The current request of the slot.
    ///
    /// A reissue made by the subscription wins over the caller's request as
    /// long as the caller keeps supplying the same source. Reading the
    /// request also keeps the bus subscription on its identity.
    pub fn request(&self) -> Result<RequestFuture<T>, SubscriptionError> {
        let request = self.resolve()?;
        self.update_subscriptions(&request);
        Ok(request)
    }

    /// State of the current request.
    pub fn request_state(&self) -> Result<Arc<RequestState<T>>, SubscriptionError> {
        Ok(get_request_state(&self.request()?))
    }

    /// Resolved document of the current request.
    pub fn result(&self) -> Option<Arc<StructuredDataDocument<T>>> {
        self.request_state().ok()?.value()
    }

    /// `true` when no request or query is supplied.
    pub fn is_idle(&self) -> bool {
        self.shared.slot.lock().args.source.is_none()
    }

    /// Last known network state.
    pub fn is_online(&self) -> bool {
        self.shared.slot.lock().status.online
    }

    /// Last known visibility state.
    pub fn is_hidden(&self) -> bool {
        self.shared.slot.lock().status.hidden
    }

    /// `true` while a non-blocking refresh of the identity is in flight.
    pub fn is_refreshing(&self) -> bool {
        self.shared.slot.lock().is_refreshing
    }

    /// The latest request issued by the subscription, of any mode.
    pub fn latest_request(&self) -> Option<RequestFuture<T>> {
        self.shared.slot.lock().latest_request.clone()
    }

    /// The latest blocking request issued by the subscription.
    pub fn local_request(&self) -> Option<RequestFuture<T>> {
        self.shared.slot.lock().local_request.clone()
    }

    /// Change signal of this subscription.
    pub fn signal(&self) -> &Signal {
        &self.shared.signal
    }

    /// Replace the arguments.
    ///
    /// Supplying a different source drops any reissue made for the previous
    /// one and moves the bus subscription to the new request.
    pub fn set_args(&self, args: SubscriptionArgs<T>) {
        let changed = {
            let mut slot = self.shared.slot.lock();
            let before = slot.args.source.as_ref().map(RequestSource::identity);
            let after = args.source.as_ref().map(RequestSource::identity);
            slot.args = args;
            before != after
        };
        self.shared.signal.notify();
        if changed {
            self.begin_polling();
        }
    }

    /// Reissue the request from the network and wait for it.
    pub async fn retry(&self) -> Result<(), SubscriptionError> {
        if self.is_idle() {
            return Err(SubscriptionError::Idle);
        }
        self.maybe_update(Some(RefreshMode::Reload), false)?;
        if let Some(request) = self.local_request() {
            let _ = request.await;
        }
        Ok(())
    }

    /// Revalidate the request in the background and wait for it.
    pub async fn refresh(&self) -> Result<(), SubscriptionError> {
        if self.is_idle() {
            return Err(SubscriptionError::Idle);
        }
        if self.shared.slot.lock().is_disposed {
            return Err(SubscriptionError::Disposed);
        }
        self.set_refreshing(true);
        let result = self.maybe_update(Some(RefreshMode::Refresh), false);
        if result.is_ok() {
            if let Some(request) = self.latest_request() {
                let _ = request.await;
            }
        }
        self.set_refreshing(false);
        result
    }

    /// Abort the background refresh, if one is running.
    pub fn abort_refresh(&self) -> bool {
        let latest = {
            let slot = self.shared.slot.lock();
            if !slot.is_refreshing {
                return false;
            }
            slot.latest_request.clone()
        };
        match latest {
            Some(request) => {
                request.abort();
                true
            }
            None => false,
        }
    }

    /// Availability flags for an error view.
    pub fn error_features(&self) -> ErrorFeatures {
        let slot = self.shared.slot.lock();
        ErrorFeatures {
            is_online: slot.status.online,
            is_hidden: slot.status.hidden,
        }
    }

    /// Availability flags and the latest request for a content view.
    pub fn content_features(&self) -> ContentFeatures<T> {
        let slot = self.shared.slot.lock();
        ContentFeatures {
            is_online: slot.status.online,
            is_hidden: slot.status.hidden,
            is_refreshing: slot.is_refreshing,
            latest_request: slot.latest_request.clone(),
        }
    }

    /// Stop following the request. Idempotent.
    ///
    /// Unsubscribes from the bus, clears the interval timer and removes the
    /// connectivity listener. Later notifications and timers no longer touch
    /// the slot.
    pub fn dispose(&self) {
        let handle = {
            let mut slot = self.shared.slot.lock();
            if slot.is_disposed {
                return;
            }
            slot.teardown()
        };
        if let Some(handle) = handle {
            self.shared.store.notifications().unsubscribe(&handle);
        }
        debug!("request subscription disposed");
    }

    // ------------------------------------------------------------------------
    // Identity resolution
    // ------------------------------------------------------------------------

    fn resolve(&self) -> Result<RequestFuture<T>, SubscriptionError> {
        let (identity, query) = {
            let mut slot = self.shared.slot.lock();
            let source = slot.args.source.clone().ok_or(SubscriptionError::Idle)?;
            let identity = source.identity();
            if slot.adopted.as_ref() == Some(&identity) {
                if let Some(local) = &slot.local_request {
                    return Ok(local.clone());
                }
                if let Some(resolved) = &slot.resolved {
                    return Ok(resolved.clone());
                }
            } else {
                trace!(?identity, "adopting new request source");
                slot.adopted = Some(identity.clone());
                slot.local_request = None;
                slot.resolved = None;
            }
            match source {
                RequestSource::Request(future) => {
                    slot.resolved = Some(future.clone());
                    return Ok(future);
                }
                RequestSource::Query(info) => (identity, info),
            }
        };

        let future = self.shared.store.request(query);
        let mut slot = self.shared.slot.lock();
        if slot.adopted.as_ref() != Some(&identity) {
            return Ok(future);
        }
        Ok(slot.resolved.get_or_insert(future).clone())
    }

    fn update_subscriptions(&self, request: &RequestFuture<T>) {
        let key = request.lid().cloned();
        let stale = {
            let mut slot = self.shared.slot.lock();
            if slot.is_disposed || slot.subscribed_to == key {
                return;
            }
            slot.subscribed_to = None;
            slot.subscription.take()
        };

        let notifications = self.shared.store.notifications();
        if let Some(handle) = stale {
            notifications.unsubscribe(&handle);
        }
        let Some(key) = key else {
            return;
        };

        let weak = Arc::downgrade(&self.shared);
        let handle = notifications.subscribe(key.clone(), move |_, op| {
            if let Some(shared) = weak.upgrade() {
                RequestSubscription { shared }.on_notification(op);
            }
        });

        let mut slot = self.shared.slot.lock();
        if slot.is_disposed || slot.subscription.is_some() {
            drop(slot);
            notifications.unsubscribe(&handle);
            return;
        }
        debug!(%key, "subscribed to request notifications");
        slot.subscribed_to = Some(key);
        slot.subscription = Some(handle);
    }

    fn on_notification(&self, op: NotificationOp) {
        let (policy, key) = {
            let slot = self.shared.slot.lock();
            // The slot's own reissue is not an external change.
            if slot.is_updating || slot.is_disposed {
                return;
            }
            (slot.args.options.autorefresh, slot.subscribed_to.clone())
        };

        match op {
            NotificationOp::Invalidated if policy.invalid => {
                self.shared.slot.lock().invalidated = true;
                self.update_quietly(None);
            }
            NotificationOp::State => {
                let Some(key) = key else {
                    return;
                };
                let Some(priority) = self.shared.store.in_flight_priority(&key) else {
                    self.set_refreshing(false);
                    return;
                };
                let pending = self
                    .resolve()
                    .map(|request| get_request_state(&request).is_pending())
                    .unwrap_or(true);
                if pending {
                    return;
                }
                if priority.blocking {
                    // Another consumer forced the network; follow it.
                    self.set_refreshing(false);
                    self.update_quietly(Some(RefreshMode::Policy));
                } else {
                    self.set_refreshing(true);
                }
            }
            _ => {}
        }
    }

    fn set_refreshing(&self, refreshing: bool) {
        {
            let mut slot = self.shared.slot.lock();
            if slot.is_refreshing == refreshing {
                return;
            }
            slot.is_refreshing = refreshing;
        }
        self.shared.signal.notify();
    }

    // ------------------------------------------------------------------------
    // Autorefresh
    // ------------------------------------------------------------------------

    fn update_quietly(&self, mode: Option<RefreshMode>) {
        if let Err(error) = self.maybe_update(mode, true) {
            debug!(%error, "autorefresh skipped");
        }
    }

    /// Reissue the request if `mode` asks for it or a policy condition holds.
    ///
    /// Conditions are checked in order: explicit mode or invalidation, then
    /// the online deadline, then the interval. An explicit mode while offline
    /// or hidden is an error unless `silent`.
    fn maybe_update(
        &self,
        mode: Option<RefreshMode>,
        silent: bool,
    ) -> Result<(), SubscriptionError> {
        let request = match self.resolve() {
            Ok(request) => request,
            Err(SubscriptionError::Idle) => return Ok(()),
            Err(error) => return Err(error),
        };
        let state = get_request_state(&request);
        if state.is_pending() {
            return Ok(());
        }

        let now = Instant::now();
        let behavior = {
            let mut slot = self.shared.slot.lock();
            if slot.is_disposed {
                return match mode {
                    Some(_) if !silent => Err(SubscriptionError::Disposed),
                    _ => Ok(()),
                };
            }
            let options = &slot.args.options;
            let policy = options.autorefresh;
            let deadline = options.online_deadline();
            let interval = options.interval();
            let configured = options.autorefresh_behavior;

            let can_attempt = slot.status.is_available() && (mode.is_some() || !policy.is_empty());
            if !can_attempt {
                if mode.is_some() && !silent {
                    return Err(SubscriptionError::Unavailable {
                        online: slot.status.online,
                        hidden: slot.status.hidden,
                    });
                }
                return Ok(());
            }

            let mut should_attempt = slot.invalidated || mode.is_some();
            if !should_attempt && policy.online {
                should_attempt = slot
                    .unavailable_since
                    .is_some_and(|since| now.saturating_duration_since(since) > deadline);
            }
            if !should_attempt && policy.interval {
                if let (Some(start), Some(period)) = (slot.interval_start, interval) {
                    should_attempt = now.saturating_duration_since(start) >= period;
                }
            }

            slot.unavailable_since = None;
            slot.invalidated = false;
            if !should_attempt {
                return Ok(());
            }

            slot.clear_interval();
            slot.is_updating = true;
            mode.or(configured).unwrap_or(RefreshMode::Policy)
        };

        let mut info = state
            .request()
            .unwrap_or_else(|| request.request_info().clone());
        match behavior {
            RefreshMode::Reload => info.cache_options.reload = Some(true),
            RefreshMode::Refresh => info.cache_options.background_reload = Some(true),
            RefreshMode::Policy => {}
        }
        debug!(url = ?info.url, mode = ?behavior, "reissuing subscribed request");

        let future = self.shared.store.request(info);
        {
            let mut slot = self.shared.slot.lock();
            slot.latest_request = Some(future.clone());
            if behavior != RefreshMode::Refresh {
                slot.local_request = Some(future.clone());
            }
        }
        self.shared.signal.notify();
        if behavior != RefreshMode::Refresh {
            self.update_subscriptions(&future);
        }

        let weak = Arc::downgrade(&self.shared);
        future.on_settle(move |_| {
            if let Some(shared) = weak.upgrade() {
                shared.slot.lock().is_updating = false;
                RequestSubscription { shared }.schedule_interval();
            }
        });
        Ok(())
    }

    /// Arm the interval timer once the current request settles.
    fn begin_polling(&self) {
        let Ok(request) = self.request() else {
            return;
        };
        let weak = Arc::downgrade(&self.shared);
        request.on_settle(move |_| {
            if let Some(shared) = weak.upgrade() {
                RequestSubscription { shared }.schedule_interval();
            }
        });
    }

    fn schedule_interval(&self) {
        let mut slot = self.shared.slot.lock();
        let Some(period) = slot.args.options.interval() else {
            return;
        };
        if slot.is_disposed {
            return;
        }
        let Ok(runtime) = Handle::try_current() else {
            warn!("no tokio runtime, interval autorefresh is disabled");
            return;
        };

        slot.clear_interval();
        slot.interval_start = Some(Instant::now());
        let weak = Arc::downgrade(&self.shared);
        slot.interval = Some(runtime.spawn(async move {
            tokio::time::sleep(period).await;
            if let Some(shared) = weak.upgrade() {
                trace!("autorefresh interval elapsed");
                RequestSubscription { shared }.update_quietly(None);
            }
        }));
    }

    // ------------------------------------------------------------------------
    // Connectivity
    // ------------------------------------------------------------------------

    fn install_listener(&self, connectivity: &Connectivity) {
        let Ok(runtime) = Handle::try_current() else {
            warn!("no tokio runtime, connectivity changes will not trigger autorefresh");
            return;
        };
        let mut changes = connectivity.watch();
        let weak = Arc::downgrade(&self.shared);
        let listener = runtime.spawn(async move {
            while changes.changed().await.is_ok() {
                let status = *changes.borrow_and_update();
                let Some(shared) = weak.upgrade() else {
                    break;
                };
                RequestSubscription { shared }.on_connectivity(status);
            }
        });
        self.shared.slot.lock().listener = Some(listener);
    }

    fn on_connectivity(&self, status: NetworkStatus) {
        {
            let mut slot = self.shared.slot.lock();
            if slot.is_disposed {
                return;
            }
            if !status.is_available() && slot.unavailable_since.is_none() {
                slot.unavailable_since = Some(Instant::now());
            }
            slot.status = status;
        }
        self.shared.signal.notify();
        trace!(online = status.online, hidden = status.hidden, "subscription saw connectivity change");
        if let Err(error) = self.maybe_update(None, false) {
            debug!(%error, "autorefresh skipped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_identity_compares_requests_by_handle_and_queries_by_value() {
        let (future, _resolver) = RequestFuture::<()>::builder(RequestInfo::get("/a")).build();
        let a = RequestSource::Request(future.clone());
        let b = RequestSource::Request(future);
        assert_eq!(a.identity(), b.identity());

        let (other, _resolver) = RequestFuture::<()>::builder(RequestInfo::get("/a")).build();
        assert_ne!(a.identity(), RequestSource::Request(other).identity());

        let q1 = RequestSource::<()>::Query(RequestInfo::get("/q"));
        let q2 = RequestSource::<()>::Query(RequestInfo::get("/q"));
        assert_eq!(q1.identity(), q2.identity());
    }

    #[test]
    fn slot_starts_unavailable_when_offline() {
        let slot = Slot::<()>::new(
            SubscriptionArgs::idle(),
            NetworkStatus {
                online: false,
                hidden: false,
            },
        );
        assert!(slot.unavailable_since.is_some());
    }
}
