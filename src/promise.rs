//! Shareable, settle-once promises and the out-of-band result sideband.

use std::any::Any;
use std::fmt;
use std::future::IntoFuture;
use std::sync::{Arc, LazyLock, Weak};

use futures::future::BoxFuture;

use crate::cache::IdentityCache;
use crate::identity::PromiseId;
use crate::settle::SettleCell;

/// Settled outcome of a [`Promise`].
pub type PromiseOutcome<T, E> = Result<Arc<T>, Arc<E>>;

struct PromiseInner<T, E> {
    id: PromiseId,
    cell: SettleCell<PromiseOutcome<T, E>>,
}

/// A cheaply clonable handle to a value that becomes available once.
///
/// Clones share identity. Await a promise with `.await`; read state
/// synchronously through [`get_promise_state`](crate::get_promise_state).
pub struct Promise<T, E> {
    inner: Arc<PromiseInner<T, E>>,
}

impl<T, E> Clone for Promise<T, E> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T, E> fmt::Debug for Promise<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Promise").field("id", &self.inner.id).finish()
    }
}

impl<T, E> PartialEq for Promise<T, E> {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl<T, E> Eq for Promise<T, E> {}

impl<T, E> Promise<T, E>
where
    T: Send + Sync + 'static,
    E: Send + Sync + 'static,
{
    /// Create a pending promise and the resolver that settles it.
    pub fn new() -> (Self, PromiseResolver<T, E>) {
        let promise = Self {
            inner: Arc::new(PromiseInner {
                id: PromiseId::next(),
                cell: SettleCell::new(),
            }),
        };
        let resolver = PromiseResolver {
            promise: promise.clone(),
        };
        (promise, resolver)
    }

    /// A promise already fulfilled with `value`.
    pub fn resolved(value: T) -> Self {
        let (promise, resolver) = Self::new();
        resolver.resolve(value);
        promise
    }

    /// A promise already rejected with `error`.
    pub fn rejected(error: E) -> Self {
        let (promise, resolver) = Self::new();
        resolver.reject(error);
        promise
    }

    /// Identity of this promise.
    pub fn id(&self) -> PromiseId {
        self.inner.id
    }

    /// `true` once fulfilled or rejected.
    pub fn is_settled(&self) -> bool {
        self.inner.cell.is_settled()
    }

    /// Run `f` when the promise settles (immediately if it already has).
    pub fn on_settle(&self, f: impl FnOnce(&PromiseOutcome<T, E>) + Send + 'static) {
        self.inner.cell.on_settle(f);
    }

    pub(crate) fn downgrade(&self) -> WeakPromise<T, E> {
        WeakPromise {
            inner: Arc::downgrade(&self.inner),
        }
    }

    pub(crate) fn owner(&self) -> Weak<dyn Any + Send + Sync> {
        let weak: Weak<PromiseInner<T, E>> = Arc::downgrade(&self.inner);
        weak
    }
}

/// Non-owning reference to a [`Promise`].
pub(crate) struct WeakPromise<T, E> {
    inner: Weak<PromiseInner<T, E>>,
}

impl<T, E> WeakPromise<T, E> {
    pub fn upgrade(&self) -> Option<Promise<T, E>> {
        self.inner.upgrade().map(|inner| Promise { inner })
    }
}

impl<T, E> IntoFuture for Promise<T, E>
where
    T: Send + Sync + 'static,
    E: Send + Sync + 'static,
{
    type Output = PromiseOutcome<T, E>;
    type IntoFuture = BoxFuture<'static, PromiseOutcome<T, E>>;

    fn into_future(self) -> Self::IntoFuture {
        Box::pin(async move { self.inner.cell.wait().await })
    }
}

/// Producer half of a [`Promise`].
///
/// Dropping the resolver without settling leaves the promise pending.
pub struct PromiseResolver<T, E> {
    promise: Promise<T, E>,
}

impl<T, E> PromiseResolver<T, E>
where
    T: Send + Sync + 'static,
    E: Send + Sync + 'static,
{
    /// Fulfil the promise. Returns `false` if it was already settled.
    pub fn resolve(&self, value: T) -> bool {
        self.promise.inner.cell.settle(Ok(Arc::new(value)))
    }

    /// Reject the promise. Returns `false` if it was already settled.
    pub fn reject(&self, error: E) -> bool {
        self.promise.inner.cell.settle(Err(Arc::new(error)))
    }

    /// The promise this resolver settles.
    pub fn promise(&self) -> &Promise<T, E> {
        &self.promise
    }
}

/// A legacy proxy object wrapping a promise.
///
/// State lookups see through the proxy: a proxy and the promise it wraps map
/// to the same [`PromiseState`](crate::PromiseState).
pub struct LegacyPromiseProxy<T, E> {
    promise: Promise<T, E>,
}

impl<T, E> LegacyPromiseProxy<T, E> {
    /// Wrap `promise`.
    pub fn new(promise: Promise<T, E>) -> Self {
        Self { promise }
    }

    /// The wrapped promise.
    pub fn promise(&self) -> &Promise<T, E> {
        &self.promise
    }
}

impl<T, E> Clone for LegacyPromiseProxy<T, E> {
    fn clone(&self) -> Self {
        Self {
            promise: self.promise.clone(),
        }
    }
}

/// Anything a promise state can be looked up for.
pub enum PromiseLike<T, E> {
    /// A plain promise.
    Promise(Promise<T, E>),
    /// A legacy proxy, unwrapped before keying.
    Legacy(LegacyPromiseProxy<T, E>),
}

impl<T, E> PromiseLike<T, E> {
    /// The underlying promise used as cache identity.
    pub fn into_promise(self) -> Promise<T, E> {
        match self {
            PromiseLike::Promise(promise) => promise,
            PromiseLike::Legacy(proxy) => proxy.promise,
        }
    }
}

impl<T, E> From<Promise<T, E>> for PromiseLike<T, E> {
    fn from(promise: Promise<T, E>) -> Self {
        PromiseLike::Promise(promise)
    }
}

impl<T, E> From<&Promise<T, E>> for PromiseLike<T, E> {
    fn from(promise: &Promise<T, E>) -> Self {
        PromiseLike::Promise(promise.clone())
    }
}

impl<T, E> From<LegacyPromiseProxy<T, E>> for PromiseLike<T, E> {
    fn from(proxy: LegacyPromiseProxy<T, E>) -> Self {
        PromiseLike::Legacy(proxy)
    }
}

impl<T, E> From<&LegacyPromiseProxy<T, E>> for PromiseLike<T, E> {
    fn from(proxy: &LegacyPromiseProxy<T, E>) -> Self {
        PromiseLike::Legacy(proxy.clone())
    }
}

/// A result recorded out of band for a promise.
pub enum PromiseResult<T, E> {
    /// The promise fulfilled with this value.
    Fulfilled(Arc<T>),
    /// The promise rejected with this error.
    Rejected(Arc<E>),
}

impl<T, E> PromiseResult<T, E> {
    /// `true` for [`PromiseResult::Rejected`].
    pub fn is_error(&self) -> bool {
        matches!(self, PromiseResult::Rejected(_))
    }
}

impl<T, E> Clone for PromiseResult<T, E> {
    fn clone(&self) -> Self {
        match self {
            PromiseResult::Fulfilled(value) => PromiseResult::Fulfilled(value.clone()),
            PromiseResult::Rejected(error) => PromiseResult::Rejected(error.clone()),
        }
    }
}

impl<T, E> From<&PromiseOutcome<T, E>> for PromiseResult<T, E> {
    fn from(outcome: &PromiseOutcome<T, E>) -> Self {
        match outcome {
            Ok(value) => PromiseResult::Fulfilled(value.clone()),
            Err(error) => PromiseResult::Rejected(error.clone()),
        }
    }
}

impl<T, E> From<PromiseResult<T, E>> for PromiseOutcome<T, E> {
    fn from(result: PromiseResult<T, E>) -> Self {
        match result {
            PromiseResult::Fulfilled(value) => Ok(value),
            PromiseResult::Rejected(error) => Err(error),
        }
    }
}

static PROMISE_RESULTS: LazyLock<IdentityCache<PromiseId>> = LazyLock::new(IdentityCache::new);

/// Record `result` for `promise`, so later state lookups finalize without
/// waiting for a continuation.
pub fn set_promise_result<T, E>(promise: &Promise<T, E>, result: PromiseResult<T, E>)
where
    T: Send + Sync + 'static,
    E: Send + Sync + 'static,
{
    PROMISE_RESULTS.insert(promise.id(), promise.owner(), Arc::new(result));
}

/// The result previously recorded for `promise`, if any.
pub fn get_promise_result<T, E>(promise: &Promise<T, E>) -> Option<PromiseResult<T, E>>
where
    T: Send + Sync + 'static,
    E: Send + Sync + 'static,
{
    PROMISE_RESULTS
        .get::<PromiseResult<T, E>>(promise.id())
        .map(|result| (*result).clone())
}
