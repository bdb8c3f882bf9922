//! Memoized state records for request futures.

use std::fmt;
use std::sync::{Arc, LazyLock};

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::cache::IdentityCache;
use crate::document::{
    RequestInfo, RequestOutcome, ResponseInfo, StructuredDataDocument, StructuredErrorDocument,
};
use crate::error::RequestStateError;
use crate::future::{RequestFuture, WeakRequestFuture};
use crate::identity::FutureId;
use crate::loading::RequestLoadingState;
use crate::promise_state::Status;
use crate::signal::Signal;

struct Fields<T> {
    status: Status,
    value: Option<Arc<StructuredDataDocument<T>>>,
    error: Option<Arc<StructuredErrorDocument>>,
    request: Option<RequestInfo>,
    response: Option<ResponseInfo>,
}

/// Read-only view of a request future's settlement.
///
/// Obtained through [`get_request_state`]. `status`, `value`/`error` and
/// `request`/`response` are assigned together in one step, so they are never
/// observed out of sync.
pub struct RequestState<T> {
    id: FutureId,
    info: RequestInfo,
    future: WeakRequestFuture<T>,
    fields: Mutex<Fields<T>>,
    loading: Mutex<Option<Arc<RequestLoadingState>>>,
    signal: Signal,
}

impl<T> RequestState<T>
where
    T: Send + Sync + 'static,
{
    fn new(future: &RequestFuture<T>) -> Self {
        Self {
            id: future.id(),
            info: future.request_info().clone(),
            future: future.downgrade(),
            fields: Mutex::new(Fields {
                status: Status::Pending,
                value: None,
                error: None,
                request: None,
                response: None,
            }),
            loading: Mutex::new(None),
            signal: Signal::new(),
        }
    }

    fn finalize(&self, outcome: &RequestOutcome<T>) -> bool {
        {
            let mut fields = self.fields.lock();
            if fields.status != Status::Pending {
                return false;
            }
            match outcome {
                Ok(doc) => {
                    fields.status = Status::Fulfilled;
                    fields.request = Some(doc.request.clone());
                    fields.response = doc.response.clone();
                    fields.value = Some(doc.clone());
                }
                Err(doc) => {
                    fields.status = Status::Rejected;
                    fields.request = Some(doc.request.clone());
                    fields.response = doc.response.clone();
                    fields.error = Some(doc.clone());
                }
            }
            trace!(future = self.id.0, status = ?fields.status, "request state settled");
        }
        self.signal.notify();
        true
    }

    /// The future this state tracks, while it is alive.
    pub fn future(&self) -> Option<RequestFuture<T>> {
        self.future.upgrade()
    }

    /// Current status.
    pub fn status(&self) -> Status {
        self.fields.lock().status
    }

    /// `true` until the request settles.
    pub fn is_pending(&self) -> bool {
        self.status() == Status::Pending
    }

    /// `true` once resolved.
    pub fn is_success(&self) -> bool {
        self.status() == Status::Fulfilled
    }

    /// `true` once rejected, including cancellation.
    pub fn is_error(&self) -> bool {
        self.status() == Status::Rejected
    }

    /// `true` iff rejected because the request was aborted.
    pub fn is_cancelled(&self) -> bool {
        let fields = self.fields.lock();
        fields.status == Status::Rejected
            && fields.error.as_ref().is_some_and(|doc| doc.error.is_abort())
    }

    /// The resolved document.
    pub fn value(&self) -> Option<Arc<StructuredDataDocument<T>>> {
        self.fields.lock().value.clone()
    }

    /// Alias of [`value`](Self::value).
    pub fn result(&self) -> Option<Arc<StructuredDataDocument<T>>> {
        self.value()
    }

    /// The rejection envelope.
    pub fn reason(&self) -> Option<Arc<StructuredErrorDocument>> {
        self.fields.lock().error.clone()
    }

    /// Alias of [`reason`](Self::reason).
    pub fn error(&self) -> Option<Arc<StructuredErrorDocument>> {
        self.reason()
    }

    /// The request as reported by the settled envelope.
    pub fn request(&self) -> Option<RequestInfo> {
        self.fields.lock().request.clone()
    }

    /// The response as reported by the settled envelope.
    pub fn response(&self) -> Option<ResponseInfo> {
        self.fields.lock().response.clone()
    }

    /// Change signal of this state.
    pub fn signal(&self) -> &Signal {
        &self.signal
    }

    /// Byte-level loading progress, created on first access.
    ///
    /// Memoized on this state, which the cache keeps for as long as the
    /// future lives.
    pub fn loading_state(&self) -> Arc<RequestLoadingState> {
        let mut loading = self.loading.lock();
        let state = loading
            .get_or_insert_with(|| Arc::new(RequestLoadingState::from_source(self.future.clone())));
        state.clone()
    }

    /// Reissue the request bypassing the cache.
    ///
    /// Returns the new future; this state is left untouched.
    pub fn reload(&self) -> Result<RequestFuture<T>, RequestStateError> {
        self.reissue(self.info.for_reload())
    }

    /// Reissue the request as a background revalidation, or with
    /// `use_policy`, let the requester's cache policy decide.
    pub fn refresh(&self, use_policy: bool) -> Result<RequestFuture<T>, RequestStateError> {
        self.reissue(self.info.for_refresh(use_policy))
    }

    fn reissue(&self, info: RequestInfo) -> Result<RequestFuture<T>, RequestStateError> {
        if self.is_pending() {
            return Err(RequestStateError::ReloadWhilePending);
        }
        let requester = self
            .future
            .upgrade()
            .and_then(|future| future.requester())
            .ok_or(RequestStateError::NoRequester)?;
        debug!(
            future = self.id.0,
            reload = ?info.cache_options.reload,
            background_reload = ?info.cache_options.background_reload,
            "reissuing request"
        );
        Ok(requester.request(info))
    }
}

impl<T: fmt::Debug> fmt::Debug for RequestState<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let fields = self.fields.lock();
        f.debug_struct("RequestState")
            .field("future", &self.id)
            .field("url", &self.info.url)
            .field("status", &fields.status)
            .field("value", &fields.value)
            .field("error", &fields.error)
            .finish()
    }
}

static REQUEST_CACHE: LazyLock<IdentityCache<FutureId>> = LazyLock::new(IdentityCache::new);

/// Look up (or create) the state of a request future.
///
/// Keyed on the future's identity; every lookup returns the identical state
/// for as long as the future is alive. A future that already settled yields
/// a finalized state.
pub fn get_request_state<T>(future: &RequestFuture<T>) -> Arc<RequestState<T>>
where
    T: Send + Sync + 'static,
{
    REQUEST_CACHE.get_or_insert(future.id(), future.owner(), || {
        let state = Arc::new(RequestState::new(future));
        let weak = Arc::downgrade(&state);
        future.on_settle(move |outcome| {
            if let Some(state) = weak.upgrade() {
                state.finalize(outcome);
            }
        });
        state
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RequestError;

    #[test]
    fn lookups_are_identical() {
        let (future, _resolver) = RequestFuture::<u32>::builder(RequestInfo::get("/a")).build();
        let a = get_request_state(&future);
        let b = get_request_state(&future.clone());
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn state_lives_as_long_as_the_future() {
        let (future, resolver) = RequestFuture::<u32>::builder(RequestInfo::get("/a")).build();
        let version = get_request_state(&future).signal().version();
        resolver.resolve(1, None);

        let state = get_request_state(&future);
        assert!(state.is_success());
        assert_eq!(state.signal().version(), version + 1);
        assert_eq!(state.future(), Some(future.clone()));

        drop(future);
        drop(resolver);
        assert!(state.future().is_none());
        assert_eq!(state.reload().unwrap_err(), RequestStateError::NoRequester);
    }

    #[test]
    fn request_and_response_land_with_status() {
        let (future, resolver) = RequestFuture::<u32>::builder(RequestInfo::get("/a")).build();
        let state = get_request_state(&future);
        assert!(state.request().is_none());

        resolver.resolve(1, Some(ResponseInfo::with_status(200)));
        assert!(state.is_success());
        assert_eq!(state.request().and_then(|r| r.url), Some("/a".to_string()));
        assert_eq!(state.response().map(|r| r.status), Some(200));
        assert_eq!(state.value().map(|d| d.content), Some(1));
    }

    #[test]
    fn settled_future_yields_finalized_state() {
        let (future, resolver) = RequestFuture::<u32>::builder(RequestInfo::get("/a")).build();
        resolver.reject(RequestError::upstream(anyhow::anyhow!("gone")), None);
        let state = get_request_state(&future);
        assert!(state.is_error());
        assert!(!state.is_cancelled());
    }

    #[test]
    fn reissue_without_requester_is_refused() {
        let (future, resolver) = RequestFuture::<u32>::builder(RequestInfo::get("/a")).build();
        let state = get_request_state(&future);
        assert_eq!(state.reload().unwrap_err(), RequestStateError::ReloadWhilePending);
        resolver.resolve(1, None);
        assert_eq!(state.refresh(true).unwrap_err(), RequestStateError::NoRequester);
    }
}
