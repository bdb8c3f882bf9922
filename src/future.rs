//! Abortable, stream-exposing request futures.
//!
//! A [`RequestFuture`] is the handle a [`Requester`] returns for one issued
//! request. It is shared by cloning, awaited with `.await`, identified by its
//! [`FutureId`] and keyed for caching by its optional [`RequestKey`]. The
//! producing side settles it through the paired [`FutureResolver`].

use std::any::Any;
use std::fmt;
use std::future::IntoFuture;
use std::sync::{Arc, Weak};

use bytes::Bytes;
use futures::future::BoxFuture;
use futures::stream::BoxStream;
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::document::{
    RequestInfo, RequestOutcome, ResponseInfo, StructuredDataDocument, StructuredErrorDocument,
};
use crate::error::{RequestError, StreamError};
use crate::identity::{FutureId, RequestKey};
use crate::settle::SettleCell;

/// Response body as a stream of chunks.
pub type ByteStream = BoxStream<'static, Result<Bytes, StreamError>>;

/// Something that issues requests: a store or a request manager.
pub trait Requester<T>: Send + Sync + 'static {
    /// Issue `info` and return the future tracking it.
    fn request(&self, info: RequestInfo) -> RequestFuture<T>;
}

enum Body {
    Waiting,
    Ready(Option<ByteStream>),
    Taken,
}

struct FutureInner<T> {
    id: FutureId,
    lid: Option<RequestKey>,
    request: RequestInfo,
    requester: Mutex<Option<Arc<dyn Requester<T>>>>,
    cell: SettleCell<RequestOutcome<T>>,
    body: Mutex<Body>,
    body_ready: watch::Sender<bool>,
    size_hint: Mutex<Option<u64>>,
    aborted: watch::Sender<bool>,
}

/// Handle to one issued request.
///
/// Awaiting yields the [`RequestOutcome`]; [`abort`](Self::abort) cancels it
/// cooperatively.
pub struct RequestFuture<T> {
    inner: Arc<FutureInner<T>>,
}

impl<T> Clone for RequestFuture<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> PartialEq for RequestFuture<T> {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl<T> Eq for RequestFuture<T> {}

impl<T> fmt::Debug for RequestFuture<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestFuture")
            .field("id", &self.inner.id)
            .field("lid", &self.inner.lid)
            .field("url", &self.inner.request.url)
            .finish()
    }
}

/// Builder for a pending [`RequestFuture`] and its [`FutureResolver`].
pub struct FutureBuilder<T> {
    request: RequestInfo,
    lid: Option<RequestKey>,
    requester: Option<Arc<dyn Requester<T>>>,
}

impl<T> FutureBuilder<T>
where
    T: Send + Sync + 'static,
{
    /// Set the cache identity of the request.
    pub fn lid(mut self, lid: RequestKey) -> Self {
        self.lid = Some(lid);
        self
    }

    /// Set the requester used to reissue the request.
    pub fn requester(mut self, requester: Arc<dyn Requester<T>>) -> Self {
        self.requester = Some(requester);
        self
    }

    /// Create the pending future and its resolver.
    pub fn build(self) -> (RequestFuture<T>, FutureResolver<T>) {
        let (body_ready, _) = watch::channel(false);
        let (aborted, _) = watch::channel(false);
        let future = RequestFuture {
            inner: Arc::new(FutureInner {
                id: FutureId::next(),
                lid: self.lid,
                request: self.request,
                requester: Mutex::new(self.requester),
                cell: SettleCell::new(),
                body: Mutex::new(Body::Waiting),
                body_ready,
                size_hint: Mutex::new(None),
                aborted,
            }),
        };
        let resolver = FutureResolver {
            future: future.clone(),
        };
        (future, resolver)
    }
}

impl<T> RequestFuture<T>
where
    T: Send + Sync + 'static,
{
    /// Start building a future for `request`.
    pub fn builder(request: RequestInfo) -> FutureBuilder<T> {
        FutureBuilder {
            request,
            lid: None,
            requester: None,
        }
    }

    /// Identity of this handle.
    pub fn id(&self) -> FutureId {
        self.inner.id
    }

    /// Cache identity of the request, if it has one.
    pub fn lid(&self) -> Option<&RequestKey> {
        self.inner.lid.as_ref()
    }

    /// The request this future was issued for.
    pub fn request_info(&self) -> &RequestInfo {
        &self.inner.request
    }

    /// The requester that issued this future.
    pub fn requester(&self) -> Option<Arc<dyn Requester<T>>> {
        self.inner.requester.lock().clone()
    }

    /// Attach a requester to a future that was issued without one.
    pub fn set_requester(&self, requester: Arc<dyn Requester<T>>) {
        *self.inner.requester.lock() = Some(requester);
    }

    /// `true` once resolved or rejected.
    pub fn is_settled(&self) -> bool {
        self.inner.cell.is_settled()
    }

    /// The outcome, if settled.
    pub fn peek(&self) -> Option<RequestOutcome<T>> {
        self.inner.cell.peek()
    }

    /// Run `f` when the future settles (immediately if it already has).
    ///
    /// Continuations run in registration order before any awaiting task
    /// resumes.
    pub fn on_settle(&self, f: impl FnOnce(&RequestOutcome<T>) + Send + 'static) {
        self.inner.cell.on_settle(f);
    }

    /// Cancel the request.
    ///
    /// Idempotent. An unsettled future rejects with
    /// [`RequestError::Aborted`]; producers observe the cancellation through
    /// [`FutureResolver::aborted`].
    pub fn abort(&self) {
        self.abort_with(None);
    }

    /// Cancel the request with a reason.
    pub fn abort_with(&self, reason: Option<String>) {
        if self.inner.aborted.send_replace(true) {
            return;
        }
        debug!(future = self.inner.id.0, lid = ?self.inner.lid, "request aborted");
        let doc = StructuredErrorDocument::new(
            self.inner.request.clone(),
            None,
            RequestError::Aborted { reason },
        );
        self.settle(Err(Arc::new(doc)));
    }

    /// `true` once [`abort`](Self::abort) was called.
    pub fn is_aborted(&self) -> bool {
        *self.inner.aborted.borrow()
    }

    /// Wait until the future is aborted.
    pub async fn aborted(&self) {
        let mut rx = self.inner.aborted.subscribe();
        // The sender lives as long as `self`.
        let _ = rx.wait_for(|aborted| *aborted).await;
    }

    /// Expected body size, if the transport announced one.
    pub fn size_hint(&self) -> Option<u64> {
        *self.inner.size_hint.lock()
    }

    /// Wait for the response body.
    ///
    /// Resolves to `None` when the response has no body, when the request
    /// settled without providing one, or when the body was already taken.
    pub async fn get_stream(&self) -> Option<ByteStream> {
        let mut rx = self.inner.body_ready.subscribe();
        let _ = rx.wait_for(|ready| *ready).await;

        let mut body = self.inner.body.lock();
        match std::mem::replace(&mut *body, Body::Taken) {
            Body::Ready(stream) => stream,
            Body::Taken => {
                warn!(future = self.inner.id.0, "response body requested twice");
                None
            }
            Body::Waiting => None,
        }
    }

    fn settle(&self, outcome: RequestOutcome<T>) -> bool {
        let settled = self.inner.cell.settle(outcome);
        if settled {
            self.provide_body(None, false);
        }
        settled
    }

    /// Make `stream` available unless a body was already provided.
    fn provide_body(&self, stream: Option<ByteStream>, replace: bool) {
        {
            let mut body = self.inner.body.lock();
            if !matches!(*body, Body::Waiting) {
                if replace {
                    warn!(future = self.inner.id.0, "response body provided twice");
                }
                return;
            }
            *body = Body::Ready(stream);
        }
        self.inner.body_ready.send_replace(true);
    }

    pub(crate) fn downgrade(&self) -> WeakRequestFuture<T> {
        WeakRequestFuture {
            inner: Arc::downgrade(&self.inner),
        }
    }

    pub(crate) fn owner(&self) -> Weak<dyn Any + Send + Sync> {
        let weak: Weak<FutureInner<T>> = Arc::downgrade(&self.inner);
        weak
    }
}

/// Non-owning reference to a [`RequestFuture`].
pub(crate) struct WeakRequestFuture<T> {
    inner: Weak<FutureInner<T>>,
}

impl<T> Clone for WeakRequestFuture<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> WeakRequestFuture<T> {
    pub fn upgrade(&self) -> Option<RequestFuture<T>> {
        self.inner.upgrade().map(|inner| RequestFuture { inner })
    }
}

impl<T> IntoFuture for RequestFuture<T>
where
    T: Send + Sync + 'static,
{
    type Output = RequestOutcome<T>;
    type IntoFuture = BoxFuture<'static, RequestOutcome<T>>;

    fn into_future(self) -> Self::IntoFuture {
        Box::pin(async move { self.inner.cell.wait().await })
    }
}

/// Producer half of a [`RequestFuture`].
pub struct FutureResolver<T> {
    future: RequestFuture<T>,
}

impl<T> FutureResolver<T>
where
    T: Send + Sync + 'static,
{
    /// The future this resolver settles.
    pub fn future(&self) -> &RequestFuture<T> {
        &self.future
    }

    /// Provide the response body. Must be called before settling for the
    /// body to be observable.
    pub fn set_stream(&self, stream: Option<ByteStream>, size_hint: Option<u64>) {
        if size_hint.is_some() {
            *self.future.inner.size_hint.lock() = size_hint;
        }
        self.future.provide_body(stream, true);
    }

    /// Resolve with `content`. Returns `false` if already settled.
    pub fn resolve(&self, content: T, response: Option<ResponseInfo>) -> bool {
        let doc = StructuredDataDocument::new(self.future.inner.request.clone(), response, content);
        self.resolve_document(doc)
    }

    /// Resolve with a complete document.
    pub fn resolve_document(&self, doc: StructuredDataDocument<T>) -> bool {
        self.future.settle(Ok(Arc::new(doc)))
    }

    /// Reject with `error`. Returns `false` if already settled.
    pub fn reject(&self, error: RequestError, response: Option<ResponseInfo>) -> bool {
        let doc = StructuredErrorDocument::new(self.future.inner.request.clone(), response, error);
        self.future.settle(Err(Arc::new(doc)))
    }

    /// `true` once the consumer aborted the request.
    pub fn is_aborted(&self) -> bool {
        self.future.is_aborted()
    }

    /// Wait until the consumer aborts the request.
    pub async fn aborted(&self) {
        self.future.aborted().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[tokio::test]
    async fn resolves_with_document() {
        let (future, resolver) = RequestFuture::<u32>::builder(RequestInfo::get("/n"))
            .lid(RequestKey::new("n"))
            .build();
        assert!(!future.is_settled());
        resolver.resolve(5, Some(ResponseInfo::with_status(200)));

        let doc = future.clone().await.unwrap();
        assert_eq!(doc.content, 5);
        assert_eq!(doc.request.url.as_deref(), Some("/n"));
        assert_eq!(future.lid(), Some(&RequestKey::new("n")));
    }

    #[tokio::test]
    async fn abort_rejects_once() {
        let (future, resolver) = RequestFuture::<u32>::builder(RequestInfo::get("/n")).build();
        future.abort();
        future.abort();
        assert!(resolver.is_aborted());
        assert!(!resolver.resolve(1, None));

        let err = future.clone().await.unwrap_err();
        assert!(err.is_abort());
        resolver.aborted().await;
    }

    #[tokio::test]
    async fn abort_after_settle_keeps_outcome() {
        let (future, resolver) = RequestFuture::<u32>::builder(RequestInfo::get("/n")).build();
        resolver.resolve(1, None);
        future.abort();
        assert!(future.is_aborted());
        assert_eq!(future.await.unwrap().content, 1);
    }

    #[tokio::test]
    async fn stream_is_taken_once() {
        let (future, resolver) = RequestFuture::<()>::builder(RequestInfo::get("/b")).build();
        let chunks = futures::stream::iter(vec![Ok(Bytes::from_static(b"ab"))]).boxed();
        resolver.set_stream(Some(chunks), Some(2));
        assert_eq!(future.size_hint(), Some(2));

        let mut stream = future.get_stream().await.unwrap();
        assert_eq!(stream.next().await.unwrap().unwrap(), Bytes::from_static(b"ab"));
        assert!(future.get_stream().await.is_none());
    }

    #[tokio::test]
    async fn settling_without_body_yields_none() {
        let (future, resolver) = RequestFuture::<()>::builder(RequestInfo::get("/b")).build();
        let waiter = {
            let future = future.clone();
            tokio::spawn(async move { future.get_stream().await.is_none() })
        };
        resolver.resolve((), None);
        assert!(waiter.await.unwrap());
    }
}
