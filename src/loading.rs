//! Byte-level progress of a request's response body.
//!
//! A [`RequestLoadingState`] watches the body of a [`RequestFuture`] lazily:
//! nothing happens until the first accessor is read, at which point a tokio
//! task takes the body stream and starts counting. Chunks that arrive before
//! anyone asked for [`RequestLoadingState::stream`] are buffered and replayed
//! in order to the first consumer.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::channel::mpsc;
use futures::future::BoxFuture;
use futures::stream::StreamExt;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::error::StreamError;
use crate::future::{ByteStream, RequestFuture, WeakRequestFuture};
use crate::signal::Signal;

/// Type-erased view of the future whose body is watched.
trait BodySource: Send + Sync + 'static {
    fn open(&self) -> BoxFuture<'static, Option<ByteStream>>;
    fn size_hint(&self) -> Option<u64>;
    fn aborted(&self) -> BoxFuture<'static, ()>;
    fn is_aborted(&self) -> bool;
    fn abort(&self);
}

// Held weakly: the request state caches the loading state for as long as
// the future lives.
impl<T: Send + Sync + 'static> BodySource for WeakRequestFuture<T> {
    fn open(&self) -> BoxFuture<'static, Option<ByteStream>> {
        let future = self.upgrade();
        Box::pin(async move {
            match future {
                Some(future) => future.get_stream().await,
                None => None,
            }
        })
    }

    fn size_hint(&self) -> Option<u64> {
        self.upgrade().and_then(|future| future.size_hint())
    }

    fn aborted(&self) -> BoxFuture<'static, ()> {
        let future = self.upgrade();
        Box::pin(async move {
            match future {
                Some(future) => future.aborted().await,
                None => futures::future::pending().await,
            }
        })
    }

    fn is_aborted(&self) -> bool {
        self.upgrade().is_some_and(|future| future.is_aborted())
    }

    fn abort(&self) {
        if let Some(future) = self.upgrade() {
            future.abort();
        }
    }
}

#[derive(Default)]
struct Progress {
    triggered: bool,
    is_pending: bool,
    is_started: bool,
    is_complete: bool,
    is_cancelled: bool,
    is_errored: bool,
    error: Option<StreamError>,
    bytes_loaded: u64,
    size_hint: Option<u64>,
    start_time: Option<Instant>,
    end_time: Option<Instant>,
    last_packet_time: Option<Instant>,
    buffer: Vec<Bytes>,
    sink: Option<mpsc::UnboundedSender<Result<Bytes, StreamError>>>,
    stream_handed_out: bool,
}

impl Progress {
    fn is_terminal(&self) -> bool {
        self.is_complete || self.is_cancelled || self.is_errored
    }

    /// Close the sink and drop anything never forwarded.
    fn finish(&mut self) {
        self.end_time = Some(Instant::now());
        self.buffer.clear();
        self.sink = None;
    }
}

struct Inner {
    source: Arc<dyn BodySource>,
    progress: Mutex<Progress>,
    done: watch::Sender<bool>,
    signal: Signal,
}

/// Progress of reading one request's response body.
///
/// Every accessor starts the watch on first use. The lifecycle is
/// `pending → started → complete`, with `cancelled` (which also sets
/// `complete`) or `errored` as alternative endings.
pub struct RequestLoadingState {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for RequestLoadingState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let p = self.inner.progress.lock();
        f.debug_struct("RequestLoadingState")
            .field("is_pending", &p.is_pending)
            .field("is_started", &p.is_started)
            .field("is_complete", &p.is_complete)
            .field("is_cancelled", &p.is_cancelled)
            .field("is_errored", &p.is_errored)
            .field("bytes_loaded", &p.bytes_loaded)
            .finish()
    }
}

impl RequestLoadingState {
    /// Loading state for the body of `future`. Does not start watching yet.
    pub fn new<T: Send + Sync + 'static>(future: &RequestFuture<T>) -> Self {
        Self::from_source(future.downgrade())
    }

    pub(crate) fn from_source<T: Send + Sync + 'static>(future: WeakRequestFuture<T>) -> Self {
        let (done, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                source: Arc::new(future),
                progress: Mutex::new(Progress {
                    is_pending: true,
                    ..Default::default()
                }),
                done,
                signal: Signal::new(),
            }),
        }
    }

    /// Start watching the body. Idempotent.
    ///
    /// Needs a tokio runtime; without one the state stays pending.
    fn trigger(&self) {
        let mut progress = self.inner.progress.lock();
        if progress.triggered {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!("no tokio runtime, request body will not be watched");
            return;
        };
        progress.triggered = true;
        handle.spawn(watch_body(self.inner.clone()));
    }

    fn read<R>(&self, f: impl FnOnce(&Progress) -> R) -> R {
        self.trigger();
        f(&self.inner.progress.lock())
    }

    /// `true` until the body stream is available.
    pub fn is_pending(&self) -> bool {
        self.read(|p| p.is_pending)
    }

    /// `true` while chunks are being read.
    pub fn is_started(&self) -> bool {
        self.read(|p| p.is_started)
    }

    /// `true` once the body ended or was cancelled.
    pub fn is_complete(&self) -> bool {
        self.read(|p| p.is_complete)
    }

    /// `true` if reading stopped because the request was aborted.
    pub fn is_cancelled(&self) -> bool {
        self.read(|p| p.is_cancelled)
    }

    /// `true` if reading failed.
    pub fn is_errored(&self) -> bool {
        self.read(|p| p.is_errored)
    }

    /// The failure that ended reading.
    pub fn error(&self) -> Option<StreamError> {
        self.read(|p| p.error.clone())
    }

    /// Bytes read so far.
    pub fn bytes_loaded(&self) -> u64 {
        self.read(|p| p.bytes_loaded)
    }

    /// Expected body size, if announced.
    pub fn size_hint(&self) -> Option<u64> {
        self.read(|p| p.size_hint)
    }

    /// When the first chunk could be read.
    pub fn start_time(&self) -> Option<Instant> {
        self.read(|p| p.start_time)
    }

    /// When reading ended.
    pub fn end_time(&self) -> Option<Instant> {
        self.read(|p| p.end_time)
    }

    /// When the latest chunk arrived.
    pub fn last_packet_time(&self) -> Option<Instant> {
        self.read(|p| p.last_packet_time)
    }

    /// Time spent reading, up to now if still running.
    pub fn elapsed_time(&self) -> Duration {
        self.read(|p| match p.start_time {
            Some(start) => p.end_time.unwrap_or_else(Instant::now) - start,
            None => Duration::ZERO,
        })
    }

    /// Total reading time, once finished.
    pub fn duration(&self) -> Option<Duration> {
        self.read(|p| Some(p.end_time? - p.start_time?))
    }

    /// Fraction of `size_hint` read; `0.0` without a hint.
    pub fn completed_ratio(&self) -> f64 {
        self.read(|p| match p.size_hint {
            Some(hint) if hint > 0 => p.bytes_loaded as f64 / hint as f64,
            _ => 0.0,
        })
    }

    /// `1.0 - completed_ratio()`.
    pub fn remaining_ratio(&self) -> f64 {
        1.0 - self.completed_ratio()
    }

    /// Average bytes per second.
    pub fn speed(&self) -> f64 {
        let elapsed = self.elapsed_time().as_secs_f64();
        if elapsed == 0.0 {
            return 0.0;
        }
        self.bytes_loaded() as f64 / elapsed
    }

    /// The body as forwarded by the watch.
    ///
    /// The first call replays every chunk read so far, then forwards live
    /// chunks. Returns `None` on later calls, and when reading already ended
    /// before anyone asked.
    pub fn stream(&self) -> Option<ByteStream> {
        self.trigger();
        let mut progress = self.inner.progress.lock();
        if progress.stream_handed_out || progress.is_terminal() {
            return None;
        }
        progress.stream_handed_out = true;
        let (tx, rx) = mpsc::unbounded();
        for chunk in progress.buffer.drain(..) {
            // The receiver is alive; it is returned below.
            let _ = tx.unbounded_send(Ok(chunk));
        }
        progress.sink = Some(tx);
        Some(rx.boxed())
    }

    /// Abort the underlying request.
    pub fn abort(&self) {
        self.inner.source.abort();
    }

    /// Change signal of this state.
    pub fn signal(&self) -> &Signal {
        &self.inner.signal
    }

    /// Wait until the watch has ended.
    pub async fn settled(&self) {
        self.trigger();
        let mut rx = self.inner.done.subscribe();
        if !*rx.borrow() && !self.inner.progress.lock().triggered {
            // No runtime to watch on.
            return;
        }
        let _ = rx.wait_for(|done| *done).await;
    }
}

async fn watch_body(inner: Arc<Inner>) {
    let stream = inner.source.open().await;
    let size_hint = inner.source.size_hint();

    let Some(mut stream) = stream else {
        let cancelled = inner.source.is_aborted();
        {
            let mut progress = inner.progress.lock();
            progress.is_pending = false;
            progress.size_hint = size_hint;
            progress.is_complete = true;
            progress.is_cancelled = cancelled;
            progress.finish();
        }
        debug!(cancelled, "request has no body to watch");
        end(&inner);
        return;
    };

    {
        let mut progress = inner.progress.lock();
        progress.is_pending = false;
        progress.is_started = true;
        progress.size_hint = size_hint;
        progress.start_time = Some(Instant::now());
    }
    inner.signal.notify();

    let mut aborted = inner.source.aborted();
    loop {
        let next = tokio::select! {
            biased;
            _ = &mut aborted => Some(Err(StreamError::Aborted)),
            next = stream.next() => next,
        };

        let mut guard = inner.progress.lock();
        let progress = &mut *guard;
        match next {
            Some(Ok(chunk)) => {
                progress.last_packet_time = Some(Instant::now());
                progress.bytes_loaded += chunk.len() as u64;
                trace!(len = chunk.len(), total = progress.bytes_loaded, "body chunk");
                match &progress.sink {
                    Some(sink) => {
                        let _ = sink.unbounded_send(Ok(chunk));
                    }
                    None => progress.buffer.push(chunk),
                }
                drop(guard);
                inner.signal.notify();
            }
            Some(Err(error)) => {
                if let Some(sink) = &progress.sink {
                    let _ = sink.unbounded_send(Err(error.clone()));
                }
                progress.is_started = false;
                if error.is_abort() {
                    progress.is_cancelled = true;
                    progress.is_complete = true;
                } else {
                    progress.is_errored = true;
                    progress.error = Some(error.clone());
                }
                progress.finish();
                drop(guard);
                debug!(%error, "request body ended with an error");
                break;
            }
            None => {
                progress.is_started = false;
                progress.is_complete = true;
                progress.finish();
                debug!(bytes = progress.bytes_loaded, "request body complete");
                drop(guard);
                break;
            }
        }
    }
    end(&inner);
}

fn end(inner: &Inner) {
    inner.signal.notify();
    inner.done.send_replace(true);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::RequestInfo;
    use crate::future::FutureResolver;

    fn pending() -> (RequestFuture<()>, FutureResolver<()>) {
        RequestFuture::builder(RequestInfo::get("/body")).build()
    }

    #[tokio::test]
    async fn counts_bytes_and_completes() {
        let (future, resolver) = pending();
        let chunks = futures::stream::iter(vec![
            Ok(Bytes::from_static(b"abc")),
            Ok(Bytes::from_static(b"de")),
        ]);
        resolver.set_stream(Some(chunks.boxed()), Some(10));

        let state = RequestLoadingState::new(&future);
        assert!(state.is_pending());
        state.settled().await;

        assert!(state.is_complete());
        assert!(!state.is_started());
        assert!(!state.is_pending());
        assert!(!state.is_cancelled());
        assert_eq!(state.bytes_loaded(), 5);
        assert_eq!(state.completed_ratio(), 0.5);
        assert_eq!(state.remaining_ratio(), 0.5);
        assert!(state.duration().is_some());
        // Reading ended before anyone asked for the body.
        assert!(state.stream().is_none());
    }

    #[tokio::test]
    async fn no_body_completes_immediately() {
        let (future, resolver) = pending();
        let state = RequestLoadingState::new(&future);
        assert!(state.is_pending());
        resolver.resolve((), None);
        state.settled().await;
        assert!(state.is_complete());
        assert!(!state.is_started());
        assert_eq!(state.elapsed_time(), Duration::ZERO);
    }

    #[tokio::test]
    async fn buffered_chunks_are_replayed_in_order() {
        let (future, resolver) = pending();
        let (tx, rx) = mpsc::unbounded::<Result<Bytes, StreamError>>();
        resolver.set_stream(Some(rx.boxed()), None);

        let state = RequestLoadingState::new(&future);
        state.is_pending();
        tx.unbounded_send(Ok(Bytes::from_static(b"1"))).unwrap();
        tx.unbounded_send(Ok(Bytes::from_static(b"2"))).unwrap();
        while state.bytes_loaded() < 2 {
            tokio::task::yield_now().await;
        }

        let mut body = state.stream().unwrap();
        assert!(state.stream().is_none());
        tx.unbounded_send(Ok(Bytes::from_static(b"3"))).unwrap();
        drop(tx);

        let mut seen = Vec::new();
        while let Some(chunk) = body.next().await {
            seen.push(chunk.unwrap());
        }
        assert_eq!(
            seen,
            vec![
                Bytes::from_static(b"1"),
                Bytes::from_static(b"2"),
                Bytes::from_static(b"3")
            ]
        );
        state.settled().await;
        assert!(state.is_complete());
    }

    #[tokio::test]
    async fn abort_marks_cancelled_and_complete() {
        let (future, resolver) = pending();
        let (_tx, rx) = mpsc::unbounded::<Result<Bytes, StreamError>>();
        resolver.set_stream(Some(rx.boxed()), None);

        let state = RequestLoadingState::new(&future);
        while !state.is_started() {
            tokio::task::yield_now().await;
        }
        state.abort();
        state.settled().await;

        assert!(state.is_cancelled());
        assert!(state.is_complete());
        assert!(!state.is_started());
        assert!(!state.is_errored());
    }

    #[tokio::test]
    async fn transport_failure_marks_errored() {
        let (future, resolver) = pending();
        let chunks = futures::stream::iter(vec![
            Ok(Bytes::from_static(b"a")),
            Err(StreamError::transport(anyhow::anyhow!("reset"))),
        ]);
        resolver.set_stream(Some(chunks.boxed()), None);

        let state = RequestLoadingState::new(&future);
        state.settled().await;
        assert!(state.is_errored());
        assert!(!state.is_started());
        assert!(!state.is_complete());
        assert_eq!(state.error().map(|e| e.to_string()), Some("stream failed: reset".into()));
    }
}
