//! In-memory store used by the integration tests.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use request_flow::{
    FutureResolver, NotificationManager, RequestFuture, RequestInfo, RequestKey, RequestPriority,
    Requester, ResponseInfo, Store,
};

type Responder<T> = Box<dyn Fn(&RequestInfo) -> T + Send + Sync>;

/// Issues futures keyed by url (or `cache_options.key`), records every
/// request and either answers it right away or parks its resolver.
pub struct MockStore<T> {
    this: Weak<MockStore<T>>,
    notifications: NotificationManager,
    responder: Option<Responder<T>>,
    issued: Mutex<Vec<RequestInfo>>,
    pending: Mutex<VecDeque<FutureResolver<T>>>,
    priorities: Mutex<HashMap<RequestKey, RequestPriority>>,
}

impl<T: Send + Sync + 'static> MockStore<T> {
    /// Requests stay pending until [`resolve_next`](Self::resolve_next).
    pub fn manual() -> Arc<Self> {
        Self::build(None)
    }

    /// Requests resolve synchronously with `respond(info)`.
    pub fn auto(respond: impl Fn(&RequestInfo) -> T + Send + Sync + 'static) -> Arc<Self> {
        Self::build(Some(Box::new(respond)))
    }

    fn build(responder: Option<Responder<T>>) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            this: this.clone(),
            notifications: NotificationManager::new(),
            responder,
            issued: Mutex::new(Vec::new()),
            pending: Mutex::new(VecDeque::new()),
            priorities: Mutex::new(HashMap::new()),
        })
    }

    pub fn key_for(info: &RequestInfo) -> RequestKey {
        let key = info
            .cache_options
            .key
            .clone()
            .or_else(|| info.url.clone())
            .unwrap_or_default();
        RequestKey::new(key)
    }

    pub fn issued(&self) -> Vec<RequestInfo> {
        self.issued.lock().clone()
    }

    pub fn issued_count(&self) -> usize {
        self.issued.lock().len()
    }

    pub fn last_issued(&self) -> Option<RequestInfo> {
        self.issued.lock().last().cloned()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// Resolve the oldest parked request.
    pub fn resolve_next(&self, content: T) -> bool {
        let resolver = self.pending.lock().pop_front();
        match resolver {
            Some(resolver) => resolver.resolve(content, Some(ResponseInfo::with_status(200))),
            None => false,
        }
    }

    /// Resolve the parked request for `url`.
    pub fn resolve_url(&self, url: &str, content: T) -> bool {
        let resolver = {
            let mut pending = self.pending.lock();
            let index = pending
                .iter()
                .position(|resolver| resolver.future().request_info().url.as_deref() == Some(url));
            index.and_then(|index| pending.remove(index))
        };
        match resolver {
            Some(resolver) => resolver.resolve(content, Some(ResponseInfo::with_status(200))),
            None => false,
        }
    }

    pub fn set_priority(&self, key: RequestKey, priority: Option<RequestPriority>) {
        let mut priorities = self.priorities.lock();
        match priority {
            Some(priority) => priorities.insert(key, priority),
            None => priorities.remove(&key),
        };
    }
}

impl<T: Send + Sync + 'static> Requester<T> for MockStore<T> {
    fn request(&self, info: RequestInfo) -> RequestFuture<T> {
        self.issued.lock().push(info.clone());
        let mut builder = RequestFuture::builder(info.clone()).lid(Self::key_for(&info));
        if let Some(this) = self.this.upgrade() {
            builder = builder.requester(this);
        }
        let (future, resolver) = builder.build();
        match &self.responder {
            Some(respond) => {
                resolver.resolve(respond(&info), Some(ResponseInfo::with_status(200)));
            }
            None => self.pending.lock().push_back(resolver),
        }
        future
    }
}

impl<T: Send + Sync + 'static> Store<T> for MockStore<T> {
    fn notifications(&self) -> &NotificationManager {
        &self.notifications
    }

    fn in_flight_priority(&self, key: &RequestKey) -> Option<RequestPriority> {
        self.priorities.lock().get(key).copied()
    }
}
