//! Identity types for requests, resources and the handles that track them.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Stable cache identity of a request (its `lid`).
///
/// Two futures issued for "the same" request share a `RequestKey` even though
/// they are distinct handles.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RequestKey {
    /// Local identifier of the request.
    pub lid: Arc<str>,
}

impl RequestKey {
    /// Create a request key from a local identifier.
    pub fn new(lid: impl Into<Arc<str>>) -> Self {
        Self { lid: lid.into() }
    }
}

impl fmt::Display for RequestKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.lid)
    }
}

/// Cache identity of a single resource contained in a document.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceKey {
    /// Resource type, e.g. `"user"`.
    pub kind: Arc<str>,
    /// Local identifier of the resource.
    pub lid: Arc<str>,
}

impl ResourceKey {
    /// Create a resource key.
    pub fn new(kind: impl Into<Arc<str>>, lid: impl Into<Arc<str>>) -> Self {
        Self {
            kind: kind.into(),
            lid: lid.into(),
        }
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.lid)
    }
}

/// Key the notification bus delivers events for.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum NotificationKey {
    /// Events about a request identity.
    Request(RequestKey),
    /// Events about a resource identity.
    Resource(ResourceKey),
}

impl From<RequestKey> for NotificationKey {
    fn from(key: RequestKey) -> Self {
        NotificationKey::Request(key)
    }
}

impl From<ResourceKey> for NotificationKey {
    fn from(key: ResourceKey) -> Self {
        NotificationKey::Resource(key)
    }
}

impl fmt::Display for NotificationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NotificationKey::Request(key) => write!(f, "request({key})"),
            NotificationKey::Resource(key) => write!(f, "resource({key})"),
        }
    }
}

static NEXT_HANDLE_ID: AtomicU64 = AtomicU64::new(1);

fn next_handle_id() -> u64 {
    NEXT_HANDLE_ID.fetch_add(1, Ordering::Relaxed)
}

/// Identity of one [`RequestFuture`](crate::RequestFuture) instance.
///
/// Clones of a future share the id; a reissued request gets a new one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FutureId(pub u64);

impl FutureId {
    pub(crate) fn next() -> Self {
        FutureId(next_handle_id())
    }
}

/// Identity of one [`Promise`](crate::Promise) instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PromiseId(pub u64);

impl PromiseId {
    pub(crate) fn next() -> Self {
        PromiseId(next_handle_id())
    }
}
