//! Error types.
//!
//! Request failures ([`RequestError`]) are data: they are captured once in a
//! state object and read back through `is_error()` / `error()`. The remaining
//! types report misuse of the state objects themselves.

use std::sync::Arc;

use thiserror::Error;

/// Why a request future rejected.
#[derive(Debug, Clone, Error)]
pub enum RequestError {
    /// The request was cancelled through [`RequestFuture::abort`](crate::RequestFuture::abort).
    ///
    /// This is the cancellation variant: it is classified by kind, never
    /// treated as a generic failure.
    #[error("request aborted{}", reason_suffix(.reason))]
    Aborted {
        /// Optional reason passed to `abort`.
        reason: Option<String>,
    },

    /// Any other failure reported by the requester, kept verbatim.
    #[error("{0}")]
    Upstream(Arc<anyhow::Error>),
}

fn reason_suffix(reason: &Option<String>) -> String {
    reason.as_deref().map(|r| format!(": {r}")).unwrap_or_default()
}

impl RequestError {
    /// Wrap an upstream failure.
    pub fn upstream(err: impl Into<anyhow::Error>) -> Self {
        RequestError::Upstream(Arc::new(err.into()))
    }

    /// Cancellation without a reason.
    pub fn aborted() -> Self {
        RequestError::Aborted { reason: None }
    }

    /// `true` for [`RequestError::Aborted`].
    pub fn is_abort(&self) -> bool {
        matches!(self, RequestError::Aborted { .. })
    }

    /// Attempts to downcast the upstream error to a specific type.
    pub fn downcast_ref<E: std::error::Error + Send + Sync + 'static>(&self) -> Option<&E> {
        match self {
            RequestError::Upstream(err) => err.downcast_ref::<E>(),
            RequestError::Aborted { .. } => None,
        }
    }
}

/// Failure while reading a response body.
#[derive(Debug, Clone, Error)]
pub enum StreamError {
    /// The body read was cancelled.
    #[error("stream aborted")]
    Aborted,
    /// The transport failed mid-body.
    #[error("stream failed: {0}")]
    Transport(Arc<anyhow::Error>),
}

impl StreamError {
    /// Wrap a transport failure.
    pub fn transport(err: impl Into<anyhow::Error>) -> Self {
        StreamError::Transport(Arc::new(err.into()))
    }

    /// `true` for [`StreamError::Aborted`].
    pub fn is_abort(&self) -> bool {
        matches!(self, StreamError::Aborted)
    }
}

/// Misuse of a [`RequestState`](crate::RequestState).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RequestStateError {
    /// `reload`/`refresh` was called before the request settled. Abort or
    /// await it first.
    #[error("cannot reissue a request that is still pending")]
    ReloadWhilePending,
    /// The future carries no requester to reissue through.
    #[error("the request has no requester to reissue through")]
    NoRequester,
}

/// Failure of a [`RequestSubscription`](crate::RequestSubscription) action.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SubscriptionError {
    /// Neither a request nor a query was supplied.
    #[error("the subscription has no request or query")]
    Idle,
    /// An explicit reload/refresh was requested while the network is
    /// unavailable.
    #[error("reload not available: online={online}, hidden={hidden}")]
    Unavailable {
        /// Network state at the time of the attempt.
        online: bool,
        /// Visibility state at the time of the attempt.
        hidden: bool,
    },
    /// The reissue itself was refused.
    #[error(transparent)]
    Request(#[from] RequestStateError),
    /// The subscription was disposed.
    #[error("the subscription was disposed")]
    Disposed,
}

/// Direction of a page link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkDirection {
    /// Towards the first page.
    Prev,
    /// Towards the last page.
    Next,
}

/// Misuse of a [`PaginationState`](crate::PaginationState).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PaginationError {
    /// A resolved page carried no self link and cannot be cached.
    #[error("page {url:?} resolved without a self link")]
    MissingSelfLink {
        /// The url the page was requested with, if known.
        url: Option<String>,
    },
    /// The active page has no link in the requested direction.
    #[error("the active page has no {0:?} link")]
    NoLink(LinkDirection),
    /// No requester is available to fetch a page by url.
    #[error("no requester available to load page {0}")]
    NoRequester(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Error)]
    #[error("not found: {0}")]
    struct NotFound(String);

    #[test]
    fn upstream_display_is_verbatim() {
        let err = RequestError::upstream(anyhow::anyhow!("boom"));
        assert_eq!(err.to_string(), "boom");
        assert!(!err.is_abort());
    }

    #[test]
    fn aborted_display() {
        assert_eq!(RequestError::aborted().to_string(), "request aborted");
        let err = RequestError::Aborted {
            reason: Some("navigated away".into()),
        };
        assert_eq!(err.to_string(), "request aborted: navigated away");
        assert!(err.is_abort());
    }

    #[test]
    fn upstream_downcast() {
        let err = RequestError::upstream(NotFound("/users/1".into()));
        assert_eq!(err.downcast_ref::<NotFound>().map(|e| e.0.as_str()), Some("/users/1"));
        assert!(RequestError::aborted().downcast_ref::<NotFound>().is_none());
    }

    #[test]
    fn subscription_error_wraps_request_state_error() {
        let err: SubscriptionError = RequestStateError::ReloadWhilePending.into();
        assert_eq!(err.to_string(), "cannot reissue a request that is still pending");
    }
}
