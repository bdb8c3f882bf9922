//! Request and response envelopes.
//!
//! The transport layer owns the wire format; this crate only reads the
//! envelope (`request`, `response`, `content` / `error`) and, for paginated
//! collections, the `links` object.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::RequestError;
use crate::identity::ResourceKey;

/// Cache directives attached to a request.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheOptions {
    /// Explicit cache key overriding the one derived from the url.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    /// Force the request to bypass the cache and block on the network.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reload: Option<bool>,
    /// Serve from cache but revalidate in the background.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub background_reload: Option<bool>,
}

/// Description of a request as handed to a [`Requester`](crate::Requester).
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestInfo {
    /// Target url.
    #[serde(default)]
    pub url: Option<String>,
    /// HTTP method, `GET` when absent.
    #[serde(default)]
    pub method: Option<String>,
    /// Logical operation name, e.g. `"query"`.
    #[serde(default)]
    pub op: Option<String>,
    /// Cache directives.
    #[serde(default)]
    pub cache_options: CacheOptions,
    /// Extra request headers.
    #[serde(default)]
    pub headers: Vec<(String, String)>,
}

impl RequestInfo {
    /// A `GET` request for `url`.
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            url: Some(url.into()),
            method: Some("GET".to_string()),
            ..Default::default()
        }
    }

    /// Replace the cache directives.
    pub fn with_cache_options(mut self, cache_options: CacheOptions) -> Self {
        self.cache_options = cache_options;
        self
    }

    /// Copy of this request forced to bypass the cache.
    pub fn for_reload(&self) -> Self {
        let mut info = self.clone();
        info.cache_options.reload = Some(true);
        info.cache_options.background_reload = None;
        info
    }

    /// Copy of this request asking for background revalidation, or, with
    /// `use_policy`, leaving the decision to the requester's cache policy.
    pub fn for_refresh(&self, use_policy: bool) -> Self {
        let mut info = self.clone();
        info.cache_options.reload = None;
        info.cache_options.background_reload = if use_policy { None } else { Some(true) };
        info
    }
}

/// Response metadata of a settled request.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseInfo {
    /// HTTP status code.
    pub status: u16,
    /// HTTP status text.
    #[serde(default)]
    pub status_text: String,
    /// Response headers.
    #[serde(default)]
    pub headers: Vec<(String, String)>,
}

impl ResponseInfo {
    /// A response with `status` and no headers.
    pub fn with_status(status: u16) -> Self {
        Self {
            status,
            ..Default::default()
        }
    }

    /// `true` for 2xx statuses.
    pub fn ok(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Envelope a request future resolves with.
#[derive(Debug, Clone, PartialEq)]
pub struct StructuredDataDocument<T> {
    /// The request as it was issued.
    pub request: RequestInfo,
    /// Response metadata, absent for cache hits served without a response.
    pub response: Option<ResponseInfo>,
    /// The decoded content.
    pub content: T,
}

impl<T> StructuredDataDocument<T> {
    /// Build a document for `request` with `content`.
    pub fn new(request: RequestInfo, response: Option<ResponseInfo>, content: T) -> Self {
        Self {
            request,
            response,
            content,
        }
    }
}

/// Envelope a request future rejects with.
#[derive(Debug, Clone)]
pub struct StructuredErrorDocument {
    /// The request as it was issued.
    pub request: RequestInfo,
    /// Response metadata, if the failure happened after a response arrived.
    pub response: Option<ResponseInfo>,
    /// The failure.
    pub error: RequestError,
}

impl StructuredErrorDocument {
    /// Build an error document.
    pub fn new(request: RequestInfo, response: Option<ResponseInfo>, error: RequestError) -> Self {
        Self {
            request,
            response,
            error,
        }
    }

    /// `true` if the request was cancelled.
    pub fn is_abort(&self) -> bool {
        self.error.is_abort()
    }
}

impl fmt::Display for StructuredErrorDocument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.error, f)
    }
}

impl std::error::Error for StructuredErrorDocument {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}

/// Settled outcome of a request future.
pub type RequestOutcome<T> = Result<Arc<StructuredDataDocument<T>>, Arc<StructuredErrorDocument>>;

/// A link is either a bare href or an object carrying one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Link {
    /// `"next": "/users?page=2"`
    Href(String),
    /// `"next": { "href": "/users?page=2" }`
    Object {
        /// Target of the link.
        href: String,
    },
}

impl Link {
    /// The target, `None` for an empty href.
    pub fn href(&self) -> Option<&str> {
        let href = match self {
            Link::Href(href) => href,
            Link::Object { href } => href,
        };
        (!href.is_empty()).then_some(href.as_str())
    }
}

/// Pagination links of a collection document.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Links {
    /// Link to this page.
    #[serde(rename = "self", default)]
    pub self_link: Option<Link>,
    /// Link to the following page.
    #[serde(default)]
    pub next: Option<Link>,
    /// Link to the preceding page.
    #[serde(default)]
    pub prev: Option<Link>,
    /// Link to the first page.
    #[serde(default)]
    pub first: Option<Link>,
    /// Link to the last page.
    #[serde(default)]
    pub last: Option<Link>,
}

/// Content of a page in a linked collection.
pub trait Paginated {
    /// Member type of the page.
    type Item;

    /// Pagination links, if the document carries any.
    fn links(&self) -> Option<&Links>;

    /// Members of this page.
    fn data(&self) -> &[Self::Item];
}

/// Content that references cached resources.
pub trait ResourceKeys {
    /// Every resource identity the content refers to.
    fn resource_keys(&self) -> Vec<ResourceKey>;
}

/// A member that knows its own resource identity.
pub trait Identifiable {
    /// Identity of this member.
    fn resource_key(&self) -> ResourceKey;
}

/// A generic collection document: `{ data: [...], links: {...} }`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionDocument<R> {
    /// Members of the page.
    pub data: Vec<R>,
    /// Pagination links.
    #[serde(default)]
    pub links: Option<Links>,
}

impl<R> Paginated for CollectionDocument<R> {
    type Item = R;

    fn links(&self) -> Option<&Links> {
        self.links.as_ref()
    }

    fn data(&self) -> &[R] {
        &self.data
    }
}

impl<R: Identifiable> ResourceKeys for CollectionDocument<R> {
    fn resource_keys(&self) -> Vec<ResourceKey> {
        self.data.iter().map(Identifiable::resource_key).collect()
    }
}
