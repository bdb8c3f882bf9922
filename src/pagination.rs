//! Linked-page cache over paginated collection documents.
//!
//! A [`PaginationState`] starts from one request and grows as neighbouring
//! pages are loaded. Pages are cached by their self link, and each page
//! remembers its `prev`/`next` neighbours, so the traversal accessors walk
//! the chain outwards from the active page. A cyclic link graph makes those
//! walks loop forever.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, LazyLock, Weak};

use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::cache::IdentityCache;
use crate::document::{Link, Paginated, RequestInfo, RequestOutcome, StructuredDataDocument};
use crate::error::{LinkDirection, PaginationError};
use crate::future::{RequestFuture, WeakRequestFuture};
use crate::identity::FutureId;
use crate::request_state::{get_request_state, RequestState};
use crate::signal::Signal;

/// A page addressed by url or by an issued request.
pub enum PageRef<T> {
    /// A page known only by url; nothing is fetched until it is loaded.
    Url(String),
    /// A page backed by a request; loading starts right away.
    Request(RequestFuture<T>),
}

impl<T> From<String> for PageRef<T> {
    fn from(url: String) -> Self {
        PageRef::Url(url)
    }
}

impl<T> From<&str> for PageRef<T> {
    fn from(url: &str) -> Self {
        PageRef::Url(url.to_string())
    }
}

impl<T> From<RequestFuture<T>> for PageRef<T> {
    fn from(future: RequestFuture<T>) -> Self {
        PageRef::Request(future)
    }
}

/// The initial page refers to its request weakly, since the pagination
/// cache keeps the state alive for as long as that request lives.
enum PageRequest<T> {
    Held(RequestFuture<T>),
    Root(WeakRequestFuture<T>),
}

impl<T> Clone for PageRequest<T> {
    fn clone(&self) -> Self {
        match self {
            PageRequest::Held(future) => PageRequest::Held(future.clone()),
            PageRequest::Root(future) => PageRequest::Root(future.clone()),
        }
    }
}

impl<T> PageRequest<T> {
    fn get(&self) -> Option<RequestFuture<T>> {
        match self {
            PageRequest::Held(future) => Some(future.clone()),
            PageRequest::Root(future) => future.upgrade(),
        }
    }
}

struct PageFields<T> {
    request: Option<PageRequest<T>>,
    state: Option<Arc<RequestState<T>>>,
    self_link: Option<String>,
    prev_link: Option<String>,
    next_link: Option<String>,
    link_error: Option<PaginationError>,
}

/// One page of a [`PaginationState`].
pub struct PageState<T> {
    manager: Weak<PaginationState<T>>,
    url: Option<String>,
    fields: Mutex<PageFields<T>>,
    signal: Signal,
}

impl<T> fmt::Debug for PageState<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let fields = self.fields.lock();
        f.debug_struct("PageState")
            .field("url", &self.url)
            .field("self_link", &fields.self_link)
            .field("prev_link", &fields.prev_link)
            .field("next_link", &fields.next_link)
            .finish()
    }
}

fn href(link: Option<&Link>) -> Option<String> {
    link.and_then(|link| link.href()).map(str::to_owned)
}

impl<T> PageState<T>
where
    T: Paginated + Send + Sync + 'static,
{
    fn new(manager: Weak<PaginationState<T>>, url: Option<String>) -> Self {
        Self {
            manager,
            url,
            fields: Mutex::new(PageFields {
                request: None,
                state: None,
                self_link: None,
                prev_link: None,
                next_link: None,
                link_error: None,
            }),
            signal: Signal::new(),
        }
    }

    /// The url this page was addressed by, if any.
    pub fn url(&self) -> Option<&str> {
        self.url.as_deref()
    }

    /// The request backing this page.
    pub fn request(&self) -> Option<RequestFuture<T>> {
        self.fields.lock().request.as_ref()?.get()
    }

    /// State of the request backing this page. `None` until loaded.
    pub fn state(&self) -> Option<Arc<RequestState<T>>> {
        self.fields.lock().state.clone()
    }

    /// The resolved document, if the page loaded successfully.
    pub fn value(&self) -> Option<Arc<StructuredDataDocument<T>>> {
        self.state()?.value()
    }

    /// `true` once the page resolved.
    pub fn is_loaded(&self) -> bool {
        self.state().is_some_and(|state| state.is_success())
    }

    /// Canonical link of this page, known once it resolved.
    pub fn self_link(&self) -> Option<String> {
        self.fields.lock().self_link.clone()
    }

    /// Link to the preceding page.
    pub fn prev_link(&self) -> Option<String> {
        self.fields.lock().prev_link.clone()
    }

    /// Link to the following page.
    pub fn next_link(&self) -> Option<String> {
        self.fields.lock().next_link.clone()
    }

    /// The cached preceding page.
    pub fn prev(&self) -> Option<Arc<PageState<T>>> {
        let link = self.prev_link()?;
        self.manager.upgrade()?.cached(&link)
    }

    /// The cached following page.
    pub fn next(&self) -> Option<Arc<PageState<T>>> {
        let link = self.next_link()?;
        self.manager.upgrade()?.cached(&link)
    }

    /// Change signal of this page.
    pub fn signal(&self) -> &Signal {
        &self.signal
    }

    /// Load this page from `future`.
    ///
    /// Request failures are not returned: they stay observable through
    /// [`state`](Self::state). A page that resolves without a self link
    /// cannot be cached and yields [`PaginationError::MissingSelfLink`].
    pub async fn load(self: &Arc<Self>, future: RequestFuture<T>) -> Result<(), PaginationError> {
        self.attach(PageRequest::Held(future.clone()));
        let _ = future.await;
        match self.fields.lock().link_error.clone() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    fn attach(self: &Arc<Self>, request: PageRequest<T>) {
        let Some(future) = request.get() else {
            return;
        };
        {
            let mut fields = self.fields.lock();
            fields.state = Some(get_request_state(&future));
            fields.request = Some(request);
            fields.link_error = None;
        }
        self.signal.notify();
        let weak = Arc::downgrade(self);
        future.on_settle(move |outcome| {
            if let Some(page) = weak.upgrade() {
                page.link(outcome);
            }
        });
    }

    fn link(self: &Arc<Self>, outcome: &RequestOutcome<T>) {
        let Ok(doc) = outcome else {
            debug!(url = ?self.url, "page request failed");
            return;
        };
        let links = doc.content.links().cloned().unwrap_or_default();
        let Some(self_link) = href(links.self_link.as_ref()) else {
            warn!(url = ?self.url, "page resolved without a self link");
            self.fields.lock().link_error = Some(PaginationError::MissingSelfLink {
                url: self.url.clone().or_else(|| doc.request.url.clone()),
            });
            return;
        };
        let prev = href(links.prev.as_ref());
        let next = href(links.next.as_ref());
        {
            let mut fields = self.fields.lock();
            fields.self_link = Some(self_link.clone());
            if prev.is_some() {
                fields.prev_link = prev.clone();
            }
            if next.is_some() {
                fields.next_link = next.clone();
            }
        }
        self.signal.notify();

        if let Some(manager) = self.manager.upgrade() {
            manager.adopt(self, &self_link, prev, next);
        }
    }

    /// Take over the request and links of `page`, which resolved under this
    /// placeholder's url.
    fn fill_from(&self, page: &PageState<T>) {
        let (request, state, self_link, prev, next) = {
            let fields = page.fields.lock();
            (
                fields.request.clone(),
                fields.state.clone(),
                fields.self_link.clone(),
                fields.prev_link.clone(),
                fields.next_link.clone(),
            )
        };
        {
            let mut fields = self.fields.lock();
            fields.request = request;
            fields.state = state;
            fields.self_link = self_link;
            fields.link_error = None;
            if prev.is_some() {
                fields.prev_link = prev;
            }
            if next.is_some() {
                fields.next_link = next;
            }
        }
        self.signal.notify();
    }

    /// Record `link` as the neighbour in `direction` unless one is known.
    fn link_neighbour(&self, direction: LinkDirection, link: &str) {
        {
            let mut fields = self.fields.lock();
            let slot = match direction {
                LinkDirection::Prev => &mut fields.prev_link,
                LinkDirection::Next => &mut fields.next_link,
            };
            if slot.is_some() {
                return;
            }
            *slot = Some(link.to_string());
        }
        self.signal.notify();
    }
}

struct Pages<T> {
    active: Arc<PageState<T>>,
    cache: HashMap<String, Arc<PageState<T>>, ahash::RandomState>,
}

/// Pages of a linked collection, starting from one request.
///
/// Obtained through [`get_pagination_state`].
pub struct PaginationState<T> {
    initial: Arc<PageState<T>>,
    pages: Mutex<Pages<T>>,
    signal: Signal,
}

impl<T> fmt::Debug for PaginationState<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let pages = self.pages.lock();
        f.debug_struct("PaginationState")
            .field("initial", &self.initial)
            .field("active", &pages.active)
            .field("cached", &pages.cache.len())
            .finish()
    }
}

impl<T> PaginationState<T>
where
    T: Paginated + Send + Sync + 'static,
{
    /// Start paginating from `future`.
    pub fn new(future: &RequestFuture<T>) -> Arc<Self> {
        let state = Arc::new_cyclic(|weak: &Weak<Self>| {
            let initial = Arc::new(PageState::new(weak.clone(), None));
            Self {
                initial: initial.clone(),
                pages: Mutex::new(Pages {
                    active: initial,
                    cache: HashMap::default(),
                }),
                signal: Signal::new(),
            }
        });
        state.initial.attach(PageRequest::Root(future.downgrade()));
        state
    }

    /// The page paginating started from.
    pub fn initial_page(&self) -> Arc<PageState<T>> {
        self.initial.clone()
    }

    /// The page traversal starts from.
    pub fn active_page(&self) -> Arc<PageState<T>> {
        self.pages.lock().active.clone()
    }

    /// Make `page` the active page.
    pub fn activate(&self, page: Arc<PageState<T>>) {
        self.pages.lock().active = page;
        self.signal.notify();
    }

    /// Change signal of this state.
    pub fn signal(&self) -> &Signal {
        &self.signal
    }

    /// `true` while the initial page is loading.
    pub fn is_pending(&self) -> bool {
        self.initial.state().map_or(true, |state| state.is_pending())
    }

    /// `true` once the initial page resolved.
    pub fn is_success(&self) -> bool {
        self.initial.is_loaded()
    }

    /// `true` if the initial page failed.
    pub fn is_error(&self) -> bool {
        self.initial.state().is_some_and(|state| state.is_error())
    }

    /// The active page links backwards.
    pub fn has_prev(&self) -> bool {
        self.active_page().prev_link().is_some()
    }

    /// The active page links forwards.
    pub fn has_next(&self) -> bool {
        self.active_page().next_link().is_some()
    }

    /// The earliest cached page reachable from the active one.
    pub fn first_page(&self) -> Arc<PageState<T>> {
        let mut page = self.active_page();
        while let Some(prev) = page.prev() {
            page = prev;
        }
        page
    }

    /// The latest cached page reachable from the active one.
    pub fn last_page(&self) -> Arc<PageState<T>> {
        let mut page = self.active_page();
        while let Some(next) = page.next() {
            page = next;
        }
        page
    }

    /// Cached pages before the active one, earliest first.
    pub fn prev_pages(&self) -> Vec<Arc<PageState<T>>> {
        let mut pages = Vec::new();
        let mut page = self.active_page();
        while let Some(prev) = page.prev() {
            pages.push(prev.clone());
            page = prev;
        }
        pages.reverse();
        pages
    }

    /// Cached pages after the active one, in order.
    pub fn next_pages(&self) -> Vec<Arc<PageState<T>>> {
        let mut pages = Vec::new();
        let mut page = self.active_page();
        while let Some(next) = page.next() {
            pages.push(next.clone());
            page = next;
        }
        pages
    }

    /// Every reachable page in order.
    pub fn pages(&self) -> Vec<Arc<PageState<T>>> {
        let mut pages = self.prev_pages();
        pages.push(self.active_page());
        pages.extend(self.next_pages());
        pages
    }

    /// Members of every loaded page in order.
    pub fn data(&self) -> Vec<T::Item>
    where
        T::Item: Clone,
    {
        self.pages()
            .iter()
            .filter_map(|page| page.value())
            .flat_map(|doc| doc.content.data().to_vec())
            .collect()
    }

    /// The page for `page`.
    ///
    /// A url returns the cached page or caches a new, unloaded one. A request
    /// creates a page that starts loading immediately and is cached under
    /// its self link once resolved.
    pub fn get_page_state(self: &Arc<Self>, page: impl Into<PageRef<T>>) -> Arc<PageState<T>> {
        match page.into() {
            PageRef::Url(url) => self.page_for_url(&url),
            PageRef::Request(future) => {
                let page = Arc::new(PageState::new(Arc::downgrade(self), None));
                page.attach(PageRequest::Held(future));
                page
            }
        }
    }

    /// Activate and load the page after the active one.
    pub async fn load_next(self: &Arc<Self>) -> Result<Arc<PageState<T>>, PaginationError> {
        let link = self
            .active_page()
            .next_link()
            .ok_or(PaginationError::NoLink(LinkDirection::Next))?;
        self.load_page(&link).await
    }

    /// Activate and load the page before the active one.
    pub async fn load_prev(self: &Arc<Self>) -> Result<Arc<PageState<T>>, PaginationError> {
        let link = self
            .active_page()
            .prev_link()
            .ok_or(PaginationError::NoLink(LinkDirection::Prev))?;
        self.load_page(&link).await
    }

    /// Activate and load the page at `url`.
    ///
    /// An unloaded page is fetched through the initial request's requester;
    /// a page that is loading or loaded is awaited as is.
    pub async fn load_page(self: &Arc<Self>, url: &str) -> Result<Arc<PageState<T>>, PaginationError> {
        let page = self.page_for_url(url);
        self.activate(page.clone());

        match page.request() {
            Some(request) => {
                let _ = request.await;
                if let Some(error) = page.fields.lock().link_error.clone() {
                    return Err(error);
                }
            }
            None => {
                let requester = self
                    .initial
                    .request()
                    .and_then(|request| request.requester())
                    .ok_or_else(|| PaginationError::NoRequester(url.to_string()))?;
                trace!(url, "loading page");
                let future = requester.request(RequestInfo::get(url));
                page.load(future).await?;
            }
        }
        Ok(page)
    }

    /// Number of cached pages.
    pub fn cached_pages(&self) -> usize {
        self.pages.lock().cache.len()
    }

    fn page_for_url(self: &Arc<Self>, url: &str) -> Arc<PageState<T>> {
        self.pages
            .lock()
            .cache
            .entry(url.to_string())
            .or_insert_with(|| {
                Arc::new(PageState::new(Arc::downgrade(self), Some(url.to_string())))
            })
            .clone()
    }

    fn cached(&self, link: &str) -> Option<Arc<PageState<T>>> {
        self.pages.lock().cache.get(link).cloned()
    }

    /// Cache a resolved page under its self link and cross-link its
    /// neighbours.
    fn adopt(
        self: &Arc<Self>,
        page: &Arc<PageState<T>>,
        self_link: &str,
        prev: Option<String>,
        next: Option<String>,
    ) {
        let (placeholder, neighbours) = {
            let mut pages = self.pages.lock();
            // A page reached first through another path keeps its entry.
            let entry = pages
                .cache
                .entry(self_link.to_string())
                .or_insert_with(|| page.clone());
            let placeholder = (!Arc::ptr_eq(entry, page) && entry.request().is_none())
                .then(|| entry.clone());

            let mut neighbour = |link: Option<String>| {
                link.map(|link| {
                    pages
                        .cache
                        .entry(link.clone())
                        .or_insert_with(|| {
                            Arc::new(PageState::new(Arc::downgrade(self), Some(link)))
                        })
                        .clone()
                })
            };
            (placeholder, (neighbour(prev), neighbour(next)))
        };

        if let Some(placeholder) = placeholder {
            trace!(self_link, "resolved page fills cached placeholder");
            placeholder.fill_from(page);
        }
        if let Some(prev) = neighbours.0 {
            prev.link_neighbour(LinkDirection::Next, self_link);
        }
        if let Some(next) = neighbours.1 {
            next.link_neighbour(LinkDirection::Prev, self_link);
        }
        self.signal.notify();
    }
}

static PAGINATION_CACHE: LazyLock<IdentityCache<FutureId>> = LazyLock::new(IdentityCache::new);

/// Look up (or create) the pagination state rooted at `future`.
pub fn get_pagination_state<T>(future: &RequestFuture<T>) -> Arc<PaginationState<T>>
where
    T: Paginated + Send + Sync + 'static,
{
    PAGINATION_CACHE.get_or_insert(future.id(), future.owner(), || PaginationState::new(future))
}
