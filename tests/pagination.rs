//! Tests for linked-page caching and traversal.

mod common;

use std::sync::Arc;

use common::MockStore;
use request_flow::{
    get_pagination_state, CollectionDocument, Link, LinkDirection, Links, PaginationError,
    RequestFuture, RequestInfo, Requester,
};

type Page = CollectionDocument<u32>;

fn page(self_link: &str, prev: Option<&str>, next: Option<&str>, data: &[u32]) -> Page {
    CollectionDocument {
        data: data.to_vec(),
        links: Some(Links {
            self_link: Some(Link::Href(self_link.into())),
            prev: prev.map(|href| Link::Object { href: href.into() }),
            next: next.map(|href| Link::Href(href.into())),
            ..Default::default()
        }),
    }
}

/// `/p/1` to `/p/3`, each holding `n * 10` and `n * 10 + 1`.
fn numbered(info: &RequestInfo) -> Page {
    let url = info.url.clone().unwrap_or_default();
    let Some(n) = url.strip_prefix("/p/").and_then(|n| n.parse::<u32>().ok()) else {
        return CollectionDocument {
            data: Vec::new(),
            links: None,
        };
    };
    let prev = (n > 1).then(|| format!("/p/{}", n - 1));
    let next = (n < 3).then(|| format!("/p/{}", n + 1));
    page(&url, prev.as_deref(), next.as_deref(), &[n * 10, n * 10 + 1])
}

// ============================================================================
// Link integrity
// ============================================================================

#[tokio::test]
async fn test_page_reached_twice_is_cached_once() {
    let store = MockStore::<Page>::manual();
    let initial = store.request(RequestInfo::get("/a"));
    let state = get_pagination_state(&initial);

    let (loaded, ()) = tokio::join!(state.load_page("/b"), async {
        while store.pending_count() < 2 {
            tokio::task::yield_now().await;
        }
        // The direct fetch of B lands before A, which links to B.
        assert!(store.resolve_url("/b", page("/b", Some("/a"), None, &[2])));
        assert!(store.resolve_url("/a", page("/a", None, Some("/b"), &[1])));
    });
    let loaded = loaded.unwrap();

    assert_eq!(state.cached_pages(), 2);
    assert!(Arc::ptr_eq(&state.get_page_state("/b"), &loaded));
    assert!(Arc::ptr_eq(&state.initial_page().next().unwrap(), &loaded));

    // B linked back to A first, so A's cache entry is the page B created;
    // the initial request filled it instead of replacing it.
    let cached_a = loaded.prev().unwrap();
    assert!(Arc::ptr_eq(&cached_a, &state.get_page_state("/a")));
    assert_eq!(cached_a.request(), state.initial_page().request());
    assert!(cached_a.is_loaded());
    assert_eq!(cached_a.next_link().as_deref(), Some("/b"));
    assert_eq!(state.data(), vec![1, 2]);
}

#[test]
fn test_request_backed_page_fills_held_placeholder() {
    let store = MockStore::auto(numbered);
    let first = store.request(RequestInfo::get("/p/1"));
    let state = get_pagination_state(&first);
    assert_eq!(state.cached_pages(), 2);
    let held = state.get_page_state("/p/2");
    assert!(!held.is_loaded());

    let second = state.get_page_state(store.request(RequestInfo::get("/p/2")));
    assert!(second.is_loaded());
    assert_eq!(second.self_link().as_deref(), Some("/p/2"));

    assert!(Arc::ptr_eq(&state.get_page_state("/p/2"), &held));
    assert!(Arc::ptr_eq(&state.initial_page().next().unwrap(), &held));
    assert!(held.is_loaded());
    assert_eq!(held.request(), second.request());
    assert_eq!(held.self_link().as_deref(), Some("/p/2"));
    assert_eq!(held.prev_link().as_deref(), Some("/p/1"));
    assert_eq!(held.next_link().as_deref(), Some("/p/3"));
    assert_eq!(state.cached_pages(), 3);
}

#[test]
fn test_loaded_page_is_not_replaced() {
    let store = MockStore::auto(numbered);
    let first = store.request(RequestInfo::get("/p/1"));
    let state = get_pagination_state(&first);

    let other = state.get_page_state(store.request(RequestInfo::get("/p/1")));
    assert!(other.is_loaded());
    assert!(Arc::ptr_eq(&state.get_page_state("/p/1"), &state.initial_page()));
    assert_ne!(state.initial_page().request(), other.request());
}

#[test]
fn test_pagination_state_outlives_callers() {
    let store = MockStore::auto(numbered);
    let first = store.request(RequestInfo::get("/p/1"));
    let initial = get_pagination_state(&first).initial_page();
    assert!(Arc::ptr_eq(&get_pagination_state(&first).initial_page(), &initial));
    assert!(initial.is_loaded());
}

// ============================================================================
// Traversal
// ============================================================================

#[tokio::test]
async fn test_walks_pages_in_both_directions() {
    let store = MockStore::auto(numbered);
    let first = store.request(RequestInfo::get("/p/1"));
    let state = get_pagination_state(&first);
    assert!(Arc::ptr_eq(&state, &get_pagination_state(&first)));
    assert!(state.is_success());
    assert!(state.has_next());
    assert!(!state.has_prev());
    assert_eq!(
        state.load_prev().await.unwrap_err(),
        PaginationError::NoLink(LinkDirection::Prev)
    );

    let second = state.load_next().await.unwrap();
    assert!(Arc::ptr_eq(&state.active_page(), &second));
    assert_eq!(second.url(), Some("/p/2"));
    let third = state.load_next().await.unwrap();
    assert!(!state.has_next());
    assert!(state.has_prev());
    assert_eq!(
        state.load_next().await.unwrap_err(),
        PaginationError::NoLink(LinkDirection::Next)
    );

    assert_eq!(state.pages().len(), 3);
    assert!(Arc::ptr_eq(&state.first_page(), &state.initial_page()));
    assert!(Arc::ptr_eq(&state.last_page(), &third));
    assert_eq!(state.data(), vec![10, 11, 20, 21, 30, 31]);

    state.activate(state.initial_page());
    assert!(state.prev_pages().is_empty());
    assert_eq!(state.next_pages().len(), 2);
    assert_eq!(state.cached_pages(), 3);
    assert_eq!(store.issued_count(), 3);
}

#[tokio::test]
async fn test_page_without_self_link_is_reported() {
    let store = MockStore::auto(numbered);
    let first = store.request(RequestInfo::get("/p/1"));
    let state = get_pagination_state(&first);

    let err = state.load_page("/broken").await.unwrap_err();
    assert_eq!(
        err,
        PaginationError::MissingSelfLink {
            url: Some("/broken".into())
        }
    );
}

#[tokio::test]
async fn test_page_fetch_needs_a_requester() {
    let (future, resolver) = RequestFuture::<Page>::builder(RequestInfo::get("/p/1")).build();
    let state = get_pagination_state(&future);
    resolver.resolve(numbered(&RequestInfo::get("/p/1")), None);

    assert_eq!(
        state.load_next().await.unwrap_err(),
        PaginationError::NoRequester("/p/2".into())
    );
}
