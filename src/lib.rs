#![deny(missing_docs)]
#![doc = include_str!("../README.md")]

mod cache;
mod connectivity;
mod document;
mod error;
mod expensive;
mod future;
mod identity;
mod loading;
mod notifications;
mod options;
mod pagination;
mod promise;
mod promise_state;
mod request_state;
mod settle;
mod signal;
mod subscription;

pub use connectivity::{Connectivity, NetworkStatus};
pub use document::{
    CacheOptions, CollectionDocument, Identifiable, Link, Links, Paginated, RequestInfo,
    RequestOutcome, ResourceKeys, ResponseInfo, StructuredDataDocument, StructuredErrorDocument,
};
pub use error::{
    LinkDirection, PaginationError, RequestError, RequestStateError, StreamError,
    SubscriptionError,
};
pub use expensive::ExpensiveSubscription;
pub use future::{ByteStream, FutureBuilder, FutureResolver, RequestFuture, Requester};
pub use identity::{FutureId, NotificationKey, PromiseId, RequestKey, ResourceKey};
pub use loading::RequestLoadingState;
pub use notifications::{
    NotificationCallback, NotificationManager, NotificationOp, SubscriptionHandle,
};
pub use options::{
    AutorefreshPolicy, ParseOptionError, RefreshMode, SubscriptionOptions,
    SubscriptionOptionsBuilder, DEFAULT_AUTOREFRESH_THRESHOLD,
};
pub use pagination::{get_pagination_state, PageRef, PageState, PaginationState};
pub use promise::{
    get_promise_result, set_promise_result, LegacyPromiseProxy, Promise, PromiseLike,
    PromiseOutcome, PromiseResolver, PromiseResult,
};
pub use promise_state::{get_promise_state, PromiseState, Status};
pub use request_state::{get_request_state, RequestState};
pub use signal::Signal;
pub use subscription::{
    ContentFeatures, ErrorFeatures, RequestPriority, RequestSource, RequestSubscription, Store,
    SubscriptionArgs,
};

#[test]
fn test_send_sync() {
    fn assert_send<T: Send>() {}
    fn assert_sync<T: Sync>() {}
    assert_send::<RequestFuture<()>>();
    assert_sync::<RequestFuture<()>>();
    assert_send::<RequestState<()>>();
    assert_sync::<RequestState<()>>();
    assert_send::<RequestSubscription<()>>();
    assert_sync::<RequestSubscription<()>>();
    assert_sync::<PaginationState<CollectionDocument<()>>>();
}
