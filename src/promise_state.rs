//! Memoized state records for promises.

use std::fmt;
use std::sync::{Arc, LazyLock};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::cache::IdentityCache;
use crate::identity::PromiseId;
use crate::promise::{
    get_promise_result, set_promise_result, Promise, PromiseLike, PromiseOutcome, PromiseResult,
};
use crate::signal::Signal;

/// Settlement status of a promise or request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    /// Not yet settled.
    Pending,
    /// Settled with a value.
    Fulfilled,
    /// Settled with an error.
    Rejected,
}

struct Fields<T, E> {
    status: Status,
    value: Option<Arc<T>>,
    error: Option<Arc<E>>,
}

/// Read-only view of a promise's settlement.
///
/// Obtained through [`get_promise_state`]; one instance exists per promise
/// for as long as the promise lives, and it is mutated in place when the
/// promise settles. Once fulfilled or rejected it never changes again.
pub struct PromiseState<T, E> {
    fields: Mutex<Fields<T, E>>,
    signal: Signal,
}

impl<T, E> PromiseState<T, E> {
    fn pending() -> Self {
        Self {
            fields: Mutex::new(Fields {
                status: Status::Pending,
                value: None,
                error: None,
            }),
            signal: Signal::new(),
        }
    }

    fn settled(result: PromiseResult<T, E>) -> Self {
        let state = Self::pending();
        state.finalize(&result.into());
        state
    }

    /// Apply the terminal transition. No-op once settled.
    fn finalize(&self, outcome: &PromiseOutcome<T, E>) -> bool {
        {
            let mut fields = self.fields.lock();
            if fields.status != Status::Pending {
                return false;
            }
            match outcome {
                Ok(value) => {
                    fields.status = Status::Fulfilled;
                    fields.value = Some(value.clone());
                }
                Err(error) => {
                    fields.status = Status::Rejected;
                    fields.error = Some(error.clone());
                }
            }
        }
        self.signal.notify();
        true
    }

    /// Current status.
    pub fn status(&self) -> Status {
        self.fields.lock().status
    }

    /// `true` until the promise settles.
    pub fn is_pending(&self) -> bool {
        self.status() == Status::Pending
    }

    /// `true` once fulfilled.
    pub fn is_success(&self) -> bool {
        self.status() == Status::Fulfilled
    }

    /// `true` once rejected.
    pub fn is_error(&self) -> bool {
        self.status() == Status::Rejected
    }

    /// The fulfilled value.
    pub fn value(&self) -> Option<Arc<T>> {
        self.fields.lock().value.clone()
    }

    /// Alias of [`value`](Self::value).
    pub fn result(&self) -> Option<Arc<T>> {
        self.value()
    }

    /// The rejection reason.
    pub fn reason(&self) -> Option<Arc<E>> {
        self.fields.lock().error.clone()
    }

    /// Alias of [`reason`](Self::reason).
    pub fn error(&self) -> Option<Arc<E>> {
        self.reason()
    }

    /// Change signal of this state.
    pub fn signal(&self) -> &Signal {
        &self.signal
    }
}

impl<T: fmt::Debug, E: fmt::Debug> fmt::Debug for PromiseState<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let fields = self.fields.lock();
        f.debug_struct("PromiseState")
            .field("status", &fields.status)
            .field("value", &fields.value)
            .field("error", &fields.error)
            .finish()
    }
}

static PROMISE_CACHE: LazyLock<IdentityCache<PromiseId>> = LazyLock::new(IdentityCache::new);

/// Look up (or create) the state of a promise.
///
/// Legacy proxies are unwrapped first, so a proxy and the promise it wraps
/// yield the identical state. If a result was recorded with
/// [`set_promise_result`] the state is finalized before it is returned.
pub fn get_promise_state<T, E>(promise: impl Into<PromiseLike<T, E>>) -> Arc<PromiseState<T, E>>
where
    T: Send + Sync + 'static,
    E: Send + Sync + 'static,
{
    let promise = promise.into().into_promise();
    PROMISE_CACHE.get_or_insert(promise.id(), promise.owner(), || create_state(&promise))
}

fn create_state<T, E>(promise: &Promise<T, E>) -> Arc<PromiseState<T, E>>
where
    T: Send + Sync + 'static,
    E: Send + Sync + 'static,
{
    if let Some(result) = get_promise_result(promise) {
        trace!(promise = promise.id().0, "promise state finalized from recorded result");
        return Arc::new(PromiseState::settled(result));
    }

    let state = Arc::new(PromiseState::pending());
    let weak = Arc::downgrade(&state);
    let recorder = promise.downgrade();
    promise.on_settle(move |outcome| {
        if let Some(promise) = recorder.upgrade() {
            set_promise_result(&promise, outcome.into());
        }
        if let Some(state) = weak.upgrade() {
            state.finalize(outcome);
        }
    });
    state
}
