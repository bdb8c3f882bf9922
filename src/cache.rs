//! Type-erased, identity-keyed registries backing the process-wide state
//! caches.
//!
//! Every entry is tied to an *owner* (the promise or future it was created
//! for) through a weak reference and holds its value strongly until that
//! owner is dropped. Cached values must not hold their owner strongly.

use std::any::Any;
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

type AnyArc = Arc<dyn Any + Send + Sync>;
type AnyWeak = Weak<dyn Any + Send + Sync>;

struct Entry {
    owner: AnyWeak,
    value: AnyArc,
}

impl Entry {
    fn is_live(&self) -> bool {
        self.owner.strong_count() > 0
    }
}

/// Thread-safe registry from handle identity to a cached value.
pub(crate) struct IdentityCache<I> {
    entries: Mutex<HashMap<I, Entry, ahash::RandomState>>,
}

impl<I> Default for IdentityCache<I> {
    fn default() -> Self {
        Self::new()
    }
}

impl<I> IdentityCache<I> {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::with_hasher(ahash::RandomState::new())),
        }
    }
}

impl<I> IdentityCache<I>
where
    I: Copy + Eq + Hash,
{
    /// Get a live value if present.
    ///
    /// Returns `None` if absent, dead, or of a different type.
    pub fn get<V: Send + Sync + 'static>(&self, id: I) -> Option<Arc<V>> {
        let entries = self.entries.lock();
        let entry = entries.get(&id).filter(|entry| entry.is_live())?;
        entry.value.clone().downcast::<V>().ok()
    }

    /// Store `value` for as long as `owner` is alive.
    pub fn insert<V: Send + Sync + 'static>(&self, id: I, owner: AnyWeak, value: Arc<V>) {
        let mut entries = self.entries.lock();
        entries.retain(|_, entry| entry.is_live());
        entries.insert(id, Entry { owner, value });
    }

    /// Return the live value for `id`, or construct, register and return a
    /// new one.
    ///
    /// `make` runs without the registry lock held, so it may freely touch
    /// other caches. If another caller registered a value in the meantime,
    /// that value wins and the freshly made one is dropped.
    pub fn get_or_insert<V, F>(&self, id: I, owner: AnyWeak, make: F) -> Arc<V>
    where
        V: Send + Sync + 'static,
        F: FnOnce() -> Arc<V>,
    {
        if let Some(existing) = self.get::<V>(id) {
            return existing;
        }

        let made = make();

        let mut entries = self.entries.lock();
        if let Some(existing) = entries
            .get(&id)
            .filter(|entry| entry.is_live())
            .and_then(|entry| entry.value.clone().downcast::<V>().ok())
        {
            return existing;
        }
        entries.retain(|_, entry| entry.is_live());
        entries.insert(
            id,
            Entry {
                owner,
                value: made.clone(),
            },
        );
        made
    }

    /// Number of live entries.
    #[cfg(test)]
    pub fn live_len(&self) -> usize {
        self.entries.lock().values().filter(|e| e.is_live()).count()
    }
}
