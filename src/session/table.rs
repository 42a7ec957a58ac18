//! Bounded LRU session table
//!
//! One coarse `parking_lot::Mutex` guards the whole `lru::LruCache`; the
//! eviction callback runs while that lock is held, so a concurrent lookup
//! never observes an entry whose socket is being closed.

use std::fmt;
use std::hash::Hash;
use std::num::NonZeroUsize;

use lru::LruCache;
use parking_lot::Mutex;
use tracing::debug;

/// Why an entry left the table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemovalCause {
    /// Pushed out by an insert beyond capacity
    Evicted,
    /// Overwritten by an insert with the same key
    Replaced,
    /// Dropped by a full flush
    Flushed,
}

/// Cleanup hook run for every entry the table itself discards.
///
/// Not called for [`SessionTable::remove`]; the caller owns the returned value.
pub trait EvictionHandler<K, V>: Send + Sync {
    /// Release the resources held by `value`
    fn on_evict(&self, key: &K, value: &V, cause: RemovalCause);
}

impl<K, V, F> EvictionHandler<K, V> for F
where
    F: Fn(&K, &V, RemovalCause) + Send + Sync,
{
    fn on_evict(&self, key: &K, value: &V, cause: RemovalCause) {
        self(key, value, cause);
    }
}

/// Capacity-bounded map with access-order eviction
pub struct SessionTable<K: Hash + Eq, V> {
    name: &'static str,
    inner: Mutex<LruCache<K, V>>,
    on_evict: Box<dyn EvictionHandler<K, V>>,
}

impl<K, V> SessionTable<K, V>
where
    K: Hash + Eq + Clone + fmt::Debug,
    V: Clone,
{
    /// Create a table holding at most `capacity` entries
    pub fn new(
        name: &'static str,
        capacity: NonZeroUsize,
        on_evict: impl EvictionHandler<K, V> + 'static,
    ) -> Self {
        Self {
            name,
            inner: Mutex::new(LruCache::new(capacity)),
            on_evict: Box::new(on_evict),
        }
    }

    /// Look up `key`, marking it most recently used
    pub fn get(&self, key: &K) -> Option<V> {
        self.inner.lock().get(key).cloned()
    }

    /// Whether `key` is present, without touching recency
    pub fn contains(&self, key: &K) -> bool {
        self.inner.lock().contains(key)
    }

    /// Insert `value` as most recently used.
    ///
    /// An entry displaced by capacity or by the same key is handed to the
    /// eviction handler before this call returns.
    pub fn put(&self, key: K, value: V) {
        let mut inner = self.inner.lock();
        if let Some((old_key, old_value)) = inner.push(key.clone(), value) {
            let cause = if old_key == key {
                RemovalCause::Replaced
            } else {
                RemovalCause::Evicted
            };
            debug!("{} table: {:?} {:?}", self.name, old_key, cause);
            self.on_evict.on_evict(&old_key, &old_value, cause);
        }
    }

    /// Remove `key` without invoking the eviction handler
    pub fn remove(&self, key: &K) -> Option<V> {
        self.inner.lock().pop(key)
    }

    /// Remove `key` only if `predicate` accepts the stored value.
    ///
    /// Lets a caller drop its own session without racing a replacement
    /// stored under the same key.
    pub fn remove_if(&self, key: &K, predicate: impl FnOnce(&V) -> bool) -> Option<V> {
        let mut inner = self.inner.lock();
        if inner.peek(key).is_some_and(predicate) {
            inner.pop(key)
        } else {
            None
        }
    }

    /// Remove every entry, handing each to the eviction handler.
    ///
    /// Returns the number of entries flushed.
    pub fn flush(&self) -> usize {
        let mut inner = self.inner.lock();
        let mut count = 0;
        while let Some((key, value)) = inner.pop_lru() {
            self.on_evict.on_evict(&key, &value, RemovalCause::Flushed);
            count += 1;
        }
        if count > 0 {
            debug!("{} table flushed, {} entries closed", self.name, count);
        }
        count
    }

    /// Number of live entries
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    /// Whether the table is empty
    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    /// Maximum number of entries
    pub fn capacity(&self) -> usize {
        self.inner.lock().cap().get()
    }
}

impl<K: Hash + Eq, V> fmt::Debug for SessionTable<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionTable")
            .field("name", &self.name)
            .field("len", &self.inner.lock().len())
            .finish_non_exhaustive()
    }
}
