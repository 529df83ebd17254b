//! The shared response cache.
//!
//! Every mutation of the [`CacheStore`] produces a new [`Cache`] snapshot
//! and hands it to every registered watcher, in registration order and in
//! publish order. Entries
//! that a mutation did not touch are shared between the old and the new
//! snapshot, so a consumer can tell whether *its* entry changed with
//! [`Arc::ptr_eq`].

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, trace};

use crate::error::ConfigError;

/// A cached response with the domains it belongs to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub data: Value,
    pub domains: Vec<String>,
    /// Set when one of `domains` was invalidated. The data must not be
    /// treated as fresh until a new response replaces it.
    pub refetch: bool,
}

impl CacheEntry {
    /// Creates a fresh entry.
    #[must_use]
    pub const fn new(data: Value, domains: Vec<String>) -> Self {
        Self {
            data,
            domains,
            refetch: false,
        }
    }

    /// Returns `true` if the entry belongs to any of `domains`.
    #[must_use]
    pub fn intersects(&self, domains: &[String]) -> bool {
        self.domains.iter().any(|domain| domains.contains(domain))
    }

    fn marked_for_refetch(&self) -> Self {
        Self {
            refetch: true,
            ..self.clone()
        }
    }
}

/// An immutable snapshot of the cache, keyed by request key.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Cache {
    entries: HashMap<String, Arc<CacheEntry>>,
}

impl Cache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an entry, for building seed snapshots.
    #[must_use]
    pub fn with_entry(mut self, key: impl Into<String>, entry: CacheEntry) -> Self {
        self.entries.insert(key.into(), Arc::new(entry));
        self
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Arc<CacheEntry>> {
        self.entries.get(key)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Arc<CacheEntry>)> {
        self.entries.iter().map(|(key, entry)| (key.as_str(), entry))
    }

    /// Returns the keys of every entry tagged with `domain`.
    #[must_use]
    pub fn keys_in_domain(&self, domain: &str) -> Vec<&str> {
        let mut keys: Vec<&str> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.domains.iter().any(|d| d == domain))
            .map(|(key, _)| key.as_str())
            .collect();
        keys.sort_unstable();
        keys
    }

    /// Parses a snapshot serialized with [`Cache::to_json`], e.g. one
    /// embedded in a server-rendered page.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidCache`] if `json` is not a valid
    /// snapshot.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(json).map_err(|e| ConfigError::InvalidCache(e.to_string()))
    }

    /// Serializes the snapshot.
    #[must_use]
    pub fn to_json(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    fn inserted(&self, key: String, entry: CacheEntry) -> Self {
        let mut entries = self.entries.clone();
        entries.insert(key, Arc::new(entry));
        Self { entries }
    }

    fn invalidated(&self, domains: &[String]) -> (Self, usize) {
        let mut matched = 0;
        let entries = self
            .entries
            .iter()
            .map(|(key, entry)| {
                let entry = if entry.intersects(domains) {
                    matched += 1;
                    Arc::new(entry.marked_for_refetch())
                } else {
                    Arc::clone(entry)
                };
                (key.clone(), entry)
            })
            .collect();
        (Self { entries }, matched)
    }
}

impl FromIterator<(String, CacheEntry)> for Cache {
    fn from_iter<I: IntoIterator<Item = (String, CacheEntry)>>(iter: I) -> Self {
        Self {
            entries: iter
                .into_iter()
                .map(|(key, entry)| (key, Arc::new(entry)))
                .collect(),
        }
    }
}

type Watcher = Arc<dyn Fn(&Arc<Cache>) + Send + Sync>;

struct StoreState {
    cache: Arc<Cache>,
    watchers: Vec<(u64, Watcher)>,
    next_id: u64,
    /// Published snapshots not yet delivered, in publish order, each with the
    /// watchers registered when it was published.
    outbox: VecDeque<(Arc<Cache>, Vec<Watcher>)>,
    /// A thread is draining `outbox`.
    delivering: bool,
}

/// The owner of the current snapshot and its watchers.
#[derive(Clone)]
pub struct CacheStore {
    state: Arc<Mutex<StoreState>>,
}

impl CacheStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::with_initial(Cache::default())
    }

    /// Creates a store seeded with `cache`.
    #[must_use]
    pub fn with_initial(cache: Cache) -> Self {
        Self {
            state: Arc::new(Mutex::new(StoreState {
                cache: Arc::new(cache),
                watchers: Vec::new(),
                next_id: 0,
                outbox: VecDeque::new(),
                delivering: false,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, StoreState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns the current snapshot.
    #[must_use]
    pub fn cache(&self) -> Arc<Cache> {
        Arc::clone(&self.lock().cache)
    }

    /// Registers `callback` to receive every new snapshot.
    ///
    /// The watcher stays registered until the returned guard is dropped or
    /// [`WatcherGuard::unsubscribe`] is called.
    #[must_use = "dropping the guard unsubscribes the watcher immediately"]
    pub fn add_cache_watcher<F>(&self, callback: F) -> WatcherGuard
    where
        F: Fn(&Arc<Cache>) + Send + Sync + 'static,
    {
        let mut state = self.lock();
        let id = state.next_id;
        state.next_id += 1;
        state.watchers.push((id, Arc::new(callback)));
        trace!(id, watchers = state.watchers.len(), "cache watcher added");

        WatcherGuard {
            state: Arc::downgrade(&self.state),
            id,
        }
    }

    /// Inserts or replaces the entry at `key` with a fresh entry.
    pub fn add_response<I, D>(&self, key: impl Into<String>, data: Value, domains: I)
    where
        I: IntoIterator<Item = D>,
        D: Into<String>,
    {
        let key = key.into();
        let entry = CacheEntry::new(data, domains.into_iter().map(Into::into).collect());
        debug!(%key, domains = ?entry.domains, "caching response");
        self.publish(|cache| cache.inserted(key, entry));
    }

    /// Flags every entry tagged with any of `domains` for refetch.
    ///
    /// Watchers are notified even when nothing matched.
    pub fn clear_domains<I, D>(&self, domains: I)
    where
        I: IntoIterator<Item = D>,
        D: Into<String>,
    {
        let domains: Vec<String> = domains.into_iter().map(Into::into).collect();
        self.publish(|cache| {
            let (next, matched) = cache.invalidated(&domains);
            debug!(?domains, matched, "invalidating domains");
            next
        });
    }

    /// Swaps in the next snapshot and delivers it.
    ///
    /// Snapshots reach every watcher in publish order, also across threads.
    /// Only one thread delivers at a time; a publish made while another
    /// delivery runs (including one made from inside a watcher) is queued
    /// and delivered by the thread already delivering.
    fn publish(&self, update: impl FnOnce(&Cache) -> Cache) {
        let mut state = self.lock();
        let snapshot = Arc::new(update(&state.cache));
        state.cache = Arc::clone(&snapshot);
        let watchers = state
            .watchers
            .iter()
            .map(|(_, watcher)| Arc::clone(watcher))
            .collect();
        state.outbox.push_back((snapshot, watchers));
        if state.delivering {
            trace!(queued = state.outbox.len(), "cache delivery queued");
            return;
        }
        state.delivering = true;

        let mut delivery = Delivery { store: self, done: false };
        // Watchers run without the lock so they may read the store or
        // register further watchers. Those only see later snapshots.
        loop {
            let Some((snapshot, watchers)) = state.outbox.pop_front() else {
                break;
            };
            drop(state);
            trace!(watchers = watchers.len(), "notifying cache watchers");
            for watcher in watchers {
                watcher(&snapshot);
            }
            state = self.lock();
        }
        state.delivering = false;
        delivery.done = true;
    }

    #[cfg(test)]
    fn watcher_count(&self) -> usize {
        self.lock().watchers.len()
    }
}

/// Releases the delivery role if a watcher panics mid-delivery.
struct Delivery<'a> {
    store: &'a CacheStore,
    done: bool,
}

impl Drop for Delivery<'_> {
    fn drop(&mut self) {
        if !self.done {
            let mut state = self.store.lock();
            state.delivering = false;
            state.outbox.clear();
        }
    }
}

impl Default for CacheStore {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CacheStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock();
        f.debug_struct("CacheStore")
            .field("entries", &state.cache.len())
            .field("watchers", &state.watchers.len())
            .finish()
    }
}

/// Keeps a cache watcher registered.
#[derive(Debug)]
pub struct WatcherGuard {
    state: Weak<Mutex<StoreState>>,
    id: u64,
}

impl WatcherGuard {
    /// Removes this watcher and no other. Calling it again is a no-op.
    pub fn unsubscribe(&self) {
        if let Some(state) = self.state.upgrade() {
            let mut state = state.lock().unwrap_or_else(PoisonError::into_inner);
            state.watchers.retain(|(id, _)| *id != self.id);
            trace!(id = self.id, "cache watcher removed");
        }
    }

    /// Keeps the watcher registered for the lifetime of the store.
    pub fn detach(self) {
        std::mem::forget(self);
    }
}

impl Drop for WatcherGuard {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}
