//! Backing stores that own the cache entries.
use std::{collections::HashMap, fmt::Debug, hash::Hash, num::NonZeroUsize};

use clap_blocks::abortable_cache::AbortableCacheConfig;
use indexmap::IndexMap;
use observability_deps::tracing::debug;

/// Key-value store that holds the entries of an [`AbortableCache`](crate::AbortableCache).
///
/// Capacity limits and eviction policy are up to the store. The cache only relies on the
/// operations below and never mutates the store behind the cache's back.
pub trait Store<K, E>: Send {
    /// Get entry for `key`.
    fn get(&mut self, key: &K) -> Option<E>;

    /// Insert or replace entry for `key`.
    fn set(&mut self, key: K, entry: E);

    /// Remove entry for `key`, returning it.
    fn delete(&mut self, key: &K) -> Option<E>;

    /// Check if there is an entry for `key`.
    fn has(&self, key: &K) -> bool;

    /// Snapshot of all keys.
    fn keys(&self) -> Vec<K>;

    /// Number of entries.
    fn len(&self) -> usize;

    /// Returns `true` if there are no entries.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Unbounded store.
#[derive(Debug)]
pub struct HashMapStore<K, E> {
    map: HashMap<K, E>,
}

impl<K, E> Default for HashMapStore<K, E> {
    fn default() -> Self {
        Self {
            map: HashMap::new(),
        }
    }
}

impl<K, E> Store<K, E> for HashMapStore<K, E>
where
    K: Clone + Eq + Hash + Send,
    E: Clone + Send,
{
    fn get(&mut self, key: &K) -> Option<E> {
        self.map.get(key).cloned()
    }

    fn set(&mut self, key: K, entry: E) {
        self.map.insert(key, entry);
    }

    fn delete(&mut self, key: &K) -> Option<E> {
        self.map.remove(key)
    }

    fn has(&self, key: &K) -> bool {
        self.map.contains_key(key)
    }

    fn keys(&self) -> Vec<K> {
        self.map.keys().cloned().collect()
    }

    fn len(&self) -> usize {
        self.map.len()
    }
}

/// Store that keeps at most `capacity` entries and drops the least recently used one first.
///
/// Both [`get`](Store::get) and [`set`](Store::set) count as use.
#[derive(Debug)]
pub struct LruStore<K, E> {
    capacity: NonZeroUsize,

    /// Ordered from least to most recently used.
    map: IndexMap<K, E>,
}

impl<K, E> LruStore<K, E>
where
    K: Eq + Hash,
{
    /// Create empty store.
    pub fn new(capacity: NonZeroUsize) -> Self {
        Self {
            capacity,
            map: IndexMap::with_capacity(capacity.get()),
        }
    }

    /// Create empty store from config.
    pub fn from_config(config: &AbortableCacheConfig) -> Self {
        Self::new(config.capacity)
    }

    /// Maximum number of entries.
    pub fn capacity(&self) -> NonZeroUsize {
        self.capacity
    }
}

impl<K, E> Store<K, E> for LruStore<K, E>
where
    K: Clone + Debug + Eq + Hash + Send,
    E: Clone + Send,
{
    fn get(&mut self, key: &K) -> Option<E> {
        let (key, entry) = self.map.shift_remove_entry(key)?;
        self.map.insert(key, entry.clone());
        Some(entry)
    }

    fn set(&mut self, key: K, entry: E) {
        self.map.shift_remove(&key);
        self.map.insert(key, entry);

        while self.map.len() > self.capacity.get() {
            if let Some((key, _entry)) = self.map.shift_remove_index(0) {
                debug!(?key, "evicting least recently used entry");
            }
        }
    }

    fn delete(&mut self, key: &K) -> Option<E> {
        self.map.shift_remove(key)
    }

    fn has(&self, key: &K) -> bool {
        self.map.contains_key(key)
    }

    fn keys(&self) -> Vec<K> {
        self.map.keys().cloned().collect()
    }

    fn len(&self) -> usize {
        self.map.len()
    }
}
