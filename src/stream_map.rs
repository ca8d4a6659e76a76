use rustc_hash::FxHashMap;
use std::hash::Hash;
use std::sync::{Arc, RwLock};

/// A copy-on-write map for data that is read on every packet but changes rarely: Readers get
///  an immutable snapshot and never block each other or writers for longer than it takes to
///  clone an `Arc`. Updates clone the map.
pub struct StreamMap<K, V> {
    map: RwLock<Arc<FxHashMap<K, V>>>,
}

impl<K: Hash + Eq + Clone, V: Clone> Default for StreamMap<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Hash + Eq + Clone, V: Clone> StreamMap<K, V> {
    pub fn new() -> StreamMap<K, V> {
        StreamMap {
            map: RwLock::new(Arc::new(FxHashMap::default())),
        }
    }

    /// The current content. Later updates do not affect the returned snapshot.
    pub fn load(&self) -> Arc<FxHashMap<K, V>> {
        self.map.read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn get(&self, key: &K) -> Option<V> {
        self.load()
            .get(key)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.load().is_empty()
    }

    /// Applies `f` to a copy of the map and publishes the result. Concurrent updates are
    ///  serialized, so none of them is lost.
    pub fn update<R>(&self, f: impl FnOnce(&mut FxHashMap<K, V>) -> R) -> R {
        let mut lock = self.map.write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut map = lock.as_ref().clone();
        let result = f(&mut map);
        *lock = Arc::new(map);
        result
    }

    pub fn insert(&self, key: K, value: V) -> Option<V> {
        self.update(|m| m.insert(key, value))
    }

    pub fn remove(&self, key: &K) -> Option<V> {
        self.update(|m| m.remove(key))
    }
}
