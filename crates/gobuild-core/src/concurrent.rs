//! Lock-protected key-value store shared between concurrent tasks.
//!
//! Call sites never see the lock: every check-then-write sequence is a single
//! method executed inside one critical section.

use std::borrow::Borrow;
use std::collections::BTreeMap;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

#[derive(Debug)]
pub struct ConcurrentMap<K, V> {
    inner: RwLock<BTreeMap<K, V>>,
}

impl<K: Ord, V> Default for ConcurrentMap<K, V> {
    fn default() -> Self {
        Self {
            inner: RwLock::new(BTreeMap::new()),
        }
    }
}

impl<K: Ord, V> ConcurrentMap<K, V> {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, BTreeMap<K, V>> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, BTreeMap<K, V>> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Inserts `value` only if `key` is absent. Returns true if this call claimed the key.
    pub fn claim_if_absent(&self, key: K, value: V) -> bool {
        let mut map = self.write();
        if map.contains_key(&key) {
            return false;
        }
        map.insert(key, value);
        true
    }

    /// Inserts `value` if `key` is absent, or replaces the current value when
    /// `should_replace(current, &value)` holds. Returns true if the map changed.
    pub fn upsert_if<F>(&self, key: K, value: V, should_replace: F) -> bool
    where
        F: FnOnce(&V, &V) -> bool,
    {
        let mut map = self.write();
        match map.get_mut(&key) {
            Some(current) => {
                if should_replace(current, &value) {
                    *current = value;
                    true
                } else {
                    false
                }
            }
            None => {
                map.insert(key, value);
                true
            }
        }
    }

    pub fn insert(&self, key: K, value: V) -> Option<V> {
        self.write().insert(key, value)
    }

    pub fn get<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Ord + ?Sized,
        V: Clone,
    {
        self.read().get(key).cloned()
    }

    pub fn contains_key<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Ord + ?Sized,
    {
        self.read().contains_key(key)
    }

    /// A sorted copy of the current contents.
    pub fn snapshot(&self) -> BTreeMap<K, V>
    where
        K: Clone,
        V: Clone,
    {
        self.read().clone()
    }

    pub fn into_inner(self) -> BTreeMap<K, V> {
        self.inner.into_inner().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }
}
