//! Per-key async lock with automatic cleanup using weak references
//!
//! The governor serializes every operation on a single GPU device (scheme
//! transitions, unit reconciliation, capacity reservations) through one of
//! these locks keyed by device identity, while distinct devices proceed in
//! parallel.

use std::collections::BTreeSet;
use std::hash::Hash;
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Guard for a single key; removes the key's lock entry when it is the last user.
pub struct KeyedLockGuard<K>
where
    K: Hash + Eq + Clone,
{
    guard: Option<OwnedMutexGuard<()>>,
    arc: Arc<Mutex<()>>,
    key: K,
    locks: Arc<DashMap<K, Weak<Mutex<()>>>>,
}

impl<K> KeyedLockGuard<K>
where
    K: Hash + Eq + Clone,
{
    fn new(
        guard: OwnedMutexGuard<()>,
        arc: Arc<Mutex<()>>,
        key: K,
        locks: Arc<DashMap<K, Weak<Mutex<()>>>>,
    ) -> Self {
        Self {
            guard: Some(guard),
            arc,
            key,
            locks,
        }
    }

    /// The key this guard serializes.
    ///
    /// Callers pass the guard to code that mutates per-key state as proof
    /// that the serialization is held for exactly this key.
    pub fn key(&self) -> &K {
        &self.key
    }
}

impl<K> Drop for KeyedLockGuard<K>
where
    K: Hash + Eq + Clone,
{
    fn drop(&mut self) {
        drop(self.guard.take());

        // strong_count == 1 means only self.arc remains: nobody holds or waits
        if Arc::strong_count(&self.arc) == 1 {
            self.locks
                .remove_if(&self.key, |_, weak| weak.strong_count() <= 1);
        }
    }
}

impl<K> std::fmt::Debug for KeyedLockGuard<K>
where
    K: Hash + Eq + Clone + std::fmt::Debug,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyedLockGuard")
            .field("key", &self.key)
            .finish()
    }
}

/// Guards for several keys, acquired in ascending key order.
pub struct KeyedLockGuards<K>
where
    K: Hash + Eq + Clone,
{
    guards: Vec<KeyedLockGuard<K>>,
}

impl<K> KeyedLockGuards<K>
where
    K: Hash + Eq + Clone,
{
    /// Returns the guard held for `key`, if it is part of this set.
    pub fn get(&self, key: &K) -> Option<&KeyedLockGuard<K>> {
        self.guards.iter().find(|g| g.key() == key)
    }

    pub fn iter(&self) -> impl Iterator<Item = &KeyedLockGuard<K>> {
        self.guards.iter()
    }

    pub fn len(&self) -> usize {
        self.guards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.guards.is_empty()
    }
}

/// A per-key async lock manager with automatic cleanup using weak references.
///
/// Concurrent operations on the same key run sequentially, operations on
/// different keys run concurrently. Entries are dropped from the internal map
/// as soon as the last guard for a key goes away.
///
/// # Example
///
/// ```rust,ignore
/// let locks = KeyedAsyncLock::<DeviceId>::new();
/// let guard = locks.lock(&DeviceId::new("gpu-node-1", 0)).await;
/// // ... mutate the device's scheme, units and reservations ...
/// drop(guard);
/// ```
pub struct KeyedAsyncLock<K>
where
    K: Hash + Eq + Clone,
{
    locks: Arc<DashMap<K, Weak<Mutex<()>>>>,
}

impl<K> KeyedAsyncLock<K>
where
    K: Hash + Eq + Clone,
{
    pub fn new() -> Self {
        Self {
            locks: Arc::new(DashMap::new()),
        }
    }

    /// Acquires the lock for `key`.
    pub async fn lock(&self, key: &K) -> KeyedLockGuard<K> {
        let arc = self.get_or_create_lock(key);
        let arc_clone = Arc::clone(&arc);
        let guard = arc.lock_owned().await;

        KeyedLockGuard::new(guard, arc_clone, key.clone(), Arc::clone(&self.locks))
    }

    /// Acquires the locks for every key in `keys`.
    ///
    /// Keys are deduplicated and locked in ascending order, so two callers
    /// locking overlapping key sets can never deadlock each other.
    pub async fn lock_many<'a, I>(&self, keys: I) -> KeyedLockGuards<K>
    where
        K: Ord + 'a,
        I: IntoIterator<Item = &'a K>,
    {
        let ordered: BTreeSet<&K> = keys.into_iter().collect();
        let mut guards = Vec::with_capacity(ordered.len());
        for key in ordered {
            guards.push(self.lock(key).await);
        }
        KeyedLockGuards { guards }
    }

    fn get_or_create_lock(&self, key: &K) -> Arc<Mutex<()>> {
        loop {
            match self.locks.entry(key.clone()) {
                dashmap::mapref::entry::Entry::Occupied(occupied) => {
                    if let Some(strong) = occupied.get().upgrade() {
                        return strong;
                    }
                    // stale weak reference, retry with a fresh lock
                    occupied.remove();
                }
                dashmap::mapref::entry::Entry::Vacant(vacant) => {
                    let strong = Arc::new(Mutex::new(()));
                    vacant.insert(Arc::downgrade(&strong));
                    return strong;
                }
            }
        }
    }

    /// Returns the number of lock entries currently stored.
    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

impl<K> Default for KeyedAsyncLock<K>
where
    K: Hash + Eq + Clone,
{
    fn default() -> Self {
        Self::new()
    }
}
