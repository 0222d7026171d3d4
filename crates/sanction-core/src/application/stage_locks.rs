//! Keyed async locks
//!
//! One mutex per key, created on first use and dropped again once the last
//! guard or waiter for that key is gone. Guards can be held across awaits
//! inside the engine.

use dashmap::DashMap;
use std::hash::Hash;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Lazily populated map of per-key mutexes
#[derive(Debug)]
pub struct KeyedLocks<K>
where
    K: Eq + Hash + Clone,
{
    locks: DashMap<K, Arc<Mutex<()>>>,
}

/// Exclusive hold on one key; unlocks and prunes the entry on drop
pub struct KeyedLockGuard<'a, K>
where
    K: Eq + Hash + Clone,
{
    locks: &'a KeyedLocks<K>,
    key: K,
    guard: Option<OwnedMutexGuard<()>>,
}

impl<K> KeyedLocks<K>
where
    K: Eq + Hash + Clone,
{
    /// Create an empty lock map
    pub fn new() -> Self {
        Self {
            locks: DashMap::with_capacity(64),
        }
    }

    /// Acquire the lock for `key`, waiting for the current holder
    pub async fn lock(&self, key: &K) -> KeyedLockGuard<'_, K> {
        let mutex = self
            .locks
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let guard = mutex.lock_owned().await;

        KeyedLockGuard {
            locks: self,
            key: key.clone(),
            guard: Some(guard),
        }
    }

    /// Drop the entry for a key nobody holds or waits on
    fn release(&self, key: &K) {
        self.locks
            .remove_if(key, |_, mutex| Arc::strong_count(mutex) == 1);
    }

    /// Number of keys with a lock entry
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    /// Whether no key has a lock entry
    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

impl<K> Drop for KeyedLockGuard<'_, K>
where
    K: Eq + Hash + Clone,
{
    fn drop(&mut self) {
        // unlock first so the map holds the only reference when nobody waits
        drop(self.guard.take());
        self.locks.release(&self.key);
    }
}

impl<K> Default for KeyedLocks<K>
where
    K: Eq + Hash + Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_same_key_is_serialized() {
        let locks = Arc::new(KeyedLocks::<String>::new());
        let key = "s-1".to_string();

        let guard = locks.lock(&key).await;

        let contender = {
            let locks = locks.clone();
            let key = key.clone();
            tokio::spawn(async move {
                let _guard = locks.lock(&key).await;
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!contender.is_finished());

        drop(guard);
        contender.await.unwrap();
    }

    #[tokio::test]
    async fn test_distinct_keys_do_not_block() {
        let locks = KeyedLocks::<String>::new();
        let _a = locks.lock(&"a".to_string()).await;
        let _b = locks.lock(&"b".to_string()).await;
        assert_eq!(locks.len(), 2);
    }

    #[tokio::test]
    async fn test_entry_is_pruned_when_last_guard_drops() {
        let locks = KeyedLocks::<String>::new();
        let key = "s-1".to_string();

        let guard = locks.lock(&key).await;
        assert_eq!(locks.len(), 1);

        drop(guard);
        assert!(locks.is_empty());
    }

    #[tokio::test]
    async fn test_entry_survives_while_someone_waits() {
        let locks = Arc::new(KeyedLocks::<String>::new());
        let key = "s-1".to_string();

        let guard = locks.lock(&key).await;
        let waiter = {
            let locks = locks.clone();
            let key = key.clone();
            tokio::spawn(async move {
                let _guard = locks.lock(&key).await;
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        drop(guard);
        assert_eq!(locks.len(), 1);

        waiter.await.unwrap();
        assert!(locks.is_empty());
    }
}
