//! Per-key async mutexes.
//!
//! Mutations of one public hostname are serialized; different hostnames
//! never wait on each other. Entries are dropped once no task holds or waits
//! for them.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

#[derive(Default)]
pub struct KeyedLocks {
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

/// Held lock for one key.
pub struct KeyedGuard<'a> {
    owner: &'a KeyedLocks,
    key: String,
    _guard: OwnedMutexGuard<()>,
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `key`.
    pub async fn lock(&self, key: &str) -> KeyedGuard<'_> {
        let mutex = {
            let mut locks = self.map();
            // Entries left by waiters that gave up before acquiring
            locks.retain(|_, mutex| Arc::strong_count(mutex) > 1);
            Arc::clone(locks.entry(key.to_string()).or_default())
        };

        KeyedGuard {
            owner: self,
            key: key.to_string(),
            _guard: mutex.lock_owned().await,
        }
    }

    /// Keys currently held or awaited.
    pub fn len(&self) -> usize {
        self.map().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn map(&self) -> MutexGuard<'_, HashMap<String, Arc<AsyncMutex<()>>>> {
        self.locks.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Drop for KeyedGuard<'_> {
    fn drop(&mut self) {
        let mut locks = self.owner.map();
        // One reference in the map, one inside our guard: nobody else is waiting
        if locks
            .get(&self.key)
            .is_some_and(|mutex| Arc::strong_count(mutex) <= 2)
        {
            locks.remove(&self.key);
        }
    }
}
