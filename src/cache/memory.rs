//! In-memory token cache
//!
//! A small key/value [`TokenCache`] serialized as a JSON object. It plays
//! the role of an authentication library's cache in tests and in the
//! diagnostic binary, and shows how a cache must drive the access hooks.

use std::collections::BTreeMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use super::helper::CacheResult;
use super::token_cache::{AccessCallback, SerializationError, TokenCache, TokenCacheNotificationArgs};

/// Key/value token cache kept in memory
#[derive(Default)]
pub struct InMemoryTokenCache {
    entries: Mutex<BTreeMap<String, String>>,
    before_access: Mutex<Option<AccessCallback>>,
    after_access: Mutex<Option<AccessCallback>>,
    state_changed: AtomicBool,
}

impl InMemoryTokenCache {
    /// Creates an empty cache with no hooks installed
    pub fn new() -> Self {
        Self::default()
    }

    /// Looks up a value
    pub fn get(&self, key: &str) -> CacheResult<Option<String>> {
        self.access(false, |entries| entries.get(key).cloned())
    }

    /// Inserts or replaces a value
    pub fn insert(&self, key: impl Into<String>, value: impl Into<String>) -> CacheResult<()> {
        let (key, value) = (key.into(), value.into());
        self.access(true, move |entries| {
            entries.insert(key, value);
        })
    }

    /// Removes a value, returning true if it existed
    pub fn remove(&self, key: &str) -> CacheResult<bool> {
        self.access(true, |entries| entries.remove(key).is_some())
    }

    /// Lists all keys
    pub fn keys(&self) -> CacheResult<Vec<String>> {
        self.access(false, |entries| entries.keys().cloned().collect())
    }

    /// Runs `op` between the before and after access hooks
    ///
    /// The after hook runs even if `op` panics; the panic resumes afterwards.
    fn access<R>(
        &self,
        mutates: bool,
        op: impl FnOnce(&mut BTreeMap<String, String>) -> R,
    ) -> CacheResult<R> {
        let before = lock(&self.before_access).clone();
        if let Some(callback) = before {
            callback(&TokenCacheNotificationArgs {
                cache: self,
                has_state_changed: false,
            })?;
        }

        let result = panic::catch_unwind(AssertUnwindSafe(|| op(&mut lock(&self.entries))));
        if mutates && result.is_ok() {
            self.state_changed.store(true, Ordering::SeqCst);
        }

        // Consume the flag before the after hook releases the lock, so a
        // bracket started by another thread keeps its own change.
        let changed = self.state_changed.swap(false, Ordering::SeqCst);
        let after = lock(&self.after_access).clone();
        let outcome = match after {
            Some(callback) => callback(&TokenCacheNotificationArgs {
                cache: self,
                has_state_changed: changed,
            }),
            None => Ok(()),
        };

        match result {
            Ok(value) => outcome.map(|_| value),
            Err(payload) => panic::resume_unwind(payload),
        }
    }
}

impl TokenCache for InMemoryTokenCache {
    fn set_before_access(&self, callback: Option<AccessCallback>) {
        *lock(&self.before_access) = callback;
    }

    fn set_after_access(&self, callback: Option<AccessCallback>) {
        *lock(&self.after_access) = callback;
    }

    fn deserialize(&self, data: &[u8]) -> Result<(), SerializationError> {
        let incoming: BTreeMap<String, String> = serde_json::from_slice(data)?;
        lock(&self.entries).extend(incoming);
        Ok(())
    }

    fn serialize(&self) -> Result<Vec<u8>, SerializationError> {
        Ok(serde_json::to_vec(&*lock(&self.entries))?)
    }

    fn clear(&self) {
        lock(&self.entries).clear();
    }

    fn has_state_changed(&self) -> bool {
        self.state_changed.load(Ordering::SeqCst)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
