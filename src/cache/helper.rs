//! Cache helper - Synchronized persistence for registered token caches
//!
//! Every access to a registered cache is bracketed:
//!
//! 1. before access: take the cross-process lock, read the persisted blob
//!    and merge it into every registered cache that has not seen it yet
//! 2. the cache performs its own read or write
//! 3. after access: if the cache changed, serialize it and write it back,
//!    then release the lock no matter what happened
//!
//! A blob that fails to deserialize, or a cache that fails to serialize or
//! persist, resets both the in-memory caches and the store and then reports
//! the failure. Half-applied state is never kept.

use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::{Duration, SystemTime};

use thiserror::Error;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};
use zeroize::Zeroizing;

use super::token_cache::{SerializationError, TokenCache, TokenCacheNotificationArgs};
use super::watcher::{CacheChangedEvent, CacheWatcher, WatcherConfig};
use crate::config::{LockOptions, ReloadPolicy, StorageCreationProperties};
use crate::lock::{CrossPlatLock, LockError};
use crate::storage::{PersistenceValidationError, Storage, StorageError};

/// Result type for helper operations
pub type CacheResult<T> = Result<T, CacheError>;

/// Errors surfaced to callers of a synchronized cache
#[derive(Debug, Error)]
pub enum CacheError {
    /// The cross-process lock could not be taken
    #[error(transparent)]
    Lock(#[from] LockError),

    /// The store failed where failure cannot be ignored
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// Cache state could not be (de)serialized; caches and store were reset
    #[error("Token cache was corrupt and has been reset: {0}")]
    Corrupt(#[source] SerializationError),

    /// The store does not keep data
    #[error(transparent)]
    Persistence(#[from] PersistenceValidationError),
}

type Blob = Arc<Zeroizing<Vec<u8>>>;

struct Registered {
    cache: Arc<dyn TokenCache>,
    /// Last persisted bytes this cache has absorbed or produced
    last_seen: Option<Blob>,
}

#[derive(Default)]
struct HelperState {
    caches: Vec<Registered>,
    /// Cache file modification time when `latest` was observed
    observed: Option<SystemTime>,
    /// Most recent persisted bytes known to this helper
    latest: Option<Blob>,
}

struct HelperInner {
    storage: Arc<Storage>,
    lock_path: PathBuf,
    lock_options: LockOptions,
    reload_policy: ReloadPolicy,
    state: Mutex<HelperState>,
    held_lock: Mutex<Option<CrossPlatLock>>,
    cancel: CancellationToken,
    events: broadcast::Sender<CacheChangedEvent>,
}

/// Coordinates registered token caches with one persisted blob
///
/// Cloning yields another handle to the same helper.
#[derive(Clone)]
pub struct CacheHelper {
    inner: Arc<HelperInner>,
}

impl CacheHelper {
    /// Creates a helper with platform storage built from `props`
    pub fn create(props: &StorageCreationProperties) -> CacheResult<Self> {
        let storage = Arc::new(Storage::create(props)?);
        Ok(Self::with_storage(props, storage))
    }

    /// Creates a helper over an existing storage handle
    ///
    /// Helpers sharing one physical cache can share the handle.
    pub fn with_storage(props: &StorageCreationProperties, storage: Arc<Storage>) -> Self {
        let (events, _) = broadcast::channel(16);
        Self {
            inner: Arc::new(HelperInner {
                storage,
                lock_path: props.lock_file_path(),
                lock_options: props.lock_options,
                reload_policy: props.reload_policy,
                state: Mutex::new(HelperState::default()),
                held_lock: Mutex::new(None),
                cancel: CancellationToken::new(),
                events,
            }),
        }
    }

    /// Storage handle used by this helper
    pub fn storage(&self) -> &Arc<Storage> {
        &self.inner.storage
    }

    /// Attaches the helper to `cache`
    ///
    /// Loads the persisted blob into the cache under the lock, then installs
    /// the access hooks. Registering the same cache twice is a no-op.
    pub fn register_cache(&self, cache: Arc<dyn TokenCache>) -> CacheResult<()> {
        let _lock = self.inner.acquire()?;
        let mut state = self.inner.state();

        if state.caches.iter().any(|r| same_cache(&r.cache, cache.as_ref())) {
            return Ok(());
        }

        let data: Blob = Arc::new(Zeroizing::new(self.inner.storage.read_data()));
        if !data.is_empty() {
            if let Err(e) = cache.deserialize(&data) {
                error!("Persisted token cache is unreadable, resetting: {}", e);
                cache.clear();
                self.inner.reset(&mut state);
                return Err(CacheError::Corrupt(e));
            }
        }
        state.observed = self.inner.storage.last_modified();
        state.latest = Some(Arc::clone(&data));
        state.caches.push(Registered {
            cache: Arc::clone(&cache),
            last_seen: Some(data),
        });

        let weak = Arc::downgrade(&self.inner);
        cache.set_before_access(Some(Arc::new(move |args: &TokenCacheNotificationArgs<'_>| {
            with_inner(&weak, |inner| inner.before_access(args))
        })));
        let weak = Arc::downgrade(&self.inner);
        cache.set_after_access(Some(Arc::new(move |args: &TokenCacheNotificationArgs<'_>| {
            with_inner(&weak, |inner| inner.after_access(args))
        })));

        debug!("Registered token cache ({} total)", state.caches.len());
        Ok(())
    }

    /// Detaches the helper from `cache`, returning true if it was registered
    pub fn unregister_cache(&self, cache: &Arc<dyn TokenCache>) -> bool {
        let mut state = self.inner.state();
        let before = state.caches.len();
        state.caches.retain(|r| !same_cache(&r.cache, cache.as_ref()));
        let removed = state.caches.len() != before;
        if removed {
            cache.set_before_access(None);
            cache.set_after_access(None);
            debug!("Unregistered token cache ({} left)", state.caches.len());
        }
        removed
    }

    /// Number of registered caches
    pub fn registered_count(&self) -> usize {
        self.inner.state().caches.len()
    }

    /// Clears the persisted blob under the lock
    ///
    /// In-memory caches keep their contents.
    pub fn clear(&self) -> CacheResult<()> {
        let _lock = self.inner.acquire()?;
        self.inner.storage.try_clear()?;
        let mut state = self.inner.state();
        state.observed = None;
        state.latest = None;
        Ok(())
    }

    /// Checks that the platform store really keeps data
    pub fn verify_persistence(&self) -> CacheResult<()> {
        Ok(self.inner.storage.verify_persistence()?)
    }

    /// Subscribes to cache file change notifications
    ///
    /// Events only flow while a watcher started by [`CacheHelper::watch`] runs.
    pub fn subscribe(&self) -> broadcast::Receiver<CacheChangedEvent> {
        self.inner.events.subscribe()
    }

    /// Starts polling the cache file for changes
    ///
    /// Intervals shorter than [`WatcherConfig::MIN_INTERVAL`] are raised to
    /// it. Must be called from within a tokio runtime.
    pub fn watch(&self, interval: Duration) -> CacheWatcher {
        CacheWatcher::spawn(
            self.inner.storage.cache_path().to_path_buf(),
            WatcherConfig { interval },
            self.inner.events.clone(),
            self.inner.cancel.child_token(),
        )
    }

    /// Aborts pending lock waits and stops watchers; the helper stays unusable
    pub fn shutdown(&self) {
        self.inner.cancel.cancel();
    }
}

impl HelperInner {
    fn state(&self) -> MutexGuard<'_, HelperState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn acquire(&self) -> CacheResult<CrossPlatLock> {
        Ok(CrossPlatLock::acquire_with_cancel(
            &self.lock_path,
            self.lock_options,
            &self.cancel,
        )?)
    }

    fn before_access(&self, _args: &TokenCacheNotificationArgs<'_>) -> CacheResult<()> {
        let lock = self.acquire()?;
        *self
            .held_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(lock);

        let result = self.reload();
        if result.is_err() {
            // No after-access follows a failed before-access
            self.release_lock();
        }
        result
    }

    fn after_access(&self, args: &TokenCacheNotificationArgs<'_>) -> CacheResult<()> {
        // Take the lock out of the slot first so that no other bracket can
        // observe or release a lock it does not own.
        let lock = self.take_lock();
        let result = match (&lock, args.has_state_changed) {
            (Some(_), true) => self.persist(args.cache),
            (None, true) => {
                warn!("After-access without a held lock, change not persisted");
                Ok(())
            }
            (_, false) => Ok(()),
        };
        drop(lock);
        result
    }

    /// Merges the persisted blob into every cache that has not seen it
    fn reload(&self) -> CacheResult<()> {
        let mut state = self.state();

        let modified = self.storage.last_modified();
        let cached = match (&state.latest, self.reload_policy) {
            (Some(latest), ReloadPolicy::LastWriteTime)
                if state.observed.is_some() && state.observed == modified =>
            {
                trace!("Cache file unchanged, skipping read");
                Some(Arc::clone(latest))
            }
            _ => None,
        };
        let data = match cached {
            Some(data) => data,
            None => {
                let data: Blob = Arc::new(Zeroizing::new(self.storage.read_data()));
                state.observed = modified;
                state.latest = Some(Arc::clone(&data));
                data
            }
        };

        let mut failure = None;
        for registered in state.caches.iter_mut() {
            if registered
                .last_seen
                .as_ref()
                .is_some_and(|seen| seen.as_slice() == data.as_slice())
            {
                continue;
            }
            if !data.is_empty() {
                if let Err(e) = registered.cache.deserialize(&data) {
                    failure = Some(e);
                    break;
                }
            }
            registered.last_seen = Some(Arc::clone(&data));
        }

        if let Some(e) = failure {
            error!("Persisted token cache is unreadable, resetting: {}", e);
            self.reset(&mut state);
            return Err(CacheError::Corrupt(e));
        }

        debug!("Reloaded {} bytes into registered caches", data.len());
        Ok(())
    }

    /// Serializes `cache` and writes it back
    fn persist(&self, cache: &dyn TokenCache) -> CacheResult<()> {
        let mut state = self.state();

        let data: Blob = match cache.serialize() {
            Ok(data) => Arc::new(Zeroizing::new(data)),
            Err(e) => {
                error!("Token cache could not be serialized, resetting: {}", e);
                self.reset(&mut state);
                return Err(CacheError::Corrupt(e));
            }
        };

        if let Err(e) = self.storage.try_write_data(&data) {
            error!("Token cache could not be persisted, resetting: {}", e);
            self.reset(&mut state);
            return Err(CacheError::Storage(e));
        }

        state.observed = self.storage.last_modified();
        state.latest = Some(Arc::clone(&data));
        if let Some(registered) = state
            .caches
            .iter_mut()
            .find(|r| same_cache(&r.cache, cache))
        {
            registered.last_seen = Some(data);
        }
        Ok(())
    }

    /// Drops in-memory and persisted state after a corruption
    fn reset(&self, state: &mut HelperState) {
        for registered in state.caches.iter_mut() {
            registered.cache.clear();
            registered.last_seen = None;
        }
        state.observed = None;
        state.latest = None;
        self.storage.clear();
    }

    fn take_lock(&self) -> Option<CrossPlatLock> {
        self.held_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
    }

    fn release_lock(&self) {
        drop(self.take_lock());
    }
}

impl Drop for HelperInner {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn with_inner(
    weak: &Weak<HelperInner>,
    f: impl FnOnce(&HelperInner) -> CacheResult<()>,
) -> CacheResult<()> {
    match weak.upgrade() {
        Some(inner) => f(&inner),
        None => Ok(()),
    }
}

fn same_cache(registered: &Arc<dyn TokenCache>, other: &dyn TokenCache) -> bool {
    std::ptr::eq(
        Arc::as_ptr(registered) as *const u8,
        other as *const dyn TokenCache as *const u8,
    )
}
