//! Cache module - Token cache synchronization
//!
//! Keeps in-memory token caches in step with the persisted blob:
//! - [`TokenCache`]: the hooks an authentication library's cache exposes
//! - [`CacheHelper`]: locks, reloads, merges and persists around every access
//! - [`CacheWatcher`]: reports changes made to the cache file by anyone

mod helper;
mod memory;
mod token_cache;
mod watcher;

pub use helper::{CacheError, CacheHelper, CacheResult};
pub use memory::InMemoryTokenCache;
pub use token_cache::{AccessCallback, SerializationError, TokenCache, TokenCacheNotificationArgs};
pub use watcher::{CacheChangedEvent, CacheWatcher, WatcherConfig};
