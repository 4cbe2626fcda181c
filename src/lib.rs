//! Token cache persistence - Keep OAuth2 token caches on disk, safely shared
//!
//! Persists the opaque blob an authentication library produces for its
//! token cache, protected by the operating system's user-scoped secret
//! facility, and keeps several processes that share the blob consistent.
//!
//! ## Features
//!
//! - Windows: DPAPI-encrypted file
//! - macOS: Keychain item
//! - Linux: Secret Service item, with an opt-in plain file fallback
//! - Cross-process file lock with bounded retries
//! - Persistence self-test that never touches the real cache entry
//! - Before/after access synchronization for any number of in-memory caches
//! - Change notifications for the persisted cache
//!
//! ## Architecture
//!
//! - **Accessors**: one store per platform behind [`CacheAccessor`]
//! - **Lock**: [`CrossPlatLock`], an exclusive lock file
//! - **Storage**: [`Storage`], error containment around an accessor
//! - **Cache**: [`CacheHelper`], the lock, reload, merge and persist protocol
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use token_cache_persistence::{
//!     default_cache_directory, CacheHelper, InMemoryTokenCache, StorageCreationPropertiesBuilder,
//! };
//!
//! # fn main() -> anyhow::Result<()> {
//! let dir = default_cache_directory().unwrap_or_else(std::env::temp_dir);
//! let props = StorageCreationPropertiesBuilder::new("msal.cache", dir)
//!     .with_mac_keychain("MSALCache", "MSALCache")
//!     .with_linux_keyring(
//!         "msal.cache",
//!         "default",
//!         "MSALCache",
//!         ("Version", "1"),
//!         ("ProductGroup", "MyApps"),
//!     )
//!     .build()?;
//!
//! let helper = CacheHelper::create(&props)?;
//! helper.verify_persistence()?;
//!
//! let cache = Arc::new(InMemoryTokenCache::new());
//! helper.register_cache(cache.clone())?;
//! cache.insert("account", "refresh-token")?;
//! # Ok(())
//! # }
//! ```

pub mod accessors;
pub mod cache;
pub mod config;
pub mod lock;
pub mod storage;

pub use accessors::{platform_accessor, AccessorError, CacheAccessor, FileAccessor};
pub use cache::{
    CacheChangedEvent, CacheError, CacheHelper, CacheResult, CacheWatcher, InMemoryTokenCache,
    TokenCache, TokenCacheNotificationArgs, WatcherConfig,
};
pub use config::{
    default_cache_directory, ConfigError, LockOptions, ReloadPolicy, StorageCreationProperties,
    StorageCreationPropertiesBuilder,
};
pub use lock::{CrossPlatLock, LockError};
pub use storage::{PersistenceValidationError, Storage, StorageError};
