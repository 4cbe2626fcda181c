//! Token cache collaborator
//!
//! The contract an authentication library's in-memory cache offers to the
//! persistence layer. Token semantics stay inside the implementation; the
//! helper only moves opaque bytes in and out around each access.

use std::sync::Arc;

use thiserror::Error;

use super::helper::CacheError;

/// The cache could not turn bytes into state, or state into bytes
#[derive(Debug, Error)]
#[error("Token cache serialization failed: {0}")]
pub struct SerializationError(pub String);

impl From<serde_json::Error> for SerializationError {
    fn from(e: serde_json::Error) -> Self {
        Self(e.to_string())
    }
}

/// Arguments passed to before/after access callbacks
pub struct TokenCacheNotificationArgs<'a> {
    /// The cache being accessed
    pub cache: &'a dyn TokenCache,
    /// Whether the access changed the cache contents
    pub has_state_changed: bool,
}

/// Callback invoked around every cache access
///
/// A successful before-access leaves the cross-process lock held until the
/// matching after-access runs. Skipping the after-access, including on a
/// panic, wedges every other user of the cache until the lock times out.
pub type AccessCallback =
    Arc<dyn Fn(&TokenCacheNotificationArgs<'_>) -> Result<(), CacheError> + Send + Sync>;

/// In-memory token cache owned by an authentication library
///
/// Implementations must call the before-access callback before touching
/// their state and must not hold internal locks while doing so. Once the
/// before-access succeeds the after-access must run exactly once, even if
/// the operation in between fails or panics.
pub trait TokenCache: Send + Sync {
    /// Installs or removes the before-access callback
    fn set_before_access(&self, callback: Option<AccessCallback>);

    /// Installs or removes the after-access callback
    fn set_after_access(&self, callback: Option<AccessCallback>);

    /// Merges serialized state into the cache
    fn deserialize(&self, data: &[u8]) -> Result<(), SerializationError>;

    /// Serializes the whole cache
    fn serialize(&self) -> Result<Vec<u8>, SerializationError>;

    /// Drops all in-memory state
    fn clear(&self);

    /// Returns true if the current access changed the cache
    fn has_state_changed(&self) -> bool;
}
