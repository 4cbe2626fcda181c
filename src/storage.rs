//! Cache storage - Accessor I/O with error containment
//!
//! Wraps one [`CacheAccessor`] and decides what happens when the OS store
//! misbehaves. Reads never return "nothing": a missing or unreadable blob
//! is an empty vector. By default failures are logged and swallowed so a
//! broken store looks like a cache miss; the `try_` variants surface them.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use thiserror::Error;
use tracing::{debug, warn};

use crate::accessors::{platform_accessor, AccessorError, CacheAccessor};
use crate::config::StorageCreationProperties;

/// Marker written by the persistence self-test
pub const PERSISTENCE_VALIDATION_DATA: &[u8] = b"token_cache_persistence_check";

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors surfaced by storage operations
#[derive(Debug, Error)]
pub enum StorageError {
    /// The accessor failed
    #[error("Cache {operation} failed: {source}")]
    Accessor {
        operation: &'static str,
        #[source]
        source: AccessorError,
    },
}

impl StorageError {
    fn accessor(operation: &'static str, source: AccessorError) -> Self {
        Self::Accessor { operation, source }
    }

    /// Returns true when no accessor exists for this OS
    pub fn is_platform_unsupported(&self) -> bool {
        matches!(
            self,
            Self::Accessor {
                source: AccessorError::PlatformUnsupported(_),
                ..
            }
        )
    }
}

/// Outcome of a failed persistence self-test
///
/// One stable type whatever the platform cause.
#[derive(Debug, Error)]
pub enum PersistenceValidationError {
    /// The write succeeded but the read returned nothing
    #[error(
        "Persistence check failed: data was written but could not be read back. \
         The platform secret store is probably not running (on Linux, check that a \
         D-Bus session and a Secret Service provider are available)"
    )]
    EmptyRead,

    /// The read returned something other than what was written
    #[error(
        "Persistence check failed: read back {actual} bytes that differ from the \
         {expected} bytes written"
    )]
    Mismatch { expected: usize, actual: usize },

    /// The store raised an error during the check
    #[error("Persistence check failed: {0}")]
    Failed(#[source] StorageError),
}

/// Storage for one token cache blob
pub struct Storage {
    accessor: Box<dyn CacheAccessor>,
    cache_path: PathBuf,
}

impl Storage {
    /// Creates storage with the accessor for the current platform
    pub fn create(props: &StorageCreationProperties) -> StorageResult<Self> {
        let cache_path = props.cache_file_path();
        let accessor = match platform_accessor(props) {
            Ok(accessor) => accessor,
            Err(e) if Self::can_fall_back(props, &e) => {
                warn!("Secret store unavailable ({}), using an unprotected file", e);
                return Ok(Self::plain_file(cache_path));
            }
            Err(e) => return Err(StorageError::accessor("setup", e)),
        };
        let storage = Self::with_accessor(accessor, cache_path.clone());

        #[cfg(target_os = "linux")]
        {
            if props.use_linux_unprotected_file_fallback && props.keyring.is_some() {
                if let Err(e) = storage.verify_persistence() {
                    warn!("{}; falling back to an unprotected file", e);
                    return Ok(Self::plain_file(cache_path));
                }
            }
        }

        Ok(storage)
    }

    /// Creates storage over an explicit accessor
    pub fn with_accessor(accessor: Box<dyn CacheAccessor>, cache_path: impl Into<PathBuf>) -> Self {
        Self {
            accessor,
            cache_path: cache_path.into(),
        }
    }

    fn plain_file(cache_path: PathBuf) -> Self {
        let accessor = crate::accessors::FileAccessor::new(cache_path.clone());
        Self::with_accessor(Box::new(accessor), cache_path)
    }

    fn can_fall_back(props: &StorageCreationProperties, error: &AccessorError) -> bool {
        cfg!(target_os = "linux")
            && props.use_linux_unprotected_file_fallback
            && !matches!(error, AccessorError::PlatformUnsupported(_))
    }

    /// Path of the cache file (or its sentinel)
    pub fn cache_path(&self) -> &Path {
        &self.cache_path
    }

    /// Reads the blob, returning an empty vector on a miss or an error
    pub fn read_data(&self) -> Vec<u8> {
        self.try_read_data().unwrap_or_else(|e| {
            warn!("Ignoring cache read failure: {}", e);
            Vec::new()
        })
    }

    /// Reads the blob, surfacing accessor errors
    pub fn try_read_data(&self) -> StorageResult<Vec<u8>> {
        let data = self
            .accessor
            .read()
            .map_err(|e| StorageError::accessor("read", e))?
            .unwrap_or_default();
        debug!("Read {} bytes from {}", data.len(), self.cache_path.display());
        Ok(data)
    }

    /// Writes the blob, logging and ignoring errors
    pub fn write_data(&self, data: &[u8]) {
        if let Err(e) = self.try_write_data(data) {
            warn!("Ignoring cache write failure: {}", e);
        }
    }

    /// Writes the blob, surfacing accessor errors
    pub fn try_write_data(&self, data: &[u8]) -> StorageResult<()> {
        self.accessor
            .write(data)
            .map_err(|e| StorageError::accessor("write", e))?;
        debug!("Wrote {} bytes to {}", data.len(), self.cache_path.display());
        Ok(())
    }

    /// Clears the blob, logging and ignoring errors
    pub fn clear(&self) {
        if let Err(e) = self.try_clear() {
            warn!("Ignoring cache clear failure: {}", e);
        }
    }

    /// Clears the blob, surfacing accessor errors
    pub fn try_clear(&self) -> StorageResult<()> {
        self.accessor
            .clear()
            .map_err(|e| StorageError::accessor("clear", e))?;
        debug!("Cleared {}", self.cache_path.display());
        Ok(())
    }

    /// Checks that the OS store really keeps data
    ///
    /// Round-trips a marker through an isolated validation accessor, never
    /// the real one, and always clears the marker afterwards.
    pub fn verify_persistence(&self) -> Result<(), PersistenceValidationError> {
        let validation = self
            .accessor
            .create_for_persistence_validation()
            .map_err(|e| {
                PersistenceValidationError::Failed(StorageError::accessor("validation setup", e))
            })?;

        let result = Self::round_trip(validation.as_ref());

        if let Err(e) = validation.clear() {
            warn!("Failed to clear persistence check data: {}", e);
        }

        match &result {
            Ok(()) => debug!("Persistence check passed for {}", self.cache_path.display()),
            Err(e) => warn!("{}", e),
        }
        result
    }

    fn round_trip(accessor: &dyn CacheAccessor) -> Result<(), PersistenceValidationError> {
        accessor
            .write(PERSISTENCE_VALIDATION_DATA)
            .map_err(|e| PersistenceValidationError::Failed(StorageError::accessor("write", e)))?;

        let read = accessor
            .read()
            .map_err(|e| PersistenceValidationError::Failed(StorageError::accessor("read", e)))?
            .unwrap_or_default();

        if read.is_empty() {
            return Err(PersistenceValidationError::EmptyRead);
        }
        if read != PERSISTENCE_VALIDATION_DATA {
            return Err(PersistenceValidationError::Mismatch {
                expected: PERSISTENCE_VALIDATION_DATA.len(),
                actual: read.len(),
            });
        }
        Ok(())
    }

    /// Last modification time of the cache file (or its sentinel)
    ///
    /// `None` when the file does not exist.
    pub fn last_modified(&self) -> Option<SystemTime> {
        fs::metadata(&self.cache_path)
            .and_then(|m| m.modified())
            .ok()
    }
}

impl std::fmt::Debug for Storage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Storage")
            .field("cache_path", &self.cache_path)
            .finish()
    }
}
