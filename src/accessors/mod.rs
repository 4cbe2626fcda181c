//! Cache accessors - Platform-specific blob storage
//!
//! An accessor reads, writes and clears one opaque token cache blob in a
//! single secure location:
//! - Windows: DPAPI-protected file
//! - macOS: Keychain item (plus a sentinel file for change detection)
//! - Linux: Secret Service item (plus a sentinel file), or a plain file
//! - Anywhere: plain file, for tests and explicit fallbacks

mod dpapi;
mod file;
mod secret_store;

pub use dpapi::{DpapiAccessor, DpapiError, DpapiStore};
pub use file::FileAccessor;
pub use secret_store::KeyringAccessor;

use crate::config::StorageCreationProperties;
use thiserror::Error;

/// Result type for accessor operations
pub type AccessorResult<T> = Result<T, AccessorError>;

/// Errors raised by the underlying OS facility
#[derive(Debug, Error)]
pub enum AccessorError {
    /// Filesystem failure
    #[error("IO error: {context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    /// Keychain / Secret Service failure
    #[error("Keyring error: {0}")]
    Keyring(#[from] ::keyring::Error),

    /// DPAPI failure
    #[error(transparent)]
    Dpapi(#[from] DpapiError),

    /// Properties lack the identifiers this platform needs
    #[error("Missing configuration: {0}")]
    Config(String),

    /// No accessor exists for this operating system
    #[error("Unsupported platform: {0}")]
    PlatformUnsupported(String),
}

impl AccessorError {
    /// Create an IO error with context
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }
}

/// Reads, writes and clears one token cache blob in OS storage
#[cfg_attr(test, mockall::automock)]
pub trait CacheAccessor: Send + Sync {
    /// Reads the stored blob, `None` when nothing is stored
    fn read(&self) -> AccessorResult<Option<Vec<u8>>>;

    /// Replaces the stored blob
    fn write(&self, data: &[u8]) -> AccessorResult<()>;

    /// Removes the stored blob
    fn clear(&self) -> AccessorResult<()>;

    /// Returns an accessor over an isolated test location
    ///
    /// Used to check that the OS facility actually keeps data without
    /// touching the user's real tokens.
    fn create_for_persistence_validation(&self) -> AccessorResult<Box<dyn CacheAccessor>>;
}

/// Selects the accessor for the current operating system
pub fn platform_accessor(
    props: &StorageCreationProperties,
) -> AccessorResult<Box<dyn CacheAccessor>> {
    #[cfg(target_os = "windows")]
    {
        Ok(Box::new(DpapiAccessor::new(props.cache_file_path())))
    }

    #[cfg(target_os = "macos")]
    {
        let keychain = props.keychain.as_ref().ok_or_else(|| {
            AccessorError::Config("keychain service and account are required on macOS".into())
        })?;
        Ok(Box::new(KeyringAccessor::keychain(
            keychain,
            props.cache_file_path(),
        )?))
    }

    #[cfg(target_os = "linux")]
    {
        match &props.keyring {
            Some(settings) => Ok(Box::new(KeyringAccessor::secret_service(
                settings,
                props.cache_file_path(),
            )?)),
            None if props.use_linux_unprotected_file_fallback => {
                Ok(Box::new(FileAccessor::new(props.cache_file_path())))
            }
            None => Err(AccessorError::Config(
                "keyring settings are required on Linux".into(),
            )),
        }
    }

    #[cfg(not(any(target_os = "windows", target_os = "macos", target_os = "linux")))]
    {
        let _ = props;
        Err(AccessorError::PlatformUnsupported(
            std::env::consts::OS.to_string(),
        ))
    }
}
