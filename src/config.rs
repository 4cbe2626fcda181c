//! Storage configuration
//!
//! Describes where a token cache lives on disk and which secret-store
//! identifiers each platform uses for it. Built once through
//! [`StorageCreationPropertiesBuilder`] and shared read-only by every
//! helper that points at the same physical cache.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Suffix appended to the cache file path to derive the lock file path
pub const LOCK_FILE_SUFFIX: &str = ".lockfile";

/// Errors raised while building or loading storage properties
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A required field was empty
    #[error("Invalid storage properties: {0}")]
    Invalid(String),

    /// Config file could not be read
    #[error("Failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Config file could not be parsed
    #[error("Failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Retry settings for acquiring the cross-process lock
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockOptions {
    /// Delay between acquisition attempts
    #[serde(with = "millis")]
    pub retry_delay: Duration,
    /// Maximum number of acquisition attempts
    pub retry_count: u32,
}

impl LockOptions {
    /// Default delay between attempts (100 ms)
    pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(100);
    /// Default number of attempts (600, about 60 seconds in total)
    pub const DEFAULT_RETRY_COUNT: u32 = 600;

    /// Creates lock options with an explicit delay and attempt count
    pub fn new(retry_delay: Duration, retry_count: u32) -> Self {
        Self {
            retry_delay,
            retry_count,
        }
    }

    /// Upper bound of time spent sleeping between attempts
    pub fn budget(&self) -> Duration {
        self.retry_delay * self.retry_count
    }
}

impl Default for LockOptions {
    fn default() -> Self {
        Self::new(Self::DEFAULT_RETRY_DELAY, Self::DEFAULT_RETRY_COUNT)
    }
}

/// When a helper re-reads persisted bytes before an access
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReloadPolicy {
    /// Read the store on every access
    #[default]
    Always,
    /// Read only when the cache file's last-write time moved
    LastWriteTime,
}

/// Keychain identifiers used on macOS
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeychainSettings {
    /// Keychain service name
    pub service: String,
    /// Keychain account name
    pub account: String,
}

/// Secret Service identifiers used on Linux
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyringSettings {
    /// Schema name stored as the `xdg:schema` attribute
    pub schema_name: String,
    /// Collection the secret lives in (usually "default")
    pub collection: String,
    /// Human-readable label shown by keyring managers
    pub secret_label: String,
    /// Two free-form attributes identifying the secret
    pub attributes: BTreeMap<String, String>,
}

/// Immutable description of one physical token cache
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageCreationProperties {
    /// Cache file name
    pub cache_file_name: String,
    /// Directory holding the cache file and its lock file
    pub cache_directory: PathBuf,
    /// macOS keychain identifiers
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keychain: Option<KeychainSettings>,
    /// Linux Secret Service identifiers
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keyring: Option<KeyringSettings>,
    /// Fall back to an unprotected file when Secret Service is unusable
    #[serde(default)]
    pub use_linux_unprotected_file_fallback: bool,
    /// Lock retry settings
    #[serde(default)]
    pub lock_options: LockOptions,
    /// Reload policy for the helper
    #[serde(default)]
    pub reload_policy: ReloadPolicy,
}

impl StorageCreationProperties {
    /// Full path of the cache file
    pub fn cache_file_path(&self) -> PathBuf {
        self.cache_directory.join(&self.cache_file_name)
    }

    /// Full path of the companion lock file
    pub fn lock_file_path(&self) -> PathBuf {
        let mut path = self.cache_file_path().into_os_string();
        path.push(LOCK_FILE_SUFFIX);
        PathBuf::from(path)
    }

    /// Loads properties from a JSON file
    pub fn from_json_file(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let props: Self = serde_json::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        props.validate()?;
        Ok(props)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.cache_file_name.trim().is_empty() {
            return Err(ConfigError::Invalid("cache file name is empty".into()));
        }
        if self.cache_directory.as_os_str().is_empty() {
            return Err(ConfigError::Invalid("cache directory is empty".into()));
        }
        if let Some(keyring) = &self.keyring {
            if keyring.schema_name.is_empty() {
                return Err(ConfigError::Invalid("keyring schema name is empty".into()));
            }
            if keyring.attributes.len() > 2 {
                return Err(ConfigError::Invalid(
                    "keyring accepts at most two attributes".into(),
                ));
            }
        }
        if self.lock_options.retry_count == 0 {
            return Err(ConfigError::Invalid("lock retry count must be positive".into()));
        }
        Ok(())
    }
}

/// Builder for [`StorageCreationProperties`]
#[derive(Debug, Clone)]
pub struct StorageCreationPropertiesBuilder {
    props: StorageCreationProperties,
}

impl StorageCreationPropertiesBuilder {
    /// Starts a builder for the cache file `file_name` in `directory`
    pub fn new(file_name: impl Into<String>, directory: impl Into<PathBuf>) -> Self {
        Self {
            props: StorageCreationProperties {
                cache_file_name: file_name.into(),
                cache_directory: directory.into(),
                keychain: None,
                keyring: None,
                use_linux_unprotected_file_fallback: false,
                lock_options: LockOptions::default(),
                reload_policy: ReloadPolicy::default(),
            },
        }
    }

    /// Sets the macOS keychain service and account
    pub fn with_mac_keychain(
        mut self,
        service: impl Into<String>,
        account: impl Into<String>,
    ) -> Self {
        self.props.keychain = Some(KeychainSettings {
            service: service.into(),
            account: account.into(),
        });
        self
    }

    /// Sets the Linux Secret Service schema, collection, label and attributes
    pub fn with_linux_keyring(
        mut self,
        schema_name: impl Into<String>,
        collection: impl Into<String>,
        secret_label: impl Into<String>,
        attribute1: (impl Into<String>, impl Into<String>),
        attribute2: (impl Into<String>, impl Into<String>),
    ) -> Self {
        let mut attributes = BTreeMap::new();
        attributes.insert(attribute1.0.into(), attribute1.1.into());
        attributes.insert(attribute2.0.into(), attribute2.1.into());
        self.props.keyring = Some(KeyringSettings {
            schema_name: schema_name.into(),
            collection: collection.into(),
            secret_label: secret_label.into(),
            attributes,
        });
        self
    }

    /// Stores the cache in a plain file when Secret Service is unavailable
    pub fn with_linux_unprotected_file_fallback(mut self) -> Self {
        self.props.use_linux_unprotected_file_fallback = true;
        self
    }

    /// Overrides the lock retry delay and attempt count
    pub fn with_lock_retry(mut self, retry_delay: Duration, retry_count: u32) -> Self {
        self.props.lock_options = LockOptions::new(retry_delay, retry_count);
        self
    }

    /// Overrides the reload policy
    pub fn with_reload_policy(mut self, policy: ReloadPolicy) -> Self {
        self.props.reload_policy = policy;
        self
    }

    /// Validates and returns the properties
    pub fn build(self) -> Result<StorageCreationProperties, ConfigError> {
        self.props.validate()?;
        Ok(self.props)
    }
}

/// Per-OS default directory for token caches
pub fn default_cache_directory() -> Option<PathBuf> {
    #[cfg(target_os = "windows")]
    {
        std::env::var("LOCALAPPDATA").ok().map(PathBuf::from)
    }

    #[cfg(target_os = "macos")]
    {
        std::env::var("HOME")
            .ok()
            .map(|p| PathBuf::from(p).join("Library/Caches"))
    }

    #[cfg(target_os = "linux")]
    {
        std::env::var("XDG_CACHE_HOME")
            .ok()
            .map(PathBuf::from)
            .or_else(|| std::env::var("HOME").ok().map(|p| PathBuf::from(p).join(".cache")))
    }

    #[cfg(not(any(target_os = "windows", target_os = "macos", target_os = "linux")))]
    {
        None
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}
