//! Keychain / Secret Service accessor
//!
//! Keeps the blob in the OS secret store through the keyring crate:
//! the macOS Keychain (service + account) or the Linux Secret Service
//! (schema, collection, label and two attributes).
//!
//! The secret store has no change notifications, so every write also
//! touches a one-byte sentinel at the cache file path. File watchers and
//! last-write-time checks observe that file instead of the secret.

use std::path::PathBuf;

use keyring::Entry;
use tracing::debug;

use super::file::FileAccessor;
use super::{AccessorResult, CacheAccessor};
use crate::config::{KeychainSettings, KeyringSettings};

/// Content of the sentinel file
const SENTINEL: &[u8] = b"1";

/// Suffix appended to identifiers of the isolated validation entry
const VALIDATION_SUFFIX: &str = "-persistence-check";

#[derive(Debug, Clone)]
enum Target {
    Keychain(KeychainSettings),
    SecretService(KeyringSettings),
    #[cfg(test)]
    Mock { service: String, user: String },
}

impl Target {
    fn entry(&self) -> AccessorResult<Entry> {
        match self {
            Target::Keychain(settings) => Ok(Entry::new(&settings.service, &settings.account)?),
            Target::SecretService(settings) => secret_service_entry(settings),
            #[cfg(test)]
            Target::Mock { service, user } => {
                let credential = keyring::mock::default_credential_builder().build(
                    None,
                    service,
                    user,
                )?;
                Ok(Entry::new_with_credential(credential))
            }
        }
    }

    fn for_validation(&self) -> Self {
        match self {
            Target::Keychain(settings) => Target::Keychain(KeychainSettings {
                service: settings.service.clone(),
                account: format!("{}{}", settings.account, VALIDATION_SUFFIX),
            }),
            Target::SecretService(settings) => {
                let mut settings = settings.clone();
                settings.secret_label.push_str(VALIDATION_SUFFIX);
                for value in settings.attributes.values_mut() {
                    value.push_str(VALIDATION_SUFFIX);
                }
                Target::SecretService(settings)
            }
            #[cfg(test)]
            Target::Mock { service, user } => Target::Mock {
                service: service.clone(),
                user: format!("{user}{VALIDATION_SUFFIX}"),
            },
        }
    }
}

#[cfg(target_os = "linux")]
fn secret_service_entry(settings: &KeyringSettings) -> AccessorResult<Entry> {
    use keyring::secret_service::SsCredential;

    let mut credential = SsCredential::new_with_target(
        Some(&settings.collection),
        &settings.schema_name,
        &settings.secret_label,
    )?;
    credential.attributes = settings
        .attributes
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    credential
        .attributes
        .insert("xdg:schema".to_string(), settings.schema_name.clone());
    credential.label = settings.secret_label.clone();

    Ok(Entry::new_with_credential(Box::new(credential)))
}

#[cfg(not(target_os = "linux"))]
fn secret_service_entry(_settings: &KeyringSettings) -> AccessorResult<Entry> {
    Err(super::AccessorError::PlatformUnsupported(
        "Secret Service is only available on Linux".into(),
    ))
}

/// Accessor keeping the blob in the Keychain or Secret Service
pub struct KeyringAccessor {
    target: Target,
    entry: Entry,
    sentinel: Option<FileAccessor>,
}

impl KeyringAccessor {
    /// Accessor for a macOS Keychain item
    pub fn keychain(
        settings: &KeychainSettings,
        sentinel_path: impl Into<PathBuf>,
    ) -> AccessorResult<Self> {
        Self::with_target(
            Target::Keychain(settings.clone()),
            Some(FileAccessor::new(sentinel_path)),
        )
    }

    /// Accessor for a Linux Secret Service item
    pub fn secret_service(
        settings: &KeyringSettings,
        sentinel_path: impl Into<PathBuf>,
    ) -> AccessorResult<Self> {
        Self::with_target(
            Target::SecretService(settings.clone()),
            Some(FileAccessor::new(sentinel_path)),
        )
    }

    fn with_target(target: Target, sentinel: Option<FileAccessor>) -> AccessorResult<Self> {
        let entry = target.entry()?;
        Ok(Self {
            target,
            entry,
            sentinel,
        })
    }

    fn touch_sentinel(&self) -> AccessorResult<()> {
        match &self.sentinel {
            Some(file) => file.write(SENTINEL),
            None => Ok(()),
        }
    }
}

impl CacheAccessor for KeyringAccessor {
    fn read(&self) -> AccessorResult<Option<Vec<u8>>> {
        match self.entry.get_secret() {
            Ok(secret) => Ok(Some(secret)),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn write(&self, data: &[u8]) -> AccessorResult<()> {
        self.entry.set_secret(data)?;
        debug!("Stored {} bytes in the secret store", data.len());
        self.touch_sentinel()
    }

    fn clear(&self) -> AccessorResult<()> {
        match self.entry.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => {}
            Err(e) => return Err(e.into()),
        }
        match &self.sentinel {
            Some(file) => file.clear(),
            None => Ok(()),
        }
    }

    fn create_for_persistence_validation(&self) -> AccessorResult<Box<dyn CacheAccessor>> {
        // No sentinel: the self-test must not wake up watchers of the real cache
        Ok(Box::new(Self::with_target(self.target.for_validation(), None)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn mock_accessor(sentinel: Option<PathBuf>) -> KeyringAccessor {
        KeyringAccessor::with_target(
            Target::Mock {
                service: "token-cache-test".into(),
                user: "msal".into(),
            },
            sentinel.map(FileAccessor::new),
        )
        .unwrap()
    }

    #[test]
    fn test_read_empty_entry() {
        let accessor = mock_accessor(None);
        assert_eq!(accessor.read().unwrap(), None);
    }

    #[test]
    fn test_store_and_retrieve() {
        let accessor = mock_accessor(None);

        accessor.write(b"super-secret-value").unwrap();
        assert_eq!(accessor.read().unwrap(), Some(b"super-secret-value".to_vec()));
    }

    #[test]
    fn test_overwrite() {
        let accessor = mock_accessor(None);

        accessor.write(b"first").unwrap();
        accessor.write(b"second").unwrap();
        assert_eq!(accessor.read().unwrap(), Some(b"second".to_vec()));
    }

    #[test]
    fn test_write_touches_sentinel() {
        let dir = TempDir::new().unwrap();
        let sentinel = dir.path().join("msal.cache");
        let accessor = mock_accessor(Some(sentinel.clone()));

        accessor.write(b"tokens").unwrap();
        assert_eq!(std::fs::read(&sentinel).unwrap(), SENTINEL);
    }

    #[test]
    fn test_clear_removes_secret_and_sentinel() {
        let dir = TempDir::new().unwrap();
        let sentinel = dir.path().join("msal.cache");
        let accessor = mock_accessor(Some(sentinel.clone()));

        accessor.write(b"tokens").unwrap();
        accessor.clear().unwrap();

        assert_eq!(accessor.read().unwrap(), None);
        assert!(!sentinel.exists());
    }

    #[test]
    fn test_clear_nonexistent() {
        let accessor = mock_accessor(None);
        assert!(accessor.clear().is_ok());
    }

    #[test]
    fn test_validation_target_is_isolated() {
        let target = Target::Keychain(KeychainSettings {
            service: "svc".into(),
            account: "MSALCache".into(),
        });
        match target.for_validation() {
            Target::Keychain(settings) => {
                assert_eq!(settings.service, "svc");
                assert_eq!(settings.account, "MSALCache-persistence-check");
            }
            other => panic!("unexpected target {other:?}"),
        }
    }

    #[test]
    fn test_validation_secret_service_attributes() {
        let mut attributes = std::collections::BTreeMap::new();
        attributes.insert("Version".to_string(), "1".to_string());
        let target = Target::SecretService(KeyringSettings {
            schema_name: "msal.cache".into(),
            collection: "default".into(),
            secret_label: "MSALCache".into(),
            attributes,
        });

        match target.for_validation() {
            Target::SecretService(settings) => {
                assert_eq!(settings.schema_name, "msal.cache");
                assert_eq!(settings.secret_label, "MSALCache-persistence-check");
                assert_eq!(
                    settings.attributes.get("Version"),
                    Some(&"1-persistence-check".to_string())
                );
            }
            other => panic!("unexpected target {other:?}"),
        }
    }
}
