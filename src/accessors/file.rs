//! Plain file accessor
//!
//! Stores the blob as-is in a single file. Used directly for tests and the
//! Linux fallback, and as the backing file for the DPAPI accessor and the
//! keyring sentinel.

use std::ffi::OsString;
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use tracing::debug;

use super::{AccessorError, AccessorResult, CacheAccessor};

/// Suffix for files used only by the persistence self-test
pub(crate) const VALIDATION_SUFFIX: &str = ".persistence-check";

/// Accessor that keeps the blob in an unprotected file
#[derive(Debug, Clone)]
pub struct FileAccessor {
    path: PathBuf,
}

impl FileAccessor {
    /// Creates an accessor for the file at `path`
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Returns the file this accessor manages
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = OsString::from(self.path.as_os_str());
        name.push(format!(".{}.tmp", std::process::id()));
        PathBuf::from(name)
    }
}

impl CacheAccessor for FileAccessor {
    fn read(&self) -> AccessorResult<Option<Vec<u8>>> {
        match fs::read(&self.path) {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(AccessorError::io(
                format!("reading cache file {}", self.path.display()),
                e,
            )),
        }
    }

    fn write(&self, data: &[u8]) -> AccessorResult<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| AccessorError::io("creating cache directory", e))?;
        }

        // Write beside the target and rename over it so readers never see a
        // partially written blob.
        let temp = self.temp_path();
        let mut file = fs::File::create(&temp)
            .map_err(|e| AccessorError::io(format!("creating {}", temp.display()), e))?;
        file.write_all(data)
            .and_then(|_| file.sync_all())
            .map_err(|e| AccessorError::io(format!("writing {}", temp.display()), e))?;
        drop(file);

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = fs::Permissions::from_mode(0o600);
            fs::set_permissions(&temp, perms)
                .map_err(|e| AccessorError::io("setting cache file permissions", e))?;
        }

        if let Err(e) = fs::rename(&temp, &self.path) {
            let _ = fs::remove_file(&temp);
            return Err(AccessorError::io(
                format!("replacing cache file {}", self.path.display()),
                e,
            ));
        }

        debug!("Wrote {} bytes to {}", data.len(), self.path.display());
        Ok(())
    }

    fn clear(&self) -> AccessorResult<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(AccessorError::io(
                format!("removing cache file {}", self.path.display()),
                e,
            )),
        }
    }

    fn create_for_persistence_validation(&self) -> AccessorResult<Box<dyn CacheAccessor>> {
        let mut name = OsString::from(self.path.as_os_str());
        name.push(VALIDATION_SUFFIX);
        Ok(Box::new(FileAccessor::new(PathBuf::from(name))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_read_missing_returns_none() {
        let dir = TempDir::new().unwrap();
        let accessor = FileAccessor::new(dir.path().join("missing.cache"));
        assert_eq!(accessor.read().unwrap(), None);
    }

    #[test]
    fn test_write_creates_directory() {
        let dir = TempDir::new().unwrap();
        let accessor = FileAccessor::new(dir.path().join("nested/dir/msal.cache"));

        accessor.write(b"Hello World").unwrap();
        assert_eq!(accessor.read().unwrap(), Some(b"Hello World".to_vec()));
    }

    #[test]
    fn test_write_overwrites_and_leaves_no_temp() {
        let dir = TempDir::new().unwrap();
        let accessor = FileAccessor::new(dir.path().join("msal.cache"));

        accessor.write(b"first").unwrap();
        accessor.write(b"second").unwrap();

        assert_eq!(accessor.read().unwrap(), Some(b"second".to_vec()));
        let entries = fs::read_dir(dir.path()).unwrap().count();
        assert_eq!(entries, 1);
    }

    #[test]
    fn test_write_empty() {
        let dir = TempDir::new().unwrap();
        let accessor = FileAccessor::new(dir.path().join("msal.cache"));

        accessor.write(&[]).unwrap();
        assert_eq!(accessor.read().unwrap(), Some(Vec::new()));
    }

    #[test]
    fn test_clear_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let accessor = FileAccessor::new(dir.path().join("msal.cache"));

        accessor.write(b"data").unwrap();
        accessor.clear().unwrap();
        accessor.clear().unwrap();
        assert_eq!(accessor.read().unwrap(), None);
    }

    #[cfg(unix)]
    #[test]
    fn test_file_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        let accessor = FileAccessor::new(dir.path().join("msal.cache"));
        accessor.write(b"secret").unwrap();

        let mode = fs::metadata(accessor.path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn test_validation_accessor_is_isolated() {
        let dir = TempDir::new().unwrap();
        let accessor = FileAccessor::new(dir.path().join("msal.cache"));
        accessor.write(b"real tokens").unwrap();

        let validation = accessor.create_for_persistence_validation().unwrap();
        validation.write(b"marker").unwrap();
        validation.clear().unwrap();

        assert_eq!(accessor.read().unwrap(), Some(b"real tokens".to_vec()));
        assert!(!dir.path().join("msal.cache.persistence-check").exists());
    }
}
