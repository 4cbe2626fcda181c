//! Windows DPAPI (Data Protection API) accessor
//!
//! Protects the blob with DPAPI under the current user's scope before it
//! touches disk. Only the same Windows user can unprotect it.

use std::path::PathBuf;

use thiserror::Error;
use tracing::debug;

use super::file::FileAccessor;
use super::{AccessorResult, CacheAccessor};

/// DPAPI failure
#[derive(Debug, Error)]
pub enum DpapiError {
    /// `CryptProtectData` rejected the blob
    #[error("DPAPI could not protect the cache: {0}")]
    Protect(String),

    /// `CryptUnprotectData` rejected the blob, e.g. it belongs to another user
    #[error("DPAPI could not unprotect the cache: {0}")]
    Unprotect(String),

    /// Not running on Windows
    #[error("DPAPI is only available on Windows")]
    Unavailable,
}

/// Current-user DPAPI with no extra entropy and no UI
#[derive(Debug, Clone, Copy, Default)]
pub struct DpapiStore;

#[cfg(windows)]
impl DpapiStore {
    /// Encrypts `data` for the current user
    pub fn protect(&self, data: &[u8]) -> Result<Vec<u8>, DpapiError> {
        use windows::core::PCWSTR;
        use windows::Win32::Security::Cryptography::{
            CryptProtectData, CRYPTPROTECT_UI_FORBIDDEN, CRYPT_INTEGER_BLOB,
        };

        if data.is_empty() {
            return Ok(Vec::new());
        }
        let input = ffi::blob(data);
        let mut output = CRYPT_INTEGER_BLOB::default();
        // SAFETY: `input` borrows `data` for the duration of the call and
        // `output` is released by `take`.
        unsafe {
            CryptProtectData(
                &input,
                PCWSTR::null(),
                None,
                None,
                None,
                CRYPTPROTECT_UI_FORBIDDEN,
                &mut output,
            )
            .map_err(|e| DpapiError::Protect(e.message().to_string()))?;
            Ok(ffi::take(output))
        }
    }

    /// Decrypts data produced by [`DpapiStore::protect`]
    pub fn unprotect(&self, protected: &[u8]) -> Result<Vec<u8>, DpapiError> {
        use windows::Win32::Security::Cryptography::{
            CryptUnprotectData, CRYPTPROTECT_UI_FORBIDDEN, CRYPT_INTEGER_BLOB,
        };

        if protected.is_empty() {
            return Ok(Vec::new());
        }
        let input = ffi::blob(protected);
        let mut output = CRYPT_INTEGER_BLOB::default();
        // SAFETY: as in `protect`
        unsafe {
            CryptUnprotectData(
                &input,
                None,
                None,
                None,
                None,
                CRYPTPROTECT_UI_FORBIDDEN,
                &mut output,
            )
            .map_err(|e| DpapiError::Unprotect(e.message().to_string()))?;
            Ok(ffi::take(output))
        }
    }
}

#[cfg(windows)]
mod ffi {
    use windows::Win32::Security::Cryptography::CRYPT_INTEGER_BLOB;

    #[link(name = "kernel32")]
    extern "system" {
        fn LocalFree(mem: *mut std::ffi::c_void) -> *mut std::ffi::c_void;
    }

    pub(super) fn blob(data: &[u8]) -> CRYPT_INTEGER_BLOB {
        CRYPT_INTEGER_BLOB {
            cbData: data.len() as u32,
            pbData: data.as_ptr() as *mut u8,
        }
    }

    /// Copies a DPAPI output buffer and frees it
    ///
    /// # Safety
    /// `blob` must come from a successful DPAPI call.
    pub(super) unsafe fn take(blob: CRYPT_INTEGER_BLOB) -> Vec<u8> {
        if blob.pbData.is_null() {
            return Vec::new();
        }
        let data = std::slice::from_raw_parts(blob.pbData, blob.cbData as usize).to_vec();
        LocalFree(blob.pbData as *mut std::ffi::c_void);
        data
    }
}

#[cfg(not(windows))]
impl DpapiStore {
    /// Always fails off Windows
    pub fn protect(&self, _data: &[u8]) -> Result<Vec<u8>, DpapiError> {
        Err(DpapiError::Unavailable)
    }

    /// Always fails off Windows
    pub fn unprotect(&self, _protected: &[u8]) -> Result<Vec<u8>, DpapiError> {
        Err(DpapiError::Unavailable)
    }
}

/// Accessor storing a DPAPI-protected blob in a file
#[derive(Debug, Clone)]
pub struct DpapiAccessor {
    file: FileAccessor,
    dpapi: DpapiStore,
}

impl DpapiAccessor {
    /// Creates an accessor for the protected file at `path`
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            file: FileAccessor::new(path),
            dpapi: DpapiStore,
        }
    }
}

impl CacheAccessor for DpapiAccessor {
    fn read(&self) -> AccessorResult<Option<Vec<u8>>> {
        match self.file.read()? {
            Some(protected) => {
                let plain = self.dpapi.unprotect(&protected)?;
                debug!("Unprotected {} bytes", plain.len());
                Ok(Some(plain))
            }
            None => Ok(None),
        }
    }

    fn write(&self, data: &[u8]) -> AccessorResult<()> {
        let protected = self.dpapi.protect(data)?;
        self.file.write(&protected)
    }

    fn clear(&self) -> AccessorResult<()> {
        self.file.clear()
    }

    fn create_for_persistence_validation(&self) -> AccessorResult<Box<dyn CacheAccessor>> {
        let mut path = self.file.path().as_os_str().to_owned();
        path.push(super::file::VALIDATION_SUFFIX);
        Ok(Box::new(DpapiAccessor::new(PathBuf::from(path))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dpapi_empty_data() {
        let store = DpapiStore;
        // On non-Windows, these will return errors, which is expected
        let result = store.protect(&[]);
        #[cfg(windows)]
        assert!(result.is_ok());
        #[cfg(not(windows))]
        assert!(result.is_err());
    }

    #[cfg(not(windows))]
    #[test]
    fn test_accessor_write_fails_off_windows() {
        let dir = tempfile::TempDir::new().unwrap();
        let accessor = DpapiAccessor::new(dir.path().join("msal.cache"));

        let result = accessor.write(b"tokens");
        assert!(matches!(
            result,
            Err(super::super::AccessorError::Dpapi(DpapiError::Unavailable))
        ));
        assert!(!dir.path().join("msal.cache").exists());
    }

    #[cfg(windows)]
    #[test]
    fn test_dpapi_roundtrip() {
        let store = DpapiStore;
        let original = b"secret data to encrypt";

        let protected = store.protect(original).expect("protect should work");
        assert_ne!(protected, original);

        let plain = store.unprotect(&protected).expect("unprotect should work");
        assert_eq!(plain, original);
    }

    #[cfg(windows)]
    #[test]
    fn test_accessor_file_is_not_plaintext() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("msal.cache");
        let accessor = DpapiAccessor::new(&path);

        accessor.write(b"refresh-token").unwrap();
        let on_disk = std::fs::read(&path).unwrap();
        assert_ne!(on_disk, b"refresh-token");
        assert_eq!(accessor.read().unwrap(), Some(b"refresh-token".to_vec()));
    }
}
