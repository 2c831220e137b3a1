//! The persistent master-key salt file.

use rand::RngCore;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::{CryptoError, CryptoResult};
use crate::KEY_LEN;

/// Handle to the on-disk salt used for master-key derivation.
///
/// The file holds exactly 32 random bytes, mode 0600, owned by the daemon
/// user. It is created exactly once; all later starts must find it in place.
#[derive(Debug, Clone)]
pub struct SaltFile {
    path: PathBuf,
}

impl SaltFile {
    /// Point at a salt file path without touching the filesystem.
    #[must_use]
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// The underlying path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether the salt file exists.
    #[must_use]
    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Load the salt, creating it with fresh random bytes if absent.
    ///
    /// Used on first start only; subsequent starts that already have
    /// ciphertexts on disk must use [`SaltFile::load`] so a missing salt is
    /// fatal rather than silently regenerated.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::SaltIo`] on filesystem failures and
    /// [`CryptoError::SaltCorrupt`] if an existing file has the wrong size.
    pub fn load_or_create(&self) -> CryptoResult<[u8; KEY_LEN]> {
        if self.exists() {
            return self.load();
        }

        let mut salt = [0u8; KEY_LEN];
        rand::rngs::OsRng.fill_bytes(&mut salt);

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| CryptoError::SaltIo {
                path: self.path.display().to_string(),
                source,
            })?;
        }

        let mut options = std::fs::OpenOptions::new();
        options.write(true).create_new(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        let mut file = options.open(&self.path).map_err(|source| CryptoError::SaltIo {
            path: self.path.display().to_string(),
            source,
        })?;
        file.write_all(&salt).map_err(|source| CryptoError::SaltIo {
            path: self.path.display().to_string(),
            source,
        })?;
        file.sync_all().map_err(|source| CryptoError::SaltIo {
            path: self.path.display().to_string(),
            source,
        })?;

        tracing::info!(path = %self.path.display(), "Generated master-key salt");
        Ok(salt)
    }

    /// Load the salt, failing if it is absent.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::SaltMissing`] when the file does not exist,
    /// [`CryptoError::SaltCorrupt`] when it has the wrong size, and
    /// [`CryptoError::SaltIo`] on other filesystem failures.
    pub fn load(&self) -> CryptoResult<[u8; KEY_LEN]> {
        let bytes = match std::fs::read(&self.path) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(CryptoError::SaltMissing {
                    path: self.path.display().to_string(),
                });
            },
            Err(source) => {
                return Err(CryptoError::SaltIo {
                    path: self.path.display().to_string(),
                    source,
                });
            },
        };

        let len = bytes.len();
        let salt: [u8; KEY_LEN] = bytes.try_into().map_err(|_| CryptoError::SaltCorrupt {
            path: self.path.display().to_string(),
            len,
        })?;

        #[cfg(unix)]
        self.check_permissions()?;

        Ok(salt)
    }

    /// Reject group- or world-accessible salt files.
    #[cfg(unix)]
    fn check_permissions(&self) -> CryptoResult<()> {
        use std::os::unix::fs::PermissionsExt;
        let metadata = std::fs::metadata(&self.path).map_err(|source| CryptoError::SaltIo {
            path: self.path.display().to_string(),
            source,
        })?;
        let mode = metadata.permissions().mode();
        if mode & 0o077 != 0 {
            tracing::warn!(
                path = %self.path.display(),
                mode = format!("{:o}", mode & 0o777),
                "Salt file has loose permissions; tightening to 0600"
            );
            let mut perms = metadata.permissions();
            perms.set_mode(0o600);
            std::fs::set_permissions(&self.path, perms).map_err(|source| CryptoError::SaltIo {
                path: self.path.display().to_string(),
                source,
            })?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_then_load_is_stable() {
        let dir = tempfile::tempdir().unwrap();
        let salt_file = SaltFile::at(dir.path().join("salt"));

        let first = salt_file.load_or_create().unwrap();
        let second = salt_file.load().unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_load_missing_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let salt_file = SaltFile::at(dir.path().join("salt"));
        let err = salt_file.load().unwrap_err();
        assert!(matches!(err, CryptoError::SaltMissing { .. }));
    }

    #[test]
    fn test_corrupt_salt_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("salt");
        std::fs::write(&path, b"short").unwrap();
        let err = SaltFile::at(&path).load().unwrap_err();
        assert!(matches!(err, CryptoError::SaltCorrupt { len: 5, .. }));
    }

    #[cfg(unix)]
    #[test]
    fn test_created_with_0600() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("salt");
        SaltFile::at(&path).load_or_create().unwrap();
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
