//! The per-container secret bundle.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::Path;

use palisade_core::Provider;
use palisade_keystore::DecryptedCredential;
use serde::Serialize;
use zeroize::Zeroize;

use crate::error::{RuntimeError, RuntimeResult};

/// The JSON document materialized for one container.
///
/// The shape is identical regardless of provider, so the in-container
/// entrypoint needs exactly one parser.
#[derive(Serialize)]
pub struct SecretBundle {
    /// Provider tag.
    pub provider: Provider,
    /// The plaintext token.
    pub token: String,
    /// Additional key/value material.
    pub additional: BTreeMap<String, String>,
}

impl Drop for SecretBundle {
    fn drop(&mut self) {
        self.token.zeroize();
        for value in self.additional.values_mut() {
            value.zeroize();
        }
    }
}

impl std::fmt::Debug for SecretBundle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretBundle")
            .field("provider", &self.provider)
            .finish_non_exhaustive()
    }
}

impl SecretBundle {
    /// Build a bundle from a decrypted credential, validating its shape.
    ///
    /// The same shape check the in-container entrypoint applies is
    /// mirrored here so an invalid bundle is never even written.
    ///
    /// # Errors
    ///
    /// [`RuntimeError::Injection`] when the token is empty or absurdly
    /// large.
    pub fn from_credential(credential: &DecryptedCredential) -> RuntimeResult<Self> {
        let token = credential.token.trim();
        if token.is_empty() {
            return Err(RuntimeError::Injection(format!(
                "credential {} has an empty token",
                credential.record.id
            )));
        }
        if token.len() > 64 * 1024 {
            return Err(RuntimeError::Injection(format!(
                "credential {} token exceeds 64KiB",
                credential.record.id
            )));
        }
        Ok(Self {
            provider: credential.record.provider,
            token: token.to_owned(),
            additional: credential.additional.clone(),
        })
    }

    /// Write the bundle atomically: temp file in the same directory,
    /// mode 0400, fsync, rename.
    ///
    /// # Errors
    ///
    /// Filesystem failures.
    pub fn write_atomic(&self, path: &Path) -> RuntimeResult<()> {
        let parent = path
            .parent()
            .ok_or_else(|| RuntimeError::Injection(format!("{} has no parent", path.display())))?;

        let mut json = serde_json::to_vec(self)
            .map_err(|e| RuntimeError::Injection(format!("bundle serialization: {e}")))?;

        let tmp_path = path.with_extension("json.tmp");
        // A stale temp file from an earlier crash must not block the write.
        let _ = std::fs::remove_file(&tmp_path);
        let result = (|| -> std::io::Result<()> {
            let mut options = std::fs::OpenOptions::new();
            options.write(true).create_new(true);
            #[cfg(unix)]
            {
                use std::os::unix::fs::OpenOptionsExt;
                options.mode(0o400);
            }
            let mut file = options.open(&tmp_path)?;
            file.write_all(&json)?;
            file.sync_all()?;
            drop(file);
            std::fs::rename(&tmp_path, path)?;
            // Make the rename durable on the directory.
            if let Ok(dir) = std::fs::File::open(parent) {
                let _ = dir.sync_all();
            }
            Ok(())
        })();

        json.zeroize();

        if result.is_err() {
            let _ = std::fs::remove_file(&tmp_path);
        }
        result.map_err(RuntimeError::Io)
    }
}

/// Remove a bundle file, tolerating it already being gone.
///
/// # Errors
///
/// Filesystem failures other than not-found.
pub(crate) fn unlink_bundle(path: &Path) -> RuntimeResult<bool> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(RuntimeError::Io(e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use palisade_core::CredentialId;
    use palisade_keystore::CredentialRecord;
    use zeroize::Zeroizing;

    fn decrypted(token: &str) -> DecryptedCredential {
        DecryptedCredential {
            record: CredentialRecord {
                id: CredentialId::from("k1"),
                provider: Provider::OpenAi,
                display_name: None,
                tags: vec![],
                expires_at: None,
                created_at: chrono::Utc::now(),
            },
            token: Zeroizing::new(token.to_owned()),
            additional: BTreeMap::new(),
        }
    }

    #[test]
    fn test_bundle_shape() {
        let bundle = SecretBundle::from_credential(&decrypted("sk-TEST")).unwrap();
        let json: serde_json::Value =
            serde_json::from_slice(&serde_json::to_vec(&bundle).unwrap()).unwrap();
        assert_eq!(json["provider"], "openai");
        assert_eq!(json["token"], "sk-TEST");
        assert!(json["additional"].is_object());
    }

    #[test]
    fn test_empty_token_rejected() {
        let err = SecretBundle::from_credential(&decrypted("   ")).unwrap_err();
        assert!(matches!(err, RuntimeError::Injection(_)));
        assert_eq!(err.code(), "SYS-010");
    }

    #[test]
    fn test_write_atomic_mode_and_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("c1.json");
        let bundle = SecretBundle::from_credential(&decrypted("sk-TEST")).unwrap();
        bundle.write_atomic(&path).unwrap();

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o400);
        }

        let json: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(json["token"], "sk-TEST");

        // No temp file left behind.
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[test]
    fn test_unlink_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("c1.json");
        std::fs::write(&path, "{}").unwrap();

        assert!(unlink_bundle(&path).unwrap());
        assert!(!unlink_bundle(&path).unwrap());
    }
}
