//! Keystore error types.

use palisade_core::CredentialId;
use thiserror::Error;

/// Errors from keystore operations.
#[derive(Debug, Error)]
pub enum KeystoreError {
    /// The database could not be opened or its schema created.
    #[error("keystore open failed: {0}")]
    OpenFailed(String),

    /// The key-check sentinel did not decrypt: the keystore was sealed under
    /// a different master key. Fatal to the daemon.
    #[error("keystore was sealed under a different master key")]
    BadMasterKey,

    /// A credential row failed to decrypt.
    ///
    /// Deliberately carries only the id, never which part of the row failed.
    #[error("credential {id} could not be decrypted")]
    DecryptFailed {
        /// The credential id.
        id: CredentialId,
    },

    /// Storing with an id that already exists, without the replace flag.
    #[error("credential {id} already exists")]
    Duplicate {
        /// The duplicate id.
        id: CredentialId,
    },

    /// No credential with the given id.
    #[error("credential {id} not found")]
    NotFound {
        /// The missing id.
        id: CredentialId,
    },

    /// Underlying database failure.
    #[error("keystore database error: {0}")]
    Db(#[from] rusqlite::Error),

    /// Sealing new material failed.
    #[error(transparent)]
    Crypto(#[from] palisade_crypto::CryptoError),

    /// Row contents did not deserialize.
    #[error("keystore row is corrupt: {0}")]
    Corrupt(String),
}

impl KeystoreError {
    /// The `CAT-NNN` code this error maps to on the RPC surface.
    #[must_use]
    pub fn code(&self) -> &'static str {
        use palisade_core::codes;
        match self {
            Self::Duplicate { .. } => codes::SYS_DUPLICATE_KEY,
            Self::NotFound { .. } => codes::RPC_INVALID,
            _ => codes::SYS_KEYSTORE,
        }
    }
}

/// Result type for keystore operations.
pub type KeystoreResult<T> = Result<T, KeystoreError>;
