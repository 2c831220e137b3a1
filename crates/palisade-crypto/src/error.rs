//! Crypto error types.

use thiserror::Error;

/// Errors from key derivation and sealing operations.
#[derive(Debug, Error)]
pub enum CryptoError {
    /// Reading or writing the salt file failed.
    #[error("salt file {path}: {source}")]
    SaltIo {
        /// The salt file path.
        path: String,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The salt file is required but missing.
    ///
    /// Generating a fresh salt here would orphan every existing ciphertext,
    /// so this is surfaced instead of silently recreating the file.
    #[error("salt file missing at {path}; restore it from backup or delete the keystore to start over")]
    SaltMissing {
        /// The expected salt file path.
        path: String,
    },

    /// The salt file exists but does not hold exactly 32 bytes.
    #[error("salt file {path} is corrupt ({len} bytes, expected 32)")]
    SaltCorrupt {
        /// The salt file path.
        path: String,
        /// Actual length found.
        len: usize,
    },

    /// No host-stable identifier could be determined.
    #[error("no host identifier available: {0}")]
    NoHostId(String),

    /// Key derivation failed.
    #[error("key derivation failed: {0}")]
    Derivation(String),

    /// Sealing plaintext failed.
    #[error("encryption failed")]
    Seal,

    /// Opening a sealed box failed (wrong key, corrupt data, or tampering).
    ///
    /// Deliberately carries no detail about which byte failed.
    #[error("decryption failed")]
    Open,

    /// A sealed box had a malformed shape (bad nonce length).
    #[error("sealed data is malformed")]
    Malformed,
}

/// Result type for crypto operations.
pub type CryptoResult<T> = Result<T, CryptoError>;
