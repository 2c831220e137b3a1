//! Master-key derivation.

use argon2::{Algorithm, Argon2, Params, Version};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{CryptoError, CryptoResult};
use crate::KEY_LEN;

/// Argon2id memory cost in KiB.
const ARGON2_MEMORY_KIB: u32 = 19_456;
/// Argon2id iteration count.
const ARGON2_ITERATIONS: u32 = 2;
/// Argon2id parallelism.
const ARGON2_LANES: u32 = 1;

/// The daemon master key.
///
/// Derived once at startup and held only in process memory; the backing
/// bytes are zeroized when the key is dropped. There is deliberately no
/// `Serialize`, `Display`, or byte-exposing `Debug` for this type.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct MasterKey([u8; KEY_LEN]);

impl MasterKey {
    /// Derive the master key from the salt file contents and a host-stable
    /// identifier using Argon2id.
    ///
    /// The same `(salt, host_id)` pair always yields the same key, which is
    /// what makes unattended restarts possible.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::Derivation`] if the KDF rejects its parameters
    /// or inputs.
    pub fn derive(salt: &[u8; KEY_LEN], host_id: &str) -> CryptoResult<Self> {
        let params = Params::new(ARGON2_MEMORY_KIB, ARGON2_ITERATIONS, ARGON2_LANES, Some(KEY_LEN))
            .map_err(|e| CryptoError::Derivation(e.to_string()))?;
        let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);

        let mut key = [0u8; KEY_LEN];
        argon2
            .hash_password_into(host_id.as_bytes(), salt, &mut key)
            .map_err(|e| CryptoError::Derivation(e.to_string()))?;

        Ok(Self(key))
    }

    /// Construct a key directly from raw bytes (tests and key-check fixtures).
    #[must_use]
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    /// Borrow the raw key material.
    ///
    /// Callers must not copy these bytes anywhere that outlives the key.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }
}

impl std::fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("MasterKey(..)")
    }
}

/// Read a host-stable identifier.
///
/// Prefers `/etc/machine-id`, falls back to the D-Bus machine id, then the
/// kernel hostname. The value only needs to be stable across reboots of the
/// same host, not secret — secrecy comes from the salt file.
///
/// # Errors
///
/// Returns [`CryptoError::NoHostId`] when every source is unavailable.
pub fn host_identifier() -> CryptoResult<String> {
    const SOURCES: [&str; 3] = [
        "/etc/machine-id",
        "/var/lib/dbus/machine-id",
        "/proc/sys/kernel/hostname",
    ];

    for source in SOURCES {
        if let Ok(contents) = std::fs::read_to_string(source) {
            let trimmed = contents.trim();
            if !trimmed.is_empty() {
                return Ok(trimmed.to_owned());
            }
        }
    }

    Err(CryptoError::NoHostId(
        "none of /etc/machine-id, /var/lib/dbus/machine-id, or the hostname are readable".to_owned(),
    ))
}
