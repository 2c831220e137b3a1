//! XChaCha20-Poly1305 sealing.

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{Key, XChaCha20Poly1305, XNonce};
use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::error::{CryptoError, CryptoResult};
use crate::master_key::MasterKey;
use crate::NONCE_LEN;

/// Ciphertext together with the nonce it was sealed under.
///
/// This is exactly what the keystore persists per credential; the nonce is
/// public, the authentication tag is embedded in `ciphertext`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SealedBox {
    /// The 24-byte XChaCha20 nonce.
    pub nonce: [u8; NONCE_LEN],
    /// AEAD ciphertext including the Poly1305 tag.
    pub ciphertext: Vec<u8>,
}

/// Seal `plaintext` under `key` with a fresh random nonce.
///
/// # Errors
///
/// Returns [`CryptoError::Seal`] if the AEAD rejects the input.
pub fn seal(key: &MasterKey, plaintext: &[u8]) -> CryptoResult<SealedBox> {
    let cipher = XChaCha20Poly1305::new(Key::from_slice(key.as_bytes()));

    let mut nonce = [0u8; NONCE_LEN];
    rand::rngs::OsRng.fill_bytes(&mut nonce);

    let ciphertext = cipher
        .encrypt(XNonce::from_slice(&nonce), plaintext)
        .map_err(|_| CryptoError::Seal)?;

    Ok(SealedBox { nonce, ciphertext })
}

/// Open a sealed box.
///
/// # Errors
///
/// Returns [`CryptoError::Open`] on any authentication failure — wrong key,
/// truncation, or tampering — without distinguishing between them.
pub fn open(key: &MasterKey, sealed: &SealedBox) -> CryptoResult<Vec<u8>> {
    let cipher = XChaCha20Poly1305::new(Key::from_slice(key.as_bytes()));
    cipher
        .decrypt(XNonce::from_slice(&sealed.nonce), sealed.ciphertext.as_slice())
        .map_err(|_| CryptoError::Open)
}

/// Rebuild a [`SealedBox`] from separately stored columns.
///
/// # Errors
///
/// Returns [`CryptoError::Malformed`] when the nonce is not exactly 24 bytes.
pub fn sealed_from_parts(nonce: &[u8], ciphertext: Vec<u8>) -> CryptoResult<SealedBox> {
    let nonce: [u8; NONCE_LEN] = nonce.try_into().map_err(|_| CryptoError::Malformed)?;
    Ok(SealedBox { nonce, ciphertext })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::KEY_LEN;

    fn key(byte: u8) -> MasterKey {
        MasterKey::from_bytes([byte; KEY_LEN])
    }

    #[test]
    fn test_seal_open_roundtrip() {
        let k = key(1);
        let sealed = seal(&k, b"sk-TEST-token").unwrap();
        let opened = open(&k, &sealed).unwrap();
        assert_eq!(opened, b"sk-TEST-token");
    }

    #[test]
    fn test_fresh_nonce_per_seal() {
        let k = key(1);
        let a = seal(&k, b"same").unwrap();
        let b = seal(&k, b"same").unwrap();
        assert_ne!(a.nonce, b.nonce);
        assert_ne!(a.ciphertext, b.ciphertext);
    }

    #[test]
    fn test_wrong_key_fails_closed() {
        let sealed = seal(&key(1), b"secret").unwrap();
        let err = open(&key(2), &sealed).unwrap_err();
        assert!(matches!(err, CryptoError::Open));
    }

    #[test]
    fn test_tampering_detected() {
        let k = key(1);
        let mut sealed = seal(&k, b"secret").unwrap();
        if let Some(byte) = sealed.ciphertext.first_mut() {
            *byte ^= 0x01;
        }
        assert!(matches!(open(&k, &sealed), Err(CryptoError::Open)));
    }

    #[test]
    fn test_error_message_has_no_detail() {
        // The open error must not reveal anything about the failure position.
        assert_eq!(CryptoError::Open.to_string(), "decryption failed");
    }

    #[test]
    fn test_sealed_from_parts_rejects_bad_nonce() {
        let err = sealed_from_parts(&[0u8; 12], vec![1, 2, 3]).unwrap_err();
        assert!(matches!(err, CryptoError::Malformed));
    }

    #[test]
    fn test_empty_plaintext_roundtrip() {
        let k = key(9);
        let sealed = seal(&k, b"").unwrap();
        assert_eq!(open(&k, &sealed).unwrap(), b"");
    }
}
