//! Palisade Crypto - key derivation and authenticated encryption.
//!
//! This crate provides:
//! - The daemon master key, derived from a persistent on-disk salt combined
//!   with a host-stable identifier through Argon2id
//! - XChaCha20-Poly1305 sealing for credential material at rest
//!
//! The master key exists only in daemon memory and is zeroized on drop. Two
//! successful bridge starts on the same host produce the same key without
//! user input; losing the salt file orphans every ciphertext.

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]

mod aead;
mod error;
mod master_key;
mod salt;

pub use aead::{SealedBox, open, seal, sealed_from_parts};
pub use error::{CryptoError, CryptoResult};
pub use master_key::{MasterKey, host_identifier};
pub use salt::SaltFile;

/// Length of the AEAD nonce in bytes (XChaCha20-Poly1305).
pub const NONCE_LEN: usize = 24;

/// Length of the master key and of the salt file in bytes.
pub const KEY_LEN: usize = 32;
