//! Palisade Keystore - encrypted credential storage.
//!
//! Credentials are stored in a single SQLite table. Secret material is
//! sealed with XChaCha20-Poly1305 under the daemon master key before it
//! touches the database; metadata (ids, provider tags, labels) stays
//! queryable in the clear so `list` never needs to decrypt anything.
//!
//! A sealed key-check sentinel written at creation time is verified on every
//! open, so starting the bridge against a keystore sealed under a different
//! master key fails immediately instead of at first credential use.

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]

mod error;
mod store;
mod types;

pub use error::{KeystoreError, KeystoreResult};
pub use store::Keystore;
pub use types::{CredentialRecord, DecryptedCredential, NewCredential};
