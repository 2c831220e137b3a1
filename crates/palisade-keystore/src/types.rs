//! Credential types as they cross the keystore boundary.

use chrono::{DateTime, Utc};
use palisade_core::{CredentialId, Provider};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use zeroize::Zeroizing;

/// Credential metadata — everything that is safe to list and log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialRecord {
    /// Stable id.
    pub id: CredentialId,
    /// Provider tag.
    pub provider: Provider,
    /// Display label.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    /// Free-form tag set.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    /// Optional expiry.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    /// When the credential was stored.
    pub created_at: DateTime<Utc>,
}

impl CredentialRecord {
    /// Whether the credential is past its expiry.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|at| at < Utc::now())
    }
}

/// A credential on its way into the store.
///
/// No `Debug`, `Serialize`, or `Clone` surface exposes the token; the
/// zeroizing wrapper clears it when the value is dropped.
pub struct NewCredential {
    /// Stable id (operator-chosen or generated upstream).
    pub id: CredentialId,
    /// Provider tag.
    pub provider: Provider,
    /// Plaintext secret.
    pub token: Zeroizing<String>,
    /// Additional key/value material sealed alongside the token
    /// (e.g. a chat session's device id).
    pub additional: BTreeMap<String, String>,
    /// Display label.
    pub display_name: Option<String>,
    /// Free-form tag set.
    pub tags: Vec<String>,
    /// Optional expiry.
    pub expires_at: Option<DateTime<Utc>>,
}

impl NewCredential {
    /// Convenience constructor with empty metadata.
    #[must_use]
    pub fn new(id: CredentialId, provider: Provider, token: impl Into<String>) -> Self {
        Self {
            id,
            provider,
            token: Zeroizing::new(token.into()),
            additional: BTreeMap::new(),
            display_name: None,
            tags: Vec::new(),
            expires_at: None,
        }
    }
}

impl std::fmt::Debug for NewCredential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NewCredential")
            .field("id", &self.id)
            .field("provider", &self.provider)
            .field("display_name", &self.display_name)
            .field("tags", &self.tags)
            .finish_non_exhaustive()
    }
}

/// A credential decrypted in memory for injection.
///
/// Exists only inside the injection window; dropped (and zeroized)
/// immediately after the secret bundle is written.
pub struct DecryptedCredential {
    /// The metadata row.
    pub record: CredentialRecord,
    /// Plaintext token.
    pub token: Zeroizing<String>,
    /// Additional sealed key/value material.
    pub additional: BTreeMap<String, String>,
}

impl std::fmt::Debug for DecryptedCredential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecryptedCredential")
            .field("id", &self.record.id)
            .field("provider", &self.record.provider)
            .finish_non_exhaustive()
    }
}

/// The sealed payload layout: what actually gets encrypted per row.
#[derive(Serialize, Deserialize)]
pub(crate) struct SecretMaterial {
    pub(crate) token: String,
    #[serde(default)]
    pub(crate) additional: BTreeMap<String, String>,
}

impl Drop for SecretMaterial {
    fn drop(&mut self) {
        use zeroize::Zeroize;
        self.token.zeroize();
        for value in self.additional.values_mut() {
            value.zeroize();
        }
    }
}
