//! Credential CRUD RPC methods.

use chrono::{DateTime, Utc};
use palisade_audit::{AuditAction, AuditEntry, AuditOutcome};
use palisade_core::{CredentialId, ErrorReport, Provider};
use palisade_keystore::{KeystoreError, NewCredential};
use serde::Deserialize;
use serde_json::{json, Value};
use zeroize::Zeroizing;

use super::{error_codes, parse_params, to_value, Dispatcher, RpcFailure};

#[derive(Deserialize)]
struct StoreKeyParams {
    #[serde(default)]
    id: Option<String>,
    provider: String,
    token: String,
    #[serde(default)]
    display_name: Option<String>,
    #[serde(default)]
    tags: Vec<String>,
    #[serde(default)]
    expires_at: Option<String>,
    #[serde(default)]
    replace: bool,
}

#[derive(Debug, Deserialize)]
struct KeyIdParams {
    id: String,
}

/// Map a keystore failure onto the wire.
pub(super) fn keystore_failure(e: &KeystoreError, function: &str) -> RpcFailure {
    let code = match e {
        KeystoreError::NotFound { .. } => error_codes::NOT_FOUND,
        KeystoreError::Duplicate { .. } => error_codes::INVALID_PARAMS,
        _ => error_codes::SYSTEM_ERROR,
    };
    RpcFailure::with_report(code, ErrorReport::new(e.code(), function, e.to_string()))
}

impl Dispatcher {
    pub(super) fn list_keys(&self) -> Result<Value, RpcFailure> {
        let records = self
            .state
            .keystore
            .list()
            .map_err(|e| keystore_failure(&e, "rpc::list_keys"))?;
        to_value(records)
    }

    pub(super) fn store_key(&self, params: Value) -> Result<Value, RpcFailure> {
        let params: StoreKeyParams = parse_params(params)?;

        let provider: Provider = params
            .provider
            .parse()
            .map_err(|e: palisade_core::provider::UnknownProvider| {
                RpcFailure::invalid_params(e.to_string())
            })?;

        let token = Zeroizing::new(params.token);
        if token.trim().is_empty() {
            return Err(RpcFailure::invalid_params("token must not be empty"));
        }

        let id = match params.id {
            Some(id) if !id.is_empty() => {
                if id.len() > 128 || !id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_') {
                    return Err(RpcFailure::invalid_params(
                        "id must be 1-128 alphanumeric, dash, or underscore characters",
                    ));
                }
                CredentialId::from(id)
            },
            _ => CredentialId::generate(),
        };

        let expires_at = params
            .expires_at
            .as_deref()
            .map(|raw| {
                DateTime::parse_from_rfc3339(raw)
                    .map(|dt| dt.with_timezone(&Utc))
                    .map_err(|e| RpcFailure::invalid_params(format!("bad expires_at: {e}")))
            })
            .transpose()?;

        let credential = NewCredential {
            id: id.clone(),
            provider,
            token,
            additional: std::collections::BTreeMap::new(),
            display_name: params.display_name,
            tags: params.tags,
            expires_at,
        };

        let stored = self
            .state
            .keystore
            .store(credential, params.replace)
            .map_err(|e| keystore_failure(&e, "rpc::store_key"))?;

        self.state.audit.record(AuditEntry::new(
            AuditAction::CredentialStored { id: stored.clone() },
            AuditOutcome::ok(),
        ));
        Ok(json!({"id": stored}))
    }

    pub(super) fn get_key(&self, params: Value) -> Result<Value, RpcFailure> {
        let params: KeyIdParams = parse_params(params)?;
        let record = self
            .state
            .keystore
            .metadata(&CredentialId::from(params.id))
            .map_err(|e| keystore_failure(&e, "rpc::get_key"))?;
        to_value(record)
    }

    pub(super) fn delete_key(&self, params: Value) -> Result<Value, RpcFailure> {
        let params: KeyIdParams = parse_params(params)?;
        let id = CredentialId::from(params.id);
        let deleted = self
            .state
            .keystore
            .delete(&id)
            .map_err(|e| keystore_failure(&e, "rpc::delete_key"))?;
        if deleted {
            self.state.audit.record(AuditEntry::new(
                AuditAction::CredentialDeleted { id },
                AuditOutcome::ok(),
            ));
        }
        Ok(json!({"deleted": deleted}))
    }

    /// Decrypt in memory to prove the credential is usable. The plaintext
    /// never leaves this function.
    pub(super) fn validate_key(&self, params: Value) -> Result<Value, RpcFailure> {
        let params: KeyIdParams = parse_params(params)?;
        let id = CredentialId::from(params.id);

        let metadata = self
            .state
            .keystore
            .metadata(&id)
            .map_err(|e| keystore_failure(&e, "rpc::validate_key"))?;
        if metadata.is_expired() {
            return Ok(json!({"valid": false, "reason": "expired"}));
        }

        match self.state.keystore.get(&id) {
            Ok(decrypted) => {
                drop(decrypted);
                self.state.audit.record(AuditEntry::new(
                    AuditAction::CredentialAccessed {
                        id,
                        purpose: "validate_key".to_owned(),
                    },
                    AuditOutcome::ok(),
                ));
                Ok(json!({"valid": true}))
            },
            Err(KeystoreError::DecryptFailed { .. }) => {
                Ok(json!({"valid": false, "reason": "decrypt_failed"}))
            },
            Err(e) => Err(keystore_failure(&e, "rpc::validate_key")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::test_support::test_dispatcher;
    use crate::rpc::CallContext;
    use tokio_util::sync::CancellationToken;

    fn ctx() -> CallContext {
        CallContext::socket(0, None, CancellationToken::new())
    }

    #[tokio::test]
    async fn test_store_list_get_delete() {
        let (dispatcher, _dir) = test_dispatcher(|_| {}).await;

        let stored = dispatcher
            .dispatch(
                &ctx(),
                "store_key",
                json!({"id": "k2", "provider": "anthropic", "token": "sk-ant-x", "tags": ["prod"]}),
            )
            .await
            .unwrap();
        assert_eq!(stored["id"], "k2");

        let listed = dispatcher
            .dispatch(&ctx(), "list_keys", json!({}))
            .await
            .unwrap();
        assert_eq!(listed.as_array().unwrap().len(), 2);
        assert!(!listed.to_string().contains("sk-ant-x"), "plaintext must never be listed");

        let record = dispatcher
            .dispatch(&ctx(), "get_key", json!({"id": "k2"}))
            .await
            .unwrap();
        assert_eq!(record["provider"], "anthropic");
        assert!(record.get("token").is_none());

        let deleted = dispatcher
            .dispatch(&ctx(), "delete_key", json!({"id": "k2"}))
            .await
            .unwrap();
        assert_eq!(deleted["deleted"], true);

        // Idempotent delete.
        let deleted = dispatcher
            .dispatch(&ctx(), "delete_key", json!({"id": "k2"}))
            .await
            .unwrap();
        assert_eq!(deleted["deleted"], false);
    }

    #[tokio::test]
    async fn test_duplicate_store_without_replace() {
        let (dispatcher, _dir) = test_dispatcher(|_| {}).await;
        let err = dispatcher
            .dispatch(
                &ctx(),
                "store_key",
                json!({"id": "k1", "provider": "openai", "token": "sk-other"}),
            )
            .await
            .unwrap_err();
        assert_eq!(err.report.unwrap().code, "SYS-004");

        dispatcher
            .dispatch(
                &ctx(),
                "store_key",
                json!({"id": "k1", "provider": "openai", "token": "sk-other", "replace": true}),
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_bad_provider_rejected() {
        let (dispatcher, _dir) = test_dispatcher(|_| {}).await;
        let err = dispatcher
            .dispatch(
                &ctx(),
                "store_key",
                json!({"provider": "aws", "token": "x"}),
            )
            .await
            .unwrap_err();
        assert_eq!(err.code, error_codes::INVALID_PARAMS);
    }

    #[tokio::test]
    async fn test_generated_id_when_absent() {
        let (dispatcher, _dir) = test_dispatcher(|_| {}).await;
        let stored = dispatcher
            .dispatch(
                &ctx(),
                "store_key",
                json!({"provider": "custom", "token": "tok"}),
            )
            .await
            .unwrap();
        assert!(stored["id"].as_str().unwrap().starts_with("key-"));
    }

    #[tokio::test]
    async fn test_get_unknown_key() {
        let (dispatcher, _dir) = test_dispatcher(|_| {}).await;
        let err = dispatcher
            .dispatch(&ctx(), "get_key", json!({"id": "nope"}))
            .await
            .unwrap_err();
        assert_eq!(err.code, error_codes::NOT_FOUND);
        assert_eq!(err.report.unwrap().code, "RPC-001");
    }

    #[tokio::test]
    async fn test_validate_key() {
        let (dispatcher, _dir) = test_dispatcher(|_| {}).await;
        let result = dispatcher
            .dispatch(&ctx(), "validate_key", json!({"id": "k1"}))
            .await
            .unwrap();
        assert_eq!(result["valid"], true);

        // Validation is audited as a credential access.
        let accesses = dispatcher.state.audit.recent(Some("credential_accessed"), 10);
        assert_eq!(accesses.len(), 1);
    }
}
