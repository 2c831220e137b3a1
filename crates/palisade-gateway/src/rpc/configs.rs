//! Attached-configuration RPC methods.

use palisade_audit::{AuditAction, AuditEntry, AuditOutcome};
use palisade_core::{codes, ErrorReport, Timestamp};
use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

use super::{error_codes, parse_params, to_value, Dispatcher, RpcFailure};
use crate::command::{decode_config_content, validate_config_name, CommandError};
use crate::state::AttachedConfig;

#[derive(Debug, Deserialize)]
struct AttachConfigParams {
    name: String,
    content: String,
    #[serde(default = "default_encoding")]
    encoding: String,
    #[serde(rename = "type", default)]
    content_type: Option<String>,
}

fn default_encoding() -> String {
    "raw".to_owned()
}

fn rejection(e: &CommandError) -> RpcFailure {
    RpcFailure {
        code: error_codes::INVALID_PARAMS,
        message: e.to_string(),
        report: Some(
            ErrorReport::new(codes::RPC_CONFIG_REJECTED, "rpc::attach_config", e.to_string())
                .with_severity(palisade_core::Severity::Warning),
        ),
    }
}

impl Dispatcher {
    pub(super) fn attach_config(&self, params: Value) -> Result<Value, RpcFailure> {
        let params: AttachConfigParams = parse_params(params)?;

        validate_config_name(&params.name).map_err(|e| rejection(&e))?;
        let bytes = decode_config_content(&params.content, &params.encoding).map_err(|e| rejection(&e))?;

        let configs_dir = self.state.configs_dir();
        std::fs::create_dir_all(&configs_dir)
            .map_err(|e| RpcFailure::internal(format!("configs dir: {e}")))?;

        let path = configs_dir.join(&params.name);
        // Belt and braces: the validated name cannot escape, but the final
        // path is still required to stay inside the configs directory.
        if path.parent() != Some(configs_dir.as_path()) {
            return Err(rejection(&CommandError::BadConfigName(format!(
                "path traversal rejected in {:?}",
                params.name
            ))));
        }

        std::fs::write(&path, &bytes)
            .map_err(|e| RpcFailure::internal(format!("config write: {e}")))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if let Ok(metadata) = std::fs::metadata(&path) {
                let mut perms = metadata.permissions();
                perms.set_mode(0o644);
                let _ = std::fs::set_permissions(&path, perms);
            }
        }

        let content_type = params.content_type.unwrap_or_else(|| {
            std::path::Path::new(&params.name)
                .extension()
                .and_then(|e| e.to_str())
                .unwrap_or("file")
                .to_owned()
        });

        let record = AttachedConfig {
            config_id: Uuid::new_v4().to_string(),
            name: params.name.clone(),
            path: path.clone(),
            size: bytes.len(),
            content_type,
            attached_at: Timestamp::now(),
        };

        self.state.audit.record(AuditEntry::new(
            AuditAction::ConfigAttached {
                name: params.name.clone(),
                size: bytes.len(),
            },
            AuditOutcome::ok(),
        ));
        let response = to_value(&record)?;
        self.state.attached_configs.insert(params.name, record);
        Ok(response)
    }

    pub(super) fn list_configs(&self) -> Result<Value, RpcFailure> {
        let configs: Vec<AttachedConfig> = self
            .state
            .attached_configs
            .iter()
            .map(|r| r.clone())
            .collect();
        to_value(json!({"count": configs.len(), "configs": configs}))
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
    async fn test_attach_and_list() {
        let (dispatcher, dir) = test_dispatcher(|_| {}).await;

        let attached = dispatcher
            .dispatch(
                &ctx(),
                "attach_config",
                json!({"name": "agent.toml", "content": "key = 1\n", "encoding": "raw"}),
            )
            .await
            .unwrap();
        assert_eq!(attached["name"], "agent.toml");
        assert_eq!(attached["size"], 8);
        assert_eq!(attached["type"], "toml");

        let written = dir.path().join("configs").join("agent.toml");
        assert_eq!(std::fs::read_to_string(written).unwrap(), "key = 1\n");

        let listed = dispatcher
            .dispatch(&ctx(), "list_configs", json!({}))
            .await
            .unwrap();
        assert_eq!(listed["count"], 1);
    }

    #[tokio::test]
    async fn test_traversal_rejected_with_invalid_params_code() {
        let (dispatcher, dir) = test_dispatcher(|_| {}).await;

        let err = dispatcher
            .dispatch(
                &ctx(),
                "attach_config",
                json!({"name": "../../etc/passwd", "content": "x", "encoding": "raw"}),
            )
            .await
            .unwrap_err();
        assert_eq!(err.code, -32602);
        assert!(err.message.contains("traversal"));
        assert_eq!(err.report.unwrap().code, "RPC-002");

        // Nothing written anywhere under configs/.
        let entries: Vec<_> = std::fs::read_dir(dir.path().join("configs"))
            .map(|rd| rd.collect())
            .unwrap_or_default();
        assert!(entries.is_empty());
    }

    #[tokio::test]
    async fn test_base64_attach() {
        let (dispatcher, _dir) = test_dispatcher(|_| {}).await;
        use base64::Engine as _;
        let content = base64::engine::general_purpose::STANDARD.encode("{\"a\": 1}");
        let attached = dispatcher
            .dispatch(
                &ctx(),
                "attach_config",
                json!({"name": "a.json", "content": content, "encoding": "base64"}),
            )
            .await
            .unwrap();
        assert_eq!(attached["size"], 8);
        assert_eq!(attached["type"], "json");
    }

    #[tokio::test]
    async fn test_oversize_content_rejected() {
        let (dispatcher, _dir) = test_dispatcher(|_| {}).await;
        let big = "x".repeat(crate::command::MAX_CONFIG_CONTENT + 1);
        let err = dispatcher
            .dispatch(
                &ctx(),
                "attach_config",
                json!({"name": "big.txt", "content": big, "encoding": "raw"}),
            )
            .await
            .unwrap_err();
        assert_eq!(err.code, -32602);
        assert_eq!(err.report.unwrap().code, "RPC-002");
    }
}
