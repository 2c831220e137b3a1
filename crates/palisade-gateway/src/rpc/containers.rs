//! Container lifecycle RPC methods.

use std::time::Duration;

use palisade_core::{ContainerId, CredentialId, ErrorReport};
use palisade_runtime::{RuntimeError, StartOptions};
use serde::Deserialize;
use serde_json::{json, Value};

use super::{error_codes, parse_params, to_value, CallContext, Dispatcher, RpcFailure};

#[derive(Debug, Deserialize)]
struct StartParams {
    key_id: String,
    #[serde(default)]
    image: Option<String>,
    #[serde(default)]
    options: Option<StartParamsOptions>,
}

#[derive(Debug, Deserialize, Default)]
struct StartParamsOptions {
    #[serde(default)]
    env: Vec<String>,
    #[serde(default)]
    idle_timeout: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct StopParams {
    container_id: String,
    #[serde(default)]
    reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ContainerIdParams {
    container_id: String,
}

/// Map a runtime failure onto the wire.
pub(super) fn runtime_failure(e: &RuntimeError, function: &str) -> RpcFailure {
    let code = match e {
        RuntimeError::Keystore(inner) => return super::keys::keystore_failure(inner, function),
        RuntimeError::Budget { .. } => error_codes::BUDGET_ERROR,
        RuntimeError::NotFound { .. } => error_codes::NOT_FOUND,
        RuntimeError::CredentialExpired { .. } => error_codes::INVALID_PARAMS,
        _ => error_codes::CONTAINER_ERROR,
    };
    let mut report = ErrorReport::new(e.code(), function, e.to_string());
    if e.is_retryable() {
        report = report.retryable();
    }
    if matches!(e, RuntimeError::Budget { .. }) {
        report = report
            .with_remediation("raise the limit with set_budget or wait for the window to roll over");
    }
    RpcFailure::with_report(code, report)
}

fn parse_container_id(raw: &str) -> Result<ContainerId, RpcFailure> {
    raw.parse()
        .map_err(|_| RpcFailure::invalid_params(format!("bad container id {raw:?}")))
}

impl Dispatcher {
    pub(super) async fn start(&self, ctx: &CallContext, params: Value) -> Result<Value, RpcFailure> {
        let params: StartParams = parse_params(params)?;
        let options = params.options.unwrap_or_default();

        let start_options = StartOptions {
            image: params.image,
            env: options.env,
            idle_timeout: options.idle_timeout.map(Duration::from_secs),
        };

        let container_id = tokio::select! {
            () = ctx.cancel.cancelled() => {
                return Err(RpcFailure::internal("request cancelled"));
            }
            result = self
                .state
                .manager
                .start(CredentialId::from(params.key_id), start_options) => {
                result.map_err(|e| runtime_failure(&e, "rpc::start"))?
            }
        };

        Ok(json!({
            "container_id": container_id,
            "socket": self.state.config.server.socket_path,
        }))
    }

    pub(super) async fn stop(&self, params: Value) -> Result<Value, RpcFailure> {
        let params: StopParams = parse_params(params)?;
        let container_id = parse_container_id(&params.container_id)?;
        let reason = params.reason.unwrap_or_else(|| "rpc".to_owned());

        let stopped = self
            .state
            .manager
            .stop(&container_id, &reason)
            .await
            .map_err(|e| runtime_failure(&e, "rpc::stop"))?;
        Ok(json!({"stopped": stopped}))
    }

    pub(super) fn heartbeat(&self, params: Value) -> Result<Value, RpcFailure> {
        let params: ContainerIdParams = parse_params(params)?;
        let container_id = parse_container_id(&params.container_id)?;
        self.state
            .manager
            .heartbeat(&container_id)
            .map_err(|e| runtime_failure(&e, "rpc::heartbeat"))?;
        Ok(json!({"ok": true}))
    }

    /// Metadata for one materialized secret bundle. Never the contents.
    pub(super) fn get_secret(&self, params: Value) -> Result<Value, RpcFailure> {
        let params: ContainerIdParams = parse_params(params)?;
        let container_id = parse_container_id(&params.container_id)?;

        let record = self
            .state
            .manager
            .get(&container_id)
            .ok_or_else(|| {
                runtime_failure(
                    &RuntimeError::NotFound {
                        container_id: container_id.clone(),
                    },
                    "rpc::get_secret",
                )
            })?;

        let present = record.secret_path.exists();
        Ok(json!({
            "container_id": record.id,
            "credential_id": record.credential_id,
            "path": record.secret_path,
            "bind_path": record.bind_path,
            "present": present,
            "state": record.state,
        }))
    }

    /// Metadata for every bundle currently on disk.
    pub(super) fn list_secrets(&self) -> Result<Value, RpcFailure> {
        let secrets: Vec<Value> = self
            .state
            .manager
            .list()
            .into_iter()
            .filter(|r| r.secret_path.exists())
            .map(|r| {
                json!({
                    "container_id": r.id,
                    "credential_id": r.credential_id,
                    "path": r.secret_path,
                    "state": r.state,
                })
            })
            .collect();
        to_value(json!({"count": secrets.len(), "secrets": secrets}))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::test_support::test_dispatcher;
    use palisade_core::ContainerState;
    use tokio_util::sync::CancellationToken;

    fn ctx() -> CallContext {
        CallContext::socket(0, None, CancellationToken::new())
    }

    #[tokio::test]
    async fn test_start_and_stop_roundtrip() {
        let (dispatcher, _dir) = test_dispatcher(|_| {}).await;

        let started = dispatcher
            .dispatch(&ctx(), "start", json!({"key_id": "k1"}))
            .await
            .unwrap();
        let container_id = started["container_id"].as_str().unwrap().to_owned();
        assert!(!container_id.is_empty());

        let secret = dispatcher
            .dispatch(&ctx(), "get_secret", json!({"container_id": container_id}))
            .await
            .unwrap();
        assert_eq!(secret["present"], true);
        assert!(secret.get("token").is_none());

        let stopped = dispatcher
            .dispatch(
                &ctx(),
                "stop",
                json!({"container_id": container_id, "reason": "test"}),
            )
            .await
            .unwrap();
        assert_eq!(stopped["stopped"], true);

        let secret = dispatcher
            .dispatch(&ctx(), "get_secret", json!({"container_id": container_id}))
            .await
            .unwrap();
        assert_eq!(secret["present"], false);
    }

    #[tokio::test]
    async fn test_start_unknown_key() {
        let (dispatcher, _dir) = test_dispatcher(|_| {}).await;
        let err = dispatcher
            .dispatch(&ctx(), "start", json!({"key_id": "missing"}))
            .await
            .unwrap_err();
        assert_eq!(err.code, error_codes::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_heartbeat() {
        let (dispatcher, _dir) = test_dispatcher(|_| {}).await;
        let started = dispatcher
            .dispatch(&ctx(), "start", json!({"key_id": "k1"}))
            .await
            .unwrap();
        let container_id = started["container_id"].as_str().unwrap();

        let result = dispatcher
            .dispatch(&ctx(), "heartbeat", json!({"container_id": container_id}))
            .await
            .unwrap();
        assert_eq!(result["ok"], true);

        let err = dispatcher
            .dispatch(
                &ctx(),
                "heartbeat",
                json!({"container_id": ContainerId::new().to_string()}),
            )
            .await
            .unwrap_err();
        assert_eq!(err.code, error_codes::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_list_secrets_reflects_disk() {
        let (dispatcher, _dir) = test_dispatcher(|_| {}).await;
        let started = dispatcher
            .dispatch(&ctx(), "start", json!({"key_id": "k1"}))
            .await
            .unwrap();
        let container_id = started["container_id"].as_str().unwrap().to_owned();

        let listed = dispatcher
            .dispatch(&ctx(), "list_secrets", json!({}))
            .await
            .unwrap();
        assert_eq!(listed["count"], 1);

        dispatcher
            .dispatch(&ctx(), "stop", json!({"container_id": container_id}))
            .await
            .unwrap();

        let listed = dispatcher
            .dispatch(&ctx(), "list_secrets", json!({}))
            .await
            .unwrap();
        assert_eq!(listed["count"], 0);
    }

    #[tokio::test]
    async fn test_stop_unknown_container() {
        let (dispatcher, _dir) = test_dispatcher(|_| {}).await;
        let err = dispatcher
            .dispatch(
                &ctx(),
                "stop",
                json!({"container_id": ContainerId::new().to_string()}),
            )
            .await
            .unwrap_err();
        assert_eq!(err.code, error_codes::NOT_FOUND);
        assert_eq!(err.report.unwrap().code, "CTX-003");
    }

    #[tokio::test]
    async fn test_state_visible_via_status_after_start() {
        let (dispatcher, _dir) = test_dispatcher(|_| {}).await;
        dispatcher
            .dispatch(&ctx(), "start", json!({"key_id": "k1"}))
            .await
            .unwrap();

        let records = dispatcher.state.manager.list();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].state, ContainerState::Running);
    }
}
