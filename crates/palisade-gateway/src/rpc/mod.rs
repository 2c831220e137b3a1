//! The JSON-RPC 2.0 surface: wire types, error codes, and the dispatcher.
//!
//! Transport framing (newline-delimited lines over the Unix socket) lives
//! in [`crate::server`]; this module is transport-agnostic so the chat
//! inbound router can dispatch the same records.

mod chat;
mod configs;
mod containers;
mod keys;
mod system;

use std::sync::Arc;

use palisade_audit::{AuditAction, AuditEntry, AuditOutcome};
use palisade_core::{codes, ErrorReport, TraceId};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::state::BridgeState;

/// JSON-RPC error codes used by the bridge.
pub mod error_codes {
    /// Malformed JSON.
    pub const PARSE_ERROR: i64 = -32700;
    /// Not a valid request object (or oversize line).
    pub const INVALID_REQUEST: i64 = -32600;
    /// Unknown method.
    pub const METHOD_NOT_FOUND: i64 = -32601;
    /// Bad params (validation failures included).
    pub const INVALID_PARAMS: i64 = -32602;
    /// Handler panic or timeout.
    pub const INTERNAL_ERROR: i64 = -32603;

    /// Referenced entity does not exist.
    pub const NOT_FOUND: i64 = -32001;
    /// Zero-trust rejection.
    pub const ACCESS_DENIED: i64 = -32002;
    /// Container plane failure.
    pub const CONTAINER_ERROR: i64 = -32010;
    /// Keystore or system failure.
    pub const SYSTEM_ERROR: i64 = -32011;
    /// Budget denial.
    pub const BUDGET_ERROR: i64 = -32012;
    /// Chat protocol failure.
    pub const MATRIX_ERROR: i64 = -32013;
    /// Voice support disabled.
    pub const VOICE_DISABLED: i64 = -32014;
}

/// One decoded request line.
#[derive(Debug, Clone, Deserialize)]
pub struct Request {
    /// Must be `"2.0"`.
    #[serde(default)]
    pub jsonrpc: String,
    /// Absent for notifications.
    #[serde(default)]
    pub id: Option<Value>,
    /// Method name.
    pub method: String,
    /// Params object.
    #[serde(default)]
    pub params: Option<Value>,
}

/// A failure on its way into a JSON-RPC error object.
#[derive(Debug)]
pub struct RpcFailure {
    /// JSON-RPC error code.
    pub code: i64,
    /// Short message.
    pub message: String,
    /// The structured report carried in `error.data`.
    pub report: Option<ErrorReport>,
}

impl RpcFailure {
    /// `-32602` with a validation message.
    ///
    /// Caller mistakes are warnings in the report ring, not errors.
    pub fn invalid_params(message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            report: Some(
                ErrorReport::new(codes::RPC_INVALID, "rpc::dispatch", message.clone())
                    .with_severity(palisade_core::Severity::Warning),
            ),
            code: error_codes::INVALID_PARAMS,
            message,
        }
    }

    /// `-32601` for an unknown method.
    #[must_use]
    pub fn method_not_found(method: &str) -> Self {
        Self {
            code: error_codes::METHOD_NOT_FOUND,
            message: format!("unknown method: {method}"),
            report: None,
        }
    }

    /// An application failure with its report.
    #[must_use]
    pub fn with_report(code: i64, report: ErrorReport) -> Self {
        Self {
            code,
            message: report.message.clone(),
            report: Some(report),
        }
    }

    /// `-32603`.
    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            code: error_codes::INTERNAL_ERROR,
            message: message.into(),
            report: None,
        }
    }
}

/// Where a call came from. Zero-trust applies to chat origins only.
#[derive(Debug, Clone)]
pub enum CallOrigin {
    /// A direct Unix-socket client, identified by peer credentials.
    Socket {
        /// Peer UID.
        uid: u32,
        /// Peer PID when the kernel reports one.
        pid: Option<i32>,
    },
    /// A chat-originated command.
    Chat {
        /// Sender id.
        sender: String,
        /// Originating room.
        room_id: String,
    },
}

/// Per-request context handed to every handler.
#[derive(Debug, Clone)]
pub struct CallContext {
    /// Call origin.
    pub origin: CallOrigin,
    /// Correlation id for this request.
    pub trace_id: TraceId,
    /// Cancelled when the connection drops or the daemon shuts down.
    pub cancel: CancellationToken,
}

impl CallContext {
    /// A context for a socket caller.
    #[must_use]
    pub fn socket(uid: u32, pid: Option<i32>, cancel: CancellationToken) -> Self {
        Self {
            origin: CallOrigin::Socket { uid, pid },
            trace_id: TraceId::new(),
            cancel,
        }
    }

    /// A context for a chat-originated command.
    #[must_use]
    pub fn chat(sender: impl Into<String>, room_id: impl Into<String>, cancel: CancellationToken) -> Self {
        Self {
            origin: CallOrigin::Chat {
                sender: sender.into(),
                room_id: room_id.into(),
            },
            trace_id: TraceId::new(),
            cancel,
        }
    }
}

/// The method dispatcher.
///
/// A static method-name match rather than a dynamic registry: the method
/// set is closed, and a tagged dispatch keeps every params type explicit.
#[derive(Clone)]
pub struct Dispatcher {
    pub(crate) state: Arc<BridgeState>,
}

impl Dispatcher {
    /// Create a dispatcher over the shared state.
    #[must_use]
    pub fn new(state: Arc<BridgeState>) -> Self {
        Self { state }
    }

    /// Dispatch one call.
    ///
    /// Chat-originated calls pass the zero-trust filter first; a rejected
    /// command is audited and never reaches a handler.
    ///
    /// # Errors
    ///
    /// Every failure is an [`RpcFailure`] ready for the wire.
    pub async fn dispatch(
        &self,
        ctx: &CallContext,
        method: &str,
        params: Value,
    ) -> Result<Value, RpcFailure> {
        if let CallOrigin::Chat { sender, room_id } = &ctx.origin {
            let decision = self.state.policy.check(sender, room_id);
            if !decision.is_allowed() {
                warn!(sender = %sender, room = %room_id, method, "Zero-trust rejection");
                self.state.audit.record(
                    AuditEntry::new(
                        AuditAction::AccessDenied {
                            sender: sender.clone(),
                            room_id: room_id.clone(),
                            command: method.to_owned(),
                            reason: decision.reason().to_owned(),
                        },
                        AuditOutcome::ok(),
                    )
                    .with_trace(ctx.trace_id),
                );
                let report = ErrorReport::new(
                    codes::RPC_ACCESS_DENIED,
                    "rpc::zero_trust",
                    format!("command {method} from {sender} rejected: {}", decision.reason()),
                )
                .with_severity(palisade_core::Severity::Warning);
                self.state.errors.record(report.clone());
                return Err(RpcFailure::with_report(error_codes::ACCESS_DENIED, report));
            }
            self.state.audit.record(
                AuditEntry::new(
                    AuditAction::AccessGranted {
                        sender: sender.clone(),
                        room_id: room_id.clone(),
                        command: method.to_owned(),
                    },
                    AuditOutcome::ok(),
                )
                .with_trace(ctx.trace_id),
            );
        }

        debug!(method, trace_id = %ctx.trace_id, "Dispatching");
        let outcome = self.dispatch_inner(ctx, method, params).await;

        // The single chokepoint where RPC-path failures are materialized:
        // every report lands in the bounded ring, and severities of error
        // and above fan out on the bus.
        if let Err(failure) = &outcome
            && let Some(report) = &failure.report
        {
            self.state.errors.record(report.clone());
            if report.severity >= palisade_core::Severity::Error {
                self.state
                    .bus
                    .publish(palisade_events::BridgeEvent::ErrorReport(report.clone()));
            }
        }
        outcome
    }

    async fn dispatch_inner(
        &self,
        ctx: &CallContext,
        method: &str,
        params: Value,
    ) -> Result<Value, RpcFailure> {
        match method {
            "status" => self.status().await,
            "health" => self.health(),
            "bridge.health" => self.bridge_health().await,
            "get_errors" => self.get_errors(params),
            "resolve_error" => self.resolve_error(params),
            "set_budget" => self.set_budget(params),
            "budget_status" => self.budget_status(params),

            "list_keys" => self.list_keys(),
            "store_key" => self.store_key(params),
            "get_key" => self.get_key(params),
            "delete_key" => self.delete_key(params),
            "validate_key" => self.validate_key(params),

            "start" => self.start(ctx, params).await,
            "stop" => self.stop(params).await,
            "heartbeat" => self.heartbeat(params),
            "get_secret" => self.get_secret(params),
            "list_secrets" => self.list_secrets(),

            "attach_config" => self.attach_config(params),
            "list_configs" => self.list_configs(),

            "matrix.send" | "send" => self.matrix_send(params).await,
            "matrix.receive" => self.matrix_receive(params),
            "matrix.react" => self.matrix_react(params).await,
            "matrix.reply" => self.matrix_reply(params).await,
            "matrix.rooms" => self.matrix_rooms().await,
            "matrix.upload" => self.matrix_upload(params).await,

            "subscribe" | "unsubscribe" => Err(RpcFailure::invalid_params(
                "subscriptions require a direct socket connection",
            )),

            other if other.starts_with("webrtc.") => {
                let report = ErrorReport::new(
                    codes::VOX_DISABLED,
                    "rpc::dispatch",
                    "voice support is not enabled in this build",
                )
                .with_remediation("rebuild with the voice feature and enable it in config");
                Err(RpcFailure::with_report(error_codes::VOICE_DISABLED, report))
            },

            other => Err(RpcFailure::method_not_found(other)),
        }
    }
}

/// Decode a params object into a typed struct with `-32602` on mismatch.
pub(crate) fn parse_params<T: serde::de::DeserializeOwned>(params: Value) -> Result<T, RpcFailure> {
    serde_json::from_value(params).map_err(|e| RpcFailure::invalid_params(format!("invalid params: {e}")))
}

/// Serialize a response value, which must never fail for our own types.
pub(crate) fn to_value<T: Serialize>(value: T) -> Result<Value, RpcFailure> {
    serde_json::to_value(value).map_err(|e| RpcFailure::internal(format!("response serialization: {e}")))
}

#[cfg(test)]
pub(crate) mod test_support;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::test_support::test_dispatcher;

    #[tokio::test]
    async fn test_unknown_method() {
        let (dispatcher, _dir) = test_dispatcher(|_| {}).await;
        let ctx = CallContext::socket(0, None, CancellationToken::new());
        let err = dispatcher
            .dispatch(&ctx, "frobnicate", Value::Null)
            .await
            .unwrap_err();
        assert_eq!(err.code, error_codes::METHOD_NOT_FOUND);
    }

    #[tokio::test]
    async fn test_webrtc_disabled() {
        let (dispatcher, _dir) = test_dispatcher(|_| {}).await;
        let ctx = CallContext::socket(0, None, CancellationToken::new());
        let err = dispatcher
            .dispatch(&ctx, "webrtc.offer", Value::Null)
            .await
            .unwrap_err();
        assert_eq!(err.code, error_codes::VOICE_DISABLED);
        assert_eq!(err.report.unwrap().code, "VOX-001");
    }

    #[tokio::test]
    async fn test_zero_trust_rejection_never_dispatches() {
        let (dispatcher, _dir) = test_dispatcher(|config| {
            config.zero_trust.trusted_senders = vec!["@alice:ex".to_owned()];
            config.zero_trust.reject_untrusted = true;
        })
        .await;

        let ctx = CallContext::chat("@mallory:ex", "!r:ex", CancellationToken::new());
        let err = dispatcher
            .dispatch(&ctx, "status", serde_json::json!({}))
            .await
            .unwrap_err();
        assert_eq!(err.code, error_codes::ACCESS_DENIED);

        let denials = dispatcher.state.audit.recent(Some("access_denied"), 10);
        assert_eq!(denials.len(), 1);
    }

    #[tokio::test]
    async fn test_trusted_chat_sender_dispatches() {
        let (dispatcher, _dir) = test_dispatcher(|config| {
            config.zero_trust.trusted_senders = vec!["@alice:ex".to_owned()];
        })
        .await;

        let ctx = CallContext::chat("@alice:ex", "!r:ex", CancellationToken::new());
        let result = dispatcher
            .dispatch(&ctx, "status", serde_json::json!({}))
            .await
            .unwrap();
        assert!(result.get("version").is_some());

        let grants = dispatcher.state.audit.recent(Some("access_granted"), 10);
        assert_eq!(grants.len(), 1);
    }

    #[tokio::test]
    async fn test_socket_origin_bypasses_zero_trust() {
        let (dispatcher, _dir) = test_dispatcher(|config| {
            config.zero_trust.trusted_senders = vec!["@alice:ex".to_owned()];
        })
        .await;

        let ctx = CallContext::socket(0, None, CancellationToken::new());
        dispatcher
            .dispatch(&ctx, "status", serde_json::json!({}))
            .await
            .unwrap();
    }
}
