//! Chat passthrough RPC methods.
//!
//! `matrix.send` is the canonical send method; `send` is an alias wired to
//! the same handler in the dispatcher.

use base64::Engine as _;
use palisade_core::{codes, ErrorReport};
use palisade_matrix::{MatrixClient, MatrixError};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

use super::{error_codes, parse_params, to_value, Dispatcher, RpcFailure};

#[derive(Debug, Deserialize)]
struct SendParams {
    room_id: String,
    message: String,
    #[serde(default)]
    msgtype: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ReceiveParams {
    #[serde(default)]
    room_id: Option<String>,
    #[serde(default = "default_receive_limit")]
    limit: usize,
}

fn default_receive_limit() -> usize {
    20
}

#[derive(Debug, Deserialize)]
struct ReactParams {
    room_id: String,
    event_id: String,
    key: String,
}

#[derive(Debug, Deserialize)]
struct ReplyParams {
    room_id: String,
    event_id: String,
    message: String,
}

#[derive(Debug, Deserialize)]
struct UploadParams {
    filename: String,
    content: String,
    #[serde(default = "default_upload_encoding")]
    encoding: String,
    #[serde(default)]
    content_type: Option<String>,
    #[serde(default)]
    room_id: Option<String>,
}

fn default_upload_encoding() -> String {
    "base64".to_owned()
}

fn matrix_failure(e: &MatrixError, function: &str) -> RpcFailure {
    RpcFailure::with_report(
        error_codes::MATRIX_ERROR,
        ErrorReport::new(e.code(), function, e.to_string()),
    )
}

impl Dispatcher {
    fn chat_client(&self) -> Result<Arc<MatrixClient>, RpcFailure> {
        self.state.matrix.clone().ok_or_else(|| {
            RpcFailure::with_report(
                error_codes::MATRIX_ERROR,
                ErrorReport::new(
                    codes::MAT_CONNECTION,
                    "rpc::matrix",
                    "the chat channel is not enabled",
                )
                .with_remediation("set matrix.enabled = true and configure the homeserver"),
            )
        })
    }

    pub(super) async fn matrix_send(&self, params: Value) -> Result<Value, RpcFailure> {
        let params: SendParams = parse_params(params)?;
        let client = self.chat_client()?;
        let event_id = client
            .send_message(&params.room_id, &params.message, params.msgtype.as_deref())
            .await
            .map_err(|e| matrix_failure(&e, "rpc::matrix_send"))?;
        Ok(json!({"event_id": event_id, "room_id": params.room_id}))
    }

    pub(super) fn matrix_receive(&self, params: Value) -> Result<Value, RpcFailure> {
        let params: ReceiveParams = if params.is_null() {
            ReceiveParams {
                room_id: None,
                limit: default_receive_limit(),
            }
        } else {
            parse_params(params)?
        };
        let events = self
            .state
            .recent_chat_events(params.room_id.as_deref(), params.limit.min(200));
        to_value(events)
    }

    pub(super) async fn matrix_react(&self, params: Value) -> Result<Value, RpcFailure> {
        let params: ReactParams = parse_params(params)?;
        let client = self.chat_client()?;
        let event_id = client
            .send_reaction(&params.room_id, &params.event_id, &params.key)
            .await
            .map_err(|e| matrix_failure(&e, "rpc::matrix_react"))?;
        Ok(json!({"event_id": event_id, "room_id": params.room_id}))
    }

    pub(super) async fn matrix_reply(&self, params: Value) -> Result<Value, RpcFailure> {
        let params: ReplyParams = parse_params(params)?;
        let client = self.chat_client()?;
        let event_id = client
            .send_reply(&params.room_id, &params.event_id, &params.message)
            .await
            .map_err(|e| matrix_failure(&e, "rpc::matrix_reply"))?;
        Ok(json!({"event_id": event_id, "room_id": params.room_id}))
    }

    pub(super) async fn matrix_rooms(&self) -> Result<Value, RpcFailure> {
        let client = self.chat_client()?;
        let rooms = client
            .joined_rooms()
            .await
            .map_err(|e| matrix_failure(&e, "rpc::matrix_rooms"))?;
        Ok(json!({"count": rooms.len(), "rooms": rooms}))
    }

    pub(super) async fn matrix_upload(&self, params: Value) -> Result<Value, RpcFailure> {
        let params: UploadParams = parse_params(params)?;
        let client = self.chat_client()?;

        let data = match params.encoding.as_str() {
            "base64" => base64::engine::general_purpose::STANDARD
                .decode(params.content.trim())
                .map_err(|e| RpcFailure::invalid_params(format!("base64: {e}")))?,
            "raw" => params.content.into_bytes(),
            other => {
                return Err(RpcFailure::invalid_params(format!(
                    "unknown encoding {other:?} (expected raw or base64)"
                )));
            },
        };

        let content_type = params
            .content_type
            .unwrap_or_else(|| "application/octet-stream".to_owned());
        let size = data.len();
        let content_uri = client
            .upload(&params.filename, &content_type, data)
            .await
            .map_err(|e| matrix_failure(&e, "rpc::matrix_upload"))?;

        let mut response = json!({
            "content_uri": content_uri.clone(),
            "filename": params.filename.clone(),
            "size": size,
        });
        if let Some(room_id) = params.room_id {
            let event_id = client
                .send_file(&room_id, &params.filename, &content_uri, &content_type, size)
                .await
                .map_err(|e| matrix_failure(&e, "rpc::matrix_upload"))?;
            response["event_id"] = json!(event_id);
            response["room_id"] = json!(room_id);
        }
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::test_support::test_dispatcher;
    use crate::rpc::CallContext;
    use palisade_events::ChatEvent;
    use tokio_util::sync::CancellationToken;

    fn ctx() -> CallContext {
        CallContext::socket(0, None, CancellationToken::new())
    }

    #[tokio::test]
    async fn test_send_requires_chat_enabled() {
        let (dispatcher, _dir) = test_dispatcher(|_| {}).await;
        let err = dispatcher
            .dispatch(
                &ctx(),
                "matrix.send",
                json!({"room_id": "!r:ex", "message": "hi"}),
            )
            .await
            .unwrap_err();
        assert_eq!(err.code, error_codes::MATRIX_ERROR);

        // The alias resolves to the same handler and fails identically.
        let err = dispatcher
            .dispatch(&ctx(), "send", json!({"room_id": "!r:ex", "message": "hi"}))
            .await
            .unwrap_err();
        assert_eq!(err.code, error_codes::MATRIX_ERROR);
    }

    #[tokio::test]
    async fn test_receive_pages_recent_events() {
        let (dispatcher, _dir) = test_dispatcher(|_| {}).await;
        for i in 0..5 {
            dispatcher.state.record_chat_event(ChatEvent {
                event_id: format!("$e{i}"),
                room_id: if i % 2 == 0 { "!a:ex" } else { "!b:ex" }.to_owned(),
                sender: "@a:ex".to_owned(),
                event_type: "m.room.message".to_owned(),
                content: json!({"body": format!("m{i}")}),
                origin_server_ts: i,
            });
        }

        let all = dispatcher
            .dispatch(&ctx(), "matrix.receive", json!({"limit": 10}))
            .await
            .unwrap();
        assert_eq!(all.as_array().unwrap().len(), 5);
        // Newest first.
        assert_eq!(all[0]["event_id"], "$e4");

        let room_a = dispatcher
            .dispatch(&ctx(), "matrix.receive", json!({"room_id": "!a:ex", "limit": 10}))
            .await
            .unwrap();
        assert_eq!(room_a.as_array().unwrap().len(), 3);
    }
}
