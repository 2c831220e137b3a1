//! The Unix-domain JSON-RPC server.
//!
//! One accept loop; a reader and a writer task per connection. Requests
//! are newline-delimited JSON-RPC 2.0 objects, one per line; responses go
//! back the same way, and `subscribe` turns the connection into a
//! notification stream on top of its request/response traffic.

use std::collections::HashMap;
use std::sync::Arc;

use futures::StreamExt;
use palisade_core::SubscriberId;
use palisade_events::EventFilter;
use serde_json::{json, Value};
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{mpsc, Mutex, Semaphore};
use tokio_util::codec::{FramedRead, LinesCodec};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::rpc::{error_codes, CallContext, Dispatcher, Request};
use crate::state::BridgeState;

/// Cap for ordinary request lines.
pub const MAX_LINE_BYTES: usize = 1_048_576;

/// Tolerated line length so `attach_config` payloads can pass per-method
/// validation instead of being cut off at the framing layer.
pub const MAX_TOLERATED_LINE_BYTES: usize = 16 * 1_048_576;

/// Create the socket's parent directory (0750), remove a stale socket
/// file, bind, and set the socket mode to 0660.
///
/// # Errors
///
/// Any filesystem or bind failure — the daemon maps this to exit code 5.
pub fn bind_socket(state: &BridgeState) -> std::io::Result<UnixListener> {
    let path = &state.config.server.socket_path;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = std::fs::metadata(parent)?.permissions();
            perms.set_mode(0o750);
            std::fs::set_permissions(parent, perms)?;
        }
    }
    if path.exists() {
        std::fs::remove_file(path)?;
    }

    let listener = UnixListener::bind(path)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut perms = std::fs::metadata(path)?.permissions();
        perms.set_mode(0o660);
        std::fs::set_permissions(path, perms)?;
    }
    info!(path = %path.display(), "RPC socket bound");
    Ok(listener)
}

/// Run the accept loop until cancelled.
pub async fn run_socket_server(
    listener: UnixListener,
    state: Arc<BridgeState>,
    dispatcher: Dispatcher,
    cancel: CancellationToken,
) {
    let parallelism = if state.config.server.worker_parallelism == 0 {
        std::thread::available_parallelism().map_or(8, |n| n.get().saturating_mul(2))
    } else {
        state.config.server.worker_parallelism
    };
    let workers = Arc::new(Semaphore::new(parallelism));
    info!(parallelism, "RPC worker pool sized");

    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => {
                info!("RPC server received shutdown signal");
                break;
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, _addr)) => {
                    let connection_cancel = cancel.child_token();
                    let state = Arc::clone(&state);
                    let dispatcher = dispatcher.clone();
                    let workers = Arc::clone(&workers);
                    tokio::spawn(async move {
                        handle_connection(stream, state, dispatcher, workers, connection_cancel).await;
                    });
                },
                Err(e) => {
                    warn!(error = %e, "Failed to accept RPC connection");
                },
            },
        }
    }
}

/// Per-connection subscription bookkeeping.
type Subscriptions = Arc<Mutex<HashMap<SubscriberId, tokio::task::JoinHandle<()>>>>;

async fn handle_connection(
    stream: UnixStream,
    state: Arc<BridgeState>,
    dispatcher: Dispatcher,
    workers: Arc<Semaphore>,
    cancel: CancellationToken,
) {
    let peer = stream.peer_cred().ok();
    let uid = peer.as_ref().map_or(u32::MAX, tokio::net::unix::UCred::uid);
    let pid = peer.as_ref().and_then(tokio::net::unix::UCred::pid);
    debug!(uid, ?pid, "RPC connection accepted");

    let (read_half, write_half) = stream.into_split();

    // Writer task: everything the connection sends funnels through here so
    // responses and notifications are each a single uninterleaved line.
    let (line_tx, mut line_rx) = mpsc::channel::<String>(256);
    let writer_cancel = cancel.clone();
    let writer = tokio::spawn(async move {
        let mut writer = BufWriter::new(write_half);
        loop {
            tokio::select! {
                biased;
                () = writer_cancel.cancelled() => break,
                line = line_rx.recv() => {
                    let Some(mut line) = line else { break };
                    line.push('\n');
                    if writer.write_all(line.as_bytes()).await.is_err() {
                        break;
                    }
                    if writer.flush().await.is_err() {
                        break;
                    }
                },
            }
        }
    });

    let subscriptions: Subscriptions = Arc::new(Mutex::new(HashMap::new()));
    let mut lines = FramedRead::new(
        read_half,
        LinesCodec::new_with_max_length(MAX_TOLERATED_LINE_BYTES),
    );

    loop {
        let line = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            line = lines.next() => line,
        };
        let Some(line) = line else { break };
        let line = match line {
            Ok(line) => line,
            Err(e) => {
                // Oversize or broken framing: answer once, then drop.
                warn!(uid, error = %e, "RPC framing error — closing connection");
                let _ = line_tx
                    .send(error_line(Value::Null, error_codes::INVALID_REQUEST, "oversize or malformed line", None))
                    .await;
                break;
            },
        };
        if line.trim().is_empty() {
            continue;
        }

        let request: Request = match serde_json::from_str(&line) {
            Ok(request) => request,
            Err(e) => {
                let _ = line_tx
                    .send(error_line(Value::Null, error_codes::PARSE_ERROR, &format!("parse error: {e}"), None))
                    .await;
                continue;
            },
        };

        let id = request.id.clone().unwrap_or(Value::Null);
        if request.jsonrpc != "2.0" {
            let _ = line_tx
                .send(error_line(id, error_codes::INVALID_REQUEST, "jsonrpc must be \"2.0\"", None))
                .await;
            continue;
        }
        if line.len() > MAX_LINE_BYTES && request.method != "attach_config" {
            let _ = line_tx
                .send(error_line(
                    id,
                    error_codes::INVALID_REQUEST,
                    &format!("request exceeds the {MAX_LINE_BYTES} byte limit"),
                    None,
                ))
                .await;
            continue;
        }

        // Subscription management binds to this connection's writer and
        // cannot run on the worker pool.
        match request.method.as_str() {
            "subscribe" => {
                handle_subscribe(&state, &subscriptions, &line_tx, request, &cancel).await;
                continue;
            },
            "unsubscribe" => {
                handle_unsubscribe(&state, &subscriptions, &line_tx, request).await;
                continue;
            },
            _ => {},
        }

        let dispatcher = dispatcher.clone();
        let line_tx = line_tx.clone();
        let workers = Arc::clone(&workers);
        let handler_timeout = std::time::Duration::from_secs(state.config.server.handler_timeout);
        let ctx = CallContext::socket(uid, pid, cancel.child_token());
        tokio::spawn(async move {
            let _permit = match workers.acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => return,
            };

            let params = request.params.unwrap_or(Value::Null);
            let outcome = tokio::time::timeout(
                handler_timeout,
                dispatcher.dispatch(&ctx, &request.method, params),
            )
            .await;

            let Some(id) = request.id else {
                return; // Notification: no response on the wire.
            };
            let line = match outcome {
                Ok(Ok(result)) => result_line(id, &result),
                Ok(Err(failure)) => {
                    error_line(id, failure.code, &failure.message, failure.report.as_ref().map(|r| json!(r)))
                },
                Err(_) => error_line(
                    id,
                    error_codes::INTERNAL_ERROR,
                    "handler timed out",
                    None,
                ),
            };
            let _ = line_tx.send(line).await;
        });
    }

    // Connection gone: tear down its subscriptions and writer.
    let mut subs = subscriptions.lock().await;
    for (subscriber_id, forwarder) in subs.drain() {
        state.bus.unsubscribe(subscriber_id);
        forwarder.abort();
    }
    drop(subs);
    drop(line_tx);
    let _ = writer.await;
    debug!(uid, "RPC connection closed");
}

async fn handle_subscribe(
    state: &Arc<BridgeState>,
    subscriptions: &Subscriptions,
    line_tx: &mpsc::Sender<String>,
    request: Request,
    cancel: &CancellationToken,
) {
    let filter: EventFilter = match request.params {
        Some(params) if !params.is_null() => {
            let filter = params.get("filter").cloned().unwrap_or(params);
            match serde_json::from_value(filter) {
                Ok(filter) => filter,
                Err(e) => {
                    if let Some(id) = request.id {
                        let _ = line_tx
                            .send(error_line(id, error_codes::INVALID_PARAMS, &format!("invalid filter: {e}"), None))
                            .await;
                    }
                    return;
                },
            }
        },
        _ => EventFilter::all(),
    };

    let mut receiver = state.bus.subscribe(filter);
    let subscriber_id = receiver.id();

    let forward_tx = line_tx.clone();
    let forward_cancel = cancel.clone();
    let forwarder = tokio::spawn(async move {
        loop {
            tokio::select! {
                biased;
                () = forward_cancel.cancelled() => break,
                delivery = receiver.recv() => {
                    let Some(delivery) = delivery else { break };
                    let notification = json!({
                        "jsonrpc": "2.0",
                        "method": "event",
                        "params": {
                            "subscriber_id": subscriber_id,
                            "sequence": delivery.sequence,
                            "received": delivery.received.to_rfc3339(),
                            "event": delivery.event,
                        },
                    });
                    if forward_tx.send(notification.to_string()).await.is_err() {
                        break;
                    }
                },
            }
        }
    });

    subscriptions.lock().await.insert(subscriber_id, forwarder);
    if let Some(id) = request.id {
        let _ = line_tx
            .send(result_line(id, &json!({"subscriber_id": subscriber_id})))
            .await;
    }
    debug!(subscriber = %subscriber_id, "RPC connection subscribed");
}

async fn handle_unsubscribe(
    state: &Arc<BridgeState>,
    subscriptions: &Subscriptions,
    line_tx: &mpsc::Sender<String>,
    request: Request,
) {
    let subscriber_id = request
        .params
        .as_ref()
        .and_then(|p| p.get("subscriber_id"))
        .and_then(Value::as_str)
        .and_then(|raw| raw.parse::<SubscriberId>().ok());

    let Some(subscriber_id) = subscriber_id else {
        if let Some(id) = request.id {
            let _ = line_tx
                .send(error_line(id, error_codes::INVALID_PARAMS, "subscriber_id required", None))
                .await;
        }
        return;
    };

    let removed = state.bus.unsubscribe(subscriber_id);
    if let Some(forwarder) = subscriptions.lock().await.remove(&subscriber_id) {
        forwarder.abort();
    }
    if let Some(id) = request.id {
        let _ = line_tx
            .send(result_line(id, &json!({"unsubscribed": removed})))
            .await;
    }
}

fn result_line(id: Value, result: &Value) -> String {
    json!({"jsonrpc": "2.0", "id": id, "result": result}).to_string()
}

fn error_line(id: Value, code: i64, message: &str, data: Option<Value>) -> String {
    let mut error = json!({"code": code, "message": message});
    if let Some(data) = data {
        error["data"] = data;
    }
    json!({"jsonrpc": "2.0", "id": id, "error": error}).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::test_support::test_dispatcher;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

    async fn serve() -> (std::path::PathBuf, tempfile::TempDir, CancellationToken) {
        let (dispatcher, dir) = test_dispatcher(|_| {}).await;
        let state = Arc::clone(&dispatcher.state);
        let listener = bind_socket(&state).unwrap();
        let path = state.config.server.socket_path.clone();
        let cancel = CancellationToken::new();
        tokio::spawn(run_socket_server(listener, state, dispatcher, cancel.clone()));
        (path, dir, cancel)
    }

    async fn call(path: &std::path::Path, line: &str) -> Value {
        let mut stream = UnixStream::connect(path).await.unwrap();
        stream.write_all(line.as_bytes()).await.unwrap();
        stream.write_all(b"\n").await.unwrap();

        let mut reader = BufReader::new(stream);
        let mut response = String::new();
        reader.read_line(&mut response).await.unwrap();
        serde_json::from_str(&response).unwrap()
    }

    #[tokio::test]
    async fn test_request_response_roundtrip() {
        let (path, _dir, _cancel) = serve().await;
        let response = call(&path, r#"{"jsonrpc":"2.0","id":1,"method":"status"}"#).await;
        assert_eq!(response["id"], 1);
        assert!(response["result"]["version"].is_string());
    }

    #[tokio::test]
    async fn test_response_id_matches_string_ids() {
        let (path, _dir, _cancel) = serve().await;
        let response = call(&path, r#"{"jsonrpc":"2.0","id":"req-9","method":"health"}"#).await;
        assert_eq!(response["id"], "req-9");
        assert_eq!(response["result"]["status"], "ok");
    }

    #[tokio::test]
    async fn test_parse_error() {
        let (path, _dir, _cancel) = serve().await;
        let response = call(&path, "{not json").await;
        assert_eq!(response["error"]["code"], error_codes::PARSE_ERROR);
    }

    #[tokio::test]
    async fn test_unknown_method_error_carries_id() {
        let (path, _dir, _cancel) = serve().await;
        let response = call(&path, r#"{"jsonrpc":"2.0","id":7,"method":"nope"}"#).await;
        assert_eq!(response["id"], 7);
        assert_eq!(response["error"]["code"], error_codes::METHOD_NOT_FOUND);
    }

    #[tokio::test]
    async fn test_bad_jsonrpc_version() {
        let (path, _dir, _cancel) = serve().await;
        let response = call(&path, r#"{"jsonrpc":"1.0","id":1,"method":"status"}"#).await;
        assert_eq!(response["error"]["code"], error_codes::INVALID_REQUEST);
    }

    #[tokio::test]
    async fn test_oversize_non_attach_request_rejected() {
        let (path, _dir, _cancel) = serve().await;
        let padding = "x".repeat(MAX_LINE_BYTES);
        let line = format!(
            r#"{{"jsonrpc":"2.0","id":1,"method":"status","params":{{"pad":"{padding}"}}}}"#
        );
        let response = call(&path, &line).await;
        assert_eq!(response["error"]["code"], error_codes::INVALID_REQUEST);
    }

    #[tokio::test]
    async fn test_error_data_carries_report() {
        let (path, _dir, _cancel) = serve().await;
        let response = call(
            &path,
            r#"{"jsonrpc":"2.0","id":2,"method":"attach_config","params":{"name":"../../etc/passwd","content":"x","encoding":"raw"}}"#,
        )
        .await;
        assert_eq!(response["error"]["code"], -32602);
        assert!(response["error"]["message"].as_str().unwrap().contains("traversal"));
        assert_eq!(response["error"]["data"]["code"], "RPC-002");
    }

    #[tokio::test]
    async fn test_subscribe_receives_notifications() {
        let (path, _dir, _cancel) = serve().await;
        let mut stream = UnixStream::connect(&path).await.unwrap();
        stream
            .write_all(b"{\"jsonrpc\":\"2.0\",\"id\":1,\"method\":\"subscribe\",\"params\":{\"filter\":{}}}\n")
            .await
            .unwrap();

        let (read_half, _write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);

        let mut line = String::new();
        reader.read_line(&mut line).await.unwrap();
        let response: Value = serde_json::from_str(&line).unwrap();
        let subscriber_id = response["result"]["subscriber_id"].as_str().unwrap().to_owned();
        assert!(!subscriber_id.is_empty());

        // A second client's command triggers container events? Simpler:
        // publish straight onto the bus.
        // (The bus handle lives in the server's state; reconnect to get it.)
        line.clear();

        // Trigger an event through a normal RPC from another connection.
        let other = call(
            &path,
            r#"{"jsonrpc":"2.0","id":9,"method":"store_key","params":{"id":"sub-test","provider":"custom","token":"tok"}}"#,
        )
        .await;
        assert_eq!(other["result"]["id"], "sub-test");

        // store_key does not publish bus events; start does. Start one.
        let started = call(&path, r#"{"jsonrpc":"2.0","id":10,"method":"start","params":{"key_id":"k1"}}"#).await;
        assert!(started["result"]["container_id"].is_string());

        // The subscriber connection now receives container_state notifications.
        tokio::time::timeout(std::time::Duration::from_secs(5), async {
            loop {
                line.clear();
                reader.read_line(&mut line).await.unwrap();
                let notification: Value = serde_json::from_str(&line).unwrap();
                if notification["method"] == "event"
                    && notification["params"]["event"]["kind"] == "container_state"
                {
                    assert!(notification.get("id").is_none(), "notifications carry no id");
                    break;
                }
            }
        })
        .await
        .expect("subscriber must receive container state events");
    }
}
