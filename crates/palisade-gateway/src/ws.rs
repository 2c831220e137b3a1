//! The WebSocket event server.
//!
//! A separate listener translating event-bus deliveries into a framed
//! JSON protocol. One subscription per connection; `ping` keeps an
//! otherwise-quiet connection alive past the inactivity timeout.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use palisade_core::SubscriberId;
use palisade_events::{EventFilter, EventReceiver};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::state::BridgeState;

/// One decoded client frame.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClientFrame {
    Subscribe {
        #[serde(default)]
        data: SubscribeData,
    },
    Unsubscribe {
        data: UnsubscribeData,
    },
    Ping,
}

#[derive(Debug, Default, Deserialize)]
struct SubscribeData {
    #[serde(default)]
    filter: EventFilter,
}

#[derive(Debug, Deserialize)]
struct UnsubscribeData {
    subscriber_id: String,
}

/// Bind the listener. Separated from the serve loop so the daemon can
/// surface bind failures at startup.
///
/// # Errors
///
/// Address parse and bind failures.
pub async fn bind_ws(state: &BridgeState) -> std::io::Result<TcpListener> {
    let listener = TcpListener::bind(&state.config.eventbus.websocket_addr).await?;
    info!(
        addr = %state.config.eventbus.websocket_addr,
        path = %state.config.eventbus.websocket_path,
        "WebSocket event server bound"
    );
    Ok(listener)
}

/// Run the accept loop until cancelled.
pub async fn run_ws_server(listener: TcpListener, state: Arc<BridgeState>, cancel: CancellationToken) {
    let connections = Arc::new(AtomicUsize::new(0));

    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => {
                info!("WebSocket server received shutdown signal");
                break;
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    debug!(%addr, "WebSocket connection accepted");
                    let state = Arc::clone(&state);
                    let cancel = cancel.child_token();
                    let connections = Arc::clone(&connections);
                    tokio::spawn(async move {
                        handle_connection(stream, state, cancel, connections).await;
                    });
                },
                Err(e) => warn!(error = %e, "WebSocket accept failed"),
            },
        }
    }
}

struct ConnectionGuard(Arc<AtomicUsize>);

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

async fn handle_connection(
    stream: TcpStream,
    state: Arc<BridgeState>,
    cancel: CancellationToken,
    connections: Arc<AtomicUsize>,
) {
    let expected_path = state.config.eventbus.websocket_path.clone();
    let path_check = move |request: &Request, response: Response| {
        if request.uri().path() == expected_path {
            Ok(response)
        } else {
            let mut rejection = ErrorResponse::new(Some("not found".to_owned()));
            *rejection.status_mut() = tokio_tungstenite::tungstenite::http::StatusCode::NOT_FOUND;
            Err(rejection)
        }
    };

    let ws = match tokio_tungstenite::accept_hdr_async(stream, path_check).await {
        Ok(ws) => ws,
        Err(e) => {
            debug!(error = %e, "WebSocket handshake rejected");
            return;
        },
    };

    let previous = connections.fetch_add(1, Ordering::SeqCst);
    let _guard = ConnectionGuard(Arc::clone(&connections));
    if previous >= state.config.eventbus.max_subscribers {
        let mut ws = ws;
        let _ = ws
            .send(Message::Text(
                error_frame("max_subscribers", "subscriber limit reached").to_string().into(),
            ))
            .await;
        let _ = ws.close(None).await;
        return;
    }

    serve_subscriber(ws, state, cancel).await;
}

async fn serve_subscriber(
    mut ws: WebSocketStream<TcpStream>,
    state: Arc<BridgeState>,
    cancel: CancellationToken,
) {
    let inactivity = Duration::from_secs(state.config.eventbus.inactivity_timeout);
    let mut deadline = tokio::time::Instant::now() + inactivity;
    let mut subscription: Option<EventReceiver> = None;
    let mut subscriber_id: Option<SubscriberId> = None;

    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => {
                let _ = ws.close(None).await;
                break;
            }

            () = tokio::time::sleep_until(deadline) => {
                debug!("WebSocket connection idle past the inactivity timeout");
                let _ = ws
                    .send(Message::Close(Some(tokio_tungstenite::tungstenite::protocol::CloseFrame {
                        code: tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode::Normal,
                        reason: "inactivity".into(),
                    })))
                    .await;
                break;
            }

            delivery = recv_event(&mut subscription) => {
                match delivery {
                    Some(delivery) => {
                        deadline = tokio::time::Instant::now() + inactivity;
                        let frame = json!({
                            "type": "event",
                            "data": {
                                "event": delivery.event,
                                "received": delivery.received.to_rfc3339(),
                                "sequence": delivery.sequence,
                            },
                        });
                        if ws.send(Message::Text(frame.to_string().into())).await.is_err() {
                            break;
                        }
                    },
                    None => {
                        // The bus dropped us: the queue overflowed.
                        let _ = ws
                            .send(Message::Text(
                                error_frame("slow_consumer", "delivery queue overflowed").to_string().into(),
                            ))
                            .await;
                        let _ = ws.close(None).await;
                        break;
                    },
                }
            }

            message = ws.next() => {
                let Some(message) = message else { break };
                let message = match message {
                    Ok(m) => m,
                    Err(e) => {
                        debug!(error = %e, "WebSocket receive error");
                        break;
                    },
                };
                deadline = tokio::time::Instant::now() + inactivity;

                match message {
                    Message::Text(text) => {
                        if let Some(response) = handle_frame(
                            &state,
                            &mut subscription,
                            &mut subscriber_id,
                            text.as_str(),
                        ) && ws.send(Message::Text(response.to_string().into())).await.is_err() {
                            break;
                        }
                    },
                    Message::Close(_) => break,
                    Message::Ping(_) | Message::Pong(_) | Message::Binary(_) | Message::Frame(_) => {},
                }
            }
        }
    }

    if let Some(subscriber_id) = subscriber_id {
        state.bus.unsubscribe(subscriber_id);
    }
    debug!("WebSocket connection closed");
}

/// Await the next bus delivery, or never resolve when unsubscribed.
async fn recv_event(
    subscription: &mut Option<EventReceiver>,
) -> Option<std::sync::Arc<palisade_events::SequencedEvent>> {
    match subscription {
        Some(receiver) => receiver.recv().await,
        None => std::future::pending().await,
    }
}

fn handle_frame(
    state: &BridgeState,
    subscription: &mut Option<EventReceiver>,
    subscriber_id: &mut Option<SubscriberId>,
    text: &str,
) -> Option<Value> {
    let frame: ClientFrame = match serde_json::from_str(text) {
        Ok(frame) => frame,
        Err(e) => return Some(error_frame("bad_frame", &format!("unparseable frame: {e}"))),
    };

    match frame {
        ClientFrame::Ping => Some(json!({"type": "pong"})),

        ClientFrame::Subscribe { data } => {
            if subscription.is_some() {
                return Some(error_frame("already_subscribed", "one subscription per connection"));
            }
            let receiver = state.bus.subscribe(data.filter);
            let id = receiver.id();
            *subscription = Some(receiver);
            *subscriber_id = Some(id);
            debug!(subscriber = %id, "WebSocket subscriber registered");
            Some(json!({"type": "subscribed", "data": {"subscriber_id": id}}))
        },

        ClientFrame::Unsubscribe { data } => {
            let Ok(requested) = data.subscriber_id.parse::<SubscriberId>() else {
                return Some(error_frame("bad_subscriber_id", "unparseable subscriber id"));
            };
            if *subscriber_id != Some(requested) {
                return Some(error_frame("unknown_subscriber", "not this connection's subscription"));
            }
            state.bus.unsubscribe(requested);
            *subscription = None;
            *subscriber_id = None;
            Some(json!({"type": "unsubscribed", "data": {"subscriber_id": requested}}))
        },
    }
}

fn error_frame(code: &str, message: &str) -> Value {
    json!({"type": "error", "data": {"code": code, "message": message}})
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::test_support::test_dispatcher;
    use futures::{SinkExt, StreamExt};
    use palisade_events::{BridgeEvent, ChatEvent};

    async fn serve() -> (String, Arc<BridgeState>, tempfile::TempDir, CancellationToken) {
        let (dispatcher, dir) = test_dispatcher(|config| {
            config.eventbus.websocket_enabled = true;
            config.eventbus.websocket_addr = "127.0.0.1:0".to_owned();
        })
        .await;
        let state = Arc::clone(&dispatcher.state);

        let listener = bind_ws(&state).await.unwrap();
        let addr = listener.local_addr().unwrap();
        let cancel = CancellationToken::new();
        tokio::spawn(run_ws_server(listener, Arc::clone(&state), cancel.clone()));
        (format!("ws://{addr}/events"), state, dir, cancel)
    }

    fn chat(room: &str, event_type: &str) -> BridgeEvent {
        BridgeEvent::Chat(ChatEvent {
            event_id: "$e".to_owned(),
            room_id: room.to_owned(),
            sender: "@a:ex".to_owned(),
            event_type: event_type.to_owned(),
            content: json!({"msgtype": "m.text", "body": "x"}),
            origin_server_ts: 0,
        })
    }

    async fn next_json(
        ws: &mut WebSocketStream<tokio_tungstenite::MaybeTlsStream<TcpStream>>,
    ) -> Value {
        loop {
            let message = tokio::time::timeout(Duration::from_secs(5), ws.next())
                .await
                .expect("frame within timeout")
                .expect("stream open")
                .expect("frame ok");
            if let Message::Text(text) = message {
                return serde_json::from_str(text.as_str()).unwrap();
            }
        }
    }

    #[tokio::test]
    async fn test_subscribe_filter_and_sequence() {
        let (url, state, _dir, _cancel) = serve().await;

        let (mut a, _) = tokio_tungstenite::connect_async(&url).await.unwrap();
        a.send(Message::Text(
            json!({"type": "subscribe", "data": {"filter": {"room_id": "!r1"}}}).to_string().into(),
        ))
        .await
        .unwrap();
        let subscribed = next_json(&mut a).await;
        assert_eq!(subscribed["type"], "subscribed");

        let (mut b, _) = tokio_tungstenite::connect_async(&url).await.unwrap();
        b.send(Message::Text(
            json!({"type": "subscribe", "data": {"filter": {"event_types": ["m.room.member"]}}})
                .to_string()
                .into(),
        ))
        .await
        .unwrap();
        let subscribed = next_json(&mut b).await;
        assert_eq!(subscribed["type"], "subscribed");

        state.bus.publish(chat("!r1", "m.room.message"));
        state.bus.publish(chat("!r2", "m.room.member"));

        let got_a = next_json(&mut a).await;
        assert_eq!(got_a["type"], "event");
        assert_eq!(got_a["data"]["event"]["room_id"], "!r1");

        let got_b = next_json(&mut b).await;
        assert_eq!(got_b["data"]["event"]["event_type"], "m.room.member");
        assert_eq!(got_b["data"]["event"]["room_id"], "!r2");

        // Sequences are strictly increasing bus-wide.
        assert!(got_b["data"]["sequence"].as_u64() > got_a["data"]["sequence"].as_u64());
    }

    #[tokio::test]
    async fn test_ping_pong() {
        let (url, _state, _dir, _cancel) = serve().await;
        let (mut ws, _) = tokio_tungstenite::connect_async(&url).await.unwrap();
        ws.send(Message::Text(json!({"type": "ping"}).to_string().into()))
            .await
            .unwrap();
        let pong = next_json(&mut ws).await;
        assert_eq!(pong["type"], "pong");
    }

    #[tokio::test]
    async fn test_inactivity_closes_with_reason() {
        let (dispatcher, _dir) = test_dispatcher(|config| {
            config.eventbus.websocket_enabled = true;
            config.eventbus.websocket_addr = "127.0.0.1:0".to_owned();
            config.eventbus.inactivity_timeout = 1;
        })
        .await;
        let state = Arc::clone(&dispatcher.state);
        let listener = bind_ws(&state).await.unwrap();
        let addr = listener.local_addr().unwrap();
        let cancel = CancellationToken::new();
        tokio::spawn(run_ws_server(listener, state, cancel.clone()));

        let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/events"))
            .await
            .unwrap();

        // A ping resets the timer once.
        ws.send(Message::Text(json!({"type": "ping"}).to_string().into()))
            .await
            .unwrap();
        assert_eq!(next_json(&mut ws).await["type"], "pong");

        // Then go quiet and expect the inactivity close.
        let closed = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                match ws.next().await {
                    Some(Ok(Message::Close(frame))) => return frame,
                    Some(Ok(_)) => {},
                    Some(Err(_)) | None => return None,
                }
            }
        })
        .await
        .expect("close within the timeout window");

        let frame = closed.expect("server sends a close frame");
        assert_eq!(frame.reason.as_str(), "inactivity");
    }

    #[tokio::test]
    async fn test_wrong_path_rejected() {
        let (url, _state, _dir, _cancel) = serve().await;
        let bad_url = url.replace("/events", "/nope");
        assert!(tokio_tungstenite::connect_async(&bad_url).await.is_err());
    }

    #[tokio::test]
    async fn test_double_subscribe_rejected() {
        let (url, _state, _dir, _cancel) = serve().await;
        let (mut ws, _) = tokio_tungstenite::connect_async(&url).await.unwrap();

        let subscribe = json!({"type": "subscribe", "data": {"filter": {}}}).to_string();
        ws.send(Message::Text(subscribe.clone().into())).await.unwrap();
        assert_eq!(next_json(&mut ws).await["type"], "subscribed");

        ws.send(Message::Text(subscribe.into())).await.unwrap();
        let error = next_json(&mut ws).await;
        assert_eq!(error["type"], "error");
        assert_eq!(error["data"]["code"], "already_subscribed");
    }

    #[tokio::test]
    async fn test_unsubscribe_roundtrip() {
        let (url, _state, _dir, _cancel) = serve().await;
        let (mut ws, _) = tokio_tungstenite::connect_async(&url).await.unwrap();

        ws.send(Message::Text(
            json!({"type": "subscribe", "data": {"filter": {}}}).to_string().into(),
        ))
        .await
        .unwrap();
        let subscribed = next_json(&mut ws).await;
        let subscriber_id = subscribed["data"]["subscriber_id"].as_str().unwrap().to_owned();

        ws.send(Message::Text(
            json!({"type": "unsubscribe", "data": {"subscriber_id": subscriber_id}})
                .to_string()
                .into(),
        ))
        .await
        .unwrap();
        let unsubscribed = next_json(&mut ws).await;
        assert_eq!(unsubscribed["type"], "unsubscribed");
    }
}
