//! The inbound command router: chat events in, RPC dispatch, replies out.
//!
//! The sync loop forwards sigil-prefixed message bodies here. The router
//! parses them into dispatch records, runs them through the dispatcher
//! (where the zero-trust filter lives), and sends the outcome back to the
//! originating room.

use std::sync::Arc;

use palisade_events::ChatEvent;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::command::{self, CommandError};
use crate::rpc::{error_codes, CallContext, Dispatcher};
use crate::state::BridgeState;

/// Replies longer than this are truncated before hitting the room.
const MAX_REPLY_CHARS: usize = 4000;

/// All state the router task needs.
pub struct InboundRouterCtx {
    /// Shared daemon state.
    pub state: Arc<BridgeState>,
    /// The dispatcher (zero-trust included).
    pub dispatcher: Dispatcher,
    /// Command candidates from the sync loop.
    pub command_rx: mpsc::Receiver<ChatEvent>,
    /// Shutdown signal.
    pub cancel: CancellationToken,
}

/// Run the router until cancelled.
pub async fn run_inbound_router(mut ctx: InboundRouterCtx) {
    loop {
        tokio::select! {
            biased;
            () = ctx.cancel.cancelled() => {
                info!("Inbound router received shutdown signal");
                break;
            }
            event = ctx.command_rx.recv() => {
                let Some(event) = event else {
                    info!("Command channel closed — inbound router exiting");
                    break;
                };
                handle_command(&ctx, event).await;
            }
        }
    }
}

async fn handle_command(ctx: &InboundRouterCtx, event: ChatEvent) {
    let Some(body) = event.body() else { return };
    let sigil = &ctx.state.config.matrix.command_sigil;

    let parsed = match command::parse(body, sigil) {
        Ok(parsed) => parsed,
        Err(CommandError::NotACommand) => return,
        Err(e) => {
            debug!(sender = %event.sender, error = %e, "Command parse failure");
            reply(ctx, &event.room_id, &format!("⚠️ {e}")).await;
            return;
        },
    };

    let call_ctx = CallContext::chat(
        event.sender.clone(),
        event.room_id.clone(),
        ctx.cancel.child_token(),
    );

    match ctx
        .dispatcher
        .dispatch(&call_ctx, &parsed.method, parsed.params)
        .await
    {
        Ok(result) => {
            let rendered = serde_json::to_string_pretty(&result).unwrap_or_else(|_| "ok".to_owned());
            reply(ctx, &event.room_id, &format!("✅ {}\n```\n{rendered}\n```", parsed.method)).await;
        },
        Err(failure) if failure.code == error_codes::ACCESS_DENIED => {
            warn!(sender = %event.sender, method = %parsed.method, "Chat command rejected by policy");
            if ctx.state.policy.reject_untrusted {
                reply(
                    ctx,
                    &event.room_id,
                    &format!("⛔ command rejected: {} is not authorized", event.sender),
                )
                .await;
            }
        },
        Err(failure) => {
            let code = failure
                .report
                .as_ref()
                .map_or_else(|| failure.code.to_string(), |r| r.code.clone());
            reply(ctx, &event.room_id, &format!("❌ [{code}] {}", failure.message)).await;
        },
    }
}

async fn reply(ctx: &InboundRouterCtx, room_id: &str, message: &str) {
    let Some(client) = &ctx.state.matrix else {
        debug!("No chat client; dropping reply");
        return;
    };
    let message: String = if message.chars().count() > MAX_REPLY_CHARS {
        let mut truncated: String = message.chars().take(MAX_REPLY_CHARS).collect();
        truncated.push_str("…");
        truncated
    } else {
        message.to_owned()
    };
    if let Err(e) = client.send_message(room_id, &message, None).await {
        warn!(room = %room_id, error = %e, "Failed to send chat reply");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::test_support::test_dispatcher;

    fn command_event(sender: &str, body: &str) -> ChatEvent {
        ChatEvent {
            event_id: "$e".to_owned(),
            room_id: "!ops:ex".to_owned(),
            sender: sender.to_owned(),
            event_type: "m.room.message".to_owned(),
            content: serde_json::json!({"msgtype": "m.text", "body": body}),
            origin_server_ts: 0,
        }
    }

    async fn router_ctx(
        tweak: impl FnOnce(&mut palisade_config::Config),
    ) -> (InboundRouterCtx, mpsc::Sender<ChatEvent>, tempfile::TempDir) {
        let (dispatcher, dir) = test_dispatcher(tweak).await;
        let (command_tx, command_rx) = mpsc::channel(8);
        let ctx = InboundRouterCtx {
            state: Arc::clone(&dispatcher.state),
            dispatcher,
            command_rx,
            cancel: CancellationToken::new(),
        };
        (ctx, command_tx, dir)
    }

    #[tokio::test]
    async fn test_untrusted_command_audited_not_dispatched() {
        let (ctx, _tx, _dir) = router_ctx(|config| {
            config.zero_trust.trusted_senders = vec!["@alice:ex".to_owned()];
            config.zero_trust.reject_untrusted = true;
        })
        .await;

        handle_command(&ctx, command_event("@mallory:ex", "/status")).await;

        let denials = ctx.state.audit.recent(Some("access_denied"), 10);
        assert_eq!(denials.len(), 1);
        // No grant was recorded: the handler never ran.
        assert!(ctx.state.audit.recent(Some("access_granted"), 10).is_empty());
    }

    #[tokio::test]
    async fn test_trusted_command_dispatches() {
        let (ctx, _tx, _dir) = router_ctx(|config| {
            config.zero_trust.trusted_senders = vec!["@alice:ex".to_owned()];
        })
        .await;

        handle_command(&ctx, command_event("@alice:ex", "/status")).await;
        assert_eq!(ctx.state.audit.recent(Some("access_granted"), 10).len(), 1);
    }

    #[tokio::test]
    async fn test_start_via_chat_creates_container() {
        let (ctx, _tx, _dir) = router_ctx(|_| {}).await;
        handle_command(&ctx, command_event("@anyone:ex", "/start k1")).await;
        assert_eq!(ctx.state.manager.list().len(), 1);
    }

    #[tokio::test]
    async fn test_non_command_ignored() {
        let (ctx, _tx, _dir) = router_ctx(|_| {}).await;
        handle_command(&ctx, command_event("@anyone:ex", "just chatting")).await;
        assert!(ctx.state.audit.is_empty());
    }

    #[tokio::test]
    async fn test_router_exits_on_cancel() {
        let (ctx, _tx, _dir) = router_ctx(|_| {}).await;
        let cancel = ctx.cancel.clone();
        let handle = tokio::spawn(run_inbound_router(ctx));
        cancel.cancel();
        tokio::time::timeout(std::time::Duration::from_secs(5), handle)
            .await
            .expect("router must exit on cancel")
            .unwrap();
    }
}
