//! The long-poll sync loop.

use std::sync::Arc;
use std::time::Instant;

use palisade_core::{codes, ErrorReport, ErrorStore, Severity};
use palisade_events::{BridgeEvent, ChatEvent, EventBus};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backoff::Backoff;
use crate::client::MatrixClient;
use crate::types::RetryPolicy;

/// Predicate deciding whether an invite from this sender is accepted.
pub type InviteFilter = Arc<dyn Fn(&str) -> bool + Send + Sync>;

/// A failed sync lasting at least this long counts as a sustained timeout.
const SUSTAINED_TIMEOUT_SECS: u64 = 60;

/// Backoff cap.
const MAX_BACKOFF_MS: u64 = 60_000;

/// All state the sync loop task needs.
pub struct SyncLoopCtx {
    /// The logged-in client.
    pub client: Arc<MatrixClient>,
    /// Bus every inbound event is published to.
    pub bus: Arc<EventBus>,
    /// Sigil-prefixed message bodies are forwarded here for command
    /// parsing, in addition to the bus publication.
    pub command_tx: mpsc::Sender<ChatEvent>,
    /// The command sigil.
    pub sigil: String,
    /// Our own user id; our outbound messages are never treated as
    /// commands.
    pub own_user_id: Option<String>,
    /// Server-side long-poll window per sync, seconds.
    pub sync_timeout_secs: u64,
    /// Backoff policy.
    pub retry: RetryPolicy,
    /// Rooms to join on startup.
    pub auto_rooms: Vec<String>,
    /// Invite acceptance predicate. `None` ignores all invites.
    pub invite_filter: Option<InviteFilter>,
    /// Error report sink.
    pub errors: Arc<ErrorStore>,
    /// Shutdown signal.
    pub cancel: CancellationToken,
}

/// Run the sync loop until cancelled.
///
/// Joined-room timeline events are processed in order per room: command
/// candidates are handed to the dispatcher channel, and every event is
/// published to the bus. Failures back off exponentially with full jitter;
/// sustained failure bursts are materialized as MAT reports.
pub async fn run_sync_loop(ctx: SyncLoopCtx) {
    for room in &ctx.auto_rooms {
        match ctx.client.join_room(room).await {
            Ok(room_id) => info!(room_id = %room_id, "Joined configured room"),
            Err(e) => warn!(room = %room, error = %e, "Failed to join configured room"),
        }
    }

    let mut since: Option<String> = None;
    let mut backoff = Backoff::new(
        ctx.retry.retry_delay_secs.saturating_mul(1000),
        MAX_BACKOFF_MS,
        ctx.retry.backoff_multiplier,
    );

    loop {
        let sync_started = Instant::now();
        let outcome = tokio::select! {
            biased;
            () = ctx.cancel.cancelled() => {
                info!("Sync loop received shutdown signal");
                break;
            }
            outcome = ctx.client.sync(since.as_deref(), ctx.sync_timeout_secs) => outcome,
        };

        match outcome {
            Ok(batch) => {
                backoff.reset();
                since = Some(batch.next_batch.clone());

                for invite in &batch.invites {
                    handle_invite(&ctx, &invite.room_id, invite.inviter.as_deref()).await;
                }

                for event in batch.events {
                    if is_command(&ctx, &event) {
                        // The dispatcher owns validation; a full or closed
                        // channel drops the command but never the bus copy.
                        if let Err(e) = ctx.command_tx.try_send(event.clone()) {
                            warn!(error = %e, "Command channel rejected inbound command");
                        }
                    }
                    ctx.bus.publish(BridgeEvent::Chat(event));
                }
            },
            Err(e) => {
                let elapsed = sync_started.elapsed().as_secs();
                warn!(error = %e, attempts = backoff.attempts(), "Sync failed");

                if elapsed >= SUSTAINED_TIMEOUT_SECS {
                    ctx.errors.record(
                        ErrorReport::new(codes::MAT_SYNC_TIMEOUT, "matrix::sync", e.to_string())
                            .with_severity(Severity::Warning)
                            .with_state("elapsed_secs", i64::try_from(elapsed).unwrap_or(i64::MAX))
                            .retryable(),
                    );
                } else if backoff.attempts().saturating_add(1) >= ctx.retry.max_retries {
                    let report = ErrorReport::new(codes::MAT_CONNECTION, "matrix::sync", e.to_string())
                        .with_state("consecutive_failures", i64::from(backoff.attempts().saturating_add(1)))
                        .with_remediation("check homeserver reachability and credentials")
                        .retryable();
                    ctx.bus.publish(BridgeEvent::ErrorReport(report.clone()));
                    ctx.errors.record(report);
                }

                let delay = backoff.next_delay();
                debug!(delay_ms = delay.as_millis() as u64, "Backing off before next sync");
                tokio::select! {
                    biased;
                    () = ctx.cancel.cancelled() => break,
                    () = tokio::time::sleep(delay) => {},
                }
            },
        }
    }

    info!("Sync loop stopped");
}

fn is_command(ctx: &SyncLoopCtx, event: &ChatEvent) -> bool {
    if event.event_type != "m.room.message" {
        return false;
    }
    if ctx.own_user_id.as_deref() == Some(event.sender.as_str()) {
        return false;
    }
    event
        .body()
        .is_some_and(|body| body.starts_with(&ctx.sigil))
}

async fn handle_invite(ctx: &SyncLoopCtx, room_id: &str, inviter: Option<&str>) {
    let Some(filter) = &ctx.invite_filter else {
        debug!(room_id = %room_id, "Ignoring invite (no invite filter configured)");
        return;
    };
    let Some(inviter) = inviter else {
        warn!(room_id = %room_id, "Ignoring invite without inviter");
        return;
    };
    if !filter(inviter) {
        warn!(room_id = %room_id, inviter = %inviter, "Ignoring invite from untrusted sender");
        return;
    }
    match ctx.client.join_room(room_id).await {
        Ok(_) => info!(room_id = %room_id, inviter = %inviter, "Accepted room invite"),
        Err(e) => warn!(room_id = %room_id, error = %e, "Failed to join invited room"),
    }
}
