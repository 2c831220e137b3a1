//! Background tasks: the TTL reaper and the engine event consumer.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::manager::LifecycleManager;

/// Run the enforcement loop until cancelled.
///
/// Wakes on the configured check interval and applies idle and lifetime
/// policies to every live container. The sweep itself guarantees that an
/// error on one container does not abort the rest.
pub async fn run_reaper(manager: Arc<LifecycleManager>, cancel: CancellationToken) {
    let interval = manager.config().check_interval;
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => {
                info!("Reaper received shutdown signal");
                break;
            }
            _ = ticker.tick() => {
                manager.sweep().await;
            }
        }
    }
}

/// Consume the engine's best-effort event stream until cancelled.
///
/// A broken stream is re-subscribed after a short pause; the reaper's
/// polling covers the gap.
pub async fn run_engine_events(manager: Arc<LifecycleManager>, cancel: CancellationToken) {
    loop {
        let mut rx = match manager.engine().events(cancel.clone()).await {
            Ok(rx) => rx,
            Err(e) => {
                warn!(error = %e, "Engine event subscription failed; relying on polling");
                return;
            },
        };

        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    info!("Engine event consumer received shutdown signal");
                    return;
                }
                event = rx.recv() => match event {
                    Some(event) => manager.on_engine_event(&event),
                    None => break,
                },
            }
        }

        // Stream ended (engine restart). Pause briefly and resubscribe.
        tokio::select! {
            biased;
            () = cancel.cancelled() => return,
            () = tokio::time::sleep(std::time::Duration::from_secs(2)) => {},
        }
    }
}
