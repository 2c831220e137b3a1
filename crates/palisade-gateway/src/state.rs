//! Shared daemon state.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Mutex;

use dashmap::DashMap;
use palisade_audit::AuditLog;
use palisade_budget::BudgetLedger;
use palisade_config::Config;
use palisade_core::{ErrorStore, Timestamp};
use palisade_events::{ChatEvent, EventBus};
use palisade_keystore::Keystore;
use palisade_matrix::MatrixClient;
use palisade_runtime::LifecycleManager;
use serde::Serialize;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::zerotrust::ZeroTrustPolicy;

/// How many recent chat events `matrix.receive` can page through.
const RECENT_CHAT_WINDOW: usize = 1000;

/// One configuration file pushed in over the chat channel or RPC.
#[derive(Debug, Clone, Serialize)]
pub struct AttachedConfig {
    /// Server-assigned id.
    pub config_id: String,
    /// Validated file name.
    pub name: String,
    /// Absolute path under `<runtime-dir>/configs/`.
    pub path: PathBuf,
    /// Size in bytes after decoding.
    pub size: usize,
    /// Declared type tag (`toml`, `json`, …) or `file`.
    #[serde(rename = "type")]
    pub content_type: String,
    /// When it was attached.
    pub attached_at: Timestamp,
}

/// Everything the RPC surface and background tasks share.
pub struct BridgeState {
    /// Full validated configuration.
    pub config: Config,
    /// Encrypted credential store.
    pub keystore: Arc<Keystore>,
    /// Container plane.
    pub manager: Arc<LifecycleManager>,
    /// Spend ledger.
    pub budget: Arc<BudgetLedger>,
    /// Security log.
    pub audit: Arc<AuditLog>,
    /// Error report ring.
    pub errors: Arc<ErrorStore>,
    /// Event bus.
    pub bus: Arc<EventBus>,
    /// Chat client, when the chat channel is enabled and logged in.
    pub matrix: Option<Arc<MatrixClient>>,
    /// Compiled zero-trust policy.
    pub policy: ZeroTrustPolicy,
    /// Daemon start time.
    pub started_at: Timestamp,
    /// Daemon-wide shutdown signal.
    pub cancel: CancellationToken,
    /// Attached configuration files by name.
    pub attached_configs: DashMap<String, AttachedConfig>,
    /// Ring of recent inbound chat events for `matrix.receive`.
    recent_chat: Mutex<VecDeque<ChatEvent>>,
}

impl std::fmt::Debug for BridgeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BridgeState")
            .field("started_at", &self.started_at)
            .finish_non_exhaustive()
    }
}

impl BridgeState {
    /// Assemble the shared state.
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Config,
        keystore: Arc<Keystore>,
        manager: Arc<LifecycleManager>,
        budget: Arc<BudgetLedger>,
        audit: Arc<AuditLog>,
        errors: Arc<ErrorStore>,
        bus: Arc<EventBus>,
        matrix: Option<Arc<MatrixClient>>,
        cancel: CancellationToken,
    ) -> Self {
        let policy = ZeroTrustPolicy::from_config(&config.zero_trust);
        Self {
            config,
            keystore,
            manager,
            budget,
            audit,
            errors,
            bus,
            matrix,
            policy,
            started_at: Timestamp::now(),
            cancel,
            attached_configs: DashMap::new(),
            recent_chat: Mutex::new(VecDeque::with_capacity(256)),
        }
    }

    /// The attached-configs directory.
    #[must_use]
    pub fn configs_dir(&self) -> PathBuf {
        self.config.server.runtime_dir.join("configs")
    }

    /// Record an inbound chat event for later `matrix.receive` queries.
    pub fn record_chat_event(&self, event: ChatEvent) {
        let mut window = self
            .recent_chat
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if window.len() >= RECENT_CHAT_WINDOW {
            window.pop_front();
        }
        window.push_back(event);
    }

    /// The most recent chat events, newest first, optionally per room.
    #[must_use]
    pub fn recent_chat_events(&self, room_id: Option<&str>, limit: usize) -> Vec<ChatEvent> {
        let window = self
            .recent_chat
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        window
            .iter()
            .rev()
            .filter(|e| room_id.is_none_or(|r| e.room_id == r))
            .take(limit)
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chat(room: &str, body: &str) -> ChatEvent {
        ChatEvent {
            event_id: format!("${body}"),
            room_id: room.to_owned(),
            sender: "@a:ex".to_owned(),
            event_type: "m.room.message".to_owned(),
            content: serde_json::json!({"body": body}),
            origin_server_ts: 0,
        }
    }

    #[test]
    fn test_recent_chat_window() {
        // Only the ring logic is under test; build the window directly.
        let window = Mutex::new(VecDeque::new());
        let state_like = |events: &[ChatEvent]| {
            let mut w = window.lock().unwrap();
            for e in events {
                if w.len() >= 3 {
                    w.pop_front();
                }
                w.push_back(e.clone());
            }
        };
        state_like(&[chat("!r1", "a"), chat("!r1", "b"), chat("!r2", "c"), chat("!r1", "d")]);
        let w = window.lock().unwrap();
        assert_eq!(w.len(), 3);
        assert_eq!(w.front().unwrap().event_id, "$b");
    }
}
