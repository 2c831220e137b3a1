//! Event payload types.

use palisade_core::{ContainerId, ContainerState, ErrorReport};
use serde::{Deserialize, Serialize};

/// One inbound event from the remote homeserver.
///
/// Never mutated after construction; the bus clones it into each delivery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatEvent {
    /// Homeserver-assigned event id.
    pub event_id: String,
    /// Room the event belongs to.
    pub room_id: String,
    /// Fully-qualified sender id (`@user:server`).
    pub sender: String,
    /// Wire type (`m.room.message`, `m.room.member`, …).
    pub event_type: String,
    /// Content object, msgtype and body preserved as received.
    pub content: serde_json::Value,
    /// Origin server timestamp, milliseconds.
    pub origin_server_ts: i64,
}

impl ChatEvent {
    /// The `body` field of the content, when present.
    #[must_use]
    pub fn body(&self) -> Option<&str> {
        self.content.get("body").and_then(|b| b.as_str())
    }

    /// The `msgtype` field of the content, when present.
    #[must_use]
    pub fn msgtype(&self) -> Option<&str> {
        self.content.get("msgtype").and_then(|m| m.as_str())
    }
}

/// Everything the bus can carry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BridgeEvent {
    /// Inbound chat event.
    Chat(ChatEvent),

    /// A managed container changed state.
    ContainerState {
        /// Internal container id.
        container_id: ContainerId,
        /// The new state.
        state: ContainerState,
        /// Why, when a reason is known (`idle_expired`, `engine_died`, …).
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },

    /// An error report of severity error or above.
    ErrorReport(ErrorReport),

    /// The budget tracker crossed a threshold.
    BudgetAlert {
        /// Scope description.
        scope: String,
        /// Spend in the triggering window.
        used: f64,
        /// The window's limit.
        limit: f64,
        /// Whether this was a hard denial rather than a warning.
        denied: bool,
    },
}

impl BridgeEvent {
    /// The type string filters match against: the wire type for chat
    /// events, the kind discriminant for everything else.
    #[must_use]
    pub fn event_type(&self) -> &str {
        match self {
            Self::Chat(chat) => &chat.event_type,
            Self::ContainerState { .. } => "container_state",
            Self::ErrorReport(_) => "error_report",
            Self::BudgetAlert { .. } => "budget_alert",
        }
    }

    /// The room id, for chat events.
    #[must_use]
    pub fn room_id(&self) -> Option<&str> {
        match self {
            Self::Chat(chat) => Some(&chat.room_id),
            _ => None,
        }
    }

    /// The sender, for chat events.
    #[must_use]
    pub fn sender(&self) -> Option<&str> {
        match self {
            Self::Chat(chat) => Some(&chat.sender),
            _ => None,
        }
    }
}
