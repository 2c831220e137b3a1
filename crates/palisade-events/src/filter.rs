//! Per-subscriber event filters.

use serde::{Deserialize, Serialize};

use crate::event::BridgeEvent;

/// Filter evaluated at publish time for each subscriber.
///
/// Empty fields match everything; a fully-empty filter is a firehose.
/// A room or sender constraint can only be satisfied by chat events —
/// non-chat events carry neither and are filtered out.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EventFilter {
    /// Exact room id.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub room_id: Option<String>,
    /// Exact sender id.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sender: Option<String>,
    /// Wire-type set membership.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_types: Option<Vec<String>>,
}

impl EventFilter {
    /// A filter that matches every event.
    #[must_use]
    pub fn all() -> Self {
        Self::default()
    }

    /// Whether `event` passes this filter.
    #[must_use]
    pub fn matches(&self, event: &BridgeEvent) -> bool {
        if let Some(room_id) = &self.room_id
            && event.room_id() != Some(room_id.as_str())
        {
            return false;
        }
        if let Some(sender) = &self.sender
            && event.sender() != Some(sender.as_str())
        {
            return false;
        }
        if let Some(types) = &self.event_types
            && !types.iter().any(|t| t == event.event_type())
        {
            return false;
        }
        true
    }
}
