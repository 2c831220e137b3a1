//! Wire and session types for the chat adapter.

use palisade_events::ChatEvent;
use serde::Deserialize;

/// A logged-in session.
#[derive(Clone)]
pub struct LoginSession {
    /// Fully-qualified user id the homeserver resolved.
    pub user_id: String,
    /// Access token for subsequent requests.
    pub access_token: String,
    /// Device id, server-assigned when not provided.
    pub device_id: String,
}

impl std::fmt::Debug for LoginSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoginSession")
            .field("user_id", &self.user_id)
            .field("device_id", &self.device_id)
            .finish_non_exhaustive()
    }
}

/// Backoff policy for the sync loop.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Consecutive failures before a sustained-failure report is raised.
    pub max_retries: u32,
    /// Base delay in seconds.
    pub retry_delay_secs: u64,
    /// Multiplier applied per attempt.
    pub backoff_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            retry_delay_secs: 1,
            backoff_multiplier: 2.0,
        }
    }
}

/// One processed `/sync` response.
#[derive(Debug, Clone)]
pub struct SyncBatch {
    /// Token to pass as `since` on the next sync.
    pub next_batch: String,
    /// Timeline events of joined rooms, in per-room timeline order.
    pub events: Vec<ChatEvent>,
    /// Rooms the account was invited to, with the inviter when known.
    pub invites: Vec<RoomInvite>,
}

/// An invite seen during sync.
#[derive(Debug, Clone)]
pub struct RoomInvite {
    /// The invited room.
    pub room_id: String,
    /// The inviting sender, when the stripped state carried one.
    pub inviter: Option<String>,
}

// ---------------------------------------------------------------------------
// Raw wire shapes (deserialization only)
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub(crate) struct RawLoginResponse {
    pub(crate) user_id: String,
    pub(crate) access_token: String,
    pub(crate) device_id: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct RawSyncResponse {
    pub(crate) next_batch: String,
    #[serde(default)]
    pub(crate) rooms: RawRooms,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct RawRooms {
    #[serde(default)]
    pub(crate) join: std::collections::BTreeMap<String, RawJoinedRoom>,
    #[serde(default)]
    pub(crate) invite: std::collections::BTreeMap<String, RawInvitedRoom>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct RawJoinedRoom {
    #[serde(default)]
    pub(crate) timeline: RawTimeline,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct RawTimeline {
    #[serde(default)]
    pub(crate) events: Vec<RawTimelineEvent>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct RawTimelineEvent {
    pub(crate) event_id: String,
    pub(crate) sender: String,
    #[serde(rename = "type")]
    pub(crate) event_type: String,
    #[serde(default)]
    pub(crate) content: serde_json::Value,
    #[serde(default)]
    pub(crate) origin_server_ts: i64,
}

#[derive(Debug, Deserialize)]
pub(crate) struct RawInvitedRoom {
    #[serde(default)]
    pub(crate) invite_state: RawInviteState,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct RawInviteState {
    #[serde(default)]
    pub(crate) events: Vec<RawStrippedEvent>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct RawStrippedEvent {
    #[serde(rename = "type")]
    pub(crate) event_type: String,
    #[serde(default)]
    pub(crate) sender: Option<String>,
    #[serde(default)]
    pub(crate) content: serde_json::Value,
}

#[derive(Debug, Deserialize)]
pub(crate) struct RawErrorBody {
    #[serde(default)]
    pub(crate) errcode: Option<String>,
    #[serde(default)]
    pub(crate) error: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct RawEventIdResponse {
    pub(crate) event_id: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct RawUploadResponse {
    pub(crate) content_uri: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct RawJoinedRoomsResponse {
    pub(crate) joined_rooms: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_login_session_debug_redacts_token() {
        let session = LoginSession {
            user_id: "@bridge:ex".to_owned(),
            access_token: "syt_secret".to_owned(),
            device_id: "DEV".to_owned(),
        };
        let debug = format!("{session:?}");
        assert!(!debug.contains("syt_secret"));
    }

    #[test]
    fn test_sync_response_parses() {
        let raw: RawSyncResponse = serde_json::from_str(
            r#"{
                "next_batch": "s72595_4483_1934",
                "rooms": {
                    "join": {
                        "!r1:ex": {
                            "timeline": {
                                "events": [
                                    {
                                        "event_id": "$e1",
                                        "sender": "@alice:ex",
                                        "type": "m.room.message",
                                        "content": {"msgtype": "m.text", "body": "hi"},
                                        "origin_server_ts": 1700000000000
                                    }
                                ]
                            }
                        }
                    },
                    "invite": {
                        "!r2:ex": {
                            "invite_state": {
                                "events": [
                                    {"type": "m.room.member", "sender": "@bob:ex", "content": {"membership": "invite"}}
                                ]
                            }
                        }
                    }
                }
            }"#,
        )
        .unwrap();
        assert_eq!(raw.next_batch, "s72595_4483_1934");
        assert_eq!(raw.rooms.join.len(), 1);
        assert_eq!(raw.rooms.invite.len(), 1);
    }

    #[test]
    fn test_minimal_sync_response_parses() {
        let raw: RawSyncResponse = serde_json::from_str(r#"{"next_batch": "s1"}"#).unwrap();
        assert!(raw.rooms.join.is_empty());
    }
}
