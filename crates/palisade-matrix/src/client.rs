//! The Matrix client-server HTTP client.

use std::sync::RwLock;
use std::time::Duration;

use palisade_events::ChatEvent;
use reqwest::StatusCode;
use serde_json::json;
use tracing::{debug, info};
use url::Url;
use uuid::Uuid;

use crate::error::{MatrixError, MatrixResult};
use crate::types::{
    LoginSession, RawErrorBody, RawEventIdResponse, RawJoinedRoomsResponse, RawLoginResponse,
    RawSyncResponse, RawUploadResponse, RoomInvite, SyncBatch,
};

/// Extra slack on top of the long-poll timeout for the HTTP layer.
const SYNC_HTTP_SLACK: Duration = Duration::from_secs(15);

/// Default per-request timeout for everything that is not a sync.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// The Matrix client.
///
/// One instance per homeserver, holding one keep-alive HTTP client. The
/// access token is interior-mutable so a re-login can swap it without
/// tearing down in-flight clones.
pub struct MatrixClient {
    http: reqwest::Client,
    base_url: Url,
    access_token: RwLock<Option<String>>,
}

impl std::fmt::Debug for MatrixClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MatrixClient")
            .field("base_url", &self.base_url.as_str())
            .finish_non_exhaustive()
    }
}

impl MatrixClient {
    /// Create a client for `homeserver_url`.
    ///
    /// # Errors
    ///
    /// Returns [`MatrixError::BadUrl`] when the URL does not parse.
    pub fn new(homeserver_url: &str) -> MatrixResult<Self> {
        let base_url =
            Url::parse(homeserver_url).map_err(|e| MatrixError::BadUrl(e.to_string()))?;
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| MatrixError::Connection(e.to_string()))?;
        Ok(Self {
            http,
            base_url,
            access_token: RwLock::new(None),
        })
    }

    /// Adopt a cached session token instead of logging in.
    pub fn restore_session(&self, access_token: &str) {
        let mut guard = self
            .access_token
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        *guard = Some(access_token.to_owned());
    }

    /// Whether the client currently holds a token.
    #[must_use]
    pub fn has_session(&self) -> bool {
        self.access_token
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .is_some()
    }

    fn token(&self) -> MatrixResult<String> {
        self.access_token
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
            .ok_or(MatrixError::NotLoggedIn)
    }

    fn endpoint(&self, path: &str) -> MatrixResult<Url> {
        self.base_url
            .join(path)
            .map_err(|e| MatrixError::BadUrl(e.to_string()))
    }

    /// Password login. On success the token is installed on this client
    /// and the full session returned for caching.
    ///
    /// # Errors
    ///
    /// Connection failures and homeserver rejections.
    pub async fn login_password(
        &self,
        username: &str,
        password: &str,
        device_id: Option<&str>,
    ) -> MatrixResult<LoginSession> {
        let url = self.endpoint("/_matrix/client/v3/login")?;
        let mut body = json!({
            "type": "m.login.password",
            "identifier": {"type": "m.id.user", "user": username},
            "password": password,
            "initial_device_display_name": "palisade-bridge",
        });
        if let Some(device_id) = device_id {
            body["device_id"] = json!(device_id);
        }

        let response = self.http.post(url).json(&body).send().await?;
        let raw: RawLoginResponse = Self::decode(response).await?;

        self.restore_session(&raw.access_token);
        info!(user_id = %raw.user_id, device_id = %raw.device_id, "Logged in to homeserver");
        Ok(LoginSession {
            user_id: raw.user_id,
            access_token: raw.access_token,
            device_id: raw.device_id,
        })
    }

    /// Validate the current token.
    ///
    /// # Errors
    ///
    /// `M_UNKNOWN_TOKEN` (as [`MatrixError::Api`]) when the cached token
    /// is stale.
    pub async fn whoami(&self) -> MatrixResult<String> {
        let url = self.endpoint("/_matrix/client/v3/account/whoami")?;
        let response = self
            .http
            .get(url)
            .bearer_auth(self.token()?)
            .send()
            .await?;
        let body: serde_json::Value = Self::decode(response).await?;
        body.get("user_id")
            .and_then(|v| v.as_str())
            .map(str::to_owned)
            .ok_or_else(|| MatrixError::Malformed("whoami without user_id".to_owned()))
    }

    /// One long-poll sync.
    ///
    /// `timeout_secs` is the server-side long-poll window; the HTTP
    /// request itself gets extra slack on top.
    ///
    /// # Errors
    ///
    /// Connection failures and homeserver rejections.
    pub async fn sync(&self, since: Option<&str>, timeout_secs: u64) -> MatrixResult<SyncBatch> {
        let mut url = self.endpoint("/_matrix/client/v3/sync")?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("timeout", &timeout_secs.saturating_mul(1000).to_string());
            if let Some(since) = since {
                query.append_pair("since", since);
            }
        }

        let response = self
            .http
            .get(url)
            .bearer_auth(self.token()?)
            .timeout(Duration::from_secs(timeout_secs).saturating_add(SYNC_HTTP_SLACK))
            .send()
            .await?;
        let raw: RawSyncResponse = Self::decode(response).await?;
        Ok(Self::flatten_sync(raw))
    }

    fn flatten_sync(raw: RawSyncResponse) -> SyncBatch {
        let mut events = Vec::new();
        for (room_id, room) in raw.rooms.join {
            for event in room.timeline.events {
                events.push(ChatEvent {
                    event_id: event.event_id,
                    room_id: room_id.clone(),
                    sender: event.sender,
                    event_type: event.event_type,
                    content: event.content,
                    origin_server_ts: event.origin_server_ts,
                });
            }
        }

        let invites = raw
            .rooms
            .invite
            .into_iter()
            .map(|(room_id, room)| {
                let inviter = room
                    .invite_state
                    .events
                    .iter()
                    .find(|e| {
                        e.event_type == "m.room.member"
                            && e.content.get("membership").and_then(|m| m.as_str())
                                == Some("invite")
                    })
                    .and_then(|e| e.sender.clone());
                RoomInvite { room_id, inviter }
            })
            .collect();

        SyncBatch {
            next_batch: raw.next_batch,
            events,
            invites,
        }
    }

    /// Send a text message. Returns the event id.
    ///
    /// # Errors
    ///
    /// Send failures surface as MAT-021 upstream; no retry happens here.
    pub async fn send_message(
        &self,
        room_id: &str,
        body: &str,
        msgtype: Option<&str>,
    ) -> MatrixResult<String> {
        let content = json!({
            "msgtype": msgtype.unwrap_or("m.text"),
            "body": body,
        });
        self.put_event(room_id, "m.room.message", &content).await
    }

    /// Send a reaction (`m.annotation`) to `target_event_id`.
    ///
    /// # Errors
    ///
    /// Send failures.
    pub async fn send_reaction(
        &self,
        room_id: &str,
        target_event_id: &str,
        key: &str,
    ) -> MatrixResult<String> {
        let content = json!({
            "m.relates_to": {
                "rel_type": "m.annotation",
                "event_id": target_event_id,
                "key": key,
            }
        });
        self.put_event(room_id, "m.reaction", &content).await
    }

    /// Send a rich reply to `target_event_id`.
    ///
    /// # Errors
    ///
    /// Send failures.
    pub async fn send_reply(
        &self,
        room_id: &str,
        target_event_id: &str,
        body: &str,
    ) -> MatrixResult<String> {
        let content = json!({
            "msgtype": "m.text",
            "body": body,
            "m.relates_to": {
                "m.in_reply_to": {"event_id": target_event_id}
            }
        });
        self.put_event(room_id, "m.room.message", &content).await
    }

    /// Upload media. Returns the `mxc://` content URI.
    ///
    /// # Errors
    ///
    /// Upload failures.
    pub async fn upload(
        &self,
        filename: &str,
        content_type: &str,
        data: Vec<u8>,
    ) -> MatrixResult<String> {
        let mut url = self.endpoint("/_matrix/media/v3/upload")?;
        url.query_pairs_mut().append_pair("filename", filename);

        let response = self
            .http
            .post(url)
            .bearer_auth(self.token()?)
            .header(reqwest::header::CONTENT_TYPE, content_type)
            .body(data)
            .send()
            .await?;
        let raw: RawUploadResponse = Self::decode(response).await?;
        Ok(raw.content_uri)
    }

    /// Send a file event referencing an uploaded content URI.
    ///
    /// # Errors
    ///
    /// Send failures.
    pub async fn send_file(
        &self,
        room_id: &str,
        filename: &str,
        content_uri: &str,
        content_type: &str,
        size: usize,
    ) -> MatrixResult<String> {
        let content = json!({
            "msgtype": "m.file",
            "body": filename,
            "url": content_uri,
            "info": {"mimetype": content_type, "size": size},
        });
        self.put_event(room_id, "m.room.message", &content).await
    }

    /// Join a room by id or alias.
    ///
    /// # Errors
    ///
    /// Join failures.
    pub async fn join_room(&self, room_id_or_alias: &str) -> MatrixResult<String> {
        let url = self.endpoint(&format!(
            "/_matrix/client/v3/join/{}",
            urlencode(room_id_or_alias)
        ))?;
        let response = self
            .http
            .post(url)
            .bearer_auth(self.token()?)
            .json(&json!({}))
            .send()
            .await?;
        let body: serde_json::Value = Self::decode(response).await?;
        let room_id = body
            .get("room_id")
            .and_then(|v| v.as_str())
            .map(str::to_owned)
            .ok_or_else(|| MatrixError::Malformed("join without room_id".to_owned()))?;
        debug!(room_id = %room_id, "Joined room");
        Ok(room_id)
    }

    /// List joined rooms.
    ///
    /// # Errors
    ///
    /// Connection failures and homeserver rejections.
    pub async fn joined_rooms(&self) -> MatrixResult<Vec<String>> {
        let url = self.endpoint("/_matrix/client/v3/joined_rooms")?;
        let response = self
            .http
            .get(url)
            .bearer_auth(self.token()?)
            .send()
            .await?;
        let raw: RawJoinedRoomsResponse = Self::decode(response).await?;
        Ok(raw.joined_rooms)
    }

    async fn put_event(
        &self,
        room_id: &str,
        event_type: &str,
        content: &serde_json::Value,
    ) -> MatrixResult<String> {
        let txn_id = Uuid::new_v4().simple().to_string();
        let url = self.endpoint(&format!(
            "/_matrix/client/v3/rooms/{}/send/{event_type}/{txn_id}",
            urlencode(room_id)
        ))?;

        let response = self
            .http
            .put(url)
            .bearer_auth(self.token()?)
            .json(content)
            .send()
            .await?;
        let raw: RawEventIdResponse = Self::decode(response).await?;
        Ok(raw.event_id)
    }

    /// Decode a response, turning non-2xx bodies into [`MatrixError::Api`].
    async fn decode<T: serde::de::DeserializeOwned>(response: reqwest::Response) -> MatrixResult<T> {
        let status = response.status();
        if status.is_success() {
            return response
                .json::<T>()
                .await
                .map_err(|e| MatrixError::Malformed(e.to_string()));
        }

        let body: RawErrorBody = response.json().await.unwrap_or(RawErrorBody {
            errcode: None,
            error: None,
        });
        Err(MatrixError::Api {
            status: status.as_u16(),
            errcode: body.errcode.unwrap_or_else(|| fallback_errcode(status)),
            message: body.error.unwrap_or_else(|| status.to_string()),
        })
    }
}

fn fallback_errcode(status: StatusCode) -> String {
    match status.as_u16() {
        401 => "M_UNKNOWN_TOKEN".to_owned(),
        403 => "M_FORBIDDEN".to_owned(),
        429 => "M_LIMIT_EXCEEDED".to_owned(),
        _ => "M_UNKNOWN".to_owned(),
    }
}

/// Percent-encode a path segment (room ids contain `!` and `:`).
fn urlencode(segment: &str) -> String {
    let mut out = String::with_capacity(segment.len());
    for byte in segment.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char);
            },
            other => {
                out.push('%');
                out.push_str(&format!("{other:02X}"));
            },
        }
    }
    out
}
