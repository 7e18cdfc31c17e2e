// =============================================================================
// Matrixon Matrix NextServer - Testkit Client
// =============================================================================
//
// Project: Matrixon - Ultra High Performance Matrix NextServer (Synapse Alternative)
// Author: arkSong (arksong2018@gmail.com) - Founder of Matrixon Innovation Project
// Date: 2024-12-11
// Version: 0.11.0-alpha
// License: Apache 2.0 / MIT
//
// Description:
//   Client-Server API client used by integration tests. One instance
//   represents one user on one homeserver and exposes the small set of
//   scenario helpers tests compose: register, create/join/leave/invite,
//   send events (optionally confirmed through /sync), and media upload and
//   download. Everything funnels through the single-request transport in
//   http.rs; nothing here retries.
//
// =============================================================================

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use reqwest::Method;
use ruma::{
    EventId, MxcUri, OwnedEventId, OwnedMxcUri, OwnedRoomId, OwnedUserId, RoomId, RoomOrAliasId,
    RoomVersionId, ServerName, UserId,
};
use serde_json::{json, Value};
use tracing::{debug, info, instrument};
use url::Url;

use crate::checks;
use crate::error::{Error, Result};
use crate::event::Event;
use crate::http::RequestOptions;
use crate::json;
use crate::sync::SyncRequest;

/// One user's view of one homeserver under test.
///
/// Fields are public so a test can adjust them mid-scenario, e.g. installing
/// the access token returned by [`Client::register_user`] or shortening
/// `sync_until_timeout` for a wait that is expected to fail. The transaction
/// counter is private: it must only move through [`Client::send_event`] so
/// transaction IDs stay strictly increasing for the life of the instance.
#[derive(Debug)]
pub struct Client {
    /// Base URL of the homeserver, e.g. `http://localhost:8008`.
    pub base_url: Url,
    /// The user this client acts as.
    pub user_id: OwnedUserId,
    /// Bearer credential attached to every request when present. Never sent
    /// as a query parameter.
    pub access_token: Option<String>,
    /// Wall-clock budget for [`Client::sync_until`] and
    /// [`Client::sync_until_array`].
    pub sync_until_timeout: Duration,
    /// When set, request and response bodies are logged at debug level.
    pub debug: bool,
    pub(crate) http: reqwest::Client,
    txn_id: AtomicU64,
}

impl Client {
    /// Creates an unauthenticated client for `user_id` against `base_url`.
    ///
    /// The convergence budget defaults to 5 seconds and individual requests
    /// time out after 30, both generous enough for a loaded CI host.
    pub fn new(base_url: &str, user_id: OwnedUserId) -> Result<Self> {
        let parsed = Url::parse(base_url).map_err(|e| Error::BaseUrl(format!("{base_url}: {e}")))?;
        if parsed.cannot_be_a_base() {
            return Err(Error::BaseUrl(format!("{base_url}: cannot carry a path")));
        }
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            base_url: parsed,
            user_id,
            access_token: None,
            sync_until_timeout: Duration::from_secs(5),
            debug: false,
            http,
            txn_id: AtomicU64::new(0),
        })
    }

    pub fn with_access_token(mut self, token: impl Into<String>) -> Self {
        self.access_token = Some(token.into());
        self
    }

    pub fn with_sync_timeout(mut self, timeout: Duration) -> Self {
        self.sync_until_timeout = timeout;
        self
    }

    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    /// # `POST /_matrix/client/r0/register`
    ///
    /// Registers a fresh user with dummy auth and returns its user ID and
    /// access token. The client's own `user_id` and `access_token` are left
    /// untouched; callers install the returned credentials where they want
    /// them, usually on a client constructed for exactly this user.
    #[instrument(level = "debug", skip(self, password))]
    pub async fn register_user(
        &self,
        localpart: &str,
        password: &str,
    ) -> Result<(OwnedUserId, String)> {
        let body = json!({
            "auth": {
                "type": "m.login.dummy",
            },
            "username": localpart,
            "password": password,
        });
        let response = self
            .must_do(
                Method::POST,
                &["_matrix", "client", "r0", "register"],
                RequestOptions::json(body),
            )
            .await?;
        let body = response.json()?;
        let user_id = UserId::parse(json::field_str(&body, "user_id")?)?;
        let access_token = json::field_str(&body, "access_token")?;
        info!("✅ registered user {user_id}");
        Ok((user_id, access_token))
    }

    /// # `POST /_matrix/client/r0/createRoom`
    ///
    /// Creates a room from the given creation content (`json!({})` for the
    /// server defaults) and returns its room ID.
    #[instrument(level = "debug", skip(self, creation_content), fields(user_id = %self.user_id))]
    pub async fn create_room(&self, creation_content: Value) -> Result<OwnedRoomId> {
        let response = self
            .must_do(
                Method::POST,
                &["_matrix", "client", "r0", "createRoom"],
                RequestOptions::json(creation_content),
            )
            .await?;
        let body = response.json()?;
        Ok(RoomId::parse(json::field_str(&body, "room_id")?)?)
    }

    /// # `POST /_matrix/client/r0/join/{roomIdOrAlias}`
    ///
    /// Joins the given room ID or alias, optionally listing servers to join
    /// through (repeated `server_name` query parameters). Returns the room
    /// ID: taken from the argument when it already is one, otherwise from
    /// the response, which resolves the alias.
    #[instrument(level = "debug", skip(self), fields(user_id = %self.user_id))]
    pub async fn join_room(
        &self,
        room_id_or_alias: &RoomOrAliasId,
        server_names: &[&ServerName],
    ) -> Result<OwnedRoomId> {
        let mut options = RequestOptions::new();
        for server_name in server_names {
            options = options.query("server_name", server_name.as_str());
        }
        let response = self
            .must_do(
                Method::POST,
                &["_matrix", "client", "r0", "join", room_id_or_alias.as_str()],
                options,
            )
            .await?;
        if room_id_or_alias.is_room_id() {
            return Ok(RoomId::parse(room_id_or_alias.as_str())?);
        }
        let body = response.json()?;
        Ok(RoomId::parse(json::field_str(&body, "room_id")?)?)
    }

    /// # `POST /_matrix/client/r0/rooms/{roomId}/leave`
    #[instrument(level = "debug", skip(self), fields(user_id = %self.user_id))]
    pub async fn leave_room(&self, room_id: &RoomId) -> Result<()> {
        self.must_do(
            Method::POST,
            &["_matrix", "client", "r0", "rooms", room_id.as_str(), "leave"],
            RequestOptions::new(),
        )
        .await?;
        Ok(())
    }

    /// # `POST /_matrix/client/r0/rooms/{roomId}/invite`
    ///
    /// Invites `user_id` to `room_id`.
    #[instrument(level = "debug", skip(self), fields(user_id = %self.user_id))]
    pub async fn invite_room(&self, room_id: &RoomId, user_id: &UserId) -> Result<()> {
        self.must_do(
            Method::POST,
            &["_matrix", "client", "r0", "rooms", room_id.as_str(), "invite"],
            RequestOptions::json(json!({ "user_id": user_id })),
        )
        .await?;
        Ok(())
    }

    /// # `PUT /_matrix/client/r0/rooms/{roomId}/send/{eventType}/{txnId}`
    /// # `PUT /_matrix/client/r0/rooms/{roomId}/state/{eventType}/{stateKey}`
    ///
    /// Sends `event` into the room and returns its event ID without waiting
    /// for it to appear anywhere. State events are addressed by their state
    /// key; non-state events consume the next transaction ID from this
    /// client's strictly increasing counter.
    #[instrument(level = "debug", skip(self, event), fields(user_id = %self.user_id, event_type = %event.event_type))]
    pub async fn send_event(&self, room_id: &RoomId, event: &Event) -> Result<OwnedEventId> {
        let txn_id;
        let segments: Vec<&str> = match &event.state_key {
            Some(state_key) => vec![
                "_matrix",
                "client",
                "r0",
                "rooms",
                room_id.as_str(),
                "state",
                &event.event_type,
                state_key,
            ],
            None => {
                txn_id = (self.txn_id.fetch_add(1, Ordering::SeqCst) + 1).to_string();
                vec![
                    "_matrix",
                    "client",
                    "r0",
                    "rooms",
                    room_id.as_str(),
                    "send",
                    &event.event_type,
                    &txn_id,
                ]
            }
        };
        let response = self
            .must_do(
                Method::PUT,
                &segments,
                RequestOptions::json(event.content.clone()),
            )
            .await?;
        let body = response.json()?;
        Ok(EventId::parse(json::field_str(&body, "event_id")?)?)
    }

    /// Sends `event` and blocks until its event ID is observed in the
    /// room's timeline through this client's own `/sync`. Confirms the write
    /// the way a real client would see it, not just that the server
    /// accepted it.
    pub async fn send_event_synced(&self, room_id: &RoomId, event: &Event) -> Result<OwnedEventId> {
        let event_id = self.send_event(room_id, event).await?;
        debug!("waiting for event {event_id} to come down /sync");
        let expected = event_id.clone();
        self.sync_until(
            SyncRequest::default(),
            vec![checks::sync_timeline_has(room_id, move |ev| {
                json::str_at(ev, "event_id") == expected.as_str()
            })],
        )
        .await?;
        Ok(event_id)
    }

    /// # `POST /_matrix/media/r0/upload`
    ///
    /// Uploads raw content with an optional file name and returns the
    /// `mxc://` URI the server assigned.
    #[instrument(level = "debug", skip(self, file_body), fields(user_id = %self.user_id, bytes = file_body.len()))]
    pub async fn upload_content(
        &self,
        file_body: Vec<u8>,
        file_name: Option<&str>,
        content_type: &str,
    ) -> Result<OwnedMxcUri> {
        let mut options = RequestOptions::raw(file_body, content_type);
        if let Some(name) = file_name {
            options = options.query("filename", name);
        }
        let response = self
            .must_do(Method::POST, &["_matrix", "media", "r0", "upload"], options)
            .await?;
        let body = response.json()?;
        Ok(OwnedMxcUri::from(json::field_str(&body, "content_uri")?))
    }

    /// # `GET /_matrix/media/r0/download/{serverName}/{mediaId}`
    ///
    /// Downloads media, returning the raw bytes and the Content-Type header
    /// value (empty when the server sent none).
    #[instrument(level = "debug", skip(self), fields(user_id = %self.user_id))]
    pub async fn download_content(&self, mxc: &MxcUri) -> Result<(Vec<u8>, String)> {
        let (server_name, media_id) = mxc.parts().map_err(|_| Error::BadMxcUri {
            uri: mxc.to_string(),
        })?;
        let response = self
            .must_do(
                Method::GET,
                &[
                    "_matrix",
                    "media",
                    "r0",
                    "download",
                    server_name.as_str(),
                    media_id,
                ],
                RequestOptions::new(),
            )
            .await?;
        let content_type = response.content_type.clone().unwrap_or_default();
        Ok((response.body, content_type))
    }

    /// # `GET /_matrix/client/r0/capabilities`
    #[instrument(level = "debug", skip(self), fields(user_id = %self.user_id))]
    pub async fn get_capabilities(&self) -> Result<Value> {
        let response = self
            .must_do(
                Method::GET,
                &["_matrix", "client", "r0", "capabilities"],
                RequestOptions::new(),
            )
            .await?;
        response.json()
    }

    /// The room version the server creates rooms with by default. Servers
    /// without the capability predate room versioning, which means v1.
    pub async fn default_room_version(&self) -> Result<RoomVersionId> {
        let capabilities = self.get_capabilities().await?;
        match json::lookup(&capabilities, r"capabilities.m\.room_versions.default")
            .and_then(Value::as_str)
        {
            Some(version) => Ok(RoomVersionId::try_from(version)?),
            None => Ok(RoomVersionId::V1),
        }
    }
}
