//! Shared mock homeserver for integration tests
//!
//! A small axum application standing in for a real homeserver. It serves
//! exactly the endpoint surface the harness consumes, mints monotonically
//! increasing sync tokens and IDs, and records every request so tests can
//! assert on what actually went over the wire (since tokens, transaction
//! IDs, query parameters, Authorization headers).
//!
//! `/sync` is scripted: tests queue envelopes (served immediately, token
//! injected) or raw responses (served verbatim, for malformed-body and
//! error-status cases). With an empty queue the handler long-polls like a
//! real quiet server: it holds the request for the requested timeout, then
//! answers with an empty envelope and a fresh token.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use matrixon_testkit::Client;
use ruma::UserId;
use serde_json::{json, Value};

pub const SERVER_NAME: &str = "mock";

/// One recorded `/sync` request.
#[derive(Debug, Clone)]
pub struct SyncRecord {
    pub since: Option<String>,
    pub timeout: Option<String>,
    pub filter: Option<String>,
    pub full_state: Option<String>,
    pub set_presence: Option<String>,
    pub authorization: Option<String>,
    pub params: Vec<(String, String)>,
}

/// One recorded event send, via either the txn or the state route.
#[derive(Debug, Clone)]
pub struct SendRecord {
    pub room_id: String,
    pub event_type: String,
    pub txn_id: Option<String>,
    pub state_key: Option<String>,
    pub content: Value,
    pub event_id: String,
    pub authorization: Option<String>,
}

#[derive(Debug, Clone)]
pub struct JoinRecord {
    pub target: String,
    pub server_names: Vec<String>,
    pub params: Vec<(String, String)>,
}

#[derive(Debug, Clone)]
pub struct InviteRecord {
    pub room_id: String,
    pub invited_user: String,
}

#[derive(Debug, Clone)]
struct StoredMedia {
    content_type: String,
    filename: Option<String>,
    bytes: Vec<u8>,
}

enum ScriptedSync {
    /// Served immediately with a minted `next_batch` injected.
    Envelope(Value),
    /// Served verbatim with the given status, no token injection.
    Raw { status: u16, body: String },
}

pub struct ServerState {
    token_counter: AtomicU64,
    id_counter: AtomicU64,
    sync_script: Mutex<VecDeque<ScriptedSync>>,
    sync_requests: Mutex<Vec<SyncRecord>>,
    created: Mutex<Vec<Value>>,
    sends: Mutex<Vec<SendRecord>>,
    joins: Mutex<Vec<JoinRecord>>,
    invites: Mutex<Vec<InviteRecord>>,
    leaves: Mutex<Vec<String>>,
    aliases: Mutex<HashMap<String, String>>,
    media: Mutex<HashMap<String, StoredMedia>>,
    capabilities: Mutex<Value>,
}

impl Default for ServerState {
    fn default() -> Self {
        Self {
            token_counter: AtomicU64::new(0),
            id_counter: AtomicU64::new(0),
            sync_script: Mutex::new(VecDeque::new()),
            sync_requests: Mutex::new(Vec::new()),
            created: Mutex::new(Vec::new()),
            sends: Mutex::new(Vec::new()),
            joins: Mutex::new(Vec::new()),
            invites: Mutex::new(Vec::new()),
            leaves: Mutex::new(Vec::new()),
            aliases: Mutex::new(HashMap::new()),
            media: Mutex::new(HashMap::new()),
            capabilities: Mutex::new(json!({
                "capabilities": {
                    "m.room_versions": {
                        "default": "10",
                        "available": {"1": "stable", "10": "stable"},
                    },
                },
            })),
        }
    }
}

pub struct MockHomeserver {
    pub addr: SocketAddr,
    state: Arc<ServerState>,
}

impl MockHomeserver {
    pub async fn spawn() -> Self {
        let state = Arc::new(ServerState::default());
        let app = router(state.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind mock listener");
        let addr = listener.local_addr().expect("mock listener addr");
        tokio::spawn(async move {
            axum::serve(listener, app).await.expect("mock homeserver crashed");
        });
        Self { addr, state }
    }

    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// A client for `user_id` carrying a bearer token the mock will echo
    /// back in its request records.
    pub fn authed_client(&self, user_id: &UserId) -> Client {
        Client::new(&self.base_url(), user_id.to_owned())
            .expect("mock base url is valid")
            .with_access_token(format!("syt_{}", user_id.localpart()))
    }

    /// Queues an envelope for the next `/sync`; `next_batch` is injected by
    /// the server, so the script only describes room payloads.
    pub fn script_sync(&self, envelope: Value) {
        self.state
            .sync_script
            .lock()
            .unwrap()
            .push_back(ScriptedSync::Envelope(envelope));
    }

    /// Queues `count` empty envelopes, each consuming one sync step.
    pub fn script_empty_syncs(&self, count: usize) {
        for _ in 0..count {
            self.script_sync(json!({ "rooms": {} }));
        }
    }

    /// Queues a verbatim response for the next `/sync`. No token is minted
    /// or injected; this is how tests exercise malformed bodies, missing
    /// fields and error statuses.
    pub fn script_sync_raw(&self, status: u16, body: impl Into<String>) {
        self.state
            .sync_script
            .lock()
            .unwrap()
            .push_back(ScriptedSync::Raw {
                status,
                body: body.into(),
            });
    }

    pub fn register_alias(&self, alias: &str, room_id: &str) {
        self.state
            .aliases
            .lock()
            .unwrap()
            .insert(alias.to_owned(), room_id.to_owned());
    }

    pub fn set_capabilities(&self, capabilities: Value) {
        *self.state.capabilities.lock().unwrap() = capabilities;
    }

    pub fn sync_requests(&self) -> Vec<SyncRecord> {
        self.state.sync_requests.lock().unwrap().clone()
    }

    pub fn created_rooms(&self) -> Vec<Value> {
        self.state.created.lock().unwrap().clone()
    }

    pub fn sends(&self) -> Vec<SendRecord> {
        self.state.sends.lock().unwrap().clone()
    }

    pub fn joins(&self) -> Vec<JoinRecord> {
        self.state.joins.lock().unwrap().clone()
    }

    pub fn invites(&self) -> Vec<InviteRecord> {
        self.state.invites.lock().unwrap().clone()
    }

    pub fn leaves(&self) -> Vec<String> {
        self.state.leaves.lock().unwrap().clone()
    }

    /// `(media_id, filename)` pairs for everything uploaded so far.
    pub fn uploaded_media(&self) -> Vec<(String, Option<String>)> {
        self.state
            .media
            .lock()
            .unwrap()
            .iter()
            .map(|(id, media)| (id.clone(), media.filename.clone()))
            .collect()
    }
}

/// Idempotent tracing setup so failing tests come with their debug logs.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("debug")
        .with_test_writer()
        .try_init();
}

fn router(state: Arc<ServerState>) -> Router {
    Router::new()
        .route("/_matrix/client/r0/register", post(register))
        .route("/_matrix/client/r0/createRoom", post(create_room))
        .route("/_matrix/client/r0/join/:room_id_or_alias", post(join))
        .route("/_matrix/client/r0/rooms/:room_id/leave", post(leave))
        .route("/_matrix/client/r0/rooms/:room_id/invite", post(invite))
        .route(
            "/_matrix/client/r0/rooms/:room_id/send/:event_type/:txn_id",
            put(send_event),
        )
        .route(
            "/_matrix/client/r0/rooms/:room_id/state/:event_type/:state_key",
            put(send_state),
        )
        .route(
            "/_matrix/client/r0/rooms/:room_id/state/:event_type/",
            put(send_state_empty_key),
        )
        .route("/_matrix/client/r0/sync", get(sync))
        .route("/_matrix/client/r0/capabilities", get(capabilities))
        .route("/_matrix/media/r0/upload", post(upload))
        .route(
            "/_matrix/media/r0/download/:server_name/:media_id",
            get(download),
        )
        .with_state(state)
}

fn bearer(headers: &HeaderMap) -> Option<String> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned)
}

fn json_response(status: StatusCode, body: String) -> Response {
    (
        status,
        [(header::CONTENT_TYPE, "application/json")],
        body,
    )
        .into_response()
}

fn next_id(state: &ServerState) -> u64 {
    state.id_counter.fetch_add(1, Ordering::SeqCst) + 1
}

fn mint_token(state: &ServerState) -> String {
    format!("s{}", state.token_counter.fetch_add(1, Ordering::SeqCst) + 1)
}

async fn register(State(state): State<Arc<ServerState>>, Json(body): Json<Value>) -> Response {
    let username = body["username"].as_str().unwrap_or("user");
    let n = next_id(&state);
    Json(json!({
        "user_id": format!("@{username}:{SERVER_NAME}"),
        "access_token": format!("syt_{username}_{n}"),
        "device_id": format!("DEV{n}"),
    }))
    .into_response()
}

async fn create_room(State(state): State<Arc<ServerState>>, Json(body): Json<Value>) -> Response {
    state.created.lock().unwrap().push(body);
    let n = next_id(&state);
    Json(json!({ "room_id": format!("!room{n}:{SERVER_NAME}") })).into_response()
}

async fn join(
    State(state): State<Arc<ServerState>>,
    Path(target): Path<String>,
    Query(params): Query<Vec<(String, String)>>,
) -> Response {
    let server_names = params
        .iter()
        .filter(|(k, _)| k == "server_name")
        .map(|(_, v)| v.clone())
        .collect();
    state.joins.lock().unwrap().push(JoinRecord {
        target: target.clone(),
        server_names,
        params: params.clone(),
    });
    if target.starts_with('!') {
        // Deliberately not an echo: a client that reads the response here
        // instead of using its argument will be caught by the tests.
        return Json(json!({ "room_id": "!decoy:mock" })).into_response();
    }
    match state.aliases.lock().unwrap().get(&target) {
        Some(room_id) => Json(json!({ "room_id": room_id })).into_response(),
        None => json_response(
            StatusCode::NOT_FOUND,
            json!({"errcode": "M_NOT_FOUND", "error": "Unknown room alias"}).to_string(),
        ),
    }
}

async fn leave(State(state): State<Arc<ServerState>>, Path(room_id): Path<String>) -> Response {
    state.leaves.lock().unwrap().push(room_id);
    Json(json!({})).into_response()
}

async fn invite(
    State(state): State<Arc<ServerState>>,
    Path(room_id): Path<String>,
    Json(body): Json<Value>,
) -> Response {
    state.invites.lock().unwrap().push(InviteRecord {
        room_id,
        invited_user: body["user_id"].as_str().unwrap_or("").to_owned(),
    });
    Json(json!({})).into_response()
}

fn record_send(
    state: &ServerState,
    room_id: String,
    event_type: String,
    txn_id: Option<String>,
    state_key: Option<String>,
    content: Value,
    authorization: Option<String>,
) -> Response {
    let event_id = format!("$ev{}:{SERVER_NAME}", next_id(state));
    state.sends.lock().unwrap().push(SendRecord {
        room_id,
        event_type,
        txn_id,
        state_key,
        content,
        event_id: event_id.clone(),
        authorization,
    });
    Json(json!({ "event_id": event_id })).into_response()
}

async fn send_event(
    State(state): State<Arc<ServerState>>,
    Path((room_id, event_type, txn_id)): Path<(String, String, String)>,
    headers: HeaderMap,
    Json(content): Json<Value>,
) -> Response {
    let auth = bearer(&headers);
    record_send(&state, room_id, event_type, Some(txn_id), None, content, auth)
}

async fn send_state(
    State(state): State<Arc<ServerState>>,
    Path((room_id, event_type, state_key)): Path<(String, String, String)>,
    headers: HeaderMap,
    Json(content): Json<Value>,
) -> Response {
    let auth = bearer(&headers);
    record_send(
        &state,
        room_id,
        event_type,
        None,
        Some(state_key),
        content,
        auth,
    )
}

async fn send_state_empty_key(
    State(state): State<Arc<ServerState>>,
    Path((room_id, event_type)): Path<(String, String)>,
    headers: HeaderMap,
    Json(content): Json<Value>,
) -> Response {
    let auth = bearer(&headers);
    record_send(
        &state,
        room_id,
        event_type,
        None,
        Some(String::new()),
        content,
        auth,
    )
}

async fn sync(
    State(state): State<Arc<ServerState>>,
    Query(params): Query<Vec<(String, String)>>,
    headers: HeaderMap,
) -> Response {
    let find = |key: &str| {
        params
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.clone())
    };
    state.sync_requests.lock().unwrap().push(SyncRecord {
        since: find("since"),
        timeout: find("timeout"),
        filter: find("filter"),
        full_state: find("full_state"),
        set_presence: find("set_presence"),
        authorization: bearer(&headers),
        params: params.clone(),
    });

    let scripted = state.sync_script.lock().unwrap().pop_front();
    match scripted {
        Some(ScriptedSync::Raw { status, body }) => json_response(
            StatusCode::from_u16(status).expect("scripted status code"),
            body,
        ),
        Some(ScriptedSync::Envelope(mut envelope)) => {
            envelope["next_batch"] = Value::String(mint_token(&state));
            Json(envelope).into_response()
        }
        None => {
            // Nothing scripted: behave like a quiet server and hold the
            // long poll for the requested timeout.
            let millis = find("timeout")
                .and_then(|t| t.parse::<u64>().ok())
                .unwrap_or(1000)
                .min(1000);
            tokio::time::sleep(Duration::from_millis(millis)).await;
            Json(json!({ "next_batch": mint_token(&state), "rooms": {} })).into_response()
        }
    }
}

async fn capabilities(State(state): State<Arc<ServerState>>) -> Response {
    let body = state.capabilities.lock().unwrap().clone();
    Json(body).into_response()
}

async fn upload(
    State(state): State<Arc<ServerState>>,
    Query(params): Query<Vec<(String, String)>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("application/octet-stream")
        .to_owned();
    let filename = params
        .iter()
        .find(|(k, _)| k == "filename")
        .map(|(_, v)| v.clone());
    let media_id = format!("m{}", next_id(&state));
    state.media.lock().unwrap().insert(
        media_id.clone(),
        StoredMedia {
            content_type,
            filename,
            bytes: body.to_vec(),
        },
    );
    Json(json!({ "content_uri": format!("mxc://{SERVER_NAME}/{media_id}") })).into_response()
}

async fn download(
    State(state): State<Arc<ServerState>>,
    Path((_server_name, media_id)): Path<(String, String)>,
) -> Response {
    match state.media.lock().unwrap().get(&media_id) {
        Some(media) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, media.content_type.clone())],
            media.bytes.clone(),
        )
            .into_response(),
        None => json_response(
            StatusCode::NOT_FOUND,
            json!({"errcode": "M_NOT_FOUND", "error": "Unknown media"}).to_string(),
        ),
    }
}
