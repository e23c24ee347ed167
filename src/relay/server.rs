use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::config::{MAX_FRAME_BYTES, PING_INTERVAL, PONG_TIMEOUT, WRITE_TIMEOUT};
use crate::protocol::wire::{decode_frame, encode_frame};
use crate::protocol::{Frame, Payload};
use crate::relay::auth::Authenticator;
use crate::relay::hub::{Connection, Hub, Role};
use crate::relay::store::{ActiveSession, Session, ShareScope, Store};
use crate::relay::users::{self, UserStore};

pub struct RelayState {
    pub store: Arc<Store>,
    pub users: Arc<UserStore>,
    pub auth: Authenticator,
    pub hub: Arc<Hub>,
    pub data_dir: PathBuf,
}

impl RelayState {
    fn persist(&self) {
        if let Err(err) = self.store.save(&self.data_dir) {
            warn!(error = %err, "failed to persist relay state");
        }
    }

    fn persist_users(&self) {
        if let Err(err) = self.users.save() {
            warn!(error = %err, "failed to persist users");
        }
    }
}

/// HTTP + WebSocket surface of the relay.
pub struct RelayServer {
    state: Arc<RelayState>,
}

impl RelayServer {
    pub fn new(state: RelayState) -> RelayServer {
        RelayServer {
            state: Arc::new(state),
        }
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/health", get(handle_health))
            .route("/auth/login", post(handle_login))
            .route("/auth/refresh", post(handle_refresh))
            .route("/sessions", get(handle_list_sessions))
            .route("/users", get(handle_list_users).post(handle_create_user))
            .route("/users/:username", delete(handle_delete_user))
            .route("/users/:username/password", post(handle_change_password))
            .route("/users/:username/rotate-totp", post(handle_rotate_totp))
            .route("/share/create", post(handle_share_create))
            .route("/share/revoke", post(handle_share_revoke))
            .route("/ws/host", get(handle_ws_host))
            .route("/ws/client", get(handle_ws_client))
            .layer(CorsLayer::permissive())
            .layer(TraceLayer::new_for_http())
            .with_state(self.state.clone())
    }

    pub async fn serve(&self, addr: SocketAddr, cancel: CancellationToken) -> anyhow::Result<()> {
        let listener = tokio::net::TcpListener::bind(addr).await?;
        info!(%addr, "relay listening");
        axum::serve(listener, self.router())
            .with_graceful_shutdown(async move { cancel.cancelled().await })
            .await?;
        Ok(())
    }
}

type ApiError = (StatusCode, Json<serde_json::Value>);

fn api_error(status: StatusCode, message: &str) -> ApiError {
    (status, Json(serde_json::json!({ "error": message })))
}

fn require_auth(state: &RelayState, headers: &HeaderMap) -> Result<String, ApiError> {
    let header = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .ok_or_else(|| api_error(StatusCode::UNAUTHORIZED, "missing authorization"))?;
    let token = header
        .split_once(' ')
        .filter(|(scheme, _)| scheme.eq_ignore_ascii_case("bearer"))
        .map(|(_, token)| token.trim())
        .ok_or_else(|| api_error(StatusCode::UNAUTHORIZED, "invalid authorization"))?;
    let access = state
        .store
        .validate_access_token(token, Utc::now())
        .map_err(|err| api_error(StatusCode::UNAUTHORIZED, &err.to_string()))?;
    Ok(access.username)
}

async fn handle_health() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

#[derive(Deserialize)]
struct LoginRequest {
    username: String,
    password: String,
    #[serde(default)]
    totp: String,
}

#[derive(Serialize)]
struct LoginResponse {
    access_token: String,
    access_expires_at: DateTime<Utc>,
    refresh_token: String,
    refresh_expires_at: DateTime<Utc>,
}

async fn handle_login(
    State(state): State<Arc<RelayState>>,
    Json(req): Json<LoginRequest>,
) -> Result<Json<LoginResponse>, ApiError> {
    let now = Utc::now();
    let user = state
        .auth
        .validate(&req.username, &req.password, &req.totp, now)
        .map_err(|_| api_error(StatusCode::UNAUTHORIZED, "invalid credentials"))?;
    let access = state.store.create_access_token(&user.username, now);
    let refresh = state.store.create_refresh_token(&user.username, now);
    state.persist();
    Ok(Json(LoginResponse {
        access_token: access.token,
        access_expires_at: access.expires_at,
        refresh_token: refresh.token,
        refresh_expires_at: refresh.expires_at,
    }))
}

#[derive(Deserialize)]
struct RefreshRequest {
    refresh_token: String,
}

async fn handle_refresh(
    State(state): State<Arc<RelayState>>,
    Json(req): Json<RefreshRequest>,
) -> Result<Json<LoginResponse>, ApiError> {
    let now = Utc::now();
    let refresh = state
        .store
        .validate_refresh_token(&req.refresh_token, now)
        .map_err(|err| api_error(StatusCode::UNAUTHORIZED, &err.to_string()))?;
    let access = state.store.create_access_token(&refresh.username, now);
    state.persist();
    Ok(Json(LoginResponse {
        access_token: access.token,
        access_expires_at: access.expires_at,
        refresh_token: refresh.token,
        refresh_expires_at: refresh.expires_at,
    }))
}

async fn handle_list_sessions(
    State(state): State<Arc<RelayState>>,
    headers: HeaderMap,
) -> Result<Json<Vec<Session>>, ApiError> {
    let username = require_auth(&state, &headers)?;
    Ok(Json(state.store.list_sessions(&username)))
}

#[derive(Serialize)]
struct UserResponse {
    username: String,
    created_at: DateTime<Utc>,
}

async fn handle_list_users(
    State(state): State<Arc<RelayState>>,
    headers: HeaderMap,
) -> Result<Json<Vec<UserResponse>>, ApiError> {
    require_auth(&state, &headers)?;
    let users = state
        .users
        .list()
        .into_iter()
        .map(|user| UserResponse {
            username: user.username,
            created_at: user.created_at,
        })
        .collect();
    Ok(Json(users))
}

#[derive(Deserialize)]
struct UserCreateRequest {
    username: String,
    #[serde(default)]
    password: String,
}

#[derive(Serialize)]
struct UserCreateResponse {
    username: String,
    password: String,
    totp_secret: String,
    totp_url: String,
    created_at: DateTime<Utc>,
}

async fn handle_create_user(
    State(state): State<Arc<RelayState>>,
    headers: HeaderMap,
    Json(req): Json<UserCreateRequest>,
) -> Result<Json<UserCreateResponse>, ApiError> {
    require_auth(&state, &headers)?;
    let created = users::create_user(&state.users, &req.username, &req.password)
        .map_err(|err| api_error(StatusCode::BAD_REQUEST, &err.to_string()))?;
    state.persist_users();
    Ok(Json(UserCreateResponse {
        username: created.user.username,
        password: created.password,
        totp_secret: created.totp_secret,
        totp_url: created.totp_url,
        created_at: created.user.created_at,
    }))
}

async fn handle_delete_user(
    State(state): State<Arc<RelayState>>,
    headers: HeaderMap,
    Path(username): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    require_auth(&state, &headers)?;
    let user = users::delete_user(&state.users, &username)
        .map_err(|err| api_error(StatusCode::NOT_FOUND, &err.to_string()))?;
    state.store.revoke_tokens_for_username(&user.username);
    state.persist_users();
    state.persist();
    Ok(Json(serde_json::json!({ "status": "deleted" })))
}

#[derive(Deserialize)]
struct UserPasswordRequest {
    #[serde(default)]
    password: String,
}

async fn handle_change_password(
    State(state): State<Arc<RelayState>>,
    headers: HeaderMap,
    Path(username): Path<String>,
    Json(req): Json<UserPasswordRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    require_auth(&state, &headers)?;
    let password = users::change_user_password(&state.users, &username, &req.password)
        .map_err(|err| api_error(StatusCode::NOT_FOUND, &err.to_string()))?;
    state.persist_users();
    Ok(Json(serde_json::json!({ "password": password })))
}

async fn handle_rotate_totp(
    State(state): State<Arc<RelayState>>,
    headers: HeaderMap,
    Path(username): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    require_auth(&state, &headers)?;
    let (secret, url) = users::rotate_user_totp(&state.users, &username)
        .map_err(|err| api_error(StatusCode::NOT_FOUND, &err.to_string()))?;
    state.persist_users();
    Ok(Json(
        serde_json::json!({ "totp_secret": secret, "totp_url": url }),
    ))
}

#[derive(Deserialize)]
struct ShareCreateRequest {
    session_id: String,
    scope: String,
    #[serde(default)]
    ttl: Option<String>,
}

async fn handle_share_create(
    State(state): State<Arc<RelayState>>,
    headers: HeaderMap,
    Json(req): Json<ShareCreateRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    require_auth(&state, &headers)?;
    let scope = ShareScope::parse(&req.scope)
        .ok_or_else(|| api_error(StatusCode::BAD_REQUEST, "invalid scope"))?;
    let ttl = match req.ttl.as_deref() {
        Some(raw) if !raw.is_empty() => Some(
            parse_ttl(raw).ok_or_else(|| api_error(StatusCode::BAD_REQUEST, "invalid ttl"))?,
        ),
        _ => None,
    };
    let share = state
        .store
        .create_share_token(&req.session_id, scope, ttl, Utc::now())
        .map_err(|err| api_error(StatusCode::BAD_REQUEST, &err.to_string()))?;
    state.persist();
    Ok(Json(serde_json::json!({ "token": share.token })))
}

#[derive(Deserialize)]
struct ShareRevokeRequest {
    token: String,
}

async fn handle_share_revoke(
    State(state): State<Arc<RelayState>>,
    headers: HeaderMap,
    Json(req): Json<ShareRevokeRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    require_auth(&state, &headers)?;
    state
        .store
        .revoke_share_token(&req.token, Utc::now())
        .map_err(|err| api_error(StatusCode::NOT_FOUND, &err.to_string()))?;
    state.persist();
    Ok(Json(serde_json::json!({ "status": "revoked" })))
}

/// "30m" / "2h" / "45s" / bare seconds.
fn parse_ttl(raw: &str) -> Option<std::time::Duration> {
    let raw = raw.trim();
    let (value, unit) = match raw.find(|c: char| !c.is_ascii_digit()) {
        Some(split) => raw.split_at(split),
        None => (raw, "s"),
    };
    let value: u64 = value.parse().ok()?;
    let seconds = match unit {
        "s" => value,
        "m" => value * 60,
        "h" => value * 3600,
        "d" => value * 86_400,
        _ => return None,
    };
    Some(std::time::Duration::from_secs(seconds))
}

async fn handle_ws_host(
    State(state): State<Arc<RelayState>>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let username = match require_auth(&state, &headers) {
        Ok(username) => username,
        Err(err) => return err.into_response(),
    };
    ws.max_message_size(MAX_FRAME_BYTES)
        .on_upgrade(move |socket| serve_host_socket(state, socket, username))
}

async fn handle_ws_client(
    State(state): State<Arc<RelayState>>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
    ws: WebSocketUpgrade,
) -> Response {
    // Anonymous attach uses a share token in the query string; everything
    // else authenticates with a bearer access token.
    let identity = match query.get("token") {
        Some(token) => {
            let share = state
                .store
                .get_share_token(token)
                .filter(|share| !share.is_expired(Utc::now()));
            match share {
                Some(share) => ClientIdentity::Share {
                    session_id: share.session_id,
                    scope: share.scope,
                },
                None => {
                    return api_error(StatusCode::UNAUTHORIZED, "invalid share token")
                        .into_response();
                }
            }
        }
        None => match require_auth(&state, &headers) {
            Ok(username) => ClientIdentity::User { username },
            Err(err) => return err.into_response(),
        },
    };
    ws.max_message_size(MAX_FRAME_BYTES)
        .on_upgrade(move |socket| serve_client_socket(state, socket, identity))
}

enum ClientIdentity {
    Share {
        session_id: String,
        scope: ShareScope,
    },
    User {
        username: String,
    },
}

enum Outgoing {
    Frame(Vec<u8>),
    Ping,
    Close(String),
}

struct WsConn {
    id: String,
    role: Role,
    scope: ShareScope,
    session_id: Mutex<String>,
    tx: mpsc::UnboundedSender<Outgoing>,
}

impl WsConn {
    fn new(
        role: Role,
        scope: ShareScope,
        session_id: String,
        tx: mpsc::UnboundedSender<Outgoing>,
    ) -> WsConn {
        WsConn {
            id: uuid::Uuid::new_v4().to_string(),
            role,
            scope,
            session_id: Mutex::new(session_id),
            tx,
        }
    }
}

#[async_trait::async_trait]
impl Connection for WsConn {
    fn id(&self) -> &str {
        &self.id
    }

    fn role(&self) -> Role {
        self.role
    }

    fn scope(&self) -> ShareScope {
        self.scope
    }

    fn session_id(&self) -> String {
        self.session_id.lock().unwrap().clone()
    }

    async fn send(&self, frame: &Frame) -> anyhow::Result<()> {
        self.tx
            .send(Outgoing::Frame(encode_frame(frame)))
            .map_err(|_| anyhow::anyhow!("connection closed"))
    }

    async fn close(&self, reason: &str) {
        let _ = self.tx.send(Outgoing::Close(reason.to_string()));
    }
}

/// Single writer per connection; every send carries a deadline so one stuck
/// peer cannot pin the hub's fan-out forever.
async fn write_loop(mut sink: SplitSink<WebSocket, Message>, mut rx: mpsc::UnboundedReceiver<Outgoing>) {
    while let Some(outgoing) = rx.recv().await {
        let result = match outgoing {
            Outgoing::Frame(bytes) => {
                tokio::time::timeout(WRITE_TIMEOUT, sink.send(Message::Binary(bytes))).await
            }
            Outgoing::Ping => {
                tokio::time::timeout(WRITE_TIMEOUT, sink.send(Message::Ping(Vec::new()))).await
            }
            Outgoing::Close(reason) => {
                let frame = CloseFrame {
                    code: 1000,
                    reason: reason.into(),
                };
                let _ = tokio::time::timeout(WRITE_TIMEOUT, sink.send(Message::Close(Some(frame))))
                    .await;
                break;
            }
        };
        match result {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                debug!(error = %err, "websocket write failed");
                break;
            }
            Err(_) => {
                debug!("websocket write timed out");
                break;
            }
        }
    }
}

/// Read the next decodable frame. Unknown payload tags are skipped; anything
/// else that fails to decode is answered with an Error frame and closes the
/// connection.
async fn read_frame(
    stream: &mut SplitStream<WebSocket>,
    last_activity: &Mutex<Instant>,
    tx: &mpsc::UnboundedSender<Outgoing>,
) -> Option<Frame> {
    while let Some(message) = stream.next().await {
        let message = message.ok()?;
        *last_activity.lock().unwrap() = Instant::now();
        match message {
            Message::Binary(data) => match decode_frame(&data) {
                Ok(frame) => return Some(frame),
                Err(err) if err.is_skippable() => {
                    debug!(error = %err, "skipping unknown frame");
                }
                Err(err) => {
                    debug!(error = %err, "malformed frame");
                    let error = Frame::error("", format!("malformed frame: {err}"));
                    let _ = tx.send(Outgoing::Frame(encode_frame(&error)));
                    return None;
                }
            },
            Message::Close(_) => return None,
            Message::Ping(_) | Message::Pong(_) => {}
            Message::Text(_) => {
                debug!("unexpected text frame");
                let error = Frame::error("", "expected binary frame");
                let _ = tx.send(Outgoing::Frame(encode_frame(&error)));
                return None;
            }
        }
    }
    None
}

fn spawn_ping(
    tx: mpsc::UnboundedSender<Outgoing>,
    last_activity: Arc<Mutex<Instant>>,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(PING_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = ticker.tick() => {}
            }
            if last_activity.lock().unwrap().elapsed() > PONG_TIMEOUT {
                let _ = tx.send(Outgoing::Close("ping timeout".to_string()));
                return;
            }
            if tx.send(Outgoing::Ping).is_err() {
                return;
            }
        }
    })
}

async fn serve_host_socket(state: Arc<RelayState>, socket: WebSocket, username: String) {
    let (sink, mut stream) = socket.split();
    let (tx, rx) = mpsc::unbounded_channel();
    let writer = tokio::spawn(write_loop(sink, rx));
    let last_activity = Arc::new(Mutex::new(Instant::now()));
    let cancel = CancellationToken::new();
    let pinger = spawn_ping(tx.clone(), last_activity.clone(), cancel.clone());

    let conn = Arc::new(WsConn::new(
        Role::Host,
        ShareScope::Control,
        String::new(),
        tx.clone(),
    ));

    let registered = host_handshake(&state, &mut stream, &last_activity, &conn, &username).await;
    if registered {
        while let Some(mut frame) = read_frame(&mut stream, &last_activity, &tx).await {
            frame.session_id = conn.session_id();
            if let Err(err) = state.hub.handle_host_frame(conn.as_ref(), frame).await {
                let _ = conn.send(&Frame::error(conn.session_id(), err.to_string())).await;
            }
        }
        state.hub.unregister(conn.as_ref()).await;
    }
    conn.close("closing").await;
    cancel.cancel();
    pinger.abort();
    let _ = writer.await;
}

async fn host_handshake(
    state: &RelayState,
    stream: &mut SplitStream<WebSocket>,
    last_activity: &Mutex<Instant>,
    conn: &Arc<WsConn>,
    username: &str,
) -> bool {
    let frame = match read_frame(stream, last_activity, &conn.tx).await {
        Some(frame) => frame,
        None => return false,
    };
    let hello = match &frame.payload {
        Payload::Hello(hello) if !frame.session_id.is_empty() => hello.clone(),
        _ => {
            let _ = conn.send(&Frame::error("", "missing hello")).await;
            return false;
        }
    };
    let session_id = frame.session_id;

    let now = Utc::now();
    if let Some(session) = state.store.get_session(&session_id) {
        if session.username != username {
            let _ = conn
                .send(&Frame::error(&session_id, "session belongs to another user"))
                .await;
            return false;
        }
        state.store.upsert_session(Session {
            last_active_at: now,
            status: "active".to_string(),
            ..session
        });
    } else {
        state.store.upsert_session(Session {
            id: session_id.clone(),
            username: username.to_string(),
            name: None,
            created_at: now,
            last_active_at: now,
            status: "active".to_string(),
        });
    }
    state.store.set_active_session(ActiveSession {
        session_id: session_id.clone(),
        host_connection_id: conn.id.clone(),
        last_seen_at: Some(now),
        controller_client_id: String::new(),
        cols: hello.cols,
        rows: hello.rows,
    });
    state.persist();

    *conn.session_id.lock().unwrap() = session_id.clone();
    state
        .hub
        .register_host(conn.clone(), &session_id, hello.cols, hello.rows)
        .await;
    info!(session = %session_id, username, "host connected");
    true
}

async fn serve_client_socket(state: Arc<RelayState>, socket: WebSocket, identity: ClientIdentity) {
    let (sink, mut stream) = socket.split();
    let (tx, rx) = mpsc::unbounded_channel();
    let writer = tokio::spawn(write_loop(sink, rx));
    let last_activity = Arc::new(Mutex::new(Instant::now()));
    let cancel = CancellationToken::new();
    let pinger = spawn_ping(tx.clone(), last_activity.clone(), cancel.clone());

    let scope = match &identity {
        ClientIdentity::Share { scope, .. } => *scope,
        ClientIdentity::User { .. } => ShareScope::Control,
    };
    let conn = Arc::new(WsConn::new(Role::Client, scope, String::new(), tx.clone()));

    let registered = client_handshake(&state, &mut stream, &last_activity, &conn, &identity).await;
    if registered {
        while let Some(mut frame) = read_frame(&mut stream, &last_activity, &tx).await {
            frame.session_id = conn.session_id();
            if let Err(err) = state.hub.handle_client_frame(conn.as_ref(), frame).await {
                let _ = conn.send(&Frame::error(conn.session_id(), err.to_string())).await;
            }
        }
        state.hub.unregister(conn.as_ref()).await;
    }
    conn.close("closing").await;
    cancel.cancel();
    pinger.abort();
    let _ = writer.await;
}

async fn client_handshake(
    state: &RelayState,
    stream: &mut SplitStream<WebSocket>,
    last_activity: &Mutex<Instant>,
    conn: &Arc<WsConn>,
    identity: &ClientIdentity,
) -> bool {
    let frame = match read_frame(stream, last_activity, &conn.tx).await {
        Some(frame) => frame,
        None => return false,
    };
    let hello = match &frame.payload {
        Payload::Hello(hello) => hello.clone(),
        _ => {
            let _ = conn.send(&Frame::error("", "missing hello")).await;
            return false;
        }
    };

    let session_id = match identity {
        ClientIdentity::Share { session_id, .. } => session_id.clone(),
        ClientIdentity::User { username } => {
            let session_id = frame.session_id.clone();
            if session_id.is_empty() {
                let _ = conn.send(&Frame::error("", "missing session")).await;
                return false;
            }
            if let Some(session) = state.store.get_session(&session_id) {
                if session.username != *username {
                    let _ = conn
                        .send(&Frame::error(&session_id, "session belongs to another user"))
                        .await;
                    return false;
                }
            }
            session_id
        }
    };

    *conn.session_id.lock().unwrap() = session_id.clone();
    let (granted, holder, cols, rows) = state.hub.register_client(
        conn.clone(),
        &session_id,
        &hello.client_id,
        hello.wants_control,
    );
    if !state.hub.has_host(&session_id) {
        let _ = conn.send(&Frame::error(&session_id, "no host connected")).await;
        state.hub.unregister(conn.as_ref()).await;
        return false;
    }
    let _ = conn
        .send(&Frame::welcome(&session_id, granted, cols, rows, &holder))
        .await;
    if granted {
        state.hub.broadcast_control(&session_id).await;
    }
    let hello_frame = Frame::new(&session_id, Payload::Hello(hello));
    if let Err(err) = state.hub.handle_client_frame(conn.as_ref(), hello_frame).await {
        let _ = conn.send(&Frame::error(&session_id, err.to_string())).await;
    }
    info!(session = %session_id, client = %conn.id, "client attached");
    true
}
