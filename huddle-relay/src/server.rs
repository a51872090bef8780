//! HTTP and WebSocket surface of the relay.
//!
//! Routes:
//!
//! | Method | Path | |
//! |---|---|---|
//! | GET | `/ws?token=` | realtime socket; the token is the numeric user id |
//! | GET | `/channels` | channel list with unread counts |
//! | GET | `/channels/{id}/messages?limit&offset` | one history page |
//! | POST | `/channels/{id}/read` | mark read |
//! | POST, DELETE | `/channels/{id}/messages/{mid}/reactions` | toggle a reaction |
//!
//! REST calls authenticate with `Authorization: Bearer <user id>`.

use std::sync::Arc;

use axum::Json;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{FromRequestParts, Path, Query, State};
use axum::http::StatusCode;
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;

use huddle_proto::event::{PresenceStatus, ServerEvent, WireMessage};
use huddle_proto::ids::{ChannelId, MessageId, UserId};
use huddle_proto::outbound::ClientFrame;
use huddle_proto::rest::{ChannelSummary, HistoryQuery, ReactionBody, ReadConfirmation};

use crate::state::RelayState;
use crate::store::StoreError;

type SharedState = Arc<RelayState>;

/// Starts the relay server on `addr` with empty state.
///
/// # Errors
///
/// Returns an error if the TCP listener cannot bind to the given address.
pub async fn start_server(
    addr: &str,
) -> Result<
    (std::net::SocketAddr, tokio::task::JoinHandle<()>),
    Box<dyn std::error::Error + Send + Sync>,
> {
    start_server_with_state(addr, Arc::new(RelayState::new())).await
}

/// Starts the relay server with pre-seeded state. Bind to `127.0.0.1:0` in
/// tests to get an OS-assigned port.
///
/// # Errors
///
/// Returns an error if the TCP listener cannot bind to the given address.
pub async fn start_server_with_state(
    addr: &str,
    state: SharedState,
) -> Result<
    (std::net::SocketAddr, tokio::task::JoinHandle<()>),
    Box<dyn std::error::Error + Send + Sync>,
> {
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    let bound_addr = listener.local_addr()?;

    let handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!(error = %e, "relay server error");
        }
    });

    Ok((bound_addr, handle))
}

fn router(state: SharedState) -> axum::Router {
    axum::Router::new()
        .route("/ws", get(ws_handler))
        .route("/channels", get(list_channels))
        .route("/channels/{id}/messages", get(history))
        .route("/channels/{id}/read", post(mark_read))
        .route(
            "/channels/{id}/messages/{mid}/reactions",
            post(add_reaction).delete(remove_reaction),
        )
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Authentication and errors
// ---------------------------------------------------------------------------

/// The caller, from `Authorization: Bearer <user id>`.
struct AuthUser(UserId);

impl<S: Send + Sync> FromRequestParts<S> for AuthUser {
    type Rejection = StatusCode;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .and_then(parse_token)
            .map(Self)
            .ok_or(StatusCode::UNAUTHORIZED)
    }
}

fn parse_token(token: &str) -> Option<UserId> {
    token.trim().parse().ok().map(UserId)
}

impl IntoResponse for StoreError {
    fn into_response(self) -> Response {
        let status = match self {
            Self::UnknownChannel(_) | Self::UnknownMessage(_) => StatusCode::NOT_FOUND,
            Self::NotMember { .. } => StatusCode::FORBIDDEN,
        };
        (status, self.to_string()).into_response()
    }
}

// ---------------------------------------------------------------------------
// REST handlers
// ---------------------------------------------------------------------------

async fn list_channels(
    State(state): State<SharedState>,
    AuthUser(user): AuthUser,
) -> Json<Vec<ChannelSummary>> {
    Json(state.store.summaries(user).await)
}

async fn history(
    State(state): State<SharedState>,
    AuthUser(user): AuthUser,
    Path(id): Path<i64>,
    Query(mut query): Query<HistoryQuery>,
) -> Result<Json<Vec<WireMessage>>, StoreError> {
    query.limit = query.limit.min(state.max_page_size());
    Ok(Json(state.store.history(user, ChannelId(id), query).await?))
}

async fn mark_read(
    State(state): State<SharedState>,
    AuthUser(user): AuthUser,
    Path(id): Path<i64>,
) -> Result<Json<ReadConfirmation>, StoreError> {
    let channel = ChannelId(id);
    let confirmation = state.store.mark_read(user, channel).await?;
    if let Some(last_read_id) = confirmation.last_read_id {
        let members = state.store.members(channel).await.unwrap_or_default();
        let receipt = ServerEvent::ReadReceipt {
            channel_id: channel,
            user_id: user,
            last_read_id,
        };
        state.broadcast(&members, &receipt, None).await;
    }
    Ok(Json(confirmation))
}

async fn add_reaction(
    State(state): State<SharedState>,
    AuthUser(user): AuthUser,
    Path((id, mid)): Path<(i64, i64)>,
    Json(body): Json<ReactionBody>,
) -> Result<StatusCode, StoreError> {
    let channel = ChannelId(id);
    let message_id = MessageId(mid);
    if let Some(reaction) = state
        .store
        .add_reaction(user, channel, message_id, &body.emoji)
        .await?
    {
        let members = state.store.members(channel).await.unwrap_or_default();
        let event = ServerEvent::ReactionAdded {
            message_id,
            reaction,
        };
        state.broadcast(&members, &event, None).await;
    }
    Ok(StatusCode::NO_CONTENT)
}

async fn remove_reaction(
    State(state): State<SharedState>,
    AuthUser(user): AuthUser,
    Path((id, mid)): Path<(i64, i64)>,
    Json(body): Json<ReactionBody>,
) -> Result<StatusCode, StoreError> {
    let channel = ChannelId(id);
    let message_id = MessageId(mid);
    if state
        .store
        .remove_reaction(user, channel, message_id, &body.emoji)
        .await?
    {
        let members = state.store.members(channel).await.unwrap_or_default();
        let event = ServerEvent::ReactionRemoved {
            message_id,
            user_id: user,
            emoji: body.emoji,
        };
        state.broadcast(&members, &event, None).await;
    }
    Ok(StatusCode::NO_CONTENT)
}

// ---------------------------------------------------------------------------
// WebSocket
// ---------------------------------------------------------------------------

#[derive(serde::Deserialize)]
struct WsParams {
    token: String,
}

/// Upgrades to a WebSocket once the token names a user.
async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<SharedState>,
    Query(params): Query<WsParams>,
) -> Response {
    let Some(user) = parse_token(&params.token) else {
        return StatusCode::UNAUTHORIZED.into_response();
    };
    ws.on_upgrade(move |socket| handle_socket(socket, state, user))
}

/// Handles one connected user.
///
/// The connection lifecycle:
/// 1. Register the writer and announce the user online.
/// 2. Tell the new socket who else is online.
/// 3. Apply inbound `message`/`typing` frames until the socket closes.
/// 4. Unregister and announce the user offline, unless a newer
///    connection replaced this one.
pub async fn handle_socket(socket: WebSocket, state: SharedState, user: UserId) {
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();

    let (conn_id, replaced) = state.register(user, tx).await;
    tracing::info!(user_id = %user, replaced, "user connected");
    if !replaced {
        state.announce_presence(user, PresenceStatus::Online).await;
    }
    for other in state.online_users().await {
        if other != user {
            let event = ServerEvent::UserPresence {
                user_id: other,
                status: PresenceStatus::Online,
                last_seen: None,
            };
            state.send_to(user, &event).await;
        }
    }

    let mut write_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let closing = matches!(msg, Message::Close(_));
            if ws_sender.send(msg).await.is_err() {
                tracing::warn!(user_id = %user, "WebSocket write failed");
                break;
            }
            if closing {
                break;
            }
        }
    });

    let reader_state = Arc::clone(&state);
    let mut read_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = ws_receiver.next().await {
            match msg {
                Message::Text(text) => handle_frame(&reader_state, user, text.as_str()).await,
                Message::Binary(data) => match std::str::from_utf8(&data) {
                    Ok(text) => handle_frame(&reader_state, user, text).await,
                    Err(e) => tracing::warn!(user_id = %user, error = %e, "binary frame is not UTF-8"),
                },
                Message::Close(_) => {
                    tracing::info!(user_id = %user, "received close frame");
                    break;
                }
                // axum answers pings itself.
                Message::Ping(_) | Message::Pong(_) => {}
            }
        }
    });

    tokio::select! {
        _ = &mut read_task => {
            write_task.abort();
        }
        _ = &mut write_task => {
            read_task.abort();
        }
    }

    if state.unregister(user, conn_id).await {
        state.announce_presence(user, PresenceStatus::Offline).await;
        tracing::info!(user_id = %user, "user disconnected");
    }
}

/// Applies one client frame.
async fn handle_frame(state: &RelayState, user: UserId, text: &str) {
    let frame: ClientFrame = match serde_json::from_str(text) {
        Ok(f) => f,
        Err(e) => {
            tracing::warn!(user_id = %user, error = %e, "failed to decode client frame");
            return;
        }
    };

    match frame {
        ClientFrame::Message {
            channel_id,
            content,
            parent_id,
            client_nonce,
        } => {
            match state
                .store
                .post(user, channel_id, content, parent_id, Some(client_nonce))
                .await
            {
                Ok(message) => {
                    tracing::debug!(user_id = %user, channel_id = %channel_id, id = %message.id, "message posted");
                    let members = state.store.members(channel_id).await.unwrap_or_default();
                    state
                        .broadcast(&members, &ServerEvent::NewMessage(message), None)
                        .await;
                }
                Err(e) => tracing::warn!(user_id = %user, error = %e, "message rejected"),
            }
        }
        ClientFrame::Typing {
            channel_id,
            is_typing,
        } => {
            let Some(members) = state.store.members(channel_id).await else {
                return;
            };
            if !members.contains(&user) {
                return;
            }
            let username = state.store.username(user).await;
            let event = ServerEvent::Typing {
                user_id: user,
                full_name: username.clone(),
                username,
                is_typing,
                channel_id: Some(channel_id),
            };
            state.broadcast(&members, &event, Some(user)).await;
        }
    }
}
