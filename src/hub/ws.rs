use axum::{
    extract::{
        FromRequestParts, Query, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    http::request::Parts,
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt, stream::SplitSink, stream::SplitStream};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::api::{ApiError, SharedState};
use super::auth::user_from_token;

/// How often to send WebSocket Ping frames.
const PING_INTERVAL: Duration = Duration::from_secs(30);

/// How long to wait for a Pong response before considering the connection dead.
const PONG_TIMEOUT: Duration = Duration::from_secs(60);

// ── WebSocket message types ──────────────────────────────────────────

/// Change notices pushed to clients. They never carry bodies or codes;
/// clients refetch through the API with their own permissions.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "data")]
pub enum WsMessage {
    MessageReceived {
        message_id: i64,
        number_id: Option<i64>,
        to_number: String,
        has_otp: bool,
    },
    MessageRead {
        message_id: i64,
        number_id: Option<i64>,
        is_read: bool,
    },
}

/// A serialized message plus who may receive it. Admins receive everything;
/// other users only notices naming them in `user_ids`.
#[derive(Debug, Clone)]
pub struct Notice {
    pub user_ids: Vec<i64>,
    pub json: String,
}

/// The connected client, fixed at upgrade time.
#[derive(Debug, Clone, Copy)]
pub struct Viewer {
    pub user_id: i64,
    pub is_admin: bool,
}

impl Notice {
    pub fn visible_to(&self, viewer: &Viewer) -> bool {
        viewer.is_admin || self.user_ids.contains(&viewer.user_id)
    }
}

// ── WebSocket handler ────────────────────────────────────────────────

#[derive(Deserialize)]
pub struct WsQuery {
    pub token: Option<String>,
}

/// The connecting viewer, authenticated from `?token=`. Browsers cannot set
/// headers on a WebSocket handshake, so the bearer token travels in the query.
pub struct WsViewer(pub Viewer);

impl FromRequestParts<SharedState> for WsViewer {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &SharedState,
    ) -> Result<Self, Self::Rejection> {
        let Query(query) = Query::<WsQuery>::try_from_uri(&parts.uri)
            .map_err(|_| ApiError::Unauthorized("Not authenticated".into()))?;
        let token = query
            .token
            .filter(|t| !t.is_empty())
            .ok_or_else(|| ApiError::Unauthorized("Not authenticated".into()))?;
        let user = user_from_token(state, &token).await?;
        Ok(WsViewer(Viewer {
            user_id: user.id,
            is_admin: user.is_admin(),
        }))
    }
}

/// `GET /ws`. The viewer is authenticated before the upgrade is checked.
pub async fn ws_handler(
    WsViewer(viewer): WsViewer,
    State(state): State<SharedState>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let rx = state.ws_tx.subscribe();
    debug!(user_id = viewer.user_id, "websocket client connected");
    ws.on_upgrade(move |socket| handle_socket(socket, viewer, rx))
}

async fn handle_socket(socket: WebSocket, viewer: Viewer, rx: broadcast::Receiver<Notice>) {
    let (sender, receiver) = socket.split();
    run_socket_loop(sender, receiver, rx, viewer).await;
    debug!(user_id = viewer.user_id, "websocket client disconnected");
}

/// Core WebSocket loop with ping/pong keepalive.
///
/// Forwards notices the viewer may see, drains client frames and sends a
/// Ping every [`PING_INTERVAL`]. A connection silent for longer than
/// [`PONG_TIMEOUT`] after a Ping is dropped.
async fn run_socket_loop(
    mut sender: SplitSink<WebSocket, Message>,
    mut receiver: SplitStream<WebSocket>,
    mut rx: broadcast::Receiver<Notice>,
    viewer: Viewer,
) {
    let mut ping_interval = tokio::time::interval(PING_INTERVAL);
    // First tick completes immediately.
    ping_interval.tick().await;

    let mut last_pong = Instant::now();
    let mut awaiting_pong = false;

    loop {
        tokio::select! {
            // ── Periodic ping ───────────────────────────────────────
            _ = ping_interval.tick() => {
                if awaiting_pong && last_pong.elapsed() > PONG_TIMEOUT {
                    break;
                }
                if sender.send(Message::Ping(Default::default())).await.is_err() {
                    break;
                }
                awaiting_pong = true;
            }

            // ── Notice forwarding ───────────────────────────────────
            result = rx.recv() => {
                match result {
                    Ok(notice) => {
                        if !notice.visible_to(&viewer) {
                            continue;
                        }
                        if sender.send(Message::Text(notice.json.into())).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(user_id = viewer.user_id, skipped, "websocket client lagged");
                        continue;
                    }
                }
            }

            // ── Client frames ───────────────────────────────────────
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Pong(_))) => {
                        last_pong = Instant::now();
                        awaiting_pong = false;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(_)) => break,
                }
            }
        }
    }

    let _ = sender.send(Message::Close(None)).await;
}

// ── Broadcast helper ─────────────────────────────────────────────────

/// Serialize and broadcast a WsMessage to admins and `user_ids`.
/// Returns silently even if no clients are connected.
pub fn broadcast_message(tx: &broadcast::Sender<Notice>, msg: &WsMessage, user_ids: Vec<i64>) {
    match serde_json::to_string(msg) {
        Ok(json) => {
            let _ = tx.send(Notice { user_ids, json });
        }
        Err(e) => {
            warn!(error = %e, "failed to serialize websocket message");
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────────
