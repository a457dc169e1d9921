//! Browser-facing realtime relay.
//!
//! `/ws` authenticates the browser (origin policy + session cookie) before the
//! upgrade, opens the authenticated upstream bridge, then forwards frames in
//! both directions verbatim. The browser never sees the upstream token; the
//! only frame the gateway injects is the initial `{"type":"ready"}` ack.
//!
//! Refusals before the upgrade are plain HTTP statuses (403/401). Refusals
//! after the upgrade are WebSocket close codes:
//!
//! - 4000 upstream not configured
//! - 4001 upstream rejected the credential
//! - 4002 upstream handshake timed out
//! - 4003 upstream unavailable

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::{HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::bridge::{self, BridgeError, UpstreamSocket};
use crate::state::AppState;

pub const CLOSE_NOT_CONFIGURED: u16 = 4000;
pub const CLOSE_AUTH_FAILED: u16 = 4001;
pub const CLOSE_TIMEOUT: u16 = 4002;
pub const CLOSE_UNAVAILABLE: u16 = 4003;

const READY_ACK: &str = r#"{"type":"ready"}"#;

/// Extract the named cookie's value from the request headers.
pub fn cookie_value(headers: &HeaderMap, name: &str) -> Option<String> {
    let raw = headers.get("cookie")?.to_str().ok()?;
    raw.split(';').find_map(|pair| {
        let (k, v) = pair.trim().split_once('=')?;
        (k == name).then(|| v.to_string())
    })
}

/// Shared pre-upgrade gate for both relay endpoints: origin policy first,
/// then session cookie. Returns the authenticated user id.
pub fn authorize_upgrade(state: &AppState, headers: &HeaderMap) -> Result<String, Response> {
    if !state.origin_policy.allows(&Method::GET, headers, true) {
        debug!("Upgrade refused: origin not allowed");
        return Err(StatusCode::FORBIDDEN.into_response());
    }
    let Some(token) = cookie_value(headers, &state.config.security.session_cookie) else {
        return Err(StatusCode::UNAUTHORIZED.into_response());
    };
    match state.store.validate_session_now(&token) {
        Ok(Some(user_id)) => Ok(user_id),
        Ok(None) => Err(StatusCode::UNAUTHORIZED.into_response()),
        Err(e) => {
            warn!("Session lookup failed: {e}");
            Err(StatusCode::INTERNAL_SERVER_ERROR.into_response())
        }
    }
}

/// GET /ws — authenticated browser relay to the upstream event bus.
pub async fn relay_upgrade(
    State(state): State<AppState>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let user_id = match authorize_upgrade(&state, &headers) {
        Ok(user_id) => user_id,
        Err(refusal) => return refusal,
    };
    ws.on_upgrade(move |socket| handle_relay(socket, state, user_id))
}

async fn handle_relay(socket: WebSocket, state: AppState, user_id: String) {
    let relay_id = Uuid::new_v4();
    info!("Relay {relay_id}: session opened for {user_id}");

    let cred = match state.credentials.get(&state.store).await {
        Ok(Some(cred)) => cred,
        Ok(None) => {
            info!("Relay {relay_id}: upstream not configured");
            refuse(socket, CLOSE_NOT_CONFIGURED, "upstream not configured").await;
            return;
        }
        Err(e) => {
            warn!("Relay {relay_id}: credential unavailable: {e}");
            refuse(socket, CLOSE_NOT_CONFIGURED, "upstream not configured").await;
            return;
        }
    };

    let (mut client_tx, mut client_rx) = socket.split();

    // Run the upstream handshake while still watching the browser side, so a
    // browser that disconnects mid-handshake cancels the in-flight connect.
    // Data frames the browser sends early are held until the relay is ready.
    let mut early_frames = Vec::new();
    let mut connect = std::pin::pin!(bridge::connect(&cred));
    let upstream = loop {
        tokio::select! {
            result = &mut connect => break result,
            msg = client_rx.next() => match msg {
                Some(Ok(Message::Close(_))) | None => {
                    debug!("Relay {relay_id}: browser left during handshake");
                    return;
                }
                Some(Ok(frame)) => early_frames.push(frame),
                Some(Err(_)) => return,
            },
        }
    };

    let mut upstream = match upstream {
        Ok(socket) => socket,
        Err(e) => {
            let (code, reason) = match &e {
                BridgeError::AuthFailed => (CLOSE_AUTH_FAILED, "upstream authentication failed"),
                BridgeError::Timeout => (CLOSE_TIMEOUT, "upstream timeout"),
                BridgeError::Unavailable(_) | BridgeError::Protocol(_) => {
                    (CLOSE_UNAVAILABLE, "upstream unavailable")
                }
            };
            warn!("Relay {relay_id}: {e}");
            let frame = Some(CloseFrame {
                code,
                reason: reason.into(),
            });
            let _ = client_tx.send(Message::Close(frame)).await;
            return;
        }
    };

    if client_tx.send(Message::Text(READY_ACK.into())).await.is_err() {
        return;
    }
    for frame in early_frames.drain(..) {
        if let Some(msg) = to_upstream(frame) {
            if upstream.send(msg).await.is_err() {
                return;
            }
        }
    }

    let (upstream_tx, upstream_rx) = upstream.split();
    pump(client_tx, client_rx, upstream_tx, upstream_rx, relay_id).await;
    info!("Relay {relay_id}: session closed");
}

/// Forward frames both ways until either peer closes or errors; the surviving
/// side is then torn down too. Close frames propagate so close codes survive
/// the trip.
pub async fn pump(
    mut client_tx: futures_util::stream::SplitSink<WebSocket, Message>,
    mut client_rx: futures_util::stream::SplitStream<WebSocket>,
    mut upstream_tx: futures_util::stream::SplitSink<UpstreamSocket, tungstenite::Message>,
    mut upstream_rx: futures_util::stream::SplitStream<UpstreamSocket>,
    relay_id: Uuid,
) {
    let client_to_upstream = async {
        while let Some(msg) = client_rx.next().await {
            let Ok(msg) = msg else { break };
            let done = matches!(msg, Message::Close(_));
            if let Some(out) = to_upstream(msg) {
                if upstream_tx.send(out).await.is_err() {
                    break;
                }
            }
            if done {
                break;
            }
        }
        let _ = upstream_tx.close().await;
    };

    let upstream_to_client = async {
        while let Some(msg) = upstream_rx.next().await {
            let Ok(msg) = msg else { break };
            let done = matches!(msg, tungstenite::Message::Close(_));
            if let Some(out) = to_client(msg) {
                if client_tx.send(out).await.is_err() {
                    break;
                }
            }
            if done {
                break;
            }
        }
        let _ = client_tx.close().await;
    };

    // Either direction finishing ends the session; select drops the other
    // half, closing its sockets.
    tokio::select! {
        _ = client_to_upstream => debug!("Relay {relay_id}: browser side finished"),
        _ = upstream_to_client => debug!("Relay {relay_id}: upstream side finished"),
    }
}

fn to_upstream(msg: Message) -> Option<tungstenite::Message> {
    match msg {
        Message::Text(text) => Some(tungstenite::Message::Text(text.as_str().into())),
        Message::Binary(data) => Some(tungstenite::Message::Binary(data)),
        Message::Ping(data) => Some(tungstenite::Message::Ping(data)),
        Message::Pong(data) => Some(tungstenite::Message::Pong(data)),
        Message::Close(frame) => Some(tungstenite::Message::Close(frame.map(|f| {
            tungstenite::protocol::CloseFrame {
                code: f.code.into(),
                reason: f.reason.as_str().to_string().into(),
            }
        }))),
    }
}

fn to_client(msg: tungstenite::Message) -> Option<Message> {
    match msg {
        tungstenite::Message::Text(text) => Some(Message::Text(text.as_str().into())),
        tungstenite::Message::Binary(data) => Some(Message::Binary(data)),
        tungstenite::Message::Ping(data) => Some(Message::Ping(data)),
        tungstenite::Message::Pong(data) => Some(Message::Pong(data)),
        tungstenite::Message::Close(frame) => Some(Message::Close(frame.map(|f| CloseFrame {
            code: f.code.into(),
            reason: f.reason.as_str().into(),
        }))),
        // Raw frames never surface from a configured stream.
        tungstenite::Message::Frame(_) => None,
    }
}

pub(crate) async fn refuse(mut socket: WebSocket, code: u16, reason: &'static str) {
    let frame = Some(CloseFrame {
        code,
        reason: reason.into(),
    });
    let _ = socket.send(Message::Close(frame)).await;
}
