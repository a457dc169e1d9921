//! Outbound bridge to the home-automation event bus.
//!
//! Opens a WebSocket to the upstream, runs its challenge/response auth
//! handshake with the decrypted credential, and hands back a ready-to-relay
//! connection. The handshake is an explicit state machine with a single
//! transition function — exactly one of Ok/Err resolves, and the whole
//! exchange is bounded by [`HANDSHAKE_TIMEOUT`].
//!
//! Wire shape (upstream speaks first):
//!
//! ```text
//! <- {"type": "auth_required"}
//! -> {"type": "auth", "access_token": "..."}
//! <- {"type": "auth_ok"}        (or {"type": "auth_invalid"})
//! ```

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use thiserror::Error;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::debug;

use crate::secrets::UpstreamCredential;

/// Mandatory bound on the connect + auth exchange.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// A live, authenticated upstream connection.
pub type UpstreamSocket = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("upstream rejected the credential")]
    AuthFailed,
    #[error("upstream handshake timed out")]
    Timeout,
    #[error("upstream unavailable: {0}")]
    Unavailable(String),
    #[error("upstream protocol violation: {0}")]
    Protocol(String),
}

/// Handshake phases after the TCP/WS connect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HandshakeState {
    /// Waiting for the upstream's `auth_required` challenge.
    AwaitingChallenge,
    /// Credential sent, waiting for accept/reject.
    Authenticating,
}

/// What the driver loop should do after seeing one upstream message.
#[derive(Debug, PartialEq, Eq)]
enum Step {
    /// Send the credential and move to `Authenticating`.
    SendCredential,
    /// Handshake complete; the connection is relay-ready.
    Ready,
    /// Message irrelevant to the handshake; keep waiting in `state`.
    Stay(HandshakeState),
}

/// The single transition function of the handshake state machine.
fn advance(state: HandshakeState, msg_type: &str) -> Result<Step, BridgeError> {
    match (state, msg_type) {
        (HandshakeState::AwaitingChallenge, "auth_required") => Ok(Step::SendCredential),
        (HandshakeState::Authenticating, "auth_ok") => Ok(Step::Ready),
        (HandshakeState::Authenticating, "auth_invalid") => Err(BridgeError::AuthFailed),
        // Upstreams may emit informational frames (pings are handled at the
        // transport layer); anything unrecognized leaves the state unchanged.
        (s, _) => Ok(Step::Stay(s)),
    }
}

/// Map the stored base URL to the event-bus WebSocket endpoint.
pub fn websocket_url(base_url: &str) -> Result<String, BridgeError> {
    let base = base_url.trim_end_matches('/');
    let ws_base = if let Some(rest) = base.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = base.strip_prefix("http://") {
        format!("ws://{rest}")
    } else if base.starts_with("ws://") || base.starts_with("wss://") {
        base.to_string()
    } else {
        return Err(BridgeError::Protocol(format!(
            "unsupported upstream URL scheme: {base_url}"
        )));
    };
    Ok(format!("{ws_base}/api/websocket"))
}

/// Connect and authenticate with the production timeout.
pub async fn connect(cred: &UpstreamCredential) -> Result<UpstreamSocket, BridgeError> {
    connect_with_timeout(cred, HANDSHAKE_TIMEOUT).await
}

/// Connect and authenticate, bounding the whole exchange by `timeout`.
///
/// The caller dropping this future (browser gone mid-handshake) cancels the
/// in-flight connect and closes the socket — tungstenite streams close on drop.
pub async fn connect_with_timeout(
    cred: &UpstreamCredential,
    timeout: Duration,
) -> Result<UpstreamSocket, BridgeError> {
    let url = websocket_url(&cred.base_url)?;
    match tokio::time::timeout(timeout, handshake(&url, &cred.token)).await {
        Ok(result) => result,
        Err(_) => Err(BridgeError::Timeout),
    }
}

async fn handshake(url: &str, token: &str) -> Result<UpstreamSocket, BridgeError> {
    debug!("Bridge: connecting to {url}");
    let (mut socket, _response) = tokio_tungstenite::connect_async(url)
        .await
        .map_err(|e| BridgeError::Unavailable(e.to_string()))?;

    let mut state = HandshakeState::AwaitingChallenge;
    loop {
        let msg = match socket.next().await {
            Some(Ok(Message::Text(text))) => text,
            Some(Ok(Message::Close(_))) | None => {
                return Err(BridgeError::Unavailable(
                    "upstream closed during handshake".to_string(),
                ));
            }
            Some(Ok(_)) => continue,
            Some(Err(e)) => return Err(BridgeError::Unavailable(e.to_string())),
        };
        let parsed: Value = serde_json::from_str(&msg)
            .map_err(|e| BridgeError::Protocol(format!("non-JSON handshake frame: {e}")))?;
        let msg_type = parsed["type"].as_str().unwrap_or("");

        match advance(state, msg_type)? {
            Step::SendCredential => {
                let auth = json!({"type": "auth", "access_token": token});
                socket
                    .send(Message::Text(auth.to_string().into()))
                    .await
                    .map_err(|e| BridgeError::Unavailable(e.to_string()))?;
                state = HandshakeState::Authenticating;
            }
            Step::Ready => {
                debug!("Bridge: upstream handshake complete");
                return Ok(socket);
            }
            Step::Stay(s) => state = s,
        }
    }
}
