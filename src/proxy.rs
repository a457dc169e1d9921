//! Path-based dispatch behind the single public port.
//!
//! Everything that is not a gateway-owned realtime path is reverse-proxied to
//! the internal dashboard application on its loopback port, bodies streamed
//! through unbuffered. `/live/{stream}` proxies a browser WebSocket to the
//! media-relay's local API.

use std::net::SocketAddr;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{ConnectInfo, Path, Request, State};
use axum::http::header::HOST;
use axum::http::{HeaderMap, HeaderValue, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use futures_util::StreamExt;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::relay::{self, authorize_upgrade, CLOSE_UNAVAILABLE};
use crate::state::AppState;

/// Fallback handler: forward the request to the internal app process.
pub async fn forward_http(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    req: Request,
) -> Response {
    // Upgrades are only served on the gateway-owned realtime paths; they
    // never reach the internal app.
    if req.headers().contains_key(axum::http::header::UPGRADE) {
        return StatusCode::NOT_FOUND.into_response();
    }
    if !state.origin_policy.allows(req.method(), req.headers(), false) {
        debug!("Proxy refused: origin not allowed for {}", req.method());
        return StatusCode::FORBIDDEN.into_response();
    }
    match proxy_to_app(&state, peer, req).await {
        Ok(response) => response,
        Err(e) => {
            warn!("App proxy failed: {e}");
            (StatusCode::BAD_GATEWAY, "upstream application unavailable").into_response()
        }
    }
}

async fn proxy_to_app(
    state: &AppState,
    peer: SocketAddr,
    req: Request,
) -> Result<Response, Box<dyn std::error::Error + Send + Sync>> {
    let app_port = state.config.server.app_port;
    let path_and_query = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let target: Uri = format!("http://127.0.0.1:{app_port}{path_and_query}").parse()?;

    let (mut parts, body) = req.into_parts();
    let original_host = parts.headers.get(HOST).cloned();
    parts.uri = target;
    parts
        .headers
        .insert(HOST, HeaderValue::from_str(&format!("127.0.0.1:{app_port}"))?);

    // Standard forwarded headers; an existing X-Forwarded-For chain grows by
    // one hop rather than being replaced.
    let client_ip = peer.ip().to_string();
    let forwarded_for = match parts.headers.get("x-forwarded-for") {
        Some(prior) => format!("{}, {client_ip}", prior.to_str().unwrap_or_default()),
        None => client_ip,
    };
    parts
        .headers
        .insert("x-forwarded-for", HeaderValue::from_str(&forwarded_for)?);
    if let Some(host) = original_host {
        parts.headers.insert("x-forwarded-host", host);
    }
    if !parts.headers.contains_key("x-forwarded-proto") {
        parts
            .headers
            .insert("x-forwarded-proto", HeaderValue::from_static("http"));
    }

    let response = state
        .http_client
        .request(Request::from_parts(parts, body))
        .await?;
    Ok(response.map(axum::body::Body::new).into_response())
}

/// Stream ids come from URLs; only the characters the descriptor file uses for
/// stream names are accepted.
fn valid_stream_id(id: &str) -> bool {
    !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

/// GET /live/{stream} — authenticated browser WebSocket proxied to the
/// media-relay's loopback API.
pub async fn media_upgrade(
    State(state): State<AppState>,
    Path(stream): Path<String>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    if let Err(refusal) = authorize_upgrade(&state, &headers) {
        return refusal;
    }
    if !valid_stream_id(&stream) {
        return StatusCode::NOT_FOUND.into_response();
    }
    if !state.media.is_running().await {
        return (StatusCode::BAD_GATEWAY, "media relay not running").into_response();
    }

    let url = format!(
        "ws://127.0.0.1:{}/api/ws?src={stream}",
        state.config.media.api_port
    );
    ws.on_upgrade(move |socket| async move {
        let relay_id = Uuid::new_v4();
        debug!("Media relay {relay_id}: {url}");
        match tokio_tungstenite::connect_async(&url).await {
            Ok((upstream, _)) => {
                let (client_tx, client_rx) = socket.split();
                let (upstream_tx, upstream_rx) = upstream.split();
                relay::pump(client_tx, client_rx, upstream_tx, upstream_rx, relay_id).await;
            }
            Err(e) => {
                warn!("Media relay {relay_id}: connect failed: {e}");
                relay::refuse(socket, CLOSE_UNAVAILABLE, "media relay unavailable").await;
            }
        }
    })
}
