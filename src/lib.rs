#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::too_many_lines)]

//! hearthgate library — the building blocks of the dashboard gateway.
//!
//! - `config` — TOML + env-var configuration
//! - `store` — read-only SQLite access (sessions, system config)
//! - `secrets` — master key, AES-256-GCM envelopes, credential cache
//! - `origin` — origin allow-list policy for privileged requests
//! - `bridge` — outbound authenticated WebSocket to the event bus
//! - `relay` — browser `/ws` endpoint and the bidirectional pump
//! - `media` — media-relay subprocess supervision
//! - `proxy` — HTTP reverse proxy and `/live` media WebSocket proxy
//! - `state` — shared `AppState`

pub mod bridge;
pub mod config;
pub mod media;
pub mod origin;
pub mod proxy;
pub mod relay;
pub mod secrets;
pub mod state;
pub mod store;

// Re-export key types at crate root for convenience.
pub use config::Config;
pub use media::MediaSupervisor;
pub use secrets::{CredentialCache, MasterKey};
pub use state::AppState;
pub use store::SessionStore;

use axum::routing::get;
use axum::Router;
use tower_http::trace::TraceLayer;

/// The gateway's full route table: gateway-owned realtime paths first, then
/// everything else reverse-proxied to the internal app.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(relay::relay_upgrade))
        .route("/live/{stream}", get(proxy::media_upgrade))
        .fallback(proxy::forward_http)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
