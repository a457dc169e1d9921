//! Shared application state passed to every handler via Axum's `State` extractor.

use std::sync::Arc;
use std::time::Instant;

use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;

use crate::config::Config;
use crate::media::MediaSupervisor;
use crate::origin::OriginPolicy;
use crate::secrets::CredentialCache;
use crate::store::SessionStore;

/// Shared application state for the gateway.
#[derive(Clone)]
pub struct AppState {
    /// Immutable configuration loaded at startup.
    pub config: Arc<Config>,
    /// Monotonic instant when the gateway started (for uptime logging).
    pub start_time: Instant,
    /// Read-only handle to the dashboard application's database.
    pub store: Arc<SessionStore>,
    /// Process-cached upstream credential (decrypted at most once).
    pub credentials: Arc<CredentialCache>,
    /// Origin allow-list derived from config.
    pub origin_policy: Arc<OriginPolicy>,
    /// Owner of the media-relay subprocess lifecycle.
    pub media: Arc<MediaSupervisor>,
    /// Pooled HTTP client for the reverse proxy to the internal app.
    pub http_client: Client<HttpConnector, axum::body::Body>,
}

impl AppState {
    pub fn new(
        config: Config,
        store: SessionStore,
        credentials: CredentialCache,
        media: MediaSupervisor,
    ) -> Self {
        let origin_policy = OriginPolicy::from_config(&config.security);
        let http_client = Client::builder(TokioExecutor::new()).build_http();
        Self {
            config: Arc::new(config),
            start_time: Instant::now(),
            store: Arc::new(store),
            credentials: Arc::new(credentials),
            origin_policy: Arc::new(origin_policy),
            media: Arc::new(media),
            http_client,
        }
    }
}
