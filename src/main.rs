#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! # hearthgate
//!
//! Single-port gateway for a browser-based home-automation dashboard.
//!
//! hearthgate sits on the public port and owns three jobs:
//!
//! - reverse-proxy HTTP to the internal dashboard app on its loopback port
//! - relay authenticated browser WebSockets to the upstream event bus,
//!   running the upstream's credential handshake itself so the token never
//!   reaches a browser
//! - supervise the media-relay subprocess that serves camera streams
//!
//! ## Surface
//!
//! | Method | Path             | Auth              | Description                    |
//! |--------|------------------|-------------------|--------------------------------|
//! | GET    | `/ws`            | cookie + origin   | Relay to the event bus         |
//! | GET    | `/live/{stream}` | cookie + origin   | Proxy to the media-relay API   |
//! | any    | `/*`             | app's own         | Reverse proxy to the app       |
//!
//! ## Architecture
//!
//! ```text
//! main.rs      — entry point, clap, router setup, graceful shutdown
//! config.rs    — TOML + env-var configuration
//! store.rs     — read-only SQLite (sessions, system_config)
//! secrets.rs   — master key, AES-256-GCM envelopes, credential cache
//! origin.rs    — origin allow-list for privileged requests
//! bridge.rs    — outbound WS to the event bus, auth handshake
//! relay.rs     — /ws upgrade, close-code taxonomy, bidirectional pump
//! media.rs     — media-relay subprocess supervision + descriptor watcher
//! proxy.rs     — HTTP reverse proxy, /live media WS proxy
//! ```

use std::net::SocketAddr;

use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tracing::{error, info};

use hearthgate::media::MediaSupervisor;
use hearthgate::secrets::{CredentialCache, MasterKey};
use hearthgate::store::SessionStore;
use hearthgate::{AppState, Config};

/// Single-port gateway for the home-automation dashboard.
#[derive(Parser)]
#[command(name = "hearthgate", version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the gateway (default when no subcommand given).
    Serve {
        /// Path to TOML config file.
        #[arg(long)]
        config: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let config_path = match cli.command {
        Some(Commands::Serve { config }) => config,
        None => None,
    };
    run_server(config_path.as_deref()).await;
}

async fn run_server(config_path: Option<&str>) {
    let config = Config::load(config_path);

    // Initialize tracing
    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| config.logging.level.clone());
    tracing_subscriber::fmt().with_env_filter(log_filter).init();

    info!("hearthgate v{} starting", env!("CARGO_PKG_VERSION"));
    info!("Listening on {}", config.server.listen);
    info!("Proxying app on 127.0.0.1:{}", config.server.app_port);

    // Both of these are startup-fatal: without the key we can never decrypt
    // the upstream credential, and without the store we can never authenticate
    // a browser.
    let key = match MasterKey::resolve(&config.security.key_file) {
        Ok(key) => key,
        Err(e) => {
            error!("{e}");
            std::process::exit(1);
        }
    };
    let store = match SessionStore::open(&config.store.db_path) {
        Ok(store) => store,
        Err(e) => {
            error!("{e}");
            std::process::exit(1);
        }
    };

    let media = MediaSupervisor::new(config.media.clone());
    let state = AppState::new(config, store, CredentialCache::new(key), media);

    let watcher_task = state.media.spawn_watcher();

    let listener = TcpListener::bind(&state.config.server.listen)
        .await
        .expect("Failed to bind");

    info!("Gateway ready");

    // Graceful shutdown
    let shutdown = async {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            let mut sigterm =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                    .expect("Failed to register SIGTERM");
            tokio::select! {
                _ = ctrl_c => info!("Received SIGINT"),
                _ = sigterm.recv() => info!("Received SIGTERM"),
            }
        }
        #[cfg(not(unix))]
        {
            ctrl_c.await.ok();
            info!("Received SIGINT");
        }
    };

    let app = hearthgate::router(state.clone());
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await
    .expect("Server error");

    // Cleanup
    info!("Shutting down...");
    watcher_task.abort();
    state.media.stop().await;
    info!("Goodbye (up {}s)", state.start_time.elapsed().as_secs());
}
