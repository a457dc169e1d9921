//! Configuration loading and defaults.
//!
//! Configuration is resolved in order of precedence (highest wins):
//!
//! 1. **Environment variables** — `HEARTHGATE_LISTEN`, `HEARTHGATE_PRODUCTION`,
//!    `HEARTHGATE_DB_PATH`, `HEARTHGATE_MASTER_KEY` (see `secrets.rs`)
//! 2. **Config file** — path via `--config <path>`, or `hearthgate.toml` in CWD
//! 3. **Compiled defaults** — see each field's default value below
//!
//! The TOML file mirrors the struct hierarchy:
//!
//! ```toml
//! [server]
//! listen = "0.0.0.0:8099"
//! app_port = 3000              # internal dashboard app (loopback)
//!
//! [security]
//! production = false
//! allowed_origins = ["home.example.com"]
//! public_base_url = "https://home.example.com"
//! key_file = "/var/lib/hearthgate/master.key"
//! session_cookie = "session"
//!
//! [store]
//! db_path = "/var/lib/hearthgate/dashboard.db"
//!
//! [media]
//! binary_path = "/usr/local/bin/go2rtc"
//! config_path = "/var/lib/hearthgate/streams.json"
//! crash_log = "/var/lib/hearthgate/media-crash.log"
//! api_port = 1984
//! poll_interval_secs = 3
//! restart_backoff_secs = 5
//!
//! [logging]
//! level = "info"
//! ```

use serde::Deserialize;
use std::path::Path;

/// Top-level configuration, deserialized from TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub security: SecurityConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub media: MediaConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Public listener and internal target ports.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Socket address to bind (default `0.0.0.0:8099`).
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Loopback port of the internal dashboard application process.
    #[serde(default = "default_app_port")]
    pub app_port: u16,
}

/// Origin policy, session cookie, and encryption key resolution.
#[derive(Debug, Clone, Deserialize)]
pub struct SecurityConfig {
    /// Production mode enables the origin allow-list (default false).
    #[serde(default)]
    pub production: bool,
    /// Hosts allowed to originate privileged requests in production.
    #[serde(default)]
    pub allowed_origins: Vec<String>,
    /// Public base URL of the dashboard; its host joins the allow-list.
    pub public_base_url: Option<String>,
    /// Key file consulted when `HEARTHGATE_MASTER_KEY` is not set.
    #[serde(default = "default_key_file")]
    pub key_file: String,
    /// Name of the browser session cookie (default `session`).
    #[serde(default = "default_session_cookie")]
    pub session_cookie: String,
}

/// Persistent store owned by the dashboard application layer.
#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    /// SQLite database path (sessions + system config records).
    #[serde(default = "default_db_path")]
    pub db_path: String,
}

/// Media-relay subprocess settings.
#[derive(Debug, Clone, Deserialize)]
pub struct MediaConfig {
    /// Path to the media-relay binary.
    #[serde(default = "default_media_binary")]
    pub binary_path: String,
    /// Stream descriptor file written by the application layer.
    #[serde(default = "default_media_config")]
    pub config_path: String,
    /// Crash log appended to on abnormal child exit.
    #[serde(default = "default_crash_log")]
    pub crash_log: String,
    /// Loopback API port the media server listens on.
    #[serde(default = "default_media_api_port")]
    pub api_port: u16,
    /// Seconds between descriptor-file polls (default 3).
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    /// Seconds to wait before the single post-crash restart (default 5).
    #[serde(default = "default_restart_backoff")]
    pub restart_backoff_secs: u64,
    /// Seconds to wait for the API port during the startup probe (default 10).
    #[serde(default = "default_startup_probe")]
    pub startup_probe_secs: u64,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// tracing filter level (default `info`). Overridden by `RUST_LOG` env var.
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_listen() -> String {
    "0.0.0.0:8099".to_string()
}
fn default_app_port() -> u16 {
    3000
}
fn default_key_file() -> String {
    "/var/lib/hearthgate/master.key".to_string()
}
fn default_session_cookie() -> String {
    "session".to_string()
}
fn default_db_path() -> String {
    "/var/lib/hearthgate/dashboard.db".to_string()
}
fn default_media_binary() -> String {
    "/usr/local/bin/go2rtc".to_string()
}
fn default_media_config() -> String {
    "/var/lib/hearthgate/streams.json".to_string()
}
fn default_crash_log() -> String {
    "/var/lib/hearthgate/media-crash.log".to_string()
}
fn default_media_api_port() -> u16 {
    1984
}
fn default_poll_interval() -> u64 {
    3
}
fn default_restart_backoff() -> u64 {
    5
}
fn default_startup_probe() -> u64 {
    10
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            app_port: default_app_port(),
        }
    }
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            production: false,
            allowed_origins: Vec::new(),
            public_base_url: None,
            key_file: default_key_file(),
            session_cookie: default_session_cookie(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
        }
    }
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            binary_path: default_media_binary(),
            config_path: default_media_config(),
            crash_log: default_crash_log(),
            api_port: default_media_api_port(),
            poll_interval_secs: default_poll_interval(),
            restart_backoff_secs: default_restart_backoff(),
            startup_probe_secs: default_startup_probe(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            security: SecurityConfig::default(),
            store: StoreConfig::default(),
            media: MediaConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration with the precedence chain: env vars > file > defaults.
    ///
    /// If `path` is `Some`, reads that file (panics on failure). Otherwise looks
    /// for `hearthgate.toml` in the current directory, falling back to compiled
    /// defaults.
    pub fn load(path: Option<&str>) -> Self {
        let mut config: Config = if let Some(p) = path {
            let content = std::fs::read_to_string(p)
                .unwrap_or_else(|e| panic!("Failed to read config file {p}: {e}"));
            toml::from_str(&content)
                .unwrap_or_else(|e| panic!("Failed to parse config file {p}: {e}"))
        } else if Path::new("hearthgate.toml").exists() {
            let content =
                std::fs::read_to_string("hearthgate.toml").expect("Failed to read hearthgate.toml");
            toml::from_str(&content).expect("Failed to parse hearthgate.toml")
        } else {
            Config::default()
        };

        // Env var overrides
        if let Ok(listen) = std::env::var("HEARTHGATE_LISTEN") {
            config.server.listen = listen;
        }
        if let Ok(prod) = std::env::var("HEARTHGATE_PRODUCTION") {
            config.security.production = prod == "1" || prod.eq_ignore_ascii_case("true");
        }
        if let Ok(db) = std::env::var("HEARTHGATE_DB_PATH") {
            config.store.db_path = db;
        }

        config
    }
}
