//! Origin allow-list policy for privileged requests.
//!
//! Privileged means a non-safe HTTP method or a WebSocket upgrade. Outside
//! production mode everything is allowed, which keeps local development and
//! reverse-proxy-less setups friction-free.

use axum::http::{HeaderMap, Method};

/// Hosts derived from config that may originate privileged requests.
#[derive(Debug, Clone, Default)]
pub struct OriginPolicy {
    production: bool,
    allowed_hosts: Vec<String>,
}

impl OriginPolicy {
    /// Build the allow-list from the explicit origin list plus the host of the
    /// public base URL, lowercased, schemes and ports stripped.
    pub fn from_config(cfg: &crate::config::SecurityConfig) -> Self {
        let mut allowed_hosts: Vec<String> = cfg
            .allowed_origins
            .iter()
            .filter_map(|o| host_of(o))
            .collect();
        if let Some(base) = cfg.public_base_url.as_deref() {
            if let Some(host) = host_of(base) {
                if !allowed_hosts.contains(&host) {
                    allowed_hosts.push(host);
                }
            }
        }
        Self {
            production: cfg.production,
            allowed_hosts,
        }
    }

    /// Decide whether a request may proceed.
    ///
    /// POLICY: a request that carries no `Origin` header is allowed even in
    /// production. Same-origin browser requests can legitimately omit it, and
    /// non-browser clients never send it. The trade-off is weaker CSRF
    /// protection for WebSocket upgrades from header-stripping clients;
    /// accepted deliberately.
    pub fn allows(&self, method: &Method, headers: &HeaderMap, is_upgrade: bool) -> bool {
        if !self.production {
            return true;
        }
        let safe_method =
            matches!(*method, Method::GET | Method::HEAD | Method::OPTIONS) && !is_upgrade;
        if safe_method {
            return true;
        }

        let Some(origin) = headers.get("origin").and_then(|v| v.to_str().ok()) else {
            return true;
        };
        let Some(host) = host_of(origin) else {
            return false;
        };

        self.allowed_hosts
            .iter()
            .any(|allowed| host == *allowed || host.ends_with(&format!(".{allowed}")))
    }
}

/// Extract the lowercase host from `scheme://host[:port][/...]` or a bare
/// `host[:port]`. Bracketed IPv6 authorities yield the address without the
/// brackets.
fn host_of(origin: &str) -> Option<String> {
    let rest = origin
        .split_once("://")
        .map_or(origin, |(_, rest)| rest);
    let authority = rest.split('/').next()?;
    let host = if let Some(v6) = authority.strip_prefix('[') {
        v6.split(']').next()?
    } else {
        authority.split(':').next()?
    };
    if host.is_empty() {
        None
    } else {
        Some(host.to_ascii_lowercase())
    }
}
