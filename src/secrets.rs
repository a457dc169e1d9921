//! Upstream credential access and envelope decryption.
//!
//! The dashboard application stores the upstream event-bus URL and token in
//! `system_config`; the token is normally at rest as an AES-256-GCM envelope:
//!
//! ```text
//! enc::<base64( nonce[12] || ciphertext || tag[16] )>
//! ```
//!
//! The 256-bit master key is resolved once per process, in priority order:
//! `HEARTHGATE_MASTER_KEY` (base64, must decode to exactly 32 bytes), else the
//! key file from `[security] key_file`. Absence of both is startup-fatal.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use thiserror::Error;
use tokio::sync::OnceCell;
use tracing::info;

use crate::store::{SessionStore, StoreError};

const NONCE_LEN: usize = 12;
const KEY_LEN: usize = 32;
const ENVELOPE_PREFIX: &str = "enc::";

/// Environment variable carrying the base64 master key.
pub const MASTER_KEY_ENV: &str = "HEARTHGATE_MASTER_KEY";

/// Config record keys owned by the application layer.
const UPSTREAM_URL_KEY: &str = "upstream.url";
const UPSTREAM_TOKEN_KEY: &str = "upstream.token";

#[derive(Debug, Error)]
pub enum SecretsError {
    #[error("no encryption key: set {MASTER_KEY_ENV} or provide a key file")]
    KeyMissing,
    #[error("{MASTER_KEY_ENV} must be base64 of exactly {KEY_LEN} bytes")]
    KeyMalformed,
    #[error("key file {0} is not {KEY_LEN} bytes")]
    KeyFileMalformed(String),
    #[error("failed to read key file {path}: {source}")]
    KeyFileRead {
        path: String,
        source: std::io::Error,
    },
    #[error("credential envelope is malformed")]
    EnvelopeMalformed,
    #[error("credential decryption failed (wrong key or corrupted record)")]
    DecryptionFailed,
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// The upstream event-bus endpoint and its long-lived access token.
///
/// The token must never be forwarded to a browser client; only the bridge's
/// outbound auth handshake may read it. `Debug` is implemented by hand so the
/// token cannot leak through logging.
#[derive(Clone)]
pub struct UpstreamCredential {
    pub base_url: String,
    pub token: String,
}

impl std::fmt::Debug for UpstreamCredential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpstreamCredential")
            .field("base_url", &self.base_url)
            .field("token", &"<redacted>")
            .finish()
    }
}

/// Process-wide symmetric key, resolved once at startup.
pub struct MasterKey([u8; KEY_LEN]);

impl MasterKey {
    /// Resolve the key: env var first, then key file. Both absent is fatal.
    pub fn resolve(key_file: &str) -> Result<Self, SecretsError> {
        if let Ok(encoded) = std::env::var(MASTER_KEY_ENV) {
            let bytes = BASE64
                .decode(encoded.trim())
                .map_err(|_| SecretsError::KeyMalformed)?;
            let key: [u8; KEY_LEN] =
                bytes.try_into().map_err(|_| SecretsError::KeyMalformed)?;
            info!("Master key loaded from environment");
            return Ok(Self(key));
        }

        match std::fs::read(key_file) {
            Ok(bytes) => {
                let key: [u8; KEY_LEN] = bytes
                    .try_into()
                    .map_err(|_| SecretsError::KeyFileMalformed(key_file.to_string()))?;
                info!("Master key loaded from {key_file}");
                Ok(Self(key))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(SecretsError::KeyMissing),
            Err(source) => Err(SecretsError::KeyFileRead {
                path: key_file.to_string(),
                source,
            }),
        }
    }

    /// Construct from raw bytes; used by tests and provisioning tooling.
    #[doc(hidden)]
    pub fn from_bytes(key: [u8; KEY_LEN]) -> Self {
        Self(key)
    }

    /// Decrypt an `enc::` envelope. A bad authentication tag or a malformed
    /// envelope is a hard error — never silently treated as "not configured".
    pub fn decrypt_envelope(&self, value: &str) -> Result<String, SecretsError> {
        let Some(encoded) = value.strip_prefix(ENVELOPE_PREFIX) else {
            return Err(SecretsError::EnvelopeMalformed);
        };
        let combined = BASE64
            .decode(encoded)
            .map_err(|_| SecretsError::EnvelopeMalformed)?;
        if combined.len() <= NONCE_LEN {
            return Err(SecretsError::EnvelopeMalformed);
        }
        let (nonce_bytes, ciphertext) = combined.split_at(NONCE_LEN);

        let cipher =
            Aes256Gcm::new_from_slice(&self.0).map_err(|_| SecretsError::DecryptionFailed)?;
        let plaintext = cipher
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|_| SecretsError::DecryptionFailed)?;
        String::from_utf8(plaintext).map_err(|_| SecretsError::DecryptionFailed)
    }

    /// Seal a plaintext into an `enc::` envelope. Used by tests and by the
    /// companion provisioning tooling; the gateway itself only decrypts.
    pub fn encrypt_envelope(&self, plaintext: &str, nonce: &[u8; NONCE_LEN]) -> String {
        let cipher = Aes256Gcm::new_from_slice(&self.0).expect("key length is fixed");
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(nonce), plaintext.as_bytes())
            .expect("AES-GCM encryption is infallible for valid inputs");
        let mut combined = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        combined.extend_from_slice(nonce);
        combined.extend_from_slice(&ciphertext);
        format!("{ENVELOPE_PREFIX}{}", BASE64.encode(combined))
    }
}

/// Lazily resolved, process-cached upstream credential.
///
/// The decryption runs at most once per process; later callers get the cached
/// value. `Ok(None)` means "not configured" — either record absent.
pub struct CredentialCache {
    key: MasterKey,
    cell: OnceCell<Option<UpstreamCredential>>,
}

impl CredentialCache {
    pub fn new(key: MasterKey) -> Self {
        Self {
            key,
            cell: OnceCell::new(),
        }
    }

    pub async fn get(
        &self,
        store: &SessionStore,
    ) -> Result<Option<UpstreamCredential>, SecretsError> {
        self.cell
            .get_or_try_init(|| async { self.load(store) })
            .await
            .cloned()
    }

    fn load(&self, store: &SessionStore) -> Result<Option<UpstreamCredential>, SecretsError> {
        let Some(url_rec) = store.config_record(UPSTREAM_URL_KEY)? else {
            return Ok(None);
        };
        let Some(token_rec) = store.config_record(UPSTREAM_TOKEN_KEY)? else {
            return Ok(None);
        };

        let token = if token_rec.encrypted {
            self.key.decrypt_envelope(&token_rec.value)?
        } else {
            token_rec.value
        };

        info!("Upstream credential loaded ({})", url_rec.value);
        Ok(Some(UpstreamCredential {
            base_url: url_rec.value,
            token,
        }))
    }
}
