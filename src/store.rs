//! Read-only access to the dashboard application's SQLite store.
//!
//! The gateway never writes here. Two tables matter:
//!
//! - `sessions(token, user_id, expires_at)` — browser sessions, written by the
//!   dashboard's login flow. `expires_at` is epoch seconds.
//! - `system_config(key, value, encrypted)` — keyed settings records; values
//!   with `encrypted = 1` carry an AES-256-GCM envelope (see `secrets.rs`).

use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use rusqlite::{Connection, OptionalExtension};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to open store at {path}: {source}")]
    Open {
        path: String,
        source: rusqlite::Error,
    },
    #[error("store query failed: {0}")]
    Query(#[from] rusqlite::Error),
}

/// A keyed configuration record as stored by the application layer.
#[derive(Debug, Clone)]
pub struct ConfigRecord {
    pub value: String,
    pub encrypted: bool,
}

/// Handle to the application database. Queries are single short reads, so a
/// plain mutex around the connection is sufficient; nothing holds it across an
/// await point.
pub struct SessionStore {
    conn: Mutex<Connection>,
}

impl SessionStore {
    /// Open the database read-only. Fails fast if the path is unreadable.
    pub fn open(path: &str) -> Result<Self, StoreError> {
        let conn = Connection::open_with_flags(
            path,
            rusqlite::OpenFlags::SQLITE_OPEN_READ_ONLY | rusqlite::OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .map_err(|source| StoreError::Open {
            path: path.to_string(),
            source,
        })?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// In-memory store for tests; creates the schema the application layer owns.
    #[doc(hidden)]
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(
            "CREATE TABLE sessions (token TEXT PRIMARY KEY, user_id TEXT NOT NULL, expires_at INTEGER NOT NULL);
             CREATE TABLE system_config (key TEXT PRIMARY KEY, value TEXT NOT NULL, encrypted INTEGER NOT NULL DEFAULT 0);",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Resolve a session token to its owning user id.
    ///
    /// Returns `None` for unknown tokens and for any session whose expiry is at
    /// or before `now` — an expired session is indistinguishable from a missing
    /// one. One authoritative read, no side effects, no retries.
    pub fn validate_session(&self, token: &str, now: u64) -> Result<Option<String>, StoreError> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        let row: Option<(String, u64)> = conn
            .query_row(
                "SELECT user_id, expires_at FROM sessions WHERE token = ?1",
                [token],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .optional()?;
        Ok(match row {
            Some((user_id, expires_at)) if now < expires_at => Some(user_id),
            _ => None,
        })
    }

    /// Convenience wrapper using the wall clock.
    pub fn validate_session_now(&self, token: &str) -> Result<Option<String>, StoreError> {
        self.validate_session(token, epoch_now())
    }

    /// Fetch a system config record by key.
    pub fn config_record(&self, key: &str) -> Result<Option<ConfigRecord>, StoreError> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        let row = conn
            .query_row(
                "SELECT value, encrypted FROM system_config WHERE key = ?1",
                [key],
                |r| {
                    Ok(ConfigRecord {
                        value: r.get(0)?,
                        encrypted: r.get::<_, i64>(1)? != 0,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    /// Test helper: insert rows through the same connection.
    #[doc(hidden)]
    pub fn execute(&self, sql: &str, params: &[&dyn rusqlite::ToSql]) -> Result<(), StoreError> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        conn.execute(sql, params)?;
        Ok(())
    }
}

/// Current time as epoch seconds.
pub fn epoch_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seeded() -> SessionStore {
        let store = SessionStore::open_in_memory().unwrap();
        store
            .execute(
                "INSERT INTO sessions (token, user_id, expires_at) VALUES (?1, ?2, ?3)",
                &[&"tok-alive", &"user-1", &1000i64],
            )
            .unwrap();
        store
    }

    #[test]
    fn test_valid_session_resolves_user() {
        let store = seeded();
        assert_eq!(
            store.validate_session("tok-alive", 999).unwrap().as_deref(),
            Some("user-1")
        );
    }

    #[test]
    fn test_unknown_token_is_invalid() {
        let store = seeded();
        assert_eq!(store.validate_session("nope", 0).unwrap(), None);
    }

    #[test]
    fn test_expired_session_is_invalid() {
        let store = seeded();
        assert_eq!(store.validate_session("tok-alive", 1001).unwrap(), None);
    }

    #[test]
    fn test_expiry_boundary_counts_as_expired() {
        let store = seeded();
        // now == expires_at must behave exactly like "not found"
        assert_eq!(store.validate_session("tok-alive", 1000).unwrap(), None);
    }

    #[test]
    fn test_config_record_roundtrip() {
        let store = seeded();
        store
            .execute(
                "INSERT INTO system_config (key, value, encrypted) VALUES (?1, ?2, ?3)",
                &[&"upstream.url", &"http://hub.local:8123", &0i64],
            )
            .unwrap();
        let rec = store.config_record("upstream.url").unwrap().unwrap();
        assert_eq!(rec.value, "http://hub.local:8123");
        assert!(!rec.encrypted);
        assert!(store.config_record("upstream.token").unwrap().is_none());
    }
}
