//! Backend session tokens and their on-disk persistence.
//!
//! The file holds a single JSON document:
//! `{ access_token, refresh_token, expires_at, user: { id, email } }`.
//! It is written with owner-only permissions on unix.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{Result, SyncError};

/// Refresh this many seconds before the token actually expires.
const EXPIRY_MARGIN_SECS: i64 = 30;

/// Backend authentication record, distinct from the app-level profile.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub id: String,
    #[serde(default)]
    pub email: Option<String>,
}

/// Tokens for a signed-in identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthSession {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    /// Unix seconds; `None` means the backend did not say.
    #[serde(default)]
    pub expires_at: Option<i64>,
    #[serde(rename = "user")]
    pub identity: Identity,
}

impl AuthSession {
    pub fn is_expired_at(&self, now_secs: i64) -> bool {
        self.expires_at
            .is_some_and(|exp| exp - EXPIRY_MARGIN_SECS <= now_secs)
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(chrono::Utc::now().timestamp())
    }
}

/// Holds the current session, optionally mirrored to a file so it survives
/// process restarts.
pub struct SessionStore {
    path: Option<PathBuf>,
    current: Mutex<Option<AuthSession>>,
}

impl SessionStore {
    /// Memory-only store.
    pub fn ephemeral() -> Self {
        Self {
            path: None,
            current: Mutex::new(None),
        }
    }

    /// File-backed store. The file is read lazily on first [`load`](Self::load).
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
            current: Mutex::new(None),
        }
    }

    /// Backing file, `None` for a memory-only store.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn load(&self) -> Result<Option<AuthSession>> {
        if let Some(session) = self.current.lock().clone() {
            return Ok(Some(session));
        }
        let Some(path) = &self.path else {
            return Ok(None);
        };
        if !path.exists() {
            return Ok(None);
        }

        let raw = std::fs::read_to_string(path)
            .map_err(|e| SyncError::Storage(format!("read {}: {e}", path.display())))?;
        match serde_json::from_str::<AuthSession>(&raw) {
            Ok(session) => {
                *self.current.lock() = Some(session.clone());
                Ok(Some(session))
            }
            Err(e) => {
                tracing::warn!(path = %path.display(), "Discarding unreadable session file: {e}");
                Ok(None)
            }
        }
    }

    pub fn save(&self, session: &AuthSession) -> Result<()> {
        *self.current.lock() = Some(session.clone());
        let Some(path) = &self.path else {
            return Ok(());
        };

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| SyncError::Storage(format!("create {}: {e}", parent.display())))?;
        }
        let body = serde_json::to_vec_pretty(session)?;
        write_private(path, &body)
            .map_err(|e| SyncError::Storage(format!("write {}: {e}", path.display())))
    }

    pub fn clear(&self) -> Result<()> {
        self.current.lock().take();
        match &self.path {
            Some(path) if path.exists() => std::fs::remove_file(path)
                .map_err(|e| SyncError::Storage(format!("remove {}: {e}", path.display()))),
            _ => Ok(()),
        }
    }
}

#[cfg(unix)]
fn write_private(path: &Path, body: &[u8]) -> std::io::Result<()> {
    use std::io::Write;
    use std::os::unix::fs::OpenOptionsExt;

    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)?;
    file.write_all(body)
}

#[cfg(not(unix))]
fn write_private(path: &Path, body: &[u8]) -> std::io::Result<()> {
    std::fs::write(path, body)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(expires_at: Option<i64>) -> AuthSession {
        AuthSession {
            access_token: "access".into(),
            refresh_token: Some("refresh".into()),
            expires_at,
            identity: Identity {
                id: "u1".into(),
                email: Some("admin@example.com".into()),
            },
        }
    }

    #[test]
    fn expiry_uses_margin() {
        assert!(!session(None).is_expired_at(1_000));
        assert!(!session(Some(1_100)).is_expired_at(1_000));
        assert!(session(Some(1_020)).is_expired_at(1_000));
    }

    #[test]
    fn file_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("session.json");

        let store = SessionStore::at(&path);
        assert!(store.load().unwrap().is_none());
        store.save(&session(Some(5))).unwrap();

        let reopened = SessionStore::at(&path);
        assert_eq!(reopened.load().unwrap(), Some(session(Some(5))));

        reopened.clear().unwrap();
        assert!(!path.exists());
        assert!(reopened.load().unwrap().is_none());
    }

    #[cfg(unix)]
    #[test]
    fn file_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.json");
        SessionStore::at(&path).save(&session(None)).unwrap();
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn corrupt_file_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(SessionStore::at(&path).load().unwrap().is_none());
    }

    #[test]
    fn ephemeral_store_keeps_session_in_memory() {
        let store = SessionStore::ephemeral();
        store.save(&session(None)).unwrap();
        assert!(store.load().unwrap().is_some());
        store.clear().unwrap();
        assert!(store.load().unwrap().is_none());
    }
}
