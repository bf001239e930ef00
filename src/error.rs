//! Error type shared by the session manager, the message synchronizer and
//! the backend implementations.
//!
//! Every fallible operation in the library returns [`SyncError`]. The view
//! layer (the CLI here) decides how to render it; nothing is swallowed below
//! the boundary except reconciliation reloads, which log and keep the
//! previous collection.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, SyncError>;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("email address must contain '@'")]
    InvalidEmail,

    #[error("invalid email or password")]
    InvalidCredentials,

    #[error("no authenticated session")]
    NotAuthenticated,

    #[error("message feed is not active")]
    NotActive,

    #[error("message content cannot be empty")]
    EmptyContent,

    #[error("username cannot be empty")]
    EmptyUsername,

    #[error("avatar URL must start with http:// or https://, got '{0}'")]
    InvalidAvatarUrl(String),

    #[error("not allowed: {0}")]
    Forbidden(String),

    #[error("{table} row '{id}' not found")]
    NotFound { table: &'static str, id: String },

    /// The row changed since the caller last saw it.
    #[error("message '{id}' was modified concurrently")]
    Conflict { id: String },

    #[error("backend returned {status}: {message}")]
    Backend { status: u16, message: String },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("malformed row: {0}")]
    Decode(String),

    #[error("realtime error: {0}")]
    Realtime(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("session storage error: {0}")]
    Storage(String),
}

impl SyncError {
    /// Static code for log fields.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidEmail => "invalid_email",
            Self::InvalidCredentials => "invalid_credentials",
            Self::NotAuthenticated => "not_authenticated",
            Self::NotActive => "not_active",
            Self::EmptyContent => "empty_content",
            Self::EmptyUsername => "empty_username",
            Self::InvalidAvatarUrl(_) => "invalid_avatar_url",
            Self::Forbidden(_) => "forbidden",
            Self::NotFound { .. } => "not_found",
            Self::Conflict { .. } => "conflict",
            Self::Backend { .. } => "backend",
            Self::Transport(_) => "transport",
            Self::Decode(_) => "decode",
            Self::Realtime(_) => "realtime",
            Self::Config(_) => "config",
            Self::Storage(_) => "storage",
        }
    }

    /// Whether the failure is about connectivity rather than the request
    /// itself. Reconciliation uses this to pick a log level.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transport(_) | Self::Realtime(_) => true,
            Self::Backend { status, .. } => *status >= 500 || *status == 429,
            _ => false,
        }
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            Self::Decode(err.to_string())
        } else {
            Self::Transport(err.to_string())
        }
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        Self::Decode(err.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for SyncError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::Realtime(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(SyncError::Transport("reset".into()).is_transient());
        assert!(SyncError::Backend { status: 503, message: String::new() }.is_transient());
        assert!(!SyncError::Backend { status: 400, message: String::new() }.is_transient());
        assert!(!SyncError::Conflict { id: "m1".into() }.is_transient());
    }

    #[test]
    fn codes_are_stable() {
        assert_eq!(SyncError::InvalidEmail.code(), "invalid_email");
        assert_eq!(
            SyncError::NotFound { table: "messages", id: "x".into() }.code(),
            "not_found"
        );
    }
}
