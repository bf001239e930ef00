//! Config file structure.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_HEARTBEAT_SECS: u64 = 25;

/// Root of `config.toml`. Every section is optional.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub backend: BackendConfig,
    pub realtime: RealtimeConfig,
    pub feed: FeedConfig,
    pub session: SessionConfig,
    pub log: LogConfig,
}

/// Hosted project connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BackendConfig {
    /// Project URL, e.g. `https://xxxx.supabase.co`.
    pub url: String,
    /// Public anon key; row policies decide what it may touch.
    pub anon_key: String,
    pub request_timeout_secs: u64,
    pub schema: String,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            anon_key: String::new(),
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
            schema: "public".into(),
        }
    }
}

impl BackendConfig {
    /// URL without a trailing slash.
    pub fn base_url(&self) -> &str {
        self.url.trim_end_matches('/')
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RealtimeConfig {
    pub enabled: bool,
    pub heartbeat_secs: u64,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            heartbeat_secs: DEFAULT_HEARTBEAT_SECS,
        }
    }
}

/// What an edit does to `created_at`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EditTimestampPolicy {
    /// Edited messages move to "now" and re-sort to the end of the feed.
    #[default]
    Reset,
    /// Keep the original creation time.
    Preserve,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FeedConfig {
    pub edit_timestamp: EditTimestampPolicy,
    /// Refuse to post for authors whose cached profile is not admin.
    pub enforce_admin_role: bool,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            edit_timestamp: EditTimestampPolicy::Reset,
            enforce_admin_role: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SessionConfig {
    /// Keep tokens on disk between runs.
    pub persist: bool,
    /// Defaults to `<data dir>/session.json`. `~` is expanded.
    pub path: Option<PathBuf>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            persist: true,
            path: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LogConfig {
    /// `tracing-subscriber` filter directive; `RUST_LOG` wins when set.
    pub level: Option<String>,
}
