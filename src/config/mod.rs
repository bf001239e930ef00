//! Configuration loading.
//!
//! Sources, lowest precedence first:
//! 1. built-in defaults
//! 2. `config.toml` (explicit path, or the platform config dir)
//! 3. environment: `SUPABASE_URL` / `SUPABASE_ANON_KEY`, overridden in turn by
//!    `FEEDKEEPER_URL` / `FEEDKEEPER_ANON_KEY`

mod schema;

pub use schema::{
    BackendConfig, Config, EditTimestampPolicy, FeedConfig, LogConfig, RealtimeConfig,
    SessionConfig,
};

use anyhow::Context;
use directories::ProjectDirs;
use std::path::{Path, PathBuf};
use thiserror::Error;

const APP_NAME: &str = "feedkeeper";
const CONFIG_FILE: &str = "config.toml";
const SESSION_FILE: &str = "session.json";

fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("", "", APP_NAME)
}

/// `<config dir>/feedkeeper/config.toml`, if the platform has a config dir.
pub fn default_config_path() -> Option<PathBuf> {
    project_dirs().map(|d| d.config_dir().join(CONFIG_FILE))
}

impl Config {
    /// Load from `path` (must exist) or from the default location (optional),
    /// then apply environment overrides.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => match default_config_path() {
                Some(default) if default.exists() => Self::from_file(&default)?,
                _ => Self::default(),
            },
        };
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        Self::from_toml(&contents).with_context(|| format!("Failed to parse config {}", path.display()))
    }

    pub fn from_toml(contents: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(contents)?)
    }

    /// Overlay environment values. `lookup` is injectable for tests.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(url) = non_empty("FEEDKEEPER_URL").or_else(|| non_empty("SUPABASE_URL")) {
            self.backend.url = url;
        }
        if let Some(key) =
            non_empty("FEEDKEEPER_ANON_KEY").or_else(|| non_empty("SUPABASE_ANON_KEY"))
        {
            self.backend.anon_key = key;
        }
    }

    /// Where the session file lives, or `None` when persistence is off.
    pub fn session_path(&self) -> Option<PathBuf> {
        if !self.session.persist {
            return None;
        }
        match &self.session.path {
            Some(p) => Some(PathBuf::from(
                shellexpand::tilde(&p.to_string_lossy()).into_owned(),
            )),
            None => project_dirs().map(|d| d.data_dir().join(SESSION_FILE)),
        }
    }

    /// Check everything needed to reach a hosted backend.
    pub fn validate(&self) -> Result<(), Vec<ValidationError>> {
        let mut errors = Vec::new();

        let url = self.backend.url.trim();
        if url.is_empty() {
            errors.push(ValidationError::MissingUrl);
        } else if !(url.starts_with("https://") || url.starts_with("http://")) {
            errors.push(ValidationError::InvalidUrl(url.to_string()));
        }
        if self.backend.anon_key.trim().is_empty() {
            errors.push(ValidationError::MissingAnonKey);
        }
        if self.backend.request_timeout_secs == 0 {
            errors.push(ValidationError::ZeroTimeout);
        }
        if self.realtime.enabled && self.realtime.heartbeat_secs == 0 {
            errors.push(ValidationError::ZeroHeartbeat);
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("backend.url is required (or set SUPABASE_URL)")]
    MissingUrl,
    #[error("backend.url must be http(s), got '{0}'")]
    InvalidUrl(String),
    #[error("backend.anon_key is required (or set SUPABASE_ANON_KEY)")]
    MissingAnonKey,
    #[error("backend.request_timeout_secs must be greater than zero")]
    ZeroTimeout,
    #[error("realtime.heartbeat_secs must be greater than zero")]
    ZeroHeartbeat,
}
