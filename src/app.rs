//! Wiring: one backend shared by the session manager and the feed, plus the
//! binding that keeps the feed active exactly while someone is signed in.

use parking_lot::Mutex;
use std::sync::Arc;
use tokio::task::JoinHandle;

use crate::auth::{SessionManager, SessionState, SessionStore};
use crate::config::{Config, FeedConfig};
use crate::error::{Result, SyncError};
use crate::feed::MessageSynchronizer;
use crate::integrations::{Backend, SupabaseBackend};

pub struct AdminApp {
    backend: Arc<dyn Backend>,
    session: Arc<SessionManager>,
    feed: Arc<MessageSynchronizer>,
    binding: Mutex<Option<JoinHandle<()>>>,
}

impl AdminApp {
    pub fn new(backend: Arc<dyn Backend>, feed_config: FeedConfig) -> Self {
        Self {
            session: Arc::new(SessionManager::new(backend.clone())),
            feed: Arc::new(MessageSynchronizer::new(backend.clone(), feed_config)),
            backend,
            binding: Mutex::new(None),
        }
    }

    /// Build against the hosted backend described by `config`.
    pub fn from_config(config: &Config) -> Result<Self> {
        if let Err(errors) = config.validate() {
            let joined = errors
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join("; ");
            return Err(SyncError::Config(joined));
        }

        let store = match config.session_path() {
            Some(path) => SessionStore::at(path),
            None => SessionStore::ephemeral(),
        };
        match store.path() {
            Some(path) => tracing::debug!(path = %path.display(), "Persisting session"),
            None => tracing::debug!("Session kept in memory only"),
        }
        let backend = SupabaseBackend::new(config.backend.clone(), config.realtime.clone(), store)?;
        Ok(Self::new(Arc::new(backend), config.feed.clone()))
    }

    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    pub fn session(&self) -> &Arc<SessionManager> {
        &self.session
    }

    pub fn feed(&self) -> &Arc<MessageSynchronizer> {
        &self.feed
    }

    /// Restore the session, bring the feed in line with it, and keep
    /// following session changes until [`shutdown`](Self::shutdown).
    pub async fn start(&self) {
        self.session.start().await;
        let mut states = self.session.watch();
        let initial = states.borrow_and_update().clone();
        follow(&self.feed, &initial).await;

        let feed = Arc::downgrade(&self.feed);
        let handle = tokio::spawn(async move {
            while states.changed().await.is_ok() {
                let state = states.borrow_and_update().clone();
                let Some(feed) = feed.upgrade() else { break };
                follow(&feed, &state).await;
            }
            tracing::debug!("Session binding stopped");
        });
        if let Some(previous) = self.binding.lock().replace(handle) {
            previous.abort();
        }
    }

    /// Apply the current session state to the feed now, without waiting
    /// for the binding task.
    pub async fn sync_feed(&self) {
        follow(&self.feed, &self.session.state()).await;
    }

    pub fn shutdown(&self) {
        if let Some(handle) = self.binding.lock().take() {
            handle.abort();
        }
        self.session.shutdown();
        if self.feed.is_active() {
            self.feed.deactivate();
        }
    }
}

impl Drop for AdminApp {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn follow(feed: &Arc<MessageSynchronizer>, state: &SessionState) {
    if state.is_loading {
        return;
    }
    if state.is_authenticated() {
        feed.activate().await;
    } else if feed.is_active() {
        feed.deactivate();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::{Profile, Role};
    use crate::integrations::MemoryBackend;
    use std::time::Duration;

    fn backend() -> Arc<MemoryBackend> {
        let backend = Arc::new(MemoryBackend::new());
        backend.seed_identity(
            "admin@example.com",
            "pw",
            Profile {
                id: "admin-1".into(),
                username: "admin".into(),
                avatar_url: String::new(),
                role: Role::Admin,
            },
        );
        backend.seed_message("admin-1", "hello");
        backend
    }

    async fn eventually(what: &str, cond: impl Fn() -> bool) {
        let polled = tokio::time::timeout(Duration::from_secs(2), async {
            while !cond() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await;
        assert!(polled.is_ok(), "timed out waiting for {what}");
    }

    #[tokio::test]
    async fn feed_follows_the_session() {
        let backend = backend();
        let app = AdminApp::new(backend.clone(), FeedConfig::default());
        app.start().await;
        assert!(!app.feed().is_active());

        assert!(app.session().login("admin@example.com", "pw").await);
        eventually("feed activation", || app.feed().messages().len() == 1).await;
        assert_eq!(app.feed().profiles().len(), 1);

        app.session().logout().await;
        eventually("feed teardown", || !app.feed().is_active()).await;
        assert!(app.feed().messages().is_empty());
        eventually("subscriptions closed", || backend.active_subscriptions() == 0).await;
    }

    #[tokio::test]
    async fn server_side_expiry_tears_the_feed_down() {
        let backend = backend();
        let app = AdminApp::new(backend.clone(), FeedConfig::default());
        app.start().await;
        assert!(app.session().login("admin@example.com", "pw").await);
        app.sync_feed().await;
        assert!(app.feed().is_active());

        backend.expire_session();
        eventually("feed teardown", || !app.feed().is_active()).await;
        assert!(app.feed().profiles().is_empty());
    }

    #[tokio::test]
    async fn restored_session_activates_on_start() {
        let backend = backend();
        backend.sign_in_with_password("admin@example.com", "pw").await.unwrap();

        let app = AdminApp::new(backend.clone(), FeedConfig::default());
        app.start().await;
        assert!(app.session().state().is_admin());
        assert!(app.feed().is_active());
        assert_eq!(app.feed().messages().len(), 1);
    }

    #[test]
    fn from_config_rejects_incomplete_config() {
        let err = AdminApp::from_config(&Config::default()).err().unwrap();
        assert_eq!(err.code(), "config");
        assert!(err.to_string().contains("backend.url"));
    }

    #[test]
    fn from_config_builds_against_a_hosted_project() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.backend.url = "https://x.supabase.co".into();
        config.backend.anon_key = "anon".into();
        config.session.path = Some(dir.path().join("session.json"));

        let app = AdminApp::from_config(&config).unwrap();
        assert_eq!(app.backend().name(), "supabase");
        assert!(!app.feed().is_active());
    }
}
