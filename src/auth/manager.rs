//! Session manager: who is signed in, with which profile and role.
//!
//! State transitions (`restore_session`, `login`, `logout`, and every
//! backend auth event) are serialized through one async lock, so two logins
//! started together resolve one after the other.

use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::store::{AuthSession, Identity};
use crate::error::{Result, SyncError};
use crate::feed::{Profile, Role};
use crate::integrations::{AuthEvent, Backend};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthPhase {
    /// Startup, before the first restore resolves.
    Unknown,
    Authenticated,
    Unauthenticated,
}

/// Snapshot of the current session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionState {
    pub phase: AuthPhase,
    pub identity: Option<Identity>,
    /// `None` while authenticated means the profile could not be loaded.
    pub profile: Option<Profile>,
    pub is_loading: bool,
}

impl Default for SessionState {
    fn default() -> Self {
        Self {
            phase: AuthPhase::Unknown,
            identity: None,
            profile: None,
            is_loading: true,
        }
    }
}

impl SessionState {
    fn signed_out() -> Self {
        Self {
            phase: AuthPhase::Unauthenticated,
            identity: None,
            profile: None,
            is_loading: false,
        }
    }

    pub fn is_authenticated(&self) -> bool {
        self.phase == AuthPhase::Authenticated
    }

    pub fn role(&self) -> Option<Role> {
        self.profile.as_ref().map(|p| p.role)
    }

    pub fn is_admin(&self) -> bool {
        self.role() == Some(Role::Admin)
    }

    pub fn user_id(&self) -> Option<&str> {
        self.identity.as_ref().map(|i| i.id.as_str())
    }
}

/// Owns the session and keeps it in step with the backend.
pub struct SessionManager {
    backend: Arc<dyn Backend>,
    state: watch::Sender<SessionState>,
    transition: tokio::sync::Mutex<()>,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl SessionManager {
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        let (state, _) = watch::channel(SessionState::default());
        Self {
            backend,
            state,
            transition: tokio::sync::Mutex::new(()),
            listener: Mutex::new(None),
        }
    }

    pub fn state(&self) -> SessionState {
        self.state.borrow().clone()
    }

    /// Receiver that observes every state change.
    pub fn watch(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    /// Restore and subscribe to backend auth events.
    ///
    /// The listener re-resolves the session on every event. Calling `start`
    /// again replaces the previous listener.
    pub async fn start(self: &Arc<Self>) {
        let mut events = self.backend.subscribe_auth();
        self.restore_session().await;

        let manager = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            loop {
                let event = match events.recv().await {
                    Ok(event) => event,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "Auth event listener lagged");
                        continue;
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                };
                let Some(manager) = manager.upgrade() else { break };
                manager.handle_auth_event(event).await;
            }
            tracing::debug!("Auth event listener stopped");
        });

        if let Some(previous) = self.listener.lock().replace(handle) {
            previous.abort();
        }
    }

    /// Stop listening to auth events.
    pub fn shutdown(&self) {
        if let Some(handle) = self.listener.lock().take() {
            handle.abort();
        }
    }

    /// Look for an existing backend session and load its profile.
    /// Always ends with `is_loading == false`.
    pub async fn restore_session(&self) {
        let _guard = self.transition.lock().await;
        self.set_loading();

        let session = match self.backend.get_session().await {
            Ok(session) => session,
            Err(e) => {
                tracing::warn!(error = %e, code = e.code(), "Could not read existing session");
                None
            }
        };
        self.resolve(session).await;
    }

    /// Sign in. `true` once the backend accepted the credentials; a missing
    /// profile still signs in, with no role.
    pub async fn login(&self, email: &str, password: &str) -> bool {
        match self.login_detailed(email, password).await {
            Ok(_) => true,
            Err(e) => {
                tracing::warn!(code = e.code(), "Login failed: {e}");
                false
            }
        }
    }

    /// Like [`login`](Self::login) but reports why it failed.
    pub async fn login_detailed(&self, email: &str, password: &str) -> Result<SessionState> {
        if !email.contains('@') {
            return Err(SyncError::InvalidEmail);
        }

        let _guard = self.transition.lock().await;
        self.set_loading();

        match self.backend.sign_in_with_password(email, password).await {
            Ok(session) => Ok(self.resolve(Some(session)).await),
            Err(e) => {
                // A failed attempt leaves whatever session existed before.
                self.state.send_modify(|s| {
                    s.is_loading = false;
                    if s.phase == AuthPhase::Unknown {
                        *s = SessionState::signed_out();
                    }
                });
                Err(e)
            }
        }
    }

    /// Sign out. Local state is cleared even if the backend call fails.
    pub async fn logout(&self) {
        let _guard = self.transition.lock().await;
        self.set_loading();

        if let Err(e) = self.backend.sign_out().await {
            tracing::warn!(error = %e, code = e.code(), "Backend sign-out failed; clearing local session anyway");
        }
        self.state.send_replace(SessionState::signed_out());
        tracing::info!("Signed out");
    }

    async fn handle_auth_event(&self, event: AuthEvent) {
        tracing::debug!(kind = ?event.kind, "Auth state changed");
        let _guard = self.transition.lock().await;
        self.set_loading();
        self.resolve(event.session).await;
    }

    fn set_loading(&self) {
        self.state.send_modify(|s| s.is_loading = true);
    }

    /// Build and publish the state for `session`.
    async fn resolve(&self, session: Option<AuthSession>) -> SessionState {
        let next = match session {
            None => SessionState::signed_out(),
            Some(session) => {
                let identity = session.identity;
                let profile = match self.backend.fetch_profile(&identity.id).await {
                    Ok(Some(profile)) => Some(profile),
                    Ok(None) => {
                        tracing::error!(user_id = %identity.id, "Profile not found for user");
                        None
                    }
                    Err(e) => {
                        tracing::error!(user_id = %identity.id, error = %e, "Error fetching user profile");
                        None
                    }
                };
                SessionState {
                    phase: AuthPhase::Authenticated,
                    identity: Some(identity),
                    profile,
                    is_loading: false,
                }
            }
        };

        if let Some(role) = next.role() {
            tracing::debug!(user_id = next.user_id().unwrap_or_default(), %role, "Session resolved");
        }
        self.state.send_replace(next.clone());
        next
    }
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}
