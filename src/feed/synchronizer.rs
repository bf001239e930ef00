//! Message synchronizer: the in-memory feed and profile cache.
//!
//! ## Reconciliation
//!
//! - any `messages` change → full reload of the feed
//! - a `profiles` UPDATE → patch that profile in the cache and in every
//!   message it authored
//!
//! Successful mutations are also applied locally right away, so the feed
//! reflects them before (or without) the change event round-trip.
//!
//! ## Epochs
//!
//! Every activation starts a new epoch. Each backend call captures the epoch
//! before awaiting and drops its result if the epoch moved on, so nothing
//! lands after [`deactivate`](MessageSynchronizer::deactivate).

use chrono::{DateTime, TimeDelta, Utc};
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::model::{
    sort_feed, Message, MessagePatch, NewMessage, Profile, ProfilePatch, MESSAGES_TABLE,
    PROFILES_TABLE,
};
use crate::config::{EditTimestampPolicy, FeedConfig};
use crate::error::{Result, SyncError};
use crate::integrations::{Backend, ChangeFilter, ChangeKind, ChangeSubscription};

#[derive(Default)]
struct FeedState {
    messages: Vec<Message>,
    profiles: Vec<Profile>,
    epoch: u64,
    active: bool,
}

/// One change listener: its task and the token of the subscription it owns.
struct Listener {
    handle: JoinHandle<()>,
    cancel: CancellationToken,
}

impl Listener {
    /// Cancel the subscription now; the task is aborted as well.
    fn close(self) {
        self.cancel.cancel();
        self.handle.abort();
    }
}

pub struct MessageSynchronizer {
    backend: Arc<dyn Backend>,
    config: FeedConfig,
    state: Mutex<FeedState>,
    revision: watch::Sender<u64>,
    listeners: Mutex<Vec<Listener>>,
    /// Held for a whole activation.
    activation: tokio::sync::Mutex<()>,
}

impl MessageSynchronizer {
    /// Inactive synchronizer over `backend`. Nothing is loaded until
    /// [`activate`](Self::activate).
    pub fn new(backend: Arc<dyn Backend>, config: FeedConfig) -> Self {
        let (revision, _) = watch::channel(0);
        Self {
            backend,
            config,
            state: Mutex::new(FeedState::default()),
            revision,
            listeners: Mutex::new(Vec::new()),
            activation: tokio::sync::Mutex::new(()),
        }
    }

    // ── Accessors ────────────────────────────────────────────────

    /// Snapshot of the feed, oldest first.
    pub fn messages(&self) -> Vec<Message> {
        self.state.lock().messages.clone()
    }

    /// Snapshot of the profile cache.
    pub fn profiles(&self) -> Vec<Profile> {
        self.state.lock().profiles.clone()
    }

    /// Cached profile for `id`, if loaded.
    pub fn profile(&self, id: &str) -> Option<Profile> {
        self.state.lock().profiles.iter().find(|p| p.id == id).cloned()
    }

    /// Between [`activate`](Self::activate) and [`deactivate`](Self::deactivate).
    pub fn is_active(&self) -> bool {
        self.state.lock().active
    }

    /// Counter bumped after every change to the feed or the cache.
    pub fn changes(&self) -> watch::Receiver<u64> {
        self.revision.subscribe()
    }

    // ── Lifecycle ────────────────────────────────────────────────

    /// Open both change subscriptions and load the initial collections.
    ///
    /// Load and subscription failures are logged; the feed stays active and
    /// can be reloaded later. A call made while another activation is in
    /// flight waits for it, so returning always means the loads have run.
    pub async fn activate(self: &Arc<Self>) {
        let _activation = self.activation.lock().await;
        let epoch = {
            let mut state = self.state.lock();
            if state.active {
                return;
            }
            state.epoch += 1;
            state.active = true;
            state.epoch
        };
        tracing::info!(backend = self.backend.name(), epoch, "Activating message feed");

        let filters = [
            ChangeFilter::table(MESSAGES_TABLE),
            ChangeFilter::table(PROFILES_TABLE).only(ChangeKind::Update),
        ];
        for filter in filters {
            let table = filter.table.clone();
            match self.backend.subscribe_changes(filter).await {
                Ok(subscription) => {
                    if !self.spawn_listener(epoch, subscription) {
                        return;
                    }
                }
                Err(e) => tracing::warn!(table = %table, error = %e, "Change subscription failed; feed will not live-update"),
            }
            if !self.is_current(epoch) {
                return;
            }
        }

        if let Err(e) = self.load_messages().await {
            log_load_failure(MESSAGES_TABLE, &e);
        }
        if let Err(e) = self.load_profiles().await {
            log_load_failure(PROFILES_TABLE, &e);
        }
    }

    /// Close both subscriptions and clear both collections.
    pub fn deactivate(&self) {
        {
            let mut state = self.state.lock();
            state.epoch += 1;
            state.active = false;
            state.messages.clear();
            state.profiles.clear();
        }
        for listener in self.listeners.lock().drain(..) {
            listener.close();
        }
        self.bump();
        tracing::info!("Message feed deactivated");
    }

    /// Start a listener for `subscription` unless `epoch` has ended, in
    /// which case the subscription is closed and `false` returned.
    ///
    /// The epoch check runs under the listeners lock. `deactivate` moves the
    /// epoch before draining that lock, so every pushed listener is drained.
    fn spawn_listener(self: &Arc<Self>, epoch: u64, subscription: ChangeSubscription) -> bool {
        let mut listeners = self.listeners.lock();
        if !self.is_current(epoch) {
            tracing::debug!(table = %subscription.filter().table, "Closing subscription opened after teardown");
            subscription.unsubscribe();
            return false;
        }

        let cancel = subscription.cancel_token();
        let weak = Arc::downgrade(self);
        let handle = if subscription.filter().table == MESSAGES_TABLE {
            tokio::spawn(listen_messages(weak, epoch, subscription))
        } else {
            tokio::spawn(listen_profiles(weak, epoch, subscription))
        };
        listeners.push(Listener { handle, cancel });
        true
    }

    // ── Loads ────────────────────────────────────────────────────

    /// Replace the feed with the backend's. On failure the feed is untouched.
    pub async fn load_messages(&self) -> Result<()> {
        let epoch = self.current_epoch()?;
        let mut messages = self.backend.fetch_messages().await?;
        sort_feed(&mut messages);
        let count = messages.len();
        if self.apply(epoch, |state| state.messages = messages) {
            tracing::debug!(count, "Messages loaded");
        }
        Ok(())
    }

    /// Replace the profile cache wholesale.
    pub async fn load_profiles(&self) -> Result<()> {
        let epoch = self.current_epoch()?;
        let profiles = self.backend.fetch_profiles().await?;
        let count = profiles.len();
        if self.apply(epoch, |state| state.profiles = profiles) {
            tracing::debug!(count, "Profiles loaded");
        }
        Ok(())
    }

    // ── Message mutations ────────────────────────────────────────

    /// Post `content` as `author_id`. The backend assigns id and timestamp.
    pub async fn add_message(&self, content: &str, author_id: &str) -> Result<Message> {
        let epoch = self.current_epoch()?;
        if content.trim().is_empty() {
            return Err(SyncError::EmptyContent);
        }
        let author = self.profile(author_id);
        if self.config.enforce_admin_role {
            if let Some(author) = author.as_ref().filter(|p| !p.is_admin()) {
                return Err(SyncError::Forbidden(format!(
                    "'{}' is not an admin and cannot post",
                    author.username
                )));
            }
        }

        let row = NewMessage {
            content: content.to_string(),
            user_id: author_id.to_string(),
        };
        let mut message = self.backend.insert_message(&row).await?;
        if message.profile.is_none() {
            message.profile = author;
        }
        tracing::info!(message_id = %message.id, user_id = %author_id, "Message added");

        let stored = message.clone();
        self.apply(epoch, |state| {
            if !state.messages.iter().any(|m| m.id == stored.id) {
                state.messages.push(stored);
                sort_feed(&mut state.messages);
            }
        });
        Ok(message)
    }

    /// Replace a message's content. Under [`EditTimestampPolicy::Reset`] the
    /// message also moves to the current time.
    pub async fn edit_message(&self, id: &str, new_content: &str) -> Result<Message> {
        self.edit(id, new_content, None).await
    }

    /// Like [`edit_message`](Self::edit_message), but only if the row still
    /// carries `expected_created_at`; otherwise [`SyncError::Conflict`].
    pub async fn edit_message_checked(
        &self,
        id: &str,
        new_content: &str,
        expected_created_at: DateTime<Utc>,
    ) -> Result<Message> {
        self.edit(id, new_content, Some(expected_created_at)).await
    }

    async fn edit(
        &self,
        id: &str,
        new_content: &str,
        expected_created_at: Option<DateTime<Utc>>,
    ) -> Result<Message> {
        let epoch = self.current_epoch()?;
        if new_content.trim().is_empty() {
            return Err(SyncError::EmptyContent);
        }

        let created_at = match self.config.edit_timestamp {
            EditTimestampPolicy::Reset => {
                let known = self.state.lock().messages.iter().find(|m| m.id == id).map(|m| m.created_at);
                let now = Utc::now();
                Some(match known {
                    Some(prev) if now <= prev => prev + TimeDelta::microseconds(1),
                    _ => now,
                })
            }
            EditTimestampPolicy::Preserve => None,
        };
        let patch = MessagePatch {
            content: Some(new_content.to_string()),
            created_at,
        };

        let rows = self.backend.update_message(id, &patch, expected_created_at).await?;
        let Some(mut updated) = rows.into_iter().next() else {
            return Err(match expected_created_at {
                Some(_) => SyncError::Conflict { id: id.to_string() },
                None => SyncError::NotFound { table: MESSAGES_TABLE, id: id.to_string() },
            });
        };
        tracing::info!(message_id = %id, "Message edited");

        self.apply(epoch, |state| {
            if let Some(existing) = state.messages.iter_mut().find(|m| m.id == updated.id) {
                existing.content.clone_from(&updated.content);
                existing.created_at = updated.created_at;
                if updated.profile.is_none() {
                    updated.profile.clone_from(&existing.profile);
                }
            }
            sort_feed(&mut state.messages);
        });
        Ok(updated)
    }

    /// Remove a message. [`SyncError::NotFound`] when no row had that id.
    pub async fn delete_message(&self, id: &str) -> Result<()> {
        let epoch = self.current_epoch()?;
        let removed = self.backend.delete_message(id).await?;
        if removed == 0 {
            return Err(SyncError::NotFound {
                table: MESSAGES_TABLE,
                id: id.to_string(),
            });
        }
        tracing::info!(message_id = %id, "Message deleted");
        self.apply(epoch, |state| state.messages.retain(|m| m.id != id));
        Ok(())
    }

    // ── Profile mutations ────────────────────────────────────────

    /// Rename a user. Surrounding whitespace is trimmed; an empty name is
    /// rejected before the backend is called.
    pub async fn edit_user_username(&self, user_id: &str, new_username: &str) -> Result<Profile> {
        let new_username = new_username.trim();
        if new_username.is_empty() {
            return Err(SyncError::EmptyUsername);
        }
        self.update_profile(
            user_id,
            ProfilePatch {
                username: Some(new_username.to_string()),
                avatar_url: None,
            },
        )
        .await
    }

    /// The URL must be absolute `http(s)`; anything else is rejected before
    /// the backend is called.
    pub async fn edit_user_avatar(&self, user_id: &str, new_avatar_url: &str) -> Result<Profile> {
        let url = validate_avatar_url(new_avatar_url)?;
        self.update_profile(
            user_id,
            ProfilePatch {
                username: None,
                avatar_url: Some(url),
            },
        )
        .await
    }

    async fn update_profile(&self, user_id: &str, patch: ProfilePatch) -> Result<Profile> {
        let epoch = self.current_epoch()?;
        let profile = self
            .backend
            .update_profile(user_id, &patch)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| SyncError::NotFound {
                table: PROFILES_TABLE,
                id: user_id.to_string(),
            })?;
        tracing::info!(user_id = %user_id, "Profile updated");
        self.apply_profile_update(epoch, profile.clone());
        Ok(profile)
    }

    // ── Reconciliation ───────────────────────────────────────────

    async fn reconcile_messages(&self, epoch: u64) {
        match self.backend.fetch_messages().await {
            Ok(mut messages) => {
                sort_feed(&mut messages);
                self.apply(epoch, |state| state.messages = messages);
            }
            Err(e) => log_load_failure(MESSAGES_TABLE, &e),
        }
    }

    /// Patch one profile in the cache and in every message it authored.
    /// Applying the same profile twice leaves the same state.
    fn apply_profile_update(&self, epoch: u64, profile: Profile) -> bool {
        self.apply(epoch, |state| {
            for cached in state.profiles.iter_mut().filter(|p| p.id == profile.id) {
                cached.clone_from(&profile);
            }
            for message in state.messages.iter_mut().filter(|m| m.user_id == profile.id) {
                message.profile = Some(profile.clone());
            }
        })
    }

    // ── Epoch plumbing ───────────────────────────────────────────

    fn current_epoch(&self) -> Result<u64> {
        let state = self.state.lock();
        if state.active {
            Ok(state.epoch)
        } else {
            Err(SyncError::NotActive)
        }
    }

    fn is_current(&self, epoch: u64) -> bool {
        let state = self.state.lock();
        state.active && state.epoch == epoch
    }

    /// Run `f` against the state if `epoch` is still current. The revision
    /// is bumped after the state lock is released.
    fn apply(&self, epoch: u64, f: impl FnOnce(&mut FeedState)) -> bool {
        {
            let mut state = self.state.lock();
            if !state.active || state.epoch != epoch {
                tracing::debug!(epoch, current = state.epoch, "Discarding stale feed update");
                return false;
            }
            f(&mut state);
        }
        self.bump();
        true
    }

    fn bump(&self) {
        self.revision.send_modify(|rev| *rev += 1);
    }
}

impl Drop for MessageSynchronizer {
    fn drop(&mut self) {
        for listener in self.listeners.lock().drain(..) {
            listener.close();
        }
    }
}

async fn listen_messages(sync: Weak<MessageSynchronizer>, epoch: u64, mut subscription: ChangeSubscription) {
    while let Some(event) = subscription.next().await {
        let Some(sync) = sync.upgrade() else { break };
        if !sync.is_current(epoch) {
            break;
        }
        tracing::debug!(kind = event.kind.as_str(), id = ?event.record_id(), "Message change received");
        sync.reconcile_messages(epoch).await;
    }
    tracing::debug!(epoch, "Message change listener stopped");
}

async fn listen_profiles(sync: Weak<MessageSynchronizer>, epoch: u64, mut subscription: ChangeSubscription) {
    while let Some(event) = subscription.next().await {
        let Some(sync) = sync.upgrade() else { break };
        if !sync.is_current(epoch) {
            break;
        }
        if event.kind != ChangeKind::Update {
            continue;
        }
        match event.new_profile() {
            Ok(profile) => {
                tracing::debug!(user_id = %profile.id, "Profile change received");
                sync.apply_profile_update(epoch, profile);
            }
            Err(e) => tracing::warn!(error = %e, "Skipping malformed profile change"),
        }
    }
    tracing::debug!(epoch, "Profile change listener stopped");
}

fn log_load_failure(table: &str, err: &SyncError) {
    if err.is_transient() {
        tracing::warn!(table, error = %err, "Feed reload failed; keeping previous data");
    } else {
        tracing::error!(table, error = %err, code = err.code(), "Feed reload rejected; keeping previous data");
    }
}

/// Accept only absolute `http://` or `https://` URLs with a host.
pub fn validate_avatar_url(raw: &str) -> Result<String> {
    let trimmed = raw.trim();
    let lower = trimmed.to_ascii_lowercase();
    if !(lower.starts_with("http://") || lower.starts_with("https://")) {
        return Err(SyncError::InvalidAvatarUrl(raw.to_string()));
    }
    match reqwest::Url::parse(trimmed) {
        Ok(url) if url.host_str().is_some_and(|h| !h.is_empty()) => Ok(trimmed.to_string()),
        _ => Err(SyncError::InvalidAvatarUrl(raw.to_string())),
    }
}
