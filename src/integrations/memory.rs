//! In-process backend.
//!
//! Keeps identities, both tables and the current session in memory and
//! publishes row changes on a broadcast channel, the same way the hosted
//! change feed would. Backs the test suite and `feedkeeper demo`.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;

use super::traits::{
    AuthEvent, AuthEventKind, Backend, ChangeEvent, ChangeFilter, ChangeKind, ChangeSubscription,
};
use crate::auth::{AuthSession, Identity};
use crate::error::{Result, SyncError};
use crate::feed::{
    sort_feed, Message, MessagePatch, NewMessage, Profile, ProfilePatch, MESSAGES_TABLE,
    PROFILES_TABLE,
};

const EVENT_CAPACITY: usize = 256;
const SUBSCRIPTION_BUFFER: usize = 64;
const SCHEMA: &str = "public";

struct Credentials {
    identity_id: String,
    password: String,
}

/// Message row as stored, without the embedded author.
#[derive(Clone)]
struct MessageRow {
    id: String,
    content: String,
    user_id: String,
    created_at: DateTime<Utc>,
}

impl MessageRow {
    fn to_message(&self, profile: Option<Profile>) -> Message {
        Message {
            id: self.id.clone(),
            content: self.content.clone(),
            user_id: self.user_id.clone(),
            created_at: self.created_at,
            profile,
        }
    }

    fn to_json(&self) -> serde_json::Value {
        json!({
            "id": self.id,
            "content": self.content,
            "user_id": self.user_id,
            "created_at": self.created_at.to_rfc3339(),
        })
    }
}

#[derive(Default)]
struct Tables {
    credentials: HashMap<String, Credentials>,
    profiles: Vec<Profile>,
    messages: Vec<MessageRow>,
    session: Option<AuthSession>,
    last_timestamp: Option<DateTime<Utc>>,
}

impl Tables {
    /// Strictly increasing wall-clock timestamps, so inserts never tie.
    fn next_timestamp(&mut self) -> DateTime<Utc> {
        let now = Utc::now();
        let ts = match self.last_timestamp {
            Some(last) if now <= last => last + Duration::microseconds(1),
            _ => now,
        };
        self.last_timestamp = Some(ts);
        ts
    }

    fn profile(&self, id: &str) -> Option<&Profile> {
        self.profiles.iter().find(|p| p.id == id)
    }
}

/// Backend that never leaves the process.
pub struct MemoryBackend {
    tables: Mutex<Tables>,
    auth_tx: broadcast::Sender<AuthEvent>,
    changes_tx: broadcast::Sender<ChangeEvent>,
    subscriptions: Mutex<Vec<CancellationToken>>,
    offline: AtomicBool,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        let (auth_tx, _) = broadcast::channel(EVENT_CAPACITY);
        let (changes_tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            tables: Mutex::new(Tables::default()),
            auth_tx,
            changes_tx,
            subscriptions: Mutex::new(Vec::new()),
            offline: AtomicBool::new(false),
        }
    }

    /// Register a sign-in identity together with its profile row.
    pub fn seed_identity(&self, email: &str, password: &str, profile: Profile) {
        let mut tables = self.tables.lock();
        tables.credentials.insert(
            email.trim().to_lowercase(),
            Credentials {
                identity_id: profile.id.clone(),
                password: password.to_string(),
            },
        );
        tables.profiles.retain(|p| p.id != profile.id);
        tables.profiles.push(profile);
    }

    /// Register an identity that has no profile row.
    pub fn seed_identity_without_profile(&self, email: &str, password: &str, identity_id: &str) {
        self.tables.lock().credentials.insert(
            email.trim().to_lowercase(),
            Credentials {
                identity_id: identity_id.to_string(),
                password: password.to_string(),
            },
        );
    }

    /// Insert a message directly, without publishing a change.
    pub fn seed_message(&self, user_id: &str, content: &str) -> String {
        let mut tables = self.tables.lock();
        let row = MessageRow {
            id: uuid::Uuid::new_v4().to_string(),
            content: content.to_string(),
            user_id: user_id.to_string(),
            created_at: tables.next_timestamp(),
        };
        let id = row.id.clone();
        tables.messages.push(row);
        id
    }

    /// Push a raw change event to every matching subscriber.
    pub fn publish_change(&self, event: ChangeEvent) {
        let _ = self.changes_tx.send(event);
    }

    /// Drop the current session as if it expired server-side.
    pub fn expire_session(&self) {
        self.tables.lock().session = None;
        let _ = self.auth_tx.send(AuthEvent {
            kind: AuthEventKind::SignedOut,
            session: None,
        });
    }

    /// Make every table call fail with a transport error.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Change subscriptions not yet cancelled, dropped or closed.
    pub fn active_subscriptions(&self) -> usize {
        let mut subscriptions = self.subscriptions.lock();
        subscriptions.retain(|token| !token.is_cancelled());
        subscriptions.len()
    }

    fn ensure_online(&self) -> Result<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(SyncError::Transport("memory backend is offline".into()));
        }
        Ok(())
    }

    fn emit(&self, kind: ChangeKind, table: &str, old: serde_json::Value, new: serde_json::Value) {
        let _ = self.changes_tx.send(ChangeEvent {
            kind,
            schema: SCHEMA.into(),
            table: table.into(),
            old,
            new,
        });
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    fn name(&self) -> &str {
        "memory"
    }

    async fn get_session(&self) -> Result<Option<AuthSession>> {
        Ok(self.tables.lock().session.clone())
    }

    async fn sign_in_with_password(&self, email: &str, password: &str) -> Result<AuthSession> {
        let session = {
            let mut tables = self.tables.lock();
            let creds = tables
                .credentials
                .get(&email.trim().to_lowercase())
                .filter(|c| c.password == password)
                .ok_or(SyncError::InvalidCredentials)?;
            let session = AuthSession {
                access_token: uuid::Uuid::new_v4().to_string(),
                refresh_token: Some(uuid::Uuid::new_v4().to_string()),
                expires_at: Some(Utc::now().timestamp() + 3600),
                identity: Identity {
                    id: creds.identity_id.clone(),
                    email: Some(email.trim().to_string()),
                },
            };
            tables.session = Some(session.clone());
            session
        };

        let _ = self.auth_tx.send(AuthEvent {
            kind: AuthEventKind::SignedIn,
            session: Some(session.clone()),
        });
        Ok(session)
    }

    /// Offline, the session is still dropped locally but the call fails.
    async fn sign_out(&self) -> Result<()> {
        self.tables.lock().session = None;
        let _ = self.auth_tx.send(AuthEvent {
            kind: AuthEventKind::SignedOut,
            session: None,
        });
        self.ensure_online()
    }

    fn subscribe_auth(&self) -> broadcast::Receiver<AuthEvent> {
        self.auth_tx.subscribe()
    }

    async fn fetch_profile(&self, id: &str) -> Result<Option<Profile>> {
        self.ensure_online()?;
        Ok(self.tables.lock().profile(id).cloned())
    }

    async fn fetch_profiles(&self) -> Result<Vec<Profile>> {
        self.ensure_online()?;
        Ok(self.tables.lock().profiles.clone())
    }

    async fn fetch_messages(&self) -> Result<Vec<Message>> {
        self.ensure_online()?;
        let tables = self.tables.lock();
        let mut feed: Vec<Message> = tables
            .messages
            .iter()
            .map(|row| row.to_message(tables.profile(&row.user_id).cloned()))
            .collect();
        sort_feed(&mut feed);
        Ok(feed)
    }

    async fn insert_message(&self, row: &NewMessage) -> Result<Message> {
        self.ensure_online()?;
        let stored = {
            let mut tables = self.tables.lock();
            if tables.profile(&row.user_id).is_none() {
                return Err(SyncError::Backend {
                    status: 409,
                    message: format!("user_id '{}' violates messages_user_id_fkey", row.user_id),
                });
            }
            let stored = MessageRow {
                id: uuid::Uuid::new_v4().to_string(),
                content: row.content.clone(),
                user_id: row.user_id.clone(),
                created_at: tables.next_timestamp(),
            };
            tables.messages.push(stored.clone());
            stored
        };

        self.emit(ChangeKind::Insert, MESSAGES_TABLE, json!({}), stored.to_json());
        Ok(stored.to_message(None))
    }

    async fn update_message(
        &self,
        id: &str,
        patch: &MessagePatch,
        expected_created_at: Option<DateTime<Utc>>,
    ) -> Result<Vec<Message>> {
        self.ensure_online()?;
        let updated = {
            let mut tables = self.tables.lock();
            let Some(row) = tables.messages.iter_mut().find(|m| m.id == id) else {
                return Ok(Vec::new());
            };
            if expected_created_at.is_some_and(|expected| expected != row.created_at) {
                return Ok(Vec::new());
            }
            if let Some(content) = &patch.content {
                row.content.clone_from(content);
            }
            if let Some(created_at) = patch.created_at {
                row.created_at = created_at;
            }
            let updated = row.clone();
            if let Some(ts) = patch.created_at {
                tables.last_timestamp = tables.last_timestamp.max(Some(ts));
            }
            updated
        };

        self.emit(ChangeKind::Update, MESSAGES_TABLE, json!({"id": updated.id}), updated.to_json());
        Ok(vec![updated.to_message(None)])
    }

    async fn delete_message(&self, id: &str) -> Result<usize> {
        self.ensure_online()?;
        let removed = {
            let mut tables = self.tables.lock();
            let before = tables.messages.len();
            tables.messages.retain(|m| m.id != id);
            before - tables.messages.len()
        };

        if removed > 0 {
            self.emit(ChangeKind::Delete, MESSAGES_TABLE, json!({"id": id}), serde_json::Value::Null);
        }
        Ok(removed)
    }

    async fn update_profile(&self, id: &str, patch: &ProfilePatch) -> Result<Vec<Profile>> {
        self.ensure_online()?;
        let updated = {
            let mut tables = self.tables.lock();
            let Some(profile) = tables.profiles.iter_mut().find(|p| p.id == id) else {
                return Ok(Vec::new());
            };
            patch.apply(profile);
            profile.clone()
        };

        let new_row = serde_json::to_value(&updated)?;
        self.emit(ChangeKind::Update, PROFILES_TABLE, json!({"id": id}), new_row);
        Ok(vec![updated])
    }

    async fn subscribe_changes(&self, filter: ChangeFilter) -> Result<ChangeSubscription> {
        let mut source = self.changes_tx.subscribe();
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        let cancel = CancellationToken::new();
        self.subscriptions.lock().push(cancel.clone());

        let task_filter = filter.clone();
        let task_cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = task_cancel.cancelled() => break,
                    received = source.recv() => match received {
                        Ok(event) if task_filter.matches(&event) => {
                            if tx.send(event).await.is_err() {
                                break;
                            }
                        }
                        Ok(_) => {}
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            tracing::warn!(table = %task_filter.table, skipped, "Change subscriber lagged");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
            task_cancel.cancel();
            tracing::debug!(table = %task_filter.table, "Memory change subscription closed");
        });

        Ok(ChangeSubscription::new(filter, rx, cancel))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::Role;

    fn admin() -> Profile {
        Profile {
            id: "admin-1".into(),
            username: "admin".into(),
            avatar_url: String::new(),
            role: Role::Admin,
        }
    }

    fn backend() -> MemoryBackend {
        let b = MemoryBackend::new();
        b.seed_identity("admin@example.com", "secret", admin());
        b
    }

    #[tokio::test]
    async fn sign_in_checks_password_and_case_folds_email() {
        let b = backend();
        assert!(matches!(
            b.sign_in_with_password("admin@example.com", "wrong").await,
            Err(SyncError::InvalidCredentials)
        ));
        let session = b.sign_in_with_password("Admin@Example.com", "secret").await.unwrap();
        assert_eq!(session.identity.id, "admin-1");
        assert_eq!(b.get_session().await.unwrap(), Some(session));
        b.sign_out().await.unwrap();
        assert!(b.get_session().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn inserts_are_ordered_and_joined() {
        let b = backend();
        b.insert_message(&NewMessage { content: "one".into(), user_id: "admin-1".into() })
            .await
            .unwrap();
        b.insert_message(&NewMessage { content: "two".into(), user_id: "admin-1".into() })
            .await
            .unwrap();
        let feed = b.fetch_messages().await.unwrap();
        assert_eq!(feed.len(), 2);
        assert!(feed[0].created_at < feed[1].created_at);
        assert_eq!(feed[1].author_name(), "admin");
    }

    #[tokio::test]
    async fn insert_rejects_unknown_author() {
        let b = backend();
        let err = b
            .insert_message(&NewMessage { content: "x".into(), user_id: "ghost".into() })
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Backend { status: 409, .. }));
    }

    #[tokio::test]
    async fn update_with_stale_revision_touches_nothing() {
        let b = backend();
        let m = b
            .insert_message(&NewMessage { content: "v1".into(), user_id: "admin-1".into() })
            .await
            .unwrap();
        let patch = MessagePatch { content: Some("v2".into()), created_at: None };
        let stale = m.created_at - Duration::seconds(1);
        assert!(b.update_message(&m.id, &patch, Some(stale)).await.unwrap().is_empty());
        assert_eq!(b.update_message(&m.id, &patch, Some(m.created_at)).await.unwrap().len(), 1);
        assert_eq!(b.fetch_messages().await.unwrap()[0].content, "v2");
    }

    #[tokio::test]
    async fn subscriptions_filter_and_count() {
        let b = backend();
        let mut profiles = b
            .subscribe_changes(ChangeFilter::table(PROFILES_TABLE).only(ChangeKind::Update))
            .await
            .unwrap();
        assert_eq!(b.active_subscriptions(), 1);

        b.insert_message(&NewMessage { content: "x".into(), user_id: "admin-1".into() })
            .await
            .unwrap();
        b.update_profile("admin-1", &ProfilePatch { username: Some("root".into()), avatar_url: None })
            .await
            .unwrap();

        let event = profiles.next().await.unwrap();
        assert_eq!(event.table, PROFILES_TABLE);
        assert_eq!(event.new_profile().unwrap().username, "root");

        drop(profiles);
        assert_eq!(b.active_subscriptions(), 0);
    }

    #[tokio::test]
    async fn offline_mode_fails_table_calls() {
        let b = backend();
        b.set_offline(true);
        assert!(b.fetch_messages().await.unwrap_err().is_transient());
        b.set_offline(false);
        assert!(b.fetch_messages().await.is_ok());
    }

    #[tokio::test]
    async fn offline_sign_out_fails_but_drops_the_session() {
        let b = backend();
        b.sign_in_with_password("admin@example.com", "secret").await.unwrap();
        b.set_offline(true);
        assert!(b.sign_out().await.unwrap_err().is_transient());
        assert!(b.get_session().await.unwrap().is_none());
    }
}
