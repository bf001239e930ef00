//! Backend collaborator contract.
//!
//! The session manager and the message synchronizer talk to the backend
//! only through [`Backend`]. [`super::SupabaseBackend`] speaks to a hosted
//! project; [`super::MemoryBackend`] keeps everything in-process.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;

use crate::auth::AuthSession;
use crate::error::Result;
use crate::feed::{Message, MessagePatch, NewMessage, Profile, ProfilePatch};

// ── Auth events ──────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuthEventKind {
    SignedIn,
    SignedOut,
    TokenRefreshed,
}

/// Session-change notification. `session` is `None` once signed out.
#[derive(Debug, Clone)]
pub struct AuthEvent {
    pub kind: AuthEventKind,
    pub session: Option<AuthSession>,
}

// ── Change feed ──────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

impl ChangeKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Insert => "INSERT",
            Self::Update => "UPDATE",
            Self::Delete => "DELETE",
        }
    }
}

/// A row-level change reported by the backend.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    pub kind: ChangeKind,
    pub schema: String,
    pub table: String,
    /// Previous row (usually only the primary key unless replica identity is full).
    pub old: serde_json::Value,
    /// New row; `Null` for deletes.
    pub new: serde_json::Value,
}

impl ChangeEvent {
    /// Decode the new row as a profile.
    pub fn new_profile(&self) -> Result<Profile> {
        Profile::from_row(self.new.clone())
    }

    /// Primary key of the affected row, from whichever side carries it.
    pub fn record_id(&self) -> Option<String> {
        [&self.new, &self.old].into_iter().find_map(|row| match row.get("id")? {
            serde_json::Value::String(s) => Some(s.clone()),
            serde_json::Value::Number(n) => Some(n.to_string()),
            _ => None,
        })
    }
}

/// Which changes a subscription receives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeFilter {
    pub schema: String,
    pub table: String,
    /// `None` means every event type.
    pub event: Option<ChangeKind>,
}

impl ChangeFilter {
    pub fn table(table: &str) -> Self {
        Self {
            schema: "public".into(),
            table: table.into(),
            event: None,
        }
    }

    pub fn only(mut self, kind: ChangeKind) -> Self {
        self.event = Some(kind);
        self
    }

    pub fn in_schema(mut self, schema: &str) -> Self {
        self.schema = schema.into();
        self
    }

    pub fn matches(&self, event: &ChangeEvent) -> bool {
        event.schema == self.schema
            && event.table == self.table
            && self.event.is_none_or(|kind| kind == event.kind)
    }

    /// Channel topic used on the realtime socket.
    pub fn topic(&self) -> String {
        format!("realtime:{}:{}", self.schema, self.table)
    }
}

/// Live stream of change events for one filter.
///
/// Dropping the subscription (or calling [`unsubscribe`](Self::unsubscribe))
/// cancels the producer side.
pub struct ChangeSubscription {
    filter: ChangeFilter,
    events: mpsc::Receiver<ChangeEvent>,
    cancel: CancellationToken,
}

impl ChangeSubscription {
    pub fn new(
        filter: ChangeFilter,
        events: mpsc::Receiver<ChangeEvent>,
        cancel: CancellationToken,
    ) -> Self {
        Self { filter, events, cancel }
    }

    pub fn filter(&self) -> &ChangeFilter {
        &self.filter
    }

    /// Next event, or `None` once the feed closed or was cancelled.
    pub async fn next(&mut self) -> Option<ChangeEvent> {
        tokio::select! {
            biased;
            () = self.cancel.cancelled() => None,
            event = self.events.recv() => event,
        }
    }

    pub fn unsubscribe(&self) {
        self.cancel.cancel();
    }

    /// Token that cancels this subscription from elsewhere, e.g. after the
    /// subscription itself has moved into a listener task.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

impl Drop for ChangeSubscription {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

// ── Backend trait ────────────────────────────────────────────────

#[async_trait]
pub trait Backend: Send + Sync {
    /// Short label for logs.
    fn name(&self) -> &str;

    /// Existing valid session, refreshed if needed.
    async fn get_session(&self) -> Result<Option<AuthSession>>;

    async fn sign_in_with_password(&self, email: &str, password: &str) -> Result<AuthSession>;

    async fn sign_out(&self) -> Result<()>;

    fn subscribe_auth(&self) -> broadcast::Receiver<AuthEvent>;

    async fn fetch_profile(&self, id: &str) -> Result<Option<Profile>>;

    async fn fetch_profiles(&self) -> Result<Vec<Profile>>;

    /// Every message with its author, oldest first.
    async fn fetch_messages(&self) -> Result<Vec<Message>>;

    async fn insert_message(&self, row: &NewMessage) -> Result<Message>;

    /// Returns the updated rows. When `expected_created_at` is set, only a
    /// row still carrying that timestamp is updated.
    async fn update_message(
        &self,
        id: &str,
        patch: &MessagePatch,
        expected_created_at: Option<DateTime<Utc>>,
    ) -> Result<Vec<Message>>;

    /// Returns the number of rows removed.
    async fn delete_message(&self, id: &str) -> Result<usize>;

    async fn update_profile(&self, id: &str, patch: &ProfilePatch) -> Result<Vec<Profile>>;

    async fn subscribe_changes(&self, filter: ChangeFilter) -> Result<ChangeSubscription>;
}
