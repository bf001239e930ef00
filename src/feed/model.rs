//! Typed records for the `profiles` and `messages` tables.
//!
//! Rows are decoded at the boundary (REST responses and change-feed
//! payloads) and validated before the synchronizer trusts them.

use crate::error::{Result, SyncError};
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

pub const PROFILES_TABLE: &str = "profiles";
pub const MESSAGES_TABLE: &str = "messages";

/// Column list for a message read with its author embedded.
pub const MESSAGE_SELECT: &str =
    "id,content,created_at,user_id,profiles(id,username,avatar_url,role)";

// ── Role ─────────────────────────────────────────────────────────

/// Authorization tier of a profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    #[serde(rename = "admin")]
    Admin,
    /// Stored as `kprpuser` by the original deployment.
    #[serde(rename = "kprpuser", alias = "standard_user")]
    StandardUser,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Admin => "admin",
            Self::StandardUser => "standard_user",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Profile ──────────────────────────────────────────────────────

/// Application-level user record, one per identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    /// Same id as the auth identity; never changes.
    #[serde(deserialize_with = "string_or_number")]
    pub id: String,
    /// Display name. A null column decodes as empty.
    #[serde(default, deserialize_with = "null_as_empty")]
    pub username: String,
    /// Absolute http(s) URL, or empty for none.
    #[serde(default, deserialize_with = "null_as_empty")]
    pub avatar_url: String,
    pub role: Role,
}

impl Profile {
    /// Whether this user may post and moderate.
    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }

    /// Decode and validate a raw row.
    pub fn from_row(row: serde_json::Value) -> Result<Self> {
        let profile: Self = serde_json::from_value(row)?;
        profile.validate()?;
        Ok(profile)
    }

    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(SyncError::Decode("profile row without id".into()));
        }
        Ok(())
    }
}

/// Partial update for a profile row. Unset fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProfilePatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
}

impl ProfilePatch {
    /// Copy the set fields onto `profile`.
    pub fn apply(&self, profile: &mut Profile) {
        if let Some(username) = &self.username {
            profile.username.clone_from(username);
        }
        if let Some(avatar_url) = &self.avatar_url {
            profile.avatar_url.clone_from(avatar_url);
        }
    }
}

// ── Message ──────────────────────────────────────────────────────

/// A feed entry, optionally carrying its author's profile.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Backend-assigned id.
    #[serde(deserialize_with = "string_or_number")]
    pub id: String,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub content: String,
    /// Author's profile id.
    #[serde(deserialize_with = "string_or_number")]
    pub user_id: String,
    /// Feed ordering key. Editing may move it to the edit time.
    #[serde(deserialize_with = "timestamp")]
    pub created_at: DateTime<Utc>,
    /// Embedded author, named after the joined table.
    #[serde(rename = "profiles", default, skip_serializing_if = "Option::is_none")]
    pub profile: Option<Profile>,
}

impl Message {
    /// Decode and validate a raw row, embedded profile included.
    pub fn from_row(row: serde_json::Value) -> Result<Self> {
        let message: Self = serde_json::from_value(row)?;
        message.validate()?;
        Ok(message)
    }

    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(SyncError::Decode("message row without id".into()));
        }
        if self.user_id.trim().is_empty() {
            return Err(SyncError::Decode(format!("message '{}' without user_id", self.id)));
        }
        if let Some(profile) = &self.profile {
            profile.validate()?;
            if profile.id != self.user_id {
                return Err(SyncError::Decode(format!(
                    "message '{}' embeds profile '{}' but belongs to '{}'",
                    self.id, profile.id, self.user_id
                )));
            }
        }
        Ok(())
    }

    /// Display name of the author, falling back to the raw user id.
    pub fn author_name(&self) -> &str {
        match &self.profile {
            Some(p) if !p.username.is_empty() => &p.username,
            _ => &self.user_id,
        }
    }
}

/// Row body for a message insert.
#[derive(Debug, Clone, Serialize)]
pub struct NewMessage {
    pub content: String,
    pub user_id: String,
}

/// Partial update for a message row.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MessagePatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

/// Orders by `created_at` ascending. The sort is stable, so rows with equal
/// timestamps keep the order the backend returned them in.
pub fn sort_feed(messages: &mut [Message]) {
    messages.sort_by_key(|m| m.created_at);
}

// ── Serde helpers ────────────────────────────────────────────────

fn null_as_empty<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<String>::deserialize(deserializer)?.unwrap_or_default())
}

fn string_or_number<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Key {
        Text(String),
        Int(i64),
    }

    Ok(match Key::deserialize(deserializer)? {
        Key::Text(s) => s,
        Key::Int(n) => n.to_string(),
    })
}

/// Accepts RFC 3339 as well as offset-less ISO-8601 (read as UTC), which is
/// what the change feed sends for `timestamp` columns.
fn timestamp<'de, D>(deserializer: D) -> std::result::Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    parse_timestamp(&raw).map_err(serde::de::Error::custom)
}

pub fn parse_timestamp(raw: &str) -> std::result::Result<DateTime<Utc>, String> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Ok(ts.with_timezone(&Utc));
    }
    // Postgres renders `+00` offsets without minutes.
    if let Ok(ts) = DateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f%#z") {
        return Ok(ts.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, fmt) {
            return Ok(naive.and_utc());
        }
    }
    Err(format!("unrecognized timestamp '{raw}'"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn profile_decodes_original_role_spelling() {
        let p = Profile::from_row(json!({
            "id": "u1", "username": "kim", "avatar_url": null, "role": "kprpuser"
        }))
        .unwrap();
        assert_eq!(p.role, Role::StandardUser);
        assert_eq!(p.avatar_url, "");

        let p = Profile::from_row(json!({"id": "u2", "username": "a", "role": "standard_user"})).unwrap();
        assert_eq!(p.role, Role::StandardUser);
        assert_eq!(serde_json::to_value(p.role).unwrap(), json!("kprpuser"));
    }

    #[test]
    fn profile_rejects_unknown_role_and_blank_id() {
        assert!(Profile::from_row(json!({"id": "u1", "role": "root"})).is_err());
        assert!(Profile::from_row(json!({"id": " ", "role": "admin"})).is_err());
    }

    #[test]
    fn message_decodes_joined_row() {
        let m = Message::from_row(json!({
            "id": 42,
            "content": "hello",
            "user_id": "u1",
            "created_at": "2024-03-01T10:00:00.123456+00:00",
            "profiles": {"id": "u1", "username": "kim", "avatar_url": "https://a/b.png", "role": "admin"}
        }))
        .unwrap();
        assert_eq!(m.id, "42");
        assert_eq!(m.author_name(), "kim");
        assert!(m.profile.as_ref().unwrap().is_admin());
    }

    #[test]
    fn message_rejects_mismatched_embedded_profile() {
        let err = Message::from_row(json!({
            "id": "m1",
            "content": "x",
            "user_id": "u1",
            "created_at": "2024-03-01T10:00:00Z",
            "profiles": {"id": "u2", "role": "admin"}
        }))
        .unwrap_err();
        assert_eq!(err.code(), "decode");
    }

    #[test]
    fn timestamp_formats() {
        let a = parse_timestamp("2024-03-01T10:00:00Z").unwrap();
        let b = parse_timestamp("2024-03-01T10:00:00").unwrap();
        let c = parse_timestamp("2024-03-01 10:00:00+00").unwrap();
        assert_eq!(a, b);
        assert_eq!(a, c);
        assert!(parse_timestamp("yesterday").is_err());
    }

    #[test]
    fn sort_is_stable_on_ties() {
        let ts = parse_timestamp("2024-03-01T10:00:00Z").unwrap();
        let later = parse_timestamp("2024-03-01T11:00:00Z").unwrap();
        let mk = |id: &str, at| Message {
            id: id.into(),
            content: String::new(),
            user_id: "u".into(),
            created_at: at,
            profile: None,
        };
        let mut feed = vec![mk("c", later), mk("a", ts), mk("b", ts)];
        sort_feed(&mut feed);
        let ids: Vec<_> = feed.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, ["a", "b", "c"]);
    }

    #[test]
    fn profile_patch_applies_only_set_fields() {
        let mut p = Profile {
            id: "u1".into(),
            username: "old".into(),
            avatar_url: "https://x/y.png".into(),
            role: Role::Admin,
        };
        ProfilePatch { username: Some("new".into()), avatar_url: None }.apply(&mut p);
        assert_eq!(p.username, "new");
        assert_eq!(p.avatar_url, "https://x/y.png");
        let body = serde_json::to_value(ProfilePatch { username: Some("n".into()), avatar_url: None }).unwrap();
        assert_eq!(body, json!({"username": "n"}));
    }
}
