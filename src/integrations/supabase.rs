//! Supabase backend.
//!
//! - Auth via GoTrue (`/auth/v1/token`, `/auth/v1/logout`)
//! - Tables via PostgREST (`/rest/v1/{table}`)
//! - Change feed via Realtime, see [`super::realtime`]
//!
//! Requests carry the project's anon key as `apikey` and the signed-in
//! user's access token as bearer, so row level security applies as that user.
//! Auth events are raised locally on a broadcast channel whenever this
//! client signs in, refreshes or signs out.

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Deserialize;
use std::time::Duration;
use tokio::sync::broadcast;

use super::realtime::{self, RealtimeParams};
use super::traits::{AuthEvent, AuthEventKind, Backend, ChangeFilter, ChangeSubscription};
use crate::auth::{AuthSession, Identity, SessionStore};
use crate::config::{BackendConfig, RealtimeConfig};
use crate::error::{Result, SyncError};
use crate::feed::{
    Message, MessagePatch, NewMessage, Profile, ProfilePatch, MESSAGES_TABLE, MESSAGE_SELECT,
    PROFILES_TABLE,
};

const AUTH_EVENT_CAPACITY: usize = 32;

/// GoTrue token grant response.
#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
    #[serde(default)]
    expires_at: Option<i64>,
    user: Identity,
}

impl TokenResponse {
    fn into_session(self) -> AuthSession {
        let expires_at = self
            .expires_at
            .or_else(|| self.expires_in.map(|secs| Utc::now().timestamp() + secs));
        AuthSession {
            access_token: self.access_token,
            refresh_token: self.refresh_token,
            expires_at,
            identity: self.user,
        }
    }
}

/// HTTP client for a hosted Supabase project.
pub struct SupabaseBackend {
    config: BackendConfig,
    realtime: RealtimeConfig,
    http: reqwest::Client,
    store: SessionStore,
    auth_tx: broadcast::Sender<AuthEvent>,
}

impl SupabaseBackend {
    pub fn new(config: BackendConfig, realtime: RealtimeConfig, store: SessionStore) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| SyncError::Config(format!("HTTP client: {e}")))?;
        let (auth_tx, _) = broadcast::channel(AUTH_EVENT_CAPACITY);

        Ok(Self {
            config,
            realtime,
            http,
            store,
            auth_tx,
        })
    }

    fn auth_url(&self, endpoint: &str) -> String {
        format!("{}/auth/v1/{}", self.config.base_url(), endpoint)
    }

    fn table_url(&self, table: &str) -> String {
        format!("{}/rest/v1/{}", self.config.base_url(), table)
    }

    /// Bearer token for table calls: the user's if signed in, else the anon key.
    fn bearer(&self) -> String {
        match self.store.load() {
            Ok(Some(session)) => session.access_token,
            _ => self.config.anon_key.clone(),
        }
    }

    fn auth_headers(&self, bearer: &str) -> Vec<(&'static str, String)> {
        vec![
            ("apikey", self.config.anon_key.clone()),
            ("Authorization", format!("Bearer {bearer}")),
        ]
    }

    fn request(&self, method: reqwest::Method, url: &str) -> reqwest::RequestBuilder {
        let bearer = self.bearer();
        let mut request = self.http.request(method, url);
        for (key, value) in self.auth_headers(&bearer) {
            request = request.header(key, value);
        }
        request
    }

    fn table_request(&self, method: reqwest::Method, table: &str) -> reqwest::RequestBuilder {
        let request = self.request(method, &self.table_url(table));
        if self.config.schema == "public" {
            request
        } else {
            request
                .header("Accept-Profile", &self.config.schema)
                .header("Content-Profile", &self.config.schema)
        }
    }

    fn notify(&self, kind: AuthEventKind, session: Option<AuthSession>) {
        let _ = self.auth_tx.send(AuthEvent { kind, session });
    }

    /// Send a PostgREST request that answers with a JSON array.
    async fn send_rows(&self, request: reqwest::RequestBuilder) -> Result<Vec<serde_json::Value>> {
        let resp = check(request.send().await?).await?;
        Ok(resp.json().await?)
    }

    async fn grant(&self, grant_type: &str, body: serde_json::Value) -> Result<AuthSession> {
        let mut request = self
            .http
            .post(self.auth_url("token"))
            .query(&[("grant_type", grant_type)])
            .json(&body);
        for (key, value) in self.auth_headers(&self.config.anon_key) {
            request = request.header(key, value);
        }

        let resp = request.send().await?;
        let status = resp.status();
        if status == reqwest::StatusCode::BAD_REQUEST || status == reqwest::StatusCode::UNAUTHORIZED {
            let body = resp.text().await.unwrap_or_default();
            tracing::debug!(grant_type, %status, "Token grant rejected: {}", error_message(&body));
            return Err(SyncError::InvalidCredentials);
        }
        let token: TokenResponse = check(resp).await?.json().await?;
        let session = token.into_session();
        self.store.save(&session)?;
        Ok(session)
    }

    async fn refresh(&self, refresh_token: &str) -> Result<AuthSession> {
        let session = self
            .grant("refresh_token", serde_json::json!({ "refresh_token": refresh_token }))
            .await?;
        tracing::debug!(user_id = %session.identity.id, "Session refreshed");
        self.notify(AuthEventKind::TokenRefreshed, Some(session.clone()));
        Ok(session)
    }

    /// Realtime parameters for the current session.
    fn realtime_params(&self) -> RealtimeParams {
        RealtimeParams {
            socket_url: realtime::socket_url(self.config.base_url(), &self.config.anon_key),
            access_token: self.bearer(),
            heartbeat: Duration::from_secs(self.realtime.heartbeat_secs),
        }
    }
}

/// Turn a non-success response into [`SyncError::Backend`].
async fn check(resp: reqwest::Response) -> Result<reqwest::Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    Err(SyncError::Backend {
        status: status.as_u16(),
        message: error_message(&body),
    })
}

/// Pull the human-readable part out of a GoTrue or PostgREST error body.
fn error_message(body: &str) -> String {
    let Ok(value) = serde_json::from_str::<serde_json::Value>(body) else {
        return body.trim().to_string();
    };
    ["message", "msg", "error_description", "error"]
        .iter()
        .find_map(|key| value.get(*key).and_then(|v| v.as_str()))
        .map_or_else(|| body.trim().to_string(), str::to_string)
}

fn decode_rows<T>(rows: Vec<serde_json::Value>, decode: fn(serde_json::Value) -> Result<T>) -> Result<Vec<T>> {
    rows.into_iter().map(decode).collect()
}

fn eq(value: &str) -> String {
    format!("eq.{value}")
}

fn timestamp_filter(ts: DateTime<Utc>) -> String {
    eq(&ts.to_rfc3339_opts(SecondsFormat::AutoSi, true))
}

#[async_trait]
impl Backend for SupabaseBackend {
    fn name(&self) -> &str {
        "supabase"
    }

    async fn get_session(&self) -> Result<Option<AuthSession>> {
        let Some(session) = self.store.load()? else {
            return Ok(None);
        };
        if !session.is_expired() {
            return Ok(Some(session));
        }

        let Some(refresh_token) = session.refresh_token.clone() else {
            self.store.clear()?;
            return Ok(None);
        };
        match self.refresh(&refresh_token).await {
            Ok(fresh) => Ok(Some(fresh)),
            Err(SyncError::InvalidCredentials) => {
                tracing::info!(user_id = %session.identity.id, "Stored session could not be refreshed");
                self.store.clear()?;
                self.notify(AuthEventKind::SignedOut, None);
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    async fn sign_in_with_password(&self, email: &str, password: &str) -> Result<AuthSession> {
        let session = self
            .grant(
                "password",
                serde_json::json!({ "email": email, "password": password }),
            )
            .await?;
        tracing::info!(user_id = %session.identity.id, "Signed in");
        self.notify(AuthEventKind::SignedIn, Some(session.clone()));
        Ok(session)
    }

    async fn sign_out(&self) -> Result<()> {
        let session = self.store.load().ok().flatten();
        let outcome = match &session {
            Some(session) => {
                let mut request = self.http.post(self.auth_url("logout"));
                for (key, value) in self.auth_headers(&session.access_token) {
                    request = request.header(key, value);
                }
                match request.send().await {
                    Ok(resp) => check(resp).await.map(|_| ()),
                    Err(e) => Err(e.into()),
                }
            }
            None => Ok(()),
        };

        self.store.clear()?;
        self.notify(AuthEventKind::SignedOut, None);
        outcome
    }

    fn subscribe_auth(&self) -> broadcast::Receiver<AuthEvent> {
        self.auth_tx.subscribe()
    }

    async fn fetch_profile(&self, id: &str) -> Result<Option<Profile>> {
        let request = self
            .table_request(reqwest::Method::GET, PROFILES_TABLE)
            .query(&[("select", "*".to_string()), ("id", eq(id))]);
        let rows = self.send_rows(request).await?;
        rows.into_iter().next().map(Profile::from_row).transpose()
    }

    async fn fetch_profiles(&self) -> Result<Vec<Profile>> {
        let request = self
            .table_request(reqwest::Method::GET, PROFILES_TABLE)
            .query(&[("select", "*")]);
        decode_rows(self.send_rows(request).await?, Profile::from_row)
    }

    async fn fetch_messages(&self) -> Result<Vec<Message>> {
        let request = self
            .table_request(reqwest::Method::GET, MESSAGES_TABLE)
            .query(&[("select", MESSAGE_SELECT), ("order", "created_at.asc")]);
        decode_rows(self.send_rows(request).await?, Message::from_row)
    }

    async fn insert_message(&self, row: &NewMessage) -> Result<Message> {
        let request = self
            .table_request(reqwest::Method::POST, MESSAGES_TABLE)
            .header("Prefer", "return=representation")
            .json(&[row]);
        self.send_rows(request)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| SyncError::Decode("insert returned no row".into()))
            .and_then(Message::from_row)
    }

    async fn update_message(
        &self,
        id: &str,
        patch: &MessagePatch,
        expected_created_at: Option<DateTime<Utc>>,
    ) -> Result<Vec<Message>> {
        let mut filters = vec![("id", eq(id))];
        if let Some(expected) = expected_created_at {
            filters.push(("created_at", timestamp_filter(expected)));
        }
        let request = self
            .table_request(reqwest::Method::PATCH, MESSAGES_TABLE)
            .query(&filters)
            .header("Prefer", "return=representation")
            .json(patch);
        decode_rows(self.send_rows(request).await?, Message::from_row)
    }

    async fn delete_message(&self, id: &str) -> Result<usize> {
        let request = self
            .table_request(reqwest::Method::DELETE, MESSAGES_TABLE)
            .query(&[("id", eq(id))])
            .header("Prefer", "return=representation");
        Ok(self.send_rows(request).await?.len())
    }

    async fn update_profile(&self, id: &str, patch: &ProfilePatch) -> Result<Vec<Profile>> {
        let request = self
            .table_request(reqwest::Method::PATCH, PROFILES_TABLE)
            .query(&[("id", eq(id))])
            .header("Prefer", "return=representation")
            .json(patch);
        decode_rows(self.send_rows(request).await?, Profile::from_row)
    }

    async fn subscribe_changes(&self, filter: ChangeFilter) -> Result<ChangeSubscription> {
        if !self.realtime.enabled {
            return Err(SyncError::Realtime("realtime is disabled in config".into()));
        }
        realtime::subscribe(self.realtime_params(), filter.in_schema(&self.config.schema)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn test_config(url: &str) -> BackendConfig {
        BackendConfig {
            url: url.into(),
            anon_key: "test-anon-key".into(),
            ..BackendConfig::default()
        }
    }

    fn backend(url: &str) -> SupabaseBackend {
        SupabaseBackend::new(test_config(url), RealtimeConfig::default(), SessionStore::ephemeral())
            .unwrap()
    }

    fn token_body(expires_in: i64) -> serde_json::Value {
        json!({
            "access_token": "user-token",
            "token_type": "bearer",
            "expires_in": expires_in,
            "refresh_token": "refresh-1",
            "user": {"id": "u1", "email": "admin@example.com", "aud": "authenticated"}
        })
    }

    #[test]
    fn url_construction() {
        let b = backend("https://test-project.supabase.co/");
        assert_eq!(
            b.table_url("messages"),
            "https://test-project.supabase.co/rest/v1/messages"
        );
        assert_eq!(
            b.auth_url("token"),
            "https://test-project.supabase.co/auth/v1/token"
        );
    }

    #[test]
    fn anon_key_is_bearer_until_signed_in() {
        let b = backend("https://x.supabase.co");
        let headers = b.auth_headers(&b.bearer());
        assert_eq!(headers[0], ("apikey", "test-anon-key".to_string()));
        assert_eq!(headers[1].1, "Bearer test-anon-key");
    }

    #[test]
    fn error_message_extraction() {
        assert_eq!(error_message(r#"{"message":"permission denied"}"#), "permission denied");
        assert_eq!(error_message(r#"{"msg":"bad jwt"}"#), "bad jwt");
        assert_eq!(error_message("plain failure "), "plain failure");
    }

    #[tokio::test]
    async fn sign_in_stores_session_and_notifies() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/auth/v1/token"))
            .and(query_param("grant_type", "password"))
            .and(header("apikey", "test-anon-key"))
            .and(body_json(json!({"email": "admin@example.com", "password": "pw"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(token_body(3600)))
            .mount(&server)
            .await;

        let b = backend(&server.uri());
        let mut events = b.subscribe_auth();
        let session = b.sign_in_with_password("admin@example.com", "pw").await.unwrap();
        assert_eq!(session.identity.id, "u1");
        assert!(session.expires_at.is_some());
        assert_eq!(b.get_session().await.unwrap(), Some(session));
        assert_eq!(events.recv().await.unwrap().kind, AuthEventKind::SignedIn);
        assert_eq!(b.bearer(), "user-token");
    }

    #[tokio::test]
    async fn bad_credentials_map_to_invalid_credentials() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/auth/v1/token"))
            .respond_with(ResponseTemplate::new(400).set_body_json(json!({
                "error": "invalid_grant",
                "error_description": "Invalid login credentials"
            })))
            .mount(&server)
            .await;

        let b = backend(&server.uri());
        let err = b.sign_in_with_password("admin@example.com", "nope").await.unwrap_err();
        assert!(matches!(err, SyncError::InvalidCredentials));
        assert!(b.get_session().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn expired_session_is_refreshed() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/auth/v1/token"))
            .and(query_param("grant_type", "refresh_token"))
            .and(body_json(json!({"refresh_token": "old-refresh"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(token_body(3600)))
            .mount(&server)
            .await;

        let store = SessionStore::ephemeral();
        store
            .save(&AuthSession {
                access_token: "stale".into(),
                refresh_token: Some("old-refresh".into()),
                expires_at: Some(0),
                identity: Identity { id: "u1".into(), email: None },
            })
            .unwrap();
        let b = SupabaseBackend::new(test_config(&server.uri()), RealtimeConfig::default(), store).unwrap();

        let session = b.get_session().await.unwrap().unwrap();
        assert_eq!(session.access_token, "user-token");
        assert_eq!(session.refresh_token.as_deref(), Some("refresh-1"));
    }

    #[tokio::test]
    async fn sign_out_clears_local_session_even_when_server_fails() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/auth/v1/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(token_body(3600)))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/auth/v1/logout"))
            .and(header("Authorization", "Bearer user-token"))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .mount(&server)
            .await;

        let b = backend(&server.uri());
        b.sign_in_with_password("admin@example.com", "pw").await.unwrap();
        let err = b.sign_out().await.unwrap_err();
        assert!(matches!(err, SyncError::Backend { status: 500, .. }));
        assert!(b.get_session().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn fetch_messages_requests_join_and_order() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/rest/v1/messages"))
            .and(query_param("select", MESSAGE_SELECT))
            .and(query_param("order", "created_at.asc"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                {
                    "id": "m1", "content": "hi", "user_id": "u1",
                    "created_at": "2024-05-01T08:00:00+00:00",
                    "profiles": {"id": "u1", "username": "kim", "avatar_url": "", "role": "admin"}
                }
            ])))
            .mount(&server)
            .await;

        let feed = backend(&server.uri()).fetch_messages().await.unwrap();
        assert_eq!(feed.len(), 1);
        assert_eq!(feed[0].author_name(), "kim");
    }

    #[tokio::test]
    async fn malformed_rows_fail_the_read() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/rest/v1/profiles"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                {"id": "u1", "username": "kim", "role": "superuser"}
            ])))
            .mount(&server)
            .await;

        let err = backend(&server.uri()).fetch_profiles().await.unwrap_err();
        assert_eq!(err.code(), "decode");
    }

    #[tokio::test]
    async fn checked_update_sends_revision_filter() {
        let server = MockServer::start().await;
        Mock::given(method("PATCH"))
            .and(path("/rest/v1/messages"))
            .and(query_param("id", "eq.m1"))
            .and(query_param("created_at", "eq.2024-05-01T08:00:00Z"))
            .and(header("Prefer", "return=representation"))
            .and(body_json(json!({"content": "edited"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
            .mount(&server)
            .await;

        let expected = crate::feed::parse_timestamp("2024-05-01T08:00:00Z").unwrap();
        let patch = MessagePatch { content: Some("edited".into()), created_at: None };
        let rows = backend(&server.uri())
            .update_message("m1", &patch, Some(expected))
            .await
            .unwrap();
        assert!(rows.is_empty());
    }

    #[tokio::test]
    async fn row_policy_rejection_surfaces_as_backend_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/rest/v1/messages"))
            .respond_with(ResponseTemplate::new(403).set_body_json(json!({
                "code": "42501",
                "message": "new row violates row-level security policy"
            })))
            .mount(&server)
            .await;

        let err = backend(&server.uri())
            .insert_message(&NewMessage { content: "x".into(), user_id: "u2".into() })
            .await
            .unwrap_err();
        match err {
            SyncError::Backend { status, message } => {
                assert_eq!(status, 403);
                assert!(message.contains("row-level security"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn delete_counts_returned_rows() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/rest/v1/messages"))
            .and(query_param("id", "eq.m9"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([{"id": "m9"}])))
            .mount(&server)
            .await;

        assert_eq!(backend(&server.uri()).delete_message("m9").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn disabled_realtime_refuses_subscriptions() {
        let mut realtime = RealtimeConfig::default();
        realtime.enabled = false;
        let b = SupabaseBackend::new(test_config("https://x.supabase.co"), realtime, SessionStore::ephemeral())
            .unwrap();
        let err = b.subscribe_changes(ChangeFilter::table("messages")).await.err().unwrap();
        assert_eq!(err.code(), "realtime");
    }
}
