//! Realtime change feed over WebSocket.
//!
//! ## Protocol
//!
//! Phoenix channels, JSON serializer v1:
//!
//! 1. **Connect**: `wss://<project>/realtime/v1/websocket?apikey=<anon>&vsn=1.0.0`
//! 2. **Join**: `phx_join` on `realtime:<schema>:<table>` with a
//!    `postgres_changes` filter and the user's access token
//! 3. **Stream**: `postgres_changes` frames carry `{type, schema, table, record, old_record}`;
//!    a `heartbeat` on the `phoenix` topic keeps the socket alive
//! 4. **Leave**: `phx_leave`, then close
//!
//! One socket per subscription. A socket that drops ends its subscription;
//! there is no reconnect.

use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use super::traits::{ChangeEvent, ChangeFilter, ChangeKind, ChangeSubscription};
use crate::error::{Result, SyncError};

/// Wait this long for the join reply before giving up.
const JOIN_TIMEOUT: Duration = Duration::from_secs(10);

const EVENT_BUFFER: usize = 64;

const PHOENIX_TOPIC: &str = "phoenix";

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Connection parameters for one subscription.
#[derive(Debug, Clone)]
pub struct RealtimeParams {
    pub socket_url: String,
    pub access_token: String,
    pub heartbeat: Duration,
}

/// Socket endpoint for a project URL.
pub fn socket_url(base_url: &str, anon_key: &str) -> String {
    let base = base_url.trim_end_matches('/');
    let ws_base = if let Some(rest) = base.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = base.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        base.to_string()
    };
    format!("{ws_base}/realtime/v1/websocket?apikey={anon_key}&vsn=1.0.0")
}

// ── Frames ───────────────────────────────────────────────────────

/// A Phoenix channel message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    pub topic: String,
    pub event: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(rename = "ref", default)]
    pub reference: Option<String>,
}

impl Frame {
    fn to_text(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

pub fn join_frame(filter: &ChangeFilter, access_token: &str, reference: u64) -> Frame {
    let event = filter.event.map_or("*", ChangeKind::as_str);
    Frame {
        topic: filter.topic(),
        event: "phx_join".into(),
        payload: json!({
            "config": {
                "broadcast": {"ack": false, "self": false},
                "presence": {"key": ""},
                "postgres_changes": [{
                    "event": event,
                    "schema": filter.schema,
                    "table": filter.table,
                }],
                "private": false,
            },
            "access_token": access_token,
        }),
        reference: Some(reference.to_string()),
    }
}

pub fn heartbeat_frame(reference: u64) -> Frame {
    Frame {
        topic: PHOENIX_TOPIC.into(),
        event: "heartbeat".into(),
        payload: json!({}),
        reference: Some(reference.to_string()),
    }
}

pub fn leave_frame(topic: &str, reference: u64) -> Frame {
    Frame {
        topic: topic.into(),
        event: "phx_leave".into(),
        payload: json!({}),
        reference: Some(reference.to_string()),
    }
}

/// What an inbound frame means to a subscriber.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Change(ChangeEvent),
    Reply {
        reference: Option<String>,
        ok: bool,
        response: Value,
    },
    /// Server closed or errored the channel.
    Closed(String),
    Ignored,
}

/// Decode one text frame.
pub fn parse_frame(text: &str) -> Result<Inbound> {
    let frame: Frame = serde_json::from_str(text)?;
    match frame.event.as_str() {
        "postgres_changes" => {
            let data = frame
                .payload
                .get("data")
                .ok_or_else(|| SyncError::Realtime("postgres_changes without data".into()))?;
            change_from_data(data).map(Inbound::Change)
        }
        // Older servers emit one event per change type with the data inline.
        "INSERT" | "UPDATE" | "DELETE" => change_from_data(&frame.payload).map(Inbound::Change),
        "phx_reply" => Ok(Inbound::Reply {
            ok: frame.payload.get("status").and_then(Value::as_str) == Some("ok"),
            response: frame.payload.get("response").cloned().unwrap_or(Value::Null),
            reference: frame.reference,
        }),
        "phx_close" => Ok(Inbound::Closed("channel closed by server".into())),
        "phx_error" => Ok(Inbound::Closed(format!("channel error: {}", frame.payload))),
        _ => Ok(Inbound::Ignored),
    }
}

fn change_from_data(data: &Value) -> Result<ChangeEvent> {
    let field = |name: &str| -> Result<String> {
        data.get(name)
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| SyncError::Realtime(format!("change without '{name}'")))
    };
    let kind = match data.get("type").or_else(|| data.get("eventType")).and_then(Value::as_str) {
        Some("INSERT") => ChangeKind::Insert,
        Some("UPDATE") => ChangeKind::Update,
        Some("DELETE") => ChangeKind::Delete,
        other => return Err(SyncError::Realtime(format!("unknown change type {other:?}"))),
    };
    Ok(ChangeEvent {
        kind,
        schema: field("schema")?,
        table: field("table")?,
        old: data.get("old_record").cloned().unwrap_or_else(|| json!({})),
        new: data.get("record").cloned().unwrap_or(Value::Null),
    })
}

// ── Subscription ─────────────────────────────────────────────────

/// Open a socket, join the channel for `filter`, and stream its changes.
pub async fn subscribe(params: RealtimeParams, filter: ChangeFilter) -> Result<ChangeSubscription> {
    tracing::info!(topic = %filter.topic(), "Connecting realtime channel");
    let (mut socket, _response) = tokio_tungstenite::connect_async(params.socket_url.as_str()).await?;

    let join = join_frame(&filter, &params.access_token, 1);
    socket.send(WsMessage::Text(join.to_text()?.into())).await?;
    tokio::time::timeout(JOIN_TIMEOUT, await_join(&mut socket, "1"))
        .await
        .map_err(|_| SyncError::Realtime(format!("join of {} timed out", filter.topic())))??;

    let (tx, rx) = mpsc::channel(EVENT_BUFFER);
    let cancel = CancellationToken::new();
    tokio::spawn(pump(socket, filter.clone(), tx, cancel.clone(), params.heartbeat));

    Ok(ChangeSubscription::new(filter, rx, cancel))
}

async fn await_join(socket: &mut Socket, join_ref: &str) -> Result<()> {
    while let Some(msg) = socket.next().await {
        let WsMessage::Text(text) = msg? else {
            continue;
        };
        match parse_frame(text.as_str())? {
            Inbound::Reply { reference, ok, response } if reference.as_deref() == Some(join_ref) => {
                return if ok {
                    Ok(())
                } else {
                    Err(SyncError::Realtime(format!("join rejected: {response}")))
                };
            }
            Inbound::Closed(reason) => return Err(SyncError::Realtime(reason)),
            _ => {}
        }
    }
    Err(SyncError::Realtime("socket closed during join".into()))
}

async fn pump(
    mut socket: Socket,
    filter: ChangeFilter,
    tx: mpsc::Sender<ChangeEvent>,
    cancel: CancellationToken,
    heartbeat: Duration,
) {
    let topic = filter.topic();
    let mut ticker = tokio::time::interval(heartbeat);
    ticker.tick().await;
    let mut next_ref: u64 = 2;

    loop {
        tokio::select! {
            () = cancel.cancelled() => {
                if let Ok(text) = leave_frame(&topic, next_ref).to_text() {
                    let _ = socket.send(WsMessage::Text(text.into())).await;
                }
                let _ = socket.send(WsMessage::Close(None)).await;
                break;
            }
            _ = ticker.tick() => {
                let Ok(text) = heartbeat_frame(next_ref).to_text() else { continue };
                next_ref += 1;
                if socket.send(WsMessage::Text(text.into())).await.is_err() {
                    tracing::warn!(topic = %topic, "Realtime heartbeat failed, closing channel");
                    break;
                }
            }
            msg = socket.next() => match msg {
                Some(Ok(WsMessage::Text(text))) => match parse_frame(text.as_str()) {
                    Ok(Inbound::Change(event)) if filter.matches(&event) => {
                        if tx.send(event).await.is_err() {
                            break;
                        }
                    }
                    Ok(Inbound::Reply { ok: false, response, .. }) => {
                        tracing::warn!(topic = %topic, %response, "Realtime request rejected");
                    }
                    Ok(Inbound::Closed(reason)) => {
                        tracing::warn!(topic = %topic, "Realtime channel ended: {reason}");
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => tracing::warn!(topic = %topic, "Skipping realtime frame: {e}"),
                },
                Some(Ok(WsMessage::Close(frame))) => {
                    tracing::info!(topic = %topic, close_frame = ?frame, "Realtime socket closed");
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    tracing::error!(topic = %topic, error = %e, "Realtime socket error");
                    break;
                }
                None => break,
            },
        }
    }

    cancel.cancel();
    tracing::debug!(topic = %topic, "Realtime channel loop terminated");
}
