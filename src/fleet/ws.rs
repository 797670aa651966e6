use axum::{
    body::Bytes,
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::IntoResponse,
};
use chrono::{DateTime, Utc};
use fleet_common::InstructionMode;
use futures_util::{SinkExt, StreamExt, stream::SplitSink, stream::SplitStream};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

use super::api::SharedState;
use super::broadcaster::ConnectionId;
use super::models::EnqueueOptions;
use super::rate_limit::{RateDecision, Tier};
use super::subscriptions::{ChannelKey, ChannelKind};
use crate::errors::FleetError;

/// How often to send WebSocket Ping frames.
const PING_INTERVAL: Duration = Duration::from_secs(30);

/// How long to wait for a Pong response before considering the connection dead.
const PONG_TIMEOUT: Duration = Duration::from_secs(60);

// ── Inbound messages ─────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "data", rename_all_fields = "camelCase")]
pub enum ClientMessage {
    #[serde(rename = "ping")]
    Ping,
    #[serde(rename = "subscribe")]
    Subscribe { channel: ChannelKind, id: String },
    #[serde(rename = "unsubscribe")]
    Unsubscribe { channel: ChannelKind, id: String },
    #[serde(rename = "subscribeBatch")]
    SubscribeBatch {
        channel: ChannelKind,
        ids: Vec<String>,
    },
    #[serde(rename = "logs:subscribe")]
    LogsSubscribe {
        container_id: String,
        since: Option<DateTime<Utc>>,
        #[serde(default)]
        batch_mode: bool,
    },
    #[serde(rename = "logs:unsubscribe")]
    LogsUnsubscribe { container_id: String },
    #[serde(rename = "instruction:enqueue")]
    Enqueue {
        container_id: String,
        text: String,
        mode: Option<InstructionMode>,
        max_attempts: Option<u32>,
    },
    #[serde(rename = "instruction:cancel")]
    Cancel { container_id: String, job_id: String },
    #[serde(rename = "queue:pause")]
    Pause { container_id: String },
    #[serde(rename = "queue:resume")]
    Resume { container_id: String },
}

/// The `type` field of an inbound frame, used for tier lookup before the
/// body is parsed.
#[derive(Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: String,
}

/// Per-connection dispatcher for inbound frames. Replies go out through the
/// broadcaster so they share the connection's outbound buffer.
pub struct Session {
    conn: ConnectionId,
    state: SharedState,
}

impl Session {
    pub fn new(conn: ConnectionId, state: SharedState) -> Self {
        Self { conn, state }
    }

    pub fn conn(&self) -> ConnectionId {
        self.conn
    }

    /// Rate-limit, parse and dispatch one text frame. Frames without a
    /// readable `type` are charged to the read tier.
    pub async fn handle_text(&self, text: &str) {
        let envelope = serde_json::from_str::<Envelope>(text);
        let tier = match &envelope {
            Ok(envelope) => Tier::for_event(&envelope.kind),
            Err(_) => Tier::Read,
        };
        if let RateDecision::Limited { tier, retry_after } =
            self.state.limiter.check_tier_at(self.conn, tier, Instant::now())
        {
            self.send_fleet_error(&FleetError::RateLimited { tier, retry_after });
            return;
        }

        let envelope = match envelope {
            Ok(envelope) => envelope,
            Err(e) => {
                self.send_error("BAD_MESSAGE", format!("Invalid message: {}", e));
                return;
            }
        };

        match serde_json::from_str::<ClientMessage>(text) {
            Ok(msg) => {
                if let Err(e) = self.dispatch(msg).await {
                    self.send_fleet_error(&e);
                }
            }
            Err(e) => self.send_error(
                "BAD_MESSAGE",
                format!("Invalid {} message: {}", envelope.kind, e),
            ),
        }
    }

    async fn dispatch(&self, msg: ClientMessage) -> Result<(), FleetError> {
        let broadcaster = &self.state.broadcaster;
        match msg {
            ClientMessage::Ping => {
                broadcaster.send_to(self.conn, "pong", serde_json::json!({}));
            }
            ClientMessage::Subscribe { channel, id } => {
                let subscribers = self.subscribe(channel, &id)?;
                broadcaster.send_to(
                    self.conn,
                    "subscribed",
                    serde_json::json!({ "channel": channel, "id": id, "subscribers": subscribers }),
                );
            }
            ClientMessage::Unsubscribe { channel, id } => {
                let remaining = if channel == ChannelKind::Logs {
                    self.state.logs.unsubscribe(self.conn, &id)
                } else {
                    broadcaster.unsubscribe(self.conn, &ChannelKey::new(channel, id.clone()))
                };
                broadcaster.send_to(
                    self.conn,
                    "unsubscribed",
                    serde_json::json!({ "channel": channel, "id": id, "subscribers": remaining }),
                );
            }
            ClientMessage::SubscribeBatch { channel, ids } => {
                let mut accepted = Vec::with_capacity(ids.len());
                for id in ids {
                    match self.subscribe(channel, &id) {
                        Ok(_) => accepted.push(id),
                        Err(e) => self.send_fleet_error(&e),
                    }
                }
                broadcaster.send_to(
                    self.conn,
                    "subscribed",
                    serde_json::json!({ "channel": channel, "ids": accepted }),
                );
            }
            ClientMessage::LogsSubscribe {
                container_id,
                since,
                batch_mode,
            } => {
                let page = self
                    .state
                    .logs
                    .subscribe(self.conn, &container_id, since, batch_mode)
                    .await?;
                broadcaster.send_to(
                    self.conn,
                    "logs:history",
                    serde_json::json!({
                        "containerId": container_id,
                        "logs": page.logs,
                        "total": page.total,
                        "hasMore": page.has_more,
                    }),
                );
            }
            ClientMessage::LogsUnsubscribe { container_id } => {
                self.state.logs.unsubscribe(self.conn, &container_id);
            }
            ClientMessage::Enqueue {
                container_id,
                text,
                mode,
                max_attempts,
            } => {
                let receipt = self
                    .state
                    .queues
                    .enqueue(
                        &container_id,
                        &text,
                        mode.unwrap_or(InstructionMode::Interactive),
                        EnqueueOptions { max_attempts },
                    )
                    .await?;
                broadcaster.send_to(self.conn, "instruction:accepted", &receipt);
            }
            ClientMessage::Cancel {
                container_id,
                job_id,
            } => {
                let queue = self.state.queues.require(&container_id).await?;
                if !queue.cancel(&job_id).await? {
                    let status = queue.job(&job_id).await?.job.status;
                    return Err(FleetError::InvalidStateTransition {
                        job_id,
                        status,
                        action: "cancel",
                    });
                }
            }
            ClientMessage::Pause { container_id } => {
                self.state.queues.require(&container_id).await?.pause().await;
            }
            ClientMessage::Resume { container_id } => {
                self.state.queues.require(&container_id).await?.resume().await;
            }
        }
        Ok(())
    }

    fn subscribe(&self, channel: ChannelKind, id: &str) -> Result<usize, FleetError> {
        if channel != ChannelKind::Creation {
            fleet_common::validate_container_id(id)?;
        }
        Ok(self
            .state
            .broadcaster
            .subscribe(self.conn, ChannelKey::new(channel, id)))
    }

    fn send_fleet_error(&self, err: &FleetError) {
        let mut payload = serde_json::json!({ "code": err.code(), "message": err.to_string() });
        if let FleetError::RateLimited { tier, retry_after } = err {
            payload["tier"] = tier.as_str().into();
            payload["retryAfter"] = (retry_after.as_millis() as u64).into();
        }
        self.state.broadcaster.send_to(self.conn, "error", payload);
    }

    fn send_error(&self, code: &str, message: String) {
        self.state.broadcaster.send_to(
            self.conn,
            "error",
            serde_json::json!({ "code": code, "message": message }),
        );
    }

    /// Drop every trace of the connection.
    pub fn close(&self) {
        self.state.logs.forget_connection(self.conn);
        self.state.broadcaster.disconnect(self.conn);
        self.state.limiter.purge(self.conn);
    }
}

// ── WebSocket handler ────────────────────────────────────────────────

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<SharedState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: SharedState) {
    let (sender, receiver) = socket.split();
    let (conn, outbound) = state.broadcaster.connect(state.outbound_buffer);
    tracing::info!(conn_id = %conn, "websocket connected");
    let session = Session::new(conn, state);
    run_socket_loop(sender, receiver, outbound, &session).await;
    session.close();
    tracing::info!(conn_id = %conn, "websocket disconnected");
}

/// Core WebSocket loop with ping/pong keepalive.
///
/// Forwards the connection's outbound frames, dispatches client text frames
/// through the session, and pings every [`PING_INTERVAL`]. If no Pong is
/// received within [`PONG_TIMEOUT`] after a Ping, the loop exits.
async fn run_socket_loop(
    mut sender: SplitSink<WebSocket, Message>,
    mut receiver: SplitStream<WebSocket>,
    mut outbound: mpsc::Receiver<String>,
    session: &Session,
) {
    let mut ping_interval = tokio::time::interval(PING_INTERVAL);
    // The first tick completes immediately.
    ping_interval.tick().await;

    let mut last_pong = Instant::now();
    let mut awaiting_pong = false;

    loop {
        tokio::select! {
            _ = ping_interval.tick() => {
                if awaiting_pong && last_pong.elapsed() > PONG_TIMEOUT {
                    tracing::debug!(conn_id = %session.conn(), "pong timeout");
                    break;
                }
                if sender.send(Message::Ping(Bytes::new())).await.is_err() {
                    break;
                }
                awaiting_pong = true;
            }

            frame = outbound.recv() => {
                let Some(frame) = frame else { break };
                if sender.send(Message::Text(frame.into())).await.is_err() {
                    break;
                }
            }

            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => session.handle_text(text.as_str()).await,
                    Some(Ok(Message::Pong(_))) => {
                        last_pong = Instant::now();
                        awaiting_pong = false;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        tracing::debug!(conn_id = %session.conn(), error = %e, "websocket receive error");
                        break;
                    }
                }
            }
        }
    }

    let _ = sender.send(Message::Close(None)).await;
}
