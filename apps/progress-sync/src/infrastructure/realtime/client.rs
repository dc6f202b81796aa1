//! Realtime WebSocket Client
//!
//! [`ChangeStreamPort`] adapter for a Supabase-compatible Realtime server.
//! Each subscribed channel gets its own socket and session task:
//!
//! 1. Connect and send `phx_join` with the channel's `postgres_changes` bindings
//! 2. Report `SUBSCRIBED` on an `ok` reply, `CHANNEL_ERROR` on an error reply,
//!    `TIMED_OUT` when no reply arrives within the join timeout
//! 3. Forward row changes, keep the socket alive with heartbeats
//! 4. On cancellation send `phx_leave` and close the socket
//!
//! Reconnection is not handled here; the sync client reopens the channel.
//!
//! # Stream URL
//!
//! `wss://<project>.supabase.co/realtime/v1/websocket?apikey=<anon key>&vsn=1.0.0`

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use super::heartbeat::{HeartbeatConfig, HeartbeatEvent, HeartbeatManager, HeartbeatState};
use super::messages::{InboundEvent, PHOENIX_TOPIC, PhoenixMessage, PostgresChange};
use crate::application::ports::{
    ChangeStreamError, ChangeStreamPort, ChannelEvent, ChannelRequest, ChannelStatus,
    ChannelSubscription,
};
use crate::domain::subscription::SubscriptionFilter;

// =============================================================================
// Error Type
// =============================================================================

/// Errors that end a channel session.
#[derive(Debug, thiserror::Error)]
pub enum PhoenixClientError {
    /// WebSocket error.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// Frame encoding error.
    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),

    /// Server refused the join.
    #[error("join rejected: {0}")]
    JoinRejected(String),

    /// Server reported a channel failure.
    #[error("channel error: {0}")]
    Channel(String),

    /// Socket closed.
    #[error("connection closed")]
    ConnectionClosed,
}

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for the Realtime client.
#[derive(Clone)]
pub struct PhoenixConfig {
    /// WebSocket endpoint including query parameters.
    pub endpoint: String,
    /// API key sent as the channel access token.
    pub api_key: String,
    /// Heartbeat configuration.
    pub heartbeat: HeartbeatConfig,
    /// Time allowed for a join reply.
    pub join_timeout: Duration,
    /// Per-channel event buffer.
    pub event_buffer: usize,
}

impl std::fmt::Debug for PhoenixConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PhoenixConfig")
            .field("endpoint", &redact_apikey(&self.endpoint))
            .field("api_key", &"[REDACTED]")
            .field("heartbeat", &self.heartbeat)
            .field("join_timeout", &self.join_timeout)
            .field("event_buffer", &self.event_buffer)
            .finish()
    }
}

impl PhoenixConfig {
    /// Build a configuration from a project URL (`https://<ref>.supabase.co`).
    #[must_use]
    pub fn from_project_url(project_url: &str, api_key: &str) -> Self {
        let base = project_url.trim_end_matches('/');
        let ws_base = if let Some(rest) = base.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = base.strip_prefix("http://") {
            format!("ws://{rest}")
        } else {
            base.to_string()
        };

        Self {
            endpoint: format!(
                "{ws_base}/realtime/v1/websocket?apikey={}&vsn=1.0.0",
                urlencoding::encode(api_key)
            ),
            api_key: api_key.to_string(),
            heartbeat: HeartbeatConfig::default(),
            join_timeout: Duration::from_secs(10),
            event_buffer: 256,
        }
    }
}

fn redact_apikey(endpoint: &str) -> String {
    endpoint.find("apikey=").map_or_else(
        || endpoint.to_string(),
        |start| {
            let value_start = start + "apikey=".len();
            let value_end = endpoint[value_start..]
                .find('&')
                .map_or(endpoint.len(), |i| value_start + i);
            format!("{}[REDACTED]{}", &endpoint[..value_start], &endpoint[value_end..])
        },
    )
}

// =============================================================================
// Change Stream Adapter
// =============================================================================

/// Realtime change stream over Phoenix channels.
#[derive(Debug, Clone)]
pub struct PhoenixChangeStream {
    config: Arc<PhoenixConfig>,
}

impl PhoenixChangeStream {
    /// Create a new adapter.
    #[must_use]
    pub fn new(config: PhoenixConfig) -> Self {
        Self {
            config: Arc::new(config),
        }
    }
}

#[async_trait]
impl ChangeStreamPort for PhoenixChangeStream {
    async fn subscribe(
        &self,
        request: ChannelRequest,
    ) -> Result<ChannelSubscription, ChangeStreamError> {
        tracing::debug!(topic = %request.topic, "Connecting to realtime server");

        let (socket, _response) = tokio_tungstenite::connect_async(self.config.endpoint.as_str())
            .await
            .map_err(|e| ChangeStreamError::ConnectionFailed(e.to_string()))?;

        let (event_tx, events) = mpsc::channel(self.config.event_buffer.max(1));
        let cancel = CancellationToken::new();

        let session = ChannelSession {
            config: Arc::clone(&self.config),
            request,
            event_tx,
            cancel: cancel.clone(),
            next_ref: 0,
        };
        tokio::spawn(session.run(socket));

        Ok(ChannelSubscription { events, cancel })
    }
}

// =============================================================================
// Channel Session
// =============================================================================

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct ChannelSession {
    config: Arc<PhoenixConfig>,
    request: ChannelRequest,
    event_tx: mpsc::Sender<ChannelEvent>,
    cancel: CancellationToken,
    next_ref: u64,
}

impl ChannelSession {
    fn make_ref(&mut self) -> String {
        self.next_ref += 1;
        self.next_ref.to_string()
    }

    async fn emit(&self, event: ChannelEvent) {
        let _ = self.event_tx.send(event).await;
    }

    async fn run(mut self, socket: Socket) {
        let topic = self.request.topic.clone();
        match self.session(socket).await {
            Ok(()) => tracing::debug!(topic = %topic, "Realtime channel left"),
            Err(PhoenixClientError::JoinRejected(reason) | PhoenixClientError::Channel(reason)) => {
                tracing::warn!(topic = %topic, reason = %reason, "Realtime channel failed");
                self.emit(ChannelEvent::Status(ChannelStatus::ChannelError(reason)))
                    .await;
            }
            Err(e) => {
                tracing::warn!(topic = %topic, error = %e, "Realtime socket failed");
                self.emit(ChannelEvent::Status(ChannelStatus::ChannelError(e.to_string())))
                    .await;
            }
        }
    }

    async fn session(&mut self, socket: Socket) -> Result<(), PhoenixClientError> {
        let (mut write, mut read) = socket.split();

        let join_ref = self.make_ref();
        let join = PhoenixMessage::join(&self.request, &self.config.api_key, &join_ref);
        let channel_topic = join.topic.clone();
        write.send(Message::Text(join.to_json()?.into())).await?;

        let heartbeat_state = Arc::new(HeartbeatState::new());
        let (heartbeat_tx, mut heartbeat_rx) = mpsc::channel::<HeartbeatEvent>(4);
        let heartbeat_cancel = self.cancel.child_token();
        let _heartbeat_guard = heartbeat_cancel.clone().drop_guard();
        tokio::spawn(
            HeartbeatManager::new(
                self.config.heartbeat,
                Arc::clone(&heartbeat_state),
                heartbeat_tx,
                heartbeat_cancel,
            )
            .run(),
        );

        let join_deadline = tokio::time::sleep(self.config.join_timeout);
        tokio::pin!(join_deadline);
        let mut joined = false;

        loop {
            tokio::select! {
                biased;
                () = self.cancel.cancelled() => {
                    let leave_ref = self.make_ref();
                    let leave = PhoenixMessage::leave(&channel_topic, &join_ref, &leave_ref);
                    let _ = write.send(Message::Text(leave.to_json()?.into())).await;
                    let _ = write.close().await;
                    return Ok(());
                }
                () = &mut join_deadline, if !joined => {
                    tracing::warn!(topic = %channel_topic, "Join timed out");
                    self.emit(ChannelEvent::Status(ChannelStatus::TimedOut)).await;
                    let _ = write.close().await;
                    return Ok(());
                }
                heartbeat_event = heartbeat_rx.recv() => {
                    match heartbeat_event {
                        Some(HeartbeatEvent::Send) => {
                            heartbeat_state.mark_sent();
                            let reference = self.make_ref();
                            let frame = PhoenixMessage::heartbeat(&reference).to_json()?;
                            write.send(Message::Text(frame.into())).await?;
                        }
                        Some(HeartbeatEvent::Timeout) => {
                            self.emit(ChannelEvent::Status(ChannelStatus::TimedOut)).await;
                            let _ = write.close().await;
                            return Ok(());
                        }
                        None => {
                            tracing::debug!("Heartbeat channel closed");
                        }
                    }
                }
                msg = read.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            let frame = match PhoenixMessage::from_json(&text) {
                                Ok(frame) => frame,
                                Err(e) => {
                                    tracing::debug!(error = %e, "Ignoring undecodable frame");
                                    continue;
                                }
                            };
                            if frame.topic == PHOENIX_TOPIC {
                                heartbeat_state.record_reply();
                                continue;
                            }
                            if frame.topic != channel_topic {
                                continue;
                            }
                            match frame.classify() {
                                InboundEvent::Reply { reference, ok, reason } => {
                                    if joined || reference.as_deref() != Some(join_ref.as_str()) {
                                        continue;
                                    }
                                    if !ok {
                                        return Err(PhoenixClientError::JoinRejected(
                                            reason.unwrap_or_else(|| "join refused".to_string()),
                                        ));
                                    }
                                    joined = true;
                                    tracing::info!(topic = %channel_topic, "Realtime channel joined");
                                    self.emit(ChannelEvent::Status(ChannelStatus::Subscribed)).await;
                                }
                                InboundEvent::Change(change) => self.forward_change(change).await,
                                InboundEvent::System { ok: false, message } => {
                                    return Err(PhoenixClientError::Channel(message));
                                }
                                InboundEvent::ChannelError => {
                                    return Err(PhoenixClientError::Channel("server reported phx_error".to_string()));
                                }
                                InboundEvent::ChannelClosed => {
                                    self.emit(ChannelEvent::Status(ChannelStatus::Closed)).await;
                                    return Ok(());
                                }
                                InboundEvent::System { ok: true, .. } | InboundEvent::Ignored => {}
                            }
                        }
                        Some(Ok(Message::Ping(data))) => {
                            write.send(Message::Pong(data)).await?;
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            return Err(PhoenixClientError::ConnectionClosed);
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => return Err(e.into()),
                    }
                }
                () = self.event_tx.closed() => {
                    self.cancel.cancel();
                }
            }
        }
    }

    /// Forward a change that passes the clauses the server did not apply.
    async fn forward_change(&self, change: PostgresChange) {
        if !matches_local_clauses(&self.request.filter, &change) {
            tracing::trace!(table = %change.table, "Change outside local filter");
            return;
        }
        if let Some(raw) = change.into_raw_change() {
            self.emit(ChannelEvent::Change(raw)).await;
        }
    }
}

/// Check every clause after the first, which the server already applied.
fn matches_local_clauses(filter: &SubscriptionFilter, change: &PostgresChange) -> bool {
    filter
        .clauses()
        .iter()
        .skip(1)
        .all(|(column, value)| change.column(column).is_none_or(|actual| actual == *value))
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn endpoint_from_project_url() {
        let config = PhoenixConfig::from_project_url("https://abc.supabase.co/", "anon-key");
        assert_eq!(
            config.endpoint,
            "wss://abc.supabase.co/realtime/v1/websocket?apikey=anon-key&vsn=1.0.0"
        );
        assert_eq!(config.join_timeout, Duration::from_secs(10));

        let local = PhoenixConfig::from_project_url("http://localhost:54321", "k");
        assert!(local.endpoint.starts_with("ws://localhost:54321/realtime/v1/websocket"));
    }

    #[test]
    fn api_key_is_query_encoded() {
        let config = PhoenixConfig::from_project_url("https://abc.supabase.co", "a+b/c=d&e");
        assert_eq!(
            config.endpoint,
            "wss://abc.supabase.co/realtime/v1/websocket?apikey=a%2Bb%2Fc%3Dd%26e&vsn=1.0.0"
        );
        assert_eq!(config.api_key, "a+b/c=d&e");
    }

    #[test]
    fn debug_redacts_key() {
        let config = PhoenixConfig::from_project_url("https://abc.supabase.co", "secret-key");
        let debug = format!("{config:?}");
        assert!(!debug.contains("secret-key"));
        assert!(debug.contains("apikey=[REDACTED]&vsn=1.0.0"));
    }

    #[test]
    fn local_clauses_skip_server_clause() {
        let change = |user: &str, course: &str| PostgresChange {
            change_type: "INSERT".to_string(),
            schema: "public".to_string(),
            table: "user_progress".to_string(),
            record: json!({"user_id": user, "course_id": course}),
            commit_timestamp: None,
        };

        let filter = SubscriptionFilter::user_course("u1", "c1");
        assert!(matches_local_clauses(&filter, &change("u1", "c1")));
        assert!(!matches_local_clauses(&filter, &change("u1", "c2")));
        // The user clause is enforced server-side.
        assert!(matches_local_clauses(&filter, &change("other", "c1")));
        assert!(matches_local_clauses(
            &SubscriptionFilter::user("u1"),
            &change("u1", "anything")
        ));
    }
}
