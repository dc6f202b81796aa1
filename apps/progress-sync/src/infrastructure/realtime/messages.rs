//! Realtime Wire Messages
//!
//! Phoenix channel envelopes as spoken by a Supabase-compatible Realtime
//! server. Every frame is a JSON object:
//!
//! ```json
//! {"topic":"realtime:progress:user:u1","event":"phx_join","payload":{...},"ref":"1","join_ref":"1"}
//! ```
//!
//! # Events
//!
//! | Event              | Direction | Meaning                                   |
//! |--------------------|-----------|-------------------------------------------|
//! | `phx_join`         | out       | Join a channel with `postgres_changes`    |
//! | `phx_leave`        | out       | Leave a channel                           |
//! | `heartbeat`        | out       | Keep-alive on the `phoenix` topic         |
//! | `phx_reply`        | in        | Reply to join/heartbeat (`ok`/`error`)    |
//! | `postgres_changes` | in        | Row change matching a binding             |
//! | `system`           | in        | Extension status (subscribed / error)     |
//! | `phx_error`        | in        | Channel crashed server-side               |
//! | `phx_close`        | in        | Channel closed server-side                |

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::application::ports::{ChangeKind, ChannelRequest, RawChange};

/// Topic used for socket-level heartbeats.
pub const PHOENIX_TOPIC: &str = "phoenix";

/// Prefix the server expects on channel topics.
pub const TOPIC_PREFIX: &str = "realtime:";

// =============================================================================
// Envelope
// =============================================================================

/// One Phoenix frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhoenixMessage {
    /// Channel topic.
    pub topic: String,
    /// Event name.
    pub event: String,
    /// Event payload.
    #[serde(default)]
    pub payload: Value,
    /// Message reference, echoed by replies.
    #[serde(rename = "ref", default, skip_serializing_if = "Option::is_none")]
    pub reference: Option<String>,
    /// Reference of the join that opened the channel.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub join_ref: Option<String>,
}

impl PhoenixMessage {
    /// Build a `phx_join` for a channel request.
    ///
    /// Only the first filter clause is sent to the server; the server accepts
    /// a single `column=eq.value` filter per binding.
    #[must_use]
    pub fn join(request: &ChannelRequest, access_token: &str, reference: &str) -> Self {
        let server_filter = request
            .filter
            .clauses()
            .first()
            .map(|(column, value)| format!("{column}=eq.{value}"));

        let bindings: Vec<Value> = request
            .bindings
            .iter()
            .map(|binding| {
                let mut entry = json!({
                    "event": binding.event.as_str(),
                    "schema": request.schema,
                    "table": binding.table,
                });
                if let Some(filter) = &server_filter {
                    entry["filter"] = Value::String(filter.clone());
                }
                entry
            })
            .collect();

        Self {
            topic: format!("{TOPIC_PREFIX}{}", request.topic),
            event: "phx_join".to_string(),
            payload: json!({
                "config": {
                    "broadcast": { "ack": false, "self": false },
                    "presence": { "key": "" },
                    "postgres_changes": bindings,
                },
                "access_token": access_token,
            }),
            reference: Some(reference.to_string()),
            join_ref: Some(reference.to_string()),
        }
    }

    /// Build a `phx_leave` for a joined topic.
    #[must_use]
    pub fn leave(topic: &str, join_ref: &str, reference: &str) -> Self {
        Self {
            topic: topic.to_string(),
            event: "phx_leave".to_string(),
            payload: json!({}),
            reference: Some(reference.to_string()),
            join_ref: Some(join_ref.to_string()),
        }
    }

    /// Build a socket heartbeat.
    #[must_use]
    pub fn heartbeat(reference: &str) -> Self {
        Self {
            topic: PHOENIX_TOPIC.to_string(),
            event: "heartbeat".to_string(),
            payload: json!({}),
            reference: Some(reference.to_string()),
            join_ref: None,
        }
    }

    /// Encode as a JSON text frame.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Decode a JSON text frame.
    ///
    /// # Errors
    ///
    /// Returns an error if the frame is not a Phoenix envelope.
    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    /// Interpret the frame.
    #[must_use]
    pub fn classify(&self) -> InboundEvent {
        match self.event.as_str() {
            "phx_reply" => {
                let status = self.payload.get("status").and_then(Value::as_str);
                InboundEvent::Reply {
                    reference: self.reference.clone(),
                    ok: status == Some("ok"),
                    reason: response_reason(&self.payload),
                }
            }
            "postgres_changes" => self
                .payload
                .get("data")
                .cloned()
                .and_then(|data| serde_json::from_value::<PostgresChange>(data).ok())
                .map_or(InboundEvent::Ignored, InboundEvent::Change),
            "system" => {
                let ok = self.payload.get("status").and_then(Value::as_str) != Some("error");
                let message = self
                    .payload
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                InboundEvent::System { ok, message }
            }
            "phx_error" => InboundEvent::ChannelError,
            "phx_close" => InboundEvent::ChannelClosed,
            _ => InboundEvent::Ignored,
        }
    }
}

fn response_reason(payload: &Value) -> Option<String> {
    let response = payload.get("response")?;
    response
        .get("reason")
        .or_else(|| response.get("message"))
        .and_then(Value::as_str)
        .map(ToString::to_string)
}

// =============================================================================
// Inbound Events
// =============================================================================

/// Interpreted inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundEvent {
    /// Reply to a join, leave or heartbeat.
    Reply {
        /// Reference of the request being answered.
        reference: Option<String>,
        /// Whether the request succeeded.
        ok: bool,
        /// Failure reason, when reported.
        reason: Option<String>,
    },
    /// Row change.
    Change(PostgresChange),
    /// Extension status message.
    System {
        /// Whether the status is healthy.
        ok: bool,
        /// Status message.
        message: String,
    },
    /// Channel crashed.
    ChannelError,
    /// Channel closed by the server.
    ChannelClosed,
    /// Anything else (presence, broadcast, unknown).
    Ignored,
}

/// `data` object of a `postgres_changes` frame.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct PostgresChange {
    /// Change type (`INSERT`, `UPDATE`, `DELETE`).
    #[serde(rename = "type")]
    pub change_type: String,
    /// Source schema.
    #[serde(default)]
    pub schema: String,
    /// Source table.
    pub table: String,
    /// New row image.
    #[serde(default)]
    pub record: Value,
    /// Commit time.
    #[serde(default)]
    pub commit_timestamp: Option<DateTime<Utc>>,
}

impl PostgresChange {
    /// Convert to a port-level change. Deletes yield `None`.
    #[must_use]
    pub fn into_raw_change(self) -> Option<RawChange> {
        let kind = ChangeKind::parse(&self.change_type)?;
        Some(RawChange {
            table: self.table,
            kind,
            record: self.record,
            commit_timestamp: self.commit_timestamp,
        })
    }

    /// Read a routing column as a string (numbers are stringified).
    #[must_use]
    pub fn column(&self, name: &str) -> Option<String> {
        match self.record.get(name)? {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
