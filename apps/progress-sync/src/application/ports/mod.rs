//! Port Interfaces
//!
//! Defines the interfaces (ports) for external systems following
//! the Hexagonal Architecture pattern. These are the contracts that
//! infrastructure adapters must implement.
//!
//! ## Driven Ports (Outbound)
//!
//! - `ChangeStreamPort`: Row-level change stream (one channel per filter)
//! - `ConnectivityPort`: Online/offline signals for the host network

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use crate::domain::subscription::SubscriptionFilter;

// =============================================================================
// Change Stream Types
// =============================================================================

/// Row-level change kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeKind {
    /// Row inserted.
    Insert,
    /// Row updated.
    Update,
}

impl ChangeKind {
    /// Wire name of the change kind.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Insert => "INSERT",
            Self::Update => "UPDATE",
        }
    }

    /// Parse a wire name (case-insensitive). Deletes and unknown kinds yield `None`.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "INSERT" => Some(Self::Insert),
            "UPDATE" => Some(Self::Update),
            _ => None,
        }
    }
}

/// One table/event pair a channel listens to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableBinding {
    /// Table name.
    pub table: String,
    /// Change kind.
    pub event: ChangeKind,
}

impl TableBinding {
    /// Create a binding.
    #[must_use]
    pub fn new(table: impl Into<String>, event: ChangeKind) -> Self {
        Self {
            table: table.into(),
            event,
        }
    }
}

/// Request to open one channel on the change stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelRequest {
    /// Channel topic (unique per subscription key).
    pub topic: String,
    /// Database schema.
    pub schema: String,
    /// Tables and events to listen to.
    pub bindings: Vec<TableBinding>,
    /// Row filter.
    pub filter: SubscriptionFilter,
}

/// Raw row change as delivered by the change stream.
#[derive(Debug, Clone, PartialEq)]
pub struct RawChange {
    /// Source table.
    pub table: String,
    /// Change kind.
    pub kind: ChangeKind,
    /// New row image.
    pub record: Value,
    /// Commit time reported by the server.
    pub commit_timestamp: Option<DateTime<Utc>>,
}

/// Channel lifecycle notifications.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelStatus {
    /// Join acknowledged; changes will flow.
    Subscribed,
    /// Channel failed.
    ChannelError(String),
    /// Join or heartbeat not acknowledged in time.
    TimedOut,
    /// Channel closed by the server or the client.
    Closed,
}

impl ChannelStatus {
    /// Wire-style label.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Subscribed => "SUBSCRIBED",
            Self::ChannelError(_) => "CHANNEL_ERROR",
            Self::TimedOut => "TIMED_OUT",
            Self::Closed => "CLOSED",
        }
    }
}

/// Event emitted on an open channel.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    /// Lifecycle notification.
    Status(ChannelStatus),
    /// Row change.
    Change(RawChange),
}

/// Handle to an open channel.
///
/// Dropping the receiver or cancelling the token tears the channel down.
#[derive(Debug)]
pub struct ChannelSubscription {
    /// Channel events in arrival order.
    pub events: mpsc::Receiver<ChannelEvent>,
    /// Cancels the channel.
    pub cancel: CancellationToken,
}

/// Change stream errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ChangeStreamError {
    /// Could not open the channel.
    #[error("connection failed: {0}")]
    ConnectionFailed(String),
    /// The change stream is shut down.
    #[error("change stream closed")]
    Closed,
}

// =============================================================================
// Ports
// =============================================================================

/// Change-stream primitive: subscribe to row changes matching a filter.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ChangeStreamPort: Send + Sync {
    /// Open a channel for the request.
    async fn subscribe(
        &self,
        request: ChannelRequest,
    ) -> Result<ChannelSubscription, ChangeStreamError>;
}

/// Source of online/offline signals.
pub trait ConnectivityPort: Send + Sync {
    /// Watch connectivity; `true` means online.
    fn watch(&self) -> watch::Receiver<bool>;
}
