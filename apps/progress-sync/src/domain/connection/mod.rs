//! Connection State Types
//!
//! Lifecycle status and advisory quality rating for the realtime link.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Lifecycle status of a realtime channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    /// Joined and receiving events.
    Connected,
    /// Join in progress.
    Connecting,
    /// Not connected (initial state, or deliberately closed).
    #[default]
    Disconnected,
    /// Failed; a reconnect may be scheduled.
    Error,
}

impl ConnectionStatus {
    /// Get the status label.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Connected => "connected",
            Self::Connecting => "connecting",
            Self::Disconnected => "disconnected",
            Self::Error => "error",
        }
    }
}

/// Coarse link quality derived from how recently a connection succeeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionQuality {
    /// Connected less than 1s ago.
    Excellent,
    /// Connected less than 5s ago.
    Good,
    /// Connected less than 10s ago.
    Fair,
    /// Older, or never connected.
    Poor,
}

impl ConnectionQuality {
    /// Rate quality from the time elapsed since the last successful connection.
    #[must_use]
    pub const fn from_elapsed(elapsed: Duration) -> Self {
        let millis = elapsed.as_millis();
        if millis < 1_000 {
            Self::Excellent
        } else if millis < 5_000 {
            Self::Good
        } else if millis < 10_000 {
            Self::Fair
        } else {
            Self::Poor
        }
    }

    /// Get the quality label.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Excellent => "excellent",
            Self::Good => "good",
            Self::Fair => "fair",
            Self::Poor => "poor",
        }
    }
}

/// Process-wide snapshot of the realtime connection.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConnectionState {
    /// Current status.
    pub status: ConnectionStatus,
    /// Wall-clock time of the last successful connection.
    pub last_connected: Option<DateTime<Utc>>,
    /// Consecutive reconnect attempts since the last success.
    pub reconnect_attempts: u32,
    /// Most recent error message.
    pub last_error: Option<String>,
    /// Advisory quality rating.
    pub quality: ConnectionQuality,
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self {
            status: ConnectionStatus::Disconnected,
            last_connected: None,
            reconnect_attempts: 0,
            last_error: None,
            quality: ConnectionQuality::Poor,
        }
    }
}
