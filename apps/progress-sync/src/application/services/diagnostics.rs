//! Diagnostics
//!
//! Point-in-time statistics and a composite health verdict for the sync
//! client. The verdict is a pure function of a [`DiagnosticsSnapshot`] so it
//! can be tested without a running client.

use serde::Serialize;

use crate::domain::connection::{ConnectionQuality, ConnectionState, ConnectionStatus};

/// Queue depth above which health degrades.
pub const QUEUE_DEPTH_WARNING: usize = 100;

/// Overall health status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// All systems operational.
    Healthy,
    /// Functional, but something needs attention.
    Degraded,
    /// Updates are not flowing.
    Unhealthy,
}

impl HealthStatus {
    /// Get the status label.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Degraded => "degraded",
            Self::Unhealthy => "unhealthy",
        }
    }
}

/// Client statistics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncStats {
    /// Registered subscription keys.
    pub active_subscriptions: usize,
    /// Registered callbacks across all keys.
    pub total_callbacks: usize,
    /// Keys with a non-empty batch buffer.
    pub pending_batches: usize,
    /// Items waiting in the offline queue.
    pub offline_queue_depth: usize,
    /// Connection quality label.
    pub connection_quality: ConnectionQuality,
    /// Last reported connectivity.
    pub online: bool,
    /// Channels that gave up reconnecting.
    pub exhausted_channels: usize,
}

/// Inputs to the health verdict.
#[derive(Debug, Clone)]
pub struct DiagnosticsSnapshot {
    /// Connection state.
    pub connection: ConnectionState,
    /// Statistics.
    pub stats: SyncStats,
    /// Keys whose channel exhausted its reconnect attempts.
    pub exhausted_keys: Vec<String>,
}

/// Health verdict with the reasons behind it.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    /// Overall status.
    pub status: HealthStatus,
    /// Human-readable issues, empty when healthy.
    pub issues: Vec<String>,
    /// Connection state at evaluation time.
    pub connection: ConnectionState,
    /// Statistics at evaluation time.
    pub stats: SyncStats,
}

/// Evaluate health from a snapshot.
#[must_use]
pub fn evaluate_health(snapshot: DiagnosticsSnapshot) -> HealthReport {
    let mut status = HealthStatus::Healthy;
    let mut issues = Vec::new();

    if snapshot.connection.quality == ConnectionQuality::Poor {
        status = HealthStatus::Degraded;
        issues.push("connection quality is poor".to_string());
    }

    let depth = snapshot.stats.offline_queue_depth;
    if depth > QUEUE_DEPTH_WARNING {
        status = if status == HealthStatus::Degraded {
            HealthStatus::Unhealthy
        } else {
            HealthStatus::Degraded
        };
        issues.push(format!("offline queue depth {depth} exceeds {QUEUE_DEPTH_WARNING}"));
    }

    if snapshot.connection.status == ConnectionStatus::Error {
        status = HealthStatus::Unhealthy;
        match &snapshot.connection.last_error {
            Some(error) => issues.push(format!("connection error: {error}")),
            None => issues.push("connection error".to_string()),
        }
    }

    for key in &snapshot.exhausted_keys {
        status = HealthStatus::Unhealthy;
        issues.push(format!("reconnect attempts exhausted for {key}"));
    }

    HealthReport {
        status,
        issues,
        connection: snapshot.connection,
        stats: snapshot.stats,
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use test_case::test_case;

    use super::*;

    fn snapshot(
        status: ConnectionStatus,
        quality: ConnectionQuality,
        depth: usize,
    ) -> DiagnosticsSnapshot {
        DiagnosticsSnapshot {
            connection: ConnectionState {
                status,
                last_connected: Some(Utc::now()),
                reconnect_attempts: 0,
                last_error: None,
                quality,
            },
            stats: SyncStats {
                active_subscriptions: 1,
                total_callbacks: 1,
                pending_batches: 0,
                offline_queue_depth: depth,
                connection_quality: quality,
                online: true,
                exhausted_channels: 0,
            },
            exhausted_keys: Vec::new(),
        }
    }

    #[test_case(ConnectionStatus::Connected, ConnectionQuality::Excellent, 0, HealthStatus::Healthy ; "all good")]
    #[test_case(ConnectionStatus::Connected, ConnectionQuality::Good, 150, HealthStatus::Degraded ; "deep queue")]
    #[test_case(ConnectionStatus::Connected, ConnectionQuality::Good, 100, HealthStatus::Healthy ; "queue at threshold")]
    #[test_case(ConnectionStatus::Connected, ConnectionQuality::Poor, 0, HealthStatus::Degraded ; "poor quality")]
    #[test_case(ConnectionStatus::Connected, ConnectionQuality::Poor, 150, HealthStatus::Unhealthy ; "poor quality and deep queue")]
    #[test_case(ConnectionStatus::Error, ConnectionQuality::Fair, 0, HealthStatus::Unhealthy ; "error status")]
    fn verdicts(
        status: ConnectionStatus,
        quality: ConnectionQuality,
        depth: usize,
        expected: HealthStatus,
    ) {
        let report = evaluate_health(snapshot(status, quality, depth));
        assert_eq!(report.status, expected);
        assert_eq!(report.issues.is_empty(), expected == HealthStatus::Healthy);
    }

    #[test]
    fn exhausted_channel_is_unhealthy() {
        let mut input = snapshot(ConnectionStatus::Connected, ConnectionQuality::Excellent, 0);
        input.exhausted_keys.push("user:u1".to_string());

        let report = evaluate_health(input);
        assert_eq!(report.status, HealthStatus::Unhealthy);
        assert!(report.issues[0].contains("user:u1"));
    }

    #[test]
    fn report_serializes_labels() {
        let report = evaluate_health(snapshot(
            ConnectionStatus::Connected,
            ConnectionQuality::Good,
            150,
        ));
        let json = serde_json::to_value(&report).unwrap();

        assert_eq!(json["status"], "degraded");
        assert_eq!(json["stats"]["connection_quality"], "good");
        assert_eq!(json["connection"]["status"], "connected");
    }
}
