//! Prometheus Metrics Module
//!
//! Exposes sync-client metrics via Prometheus format for monitoring.
//!
//! # Metrics Categories
//!
//! - **Changes**: Raw rows received per table, fields defaulted by the transformer
//! - **Delivery**: Updates delivered, dropped by reason, callback panics
//! - **Connections**: Active channels, reconnect attempts
//! - **Offline Queue**: Depth, evictions, drain latency
//!
//! # Integration
//!
//! Metrics are exposed at `/metrics` on the health server port. Recording
//! functions are no-ops until [`init_metrics`] installs a recorder.

use std::sync::OnceLock;
use std::time::Duration;

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

// =============================================================================
// Global Metrics Handle
// =============================================================================

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Initialize the Prometheus metrics recorder.
///
/// Repeated calls return the already installed handle.
///
/// # Errors
///
/// Returns `MetricsError` if the global recorder cannot be installed.
pub fn init_metrics() -> Result<PrometheusHandle, MetricsError> {
    if let Some(handle) = PROMETHEUS_HANDLE.get() {
        return Ok(handle.clone());
    }

    let handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| MetricsError::InstallFailed(e.to_string()))?;
    register_metrics();

    Ok(PROMETHEUS_HANDLE.get_or_init(|| handle).clone())
}

/// Get the Prometheus handle for rendering metrics.
///
/// Returns `None` if metrics have not been initialized.
#[must_use]
pub fn get_metrics_handle() -> Option<PrometheusHandle> {
    PROMETHEUS_HANDLE.get().cloned()
}

/// Metrics setup errors.
#[derive(Debug, thiserror::Error)]
pub enum MetricsError {
    /// Recorder installation failed.
    #[error("failed to install Prometheus recorder: {0}")]
    InstallFailed(String),
}

// =============================================================================
// Metric Registration
// =============================================================================

fn register_metrics() {
    describe_counter!(
        "progress_sync_changes_received_total",
        "Raw row changes received from the change stream"
    );
    describe_counter!(
        "progress_sync_fields_defaulted_total",
        "Row fields that were missing or malformed and got defaulted"
    );
    describe_counter!(
        "progress_sync_updates_delivered_total",
        "Updates handed to subscriber callbacks"
    );
    describe_counter!(
        "progress_sync_updates_dropped_total",
        "Updates discarded before delivery, by reason"
    );
    describe_counter!(
        "progress_sync_callback_panics_total",
        "Subscriber callbacks that panicked"
    );

    describe_gauge!(
        "progress_sync_active_channels",
        "Number of open change-stream channels"
    );
    describe_counter!(
        "progress_sync_reconnects_total",
        "Channel reconnection attempts"
    );

    describe_gauge!(
        "progress_sync_offline_queue_depth",
        "Updates waiting in the offline queue"
    );
    describe_counter!(
        "progress_sync_offline_evictions_total",
        "Offline queue items evicted on overflow"
    );
    describe_histogram!(
        "progress_sync_queue_drain_seconds",
        "Time spent in one offline queue drain cycle"
    );
}

// =============================================================================
// Metric Recording Functions
// =============================================================================

/// Why an update never reached a callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// Row could not be attributed to a user and course.
    Malformed,
    /// Row fell outside the subscription filter.
    OutOfScope,
    /// Throttle window was closed.
    Throttled,
    /// Subscription was gone or inactive.
    Inactive,
    /// Replay failed too many times.
    RetriesExhausted,
}

impl DropReason {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Malformed => "malformed",
            Self::OutOfScope => "out_of_scope",
            Self::Throttled => "throttled",
            Self::Inactive => "inactive",
            Self::RetriesExhausted => "retries_exhausted",
        }
    }
}

/// Record a raw change received for a table.
pub fn record_change_received(table: &str) {
    counter!(
        "progress_sync_changes_received_total",
        "table" => table.to_string()
    )
    .increment(1);
}

/// Record a field defaulted by the transformer.
pub fn record_field_defaulted(field: &'static str) {
    counter!("progress_sync_fields_defaulted_total", "field" => field).increment(1);
}

/// Record updates handed to callbacks.
pub fn record_updates_delivered(count: u64) {
    counter!("progress_sync_updates_delivered_total").increment(count);
}

/// Record dropped updates.
pub fn record_updates_dropped(reason: DropReason, count: u64) {
    counter!(
        "progress_sync_updates_dropped_total",
        "reason" => reason.as_str()
    )
    .increment(count);
}

/// Record a panicking callback.
pub fn record_callback_panic() {
    counter!("progress_sync_callback_panics_total").increment(1);
}

/// Update the open channel count.
#[allow(clippy::cast_precision_loss)]
pub fn set_active_channels(count: usize) {
    gauge!("progress_sync_active_channels").set(count as f64);
}

/// Record a channel reconnection attempt.
pub fn record_reconnect() {
    counter!("progress_sync_reconnects_total").increment(1);
}

/// Update the offline queue depth.
#[allow(clippy::cast_precision_loss)]
pub fn set_offline_queue_depth(depth: usize) {
    gauge!("progress_sync_offline_queue_depth").set(depth as f64);
}

/// Record offline queue evictions.
pub fn record_offline_evictions(count: u64) {
    counter!("progress_sync_offline_evictions_total").increment(count);
}

/// Record the duration of one drain cycle.
pub fn record_drain_duration(duration: Duration) {
    histogram!("progress_sync_queue_drain_seconds").record(duration.as_secs_f64());
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drop_reason_as_str() {
        assert_eq!(DropReason::Malformed.as_str(), "malformed");
        assert_eq!(DropReason::OutOfScope.as_str(), "out_of_scope");
        assert_eq!(DropReason::Throttled.as_str(), "throttled");
        assert_eq!(DropReason::Inactive.as_str(), "inactive");
        assert_eq!(DropReason::RetriesExhausted.as_str(), "retries_exhausted");
    }

    #[test]
    fn recording_without_recorder_is_noop() {
        record_change_received("user_progress");
        record_updates_dropped(DropReason::Throttled, 3);
        set_offline_queue_depth(7);
    }
}
