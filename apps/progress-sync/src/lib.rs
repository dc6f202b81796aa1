#![cfg_attr(
    test,
    allow(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::float_cmp,
        clippy::significant_drop_tightening,
        clippy::too_many_lines,
        clippy::match_same_arms,
        clippy::needless_pass_by_value,
        clippy::needless_collect,
        clippy::option_if_let_else,
        clippy::default_trait_access,
        clippy::items_after_statements,
        clippy::or_fun_call
    )
)]

//! Progress Sync - Realtime Learning Progress Client
//!
//! Subscribes to row-level change streams for learning-progress records and
//! delivers normalized updates to in-process observers. Many observers of the
//! same scope share one upstream channel.
//!
//! # Layers (inside → outside)
//!
//! - **Domain**: Core types with no I/O
//!   - `progress`: Normalized progress updates
//!   - `subscription`: Keys, filters and the callback registry
//!   - `connection`: Connection lifecycle and quality
//!
//! - **Application**: Use cases and port definitions
//!   - `ports`: Change stream and connectivity interfaces
//!   - `services`: Transformer, flow control, offline queue, reconnect
//!     policy, diagnostics and the `ProgressSync` client
//!
//! - **Infrastructure**: Adapters and external integrations
//!   - `realtime`: Phoenix-channel change stream over WebSocket
//!   - `memory`: In-process change stream
//!   - `connectivity`: Manual and TCP-probe connectivity signals
//!   - `config`: Environment configuration
//!   - `health`: Health check HTTP endpoint
//!
//! # Data Flow
//!
//! ```text
//! Realtime WS ──► channel per key ──► transformer ──► flow control ──┬──► callbacks
//!                                                                    │
//!                                              (offline) offline queue ─┘
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]

// =============================================================================
// Module Declarations
// =============================================================================

/// Domain layer - Core progress types with no external dependencies.
pub mod domain;

/// Application layer - Use cases and port definitions.
pub mod application;

/// Infrastructure layer - Adapters and external integrations.
pub mod infrastructure;

// =============================================================================
// Re-exports
// =============================================================================

// Domain types
pub use domain::connection::{ConnectionQuality, ConnectionState, ConnectionStatus};
pub use domain::progress::{ProgressUpdate, UpdateKind, UpdateMetadata, UpdateSource};
pub use domain::subscription::{SubscriptionFilter, SubscriptionKey};

// Ports
pub use application::ports::{
    ChangeKind, ChangeStreamError, ChangeStreamPort, ChannelEvent, ChannelRequest, ChannelStatus,
    ChannelSubscription, ConnectivityPort, RawChange, TableBinding,
};

// Sync client
pub use application::services::{
    BatchConfig, DrainReport, FlowControlConfig, HealthReport, HealthStatus, OfflineQueueConfig,
    ProgressCallback, ProgressSync, ReconnectConfig, SubscriptionHandle, SyncError, SyncSettings,
    SyncStats,
};

// Infrastructure config
pub use infrastructure::config::{ConfigError, ProjectCredentials, SyncConfig};

// Adapters
pub use infrastructure::connectivity::{ManualConnectivity, ProbeConfig, TcpProbeConnectivity};
pub use infrastructure::memory::InMemoryChangeStream;
pub use infrastructure::realtime::{PhoenixChangeStream, PhoenixConfig};

// Health server
pub use infrastructure::health::{HealthServer, HealthServerError, HealthServerState};

// Metrics
pub use infrastructure::metrics::{DropReason, init_metrics};

// Telemetry
pub use infrastructure::telemetry::{TelemetryConfig, TelemetryGuard, init as init_telemetry};
