//! Infrastructure Layer - Adapters and external integrations.
//!
//! This layer contains the concrete implementations of the port interfaces
//! defined in the application layer.

/// Realtime (Phoenix channels) change stream adapter.
pub mod realtime;

/// In-process change stream for tests and local development.
pub mod memory;

/// Online/offline signal adapters.
pub mod connectivity;

/// Configuration loading.
pub mod config;

/// Health check HTTP endpoint.
pub mod health;

/// Prometheus metrics instrumentation.
pub mod metrics;

/// OpenTelemetry tracing integration.
pub mod telemetry;
