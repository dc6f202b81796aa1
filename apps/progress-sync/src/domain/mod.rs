//! Domain Layer - Core progress-sync types.
//!
//! This layer contains the progress update model, subscription keys and
//! registry, and connection state types. Everything here is synchronous and
//! free of I/O.

/// Connection lifecycle and quality types.
pub mod connection;

/// Normalized progress update types.
pub mod progress;

/// Subscription keys, filters and callback registry.
pub mod subscription;
