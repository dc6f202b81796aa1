//! Application Layer - Use cases and port definitions.
//!
//! This layer contains the application services and port interfaces
//! that define how the domain interacts with external systems.

/// Port interfaces for external systems (change stream, connectivity).
pub mod ports;

/// Application services: transformer, flow control, offline queue, sync client.
pub mod services;
