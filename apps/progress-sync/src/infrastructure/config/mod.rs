//! Configuration Module
//!
//! Configuration loading for the sync client and its binary.

mod settings;

pub use settings::{
    ConfigError, FlowSettings, ProjectCredentials, RealtimeSettings, ServerSettings, SyncConfig,
    TableSettings, WatchSettings,
};
