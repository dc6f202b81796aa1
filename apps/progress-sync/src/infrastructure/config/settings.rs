//! Progress Sync Configuration Settings
//!
//! Configuration types for the sync client, loaded from environment variables.

use std::time::Duration;

use crate::application::services::{
    BatchConfig, FlowControlConfig, OfflineQueueConfig, ReconnectConfig, SyncSettings,
};
use crate::infrastructure::connectivity::ProbeConfig;
use crate::infrastructure::realtime::{HeartbeatConfig, PhoenixConfig};

/// Backend project credentials.
#[derive(Clone)]
pub struct ProjectCredentials {
    url: String,
    anon_key: String,
}

impl ProjectCredentials {
    /// Create new credentials.
    #[must_use]
    pub const fn new(url: String, anon_key: String) -> Self {
        Self { url, anon_key }
    }

    /// Project base URL.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Public API key.
    #[must_use]
    pub fn anon_key(&self) -> &str {
        &self.anon_key
    }
}

impl std::fmt::Debug for ProjectCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProjectCredentials")
            .field("url", &self.url)
            .field("anon_key", &"[REDACTED]")
            .finish()
    }
}

/// Database tables the client listens to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableSettings {
    /// Schema.
    pub schema: String,
    /// Progress table.
    pub progress_table: String,
    /// Milestones table.
    pub milestones_table: String,
}

impl Default for TableSettings {
    fn default() -> Self {
        Self {
            schema: "public".to_string(),
            progress_table: "user_progress".to_string(),
            milestones_table: "user_milestones".to_string(),
        }
    }
}

/// Default flow-control settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowSettings {
    /// Debounce window (zero disables).
    pub debounce: Duration,
    /// Throttle window (zero disables).
    pub throttle: Duration,
    /// Whether batching is on.
    pub batch_enabled: bool,
    /// Batch size that triggers a flush.
    pub batch_size: usize,
    /// Batch age that triggers a flush.
    pub batch_interval: Duration,
    /// Sweep interval.
    pub sweep_interval: Duration,
}

impl Default for FlowSettings {
    fn default() -> Self {
        Self {
            debounce: Duration::ZERO,
            throttle: Duration::ZERO,
            batch_enabled: false,
            batch_size: 10,
            batch_interval: Duration::from_millis(1000),
            sweep_interval: Duration::from_secs(5),
        }
    }
}

impl FlowSettings {
    /// Flow-control policy for new subscriptions.
    #[must_use]
    pub const fn flow_control(&self) -> FlowControlConfig {
        FlowControlConfig {
            debounce: self.debounce,
            throttle: self.throttle,
            batch: if self.batch_enabled {
                Some(BatchConfig {
                    size: self.batch_size,
                    interval: self.batch_interval,
                })
            } else {
                None
            },
        }
    }
}

/// Realtime socket settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RealtimeSettings {
    /// Heartbeat interval.
    pub heartbeat_interval: Duration,
    /// Heartbeat reply timeout.
    pub heartbeat_timeout: Duration,
    /// Join acknowledgement timeout.
    pub join_timeout: Duration,
}

impl Default for RealtimeSettings {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(30),
            heartbeat_timeout: Duration::from_secs(30),
            join_timeout: Duration::from_secs(10),
        }
    }
}

/// Server and probe settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerSettings {
    /// Health check HTTP port.
    pub health_port: u16,
    /// Connectivity probe interval.
    pub probe_interval: Duration,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            health_port: 8083,
            probe_interval: Duration::from_secs(15),
        }
    }
}

/// Scopes the binary subscribes to on startup.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WatchSettings {
    /// User to watch.
    pub user_id: Option<String>,
    /// Course to watch.
    pub course_id: Option<String>,
}

/// Complete client configuration.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Project credentials.
    pub credentials: ProjectCredentials,
    /// Table names.
    pub tables: TableSettings,
    /// Default flow control.
    pub flow: FlowSettings,
    /// Offline queue limits.
    pub queue: OfflineQueueConfig,
    /// Channel reconnection policy.
    pub reconnect: ReconnectConfig,
    /// Realtime socket settings.
    pub realtime: RealtimeSettings,
    /// Server settings.
    pub server: ServerSettings,
    /// Startup subscriptions.
    pub watch: WatchSettings,
}

impl SyncConfig {
    /// Create configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if required environment variables are missing.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Create configuration from an arbitrary variable source.
    ///
    /// # Errors
    ///
    /// Returns an error if required variables are missing or malformed.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let url = required(&lookup, "SUPABASE_URL")?;
        let anon_key = required(&lookup, "SUPABASE_ANON_KEY")?;

        if !(url.starts_with("https://") || url.starts_with("http://")) {
            return Err(ConfigError::InvalidValue {
                key: "SUPABASE_URL".to_string(),
                reason: "must start with http:// or https://".to_string(),
            });
        }

        let defaults = TableSettings::default();
        let tables = TableSettings {
            schema: lookup("PROGRESS_SYNC_SCHEMA").unwrap_or(defaults.schema),
            progress_table: lookup("PROGRESS_SYNC_PROGRESS_TABLE")
                .unwrap_or(defaults.progress_table),
            milestones_table: lookup("PROGRESS_SYNC_MILESTONES_TABLE")
                .unwrap_or(defaults.milestones_table),
        };

        let defaults = FlowSettings::default();
        let flow = FlowSettings {
            debounce: parse_env_duration_millis(&lookup, "PROGRESS_SYNC_DEBOUNCE_MS", defaults.debounce),
            throttle: parse_env_duration_millis(&lookup, "PROGRESS_SYNC_THROTTLE_MS", defaults.throttle),
            batch_enabled: parse_env_bool(&lookup, "PROGRESS_SYNC_BATCH_ENABLED", defaults.batch_enabled),
            batch_size: parse_env(&lookup, "PROGRESS_SYNC_BATCH_SIZE", defaults.batch_size),
            batch_interval: parse_env_duration_millis(
                &lookup,
                "PROGRESS_SYNC_BATCH_INTERVAL_MS",
                defaults.batch_interval,
            ),
            sweep_interval: parse_env_duration_secs(
                &lookup,
                "PROGRESS_SYNC_SWEEP_INTERVAL_SECS",
                defaults.sweep_interval,
            ),
        };
        if flow.batch_size == 0 {
            return Err(ConfigError::InvalidValue {
                key: "PROGRESS_SYNC_BATCH_SIZE".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }

        let defaults = OfflineQueueConfig::default();
        let queue = OfflineQueueConfig {
            capacity: parse_env(&lookup, "PROGRESS_SYNC_QUEUE_CAPACITY", defaults.capacity),
            trim_to: parse_env(&lookup, "PROGRESS_SYNC_QUEUE_TRIM_TO", defaults.trim_to),
            drain_batch: parse_env(&lookup, "PROGRESS_SYNC_QUEUE_DRAIN_BATCH", defaults.drain_batch),
            max_retries: parse_env(&lookup, "PROGRESS_SYNC_QUEUE_MAX_RETRIES", defaults.max_retries),
            drain_interval: parse_env_duration_secs(
                &lookup,
                "PROGRESS_SYNC_QUEUE_DRAIN_INTERVAL_SECS",
                defaults.drain_interval,
            ),
        };
        if queue.trim_to > queue.capacity {
            return Err(ConfigError::InvalidValue {
                key: "PROGRESS_SYNC_QUEUE_TRIM_TO".to_string(),
                reason: format!("must not exceed capacity {}", queue.capacity),
            });
        }

        let defaults = ReconnectConfig::default();
        let reconnect = ReconnectConfig {
            base_delay: parse_env_duration_millis(
                &lookup,
                "PROGRESS_SYNC_RECONNECT_BASE_MS",
                defaults.base_delay,
            ),
            max_delay: parse_env_duration_secs(
                &lookup,
                "PROGRESS_SYNC_RECONNECT_MAX_SECS",
                defaults.max_delay,
            ),
            jitter_factor: parse_env(&lookup, "PROGRESS_SYNC_RECONNECT_JITTER", defaults.jitter_factor),
            max_attempts: parse_env(
                &lookup,
                "PROGRESS_SYNC_RECONNECT_MAX_ATTEMPTS",
                defaults.max_attempts,
            ),
        };

        let defaults = RealtimeSettings::default();
        let realtime = RealtimeSettings {
            heartbeat_interval: parse_env_duration_secs(
                &lookup,
                "PROGRESS_SYNC_HEARTBEAT_INTERVAL_SECS",
                defaults.heartbeat_interval,
            ),
            heartbeat_timeout: parse_env_duration_secs(
                &lookup,
                "PROGRESS_SYNC_HEARTBEAT_TIMEOUT_SECS",
                defaults.heartbeat_timeout,
            ),
            join_timeout: parse_env_duration_secs(
                &lookup,
                "PROGRESS_SYNC_JOIN_TIMEOUT_SECS",
                defaults.join_timeout,
            ),
        };

        let defaults = ServerSettings::default();
        let server = ServerSettings {
            health_port: parse_env(&lookup, "PROGRESS_SYNC_HEALTH_PORT", defaults.health_port),
            probe_interval: parse_env_duration_secs(
                &lookup,
                "PROGRESS_SYNC_PROBE_INTERVAL_SECS",
                defaults.probe_interval,
            ),
        };

        let watch = WatchSettings {
            user_id: lookup("PROGRESS_SYNC_WATCH_USER").filter(|v| !v.is_empty()),
            course_id: lookup("PROGRESS_SYNC_WATCH_COURSE").filter(|v| !v.is_empty()),
        };

        Ok(Self {
            credentials: ProjectCredentials::new(url, anon_key),
            tables,
            flow,
            queue,
            reconnect,
            realtime,
            server,
            watch,
        })
    }

    /// Settings for the sync client.
    #[must_use]
    pub fn sync_settings(&self) -> SyncSettings {
        SyncSettings {
            schema: self.tables.schema.clone(),
            progress_table: self.tables.progress_table.clone(),
            milestones_table: self.tables.milestones_table.clone(),
            flow: self.flow.flow_control(),
            sweep_interval: self.flow.sweep_interval,
            queue: self.queue,
            reconnect: self.reconnect,
        }
    }

    /// Settings for the Realtime adapter.
    #[must_use]
    pub fn phoenix_config(&self) -> PhoenixConfig {
        let mut config =
            PhoenixConfig::from_project_url(self.credentials.url(), self.credentials.anon_key());
        config.heartbeat = HeartbeatConfig::new(
            self.realtime.heartbeat_interval,
            self.realtime.heartbeat_timeout,
        );
        config.join_timeout = self.realtime.join_timeout;
        config
    }

    /// Settings for the TCP connectivity probe against the project host.
    #[must_use]
    pub fn probe_config(&self) -> ProbeConfig {
        let mut config = ProbeConfig::new(probe_address(self.credentials.url()));
        config.interval = self.server.probe_interval;
        config
    }
}

/// `host:port` for a project URL, defaulting the port from the scheme.
fn probe_address(url: &str) -> String {
    let (rest, default_port) = url
        .strip_prefix("https://")
        .map(|rest| (rest, 443))
        .or_else(|| url.strip_prefix("http://").map(|rest| (rest, 80)))
        .unwrap_or((url, 443));

    let authority = rest.split(['/', '?']).next().unwrap_or(rest);
    if authority.contains(':') {
        authority.to_string()
    } else {
        format!("{authority}:{default_port}")
    }
}

/// Configuration error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    MissingEnvVar(String),
    /// Environment variable has empty value.
    #[error("environment variable {0} cannot be empty")]
    EmptyValue(String),
    /// Environment variable has an unusable value.
    #[error("environment variable {key} is invalid: {reason}")]
    InvalidValue {
        /// Variable name.
        key: String,
        /// What is wrong with it.
        reason: String,
    },
}

fn required<F>(lookup: &F, key: &str) -> Result<String, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let value = lookup(key).ok_or_else(|| ConfigError::MissingEnvVar(key.to_string()))?;
    if value.trim().is_empty() {
        return Err(ConfigError::EmptyValue(key.to_string()));
    }
    Ok(value)
}

fn parse_env<F, T>(lookup: &F, key: &str, default: T) -> T
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    lookup(key)
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn parse_env_bool<F>(lookup: &F, key: &str, default: bool) -> bool
where
    F: Fn(&str) -> Option<String>,
{
    lookup(key).map_or(default, |v| {
        matches!(v.trim().to_lowercase().as_str(), "1" | "true" | "yes" | "on")
    })
}

fn parse_env_duration_secs<F>(lookup: &F, key: &str, default: Duration) -> Duration
where
    F: Fn(&str) -> Option<String>,
{
    lookup(key)
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map_or(default, Duration::from_secs)
}

fn parse_env_duration_millis<F>(lookup: &F, key: &str, default: Duration) -> Duration
where
    F: Fn(&str) -> Option<String>,
{
    lookup(key)
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map_or(default, Duration::from_millis)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use test_case::test_case;

    use super::*;

    fn config_from(pairs: &[(&str, &str)]) -> Result<SyncConfig, ConfigError> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        SyncConfig::from_lookup(|key| vars.get(key).cloned())
    }

    const REQUIRED: [(&str, &str); 2] = [
        ("SUPABASE_URL", "https://abc.supabase.co"),
        ("SUPABASE_ANON_KEY", "anon-123"),
    ];

    #[test]
    fn defaults_applied() {
        let config = config_from(&REQUIRED).unwrap();

        assert_eq!(config.tables, TableSettings::default());
        assert_eq!(config.flow, FlowSettings::default());
        assert_eq!(config.server.health_port, 8083);
        assert_eq!(config.queue.capacity, 1000);
        assert_eq!(config.queue.trim_to, 900);
        assert_eq!(config.reconnect.max_attempts, 5);
        assert_eq!(config.watch, WatchSettings::default());
        assert!(config.flow.flow_control().batch.is_none());
    }

    #[test]
    fn missing_url_rejected() {
        let err = config_from(&[("SUPABASE_ANON_KEY", "k")]).unwrap_err();
        assert!(matches!(err, ConfigError::MissingEnvVar(ref k) if k == "SUPABASE_URL"));
    }

    #[test]
    fn empty_key_rejected() {
        let err = config_from(&[("SUPABASE_URL", "https://x.co"), ("SUPABASE_ANON_KEY", " ")])
            .unwrap_err();
        assert!(matches!(err, ConfigError::EmptyValue(_)));
    }

    #[test]
    fn non_http_url_rejected() {
        let err = config_from(&[("SUPABASE_URL", "abc.supabase.co"), ("SUPABASE_ANON_KEY", "k")])
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }

    #[test]
    fn flow_overrides_parsed() {
        let mut vars = REQUIRED.to_vec();
        vars.extend([
            ("PROGRESS_SYNC_DEBOUNCE_MS", "250"),
            ("PROGRESS_SYNC_BATCH_ENABLED", "true"),
            ("PROGRESS_SYNC_BATCH_SIZE", "4"),
            ("PROGRESS_SYNC_WATCH_USER", "u1"),
        ]);
        let config = config_from(&vars).unwrap();

        let flow = config.flow.flow_control();
        assert_eq!(flow.debounce, Duration::from_millis(250));
        assert_eq!(flow.batch.map(|b| b.size), Some(4));
        assert_eq!(config.watch.user_id.as_deref(), Some("u1"));
        assert_eq!(config.sync_settings().flow, flow);
    }

    #[test]
    fn unparseable_numbers_fall_back_to_defaults() {
        let mut vars = REQUIRED.to_vec();
        vars.push(("PROGRESS_SYNC_HEALTH_PORT", "not-a-port"));
        assert_eq!(config_from(&vars).unwrap().server.health_port, 8083);
    }

    #[test]
    fn trim_above_capacity_rejected() {
        let mut vars = REQUIRED.to_vec();
        vars.extend([
            ("PROGRESS_SYNC_QUEUE_CAPACITY", "10"),
            ("PROGRESS_SYNC_QUEUE_TRIM_TO", "20"),
        ]);
        assert!(matches!(
            config_from(&vars).unwrap_err(),
            ConfigError::InvalidValue { .. }
        ));
    }

    #[test]
    fn credentials_redacted_debug() {
        let config = config_from(&REQUIRED).unwrap();
        let debug = format!("{:?}", config.credentials);
        assert!(!debug.contains("anon-123"));
        assert!(debug.contains("[REDACTED]"));
    }

    #[test]
    fn phoenix_config_uses_realtime_settings() {
        let mut vars = REQUIRED.to_vec();
        vars.push(("PROGRESS_SYNC_JOIN_TIMEOUT_SECS", "3"));
        let phoenix = config_from(&vars).unwrap().phoenix_config();

        assert!(phoenix.endpoint.starts_with("wss://abc.supabase.co/realtime/v1/websocket"));
        assert_eq!(phoenix.join_timeout, Duration::from_secs(3));
    }

    #[test_case("https://abc.supabase.co", "abc.supabase.co:443" ; "https default port")]
    #[test_case("http://localhost:54321", "localhost:54321" ; "explicit port")]
    #[test_case("http://127.0.0.1/", "127.0.0.1:80" ; "http default port")]
    fn probe_address_from_url(url: &str, expected: &str) {
        assert_eq!(probe_address(url), expected);
    }
}
