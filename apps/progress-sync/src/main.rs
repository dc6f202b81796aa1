//! Progress Sync Binary
//!
//! Runs the progress sync client against a Realtime backend and logs the
//! updates it delivers for the configured scopes.
//!
//! # Usage
//!
//! ```bash
//! cargo run --bin progress-sync
//! ```
//!
//! # Environment Variables
//!
//! ## Required
//! - `SUPABASE_URL`: Project URL (`https://<ref>.supabase.co`)
//! - `SUPABASE_ANON_KEY`: Public API key
//!
//! ## Optional
//! - `PROGRESS_SYNC_WATCH_USER`: User to subscribe to
//! - `PROGRESS_SYNC_WATCH_COURSE`: Course to subscribe to
//! - `PROGRESS_SYNC_DEBOUNCE_MS` / `PROGRESS_SYNC_THROTTLE_MS`: Rate limiting (default: 0)
//! - `PROGRESS_SYNC_BATCH_ENABLED`: Batch deliveries (default: false)
//! - `PROGRESS_SYNC_HEALTH_PORT`: Health check HTTP port (default: 8083)
//! - `OTEL_ENABLED`: Enable OpenTelemetry (default: true)
//! - `OTEL_EXPORTER_OTLP_ENDPOINT`: OTLP endpoint (default: <http://localhost:4317>)
//! - `OTEL_SERVICE_NAME`: Service name (default: progress-sync)
//! - `RUST_LOG`: Log level (default: info)

use std::sync::Arc;
use std::time::Duration;

use progress_sync::application::ports::ConnectivityPort;
use progress_sync::infrastructure::health::{HealthServer, HealthServerState};
use progress_sync::infrastructure::telemetry;
use progress_sync::{
    PhoenixChangeStream, ProgressSync, ProgressUpdate, SubscriptionHandle, SyncConfig, SyncError,
    TcpProbeConnectivity, init_metrics,
};
use tokio::signal;
use tokio_util::sync::CancellationToken;

/// Graceful shutdown timeout.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| "failed to install rustls crypto provider")?;

    load_dotenv();

    // Initialize telemetry (OpenTelemetry + tracing)
    let _telemetry_guard = telemetry::init();

    tracing::info!("Starting Progress Sync");

    if let Err(e) = init_metrics() {
        tracing::warn!(error = %e, "Metrics disabled");
    }

    let config = SyncConfig::from_env()?;
    log_config(&config);

    let shutdown_token = CancellationToken::new();

    let change_stream = Arc::new(PhoenixChangeStream::new(config.phoenix_config()));
    let connectivity: Arc<dyn ConnectivityPort> = Arc::new(TcpProbeConnectivity::spawn(
        config.probe_config(),
        shutdown_token.child_token(),
    ));

    let sync = ProgressSync::start(config.sync_settings(), change_stream, Some(connectivity))?;

    let handles = watch_configured_scopes(&sync, &config)?;
    if handles.is_empty() {
        tracing::warn!(
            "No scope configured; set PROGRESS_SYNC_WATCH_USER and/or PROGRESS_SYNC_WATCH_COURSE"
        );
    }

    // Spawn health server
    let health_state = Arc::new(HealthServerState::new(
        env!("CARGO_PKG_VERSION").to_string(),
        Arc::clone(&sync),
    ));
    let health_server = HealthServer::new(
        config.server.health_port,
        health_state,
        shutdown_token.clone(),
    );
    let health_task = tokio::spawn(async move {
        if let Err(e) = health_server.run().await {
            tracing::error!(error = %e, "Health server error");
        }
    });

    tracing::info!(scopes = handles.len(), "Progress sync ready");

    await_shutdown(shutdown_token).await;

    sync.destroy();
    if tokio::time::timeout(SHUTDOWN_TIMEOUT, health_task).await.is_err() {
        tracing::warn!("Health server did not stop in time");
    }

    tracing::info!("Progress sync stopped");
    Ok(())
}

/// Subscribe to the scope named by the watch settings.
fn watch_configured_scopes(
    sync: &ProgressSync,
    config: &SyncConfig,
) -> Result<Vec<SubscriptionHandle>, SyncError> {
    let handle = match (
        config.watch.user_id.as_deref(),
        config.watch.course_id.as_deref(),
    ) {
        (Some(user_id), Some(course_id)) => {
            sync.subscribe_to_user_course_progress(user_id, course_id, log_update)?
        }
        (Some(user_id), None) => sync.subscribe_to_user_progress(user_id, log_update)?,
        (None, Some(course_id)) => sync.subscribe_to_course_progress(course_id, log_update)?,
        (None, None) => return Ok(Vec::new()),
    };

    tracing::info!(key = %handle.key(), "Watching scope");
    Ok(vec![handle])
}

fn log_update(update: &ProgressUpdate) {
    tracing::info!(
        user_id = %update.user_id,
        course_id = %update.course_id,
        completion = ?update.overall_completion,
        milestones = update.milestones_achieved.len(),
        source = update.metadata.source.as_str(),
        batch_id = ?update.metadata.batch_id,
        "Progress update"
    );
}

/// Load .env file from current or ancestor directories.
fn load_dotenv() {
    if dotenvy::dotenv().is_ok() {
        return;
    }

    if let Ok(cwd) = std::env::current_dir() {
        let mut dir = cwd.as_path();
        while let Some(parent) = dir.parent() {
            let env_path = parent.join(".env");
            if env_path.exists() {
                let _ = dotenvy::from_path(&env_path);
                return;
            }
            dir = parent;
        }
    }
}

/// Log the parsed configuration.
fn log_config(config: &SyncConfig) {
    let flow = config.flow.flow_control();
    tracing::info!(
        schema = %config.tables.schema,
        progress_table = %config.tables.progress_table,
        milestones_table = %config.tables.milestones_table,
        health_port = config.server.health_port,
        "Configuration loaded"
    );
    tracing::debug!(
        debounce_ms = flow.debounce.as_millis(),
        throttle_ms = flow.throttle.as_millis(),
        batch = flow.batch.is_some(),
        queue_capacity = config.queue.capacity,
        reconnect_max_attempts = config.reconnect.max_attempts,
        "Delivery settings"
    );
}

/// Wait for shutdown signal (SIGTERM or SIGINT).
async fn await_shutdown(shutdown_token: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Ctrl+C handler failed");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "SIGTERM handler failed");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, initiating shutdown");
        }
    }

    shutdown_token.cancel();

    tracing::info!(
        timeout_secs = SHUTDOWN_TIMEOUT.as_secs(),
        "Graceful shutdown started"
    );
}
