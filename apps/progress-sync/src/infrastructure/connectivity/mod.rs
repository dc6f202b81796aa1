//! Connectivity Adapters
//!
//! [`ConnectivityPort`] implementations:
//! - [`ManualConnectivity`]: flipped by the host (tests, embedding apps)
//! - [`TcpProbeConnectivity`]: periodic TCP reachability probe of the backend

use std::time::Duration;

use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::application::ports::ConnectivityPort;

// =============================================================================
// Manual
// =============================================================================

/// Connectivity driven explicitly by the host.
#[derive(Debug)]
pub struct ManualConnectivity {
    tx: watch::Sender<bool>,
}

impl Default for ManualConnectivity {
    fn default() -> Self {
        Self::new(true)
    }
}

impl ManualConnectivity {
    /// Create with an initial state.
    #[must_use]
    pub fn new(online: bool) -> Self {
        let (tx, _) = watch::channel(online);
        Self { tx }
    }

    /// Report the network as online or offline.
    pub fn set_online(&self, online: bool) {
        self.tx.send_if_modified(|current| {
            let changed = *current != online;
            *current = online;
            changed
        });
    }

    /// Current state.
    #[must_use]
    pub fn is_online(&self) -> bool {
        *self.tx.borrow()
    }
}

impl ConnectivityPort for ManualConnectivity {
    fn watch(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

// =============================================================================
// TCP Probe
// =============================================================================

/// Probe settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeConfig {
    /// `host:port` to connect to.
    pub address: String,
    /// Time between probes.
    pub interval: Duration,
    /// Per-probe connect timeout.
    pub timeout: Duration,
}

impl ProbeConfig {
    /// Probe `address` every 15 seconds with a 5 second timeout.
    #[must_use]
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            interval: Duration::from_secs(15),
            timeout: Duration::from_secs(5),
        }
    }
}

/// Connectivity inferred from whether a TCP connection to the backend succeeds.
///
/// The state starts online and is updated after every probe.
#[derive(Debug)]
pub struct TcpProbeConnectivity {
    rx: watch::Receiver<bool>,
}

impl TcpProbeConnectivity {
    /// Spawn the probe loop on the current runtime. It stops when `cancel` fires.
    #[must_use]
    pub fn spawn(config: ProbeConfig, cancel: CancellationToken) -> Self {
        let (tx, rx) = watch::channel(true);
        tokio::spawn(probe_loop(config, tx, cancel));
        Self { rx }
    }
}

impl ConnectivityPort for TcpProbeConnectivity {
    fn watch(&self) -> watch::Receiver<bool> {
        self.rx.clone()
    }
}

async fn probe_once(config: &ProbeConfig) -> bool {
    match tokio::time::timeout(config.timeout, TcpStream::connect(&config.address)).await {
        Ok(Ok(_)) => true,
        Ok(Err(e)) => {
            tracing::debug!(address = %config.address, error = %e, "Connectivity probe failed");
            false
        }
        Err(_) => {
            tracing::debug!(address = %config.address, "Connectivity probe timed out");
            false
        }
    }
}

async fn probe_loop(config: ProbeConfig, tx: watch::Sender<bool>, cancel: CancellationToken) {
    let mut interval = tokio::time::interval(config.interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            _ = interval.tick() => {}
        }

        let online = tokio::select! {
            () = cancel.cancelled() => break,
            online = probe_once(&config) => online,
        };

        let changed = tx.send_if_modified(|current| {
            let changed = *current != online;
            *current = online;
            changed
        });
        if changed {
            tracing::info!(address = %config.address, online, "Connectivity changed");
        }
    }
    tracing::debug!("Connectivity probe stopped");
}

#[cfg(test)]
mod tests {
    use tokio::net::TcpListener;

    use super::*;

    #[tokio::test]
    async fn manual_connectivity_notifies_on_change() {
        let connectivity = ManualConnectivity::new(true);
        let mut rx = connectivity.watch();
        assert!(*rx.borrow_and_update());

        connectivity.set_online(false);
        rx.changed().await.unwrap();
        assert!(!*rx.borrow_and_update());
        assert!(!connectivity.is_online());
    }

    #[tokio::test]
    async fn manual_connectivity_ignores_repeats() {
        let connectivity = ManualConnectivity::new(true);
        let rx = connectivity.watch();

        connectivity.set_online(true);
        assert!(!rx.has_changed().unwrap());
    }

    #[tokio::test]
    async fn probe_reports_reachable_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        assert!(probe_once(&ProbeConfig::new(address)).await);
    }

    #[tokio::test]
    async fn probe_loop_goes_offline_when_unreachable() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        drop(listener);

        let cancel = CancellationToken::new();
        let mut config = ProbeConfig::new(address);
        config.interval = Duration::from_millis(20);
        config.timeout = Duration::from_millis(500);

        let probe = TcpProbeConnectivity::spawn(config, cancel.clone());
        let mut rx = probe.watch();
        tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|online| !*online))
            .await
            .unwrap()
            .unwrap();

        cancel.cancel();
    }
}
