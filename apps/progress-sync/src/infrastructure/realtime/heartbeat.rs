//! Heartbeat Manager
//!
//! Keeps a Realtime socket alive with periodic `heartbeat` frames on the
//! `phoenix` topic and reports a timeout when a heartbeat goes unanswered.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Configuration for heartbeat behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatConfig {
    /// Interval between heartbeat frames.
    pub interval: Duration,
    /// How long a heartbeat may go unanswered.
    pub reply_timeout: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            reply_timeout: Duration::from_secs(30),
        }
    }
}

impl HeartbeatConfig {
    /// Create a new configuration with custom values.
    #[must_use]
    pub const fn new(interval: Duration, reply_timeout: Duration) -> Self {
        Self {
            interval,
            reply_timeout,
        }
    }
}

/// Events emitted by the heartbeat manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatEvent {
    /// Send a heartbeat frame now.
    Send,
    /// The previous heartbeat was not answered in time.
    Timeout,
}

/// State shared between the heartbeat manager and the socket reader.
#[derive(Debug)]
pub struct HeartbeatState {
    last_reply: RwLock<Instant>,
    awaiting_reply: AtomicBool,
}

impl Default for HeartbeatState {
    fn default() -> Self {
        Self::new()
    }
}

impl HeartbeatState {
    /// Create new heartbeat state.
    #[must_use]
    pub fn new() -> Self {
        Self {
            last_reply: RwLock::new(Instant::now()),
            awaiting_reply: AtomicBool::new(false),
        }
    }

    /// Record a heartbeat reply.
    pub fn record_reply(&self) {
        *self.last_reply.write() = Instant::now();
        self.awaiting_reply.store(false, Ordering::SeqCst);
    }

    /// Mark a heartbeat as sent.
    pub fn mark_sent(&self) {
        self.awaiting_reply.store(true, Ordering::SeqCst);
    }

    /// Whether a heartbeat is outstanding.
    #[must_use]
    pub fn is_awaiting_reply(&self) -> bool {
        self.awaiting_reply.load(Ordering::SeqCst)
    }

    /// Time since the last reply.
    #[must_use]
    pub fn time_since_reply(&self) -> Duration {
        self.last_reply.read().elapsed()
    }
}

/// Heartbeat manager for one socket.
///
/// # Example
///
/// ```rust,no_run
/// use progress_sync::infrastructure::realtime::heartbeat::{
///     HeartbeatConfig, HeartbeatEvent, HeartbeatManager, HeartbeatState,
/// };
/// use std::sync::Arc;
/// use tokio::sync::mpsc;
/// use tokio_util::sync::CancellationToken;
///
/// async fn example() {
///     let state = Arc::new(HeartbeatState::new());
///     let (event_tx, mut event_rx) = mpsc::channel(4);
///     let cancel = CancellationToken::new();
///
///     let manager = HeartbeatManager::new(HeartbeatConfig::default(), state.clone(), event_tx, cancel);
///     tokio::spawn(manager.run());
///
///     while let Some(event) = event_rx.recv().await {
///         match event {
///             HeartbeatEvent::Send => state.mark_sent(),
///             HeartbeatEvent::Timeout => break,
///         }
///     }
/// }
/// ```
pub struct HeartbeatManager {
    config: HeartbeatConfig,
    state: Arc<HeartbeatState>,
    event_tx: mpsc::Sender<HeartbeatEvent>,
    cancel: CancellationToken,
}

impl HeartbeatManager {
    /// Create a new heartbeat manager.
    #[must_use]
    pub const fn new(
        config: HeartbeatConfig,
        state: Arc<HeartbeatState>,
        event_tx: mpsc::Sender<HeartbeatEvent>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            config,
            state,
            event_tx,
            cancel,
        }
    }

    /// Run until cancelled, the receiver goes away, or a timeout is reported.
    pub async fn run(self) {
        let start = Instant::now() + self.config.interval;
        let mut interval = tokio::time::interval_at(start, self.config.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                () = self.cancel.cancelled() => {
                    tracing::debug!("Heartbeat manager cancelled");
                    break;
                }
                _ = interval.tick() => {
                    if !self.check_and_send().await {
                        break;
                    }
                }
            }
        }
    }

    /// Returns `false` when the loop should exit.
    async fn check_and_send(&self) -> bool {
        if self.state.is_awaiting_reply() {
            let elapsed = self.state.time_since_reply();
            if elapsed >= self.config.reply_timeout {
                tracing::warn!(
                    elapsed_secs = elapsed.as_secs(),
                    timeout_secs = self.config.reply_timeout.as_secs(),
                    "Heartbeat timeout detected"
                );
                let _ = self.event_tx.send(HeartbeatEvent::Timeout).await;
                return false;
            }
        }

        if self.event_tx.send(HeartbeatEvent::Send).await.is_err() {
            tracing::debug!("Event channel closed, stopping heartbeat");
            return false;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_values() {
        let config = HeartbeatConfig::default();
        assert_eq!(config.interval, Duration::from_secs(30));
        assert_eq!(config.reply_timeout, Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn state_tracks_replies() {
        let state = HeartbeatState::new();
        assert!(!state.is_awaiting_reply());

        state.mark_sent();
        assert!(state.is_awaiting_reply());

        tokio::time::advance(Duration::from_secs(3)).await;
        assert!(state.time_since_reply() >= Duration::from_secs(3));

        state.record_reply();
        assert!(!state.is_awaiting_reply());
        assert_eq!(state.time_since_reply(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn manager_sends_after_first_interval() {
        let state = Arc::new(HeartbeatState::new());
        let (event_tx, mut event_rx) = mpsc::channel(4);
        let cancel = CancellationToken::new();
        let started = Instant::now();

        let manager = HeartbeatManager::new(HeartbeatConfig::default(), state, event_tx, cancel.clone());
        let handle = tokio::spawn(manager.run());

        assert_eq!(event_rx.recv().await, Some(HeartbeatEvent::Send));
        assert!(started.elapsed() >= Duration::from_secs(30));

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn manager_detects_unanswered_heartbeat() {
        let state = Arc::new(HeartbeatState::new());
        let (event_tx, mut event_rx) = mpsc::channel(4);
        let cancel = CancellationToken::new();

        let manager = HeartbeatManager::new(
            HeartbeatConfig::new(Duration::from_secs(5), Duration::from_secs(5)),
            Arc::clone(&state),
            event_tx,
            cancel,
        );
        let handle = tokio::spawn(manager.run());

        assert_eq!(event_rx.recv().await, Some(HeartbeatEvent::Send));
        state.mark_sent();

        assert_eq!(event_rx.recv().await, Some(HeartbeatEvent::Timeout));
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn answered_heartbeats_keep_running() {
        let state = Arc::new(HeartbeatState::new());
        let (event_tx, mut event_rx) = mpsc::channel(4);
        let cancel = CancellationToken::new();

        let manager = HeartbeatManager::new(
            HeartbeatConfig::new(Duration::from_secs(5), Duration::from_secs(5)),
            Arc::clone(&state),
            event_tx,
            cancel.clone(),
        );
        let handle = tokio::spawn(manager.run());

        for _ in 0..3 {
            assert_eq!(event_rx.recv().await, Some(HeartbeatEvent::Send));
            state.mark_sent();
            state.record_reply();
        }

        cancel.cancel();
        handle.await.unwrap();
    }
}
