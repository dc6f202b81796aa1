//! Progress Sync Client
//!
//! The client ties the other services together:
//!
//! ```text
//! ChangeStreamPort ──▶ channel task ──▶ UpdateTransformer ──▶ FlowController
//!        ▲              (per key)                                  │
//!        │                                                         ▼
//!  ReconnectPolicy                                   online? ──▶ callbacks
//!                                                       │
//!                                                       └──▶ OfflineQueue ──▶ drain task
//! ```
//!
//! # Tasks
//!
//! Each subscription key owns two tasks: a channel task (connection manager)
//! that opens the upstream channel and reconnects with backoff, and a flow
//! driver that sleeps until the key's next flow-control deadline. One sweep
//! task flushes idle batches, one drain task replays the offline queue, and
//! an optional connectivity task follows the host's online state. All tasks
//! stop when the client is destroyed.
//!
//! # Locking
//!
//! Every delivery for a key runs while holding that key's delivery gate, and
//! the gate is always taken before the state lock. Unsubscribe removes the
//! key from the state first, then takes the gate to flush and close it, so
//! once it returns no callback for the key can run. Callbacks never run
//! under the state lock and may call back into the client.

use std::cell::Cell;
use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::Utc;
use parking_lot::{Mutex, ReentrantMutex, RwLock};
use tokio::runtime::Handle;
use tokio::sync::Notify;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::diagnostics::{DiagnosticsSnapshot, HealthReport, SyncStats, evaluate_health};
use super::flow_control::{FlowControlConfig, FlowController, FlowOutput};
use super::offline_queue::{OfflineQueue, OfflineQueueConfig, QueuePriority};
use super::reconnect::{ReconnectConfig, ReconnectPolicy};
use super::transform::UpdateTransformer;
use crate::application::ports::{
    ChangeKind, ChangeStreamPort, ChannelEvent, ChannelRequest, ChannelStatus,
    ChannelSubscription, ConnectivityPort, RawChange, TableBinding,
};
use crate::domain::connection::{ConnectionQuality, ConnectionState, ConnectionStatus};
use crate::domain::progress::ProgressUpdate;
use crate::domain::subscription::{
    CallbackId, RegistryChange, SubscriptionFilter, SubscriptionKey, SubscriptionRegistry,
};
use crate::infrastructure::metrics::{self, DropReason};

// =============================================================================
// Public Types
// =============================================================================

/// Observer invoked once per delivered update.
pub type ProgressCallback = Arc<dyn Fn(&ProgressUpdate) + Send + Sync>;

/// Client configuration.
#[derive(Debug, Clone)]
pub struct SyncSettings {
    /// Database schema the tables live in.
    pub schema: String,
    /// Progress table name.
    pub progress_table: String,
    /// Milestones table name.
    pub milestones_table: String,
    /// Default flow-control policy for new subscriptions.
    pub flow: FlowControlConfig,
    /// Interval of the batch sweep.
    pub sweep_interval: Duration,
    /// Offline queue limits.
    pub queue: OfflineQueueConfig,
    /// Channel reconnection policy.
    pub reconnect: ReconnectConfig,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            schema: "public".to_string(),
            progress_table: "user_progress".to_string(),
            milestones_table: "user_milestones".to_string(),
            flow: FlowControlConfig::default(),
            sweep_interval: Duration::from_secs(5),
            queue: OfflineQueueConfig::default(),
            reconnect: ReconnectConfig::default(),
        }
    }
}

/// Identifies one registered callback.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle {
    key: SubscriptionKey,
    id: CallbackId,
}

impl SubscriptionHandle {
    /// Subscription key the callback is registered under.
    #[must_use]
    pub const fn key(&self) -> &SubscriptionKey {
        &self.key
    }

    /// Callback identifier within the key.
    #[must_use]
    pub const fn id(&self) -> CallbackId {
        self.id
    }
}

/// Misuse errors surfaced by the public API.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SyncError {
    /// The filter scopes neither a user nor a course.
    #[error("subscription filter must name a user or a course")]
    EmptyFilter,
    /// The subscription key is empty.
    #[error("subscription key must not be empty")]
    EmptyKey,
    /// The client has been destroyed.
    #[error("sync client has been destroyed")]
    Destroyed,
    /// No Tokio runtime to run background tasks on.
    #[error("no tokio runtime available")]
    NoRuntime,
}

/// Outcome of one offline queue drain cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    /// Items handed to callbacks.
    pub delivered: usize,
    /// Items whose subscription no longer exists.
    pub discarded: usize,
    /// Failed items put back at the front.
    pub requeued: usize,
    /// Failed items dropped after too many retries.
    pub dropped: usize,
}

// =============================================================================
// Internal State
// =============================================================================

/// Serializes deliveries for one key; `false` once unsubscribed.
#[derive(Debug)]
struct DeliveryGate(ReentrantMutex<Cell<bool>>);

impl DeliveryGate {
    fn open() -> Self {
        Self(ReentrantMutex::new(Cell::new(true)))
    }
}

#[derive(Debug, Clone, Copy)]
struct ChannelInfo {
    status: ConnectionStatus,
    exhausted: bool,
}

struct KeyRuntime {
    flow: FlowController,
    gate: Arc<DeliveryGate>,
    wake: Arc<Notify>,
    cancel: CancellationToken,
    channel: ChannelInfo,
}

struct SyncState {
    registry: SubscriptionRegistry<ProgressCallback>,
    runtimes: HashMap<SubscriptionKey, KeyRuntime>,
    destroyed: bool,
}

// =============================================================================
// Progress Sync Client
// =============================================================================

/// Real-time progress synchronization client.
///
/// Create with [`ProgressSync::start`] inside a Tokio runtime and call
/// [`ProgressSync::destroy`] when done; background tasks hold a reference to
/// the client until then.
pub struct ProgressSync {
    settings: SyncSettings,
    transformer: UpdateTransformer,
    port: Arc<dyn ChangeStreamPort>,
    runtime: Handle,
    this: Weak<Self>,
    state: Mutex<SyncState>,
    queue: Mutex<OfflineQueue>,
    connection: RwLock<ConnectionState>,
    online: AtomicBool,
    drain_wake: Notify,
    root: CancellationToken,
}

impl std::fmt::Debug for ProgressSync {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressSync")
            .field("settings", &self.settings)
            .field("online", &self.is_online())
            .finish_non_exhaustive()
    }
}

impl ProgressSync {
    /// Start a client on the current Tokio runtime.
    ///
    /// Without a connectivity port the client assumes it is always online.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::NoRuntime`] when called outside a Tokio runtime.
    pub fn start(
        settings: SyncSettings,
        port: Arc<dyn ChangeStreamPort>,
        connectivity: Option<Arc<dyn ConnectivityPort>>,
    ) -> Result<Arc<Self>, SyncError> {
        let runtime = Handle::try_current().map_err(|_| SyncError::NoRuntime)?;
        let transformer =
            UpdateTransformer::new(&settings.progress_table, &settings.milestones_table);
        let queue = OfflineQueue::new(settings.queue);

        let connectivity_rx = connectivity.map(|port| port.watch());
        let online = connectivity_rx.as_ref().is_none_or(|rx| *rx.borrow());

        let sync = Arc::new_cyclic(|this| Self {
            settings,
            transformer,
            port,
            runtime,
            this: this.clone(),
            state: Mutex::new(SyncState {
                registry: SubscriptionRegistry::new(),
                runtimes: HashMap::new(),
                destroyed: false,
            }),
            queue: Mutex::new(queue),
            connection: RwLock::new(ConnectionState::default()),
            online: AtomicBool::new(online),
            drain_wake: Notify::new(),
            root: CancellationToken::new(),
        });

        sync.runtime.spawn(Arc::clone(&sync).run_sweep());
        sync.runtime.spawn(Arc::clone(&sync).run_drain());
        if let Some(rx) = connectivity_rx {
            sync.runtime.spawn(Arc::clone(&sync).run_connectivity(rx));
        }

        tracing::info!(
            schema = %sync.settings.schema,
            progress_table = %sync.settings.progress_table,
            milestones_table = %sync.settings.milestones_table,
            online,
            "Progress sync started"
        );
        Ok(sync)
    }

    /// Client configuration.
    #[must_use]
    pub const fn settings(&self) -> &SyncSettings {
        &self.settings
    }

    // =========================================================================
    // Subscriptions
    // =========================================================================

    /// Observe all progress of one user.
    ///
    /// # Errors
    ///
    /// See [`subscribe_with_flow`](Self::subscribe_with_flow).
    pub fn subscribe_to_user_progress<F>(
        &self,
        user_id: &str,
        callback: F,
    ) -> Result<SubscriptionHandle, SyncError>
    where
        F: Fn(&ProgressUpdate) + Send + Sync + 'static,
    {
        self.subscribe_to_progress_updates(
            SubscriptionKey::for_user(user_id),
            SubscriptionFilter::user(user_id),
            callback,
        )
    }

    /// Observe all progress in one course.
    ///
    /// # Errors
    ///
    /// See [`subscribe_with_flow`](Self::subscribe_with_flow).
    pub fn subscribe_to_course_progress<F>(
        &self,
        course_id: &str,
        callback: F,
    ) -> Result<SubscriptionHandle, SyncError>
    where
        F: Fn(&ProgressUpdate) + Send + Sync + 'static,
    {
        self.subscribe_to_progress_updates(
            SubscriptionKey::for_course(course_id),
            SubscriptionFilter::course(course_id),
            callback,
        )
    }

    /// Observe one user's progress in one course.
    ///
    /// # Errors
    ///
    /// See [`subscribe_with_flow`](Self::subscribe_with_flow).
    pub fn subscribe_to_user_course_progress<F>(
        &self,
        user_id: &str,
        course_id: &str,
        callback: F,
    ) -> Result<SubscriptionHandle, SyncError>
    where
        F: Fn(&ProgressUpdate) + Send + Sync + 'static,
    {
        self.subscribe_to_progress_updates(
            SubscriptionKey::for_user_course(user_id, course_id),
            SubscriptionFilter::user_course(user_id, course_id),
            callback,
        )
    }

    /// Observe a custom key with the default flow-control policy.
    ///
    /// # Errors
    ///
    /// See [`subscribe_with_flow`](Self::subscribe_with_flow).
    pub fn subscribe_to_progress_updates<F>(
        &self,
        key: SubscriptionKey,
        filter: SubscriptionFilter,
        callback: F,
    ) -> Result<SubscriptionHandle, SyncError>
    where
        F: Fn(&ProgressUpdate) + Send + Sync + 'static,
    {
        self.subscribe_with_flow(key, filter, self.settings.flow, callback)
    }

    /// Register a callback for a key.
    ///
    /// The first callback for a key opens its channel with `filter` and
    /// `flow`; later callbacks share the channel and keep the key's original
    /// filter and policy. Subscribing to a key whose channel gave up
    /// reconnecting restarts the channel.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::EmptyKey`], [`SyncError::EmptyFilter`], or
    /// [`SyncError::Destroyed`].
    pub fn subscribe_with_flow<F>(
        &self,
        key: SubscriptionKey,
        filter: SubscriptionFilter,
        flow: FlowControlConfig,
        callback: F,
    ) -> Result<SubscriptionHandle, SyncError>
    where
        F: Fn(&ProgressUpdate) + Send + Sync + 'static,
    {
        if key.is_empty() {
            return Err(SyncError::EmptyKey);
        }
        if !filter.is_scoped() {
            return Err(SyncError::EmptyFilter);
        }

        let mut state = self.state.lock();
        if state.destroyed {
            return Err(SyncError::Destroyed);
        }

        let callback: ProgressCallback = Arc::new(callback);
        let (id, change) = state.registry.add(key.clone(), filter.clone(), callback);

        match change {
            RegistryChange::ChannelRequired => {
                let runtime = KeyRuntime {
                    flow: FlowController::new(flow),
                    gate: Arc::new(DeliveryGate::open()),
                    wake: Arc::new(Notify::new()),
                    cancel: self.root.child_token(),
                    channel: ChannelInfo {
                        status: ConnectionStatus::Disconnected,
                        exhausted: false,
                    },
                };
                let cancel = runtime.cancel.clone();
                let wake = Arc::clone(&runtime.wake);
                state.runtimes.insert(key.clone(), runtime);

                if let Some(this) = self.this.upgrade() {
                    self.runtime.spawn(Arc::clone(&this).drive_flow(
                        key.clone(),
                        wake,
                        cancel.clone(),
                    ));
                    self.runtime
                        .spawn(this.run_channel(key.clone(), self.channel_request(&key, &filter), cancel));
                }
                tracing::info!(key = %key, filter = %filter.to_expression(), "Channel created");
            }
            RegistryChange::Attached => {
                let restart = state.runtimes.get_mut(&key).and_then(|rt| {
                    if rt.channel.exhausted {
                        rt.channel.exhausted = false;
                        Some(rt.cancel.clone())
                    } else {
                        None
                    }
                });
                let key_filter = state.registry.filter(&key).cloned().unwrap_or(filter);
                if let (Some(cancel), Some(this)) = (restart, self.this.upgrade()) {
                    tracing::info!(key = %key, "Restarting exhausted channel");
                    self.runtime
                        .spawn(this.run_channel(key.clone(), self.channel_request(&key, &key_filter), cancel));
                }
                tracing::debug!(key = %key, callback_id = id, "Callback attached");
            }
            _ => {}
        }

        metrics::set_active_channels(state.runtimes.len());
        Ok(SubscriptionHandle { key, id })
    }

    /// Remove every callback for a key and tear down its channel.
    ///
    /// Any buffered batch is flushed to the removed callbacks first. Returns
    /// `false` when the key was not registered.
    pub fn unsubscribe(&self, key: &SubscriptionKey) -> bool {
        let removed = {
            let mut state = self.state.lock();
            let callbacks = state.registry.callbacks(key);
            if state.registry.remove_key(key) == RegistryChange::Unchanged {
                return false;
            }
            let runtime = state.runtimes.remove(key);
            metrics::set_active_channels(state.runtimes.len());
            runtime.map(|rt| (callbacks, rt))
        };

        if let Some((callbacks, runtime)) = removed {
            self.teardown(key, &callbacks, runtime);
        }
        true
    }

    /// Remove a single callback. The channel is torn down with the last one.
    pub fn unsubscribe_handle(&self, handle: &SubscriptionHandle) -> bool {
        let removed = {
            let mut state = self.state.lock();
            let callbacks = state.registry.callbacks(&handle.key);
            match state.registry.remove_callback(&handle.key, handle.id) {
                RegistryChange::Unchanged => return false,
                RegistryChange::ChannelReleased => {
                    let runtime = state.runtimes.remove(&handle.key);
                    metrics::set_active_channels(state.runtimes.len());
                    runtime.map(|rt| (callbacks, rt))
                }
                _ => None,
            }
        };

        if let Some((callbacks, runtime)) = removed {
            self.teardown(&handle.key, &callbacks, runtime);
        } else {
            tracing::debug!(key = %handle.key, callback_id = handle.id, "Callback detached");
        }
        true
    }

    /// Unsubscribe every key.
    pub fn unsubscribe_all(&self) {
        let keys = self.state.lock().registry.keys();
        for key in keys {
            self.unsubscribe(&key);
        }
    }

    /// Stop all tasks, drop all subscriptions and clear the offline queue.
    ///
    /// Later subscribe calls fail with [`SyncError::Destroyed`].
    pub fn destroy(&self) {
        {
            let mut state = self.state.lock();
            if state.destroyed {
                return;
            }
            state.destroyed = true;
        }

        self.unsubscribe_all();
        self.root.cancel();
        self.queue.lock().clear();
        metrics::set_offline_queue_depth(0);

        let mut connection = self.connection.write();
        connection.status = ConnectionStatus::Disconnected;
        drop(connection);

        tracing::info!("Progress sync destroyed");
    }

    /// Whether [`destroy`](Self::destroy) has been called.
    #[must_use]
    pub fn is_destroyed(&self) -> bool {
        self.state.lock().destroyed
    }

    // =========================================================================
    // Diagnostics
    // =========================================================================

    /// Snapshot of the process-wide connection state.
    #[must_use]
    pub fn connection_state(&self) -> ConnectionState {
        self.connection.read().clone()
    }

    /// Last reported connectivity.
    #[must_use]
    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::Acquire)
    }

    /// Items waiting in the offline queue.
    #[must_use]
    pub fn offline_queue_depth(&self) -> usize {
        self.queue.lock().len()
    }

    /// Whether any channel is connected, or none exist.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        let state = self.state.lock();
        state.runtimes.is_empty()
            || state
                .runtimes
                .values()
                .any(|rt| rt.channel.status == ConnectionStatus::Connected)
    }

    /// Client statistics.
    #[must_use]
    pub fn stats(&self) -> SyncStats {
        self.snapshot().stats
    }

    /// Composite health verdict.
    #[must_use]
    pub fn health_check(&self) -> HealthReport {
        evaluate_health(self.snapshot())
    }

    fn snapshot(&self) -> DiagnosticsSnapshot {
        let connection = self.connection_state();
        let offline_queue_depth = self.offline_queue_depth();

        let state = self.state.lock();
        let mut exhausted_keys: Vec<String> = state
            .runtimes
            .iter()
            .filter(|(_, rt)| rt.channel.exhausted)
            .map(|(key, _)| key.to_string())
            .collect();
        exhausted_keys.sort();

        let stats = SyncStats {
            active_subscriptions: state.registry.key_count(),
            total_callbacks: state.registry.callback_count(),
            pending_batches: state
                .runtimes
                .values()
                .filter(|rt| rt.flow.pending_batch_len() > 0)
                .count(),
            offline_queue_depth,
            connection_quality: connection.quality,
            online: self.is_online(),
            exhausted_channels: exhausted_keys.len(),
        };

        DiagnosticsSnapshot {
            connection,
            stats,
            exhausted_keys,
        }
    }

    // =========================================================================
    // Offline Queue
    // =========================================================================

    /// Replay up to one batch of queued updates.
    ///
    /// Stops at the first item that cannot be delivered so later items never
    /// overtake it.
    pub fn drain_offline_queue(&self) -> DrainReport {
        let started = std::time::Instant::now();
        let mut report = DrainReport::default();
        let mut items = self.queue.lock().take_batch().into_iter();

        while let Some(item) = items.next() {
            let Some(gate) = self.gate_for(&item.key) else {
                self.queue.lock().settle(&item.key);
                report.discarded += 1;
                continue;
            };
            let guard = gate.0.lock();
            if !guard.get() {
                self.queue.lock().settle(&item.key);
                report.discarded += 1;
                continue;
            }

            if !self.is_online() {
                let remainder: Vec<_> = items.by_ref().collect();
                let key = item.key.clone();
                let retries = item.retries + 1;
                if self.queue.lock().requeue_failed(item, remainder) {
                    report.requeued += 1;
                } else {
                    report.dropped += 1;
                    metrics::record_updates_dropped(DropReason::RetriesExhausted, 1);
                    tracing::warn!(key = %key, retries, "Dropping queued update after repeated replay failures");
                }
                break;
            }

            let callbacks = self.state.lock().registry.callbacks(&item.key);
            if callbacks.is_empty() {
                self.queue.lock().settle(&item.key);
                report.discarded += 1;
                continue;
            }
            invoke_callbacks(&item.key, &callbacks, std::slice::from_ref(&item.update));
            self.queue.lock().settle(&item.key);
            report.delivered += 1;
        }

        let depth = self.offline_queue_depth();
        metrics::set_offline_queue_depth(depth);
        metrics::record_drain_duration(started.elapsed());
        if report != DrainReport::default() {
            tracing::info!(
                delivered = report.delivered,
                discarded = report.discarded,
                requeued = report.requeued,
                dropped = report.dropped,
                remaining = depth,
                "Offline queue drained"
            );
        }
        if depth > 0 && self.is_online() {
            self.drain_wake.notify_one();
        }
        report
    }

    // =========================================================================
    // Delivery
    // =========================================================================

    fn gate_for(&self, key: &SubscriptionKey) -> Option<Arc<DeliveryGate>> {
        self.state
            .lock()
            .runtimes
            .get(key)
            .map(|rt| Arc::clone(&rt.gate))
    }

    /// Run a flow-control step for a key and dispatch whatever it releases.
    ///
    /// Returns `false` when the key is no longer active.
    fn advance_flow<F>(&self, key: &SubscriptionKey, step: F) -> bool
    where
        F: FnOnce(&mut FlowController, Instant) -> FlowOutput,
    {
        let Some(gate) = self.gate_for(key) else {
            return false;
        };
        let guard = gate.0.lock();
        if !guard.get() {
            return false;
        }

        let output = {
            let mut state = self.state.lock();
            let Some(runtime) = state.runtimes.get_mut(key) else {
                return false;
            };
            let before = runtime.flow.next_deadline();
            let output = step(&mut runtime.flow, Instant::now());
            if runtime.flow.next_deadline() != before {
                runtime.wake.notify_one();
            }
            output
        };

        if output.dropped > 0 {
            metrics::record_updates_dropped(DropReason::Throttled, output.dropped as u64);
            tracing::trace!(key = %key, dropped = output.dropped, "Throttled updates dropped");
        }
        self.dispatch(key, output.deliver);
        true
    }

    /// Deliver now when online, otherwise queue for replay.
    ///
    /// A key with a replay backlog queues behind it even while online.
    /// Callers hold the key's gate.
    fn dispatch(&self, key: &SubscriptionKey, updates: Vec<ProgressUpdate>) {
        if updates.is_empty() {
            return;
        }

        let mut queue = self.queue.lock();
        if !self.is_online() || queue.has_backlog(key) {
            let mut evicted = 0;
            for update in updates {
                let priority = QueuePriority::for_update(&update);
                evicted += queue.enqueue(key.clone(), update, priority);
            }
            let depth = queue.len();
            drop(queue);

            metrics::set_offline_queue_depth(depth);
            if evicted > 0 {
                metrics::record_offline_evictions(evicted as u64);
                tracing::debug!(evicted, depth, "Offline queue overflow, evicted oldest low-priority items");
            }
            if self.is_online() {
                self.drain_wake.notify_one();
            }
            return;
        }
        drop(queue);

        let callbacks = self.state.lock().registry.callbacks(key);
        invoke_callbacks(key, &callbacks, &updates);
    }

    fn handle_raw_change(&self, key: &SubscriptionKey, raw: &RawChange) {
        metrics::record_change_received(&raw.table);

        let transformed = match self.transformer.transform(raw) {
            Ok(transformed) => transformed,
            Err(e) => {
                metrics::record_updates_dropped(DropReason::Malformed, 1);
                tracing::warn!(key = %key, table = %raw.table, error = %e, "Dropping unattributable row");
                return;
            }
        };
        if !transformed.defaulted.is_empty() {
            for field in &transformed.defaulted {
                metrics::record_field_defaulted(field);
            }
            tracing::debug!(key = %key, defaulted = ?transformed.defaulted, "Row fields defaulted");
        }

        let update = transformed.update;
        let in_scope = self
            .state
            .lock()
            .registry
            .filter(key)
            .is_some_and(|filter| filter.matches(&update.user_id, &update.course_id));
        if !in_scope {
            metrics::record_updates_dropped(DropReason::OutOfScope, 1);
            return;
        }

        if !self.advance_flow(key, |flow, now| flow.admit(update, now)) {
            metrics::record_updates_dropped(DropReason::Inactive, 1);
        }
    }

    /// Flush and close a removed key. The key is already gone from the state.
    fn teardown(&self, key: &SubscriptionKey, callbacks: &[ProgressCallback], mut runtime: KeyRuntime) {
        let gate = Arc::clone(&runtime.gate);
        let guard = gate.0.lock();

        let flushed = runtime.flow.flush();
        if !flushed.is_empty() {
            invoke_callbacks(key, callbacks, &flushed);
        }
        guard.set(false);
        drop(guard);

        runtime.cancel.cancel();
        if self.state.lock().runtimes.is_empty() {
            self.connection.write().status = ConnectionStatus::Disconnected;
        }
        tracing::info!(key = %key, flushed = flushed.len(), "Channel torn down");
    }

    // =========================================================================
    // Connection State
    // =========================================================================

    fn set_channel_status(&self, key: &SubscriptionKey, status: ConnectionStatus, exhausted: bool) {
        if let Some(runtime) = self.state.lock().runtimes.get_mut(key) {
            runtime.channel = ChannelInfo { status, exhausted };
        }
    }

    fn on_channel_connecting(&self, key: &SubscriptionKey) {
        self.set_channel_status(key, ConnectionStatus::Connecting, false);
        let mut connection = self.connection.write();
        connection.status = ConnectionStatus::Connecting;
        connection.quality = quality_since(&connection);
        drop(connection);
        tracing::debug!(key = %key, "Channel connecting");
    }

    fn on_channel_connected(&self, key: &SubscriptionKey) {
        self.set_channel_status(key, ConnectionStatus::Connected, false);
        let mut connection = self.connection.write();
        connection.status = ConnectionStatus::Connected;
        connection.last_connected = Some(Utc::now());
        connection.reconnect_attempts = 0;
        connection.last_error = None;
        connection.quality = ConnectionQuality::Excellent;
        drop(connection);

        tracing::info!(key = %key, "Channel connected");
        self.drain_wake.notify_one();
    }

    fn on_channel_error(&self, key: &SubscriptionKey, reason: &str, attempts: u32, exhausted: bool) {
        self.set_channel_status(key, ConnectionStatus::Error, exhausted);
        let mut connection = self.connection.write();
        connection.status = ConnectionStatus::Error;
        connection.reconnect_attempts = attempts;
        connection.last_error = Some(reason.to_string());
        connection.quality = quality_since(&connection);
    }

    fn channel_request(&self, key: &SubscriptionKey, filter: &SubscriptionFilter) -> ChannelRequest {
        ChannelRequest {
            topic: format!("progress:{key}"),
            schema: self.settings.schema.clone(),
            bindings: vec![
                TableBinding::new(&self.settings.progress_table, ChangeKind::Insert),
                TableBinding::new(&self.settings.progress_table, ChangeKind::Update),
                TableBinding::new(&self.settings.milestones_table, ChangeKind::Insert),
            ],
            filter: filter.clone(),
        }
    }

    // =========================================================================
    // Background Tasks
    // =========================================================================

    /// Connection manager for one key.
    async fn run_channel(
        self: Arc<Self>,
        key: SubscriptionKey,
        request: ChannelRequest,
        cancel: CancellationToken,
    ) {
        let mut policy = ReconnectPolicy::new(self.settings.reconnect);

        loop {
            self.on_channel_connecting(&key);

            let opened = tokio::select! {
                biased;
                () = cancel.cancelled() => return,
                result = self.port.subscribe(request.clone()) => result,
            };

            let reason = match opened {
                Ok(subscription) => {
                    match self.pump_channel(&key, subscription, &cancel, &mut policy).await {
                        Some(reason) => reason,
                        None => return,
                    }
                }
                Err(e) => e.to_string(),
            };

            match policy.record_failure() {
                Ok(delay) => {
                    self.on_channel_error(&key, &reason, policy.attempts(), false);
                    metrics::record_reconnect();
                    tracing::warn!(
                        key = %key,
                        attempt = policy.attempts(),
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        error = %reason,
                        "Channel failed, reconnecting"
                    );

                    tokio::select! {
                        biased;
                        () = cancel.cancelled() => return,
                        () = tokio::time::sleep(delay) => {}
                    }
                }
                Err(e) => {
                    self.on_channel_error(&key, &reason, policy.attempts(), true);
                    tracing::error!(key = %key, error = %reason, "Channel gave up: {e}");
                    return;
                }
            }
        }
    }

    /// Forward channel events until the channel fails (`Some(reason)`) or the
    /// key is cancelled (`None`).
    async fn pump_channel(
        &self,
        key: &SubscriptionKey,
        subscription: ChannelSubscription,
        cancel: &CancellationToken,
        policy: &mut ReconnectPolicy,
    ) -> Option<String> {
        let ChannelSubscription { mut events, cancel: channel_cancel } = subscription;
        let _teardown = channel_cancel.drop_guard();

        loop {
            let event = tokio::select! {
                biased;
                () = cancel.cancelled() => return None,
                event = events.recv() => event,
            };

            match event {
                None => return Some("channel stream ended".to_string()),
                Some(ChannelEvent::Status(ChannelStatus::Subscribed)) => {
                    policy.reset();
                    self.on_channel_connected(key);
                }
                Some(ChannelEvent::Status(ChannelStatus::ChannelError(message))) => {
                    return Some(message);
                }
                Some(ChannelEvent::Status(status @ (ChannelStatus::TimedOut | ChannelStatus::Closed))) => {
                    return Some(format!("channel {}", status.as_str().to_lowercase()));
                }
                Some(ChannelEvent::Change(raw)) => self.handle_raw_change(key, &raw),
            }
        }
    }

    /// Sleep until the key's next flow-control deadline and fire it.
    async fn drive_flow(self: Arc<Self>, key: SubscriptionKey, wake: Arc<Notify>, cancel: CancellationToken) {
        loop {
            let deadline = {
                let state = self.state.lock();
                match state.runtimes.get(&key) {
                    Some(runtime) => runtime.flow.next_deadline(),
                    None => return,
                }
            };

            tokio::select! {
                biased;
                () = cancel.cancelled() => return,
                () = wake.notified() => {}
                () = sleep_until(deadline) => {
                    let _ = self.advance_flow(&key, |flow, now| FlowOutput {
                        deliver: flow.poll(now),
                        dropped: 0,
                    });
                }
            }
        }
    }

    async fn run_sweep(self: Arc<Self>) {
        let period = self.settings.sweep_interval;
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                () = self.root.cancelled() => return,
                _ = ticker.tick() => {}
            }

            let pending: Vec<SubscriptionKey> = self
                .state
                .lock()
                .runtimes
                .iter()
                .filter(|(_, rt)| rt.flow.pending_batch_len() > 0)
                .map(|(key, _)| key.clone())
                .collect();

            for key in pending {
                let _ = self.advance_flow(&key, |flow, _| FlowOutput {
                    deliver: flow.sweep(),
                    dropped: 0,
                });
            }
        }
    }

    async fn run_drain(self: Arc<Self>) {
        let period = self.settings.queue.drain_interval;
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                () = self.root.cancelled() => return,
                () = self.drain_wake.notified() => {}
                _ = ticker.tick() => {}
            }

            if self.is_online() && self.offline_queue_depth() > 0 {
                self.drain_offline_queue();
            }
        }
    }

    async fn run_connectivity(self: Arc<Self>, mut rx: tokio::sync::watch::Receiver<bool>) {
        loop {
            tokio::select! {
                biased;
                () = self.root.cancelled() => return,
                changed = rx.changed() => {
                    if changed.is_err() {
                        tracing::debug!("Connectivity source closed");
                        return;
                    }
                }
            }

            let online = *rx.borrow_and_update();
            let was_online = self.online.swap(online, Ordering::AcqRel);
            if online != was_online {
                tracing::info!(online, "Connectivity changed");
            }
            if online {
                self.drain_wake.notify_one();
            }
        }
    }
}

// =============================================================================
// Helpers
// =============================================================================

fn invoke_callbacks(key: &SubscriptionKey, callbacks: &[ProgressCallback], updates: &[ProgressUpdate]) {
    for update in updates {
        for callback in callbacks {
            if let Err(panic) = catch_unwind(AssertUnwindSafe(|| callback(update))) {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(ToString::to_string)
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                metrics::record_callback_panic();
                tracing::error!(key = %key, panic = %message, "Progress callback panicked");
            }
        }
    }
    metrics::record_updates_delivered(updates.len() as u64);
}

fn quality_since(connection: &ConnectionState) -> ConnectionQuality {
    connection
        .last_connected
        .and_then(|at| (Utc::now() - at).to_std().ok())
        .map_or(ConnectionQuality::Poor, ConnectionQuality::from_elapsed)
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use tokio::sync::mpsc;

    use super::*;
    use crate::application::ports::{ChangeStreamError, MockChangeStreamPort};

    fn failing_port(calls: Arc<Mutex<Vec<Instant>>>) -> Arc<dyn ChangeStreamPort> {
        let mut port = MockChangeStreamPort::new();
        port.expect_subscribe().returning(move |_| {
            calls.lock().push(Instant::now());
            Err(ChangeStreamError::ConnectionFailed("refused".to_string()))
        });
        Arc::new(port)
    }

    fn idle_port() -> Arc<dyn ChangeStreamPort> {
        let mut port = MockChangeStreamPort::new();
        port.expect_subscribe().returning(|_| {
            let (tx, rx) = mpsc::channel(8);
            // Keep the sender alive so the channel stays open.
            std::mem::forget(tx);
            Ok(ChannelSubscription {
                events: rx,
                cancel: CancellationToken::new(),
            })
        });
        Arc::new(port)
    }

    #[test]
    fn start_requires_runtime() {
        let result = ProgressSync::start(SyncSettings::default(), idle_port(), None);
        assert_eq!(result.err(), Some(SyncError::NoRuntime));
    }

    #[tokio::test]
    async fn rejects_misuse() {
        let sync = ProgressSync::start(SyncSettings::default(), idle_port(), None).unwrap();

        let err = sync
            .subscribe_to_progress_updates(SubscriptionKey::new(""), SubscriptionFilter::user("u1"), |_| {})
            .unwrap_err();
        assert_eq!(err, SyncError::EmptyKey);

        let err = sync
            .subscribe_to_progress_updates(SubscriptionKey::new("k"), SubscriptionFilter::default(), |_| {})
            .unwrap_err();
        assert_eq!(err, SyncError::EmptyFilter);

        sync.destroy();
        let err = sync.subscribe_to_user_progress("u1", |_| {}).unwrap_err();
        assert_eq!(err, SyncError::Destroyed);
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_backoff_schedule() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let sync = ProgressSync::start(SyncSettings::default(), failing_port(Arc::clone(&calls)), None)
            .unwrap();

        sync.subscribe_to_user_progress("u1", |_| {}).unwrap();

        while sync.stats().exhausted_channels == 0 {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        let calls = calls.lock().clone();
        assert_eq!(calls.len(), 6);
        let gaps: Vec<u64> = calls
            .windows(2)
            .map(|w| u64::try_from((w[1] - w[0]).as_millis()).unwrap())
            .collect();
        assert_eq!(gaps, vec![2_000, 4_000, 8_000, 16_000, 30_000]);

        let state = sync.connection_state();
        assert_eq!(state.status, ConnectionStatus::Error);
        assert_eq!(state.reconnect_attempts, 6);

        let report = sync.health_check();
        assert_eq!(report.status, crate::application::services::diagnostics::HealthStatus::Unhealthy);
        sync.destroy();
    }

    #[tokio::test]
    async fn multiplexes_one_channel_per_key() {
        let opened = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&opened);
        let mut port = MockChangeStreamPort::new();
        port.expect_subscribe().returning(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            let (tx, rx) = mpsc::channel(8);
            std::mem::forget(tx);
            Ok(ChannelSubscription {
                events: rx,
                cancel: CancellationToken::new(),
            })
        });
        let sync = ProgressSync::start(SyncSettings::default(), Arc::new(port), None).unwrap();

        for _ in 0..5 {
            sync.subscribe_to_user_progress("u1", |_| {}).unwrap();
        }
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(opened.load(Ordering::SeqCst), 1);
        let stats = sync.stats();
        assert_eq!(stats.active_subscriptions, 1);
        assert_eq!(stats.total_callbacks, 5);
        sync.destroy();
    }

    #[test]
    fn callback_panic_is_contained() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let panicking: ProgressCallback = Arc::new(|_| panic!("observer bug"));
        let counting: ProgressCallback = Arc::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let update = ProgressUpdate {
            user_id: "u1".to_string(),
            course_id: "c1".to_string(),
            overall_completion: Some(1.0),
            component_scores: None,
            milestones_achieved: std::collections::BTreeSet::new(),
            last_activity: Utc::now(),
            updated_at: Utc::now(),
            metadata: crate::domain::progress::UpdateMetadata {
                source: crate::domain::progress::UpdateSource::Manual,
                batch_id: None,
                performance_delta: Some(0.0),
            },
        };

        invoke_callbacks(
            &SubscriptionKey::for_user("u1"),
            &[panicking, counting],
            &[update.clone(), update],
        );
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
