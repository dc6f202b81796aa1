//! Flow Control
//!
//! Per-key debounce, throttle and batch policies, modelled as a small state
//! machine over [`tokio::time::Instant`]. The machine never sleeps itself:
//! callers feed it updates with [`FlowController::admit`], ask for the next
//! deadline with [`FlowController::next_deadline`], and call
//! [`FlowController::poll`] once that deadline has passed. Tests can drive it
//! with explicit instants.
//!
//! # Policies
//!
//! - **Debounce** (`debounce > 0`): every update restarts the deadline; only
//!   the latest update is released when it elapses. Takes precedence over
//!   throttle.
//! - **Throttle** (`debounce == 0`, `throttle > 0`): the first update is
//!   released immediately; later updates inside the window are dropped.
//! - **Batch**: released updates are buffered and flushed on size, on the
//!   batch interval, on the periodic sweep, or on unsubscribe.
//!
//! ```text
//!            admit (debounce)           deadline elapsed
//!   Idle ───────────────────▶ Pending ──────────────────▶ Delivered
//!     ▲                          │ admit: restart deadline      │
//!     └──────────────────────────┴──────────────────────────────┘
//! ```

use std::time::Duration;

use tokio::time::Instant;

use crate::domain::progress::ProgressUpdate;

// =============================================================================
// Configuration
// =============================================================================

/// Batching parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchConfig {
    /// Flush when this many updates are buffered.
    pub size: usize,
    /// Flush this long after the first buffered update.
    pub interval: Duration,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            size: 10,
            interval: Duration::from_secs(1),
        }
    }
}

/// Flow-control policy for one subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FlowControlConfig {
    /// Debounce window (zero disables).
    pub debounce: Duration,
    /// Throttle window (zero disables; ignored when debouncing).
    pub throttle: Duration,
    /// Batching, if enabled.
    pub batch: Option<BatchConfig>,
}

impl FlowControlConfig {
    /// Deliver every update immediately.
    #[must_use]
    pub const fn immediate() -> Self {
        Self {
            debounce: Duration::ZERO,
            throttle: Duration::ZERO,
            batch: None,
        }
    }

    /// Debounce with the given window.
    #[must_use]
    pub const fn debounced(window: Duration) -> Self {
        Self {
            debounce: window,
            throttle: Duration::ZERO,
            batch: None,
        }
    }

    /// Throttle with the given window.
    #[must_use]
    pub const fn throttled(window: Duration) -> Self {
        Self {
            debounce: Duration::ZERO,
            throttle: window,
            batch: None,
        }
    }

    /// Enable batching on top of this policy.
    #[must_use]
    pub const fn with_batch(mut self, size: usize, interval: Duration) -> Self {
        self.batch = Some(BatchConfig { size, interval });
        self
    }

    /// Effective rate policy after precedence rules.
    #[must_use]
    pub const fn rate_mode(&self) -> RateMode {
        if !self.debounce.is_zero() {
            RateMode::Debounce(self.debounce)
        } else if !self.throttle.is_zero() {
            RateMode::Throttle(self.throttle)
        } else {
            RateMode::Immediate
        }
    }
}

/// Rate policy in effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateMode {
    /// No rate limiting.
    Immediate,
    /// Debounce with window.
    Debounce(Duration),
    /// Throttle with window.
    Throttle(Duration),
}

// =============================================================================
// State Machine
// =============================================================================

/// Rate-stage state of a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowStage {
    /// Nothing admitted yet.
    Idle,
    /// A debounced update waits for its deadline.
    Pending {
        /// When the pending update is released.
        deadline: Instant,
    },
    /// An update was last released at `at`.
    Delivered {
        /// Release time.
        at: Instant,
    },
}

/// Output of an admission.
#[derive(Debug, Default)]
pub struct FlowOutput {
    /// Updates to deliver now, in order.
    pub deliver: Vec<ProgressUpdate>,
    /// Updates discarded by throttling.
    pub dropped: usize,
}

/// Flow-control state machine for one subscription key.
#[derive(Debug)]
pub struct FlowController {
    config: FlowControlConfig,
    stage: FlowStage,
    pending: Option<ProgressUpdate>,
    batch: Vec<ProgressUpdate>,
    batch_deadline: Option<Instant>,
}

impl FlowController {
    /// Create a controller for a policy.
    #[must_use]
    pub const fn new(config: FlowControlConfig) -> Self {
        Self {
            config,
            stage: FlowStage::Idle,
            pending: None,
            batch: Vec::new(),
            batch_deadline: None,
        }
    }

    /// Policy in effect.
    #[must_use]
    pub const fn config(&self) -> &FlowControlConfig {
        &self.config
    }

    /// Current rate stage.
    #[must_use]
    pub const fn stage(&self) -> FlowStage {
        self.stage
    }

    /// Number of updates waiting in the batch buffer.
    #[must_use]
    pub fn pending_batch_len(&self) -> usize {
        self.batch.len()
    }

    /// Earliest instant at which [`poll`](Self::poll) has work to do.
    #[must_use]
    pub fn next_deadline(&self) -> Option<Instant> {
        let debounce = match self.stage {
            FlowStage::Pending { deadline } => Some(deadline),
            _ => None,
        };
        match (debounce, self.batch_deadline) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Admit a freshly transformed update.
    pub fn admit(&mut self, update: ProgressUpdate, now: Instant) -> FlowOutput {
        match self.config.rate_mode() {
            RateMode::Immediate => {
                self.stage = FlowStage::Delivered { at: now };
                FlowOutput {
                    deliver: self.release(update, now),
                    dropped: 0,
                }
            }
            RateMode::Debounce(window) => {
                self.stage = FlowStage::Pending {
                    deadline: now + window,
                };
                self.pending = Some(update);
                FlowOutput::default()
            }
            RateMode::Throttle(window) => match self.stage {
                FlowStage::Delivered { at } if now < at + window => FlowOutput {
                    deliver: Vec::new(),
                    dropped: 1,
                },
                _ => {
                    self.stage = FlowStage::Delivered { at: now };
                    FlowOutput {
                        deliver: self.release(update, now),
                        dropped: 0,
                    }
                }
            },
        }
    }

    /// Fire elapsed debounce and batch deadlines.
    pub fn poll(&mut self, now: Instant) -> Vec<ProgressUpdate> {
        let mut out = Vec::new();

        if let FlowStage::Pending { deadline } = self.stage
            && now >= deadline
        {
            self.stage = FlowStage::Delivered { at: now };
            if let Some(update) = self.pending.take() {
                out.extend(self.release(update, now));
            }
        }

        if self.batch_deadline.is_some_and(|deadline| now >= deadline) {
            out.extend(self.take_batch());
        }

        out
    }

    /// Periodic sweep: flush any buffered batch regardless of triggers.
    pub fn sweep(&mut self) -> Vec<ProgressUpdate> {
        self.take_batch()
    }

    /// Flush the batch and discard any pending debounced update.
    ///
    /// Called on unsubscribe.
    pub fn flush(&mut self) -> Vec<ProgressUpdate> {
        self.pending = None;
        self.stage = FlowStage::Idle;
        self.take_batch()
    }

    /// Pass a rate-limited update into the batch stage.
    fn release(&mut self, update: ProgressUpdate, now: Instant) -> Vec<ProgressUpdate> {
        let Some(batch) = self.config.batch else {
            return vec![update];
        };

        self.batch.push(update);
        if self.batch.len() >= batch.size.max(1) {
            return self.take_batch();
        }
        if self.batch_deadline.is_none() {
            self.batch_deadline = Some(now + batch.interval);
        }
        Vec::new()
    }

    fn take_batch(&mut self) -> Vec<ProgressUpdate> {
        self.batch_deadline = None;
        if self.batch.is_empty() {
            return Vec::new();
        }

        let batch_id = uuid::Uuid::new_v4().to_string();
        std::mem::take(&mut self.batch)
            .into_iter()
            .map(|update| update.with_batch_id(&batch_id))
            .collect()
    }
}

// =============================================================================
// Tests
// =============================================================================
