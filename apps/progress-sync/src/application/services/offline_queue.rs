//! Offline Queue
//!
//! Holds updates that could not be delivered while the client was offline and
//! hands them back for replay once connectivity returns.
//!
//! Items keep enqueue order through every operation: eviction re-sorts the
//! survivors by sequence number, and items that fail to replay are put back
//! at the front ahead of anything that arrived in the meantime.
//!
//! Items handed out by `take_batch` stay counted against their key until
//! they are settled or requeued, so callers can tell whether a key still
//! has a backlog in flight.
//!
//! # Eviction
//!
//! When an enqueue pushes the length past `capacity`, items are ranked by
//! `(priority, age)` and the lowest-ranked are discarded until `trim_to`
//! remain. Low-priority and older items go first.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::domain::progress::{ProgressUpdate, UpdateKind};
use crate::domain::subscription::SubscriptionKey;

// =============================================================================
// Types
// =============================================================================

/// Replay priority. Ordering is `Low < Normal < High`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum QueuePriority {
    /// Evicted first.
    Low,
    /// Default for progress rows.
    Normal,
    /// Milestone achievements.
    High,
}

impl QueuePriority {
    /// Priority assigned to an update when it is queued.
    #[must_use]
    pub const fn for_update(update: &ProgressUpdate) -> Self {
        match update.kind() {
            UpdateKind::Milestone => Self::High,
            UpdateKind::Progress => Self::Normal,
        }
    }
}

/// One queued update.
#[derive(Debug, Clone)]
pub struct OfflineQueueItem {
    /// Generated identifier.
    pub id: String,
    /// Subscription the update was headed for.
    pub key: SubscriptionKey,
    /// The update.
    pub update: ProgressUpdate,
    /// When the item was queued.
    pub enqueued_at: DateTime<Utc>,
    /// Failed replay attempts.
    pub retries: u32,
    /// Replay priority.
    pub priority: QueuePriority,
    /// Monotonic enqueue sequence.
    pub seq: u64,
}

/// Queue limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OfflineQueueConfig {
    /// Maximum items held before eviction.
    pub capacity: usize,
    /// Length to trim down to on overflow.
    pub trim_to: usize,
    /// Items processed per drain cycle.
    pub drain_batch: usize,
    /// Replay failures tolerated per item.
    pub max_retries: u32,
    /// Periodic drain interval while online.
    pub drain_interval: Duration,
}

impl Default for OfflineQueueConfig {
    fn default() -> Self {
        Self {
            capacity: 1_000,
            trim_to: 900,
            drain_batch: 50,
            max_retries: 3,
            drain_interval: Duration::from_secs(10),
        }
    }
}

// =============================================================================
// Queue
// =============================================================================

/// Bounded FIFO of undelivered updates.
#[derive(Debug)]
pub struct OfflineQueue {
    config: OfflineQueueConfig,
    items: VecDeque<OfflineQueueItem>,
    in_flight: HashMap<SubscriptionKey, usize>,
    next_seq: u64,
}

impl OfflineQueue {
    /// Create an empty queue.
    #[must_use]
    pub fn new(config: OfflineQueueConfig) -> Self {
        Self {
            config,
            items: VecDeque::new(),
            in_flight: HashMap::new(),
            next_seq: 0,
        }
    }

    /// Queue limits.
    #[must_use]
    pub const fn config(&self) -> &OfflineQueueConfig {
        &self.config
    }

    /// Number of queued items.
    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Whether the queue is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Iterate queued items in replay order.
    pub fn iter(&self) -> impl Iterator<Item = &OfflineQueueItem> {
        self.items.iter()
    }

    /// Discard everything.
    pub fn clear(&mut self) {
        self.items.clear();
        self.in_flight.clear();
    }

    /// Append an update. Returns the number of items evicted to make room.
    pub fn enqueue(
        &mut self,
        key: SubscriptionKey,
        update: ProgressUpdate,
        priority: QueuePriority,
    ) -> usize {
        let seq = self.next_seq;
        self.next_seq += 1;

        self.items.push_back(OfflineQueueItem {
            id: uuid::Uuid::new_v4().to_string(),
            key,
            update,
            enqueued_at: Utc::now(),
            retries: 0,
            priority,
            seq,
        });

        if self.items.len() > self.config.capacity {
            self.evict()
        } else {
            0
        }
    }

    /// Remove up to `drain_batch` items from the front for replay.
    ///
    /// Each item counts as in flight for its key until passed to
    /// [`settle`](Self::settle) or [`requeue_failed`](Self::requeue_failed).
    pub fn take_batch(&mut self) -> Vec<OfflineQueueItem> {
        let n = self.config.drain_batch.min(self.items.len());
        let batch: Vec<_> = self.items.drain(..n).collect();
        for item in &batch {
            *self.in_flight.entry(item.key.clone()).or_default() += 1;
        }
        batch
    }

    /// Mark one in-flight item for `key` as finished.
    pub fn settle(&mut self, key: &SubscriptionKey) {
        if let Some(count) = self.in_flight.get_mut(key) {
            *count -= 1;
            if *count == 0 {
                self.in_flight.remove(key);
            }
        }
    }

    /// Whether `key` has queued or in-flight items.
    #[must_use]
    pub fn has_backlog(&self, key: &SubscriptionKey) -> bool {
        self.in_flight.contains_key(key) || self.items.iter().any(|item| &item.key == key)
    }

    /// Return a failed item and the untried remainder of its batch.
    ///
    /// The remainder goes back to the front unchanged. The failed item's
    /// retry counter is incremented and it is placed ahead of the remainder
    /// if it still has retries left. Returns `false` when it was dropped.
    pub fn requeue_failed(
        &mut self,
        mut failed: OfflineQueueItem,
        remainder: Vec<OfflineQueueItem>,
    ) -> bool {
        for item in remainder.into_iter().rev() {
            self.settle(&item.key);
            self.items.push_front(item);
        }
        self.settle(&failed.key);

        failed.retries += 1;
        if failed.retries < self.config.max_retries {
            self.items.push_front(failed);
            true
        } else {
            false
        }
    }

    fn evict(&mut self) -> usize {
        let excess = self.items.len().saturating_sub(self.config.trim_to);

        let slice = self.items.make_contiguous();
        slice.sort_by_key(|item| (item.priority, item.seq));
        self.items.drain(..excess);
        self.items.make_contiguous().sort_by_key(|item| item.seq);

        excess
    }
}

impl Default for OfflineQueue {
    fn default() -> Self {
        Self::new(OfflineQueueConfig::default())
    }
}

// =============================================================================
// Tests
// =============================================================================
