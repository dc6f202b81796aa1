//! Property tests for offline queue ordering and eviction.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::cast_precision_loss)]

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use chrono::Utc;
use progress_sync::application::services::{OfflineQueue, OfflineQueueConfig, QueuePriority};
use progress_sync::{ProgressUpdate, SubscriptionKey, UpdateMetadata, UpdateSource};
use proptest::prelude::*;

fn update(n: usize) -> ProgressUpdate {
    let now = Utc::now();
    ProgressUpdate {
        user_id: "u1".to_string(),
        course_id: "c1".to_string(),
        overall_completion: Some(n as f64),
        component_scores: Some(BTreeMap::new()),
        milestones_achieved: BTreeSet::new(),
        last_activity: now,
        updated_at: now,
        metadata: UpdateMetadata {
            source: UpdateSource::Manual,
            batch_id: None,
            performance_delta: None,
        },
    }
}

fn small_config(capacity: usize, trim_to: usize, drain_batch: usize) -> OfflineQueueConfig {
    OfflineQueueConfig {
        capacity,
        trim_to,
        drain_batch,
        max_retries: 3,
        drain_interval: Duration::from_secs(10),
    }
}

fn priority() -> impl Strategy<Value = QueuePriority> {
    prop_oneof![
        Just(QueuePriority::Low),
        Just(QueuePriority::Normal),
        Just(QueuePriority::High),
    ]
}

proptest! {
    #[test]
    fn depth_never_exceeds_capacity(
        priorities in prop::collection::vec(priority(), 0..200),
        capacity in 5_usize..50,
    ) {
        let trim_to = capacity * 9 / 10;
        let mut queue = OfflineQueue::new(small_config(capacity, trim_to, 10));

        for (n, priority) in priorities.into_iter().enumerate() {
            let evicted = queue.enqueue(SubscriptionKey::for_user("u1"), update(n), priority);
            prop_assert!(queue.len() <= capacity);
            if evicted > 0 {
                prop_assert_eq!(queue.len(), trim_to);
            }
        }
    }

    #[test]
    fn replay_order_is_enqueue_order(
        priorities in prop::collection::vec(priority(), 1..150),
    ) {
        let mut queue = OfflineQueue::new(small_config(40, 30, 7));
        for (n, priority) in priorities.into_iter().enumerate() {
            queue.enqueue(SubscriptionKey::for_user("u1"), update(n), priority);
        }

        let mut replayed = Vec::new();
        loop {
            let batch = queue.take_batch();
            if batch.is_empty() {
                break;
            }
            prop_assert!(batch.len() <= 7);
            replayed.extend(batch.into_iter().map(|item| item.seq));
        }

        prop_assert!(replayed.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn eviction_spares_higher_priorities(
        priorities in prop::collection::vec(priority(), 1..120),
    ) {
        let mut queue = OfflineQueue::new(small_config(20, 15, 10));
        let mut enqueued = Vec::new();
        for (n, priority) in priorities.into_iter().enumerate() {
            queue.enqueue(SubscriptionKey::for_user("u1"), update(n), priority);
            enqueued.push(priority);
        }

        let highs_enqueued = enqueued.iter().filter(|p| **p == QueuePriority::High).count();
        let highs_kept = queue.iter().filter(|item| item.priority == QueuePriority::High).count();

        if highs_enqueued <= 15 {
            prop_assert_eq!(highs_kept, highs_enqueued);
        }
    }

    #[test]
    fn requeue_keeps_failed_item_first(
        count in 2_usize..30,
        failed_at in 0_usize..10,
    ) {
        let mut queue = OfflineQueue::new(small_config(100, 90, 10));
        for n in 0..count {
            queue.enqueue(SubscriptionKey::for_user("u1"), update(n), QueuePriority::Normal);
        }

        let mut batch = queue.take_batch().into_iter();
        let failed_at = failed_at.min(batch.len() - 1);
        let failed = batch.by_ref().nth(failed_at).unwrap();
        let failed_seq = failed.seq;
        let remainder: Vec<_> = batch.collect();

        prop_assert!(queue.requeue_failed(failed, remainder));
        let front = queue.iter().next().unwrap();
        prop_assert_eq!(front.seq, failed_seq);
        prop_assert_eq!(front.retries, 1);
        prop_assert_eq!(queue.len(), count - failed_at);
    }
}
