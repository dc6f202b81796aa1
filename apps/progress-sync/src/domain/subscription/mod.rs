//! Subscription Keys, Filters and Registry
//!
//! Domain types for tracking which observers are interested in which
//! progress scope.
//!
//! # Design
//!
//! A subscription is identified by a logical key derived deterministically
//! from its scope (one user, one course, or a user/course pair). The registry
//! counts callbacks per key so that:
//! - the first callback for a key requires an upstream channel
//! - additional callbacks attach to the existing channel
//! - removing the last callback releases the channel
//!
//! This lets many observers share one upstream channel per scope.

use std::collections::HashMap;
use std::fmt;

use crate::domain::progress::{CourseId, UserId};

// =============================================================================
// Subscription Key
// =============================================================================

/// Logical subscription key identifying one observation scope.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionKey(String);

impl SubscriptionKey {
    /// Create a key from a caller-supplied string.
    #[must_use]
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Key for all progress of one user.
    #[must_use]
    pub fn for_user(user_id: &str) -> Self {
        Self(format!("user:{user_id}"))
    }

    /// Key for all progress in one course.
    #[must_use]
    pub fn for_course(course_id: &str) -> Self {
        Self(format!("course:{course_id}"))
    }

    /// Key for one user's progress in one course.
    #[must_use]
    pub fn for_user_course(user_id: &str, course_id: &str) -> Self {
        Self(format!("user_course:{user_id}:{course_id}"))
    }

    /// Get the key as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether the key is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Display for SubscriptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// =============================================================================
// Subscription Filter
// =============================================================================

/// Column-equality filter scoping a channel to a user, a course, or both.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct SubscriptionFilter {
    /// Restrict to one user.
    pub user_id: Option<UserId>,
    /// Restrict to one course.
    pub course_id: Option<CourseId>,
}

impl SubscriptionFilter {
    /// Filter on a single user.
    #[must_use]
    pub fn user(user_id: impl Into<UserId>) -> Self {
        Self {
            user_id: Some(user_id.into()),
            course_id: None,
        }
    }

    /// Filter on a single course.
    #[must_use]
    pub fn course(course_id: impl Into<CourseId>) -> Self {
        Self {
            user_id: None,
            course_id: Some(course_id.into()),
        }
    }

    /// Filter on one user within one course.
    #[must_use]
    pub fn user_course(user_id: impl Into<UserId>, course_id: impl Into<CourseId>) -> Self {
        Self {
            user_id: Some(user_id.into()),
            course_id: Some(course_id.into()),
        }
    }

    /// Whether the filter scopes by at least one identifier.
    #[must_use]
    pub fn is_scoped(&self) -> bool {
        self.user_id.as_deref().is_some_and(|s| !s.is_empty())
            || self.course_id.as_deref().is_some_and(|s| !s.is_empty())
    }

    /// Equality clauses as `(column, value)` pairs, user first.
    #[must_use]
    pub fn clauses(&self) -> Vec<(&'static str, &str)> {
        let mut clauses = Vec::with_capacity(2);
        if let Some(user_id) = self.user_id.as_deref() {
            clauses.push(("user_id", user_id));
        }
        if let Some(course_id) = self.course_id.as_deref() {
            clauses.push(("course_id", course_id));
        }
        clauses
    }

    /// Render as a filter expression, e.g. `user_id=eq.u1&course_id=eq.c1`.
    #[must_use]
    pub fn to_expression(&self) -> String {
        self.clauses()
            .iter()
            .map(|(column, value)| format!("{column}=eq.{value}"))
            .collect::<Vec<_>>()
            .join("&")
    }

    /// Whether a record owned by `user_id` in `course_id` falls in scope.
    #[must_use]
    pub fn matches(&self, user_id: &str, course_id: &str) -> bool {
        self.user_id.as_deref().is_none_or(|u| u == user_id)
            && self.course_id.as_deref().is_none_or(|c| c == course_id)
    }
}

// =============================================================================
// Registry
// =============================================================================

/// Identifier of a single registered callback.
pub type CallbackId = u64;

/// Effect of a registry mutation on the upstream channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistryChange {
    /// First callback for the key; an upstream channel must be created.
    ChannelRequired,
    /// Callback attached to an existing channel.
    Attached,
    /// Callback removed; other callbacks keep the channel alive.
    Detached,
    /// Last callback removed; the upstream channel must be torn down.
    ChannelReleased,
    /// Nothing matched.
    Unchanged,
}

#[derive(Debug)]
struct RegistryEntry<C> {
    filter: SubscriptionFilter,
    callbacks: Vec<(CallbackId, C)>,
}

/// Tracks callbacks per subscription key.
///
/// The registry is a plain data structure; the sync client owns it behind a
/// lock.
///
/// # Example
///
/// ```rust
/// use progress_sync::domain::subscription::{
///     RegistryChange, SubscriptionFilter, SubscriptionKey, SubscriptionRegistry,
/// };
///
/// let mut registry = SubscriptionRegistry::<&str>::new();
/// let key = SubscriptionKey::for_user("u1");
///
/// let (first, change) = registry.add(key.clone(), SubscriptionFilter::user("u1"), "a");
/// assert_eq!(change, RegistryChange::ChannelRequired);
///
/// let (_, change) = registry.add(key.clone(), SubscriptionFilter::user("u1"), "b");
/// assert_eq!(change, RegistryChange::Attached);
///
/// assert_eq!(registry.remove_callback(&key, first), RegistryChange::Detached);
/// ```
#[derive(Debug)]
pub struct SubscriptionRegistry<C> {
    entries: HashMap<SubscriptionKey, RegistryEntry<C>>,
    next_id: CallbackId,
}

impl<C> Default for SubscriptionRegistry<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C> SubscriptionRegistry<C> {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
            next_id: 1,
        }
    }

    /// Register a callback for a key.
    ///
    /// The filter is recorded only when the key is new; later callers attach
    /// to the existing scope.
    pub fn add(
        &mut self,
        key: SubscriptionKey,
        filter: SubscriptionFilter,
        callback: C,
    ) -> (CallbackId, RegistryChange) {
        let id = self.next_id;
        self.next_id += 1;

        match self.entries.get_mut(&key) {
            Some(entry) => {
                entry.callbacks.push((id, callback));
                (id, RegistryChange::Attached)
            }
            None => {
                self.entries.insert(
                    key,
                    RegistryEntry {
                        filter,
                        callbacks: vec![(id, callback)],
                    },
                );
                (id, RegistryChange::ChannelRequired)
            }
        }
    }

    /// Remove a single callback.
    pub fn remove_callback(&mut self, key: &SubscriptionKey, id: CallbackId) -> RegistryChange {
        let Some(entry) = self.entries.get_mut(key) else {
            return RegistryChange::Unchanged;
        };

        let before = entry.callbacks.len();
        entry.callbacks.retain(|(cb_id, _)| *cb_id != id);
        if entry.callbacks.len() == before {
            return RegistryChange::Unchanged;
        }

        if entry.callbacks.is_empty() {
            self.entries.remove(key);
            RegistryChange::ChannelReleased
        } else {
            RegistryChange::Detached
        }
    }

    /// Remove every callback for a key.
    pub fn remove_key(&mut self, key: &SubscriptionKey) -> RegistryChange {
        if self.entries.remove(key).is_some() {
            RegistryChange::ChannelReleased
        } else {
            RegistryChange::Unchanged
        }
    }

    /// All registered keys.
    #[must_use]
    pub fn keys(&self) -> Vec<SubscriptionKey> {
        self.entries.keys().cloned().collect()
    }

    /// Whether a key is registered.
    #[must_use]
    pub fn contains(&self, key: &SubscriptionKey) -> bool {
        self.entries.contains_key(key)
    }

    /// Filter recorded for a key.
    #[must_use]
    pub fn filter(&self, key: &SubscriptionKey) -> Option<&SubscriptionFilter> {
        self.entries.get(key).map(|entry| &entry.filter)
    }

    /// Number of registered keys.
    #[must_use]
    pub fn key_count(&self) -> usize {
        self.entries.len()
    }

    /// Number of callbacks across all keys.
    #[must_use]
    pub fn callback_count(&self) -> usize {
        self.entries.values().map(|entry| entry.callbacks.len()).sum()
    }
}

impl<C: Clone> SubscriptionRegistry<C> {
    /// Snapshot of the callbacks registered for a key, in registration order.
    #[must_use]
    pub fn callbacks(&self, key: &SubscriptionKey) -> Vec<C> {
        self.entries
            .get(key)
            .map(|entry| entry.callbacks.iter().map(|(_, cb)| cb.clone()).collect())
            .unwrap_or_default()
    }
}

// =============================================================================
// Tests
// =============================================================================
