//! Progress Update Types
//!
//! The normalized, immutable representation of one change to a learner's
//! progress record. Values of these types are produced only by the update
//! transformer; everything downstream (flow control, offline queue,
//! observers) treats them as read-only.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// =============================================================================
// Identifiers
// =============================================================================

/// Identifier of a learner.
pub type UserId = String;

/// Identifier of a course.
pub type CourseId = String;

/// Identifier of a milestone (badge, module completion, etc.).
pub type MilestoneId = String;

// =============================================================================
// Provenance
// =============================================================================

/// Where a progress change originated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpdateSource {
    /// Produced by an exam attempt being scored.
    Exam,
    /// Produced by a practice session.
    Practice,
    /// Produced by a direct write (enrolment, admin edit).
    Manual,
}

impl UpdateSource {
    /// Get the source label.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Exam => "exam",
            Self::Practice => "practice",
            Self::Manual => "manual",
        }
    }
}

/// Provenance metadata attached to every update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateMetadata {
    /// Source category.
    pub source: UpdateSource,
    /// Batch the update was delivered in, if batching is enabled.
    pub batch_id: Option<String>,
    /// Change in performance relative to the previous value.
    ///
    /// No previous-value comparison exists upstream, so progress rows always
    /// carry `Some(0.0)` and milestone events carry `None`.
    pub performance_delta: Option<f64>,
}

// =============================================================================
// Progress Update
// =============================================================================

/// Whether an update describes a whole progress row or a single milestone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateKind {
    /// A full progress row insert or update.
    Progress,
    /// A milestone-only event; unset fields mean "unchanged".
    Milestone,
}

/// One normalized change to a learner's course progress.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressUpdate {
    /// Owning learner.
    pub user_id: UserId,
    /// Course the progress belongs to.
    pub course_id: CourseId,
    /// Overall completion percentage (0-100). `None` on milestone events.
    pub overall_completion: Option<f64>,
    /// Component name to score. `None` on milestone events.
    pub component_scores: Option<BTreeMap<String, f64>>,
    /// Milestones achieved by this change.
    pub milestones_achieved: BTreeSet<MilestoneId>,
    /// Last learner activity.
    pub last_activity: DateTime<Utc>,
    /// When the row changed.
    pub updated_at: DateTime<Utc>,
    /// Provenance.
    pub metadata: UpdateMetadata,
}

impl ProgressUpdate {
    /// Kind of update, derived from which fields are present.
    #[must_use]
    pub const fn kind(&self) -> UpdateKind {
        if self.overall_completion.is_none() && self.component_scores.is_none() {
            UpdateKind::Milestone
        } else {
            UpdateKind::Progress
        }
    }

    /// Copy of this update stamped with a batch identifier.
    #[must_use]
    pub fn with_batch_id(&self, batch_id: &str) -> Self {
        let mut update = self.clone();
        update.metadata.batch_id = Some(batch_id.to_string());
        update
    }
}
