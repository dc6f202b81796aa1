//! Update Transformer
//!
//! Turns raw change-stream rows into [`ProgressUpdate`] values.
//!
//! The change stream delivers loosely typed JSON rows. Display consumers
//! prefer partial data over missing data, so every field except the routing
//! identifiers is coerced to an empty/zero value when absent or malformed.
//! Each coerced field is reported in [`Transformed::defaulted`]. Milestone
//! rows are routed by user alone; a missing `course_id` becomes empty.
//!
//! # Row Shapes
//!
//! Progress table (insert/update):
//! ```json
//! {"user_id":"u1","course_id":"c1","completion_percentage":42.5,
//!  "component_scores":{"quiz":80,"lab":65},"milestones_achieved":["m1"],
//!  "last_activity_at":"2026-01-01T10:00:00Z","updated_at":"2026-01-01T10:00:01Z"}
//! ```
//!
//! Milestones table (insert):
//! ```json
//! {"user_id":"u1","course_id":"c1","milestone_id":"m2","achieved_at":"2026-01-01T10:00:00Z"}
//! ```

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

use crate::application::ports::{ChangeKind, RawChange};
use crate::domain::progress::{ProgressUpdate, UpdateMetadata, UpdateSource};

/// Result of a successful transform.
#[derive(Debug, Clone, PartialEq)]
pub struct Transformed {
    /// The normalized update.
    pub update: ProgressUpdate,
    /// Names of fields that were missing or malformed and got defaulted.
    pub defaulted: Vec<&'static str>,
}

/// Errors that prevent a row from being attributed to a subscription.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransformError {
    /// Row payload is not a JSON object.
    #[error("record is not an object")]
    NotAnObject,
    /// A required field is missing or not a string/number.
    #[error("missing required field: {0}")]
    MissingField(&'static str),
    /// Row came from a table this transformer does not know.
    #[error("unexpected table: {0}")]
    UnknownTable(String),
}

/// Transforms raw rows from the progress and milestones tables.
#[derive(Debug, Clone)]
pub struct UpdateTransformer {
    progress_table: String,
    milestones_table: String,
}

impl UpdateTransformer {
    /// Create a transformer for the given table names.
    #[must_use]
    pub fn new(progress_table: impl Into<String>, milestones_table: impl Into<String>) -> Self {
        Self {
            progress_table: progress_table.into(),
            milestones_table: milestones_table.into(),
        }
    }

    /// Transform a raw change, defaulting timestamps to now.
    ///
    /// # Errors
    ///
    /// Returns `TransformError` when the row cannot be attributed: progress
    /// rows need a user and course, milestone rows a user and milestone.
    pub fn transform(&self, raw: &RawChange) -> Result<Transformed, TransformError> {
        self.transform_at(raw, Utc::now())
    }

    /// Transform a raw change with an explicit fallback time.
    ///
    /// The fallback is used for missing timestamps when the server did not
    /// report a commit timestamp.
    ///
    /// # Errors
    ///
    /// Returns `TransformError` when the row cannot be attributed: progress
    /// rows need a user and course, milestone rows a user and milestone.
    pub fn transform_at(
        &self,
        raw: &RawChange,
        received_at: DateTime<Utc>,
    ) -> Result<Transformed, TransformError> {
        let record = raw.record.as_object().ok_or(TransformError::NotAnObject)?;
        let fallback = raw.commit_timestamp.unwrap_or(received_at);

        if raw.table == self.progress_table {
            transform_progress(record, raw.kind, fallback)
        } else if raw.table == self.milestones_table {
            transform_milestone(record, fallback)
        } else {
            Err(TransformError::UnknownTable(raw.table.clone()))
        }
    }
}

// =============================================================================
// Row Transforms
// =============================================================================

fn transform_progress(
    record: &Map<String, Value>,
    kind: ChangeKind,
    fallback: DateTime<Utc>,
) -> Result<Transformed, TransformError> {
    let user_id = required_id(record, "user_id")?;
    let course_id = required_id(record, "course_id")?;
    let mut defaulted = Vec::new();

    let overall_completion = record
        .get("completion_percentage")
        .and_then(as_f64)
        .unwrap_or_else(|| {
            defaulted.push("completion_percentage");
            0.0
        });

    let component_scores = match record.get("component_scores") {
        Some(Value::Object(scores)) => {
            let parsed: BTreeMap<String, f64> = scores
                .iter()
                .filter_map(|(name, score)| as_f64(score).map(|s| (name.clone(), s)))
                .collect();
            if parsed.len() != scores.len() {
                defaulted.push("component_scores");
            }
            parsed
        }
        _ => {
            defaulted.push("component_scores");
            BTreeMap::new()
        }
    };

    let milestones_achieved = match record.get("milestones_achieved") {
        Some(Value::Array(items)) => {
            let parsed: BTreeSet<String> = items.iter().filter_map(as_id).collect();
            if parsed.len() != items.len() {
                defaulted.push("milestones_achieved");
            }
            parsed
        }
        _ => {
            defaulted.push("milestones_achieved");
            BTreeSet::new()
        }
    };

    let updated_at = timestamp(record, "updated_at", fallback, &mut defaulted);
    let last_activity = timestamp(record, "last_activity_at", updated_at, &mut defaulted);

    // Upstream does not carry a true origin field yet.
    let source = match kind {
        ChangeKind::Insert => UpdateSource::Manual,
        ChangeKind::Update => UpdateSource::Exam,
    };

    Ok(Transformed {
        update: ProgressUpdate {
            user_id,
            course_id,
            overall_completion: Some(overall_completion),
            component_scores: Some(component_scores),
            milestones_achieved,
            last_activity,
            updated_at,
            metadata: UpdateMetadata {
                source,
                batch_id: None,
                performance_delta: Some(0.0),
            },
        },
        defaulted,
    })
}

fn transform_milestone(
    record: &Map<String, Value>,
    fallback: DateTime<Utc>,
) -> Result<Transformed, TransformError> {
    let user_id = required_id(record, "user_id")?;
    let milestone_id = required_id(record, "milestone_id")?;
    let mut defaulted = Vec::new();

    let course_id = required_id(record, "course_id").unwrap_or_else(|_| {
        defaulted.push("course_id");
        String::new()
    });

    let achieved_at = timestamp(record, "achieved_at", fallback, &mut defaulted);

    Ok(Transformed {
        update: ProgressUpdate {
            user_id,
            course_id,
            overall_completion: None,
            component_scores: None,
            milestones_achieved: BTreeSet::from([milestone_id]),
            last_activity: achieved_at,
            updated_at: achieved_at,
            metadata: UpdateMetadata {
                source: UpdateSource::Manual,
                batch_id: None,
                performance_delta: None,
            },
        },
        defaulted,
    })
}

// =============================================================================
// Field Coercion
// =============================================================================

fn required_id(
    record: &Map<String, Value>,
    field: &'static str,
) -> Result<String, TransformError> {
    record
        .get(field)
        .and_then(as_id)
        .filter(|id| !id.is_empty())
        .ok_or(TransformError::MissingField(field))
}

fn as_id(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
    .filter(|v| v.is_finite())
}

fn timestamp(
    record: &Map<String, Value>,
    field: &'static str,
    fallback: DateTime<Utc>,
    defaulted: &mut Vec<&'static str>,
) -> DateTime<Utc> {
    record
        .get(field)
        .and_then(Value::as_str)
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map_or_else(
            || {
                defaulted.push(field);
                fallback
            },
            |dt| dt.with_timezone(&Utc),
        )
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use serde_json::json;

    use super::*;
    use crate::domain::progress::UpdateKind;

    fn transformer() -> UpdateTransformer {
        UpdateTransformer::new("user_progress", "user_milestones")
    }

    fn raw(table: &str, kind: ChangeKind, record: Value) -> RawChange {
        RawChange {
            table: table.to_string(),
            kind,
            record,
            commit_timestamp: None,
        }
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn full_progress_row() {
        let change = raw(
            "user_progress",
            ChangeKind::Update,
            json!({
                "user_id": "u1",
                "course_id": "c1",
                "completion_percentage": 42.5,
                "component_scores": {"quiz": 80, "lab": 65.5},
                "milestones_achieved": ["m1", "m2"],
                "last_activity_at": "2026-01-01T10:00:00Z",
                "updated_at": "2026-01-01T10:00:01Z"
            }),
        );

        let out = transformer().transform_at(&change, now()).unwrap();

        assert!(out.defaulted.is_empty());
        assert_eq!(out.update.user_id, "u1");
        assert_eq!(out.update.overall_completion, Some(42.5));
        let scores = out.update.component_scores.as_ref().unwrap();
        assert_eq!(scores.get("quiz"), Some(&80.0));
        assert_eq!(scores.get("lab"), Some(&65.5));
        assert_eq!(out.update.milestones_achieved.len(), 2);
        assert_eq!(
            out.update.updated_at,
            Utc.with_ymd_and_hms(2026, 1, 1, 10, 0, 1).unwrap()
        );
        assert_eq!(out.update.kind(), UpdateKind::Progress);
    }

    #[test]
    fn insert_is_manual_update_is_exam() {
        let record = json!({"user_id": "u1", "course_id": "c1"});
        let t = transformer();

        let inserted = t
            .transform_at(&raw("user_progress", ChangeKind::Insert, record.clone()), now())
            .unwrap();
        let updated = t
            .transform_at(&raw("user_progress", ChangeKind::Update, record), now())
            .unwrap();

        assert_eq!(inserted.update.metadata.source, UpdateSource::Manual);
        assert_eq!(updated.update.metadata.source, UpdateSource::Exam);
        assert_eq!(updated.update.metadata.performance_delta, Some(0.0));
    }

    #[test]
    fn missing_fields_are_defaulted_and_reported() {
        let change = raw(
            "user_progress",
            ChangeKind::Update,
            json!({"user_id": "u1", "course_id": "c1", "component_scores": "oops"}),
        );

        let out = transformer().transform_at(&change, now()).unwrap();

        assert_eq!(out.update.overall_completion, Some(0.0));
        assert_eq!(out.update.component_scores, Some(BTreeMap::new()));
        assert!(out.update.milestones_achieved.is_empty());
        assert_eq!(out.update.updated_at, now());
        assert_eq!(out.update.last_activity, now());
        assert_eq!(
            out.defaulted,
            vec![
                "completion_percentage",
                "component_scores",
                "milestones_achieved",
                "updated_at",
                "last_activity_at"
            ]
        );
    }

    #[test]
    fn partially_malformed_containers_keep_valid_entries() {
        let change = raw(
            "user_progress",
            ChangeKind::Update,
            json!({
                "user_id": "u1",
                "course_id": "c1",
                "completion_percentage": "55",
                "component_scores": {"quiz": 90, "notes": "n/a"},
                "milestones_achieved": ["m1", {"bad": true}, 7],
                "last_activity_at": "2026-01-01T10:00:00Z",
                "updated_at": "2026-01-01T10:00:00Z"
            }),
        );

        let out = transformer().transform_at(&change, now()).unwrap();

        assert_eq!(out.update.overall_completion, Some(55.0));
        assert_eq!(out.update.component_scores.as_ref().unwrap().len(), 1);
        assert!(out.update.milestones_achieved.contains("7"));
        assert_eq!(out.defaulted, vec!["component_scores", "milestones_achieved"]);
    }

    #[test]
    fn commit_timestamp_preferred_over_receive_time() {
        let commit = Utc.with_ymd_and_hms(2026, 2, 2, 2, 2, 2).unwrap();
        let mut change = raw(
            "user_progress",
            ChangeKind::Insert,
            json!({"user_id": "u1", "course_id": "c1"}),
        );
        change.commit_timestamp = Some(commit);

        let out = transformer().transform_at(&change, now()).unwrap();
        assert_eq!(out.update.updated_at, commit);
    }

    #[test]
    fn milestone_row_produces_partial_update() {
        let change = raw(
            "user_milestones",
            ChangeKind::Insert,
            json!({
                "user_id": "u1",
                "course_id": "c1",
                "milestone_id": "first-exam",
                "achieved_at": "2026-01-05T09:30:00Z"
            }),
        );

        let out = transformer().transform_at(&change, now()).unwrap();

        assert_eq!(out.update.kind(), UpdateKind::Milestone);
        assert!(out.update.overall_completion.is_none());
        assert!(out.update.component_scores.is_none());
        assert!(out.update.milestones_achieved.contains("first-exam"));
        assert_eq!(
            out.update.last_activity,
            Utc.with_ymd_and_hms(2026, 1, 5, 9, 30, 0).unwrap()
        );
        assert!(out.update.metadata.performance_delta.is_none());
    }

    #[test]
    fn milestone_without_course_defaults_course() {
        let change = raw(
            "user_milestones",
            ChangeKind::Insert,
            json!({"user_id": "u1", "milestone_id": "m1"}),
        );

        let out = transformer().transform_at(&change, now()).unwrap();

        assert_eq!(out.update.user_id, "u1");
        assert_eq!(out.update.course_id, "");
        assert!(out.update.milestones_achieved.contains("m1"));
        assert_eq!(out.update.last_activity, now());
        assert_eq!(out.defaulted, vec!["course_id", "achieved_at"]);
    }

    #[test]
    fn numeric_ids_are_stringified() {
        let change = raw(
            "user_progress",
            ChangeKind::Update,
            json!({"user_id": 17, "course_id": 4}),
        );

        let out = transformer().transform_at(&change, now()).unwrap();
        assert_eq!(out.update.user_id, "17");
        assert_eq!(out.update.course_id, "4");
    }

    #[test]
    fn unroutable_rows_are_rejected() {
        let t = transformer();

        assert_eq!(
            t.transform_at(&raw("user_progress", ChangeKind::Update, json!([1])), now()),
            Err(TransformError::NotAnObject)
        );
        assert_eq!(
            t.transform_at(
                &raw("user_progress", ChangeKind::Update, json!({"course_id": "c1"})),
                now()
            ),
            Err(TransformError::MissingField("user_id"))
        );
        assert_eq!(
            t.transform_at(
                &raw(
                    "user_milestones",
                    ChangeKind::Insert,
                    json!({"user_id": "u1", "course_id": "c1"})
                ),
                now()
            ),
            Err(TransformError::MissingField("milestone_id"))
        );
        assert_eq!(
            t.transform_at(
                &raw("grades", ChangeKind::Insert, json!({"user_id": "u1"})),
                now()
            ),
            Err(TransformError::UnknownTable("grades".to_string()))
        );
    }
}
