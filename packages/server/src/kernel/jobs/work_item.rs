use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use typed_builder::TypedBuilder;
use uuid::Uuid;

use crate::common::truncate_chars;

/// Attempts allowed when the producer does not say otherwise.
pub const DEFAULT_MAX_ATTEMPTS: i32 = 3;

/// `last_error` is stored truncated to this many characters.
pub const MAX_ERROR_CHARS: usize = 2000;

// ============================================================================
// Enums
// ============================================================================

/// `queued -> running -> {done | queued (retry) | failed}`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "work_item_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum WorkItemStatus {
    Queued,
    Running,
    Done,
    Failed,
}

impl std::fmt::Display for WorkItemStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            WorkItemStatus::Queued => "queued",
            WorkItemStatus::Running => "running",
            WorkItemStatus::Done => "done",
            WorkItemStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Transient error - back to the queue if attempts remain
    Retryable,
    /// Permanent error - fails the item immediately
    NonRetryable,
}

impl FailureKind {
    pub fn is_terminal(&self) -> bool {
        matches!(self, FailureKind::NonRetryable)
    }
}

// ============================================================================
// Model
// ============================================================================

#[derive(FromRow, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: Uuid,
    pub kind: String,
    pub payload: serde_json::Value,
    pub scheduled_at: DateTime<Utc>,
    /// Earliest time the item may be claimed; pushed forward on retry
    pub available_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub status: WorkItemStatus,
    pub attempts: i32,
    pub max_attempts: i32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkItem {
    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        self.status == WorkItemStatus::Queued && self.available_at <= now
    }

    pub fn is_exhausted(&self) -> bool {
        self.attempts >= self.max_attempts
    }
}

/// A work item a producer wants enqueued.
///
/// ```ignore
/// let item = NewWorkItem::builder()
///     .kind("write_and_post")
///     .payload(json!({ "series_id": 7 }))
///     .build();
/// queue.enqueue(item).await?;
/// ```
#[derive(Debug, Clone, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct NewWorkItem {
    pub kind: String,
    #[builder(default = serde_json::json!({}))]
    pub payload: serde_json::Value,
    /// Delay the first claim; clamped to the enqueue time
    #[builder(default, setter(strip_option))]
    pub available_at: Option<DateTime<Utc>>,
    #[builder(default = DEFAULT_MAX_ATTEMPTS)]
    pub max_attempts: i32,
}

impl NewWorkItem {
    /// Materialize the row as it is inserted at `now`.
    pub fn into_item(self, now: DateTime<Utc>) -> WorkItem {
        let available_at = self.available_at.unwrap_or(now).max(now);
        WorkItem {
            id: Uuid::now_v7(),
            kind: self.kind,
            payload: self.payload,
            scheduled_at: now,
            available_at,
            started_at: None,
            finished_at: None,
            status: WorkItemStatus::Queued,
            attempts: 0,
            max_attempts: self.max_attempts.max(1),
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Error text as stored on the row.
pub fn stored_error(error: &str) -> String {
    truncate_chars(error, MAX_ERROR_CHARS).to_string()
}
