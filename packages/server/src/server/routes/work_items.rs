//! Work-item enqueue and lookup.

use axum::{
    extract::{Extension, Path},
    http::StatusCode,
    Json,
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::kernel::jobs::{NewWorkItem, WorkItem, DEFAULT_MAX_ATTEMPTS};
use crate::server::app::AppState;
use crate::server::error::ApiError;

#[derive(Debug, Deserialize)]
pub struct EnqueueWorkItem {
    pub kind: String,
    #[serde(default)]
    pub payload: Option<Value>,
    #[serde(default)]
    pub available_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub max_attempts: Option<i32>,
}

impl EnqueueWorkItem {
    pub fn into_new_item(self) -> Result<NewWorkItem, ApiError> {
        let kind = self.kind.trim();
        if kind.is_empty() {
            return Err(ApiError::BadRequest("kind must not be empty".to_string()));
        }
        let max_attempts = self.max_attempts.unwrap_or(DEFAULT_MAX_ATTEMPTS);
        if max_attempts < 1 {
            return Err(ApiError::BadRequest("max_attempts must be >= 1".to_string()));
        }

        let item = NewWorkItem::builder()
            .kind(kind)
            .payload(self.payload.unwrap_or_else(|| json!({})))
            .max_attempts(max_attempts)
            .build();
        Ok(NewWorkItem {
            available_at: self.available_at,
            ..item
        })
    }
}

pub async fn enqueue_work_item(
    Extension(state): Extension<AppState>,
    Json(body): Json<EnqueueWorkItem>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let item = body.into_new_item()?;
    let kind = item.kind.clone();
    let id = state.queue.enqueue(item).await?;
    tracing::info!(work_item_id = %id, kind = %kind, "work item enqueued via admin api");
    Ok((StatusCode::CREATED, Json(json!({ "id": id }))))
}

pub async fn get_work_item(
    Extension(state): Extension<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<WorkItem>, ApiError> {
    state
        .queue
        .find(id)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("work item {} not found", id)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn body(kind: &str, max_attempts: Option<i32>) -> EnqueueWorkItem {
        EnqueueWorkItem {
            kind: kind.to_string(),
            payload: None,
            available_at: None,
            max_attempts,
        }
    }

    #[test]
    fn defaults_fill_in() {
        let item = body(" echo ", None).into_new_item().unwrap();
        assert_eq!(item.kind, "echo");
        assert_eq!(item.payload, json!({}));
        assert_eq!(item.max_attempts, DEFAULT_MAX_ATTEMPTS);
        assert!(item.available_at.is_none());
    }

    #[test]
    fn blank_kind_and_zero_attempts_are_rejected() {
        assert!(body("  ", None).into_new_item().is_err());
        assert!(body("echo", Some(0)).into_new_item().is_err());
    }
}
