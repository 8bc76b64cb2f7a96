//! Work-item registry for deserializing and executing work items.
//!
//! The registry maps `kind` strings (e.g., "write_and_post") to handlers that
//! reconstruct a typed payload from JSON and run the domain logic. The runner
//! claims items from the queue and dispatches them here without knowing the
//! concrete payload types.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use thiserror::Error;

use super::work_item::{FailureKind, WorkItem};
use crate::kernel::ServerDeps;

/// Type alias for the async handler function.
///
/// The payload is deserialized inside the boxed closure, so a decode failure
/// comes back as [`DispatchError::InvalidPayload`].
type BoxedHandler = Box<
    dyn Fn(
            serde_json::Value,
            Arc<ServerDeps>,
        ) -> Pin<Box<dyn Future<Output = Result<(), DispatchError>> + Send>>
        + Send
        + Sync,
>;

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("unknown work item kind: {0}")]
    UnknownKind(String),

    #[error("invalid payload for {kind}: {source}")]
    InvalidPayload {
        kind: String,
        #[source]
        source: serde_json::Error,
    },

    #[error(transparent)]
    Handler(anyhow::Error),
}

impl DispatchError {
    /// Unknown kinds and undecodable payloads cannot succeed on retry.
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            DispatchError::UnknownKind(_) | DispatchError::InvalidPayload { .. } => {
                FailureKind::NonRetryable
            }
            DispatchError::Handler(_) => FailureKind::Retryable,
        }
    }

    /// Text stored in `last_error`, including the full cause chain.
    pub fn error_text(&self) -> String {
        match self {
            DispatchError::Handler(e) => format!("{:#}", e),
            other => other.to_string(),
        }
    }
}

/// Registry that maps work-item kinds to handlers.
///
/// # Example
///
/// ```ignore
/// let mut registry = WorkItemRegistry::new();
/// registry.register::<PlanNext, _, _>(PLAN_NEXT, |payload, deps| async move {
///     plan_next(payload, &deps).await
/// });
///
/// // Later, in WorkItemRunner
/// registry.execute(&item, deps.clone()).await?;
/// ```
#[derive(Default)]
pub struct WorkItemRegistry {
    handlers: HashMap<&'static str, BoxedHandler>,
}

impl WorkItemRegistry {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Register a handler for `kind`. A later registration for the same kind
    /// replaces the earlier one.
    pub fn register<P, F, Fut>(&mut self, kind: &'static str, handler: F)
    where
        P: DeserializeOwned + Send + 'static,
        F: Fn(P, Arc<ServerDeps>) -> Fut + Send + Sync + Clone + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let boxed: BoxedHandler = Box::new(move |value, deps| {
            let handler = handler.clone();
            Box::pin(async move {
                let payload: P = serde_json::from_value(value).map_err(|source| {
                    DispatchError::InvalidPayload {
                        kind: kind.to_string(),
                        source,
                    }
                })?;
                handler(payload, deps).await.map_err(DispatchError::Handler)
            })
        });

        self.handlers.insert(kind, boxed);
    }

    pub async fn execute(&self, item: &WorkItem, deps: Arc<ServerDeps>) -> Result<(), DispatchError> {
        let handler = self
            .handlers
            .get(item.kind.as_str())
            .ok_or_else(|| DispatchError::UnknownKind(item.kind.clone()))?;

        handler(item.payload.clone(), deps).await
    }

    pub fn is_registered(&self, kind: &str) -> bool {
        self.handlers.contains_key(kind)
    }

    pub fn kinds(&self) -> Vec<&'static str> {
        let mut kinds: Vec<&'static str> = self.handlers.keys().copied().collect();
        kinds.sort_unstable();
        kinds
    }
}

/// Thread-safe registry wrapped in Arc.
pub type SharedWorkItemRegistry = Arc<WorkItemRegistry>;
