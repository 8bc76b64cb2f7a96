//! Job handlers keyed by `func_key`.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use crate::kernel::CadenceError;

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("unknown func_key={0}")]
    UnknownFuncKey(String),

    #[error("invalid cron_expr for job {job_id}: {source}")]
    InvalidCron {
        job_id: String,
        #[source]
        source: CadenceError,
    },

    #[error("scheduler is not running")]
    NotRunning,

    #[error("scheduler is already running")]
    AlreadyRunning,
}

/// Work performed when a cron job fires.
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// Run with the job's params; the returned value is stored on the run.
    async fn run(&self, params: Value) -> Result<Value>;
}

struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> JobHandler for FnHandler<F>
where
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value>> + Send + 'static,
{
    async fn run(&self, params: Value) -> Result<Value> {
        (self.0)(params).await
    }
}

#[derive(Default)]
pub struct JobHandlerRegistry {
    handlers: HashMap<String, Arc<dyn JobHandler>>,
}

impl JobHandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, func_key: impl Into<String>, handler: Arc<dyn JobHandler>) {
        self.handlers.insert(func_key.into(), handler);
    }

    pub fn register_fn<F, Fut>(&mut self, func_key: impl Into<String>, handler: F)
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        self.register(func_key, Arc::new(FnHandler(handler)));
    }

    pub fn resolve(&self, func_key: &str) -> Result<Arc<dyn JobHandler>, SchedulerError> {
        self.handlers
            .get(func_key)
            .cloned()
            .ok_or_else(|| SchedulerError::UnknownFuncKey(func_key.to_string()))
    }

    pub fn is_registered(&self, func_key: &str) -> bool {
        self.handlers.contains_key(func_key)
    }

    pub fn func_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.handlers.keys().cloned().collect();
        keys.sort();
        keys
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Doubler;

    #[async_trait]
    impl JobHandler for Doubler {
        async fn run(&self, params: Value) -> Result<Value> {
            let n = params["n"].as_i64().unwrap_or(0);
            Ok(json!({ "n": n * 2 }))
        }
    }

    #[tokio::test]
    async fn resolves_registered_handlers() {
        let mut registry = JobHandlerRegistry::new();
        registry.register("double", Arc::new(Doubler));
        registry.register_fn("echo", |params| async move { Ok(params) });

        assert_eq!(registry.func_keys(), vec!["double", "echo"]);

        let out = registry.resolve("double").unwrap().run(json!({"n": 4})).await.unwrap();
        assert_eq!(out, json!({"n": 8}));

        let out = registry.resolve("echo").unwrap().run(json!("hi")).await.unwrap();
        assert_eq!(out, json!("hi"));
    }

    #[test]
    fn unknown_key_fails_fast() {
        let registry = JobHandlerRegistry::new();
        let err = registry.resolve("nope").err().unwrap();
        assert!(matches!(err, SchedulerError::UnknownFuncKey(_)));
        assert_eq!(err.to_string(), "unknown func_key=nope");
    }
}
