// Scripted screener for tests.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use super::screening::{BaseScreener, ScreeningDecision, ScreeningError};

#[derive(Debug, Clone)]
pub enum MockVerdict {
    Claim(i64),
    Skip(String),
    Quota(String),
    Fail(String),
}

/// Answers from a script, then claims everything with score 50.
pub struct MockScreener {
    verdicts: Mutex<VecDeque<MockVerdict>>,
    titles: Arc<Mutex<Vec<String>>>,
}

impl MockScreener {
    pub fn new(verdicts: Vec<MockVerdict>) -> Self {
        Self {
            verdicts: Mutex::new(verdicts.into()),
            titles: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn claiming() -> Self {
        Self::new(Vec::new())
    }

    pub fn calls(&self) -> usize {
        self.titles.lock().unwrap().len()
    }

    /// Titles classified so far, oldest first
    pub fn titles(&self) -> Vec<String> {
        self.titles.lock().unwrap().clone()
    }
}

#[async_trait]
impl BaseScreener for MockScreener {
    async fn classify(
        &self,
        title: &str,
        _summary: Option<&str>,
    ) -> Result<ScreeningDecision, ScreeningError> {
        self.titles.lock().unwrap().push(title.to_string());
        let next = self.verdicts.lock().unwrap().pop_front();
        match next {
            Some(MockVerdict::Claim(score)) => Ok(ScreeningDecision::claim(score, "mock claim")),
            Some(MockVerdict::Skip(reason)) => Ok(ScreeningDecision::skip(10, reason)),
            Some(MockVerdict::Quota(msg)) => Err(ScreeningError::QuotaExceeded(msg)),
            Some(MockVerdict::Fail(msg)) => Err(ScreeningError::Other(anyhow::anyhow!(msg))),
            None => Ok(ScreeningDecision::claim(50, "mock claim")),
        }
    }
}
