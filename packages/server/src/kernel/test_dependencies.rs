// TestDependencies - mock implementations for testing
//
// Provides mock collaborators that can be injected into ServerDeps for tests.

use anyhow::Result;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::deps::{GenerationSettings, ServerDeps};
use super::jobs::{InMemoryWorkItemQueue, WorkItemQueue};
use super::llm_request::{GenerationError, GenerationRequest};
use super::traits::{
    BaseImageGenerator, BasePublisher, BaseTextGenerator, GeneratedImage, PublishRequest,
    PublishedPost,
};

// =============================================================================
// Mock Text Generator
// =============================================================================

/// One scripted reply of [`MockTextGenerator`].
#[derive(Debug, Clone)]
pub enum MockReply {
    Text(String),
    Quota(String),
    Fail(String),
}

pub struct MockTextGenerator {
    replies: Arc<Mutex<VecDeque<MockReply>>>,
    fallback: Option<String>,
    requests: Arc<Mutex<Vec<GenerationRequest>>>,
}

impl MockTextGenerator {
    pub fn new(replies: Vec<MockReply>) -> Self {
        Self {
            replies: Arc::new(Mutex::new(replies.into())),
            fallback: None,
            requests: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Reply with `text` once the scripted replies run out
    pub fn with_fallback(mut self, text: &str) -> Self {
        self.fallback = Some(text.to_string());
        self
    }

    /// Number of generate calls made so far
    pub fn calls(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    /// Every request seen, oldest first
    pub fn requests(&self) -> Vec<GenerationRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl BaseTextGenerator for MockTextGenerator {
    fn default_model(&self) -> &str {
        "mock-model"
    }

    async fn generate_text(&self, request: &GenerationRequest) -> Result<String, GenerationError> {
        self.requests.lock().unwrap().push(request.clone());

        let reply = self.replies.lock().unwrap().pop_front();
        match reply {
            Some(MockReply::Text(text)) => Ok(text),
            Some(MockReply::Quota(msg)) => Err(GenerationError::QuotaExceeded(msg)),
            Some(MockReply::Fail(msg)) => Err(GenerationError::Other(anyhow::anyhow!(msg))),
            None => match &self.fallback {
                Some(text) => Ok(text.clone()),
                None => Err(GenerationError::Other(anyhow::anyhow!(
                    "MockTextGenerator: no scripted reply left"
                ))),
            },
        }
    }
}

// =============================================================================
// Mock Image Generator
// =============================================================================

pub struct MockImageGenerator {
    prompts: Arc<Mutex<Vec<String>>>,
}

impl MockImageGenerator {
    pub fn new() -> Self {
        Self {
            prompts: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }
}

impl Default for MockImageGenerator {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BaseImageGenerator for MockImageGenerator {
    async fn generate_images(
        &self,
        prompt: &str,
        count: u32,
    ) -> Result<Vec<GeneratedImage>, GenerationError> {
        self.prompts.lock().unwrap().push(prompt.to_string());
        Ok((0..count)
            .map(|_| GeneratedImage {
                mime_type: "image/png".to_string(),
                data: "iVBORw0KGgo=".to_string(),
            })
            .collect())
    }
}

// =============================================================================
// Mock Publisher
// =============================================================================

pub struct MockPublisher {
    published: Arc<Mutex<Vec<PublishRequest>>>,
    fail_with: Option<String>,
}

impl MockPublisher {
    pub fn new() -> Self {
        Self {
            published: Arc::new(Mutex::new(Vec::new())),
            fail_with: None,
        }
    }

    /// Make every publish call fail with `message`
    pub fn failing(message: &str) -> Self {
        Self {
            published: Arc::new(Mutex::new(Vec::new())),
            fail_with: Some(message.to_string()),
        }
    }

    pub fn published(&self) -> Vec<PublishRequest> {
        self.published.lock().unwrap().clone()
    }
}

impl Default for MockPublisher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BasePublisher for MockPublisher {
    async fn publish(&self, request: &PublishRequest) -> Result<PublishedPost> {
        if let Some(message) = &self.fail_with {
            anyhow::bail!("{}", message);
        }

        let mut published = self.published.lock().unwrap();
        published.push(request.clone());
        Ok(PublishedPost {
            id: published.len() as i64,
            link: Some(format!("https://blog.test/?p={}", published.len())),
        })
    }
}

// =============================================================================
// TestDependencies - Builder for test dependencies
// =============================================================================

#[derive(Clone)]
pub struct TestDependencies {
    pub queue: Arc<InMemoryWorkItemQueue>,
    pub text_generator: Arc<MockTextGenerator>,
    pub image_generator: Arc<MockImageGenerator>,
    pub publisher: Arc<MockPublisher>,
}

impl TestDependencies {
    pub fn new() -> Self {
        Self {
            queue: Arc::new(InMemoryWorkItemQueue::new()),
            text_generator: Arc::new(MockTextGenerator::new(vec![]).with_fallback("mock text")),
            image_generator: Arc::new(MockImageGenerator::new()),
            publisher: Arc::new(MockPublisher::new()),
        }
    }

    /// Set a mock text generator
    pub fn mock_text(mut self, generator: MockTextGenerator) -> Self {
        self.text_generator = Arc::new(generator);
        self
    }

    /// Set a mock publisher
    pub fn mock_publisher(mut self, publisher: MockPublisher) -> Self {
        self.publisher = Arc::new(publisher);
        self
    }

    /// Convert into ServerDeps for testing. Generation retries are a single
    /// attempt so failing mocks fail fast.
    pub fn into_deps(self) -> ServerDeps {
        let queue: Arc<dyn WorkItemQueue> = self.queue;
        ServerDeps::new(
            queue,
            self.text_generator,
            self.image_generator,
            self.publisher,
            GenerationSettings {
                max_retries: 1,
                max_backoff: Duration::ZERO,
                image_count: 1,
            },
        )
    }
}

impl Default for TestDependencies {
    fn default() -> Self {
        Self::new()
    }
}
