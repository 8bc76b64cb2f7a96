//! Server dependencies for work-item handlers (using traits for testability)
//!
//! This module provides the dependency container handed to every handler.
//! All external services use trait abstractions to enable testing.

use std::sync::Arc;
use std::time::Duration;

use crate::kernel::jobs::WorkItemQueue;
use crate::kernel::{BaseImageGenerator, BasePublisher, BaseTextGenerator};

/// Retry behaviour of a single generation step.
#[derive(Debug, Clone, Copy)]
pub struct GenerationSettings {
    pub max_retries: u32,
    pub max_backoff: Duration,
    /// Images requested per published post
    pub image_count: u32,
}

impl Default for GenerationSettings {
    fn default() -> Self {
        Self {
            max_retries: 3,
            max_backoff: Duration::from_secs(20),
            image_count: 1,
        }
    }
}

/// Dependencies accessible to work-item handlers
#[derive(Clone)]
pub struct ServerDeps {
    /// Lets a handler enqueue follow-up work (plan_next -> write_and_post)
    pub queue: Arc<dyn WorkItemQueue>,
    pub text_generator: Arc<dyn BaseTextGenerator>,
    pub image_generator: Arc<dyn BaseImageGenerator>,
    pub publisher: Arc<dyn BasePublisher>,
    pub generation: GenerationSettings,
}

impl ServerDeps {
    pub fn new(
        queue: Arc<dyn WorkItemQueue>,
        text_generator: Arc<dyn BaseTextGenerator>,
        image_generator: Arc<dyn BaseImageGenerator>,
        publisher: Arc<dyn BasePublisher>,
        generation: GenerationSettings,
    ) -> Self {
        Self {
            queue,
            text_generator,
            image_generator,
            publisher,
            generation,
        }
    }
}
