// Trait definitions for dependency injection
//
// These are INFRASTRUCTURE traits only - no business logic.
// Content planning and topic screening are domain functions built on top.
//
// Naming convention: Base* for trait names (e.g., BaseTextGenerator, BasePublisher)

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::llm_request::{GenerationError, GenerationRequest};

// =============================================================================
// Text generation (Infrastructure - LLM)
// =============================================================================

#[async_trait]
pub trait BaseTextGenerator: Send + Sync {
    /// Model used when a prompt does not name one
    fn default_model(&self) -> &str;

    /// Generate text for an already-normalized request
    async fn generate_text(&self, request: &GenerationRequest) -> Result<String, GenerationError>;
}

// =============================================================================
// Image generation (Infrastructure)
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeneratedImage {
    pub mime_type: String,
    /// Base64-encoded image bytes
    pub data: String,
}

#[async_trait]
pub trait BaseImageGenerator: Send + Sync {
    async fn generate_images(
        &self,
        prompt: &str,
        count: u32,
    ) -> Result<Vec<GeneratedImage>, GenerationError>;
}

// =============================================================================
// Publishing (Infrastructure - blogging REST API)
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PublishRequest {
    pub title: String,
    pub content_html: String,
    pub categories: Vec<String>,
    pub tags: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<GeneratedImage>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublishedPost {
    pub id: i64,
    #[serde(default)]
    pub link: Option<String>,
}

#[async_trait]
pub trait BasePublisher: Send + Sync {
    async fn publish(&self, request: &PublishRequest) -> Result<PublishedPost>;
}
