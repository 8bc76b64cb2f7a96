use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::llm_request::{
    is_quota_message, ContentMessage, GenerationError, GenerationRequest, Role,
};
use super::traits::{BaseImageGenerator, BaseTextGenerator, GeneratedImage};

const DEFAULT_IMAGE_MODEL: &str = "gemini-2.0-flash-preview-image-generation";

/// HTTP client for the LLM generation service.
pub struct HttpGenerationClient {
    base_url: String,
    default_model: String,
    image_model: String,
    client: reqwest::Client,
}

/// Wire message: parts are `{ "text": ... }` objects.
#[derive(Debug, Serialize)]
struct WireMessage<'a> {
    role: &'a Role,
    parts: Vec<WirePart<'a>>,
}

#[derive(Debug, Serialize)]
struct WirePart<'a> {
    text: &'a str,
}

#[derive(Debug, Serialize)]
struct ContentRequest<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    model: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    image_model: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    count: Option<u32>,
    content: Vec<WireMessage<'a>>,
}

#[derive(Debug, Deserialize)]
struct ContentResponse {
    #[serde(default)]
    body: String,
}

#[derive(Debug, Deserialize)]
struct ImageResponse {
    #[serde(default)]
    images: Vec<GeneratedImage>,
}

impl HttpGenerationClient {
    pub fn new(base_url: &str, default_model: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            default_model: default_model.to_string(),
            image_model: DEFAULT_IMAGE_MODEL.to_string(),
            client,
        })
    }

    async fn post<T: DeserializeOwned>(
        &self,
        path: &str,
        body: &ContentRequest<'_>,
    ) -> Result<T, GenerationError> {
        let response = self
            .client
            .post(format!("{}{}", self.base_url, path))
            .json(body)
            .send()
            .await
            .context("Failed to send generation request")?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(classify_failure(status, &text));
        }

        let parsed: T = response
            .json()
            .await
            .context("Failed to parse generation response")?;
        Ok(parsed)
    }
}

/// 429, or an error body mentioning quota, is resource exhaustion.
fn classify_failure(status: StatusCode, body: &str) -> GenerationError {
    let message = format!("generation service error {}: {}", status, body);
    if status == StatusCode::TOO_MANY_REQUESTS || is_quota_message(body) {
        GenerationError::QuotaExceeded(message)
    } else {
        GenerationError::Other(anyhow::anyhow!(message))
    }
}

fn wire_messages(messages: &[ContentMessage]) -> Vec<WireMessage<'_>> {
    messages
        .iter()
        .map(|m| WireMessage {
            role: &m.role,
            parts: m.parts.iter().map(|p| WirePart { text: p }).collect(),
        })
        .collect()
}

#[async_trait]
impl BaseTextGenerator for HttpGenerationClient {
    fn default_model(&self) -> &str {
        &self.default_model
    }

    async fn generate_text(&self, request: &GenerationRequest) -> Result<String, GenerationError> {
        let body = ContentRequest {
            model: Some(&request.model),
            image_model: None,
            count: None,
            content: wire_messages(&request.messages),
        };
        let response: ContentResponse = self.post("/gemini/generate-content/", &body).await?;
        Ok(response.body)
    }
}

#[async_trait]
impl BaseImageGenerator for HttpGenerationClient {
    async fn generate_images(
        &self,
        prompt: &str,
        count: u32,
    ) -> Result<Vec<GeneratedImage>, GenerationError> {
        let messages = vec![ContentMessage::user(prompt)];
        let body = ContentRequest {
            model: None,
            image_model: Some(&self.image_model),
            count: Some(count),
            content: wire_messages(&messages),
        };
        let response: ImageResponse = self.post("/gemini/generate-image/", &body).await?;
        Ok(response.images)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn too_many_requests_is_quota() {
        let err = classify_failure(StatusCode::TOO_MANY_REQUESTS, "slow down");
        assert!(err.is_quota());
    }

    #[test]
    fn quota_body_is_quota_even_without_429() {
        let err = classify_failure(StatusCode::FORBIDDEN, "billing account disabled");
        assert!(err.is_quota());
    }

    #[test]
    fn server_error_is_ordinary() {
        let err = classify_failure(StatusCode::INTERNAL_SERVER_ERROR, "oops");
        assert!(!err.is_quota());
    }

    #[test]
    fn wire_format_wraps_parts_as_text_objects() {
        let messages = vec![ContentMessage::user("hi")];
        let body = ContentRequest {
            model: Some("m"),
            image_model: None,
            count: None,
            content: wire_messages(&messages),
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "model": "m",
                "content": [{ "role": "user", "parts": [{ "text": "hi" }] }]
            })
        );
    }
}
