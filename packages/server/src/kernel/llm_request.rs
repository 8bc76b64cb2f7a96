// Generation prompts and the retrying text-generation helper.
//
// Callers hand in whatever shape they have (plain text, a message list or a
// full request); it is normalized once into a `GenerationRequest` before any
// network call happens.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use super::backoff::jittered_backoff;
use super::traits::BaseTextGenerator;

/// Errors from the generation contract.
///
/// `QuotaExceeded` is a circuit-breaker signal: retrying makes it worse, so
/// callers stop instead of backing off.
#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("generation quota exceeded: {0}")]
    QuotaExceeded(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl GenerationError {
    pub fn is_quota(&self) -> bool {
        matches!(self, GenerationError::QuotaExceeded(_))
    }
}

const QUOTA_KEYWORDS: [&str; 6] = [
    "quota",
    "rate limit",
    "exceeded",
    "token limit",
    "billing",
    "overuse",
];

/// True when an error message from a provider reads like resource exhaustion.
pub fn is_quota_message(message: &str) -> bool {
    let lower = message.to_lowercase();
    lower.contains("429") || QUOTA_KEYWORDS.iter().any(|kw| lower.contains(kw))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Model,
    System,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentMessage {
    pub role: Role,
    pub parts: Vec<String>,
}

impl ContentMessage {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            parts: vec![text.into()],
        }
    }

    pub fn system(text: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            parts: vec![text.into()],
        }
    }
}

/// Canonical request sent to a text generator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub model: String,
    pub messages: Vec<ContentMessage>,
}

/// Every accepted prompt shape.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GenerationPrompt {
    Text(String),
    Messages(Vec<ContentMessage>),
    Request(GenerationRequest),
}

impl GenerationPrompt {
    /// Collapse into one request: fill in the model, trim parts, drop blank
    /// parts and messages left with no parts. Fails when nothing remains.
    pub fn normalize(self, default_model: &str) -> Result<GenerationRequest, GenerationError> {
        let (model, messages) = match self {
            GenerationPrompt::Text(text) => {
                (default_model.to_string(), vec![ContentMessage::user(text)])
            }
            GenerationPrompt::Messages(messages) => (default_model.to_string(), messages),
            GenerationPrompt::Request(request) => {
                let model = if request.model.trim().is_empty() {
                    default_model.to_string()
                } else {
                    request.model
                };
                (model, request.messages)
            }
        };

        let messages: Vec<ContentMessage> = messages
            .into_iter()
            .filter_map(|message| {
                let parts: Vec<String> = message
                    .parts
                    .into_iter()
                    .map(|part| part.trim().to_string())
                    .filter(|part| !part.is_empty())
                    .collect();
                (!parts.is_empty()).then_some(ContentMessage {
                    role: message.role,
                    parts,
                })
            })
            .collect();

        if messages.is_empty() {
            return Err(anyhow::anyhow!("prompt is empty after normalization").into());
        }

        Ok(GenerationRequest { model, messages })
    }
}

impl From<&str> for GenerationPrompt {
    fn from(text: &str) -> Self {
        GenerationPrompt::Text(text.to_string())
    }
}

impl From<String> for GenerationPrompt {
    fn from(text: String) -> Self {
        GenerationPrompt::Text(text)
    }
}

impl From<Vec<ContentMessage>> for GenerationPrompt {
    fn from(messages: Vec<ContentMessage>) -> Self {
        GenerationPrompt::Messages(messages)
    }
}

impl From<GenerationRequest> for GenerationPrompt {
    fn from(request: GenerationRequest) -> Self {
        GenerationPrompt::Request(request)
    }
}

/// Call `generate_text` up to `max_retries` times with jittered backoff
/// between attempts. Empty replies count as failures. Quota errors are
/// returned at once.
pub async fn generate_text_with_retry(
    generator: &dyn BaseTextGenerator,
    prompt: impl Into<GenerationPrompt>,
    max_retries: u32,
    cap: Duration,
) -> Result<String, GenerationError> {
    let request = prompt.into().normalize(generator.default_model())?;
    let attempts = max_retries.max(1);
    let mut last_error = None;

    for attempt in 0..attempts {
        match generator.generate_text(&request).await {
            Ok(text) if !text.trim().is_empty() => return Ok(text),
            Ok(_) => {
                warn!(attempt, model = %request.model, "generation returned empty text");
                last_error = Some(GenerationError::Other(anyhow::anyhow!(
                    "generation returned empty text"
                )));
            }
            Err(e) if e.is_quota() => return Err(e),
            Err(e) => {
                warn!(attempt, model = %request.model, error = %e, "generation attempt failed");
                last_error = Some(e);
            }
        }

        if attempt + 1 < attempts {
            tokio::time::sleep(jittered_backoff(attempt, cap)).await;
        }
    }

    Err(last_error
        .unwrap_or_else(|| GenerationError::Other(anyhow::anyhow!("generation failed"))))
}
