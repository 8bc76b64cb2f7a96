use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Decision {
    Claim,
    Skip,
}

impl Decision {
    /// `CLAIM` (any case) claims; everything else skips.
    pub fn parse_lenient(raw: &str) -> Self {
        if raw.trim().eq_ignore_ascii_case("CLAIM") {
            Decision::Claim
        } else {
            Decision::Skip
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Decision::Claim => "CLAIM",
            Decision::Skip => "SKIP",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScreeningDecision {
    pub decision: Decision,
    pub score: i64,
    pub reason: String,
}

impl ScreeningDecision {
    pub fn claim(score: i64, reason: impl Into<String>) -> Self {
        Self {
            decision: Decision::Claim,
            score,
            reason: reason.into(),
        }
    }

    pub fn skip(score: i64, reason: impl Into<String>) -> Self {
        Self {
            decision: Decision::Skip,
            score,
            reason: reason.into(),
        }
    }
}

/// `QuotaExceeded` stops the screening loop; `Other` is annotated onto the
/// topic and the loop carries on.
#[derive(Debug, Error)]
pub enum ScreeningError {
    #[error("screening quota exceeded: {0}")]
    QuotaExceeded(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Decides whether a topic is worth writing about.
#[async_trait]
pub trait BaseScreener: Send + Sync {
    async fn classify(
        &self,
        title: &str,
        summary: Option<&str>,
    ) -> Result<ScreeningDecision, ScreeningError>;
}
