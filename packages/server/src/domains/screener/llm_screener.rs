//! Screener backed by the text-generation service.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use lazy_static::lazy_static;
use regex::Regex;
use serde_json::Value;

use super::screening::{BaseScreener, Decision, ScreeningDecision, ScreeningError};
use super::service::MAX_REASON_CHARS;
use crate::common::truncate_chars;
use crate::kernel::{
    generate_text_with_retry, is_quota_message, BaseTextGenerator, ContentMessage,
    GenerationError,
};

pub const DEFAULT_SCREENING_PROMPT: &str = "\
You screen news topics for a technical blog. Decide whether the topic below \
is worth a post.

Title: {title}
Summary: {summary}

Reply with JSON only:
{\"score\": <0-100>, \"decision\": \"CLAIM\" | \"SKIP\", \"reason\": \"<one sentence>\"}";

lazy_static! {
    static ref FENCE_RE: Regex = Regex::new(r"(?s)```(?:json)?\s*(.*?)```").unwrap();
}

pub struct LlmScreener {
    generator: Arc<dyn BaseTextGenerator>,
    template: String,
    max_retries: u32,
    max_backoff: Duration,
}

impl LlmScreener {
    pub fn new(generator: Arc<dyn BaseTextGenerator>, max_retries: u32, max_backoff: Duration) -> Self {
        Self {
            generator,
            template: DEFAULT_SCREENING_PROMPT.to_string(),
            max_retries,
            max_backoff,
        }
    }

    /// Replace the prompt; `{title}` and `{summary}` are substituted.
    pub fn with_template(mut self, template: impl Into<String>) -> Self {
        self.template = template.into();
        self
    }

    pub fn render_prompt(&self, title: &str, summary: Option<&str>) -> String {
        let summary = summary
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .unwrap_or("(no summary)");
        self.template
            .replace("{title}", title.trim())
            .replace("{summary}", summary)
    }
}

#[async_trait]
impl BaseScreener for LlmScreener {
    async fn classify(
        &self,
        title: &str,
        summary: Option<&str>,
    ) -> Result<ScreeningDecision, ScreeningError> {
        let prompt = vec![ContentMessage::user(self.render_prompt(title, summary))];
        let reply = generate_text_with_retry(
            self.generator.as_ref(),
            prompt,
            self.max_retries,
            self.max_backoff,
        )
        .await
        .map_err(|e| match e {
            GenerationError::QuotaExceeded(msg) => ScreeningError::QuotaExceeded(msg),
            GenerationError::Other(e) => ScreeningError::Other(e.context("screening call failed")),
        })?;

        if is_quota_message(&reply) && extract_json_object(&reply).is_err() {
            return Err(ScreeningError::QuotaExceeded(
                truncate_chars(reply.trim(), 200).to_string(),
            ));
        }

        parse_decision(&reply).map_err(ScreeningError::Other)
    }
}

/// First JSON object in a model reply: code fences are stripped, then the
/// text between the first `{` and the last `}` is parsed.
pub fn extract_json_object(reply: &str) -> anyhow::Result<Value> {
    let body = FENCE_RE
        .captures(reply)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str())
        .unwrap_or(reply);

    let start = body.find('{').ok_or_else(|| anyhow!("no JSON object in reply"))?;
    let end = body.rfind('}').ok_or_else(|| anyhow!("no JSON object in reply"))?;
    if end < start {
        return Err(anyhow!("no JSON object in reply"));
    }
    let value: Value =
        serde_json::from_str(&body[start..=end]).context("reply JSON does not parse")?;
    if !value.is_object() {
        return Err(anyhow!("reply JSON is not an object"));
    }
    Ok(value)
}

/// Lenient decoding: the score may be a number or numeric string, unknown
/// decisions become `SKIP`, the reason is capped.
pub fn parse_decision(reply: &str) -> anyhow::Result<ScreeningDecision> {
    let value = extract_json_object(reply)?;

    let score = match &value["score"] {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f.round() as i64))
            .unwrap_or(0),
        Value::String(s) => s.trim().parse::<f64>().map(|f| f.round() as i64).unwrap_or(0),
        _ => 0,
    };
    let decision = value["decision"]
        .as_str()
        .map(Decision::parse_lenient)
        .unwrap_or(Decision::Skip);
    let reason = value["reason"].as_str().unwrap_or_default().trim();

    Ok(ScreeningDecision {
        decision,
        score,
        reason: truncate_chars(reason, MAX_REASON_CHARS).to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::test_dependencies::{MockReply, MockTextGenerator};

    fn screener(replies: Vec<MockReply>) -> (LlmScreener, Arc<MockTextGenerator>) {
        let generator = Arc::new(MockTextGenerator::new(replies));
        (
            LlmScreener::new(generator.clone(), 1, Duration::from_millis(1)),
            generator,
        )
    }

    #[test]
    fn prompt_substitutes_title_and_summary() {
        let (s, _) = screener(vec![]);
        let s = s.with_template("T={title} S={summary}");
        assert_eq!(s.render_prompt(" Rust ", Some("fast")), "T=Rust S=fast");
        assert_eq!(s.render_prompt("Rust", Some("  ")), "T=Rust S=(no summary)");
        assert_eq!(s.render_prompt("Rust", None), "T=Rust S=(no summary)");
    }

    #[test]
    fn json_is_found_in_fences_and_prose() {
        let fenced = "```json\n{\"score\": 80, \"decision\": \"claim\", \"reason\": \"new\"}\n```";
        let d = parse_decision(fenced).unwrap();
        assert_eq!(d, ScreeningDecision::claim(80, "new"));

        let prose = "Sure! {\"score\": \"42\", \"decision\": \"MAYBE\"} hope that helps";
        let d = parse_decision(prose).unwrap();
        assert_eq!(d.decision, Decision::Skip);
        assert_eq!(d.score, 42);
        assert_eq!(d.reason, "");

        assert!(parse_decision("no json here").is_err());
        assert!(parse_decision("} backwards {").is_err());
    }

    #[test]
    fn long_reasons_are_capped() {
        let reply = format!(
            "{{\"score\": 1, \"decision\": \"SKIP\", \"reason\": \"{}\"}}",
            "r".repeat(1000)
        );
        let d = parse_decision(&reply).unwrap();
        assert_eq!(d.reason.chars().count(), MAX_REASON_CHARS);
    }

    #[tokio::test]
    async fn classify_maps_generation_quota() {
        let (s, _) = screener(vec![MockReply::Quota("HTTP 429".into())]);
        let err = s.classify("title", None).await.unwrap_err();
        assert!(matches!(err, ScreeningError::QuotaExceeded(_)));
    }

    #[tokio::test]
    async fn classify_maps_quota_text_in_reply() {
        let (s, _) = screener(vec![MockReply::Text(
            "Resource exhausted: daily quota exceeded".into(),
        )]);
        let err = s.classify("title", None).await.unwrap_err();
        assert!(matches!(err, ScreeningError::QuotaExceeded(_)));
    }

    #[tokio::test]
    async fn classify_parses_reply() {
        let (s, generator) = screener(vec![MockReply::Text(
            "{\"score\": 77, \"decision\": \"CLAIM\", \"reason\": \"timely\"}".into(),
        )]);
        let d = s.classify("Rust 2.0", Some("big release")).await.unwrap();
        assert_eq!(d, ScreeningDecision::claim(77, "timely"));

        let request = &generator.requests()[0];
        assert!(request.messages[0].parts[0].contains("Title: Rust 2.0"));
        assert!(request.messages[0].parts[0].contains("Summary: big release"));
    }

    #[tokio::test]
    async fn classify_reports_unparsable_reply_as_other() {
        let (s, _) = screener(vec![MockReply::Text("I cannot decide".into())]);
        let err = s.classify("title", None).await.unwrap_err();
        assert!(matches!(err, ScreeningError::Other(_)));
    }
}
