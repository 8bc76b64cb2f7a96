//! Work-item handlers of the content pipeline.
//!
//! ```text
//! series.enqueue_due (cron)
//!     └─► plan_next        outline + title for the next episode
//!             └─► write_and_post   body, optional image, publish
//! ```

use std::sync::Arc;

use anyhow::{Context, Result};
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::kernel::jobs::{NewWorkItem, WorkItemRegistry};
use crate::kernel::{generate_text_with_retry, ContentMessage, PublishRequest, ServerDeps};

pub const ECHO: &str = "echo";
pub const PLAN_NEXT: &str = "plan_next";
pub const WRITE_AND_POST: &str = "write_and_post";

lazy_static! {
    static ref H1_RE: Regex = Regex::new(r"(?is)<h1[^>]*>(.*?)</h1>").unwrap();
    static ref TAG_RE: Regex = Regex::new(r"(?s)<[^>]+>").unwrap();
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Echo {
    #[serde(default)]
    pub n: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanNext {
    pub series_id: i64,
    pub episode_no: i32,
    pub series_title: String,
    pub seed_topic: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WriteAndPost {
    pub series_id: i64,
    pub episode_no: i32,
    pub planned_title: String,
    pub outline: String,
    pub seed_topic: String,
}

/// Register every content handler.
pub fn register_content_handlers(registry: &mut WorkItemRegistry) {
    registry.register::<Echo, _, _>(ECHO, |payload, _deps| async move { echo(payload).await });
    registry.register::<PlanNext, _, _>(PLAN_NEXT, |payload, deps| async move {
        plan_next(payload, deps).await
    });
    registry.register::<WriteAndPost, _, _>(WRITE_AND_POST, |payload, deps| async move {
        write_and_post(payload, deps).await
    });
}

pub async fn echo(payload: Echo) -> Result<()> {
    info!(n = payload.n, "echo");
    Ok(())
}

/// Plan the episode and enqueue its `write_and_post` item.
pub async fn plan_next(payload: PlanNext, deps: Arc<ServerDeps>) -> Result<()> {
    let prompt = vec![
        ContentMessage::system(
            "You plan episodes of a blog series. Reply with one line \
             `TITLE: <title>` followed by a short bullet outline.",
        ),
        ContentMessage::user(format!(
            "Series: {}\nSeed topic: {}\nEpisode number: {}",
            payload.series_title, payload.seed_topic, payload.episode_no
        )),
    ];

    let reply = generate_text_with_retry(
        deps.text_generator.as_ref(),
        prompt,
        deps.generation.max_retries,
        deps.generation.max_backoff,
    )
    .await
    .context("outline generation failed")?;

    let fallback = format!("{} #{}", payload.series_title, payload.episode_no);
    let (planned_title, outline) = parse_outline(&reply, &fallback);

    let next = WriteAndPost {
        series_id: payload.series_id,
        episode_no: payload.episode_no,
        planned_title,
        outline,
        seed_topic: payload.seed_topic,
    };
    let id = deps
        .queue
        .enqueue(
            NewWorkItem::builder()
                .kind(WRITE_AND_POST)
                .payload(serde_json::to_value(&next)?)
                .build(),
        )
        .await?;

    info!(
        series_id = next.series_id,
        episode_no = next.episode_no,
        work_item_id = %id,
        "episode planned"
    );
    Ok(())
}

/// Write the episode body, attach an image when configured, and publish.
pub async fn write_and_post(payload: WriteAndPost, deps: Arc<ServerDeps>) -> Result<()> {
    let prompt = vec![
        ContentMessage::system(
            "Write a blog post in HTML. Start with an <h1> title, then the body.",
        ),
        ContentMessage::user(format!(
            "Title: {}\nOutline:\n{}",
            payload.planned_title, payload.outline
        )),
    ];

    let html = generate_text_with_retry(
        deps.text_generator.as_ref(),
        prompt,
        deps.generation.max_retries,
        deps.generation.max_backoff,
    )
    .await
    .context("body generation failed")?;

    let (title, content_html) = split_title(&html, &payload.planned_title);

    let image = if deps.generation.image_count > 0 {
        match deps
            .image_generator
            .generate_images(&title, deps.generation.image_count)
            .await
        {
            Ok(images) => images.into_iter().next(),
            Err(e) if e.is_quota() => return Err(e.into()),
            Err(e) => {
                warn!(series_id = payload.series_id, error = %e, "image generation failed, posting without image");
                None
            }
        }
    } else {
        None
    };

    let request = PublishRequest {
        title,
        content_html,
        categories: vec![payload.seed_topic.clone()],
        tags: Vec::new(),
        image,
    };
    let post = deps
        .publisher
        .publish(&request)
        .await
        .context("publish failed")?;

    info!(
        series_id = payload.series_id,
        episode_no = payload.episode_no,
        post_id = post.id,
        link = post.link.as_deref().unwrap_or(""),
        "episode published"
    );
    Ok(())
}

/// `TITLE: ...` line and the remaining outline; the title falls back when
/// the reply has none.
pub fn parse_outline(reply: &str, fallback_title: &str) -> (String, String) {
    let mut title = None;
    let mut outline = Vec::new();
    for line in reply.lines() {
        let trimmed = line.trim();
        let is_title = trimmed
            .get(..6)
            .map(|p| p.eq_ignore_ascii_case("TITLE:"))
            .unwrap_or(false);
        if title.is_none() && is_title {
            title = Some(trimmed[6..].trim().to_string()).filter(|t| !t.is_empty());
        } else {
            outline.push(line);
        }
    }
    let title = title.unwrap_or_else(|| fallback_title.to_string());
    (title, outline.join("\n").trim().to_string())
}

/// Pull the first `<h1>` out of generated HTML as the post title.
pub fn split_title(html: &str, fallback_title: &str) -> (String, String) {
    let Some(caps) = H1_RE.captures(html) else {
        return (fallback_title.to_string(), html.trim().to_string());
    };
    let title = TAG_RE.replace_all(&caps[1], "").trim().to_string();
    let body = H1_RE.replace(html, "").trim().to_string();
    if title.is_empty() {
        (fallback_title.to_string(), body)
    } else {
        (title, body)
    }
}
