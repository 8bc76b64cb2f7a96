use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Serialize;

use super::traits::{BasePublisher, PublishRequest, PublishedPost};

/// Categories and tags the blogging API insists on when none are given.
const FALLBACK_CATEGORY: &str = "General";
const FALLBACK_TAG: &str = "News";

/// HTTP client for the blogging REST service.
pub struct HttpBlogClient {
    base_url: String,
    client: reqwest::Client,
}

#[derive(Debug, Serialize)]
struct CreatePostBody<'a> {
    title: &'a str,
    content: &'a str,
    status: &'static str,
    categories: Vec<&'a str>,
    tags: Vec<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    image: Option<&'a super::traits::GeneratedImage>,
}

impl HttpBlogClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        })
    }
}

fn non_blank<'a>(values: &'a [String], fallback: &'static str) -> Vec<&'a str> {
    let kept: Vec<&str> = values
        .iter()
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
        .collect();
    if kept.is_empty() {
        vec![fallback]
    } else {
        kept
    }
}

fn create_post_body(request: &PublishRequest) -> CreatePostBody<'_> {
    let title = request.title.trim();
    CreatePostBody {
        title: if title.is_empty() { "Untitled" } else { title },
        content: if request.content_html.is_empty() {
            "<p></p>"
        } else {
            &request.content_html
        },
        status: "publish",
        categories: non_blank(&request.categories, FALLBACK_CATEGORY),
        tags: non_blank(&request.tags, FALLBACK_TAG),
        image: request.image.as_ref(),
    }
}

#[async_trait]
impl BasePublisher for HttpBlogClient {
    async fn publish(&self, request: &PublishRequest) -> Result<PublishedPost> {
        let response = self
            .client
            .post(format!("{}/posts/create-post/", self.base_url))
            .json(&create_post_body(request))
            .send()
            .await
            .context("Failed to send publish request")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Blog API error {}: {}", status, body);
        }

        response
            .json()
            .await
            .context("Failed to parse publish response")
    }
}
