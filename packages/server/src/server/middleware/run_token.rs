use axum::{
    body::Body,
    http::Request,
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::sync::Arc;
use tracing::warn;

use crate::server::error::ApiError;

pub const RUN_TOKEN_HEADER: &str = "x-run-token";

/// Run-token check for mutating admin routes
///
/// With no token configured every request passes. Otherwise the request must
/// carry `x-run-token` with exactly the configured value, or it gets a 401.
pub async fn run_token_middleware(
    expected: Option<Arc<str>>,
    request: Request<Body>,
    next: Next,
) -> Response {
    if let Some(expected) = expected.as_deref() {
        if !token_matches(&request, expected) {
            warn!(path = %request.uri().path(), "rejected request without a valid run token");
            return ApiError::Unauthorized.into_response();
        }
    }

    next.run(request).await
}

fn token_matches(request: &Request<Body>, expected: &str) -> bool {
    request
        .headers()
        .get(RUN_TOKEN_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(|value| value == expected)
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matching_token_passes() {
        let request = Request::builder()
            .header(RUN_TOKEN_HEADER, "s3cret")
            .body(Body::empty())
            .unwrap();
        assert!(token_matches(&request, "s3cret"));
    }

    #[test]
    fn wrong_or_missing_token_fails() {
        let request = Request::builder()
            .header(RUN_TOKEN_HEADER, "guess")
            .body(Body::empty())
            .unwrap();
        assert!(!token_matches(&request, "s3cret"));

        let request = Request::builder().body(Body::empty()).unwrap();
        assert!(!token_matches(&request, "s3cret"));
    }
}
