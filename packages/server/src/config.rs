use anyhow::{Context, Result};
use dotenvy::dotenv;
use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    /// Unset means the process-local lock
    pub redis_url: Option<String>,
    pub port: u16,
    /// When set, mutating admin routes require `x-run-token`
    pub run_token: Option<String>,
    pub generation_api_base: String,
    pub generation_model: String,
    pub blog_api_base: String,
    pub http_timeout: Duration,
    pub step_max_retries: u32,
    pub step_max_backoff: Duration,
    pub image_count: u32,
    pub reconcile_interval: Duration,
    pub cron_lock_ttl: Duration,
    pub worker_poll_interval: Duration,
    pub worker_retry_cap: Duration,
    pub min_title_len: usize,
    pub min_summary_len: usize,
    pub screener_idle_min: Duration,
    pub screener_idle_max: Duration,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (development)
        let _ = dotenv();

        Ok(Self {
            database_url: env::var("DATABASE_URL").context("DATABASE_URL must be set")?,
            redis_url: optional("REDIS_URL"),
            port: parsed("PORT", 8080)?,
            run_token: optional("RUN_TOKEN"),
            generation_api_base: env::var("GENERATION_API_BASE")
                .unwrap_or_else(|_| "http://localhost:8001".to_string()),
            generation_model: env::var("GENERATION_MODEL")
                .unwrap_or_else(|_| "gemini-2.5-flash".to_string()),
            blog_api_base: env::var("BLOG_API_BASE")
                .unwrap_or_else(|_| "http://localhost:32552".to_string()),
            http_timeout: Duration::from_secs(parsed("HTTP_TIMEOUT_SECS", 180)?),
            step_max_retries: parsed("STEP_MAX_RETRIES", 3)?,
            step_max_backoff: Duration::from_secs(parsed("STEP_MAX_BACKOFF_SECS", 20)?),
            image_count: parsed("IMAGE_COUNT", 1)?,
            reconcile_interval: Duration::from_secs(parsed("RECONCILE_INTERVAL_SECS", 30)?),
            cron_lock_ttl: Duration::from_secs(parsed("CRON_LOCK_TTL_SECS", 900)?),
            worker_poll_interval: Duration::from_millis(parsed("WORKER_POLL_INTERVAL_MS", 2000)?),
            worker_retry_cap: Duration::from_secs(parsed("WORKER_RETRY_CAP_SECS", 300)?),
            min_title_len: parsed("MIN_TITLE_LEN", 8)?,
            min_summary_len: parsed("MIN_SUMMARY_LEN", 0)?,
            screener_idle_min: Duration::from_secs_f64(parsed("SCREENER_IDLE_MIN_SECS", 2.0)?),
            screener_idle_max: Duration::from_secs_f64(parsed("SCREENER_IDLE_MAX_SECS", 60.0)?),
        })
    }
}

/// Unset and blank both mean "not configured".
fn optional(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn parsed<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match optional(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("{} must be a valid number", key)),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parsed_falls_back_and_rejects_garbage() {
        assert_eq!(parsed::<u32>("AUTOPOST_TEST_UNSET_VAR", 7).unwrap(), 7);

        env::set_var("AUTOPOST_TEST_BAD_NUMBER", "seven");
        assert!(parsed::<u32>("AUTOPOST_TEST_BAD_NUMBER", 7).is_err());

        env::set_var("AUTOPOST_TEST_GOOD_NUMBER", " 12 ");
        assert_eq!(parsed::<u32>("AUTOPOST_TEST_GOOD_NUMBER", 7).unwrap(), 12);
    }

    #[test]
    fn blank_optional_is_none() {
        env::set_var("AUTOPOST_TEST_BLANK", "  ");
        assert_eq!(optional("AUTOPOST_TEST_BLANK"), None);
    }
}
