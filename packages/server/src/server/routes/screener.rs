//! Screener loop control.

use std::time::Duration;

use axum::{
    extract::{Extension, Query},
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::domains::screener::RunnerStatus;
use crate::server::app::AppState;
use crate::server::error::ApiError;

/// Smallest idle wait accepted from a caller, in seconds.
pub const MIN_IDLE_SECS: f64 = 0.1;

#[derive(Debug, Default, Deserialize)]
pub struct StartScreenerQuery {
    pub idle_min: Option<f64>,
    pub idle_max: Option<f64>,
}

impl StartScreenerQuery {
    /// Resolve against the configured defaults and validate.
    pub fn resolve(&self, defaults: (Duration, Duration)) -> Result<(Duration, Duration), ApiError> {
        let idle_min = self.idle_min.unwrap_or(defaults.0.as_secs_f64());
        let idle_max = self.idle_max.unwrap_or(defaults.1.as_secs_f64());

        for (name, value) in [("idle_min", idle_min), ("idle_max", idle_max)] {
            if !value.is_finite() || value < MIN_IDLE_SECS {
                return Err(ApiError::BadRequest(format!(
                    "{} must be at least {}",
                    name, MIN_IDLE_SECS
                )));
            }
        }
        if idle_max < idle_min {
            return Err(ApiError::BadRequest(
                "idle_max must be >= idle_min".to_string(),
            ));
        }
        Ok((to_duration("idle_min", idle_min)?, to_duration("idle_max", idle_max)?))
    }
}

fn to_duration(name: &str, secs: f64) -> Result<Duration, ApiError> {
    Duration::try_from_secs_f64(secs)
        .map_err(|_| ApiError::BadRequest(format!("{} is out of range", name)))
}

pub async fn screener_status(Extension(state): Extension<AppState>) -> Json<RunnerStatus> {
    Json(state.screener_runner.status())
}

pub async fn screener_start(
    Extension(state): Extension<AppState>,
    Query(query): Query<StartScreenerQuery>,
) -> Result<Json<Value>, ApiError> {
    let (idle_min, idle_max) =
        query.resolve((state.screener_idle_min, state.screener_idle_max))?;

    if !state
        .screener_runner
        .start(state.screener.clone(), idle_min, idle_max)
    {
        return Err(ApiError::Conflict("screener already running".to_string()));
    }
    Ok(Json(json!({ "ok": true, "status": state.screener_runner.status() })))
}

pub async fn screener_stop(Extension(state): Extension<AppState>) -> Result<Json<Value>, ApiError> {
    if !state.screener_runner.stop().await {
        return Err(ApiError::Conflict("screener not running".to_string()));
    }
    Ok(Json(json!({ "ok": true, "status": state.screener_runner.status() })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;

    const DEFAULTS: (Duration, Duration) = (Duration::from_secs(2), Duration::from_secs(60));

    #[test]
    fn defaults_apply_when_absent() {
        let (min, max) = StartScreenerQuery::default().resolve(DEFAULTS).unwrap();
        assert_eq!(min, Duration::from_secs(2));
        assert_eq!(max, Duration::from_secs(60));
    }

    #[test]
    fn max_below_min_is_rejected() {
        let query = StartScreenerQuery {
            idle_min: Some(5.0),
            idle_max: Some(1.0),
        };
        assert_eq!(query.resolve(DEFAULTS).unwrap_err().status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn huge_waits_are_rejected() {
        let query = StartScreenerQuery {
            idle_min: None,
            idle_max: Some(1e300),
        };
        assert_eq!(query.resolve(DEFAULTS).unwrap_err().status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn tiny_waits_are_rejected() {
        let query = StartScreenerQuery {
            idle_min: Some(0.01),
            idle_max: None,
        };
        assert!(query.resolve(DEFAULTS).is_err());
    }
}
