//! Claim loop over `new` topics.
//!
//! One call to [`TopicScreener::process_one`] handles at most one topic:
//! pick the oldest `new` row, pre-filter it locally, classify it, then move
//! it to `claimed` or `skipped` with a conditional update. Losing that update
//! to another screener is a conflict, not an error.

use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use serde_json::{json, Value};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::models::{Topic, TopicStatus};
use super::screening::{BaseScreener, Decision, ScreeningDecision, ScreeningError};
use super::store::TopicStore;
use crate::common::truncate_chars;
use crate::kernel::IdleBackoff;

pub const DEFAULT_MIN_TITLE_LEN: usize = 8;
pub const DEFAULT_MIN_SUMMARY_LEN: usize = 0;

/// Screener reasons stored on a topic are cut to this many characters.
pub const MAX_REASON_CHARS: usize = 400;

const FALLBACK_SKIP_REASON: &str = "skipped by screener";

#[derive(Debug, Error)]
pub enum ProcessError {
    /// Circuit breaker: the driving loop stops on this.
    #[error("screening quota exceeded: {0}")]
    QuotaExceeded(String),

    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

/// Tally of one or more `process_one` calls. All zero means idle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ProcessCounters {
    pub processed: u64,
    pub skipped: u64,
    pub claimed: u64,
    pub posted: u64,
    pub conflict: u64,
    pub errors: u64,
}

impl ProcessCounters {
    pub fn is_idle(&self) -> bool {
        *self == Self::default()
    }

    /// Nothing moved: the only outcome was a classification error.
    pub fn is_error_only(&self) -> bool {
        self.errors > 0 && self.skipped == 0 && self.claimed == 0 && self.conflict == 0
    }

    pub fn add(&mut self, other: &ProcessCounters) {
        self.processed += other.processed;
        self.skipped += other.skipped;
        self.claimed += other.claimed;
        self.posted += other.posted;
        self.conflict += other.conflict;
        self.errors += other.errors;
    }
}

/// Why the driving loop returned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopExit {
    Stopped,
    QuotaExceeded(String),
}

/// Cheap local checks run before the classifier is called.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PreFilter {
    pub min_title_len: usize,
    pub min_summary_len: usize,
}

impl Default for PreFilter {
    fn default() -> Self {
        Self {
            min_title_len: DEFAULT_MIN_TITLE_LEN,
            min_summary_len: DEFAULT_MIN_SUMMARY_LEN,
        }
    }
}

impl PreFilter {
    /// Reason to skip without classifying, if any. An absent or empty
    /// summary passes.
    pub fn reject_reason(&self, title: &str, summary: Option<&str>) -> Option<String> {
        if title.trim().chars().count() < self.min_title_len {
            return Some("title too short".to_string());
        }
        match summary {
            Some(s) if !s.is_empty() && s.trim().chars().count() < self.min_summary_len => {
                Some("summary too short".to_string())
            }
            _ => None,
        }
    }
}

pub struct TopicScreener {
    store: Arc<dyn TopicStore>,
    prefilter: PreFilter,
}

impl TopicScreener {
    pub fn new(store: Arc<dyn TopicStore>, prefilter: PreFilter) -> Self {
        Self { store, prefilter }
    }

    pub fn store(&self) -> &Arc<dyn TopicStore> {
        &self.store
    }

    /// Screen the oldest `new` topic, if there is one.
    ///
    /// A quota error from the classifier leaves the topic `new` and comes back
    /// as [`ProcessError::QuotaExceeded`]. Any other classifier error is
    /// annotated onto the topic, which stays `new`.
    pub async fn process_one(
        &self,
        screener: &dyn BaseScreener,
    ) -> Result<ProcessCounters, ProcessError> {
        let mut counters = ProcessCounters::default();
        let Some(topic) = self.store.fetch_oldest_new().await? else {
            return Ok(counters);
        };

        if let Some(reason) = self
            .prefilter
            .reject_reason(&topic.title, topic.summary.as_deref())
        {
            debug!(topic_id = topic.id, %reason, "topic rejected by pre-filter");
            let verdict = ScreeningDecision::skip(0, reason);
            self.finish(&topic, &verdict, &mut counters).await?;
            return Ok(counters);
        }

        let verdict = match screener
            .classify(&topic.title, topic.summary.as_deref())
            .await
        {
            Ok(verdict) => verdict,
            Err(ScreeningError::QuotaExceeded(msg)) => {
                return Err(ProcessError::QuotaExceeded(msg));
            }
            Err(ScreeningError::Other(e)) => {
                warn!(topic_id = topic.id, error = %e, "screening failed");
                self.store
                    .annotate_error(topic.id, "screen", &format!("screening_error: {:#}", e))
                    .await?;
                counters.processed += 1;
                counters.errors += 1;
                return Ok(counters);
            }
        };

        self.finish(&topic, &verdict, &mut counters).await?;
        Ok(counters)
    }

    async fn finish(
        &self,
        topic: &Topic,
        verdict: &ScreeningDecision,
        counters: &mut ProcessCounters,
    ) -> Result<(), ProcessError> {
        let (to, meta) = match verdict.decision {
            Decision::Claim => (TopicStatus::Claimed, screener_meta(verdict, None)),
            Decision::Skip => {
                let reason = if verdict.reason.trim().is_empty() {
                    FALLBACK_SKIP_REASON
                } else {
                    verdict.reason.as_str()
                };
                (TopicStatus::Skipped, screener_meta(verdict, Some(reason)))
            }
        };

        counters.processed += 1;
        if !self.store.transition_from_new(topic.id, to, meta).await? {
            info!(topic_id = topic.id, "topic already taken by another screener");
            counters.conflict += 1;
            return Ok(());
        }

        match to {
            TopicStatus::Claimed => {
                info!(topic_id = topic.id, score = verdict.score, "topic claimed");
                counters.claimed += 1;
            }
            _ => {
                info!(topic_id = topic.id, score = verdict.score, reason = %verdict.reason, "topic skipped");
                counters.skipped += 1;
            }
        }
        Ok(())
    }

    /// Call [`process_one`](Self::process_one) until `stop` is cancelled or
    /// the classifier runs out of quota.
    ///
    /// Idle polls and error-only polls wait `backoff.advance()`, interruptible
    /// by `stop`; any topic actually moved resets the backoff.
    pub async fn run_loop(
        &self,
        screener: &dyn BaseScreener,
        stop: &CancellationToken,
        mut backoff: IdleBackoff,
    ) -> LoopExit {
        info!(
            idle_min = ?backoff.current(),
            "screener loop started"
        );
        while !stop.is_cancelled() {
            let counters = match self.process_one(screener).await {
                Ok(counters) => counters,
                Err(ProcessError::QuotaExceeded(msg)) => {
                    error!(error = %msg, "screener stopped: quota exceeded");
                    return LoopExit::QuotaExceeded(msg);
                }
                Err(ProcessError::Store(e)) => {
                    error!(error = %format!("{:#}", e), "screener poll failed");
                    ProcessCounters::default()
                }
            };

            if counters.is_idle() || counters.is_error_only() {
                let wait = backoff.advance();
                debug!(?wait, "screener idle");
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = tokio::time::sleep(wait) => {}
                }
            } else {
                backoff.reset();
            }
        }
        info!("screener loop stopped");
        LoopExit::Stopped
    }
}

fn screener_meta(verdict: &ScreeningDecision, final_reason: Option<&str>) -> Value {
    let mut meta = json!({
        "score": verdict.score,
        "decision": verdict.decision.as_str(),
        "reason": truncate_chars(&verdict.reason, MAX_REASON_CHARS),
        "final_decision": verdict.decision.as_str(),
        "ts": Utc::now().timestamp(),
    });
    if let Some(reason) = final_reason {
        meta["final_reason"] = json!(truncate_chars(reason, MAX_REASON_CHARS));
    }
    meta
}
