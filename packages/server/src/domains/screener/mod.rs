//! Topic screener: a claim loop over collected news topics.
//!
//! ```text
//! topics (status = new)
//!     └─► TopicScreener::process_one ── pre-filter ── BaseScreener::classify
//!             └─► WHERE status = 'new' ─► claimed | skipped | conflict
//! ```
//!
//! [`ScreenerRunner`] owns the background loop behind the admin routes.

pub mod llm_screener;
pub mod models;
pub mod runner;
pub mod screening;
pub mod service;
pub mod store;
pub mod testing;

pub use llm_screener::{extract_json_object, parse_decision, LlmScreener, DEFAULT_SCREENING_PROMPT};
pub use models::{NewTopic, Topic, TopicStatus};
pub use runner::{RunnerState, RunnerStatus, ScreenerRunner};
pub use screening::{BaseScreener, Decision, ScreeningDecision, ScreeningError};
pub use service::{
    LoopExit, PreFilter, ProcessCounters, ProcessError, TopicScreener, DEFAULT_MIN_SUMMARY_LEN,
    DEFAULT_MIN_TITLE_LEN, MAX_REASON_CHARS,
};
pub use store::{InMemoryTopicStore, PostgresTopicStore, TopicStore, MAX_ANNOTATION_CHARS};
