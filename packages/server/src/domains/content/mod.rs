//! Content series: the producer that plans episodes on a cadence and the
//! work-item handlers that write and publish them.

pub mod handlers;
pub mod models;
pub mod producer;

pub use handlers::{register_content_handlers, PlanNext, WriteAndPost, ECHO, PLAN_NEXT, WRITE_AND_POST};
pub use models::{Series, SeriesStatus};
pub use producer::{enqueue_due_series, plan_episode, ProducerSummary};
