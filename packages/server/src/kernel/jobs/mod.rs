//! Work-item queue: one-shot units of work consumed by competing workers.
//!
//! - [`WorkItemQueue`] - storage contract ([`PostgresWorkItemQueue`],
//!   [`InMemoryWorkItemQueue`])
//! - [`WorkItemRegistry`] - maps a `kind` to a typed handler
//! - [`WorkItemRunner`] - polls, executes, records the outcome
//!
//! # Architecture
//!
//! ```text
//! Producer (planner job, jobctl, admin API)
//!     └─► WorkItemQueue::enqueue  -> status = queued
//!
//! WorkItemRunner (one per worker process)
//!     ├─► claim_next              -> running (FOR UPDATE SKIP LOCKED)
//!     ├─► WorkItemRegistry::execute
//!     └─► mark_done / mark_failed -> done | queued (retry) | failed
//! ```
//!
//! Handlers live in their domains; this module only provides the machinery.

mod memory;
mod queue;
mod registry;
mod runner;
mod work_item;

pub use memory::InMemoryWorkItemQueue;
pub use queue::{insert_work_item, PostgresWorkItemQueue, WorkItemQueue};
pub use registry::{DispatchError, SharedWorkItemRegistry, WorkItemRegistry};
pub use runner::{WorkItemRunner, WorkItemRunnerConfig};
pub use work_item::{
    stored_error, FailureKind, NewWorkItem, WorkItem, WorkItemStatus, DEFAULT_MAX_ATTEMPTS,
    MAX_ERROR_CHARS,
};
