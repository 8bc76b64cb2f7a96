// Autopost - API Core
//
// Background machinery for an automated blogging pipeline: a work-item queue
// with retries, a cron job registry reconciled from the database, and a
// claim loop that screens collected news topics.

pub mod common;
pub mod config;
pub mod domains;
pub mod kernel;
pub mod server;

pub use config::*;
