// Business domains
pub mod content;
pub mod scheduler;
pub mod screener;
