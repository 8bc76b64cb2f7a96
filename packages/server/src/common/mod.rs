// Common helpers shared across the application

pub mod telemetry;
pub mod text;

pub use telemetry::init_tracing;
pub use text::truncate_chars;
