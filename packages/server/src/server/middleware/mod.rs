// HTTP middleware
pub mod run_token;

pub use run_token::*;
