//! Kernel module - shared primitives and infrastructure dependencies.

pub mod backoff;
pub mod blog_client;
pub mod cadence;
pub mod deps;
pub mod generation_client;
pub mod jobs;
pub mod llm_request;
pub mod lock;
pub mod test_dependencies;
pub mod traits;

pub use backoff::{jittered_backoff, IdleBackoff, RetryPolicy};
pub use blog_client::HttpBlogClient;
pub use cadence::{Cadence, CadenceError};
pub use deps::{GenerationSettings, ServerDeps};
pub use generation_client::HttpGenerationClient;
pub use llm_request::{
    generate_text_with_retry, is_quota_message, ContentMessage, GenerationError, GenerationPrompt,
    GenerationRequest, Role,
};
pub use lock::{connect_lock, LocalLock, LockBackend, LockGuard, NamedLock, RedisLock};
pub use test_dependencies::TestDependencies;
pub use traits::*;
