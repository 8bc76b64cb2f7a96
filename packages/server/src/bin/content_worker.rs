//! Work-item worker
//!
//! Claims queued work items (`plan_next`, `write_and_post`, `echo`) and runs
//! them until ctrl-c. Run one per replica; replicas compete through the
//! queue's skip-locked claim.

use std::sync::Arc;

use anyhow::{Context, Result};
use autopost_core::common::init_tracing;
use autopost_core::domains::content::register_content_handlers;
use autopost_core::kernel::jobs::{
    PostgresWorkItemQueue, WorkItemQueue, WorkItemRegistry, WorkItemRunner, WorkItemRunnerConfig,
};
use autopost_core::kernel::{
    GenerationSettings, HttpBlogClient, HttpGenerationClient, RetryPolicy, ServerDeps,
};
use autopost_core::Config;
use sqlx::postgres::PgPoolOptions;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let config = Config::from_env().context("Failed to load configuration")?;

    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&config.database_url)
        .await
        .context("Failed to connect to database")?;

    let generator = Arc::new(
        HttpGenerationClient::new(
            &config.generation_api_base,
            &config.generation_model,
            config.http_timeout,
        )
        .context("Failed to build the generation client")?,
    );
    let publisher = Arc::new(
        HttpBlogClient::new(&config.blog_api_base, config.http_timeout)
            .context("Failed to build the blog client")?,
    );
    let queue: Arc<dyn WorkItemQueue> = Arc::new(PostgresWorkItemQueue::new(pool));

    let deps = Arc::new(ServerDeps::new(
        queue.clone(),
        generator.clone(),
        generator,
        publisher,
        GenerationSettings {
            max_retries: config.step_max_retries,
            max_backoff: config.step_max_backoff,
            image_count: config.image_count,
        },
    ));

    let mut registry = WorkItemRegistry::new();
    register_content_handlers(&mut registry);

    let runner = WorkItemRunner::new(
        queue,
        Arc::new(registry),
        deps,
        WorkItemRunnerConfig {
            poll_interval: config.worker_poll_interval,
            retry_policy: RetryPolicy::Exponential {
                cap: config.worker_retry_cap,
            },
            ..Default::default()
        },
    );

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                tracing::info!("shutdown requested, finishing the current item");
                signal.cancel();
            }
            Err(e) => tracing::error!(error = %e, "failed to listen for ctrl-c"),
        }
    });

    runner.run(shutdown).await
}
