// Main entry point for the admin server

use std::sync::Arc;

use anyhow::{Context, Result};
use autopost_core::common::init_tracing;
use autopost_core::domains::scheduler::{
    register_builtin_jobs, JobExecutor, JobHandlerRegistry, PostgresJobStore, SchedulerHandle,
};
use autopost_core::domains::screener::{
    BaseScreener, LlmScreener, PostgresTopicStore, PreFilter, ScreenerRunner, TopicScreener,
};
use autopost_core::kernel::jobs::PostgresWorkItemQueue;
use autopost_core::kernel::{connect_lock, HttpGenerationClient};
use autopost_core::server::{build_app, AppState};
use autopost_core::Config;
use sqlx::postgres::PgPoolOptions;

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    tracing::info!("Starting autopost admin server");

    let config = Config::from_env().context("Failed to load configuration")?;

    tracing::info!("Connecting to database...");
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&config.database_url)
        .await
        .context("Failed to connect to database")?;

    tracing::info!("Running database migrations...");
    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .context("Failed to run migrations")?;

    let lock = connect_lock(config.redis_url.as_deref())
        .await
        .context("Failed to connect to the lock store")?;

    // Cron registry
    let mut handlers = JobHandlerRegistry::new();
    register_builtin_jobs(&mut handlers, pool.clone());
    let executor = Arc::new(JobExecutor::new(
        Arc::new(PostgresJobStore::new(pool.clone())),
        Arc::new(handlers),
        lock,
        config.cron_lock_ttl,
    ));
    let scheduler = Arc::new(SchedulerHandle::new(executor, config.reconcile_interval));
    scheduler.start().await.context("Failed to start the scheduler")?;

    // Topic screener (started on demand through the admin API)
    let generator = Arc::new(
        HttpGenerationClient::new(
            &config.generation_api_base,
            &config.generation_model,
            config.http_timeout,
        )
        .context("Failed to build the generation client")?,
    );
    let screener: Arc<dyn BaseScreener> = Arc::new(LlmScreener::new(
        generator,
        config.step_max_retries,
        config.step_max_backoff,
    ));
    let screener_runner = Arc::new(ScreenerRunner::new(Arc::new(TopicScreener::new(
        Arc::new(PostgresTopicStore::new(pool.clone())),
        PreFilter {
            min_title_len: config.min_title_len,
            min_summary_len: config.min_summary_len,
        },
    ))));

    let app = build_app(AppState {
        db_pool: pool.clone(),
        scheduler: scheduler.clone(),
        screener_runner: screener_runner.clone(),
        screener,
        queue: Arc::new(PostgresWorkItemQueue::new(pool)),
        screener_idle_min: config.screener_idle_min,
        screener_idle_max: config.screener_idle_max,
        run_token: config.run_token.as_deref().map(Arc::from),
    });

    let addr = format!("0.0.0.0:{}", config.port);
    tracing::info!("Starting server on {}", addr);
    tracing::info!("Health check: http://localhost:{}/health", config.port);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    tracing::info!("Shutting down background loops");
    screener_runner.stop().await;
    if let Err(e) = scheduler.stop().await {
        tracing::warn!(error = %e, "scheduler stop failed");
    }

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
}
