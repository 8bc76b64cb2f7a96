//! Operator CLI for the queue and the cron registry
//!
//! Every command prints one JSON document on stdout.

use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use serde::Serialize;
use serde_json::{json, Value};
use sqlx::PgPool;
use uuid::Uuid;

use autopost_core::common::init_tracing;
use autopost_core::config::Config;
use autopost_core::domains::scheduler::{
    register_builtin_jobs, JobDefinition, JobExecutor, JobHandlerRegistry, JobRun,
    NewJobDefinition, PostgresJobStore,
};
use autopost_core::kernel::connect_lock;
use autopost_core::kernel::jobs::{NewWorkItem, PostgresWorkItemQueue, WorkItemQueue};

#[derive(Parser)]
#[command(name = "jobctl")]
#[command(about = "Work-item queue and cron job operations")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Apply pending schema migrations
    Migrate,

    /// Enqueue a work item
    Enqueue {
        kind: String,
        /// JSON payload
        #[arg(long, default_value = "{}")]
        payload: String,
        #[arg(long, default_value_t = 3)]
        max_attempts: i32,
        /// Seconds before the item becomes claimable
        #[arg(long)]
        delay_secs: Option<u64>,
    },

    /// Look up a work item
    Show { id: Uuid },

    /// Put items stuck in `running` back in the queue
    RequeueStale {
        /// Only items started at least this long ago
        #[arg(long, default_value_t = 3600)]
        older_than_secs: u64,
    },

    /// Create or update a cron job definition
    Define {
        id: String,
        #[arg(long)]
        func_key: String,
        /// Five-field cron or DAILY@H[:MM]
        #[arg(long)]
        cron: String,
        #[arg(long)]
        name: Option<String>,
        /// JSON params handed to the handler
        #[arg(long)]
        params: Option<String>,
        #[arg(long)]
        lock_key: Option<String>,
        #[arg(long)]
        disabled: bool,
    },

    /// Enable or disable a cron job
    SetEnabled { id: String, enabled: bool },

    /// List cron job definitions
    Jobs,

    /// Run a cron job now, with the same lock and run record as a scheduled fire
    RunNow {
        id: String,
        /// JSON params replacing the stored ones for this run
        #[arg(long)]
        params: Option<String>,
    },

    /// Recent cron runs, newest first
    Runs {
        #[arg(long, default_value_t = 20)]
        limit: i64,
        #[arg(long)]
        job: Option<String>,
    },
}

fn output<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn parse_json(raw: &str, what: &str) -> Result<Value> {
    serde_json::from_str(raw).with_context(|| format!("{} must be valid JSON", what))
}

async fn get_pool(config: &Config) -> Result<PgPool> {
    PgPool::connect(&config.database_url)
        .await
        .context("Failed to connect to database")
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing();

    let config = Config::from_env().context("Failed to load configuration")?;
    let pool = get_pool(&config).await?;

    match cli.command {
        Commands::Migrate => cmd_migrate(&pool).await,
        Commands::Enqueue {
            kind,
            payload,
            max_attempts,
            delay_secs,
        } => cmd_enqueue(&pool, kind, &payload, max_attempts, delay_secs).await,
        Commands::Show { id } => cmd_show(&pool, id).await,
        Commands::RequeueStale { older_than_secs } => cmd_requeue_stale(&pool, older_than_secs).await,
        Commands::Define {
            id,
            func_key,
            cron,
            name,
            params,
            lock_key,
            disabled,
        } => {
            let mut definition = NewJobDefinition::builder()
                .name(name.unwrap_or_else(|| id.clone()))
                .id(id)
                .func_key(func_key)
                .cron_expr(cron)
                .enabled(!disabled)
                .build();
            definition.params = params.map(|p| parse_json(&p, "--params")).transpose()?;
            definition.lock_key = lock_key;
            cmd_define(&pool, definition).await
        }
        Commands::SetEnabled { id, enabled } => {
            let updated = JobDefinition::set_enabled(&id, enabled, &pool).await?;
            output(&json!({ "id": id, "enabled": enabled, "updated": updated }))
        }
        Commands::Jobs => output(&JobDefinition::find_all(&pool).await?),
        Commands::RunNow { id, params } => cmd_run_now(&config, pool, &id, params).await,
        Commands::Runs { limit, job } => {
            let runs = match job {
                Some(job_id) => JobRun::find_for_job(&job_id, limit, &pool).await?,
                None => JobRun::find_recent(limit, &pool).await?,
            };
            output(&runs)
        }
    }
}

async fn cmd_migrate(pool: &PgPool) -> Result<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .context("Failed to run migrations")?;
    output(&json!({ "success": true }))
}

async fn cmd_enqueue(
    pool: &PgPool,
    kind: String,
    payload: &str,
    max_attempts: i32,
    delay_secs: Option<u64>,
) -> Result<()> {
    let mut item = NewWorkItem::builder()
        .kind(kind)
        .payload(parse_json(payload, "--payload")?)
        .max_attempts(max_attempts)
        .build();
    if let Some(secs) = delay_secs {
        item.available_at = Some(Utc::now() + chrono::Duration::seconds(secs as i64));
    }

    let id = PostgresWorkItemQueue::new(pool.clone()).enqueue(item).await?;
    output(&json!({ "id": id }))
}

async fn cmd_show(pool: &PgPool, id: Uuid) -> Result<()> {
    let item = PostgresWorkItemQueue::new(pool.clone())
        .find(id)
        .await?
        .ok_or_else(|| anyhow!("work item {} not found", id))?;
    output(&item)
}

async fn cmd_requeue_stale(pool: &PgPool, older_than_secs: u64) -> Result<()> {
    let now = Utc::now();
    let cutoff = now - chrono::Duration::seconds(older_than_secs as i64);
    let requeued = PostgresWorkItemQueue::new(pool.clone())
        .requeue_stale(cutoff, now)
        .await?;
    output(&json!({ "requeued": requeued, "started_before": cutoff }))
}

async fn cmd_define(pool: &PgPool, definition: NewJobDefinition) -> Result<()> {
    // Reject what the reconciler would refuse to register.
    autopost_core::kernel::Cadence::parse(&definition.cron_expr)
        .with_context(|| format!("invalid cron expression {:?}", definition.cron_expr))?;
    let mut handlers = JobHandlerRegistry::new();
    register_builtin_jobs(&mut handlers, pool.clone());
    handlers.resolve(&definition.func_key)?;

    output(&JobDefinition::upsert(&definition, pool).await?)
}

async fn cmd_run_now(config: &Config, pool: PgPool, id: &str, params: Option<String>) -> Result<()> {
    let params = params.map(|p| parse_json(&p, "--params")).transpose()?;

    let lock = connect_lock(config.redis_url.as_deref()).await?;
    let mut handlers = JobHandlerRegistry::new();
    register_builtin_jobs(&mut handlers, pool.clone());
    let executor = JobExecutor::new(
        Arc::new(PostgresJobStore::new(pool)),
        Arc::new(handlers),
        lock,
        config.cron_lock_ttl,
    );

    let report = executor.execute(id, params, Some(Utc::now())).await?;
    output(&report)
}
