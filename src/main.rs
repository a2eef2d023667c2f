//! Dialer Worker - phonebook import and campaign subscriber collection
//!
//! Runs jobs submitted over NATS, or a single job from the command line.

mod cli;
mod config;
mod db;
mod error;
mod handlers;
mod services;
mod store;
mod types;

use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tracing::{error, info};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::cli::{Cli, Command, ImportArgs};
use crate::config::Config;
use crate::services::executor::JobExecutor;
use crate::types::{JobSpec, JobStatus};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Logs directory - use LOGS_DIR env var or default to ./logs
    let logs_dir = std::env::var("LOGS_DIR").unwrap_or_else(|_| "logs".to_string());
    std::fs::create_dir_all(&logs_dir).ok();

    // File appender for persistent logs (daily rotation)
    let file_appender = RollingFileAppender::new(Rotation::DAILY, &logs_dir, "worker.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);

    // Initialize logging - both stdout and file
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info,dialer_worker=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer()) // stdout
        .with(tracing_subscriber::fmt::layer().with_writer(non_blocking).with_ansi(false)) // file
        .init();

    let config = Config::from_env()?;
    info!("Configuration loaded (store backend: {})", config.store_backend);

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(config).await,
        Command::Migrate => migrate(&config).await,
        Command::Import(args) => run_once(&config, import_spec(&args)).await,
        Command::Collect { campaign } => run_once(&config, JobSpec::Collect { campaign_id: campaign }).await,
    }
}

async fn migrate(config: &Config) -> Result<()> {
    let url = config
        .database_url
        .as_deref()
        .ok_or_else(|| anyhow::anyhow!("DATABASE_URL must be set to run migrations"))?;
    let pool = db::create_pool(url).await?;
    db::run_migrations(&pool).await?;
    info!("Database migrations complete");
    Ok(())
}

async fn serve(config: Config) -> Result<()> {
    info!("Starting Dialer Worker...");

    let store = store::create_store(&config.store_backend, config.database_url.as_deref()).await?;
    info!("Contact store ready: {}", store.name());

    let executor = Arc::new(JobExecutor::new(store, config.executor_settings()));
    if let Some(period) = config.collect_sweep() {
        executor.spawn_collect_sweep(period);
    }

    // Connect to NATS (supports optional NATS_USER/NATS_PASSWORD auth).
    let nats_client = match (std::env::var("NATS_USER"), std::env::var("NATS_PASSWORD")) {
        (Ok(user), Ok(password)) if !user.is_empty() => {
            async_nats::ConnectOptions::new()
                .user_and_password(user, password)
                .connect(&config.nats_url)
                .await?
        }
        _ => async_nats::connect(&config.nats_url).await?,
    };
    info!("Connected to NATS at {}", config.nats_url);

    tokio::select! {
        result = handlers::start_handlers(nats_client, Arc::clone(&executor)) => {
            if let Err(e) = result {
                error!("Handler error: {}", e);
                return Err(e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received");
            executor.drain().await;
        }
    }

    Ok(())
}

fn import_spec(args: &ImportArgs) -> JobSpec {
    JobSpec::Import {
        phonebook_id: args.phonebook,
        file_reference: args.file.clone(),
        column_mapping: args.column_mapping(),
        duplicate_policy: args.duplicate_policy(),
    }
}

/// Run one job to completion and print its result as JSON
async fn run_once(config: &Config, spec: JobSpec) -> Result<()> {
    let store = store::create_store(&config.store_backend, config.database_url.as_deref()).await?;
    let executor = JobExecutor::new(store, config.executor_settings());

    let handle = executor.submit(spec).await;
    info!("Submitted {} job {} for target {}", handle.kind, handle.job_id, handle.target_id);

    let result = executor
        .await_result(handle.job_id)
        .await
        .ok_or_else(|| anyhow::anyhow!("job {} disappeared before finishing", handle.job_id))?;
    executor.shutdown().await;

    println!("{}", serde_json::to_string_pretty(&result)?);

    match result.status {
        JobStatus::Succeeded => Ok(()),
        status => anyhow::bail!(
            "job {} {}: {}",
            result.job_id,
            status.as_str(),
            result.message.unwrap_or_default()
        ),
    }
}
