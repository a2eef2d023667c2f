//! NATS message handlers

pub mod jobs;

use std::sync::Arc;

use anyhow::Result;
use async_nats::Client;
use tokio::select;
use tracing::{error, info};

use crate::services::executor::JobExecutor;

pub const SUBJECT_IMPORT: &str = "dialer.phonebook.import";
pub const SUBJECT_COLLECT: &str = "dialer.campaign.collect";
pub const SUBJECT_JOB_RESULT: &str = "dialer.job.result";
pub const SUBJECT_JOB_CANCEL: &str = "dialer.job.cancel";
pub const SUBJECT_JOB_HISTORY: &str = "dialer.job.history";

/// Subscribe to all subjects and serve them until one handler stops
pub async fn start_handlers(client: Client, executor: Arc<JobExecutor>) -> Result<()> {
    info!("Starting message handlers...");

    let import_sub = client.subscribe(SUBJECT_IMPORT).await?;
    let collect_sub = client.subscribe(SUBJECT_COLLECT).await?;
    let result_sub = client.subscribe(SUBJECT_JOB_RESULT).await?;
    let cancel_sub = client.subscribe(SUBJECT_JOB_CANCEL).await?;
    let history_sub = client.subscribe(SUBJECT_JOB_HISTORY).await?;

    info!("Subscribed to NATS subjects");

    let import_handle = tokio::spawn(jobs::handle_import(client.clone(), import_sub, Arc::clone(&executor)));
    let collect_handle = tokio::spawn(jobs::handle_collect(client.clone(), collect_sub, Arc::clone(&executor)));
    let result_handle = tokio::spawn(jobs::handle_result(client.clone(), result_sub, Arc::clone(&executor)));
    let cancel_handle = tokio::spawn(jobs::handle_cancel(client.clone(), cancel_sub, Arc::clone(&executor)));
    let history_handle = tokio::spawn(jobs::handle_history(client, history_sub, executor));

    info!("All handlers started, waiting for messages...");

    select! {
        result = import_handle => {
            error!("Import handler finished: {:?}", result);
        }
        result = collect_handle => {
            error!("Collect handler finished: {:?}", result);
        }
        result = result_handle => {
            error!("Job result handler finished: {:?}", result);
        }
        result = cancel_handle => {
            error!("Job cancel handler finished: {:?}", result);
        }
        result = history_handle => {
            error!("Job history handler finished: {:?}", result);
        }
    }

    Ok(())
}
