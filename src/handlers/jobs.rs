//! Job submission, result, cancel and history handlers
//!
//! Every handler answers on the message's reply subject with either a
//! `SuccessResponse` or an `ErrorResponse`. The answer logic lives in the
//! `answer_*` functions so it can be exercised without a NATS server.

use std::sync::Arc;

use anyhow::Result;
use async_nats::{Client, Subscriber};
use futures::StreamExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::services::executor::JobExecutor;
use crate::services::job_history::JobHistoryResponse;
use crate::types::{
    CancelJobResponse, CollectSubscribersRequest, ErrorResponse, ImportPhonebookRequest,
    JobHandle, JobHistoryRequest, JobPoll, JobRefRequest, JobSpec, Request, SuccessResponse,
};

type Answer<T> = std::result::Result<SuccessResponse<T>, ErrorResponse>;

/// Decode a request envelope, mapping malformed JSON to `INVALID_REQUEST`
fn parse_request<T: DeserializeOwned>(payload: &[u8]) -> std::result::Result<Request<T>, ErrorResponse> {
    serde_json::from_slice(payload).map_err(|e| {
        error!("Failed to parse request: {}", e);
        ErrorResponse::new(Uuid::nil(), "INVALID_REQUEST", format!("Failed to parse request: {}", e))
    })
}

async fn publish<T: Serialize>(client: &Client, reply: async_nats::Subject, body: &T) -> Result<()> {
    client.publish(reply, serde_json::to_vec(body)?.into()).await?;
    Ok(())
}

/// Receive loop shared by all job subjects
async fn serve<T, R, F, Fut>(client: Client, mut subscriber: Subscriber, subject: &'static str, answer: F) -> Result<()>
where
    T: DeserializeOwned,
    R: Serialize,
    F: Fn(Request<T>) -> Fut,
    Fut: std::future::Future<Output = Answer<R>>,
{
    while let Some(msg) = subscriber.next().await {
        debug!("Received {} message", subject);

        let reply = match msg.reply {
            Some(ref reply) => reply.clone(),
            None => {
                warn!("{} message without reply subject", subject);
                continue;
            }
        };

        let outcome = match parse_request::<T>(&msg.payload) {
            Ok(request) => answer(request).await,
            Err(error) => Err(error),
        };

        let sent = match outcome {
            Ok(response) => publish(&client, reply, &response).await,
            Err(error) => {
                debug!("{} answered with {}: {}", subject, error.error.code, error.error.message);
                publish(&client, reply, &error).await
            }
        };
        if let Err(e) = sent {
            error!("Failed to publish {} reply: {}", subject, e);
        }
    }

    Ok(())
}

pub async fn answer_import(executor: &JobExecutor, request: Request<ImportPhonebookRequest>) -> Answer<JobHandle> {
    let payload = request.payload;
    let handle = executor
        .submit(JobSpec::Import {
            phonebook_id: payload.phonebook_id,
            file_reference: payload.file_reference,
            column_mapping: payload.column_mapping,
            duplicate_policy: payload.duplicate_policy,
        })
        .await;
    info!(
        "Import of phonebook {} submitted as job {} (coalesced: {})",
        handle.target_id, handle.job_id, handle.coalesced
    );
    Ok(SuccessResponse::new(request.id, handle))
}

pub async fn answer_collect(executor: &JobExecutor, request: Request<CollectSubscribersRequest>) -> Answer<JobHandle> {
    let handle = executor
        .submit(JobSpec::Collect {
            campaign_id: request.payload.campaign_id,
        })
        .await;
    info!(
        "Collection for campaign {} submitted as job {} (coalesced: {})",
        handle.target_id, handle.job_id, handle.coalesced
    );
    Ok(SuccessResponse::new(request.id, handle))
}

pub fn answer_result(executor: &JobExecutor, request: Request<JobRefRequest>) -> Answer<JobPoll> {
    match executor.poll(request.payload.job_id) {
        Some(poll) => Ok(SuccessResponse::new(request.id, poll)),
        None => Err(ErrorResponse::new(
            request.id,
            "NOT_FOUND",
            format!("Job {} not found", request.payload.job_id),
        )),
    }
}

pub fn answer_cancel(executor: &JobExecutor, request: Request<JobRefRequest>) -> Answer<CancelJobResponse> {
    let job_id = request.payload.job_id;
    if executor.poll(job_id).is_none() {
        return Err(ErrorResponse::new(request.id, "NOT_FOUND", format!("Job {} not found", job_id)));
    }
    let cancelled = executor.cancel(job_id);
    Ok(SuccessResponse::new(request.id, CancelJobResponse { job_id, cancelled }))
}

pub fn answer_history(executor: &JobExecutor, request: Request<JobHistoryRequest>) -> Answer<JobHistoryResponse> {
    let response = executor.history().query(&request.payload);
    Ok(SuccessResponse::new(request.id, response))
}

pub async fn handle_import(client: Client, subscriber: Subscriber, executor: Arc<JobExecutor>) -> Result<()> {
    serve(client, subscriber, "phonebook.import", |request| {
        let executor = Arc::clone(&executor);
        async move { answer_import(&executor, request).await }
    })
    .await
}

pub async fn handle_collect(client: Client, subscriber: Subscriber, executor: Arc<JobExecutor>) -> Result<()> {
    serve(client, subscriber, "campaign.collect", |request| {
        let executor = Arc::clone(&executor);
        async move { answer_collect(&executor, request).await }
    })
    .await
}

pub async fn handle_result(client: Client, subscriber: Subscriber, executor: Arc<JobExecutor>) -> Result<()> {
    serve(client, subscriber, "job.result", |request| {
        let answer = answer_result(&executor, request);
        async move { answer }
    })
    .await
}

pub async fn handle_cancel(client: Client, subscriber: Subscriber, executor: Arc<JobExecutor>) -> Result<()> {
    serve(client, subscriber, "job.cancel", |request| {
        let answer = answer_cancel(&executor, request);
        async move { answer }
    })
    .await
}

pub async fn handle_history(client: Client, subscriber: Subscriber, executor: Arc<JobExecutor>) -> Result<()> {
    serve(client, subscriber, "job.history", |request| {
        let answer = answer_history(&executor, request);
        async move { answer }
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::executor::ExecutorSettings;
    use crate::store::{ContactStore, MemoryContactStore};
    use crate::types::{CampaignId, CampaignStatus, ColumnMapping, ColumnRef, CreatePhonebookRequest, JobStatus, PhonebookId};

    async fn seed_phonebook(store: &MemoryContactStore) -> PhonebookId {
        store
            .create_phonebook(&CreatePhonebookRequest {
                name: "leads".to_string(),
                description: String::new(),
                account_id: 1,
            })
            .await
            .unwrap()
            .id
    }

    async fn seed_campaign(store: &MemoryContactStore) -> CampaignId {
        let pb = seed_phonebook(store).await;
        store.add_campaign("spring", CampaignStatus::Started, vec![pb])
    }

    fn executor_with(store: Arc<MemoryContactStore>) -> JobExecutor {
        let settings = ExecutorSettings {
            history_file: None,
            ..ExecutorSettings::default()
        };
        JobExecutor::new(store as Arc<dyn ContactStore>, settings)
    }

    #[test]
    fn test_parse_request_rejects_malformed_json() {
        let error = parse_request::<JobRefRequest>(b"{not json").unwrap_err();
        assert_eq!(error.error.code, "INVALID_REQUEST");
        assert_eq!(error.id, Uuid::nil());
    }

    #[test]
    fn test_parse_request_rejects_missing_field() {
        let json = br#"{"id":"00000000-0000-0000-0000-000000000001","timestamp":"2026-01-01T00:00:00Z","payload":{}}"#;
        let error = parse_request::<CollectSubscribersRequest>(json).unwrap_err();
        assert_eq!(error.error.code, "INVALID_REQUEST");
    }

    #[tokio::test]
    async fn test_collect_submission_returns_handle_and_result() {
        let store = Arc::new(MemoryContactStore::new());
        let campaign = seed_campaign(&store).await;
        let executor = executor_with(store);

        let request = Request::new(CollectSubscribersRequest { campaign_id: campaign });
        let request_id = request.id;
        let response = answer_collect(&executor, request).await.unwrap();
        assert_eq!(response.id, request_id);
        assert_eq!(response.payload.target_id, campaign);

        executor.await_result(response.payload.job_id).await.unwrap();
        let poll = answer_result(&executor, Request::new(JobRefRequest { job_id: response.payload.job_id }))
            .unwrap()
            .payload;
        match poll {
            JobPoll::Finished { result } => assert_eq!(result.status, JobStatus::Succeeded),
            other => panic!("unexpected poll: {:?}", other),
        }
        executor.shutdown().await;
    }

    #[tokio::test]
    async fn test_import_with_bad_reference_finishes_failed() {
        let store = Arc::new(MemoryContactStore::new());
        let phonebook = seed_phonebook(&store).await;
        let executor = executor_with(store);

        let request = Request::new(ImportPhonebookRequest {
            phonebook_id: phonebook,
            file_reference: "../etc/passwd".to_string(),
            column_mapping: ColumnMapping {
                phone: ColumnRef::Name("phone".to_string()),
                ..ColumnMapping::default()
            },
            duplicate_policy: Default::default(),
        });
        let handle = answer_import(&executor, request).await.unwrap().payload;
        let result = executor.await_result(handle.job_id).await.unwrap();
        assert_eq!(result.status, JobStatus::Failed);
        executor.shutdown().await;
    }

    #[tokio::test]
    async fn test_unknown_job_is_not_found() {
        let executor = executor_with(Arc::new(MemoryContactStore::new()));
        let job_id = Uuid::new_v4();

        let error = answer_result(&executor, Request::new(JobRefRequest { job_id })).unwrap_err();
        assert_eq!(error.error.code, "NOT_FOUND");

        let error = answer_cancel(&executor, Request::new(JobRefRequest { job_id })).unwrap_err();
        assert_eq!(error.error.code, "NOT_FOUND");
        executor.shutdown().await;
    }

    #[tokio::test]
    async fn test_cancel_finished_job_reports_false() {
        let store = Arc::new(MemoryContactStore::new());
        let campaign = seed_campaign(&store).await;
        let executor = executor_with(store);

        let handle = executor.submit(JobSpec::Collect { campaign_id: campaign }).await;
        executor.await_result(handle.job_id).await.unwrap();

        let response = answer_cancel(&executor, Request::new(JobRefRequest { job_id: handle.job_id }))
            .unwrap()
            .payload;
        assert_eq!(response.job_id, handle.job_id);
        assert!(!response.cancelled);
        executor.shutdown().await;
    }

    #[tokio::test]
    async fn test_history_lists_finished_jobs() {
        let store = Arc::new(MemoryContactStore::new());
        let campaign = seed_campaign(&store).await;
        let executor = executor_with(store);

        let handle = executor.submit(JobSpec::Collect { campaign_id: campaign }).await;
        executor.await_result(handle.job_id).await.unwrap();

        let request: JobHistoryRequest = serde_json::from_str("{}").unwrap();
        let response = answer_history(&executor, Request::new(request)).unwrap().payload;
        assert_eq!(response.jobs.len(), 1);
        assert_eq!(response.jobs[0].id, handle.job_id);
        executor.shutdown().await;
    }
}
