//! Background job executor
//!
//! Runs import and collection pipelines on a pool of tokio workers fed by a
//! bounded queue. At most one job per `(kind, target)` runs at a time: the
//! in-flight map covers this process, the store lease covers every process
//! sharing the store. Callers get a `JobHandle` immediately and poll or await
//! the `JobResult`.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::cancellation::{CancellationRegistry, JobGuard, RunControl};
use super::collector::{CollectSettings, SubscriberCollector};
use super::import_pipeline::{ImportPipeline, ImportSettings};
use super::job_history::JobHistoryService;
use super::retry::{retry_transient, RetryPolicy};
use super::rows::CsvRowSource;
use crate::error::{Interrupted, JobError};
use crate::store::ContactStore;
use crate::types::{
    ImportResult, JobHandle, JobPayload, JobPoll, JobResult, JobSpec, JobStatus, LeaseKey,
};

/// What happens to a submission whose target already has a queued or running job
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ConflictPolicy {
    /// The new submission ends immediately with a `Conflict` result
    Reject,
    /// The new submission joins the in-flight job and shares its handle
    #[default]
    Coalesce,
}

impl FromStr for ConflictPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "reject" => Ok(ConflictPolicy::Reject),
            "coalesce" => Ok(ConflictPolicy::Coalesce),
            other => Err(format!("unknown conflict policy '{}' (expected 'reject' or 'coalesce')", other)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExecutorSettings {
    pub worker_count: usize,
    pub queue_capacity: usize,
    pub conflict_policy: ConflictPolicy,
    pub lease_ttl: Duration,
    /// How long a job waits for a lease held elsewhere. Ignored under `Reject`.
    pub lease_wait: Duration,
    pub lease_poll_interval: Duration,
    pub max_retained_results: usize,
    pub upload_dir: PathBuf,
    pub history_file: Option<PathBuf>,
    /// Retry policy for lease operations
    pub retry: RetryPolicy,
    pub import: ImportSettings,
    pub collect: CollectSettings,
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self {
            worker_count: 4,
            queue_capacity: 100,
            conflict_policy: ConflictPolicy::default(),
            lease_ttl: Duration::from_secs(60),
            lease_wait: Duration::from_secs(30),
            lease_poll_interval: Duration::from_millis(500),
            max_retained_results: 1000,
            upload_dir: PathBuf::from("uploads"),
            history_file: None,
            retry: RetryPolicy::default(),
            import: ImportSettings::default(),
            collect: CollectSettings::default(),
        }
    }
}

type JobState = Arc<watch::Sender<JobPoll>>;

struct QueuedJob {
    handle: JobHandle,
    spec: JobSpec,
    guard: JobGuard,
    state: JobState,
}

enum Admission {
    Queued(QueuedJob),
    Joined(JobHandle),
    Rejected(JobHandle),
}

#[derive(Default)]
struct Registry {
    /// Every job that is queued, running, or finished and still retained
    jobs: HashMap<Uuid, JobState>,
    inflight: HashMap<LeaseKey, JobHandle>,
    /// Finished job ids, oldest first
    finished: VecDeque<Uuid>,
}

struct Inner {
    store: Arc<dyn ContactStore>,
    settings: ExecutorSettings,
    registry: Mutex<Registry>,
    cancellation: CancellationRegistry,
    history: JobHistoryService,
}

pub struct JobExecutor {
    inner: Arc<Inner>,
    queue: mpsc::Sender<QueuedJob>,
    workers: Vec<JoinHandle<()>>,
}

impl JobExecutor {
    /// Start the worker pool. Must be called inside a tokio runtime.
    pub fn new(store: Arc<dyn ContactStore>, settings: ExecutorSettings) -> Self {
        let (queue, receiver) = mpsc::channel(settings.queue_capacity.max(1));
        let receiver = Arc::new(AsyncMutex::new(receiver));
        let worker_count = settings.worker_count.max(1);

        info!(
            "Starting job executor: {} workers, queue capacity {}, {:?} on conflict, {} store",
            worker_count,
            settings.queue_capacity,
            settings.conflict_policy,
            store.name()
        );

        let inner = Arc::new(Inner {
            history: JobHistoryService::new(settings.history_file.clone()),
            store,
            settings,
            registry: Mutex::new(Registry::default()),
            cancellation: CancellationRegistry::default(),
        });

        let workers = (0..worker_count)
            .map(|worker_id| tokio::spawn(worker_loop(Arc::clone(&inner), Arc::clone(&receiver), worker_id)))
            .collect();

        Self { inner, queue, workers }
    }

    /// Queue a job. Never fails: problems surface as the job's terminal result.
    pub async fn submit(&self, spec: JobSpec) -> JobHandle {
        match self.inner.admit(spec) {
            Admission::Joined(handle) => {
                debug!("Submission for {}:{} joined job {}", handle.kind, handle.target_id, handle.job_id);
                handle
            }
            Admission::Rejected(handle) => handle,
            Admission::Queued(job) => {
                let handle = job.handle;
                debug!("Job {} queued for {}:{}", handle.job_id, handle.kind, handle.target_id);
                if let Err(mpsc::error::SendError(job)) = self.queue.send(job).await {
                    let error = JobError::Internal("job executor is shut down".to_string());
                    self.inner.finish(terminal(&job.handle, Utc::now(), Some(&error), None));
                }
                handle
            }
        }
    }

    /// Current state of a job, or None if it is unknown or no longer retained
    pub fn poll(&self, job_id: Uuid) -> Option<JobPoll> {
        let registry = self.inner.registry.lock();
        registry.jobs.get(&job_id).map(|state| state.borrow().clone())
    }

    /// Wait for a job's terminal result
    pub async fn await_result(&self, job_id: Uuid) -> Option<JobResult> {
        let mut receiver = self.inner.registry.lock().jobs.get(&job_id)?.subscribe();
        let poll = receiver.wait_for(JobPoll::is_finished).await.ok()?.clone();
        match poll {
            JobPoll::Finished { result } => Some(result),
            _ => None,
        }
    }

    /// Request cooperative cancellation. Returns false if the job is not
    /// queued or running.
    pub fn cancel(&self, job_id: Uuid) -> bool {
        let cancelled = self.inner.cancellation.cancel(&job_id);
        if cancelled {
            info!("Cancellation requested for job {}", job_id);
        }
        cancelled
    }

    /// Whether a job for `key` is queued or running in this executor
    pub fn is_inflight(&self, key: LeaseKey) -> bool {
        self.inner.registry.lock().inflight.contains_key(&key)
    }

    pub fn history(&self) -> &JobHistoryService {
        &self.inner.history
    }

    /// Submit a collection for every started campaign without one in flight
    pub async fn sweep_started_campaigns(&self) -> Vec<JobHandle> {
        let campaigns = match self.inner.store.started_campaigns().await {
            Ok(campaigns) => campaigns,
            Err(e) => {
                warn!("Collection sweep could not list campaigns: {}", e);
                return Vec::new();
            }
        };

        let mut handles = Vec::new();
        for campaign_id in campaigns {
            let spec = JobSpec::Collect { campaign_id };
            if self.is_inflight(spec.lease_key()) {
                continue;
            }
            handles.push(self.submit(spec).await);
        }
        if !handles.is_empty() {
            debug!("Collection sweep queued {} jobs", handles.len());
        }
        handles
    }

    /// Run `sweep_started_campaigns` every `period`
    pub fn spawn_collect_sweep(self: &Arc<Self>, period: Duration) -> JoinHandle<()> {
        let executor = Arc::clone(self);
        tokio::spawn(async move {
            info!("Collection sweep every {:?}", period);
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                executor.sweep_started_campaigns().await;
            }
        })
    }

    /// Cancel every queued and running job and wait until each has finished
    /// and released its lease
    pub async fn drain(&self) {
        let cancelled = self.inner.cancellation.cancel_all();
        info!("Draining job executor, {} jobs cancelled", cancelled);
        let pending: Vec<Uuid> = self.inner.registry.lock().inflight.values().map(|h| h.job_id).collect();
        for job_id in pending {
            self.await_result(job_id).await;
        }
    }

    /// Stop accepting jobs and wait for queued ones to finish
    pub async fn shutdown(self) {
        let Self { queue, workers, .. } = self;
        drop(queue);
        for worker in workers {
            if let Err(e) = worker.await {
                error!("Job worker ended abnormally: {}", e);
            }
        }
        info!("Job executor stopped");
    }
}

async fn worker_loop(inner: Arc<Inner>, queue: Arc<AsyncMutex<mpsc::Receiver<QueuedJob>>>, worker_id: usize) {
    debug!("Job worker {} started", worker_id);
    loop {
        let next = queue.lock().await.recv().await;
        let Some(job) = next else {
            break;
        };
        inner.run_job(job).await;
    }
    debug!("Job worker {} stopped", worker_id);
}

impl Inner {
    fn admit(&self, spec: JobSpec) -> Admission {
        let key = spec.lease_key();
        let mut registry = self.registry.lock();

        if let Some(existing) = registry.inflight.get(&key).copied() {
            match self.settings.conflict_policy {
                ConflictPolicy::Coalesce => {
                    return Admission::Joined(JobHandle {
                        coalesced: true,
                        ..existing
                    });
                }
                ConflictPolicy::Reject => {
                    drop(registry);
                    let handle = JobHandle {
                        job_id: Uuid::new_v4(),
                        kind: key.kind,
                        target_id: key.target_id,
                        coalesced: false,
                    };
                    info!("Rejected job {}: {} already has job {}", handle.job_id, key, existing.job_id);
                    self.finish(terminal(&handle, Utc::now(), Some(&JobError::Conflict(key)), None));
                    return Admission::Rejected(handle);
                }
            }
        }

        let handle = JobHandle {
            job_id: Uuid::new_v4(),
            kind: key.kind,
            target_id: key.target_id,
            coalesced: false,
        };
        let state: JobState = Arc::new(watch::channel(JobPoll::Queued).0);
        registry.jobs.insert(handle.job_id, Arc::clone(&state));
        registry.inflight.insert(key, handle);

        Admission::Queued(QueuedJob {
            handle,
            spec,
            guard: self.cancellation.register(handle.job_id),
            state,
        })
    }

    async fn run_job(self: &Arc<Self>, job: QueuedJob) {
        let QueuedJob {
            handle,
            spec,
            guard,
            state,
        } = job;
        let started_at = Utc::now();
        let token = guard.token();
        let key = spec.lease_key();

        if token.is_cancelled() {
            drop(guard);
            self.finish(terminal(&handle, started_at, Some(&JobError::Cancelled), None));
            return;
        }

        if let Err(e) = self.acquire_lease(key, handle.job_id, &token).await {
            drop(guard);
            self.finish(terminal(&handle, started_at, Some(&e), None));
            return;
        }

        info!("Job {} started for {}", handle.job_id, key);
        state.send_replace(JobPoll::Running {
            progress: Default::default(),
        });
        // The pipeline stops on a caller cancel or when the lease is lost
        let run_token = token.child_token();
        let lease_lost = CancellationToken::new();
        let renewal = self.spawn_lease_renewal(key, handle.job_id, run_token.clone(), lease_lost.clone());

        let progress_state = Arc::clone(&state);
        let control = RunControl::new(run_token).with_progress(move |progress| {
            progress_state.send_replace(JobPoll::Running { progress });
        });

        // A separate task so a panicking pipeline surfaces as a JoinError
        let inner = Arc::clone(self);
        let outcome = tokio::spawn(async move { inner.run_pipeline(spec, control).await }).await;

        renewal.abort();
        self.release_lease(key, handle.job_id).await;

        let result = match outcome {
            Ok(Ok(payload)) => terminal(&handle, started_at, None, Some(payload)),
            Ok(Err(interrupted)) => {
                let cause = match interrupted.cause {
                    JobError::Cancelled if lease_lost.is_cancelled() && !token.is_cancelled() => {
                        JobError::Conflict(key)
                    }
                    cause => cause,
                };
                terminal(&handle, started_at, Some(&cause), Some(interrupted.partial))
            }
            Err(join_error) => {
                error!("Job {} panicked: {}", handle.job_id, join_error);
                let error = JobError::Internal(format!("pipeline panicked: {}", join_error));
                terminal(&handle, started_at, Some(&error), None)
            }
        };
        drop(guard);
        self.finish(result);
    }

    async fn run_pipeline(&self, spec: JobSpec, control: RunControl) -> Result<JobPayload, Interrupted<JobPayload>> {
        match spec {
            JobSpec::Import {
                phonebook_id,
                file_reference,
                column_mapping,
                duplicate_policy,
            } => {
                let source = CsvRowSource::open(&self.settings.upload_dir, &file_reference)
                    .await
                    .map_err(|cause| Interrupted {
                        partial: JobPayload::Import(ImportResult {
                            aborted: true,
                            ..ImportResult::default()
                        }),
                        cause,
                    })?;

                ImportPipeline::new(Arc::clone(&self.store), self.settings.import.clone())
                    .run(phonebook_id, source, &column_mapping, duplicate_policy, &control)
                    .await
                    .map(JobPayload::Import)
                    .map_err(|interrupted| interrupted.map(JobPayload::Import))
            }
            JobSpec::Collect { campaign_id } => {
                SubscriberCollector::new(Arc::clone(&self.store), self.settings.collect.clone())
                    .run(campaign_id, &control)
                    .await
                    .map(JobPayload::Collect)
                    .map_err(|interrupted| interrupted.map(JobPayload::Collect))
            }
        }
    }

    /// Take the store lease, polling while another holder has it
    async fn acquire_lease(&self, key: LeaseKey, holder: Uuid, token: &CancellationToken) -> Result<(), JobError> {
        let wait = match self.settings.conflict_policy {
            ConflictPolicy::Reject => Duration::ZERO,
            ConflictPolicy::Coalesce => self.settings.lease_wait,
        };
        let deadline = Instant::now() + wait;

        loop {
            let acquired = retry_transient(&self.settings.retry, "acquire lease", || {
                self.store.acquire_lease(key, holder, self.settings.lease_ttl)
            })
            .await?;
            if acquired {
                debug!("Job {} holds lease {}", holder, key);
                return Ok(());
            }

            let now = Instant::now();
            if now >= deadline {
                warn!("Lease {} is held by another worker, job {} gives up", key, holder);
                return Err(JobError::Conflict(key));
            }

            let pause = self.settings.lease_poll_interval.min(deadline - now);
            tokio::select! {
                _ = token.cancelled() => return Err(JobError::Cancelled),
                _ = tokio::time::sleep(pause) => {}
            }
        }
    }

    /// Keep the lease alive every TTL/3. If it is taken over, or cannot be
    /// renewed for a whole TTL, mark it lost and stop the run.
    fn spawn_lease_renewal(
        &self,
        key: LeaseKey,
        holder: Uuid,
        run_token: CancellationToken,
        lease_lost: CancellationToken,
    ) -> JoinHandle<()> {
        let store = Arc::clone(&self.store);
        let ttl = self.settings.lease_ttl;
        let period = (ttl / 3).max(Duration::from_millis(10));

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            let mut renewed_at = Instant::now();
            loop {
                ticker.tick().await;
                match store.renew_lease(key, holder, ttl).await {
                    Ok(true) => {
                        renewed_at = Instant::now();
                        debug!("Renewed lease {}", key);
                    }
                    Ok(false) => {
                        warn!("Lease {} was taken over, stopping job {}", key, holder);
                        break;
                    }
                    Err(e) if renewed_at.elapsed() >= ttl => {
                        warn!("Lease {} expired unrenewed, stopping job {}: {}", key, holder, e);
                        break;
                    }
                    Err(e) => warn!("Failed to renew lease {}: {}", key, e),
                }
            }
            lease_lost.cancel();
            run_token.cancel();
        })
    }

    async fn release_lease(&self, key: LeaseKey, holder: Uuid) {
        let released = retry_transient(&self.settings.retry, "release lease", || {
            self.store.release_lease(key, holder)
        })
        .await;
        if let Err(e) = released {
            // The lease expires on its own after the TTL
            error!("Failed to release lease {} held by job {}: {}", key, holder, e);
        }
    }

    fn finish(&self, result: JobResult) {
        match result.status {
            JobStatus::Succeeded => info!(
                "Job {} ({}:{}) succeeded: {}",
                result.job_id,
                result.kind,
                result.target_id,
                result.payload.as_ref().map(|p| p.summary()).unwrap_or_default()
            ),
            JobStatus::Cancelled => info!("Job {} ({}:{}) cancelled", result.job_id, result.kind, result.target_id),
            JobStatus::Failed => warn!(
                "Job {} ({}:{}) failed: {}",
                result.job_id,
                result.kind,
                result.target_id,
                result.message.as_deref().unwrap_or("unknown error")
            ),
        }
        self.history.record(&result);

        let key = LeaseKey {
            kind: result.kind,
            target_id: result.target_id,
        };
        let job_id = result.job_id;

        let mut guard = self.registry.lock();
        let registry = &mut *guard;
        if registry.inflight.get(&key).map(|h| h.job_id) == Some(job_id) {
            registry.inflight.remove(&key);
        }
        registry
            .jobs
            .entry(job_id)
            .or_insert_with(|| Arc::new(watch::channel(JobPoll::Queued).0))
            .send_replace(JobPoll::Finished { result });
        registry.finished.push_back(job_id);
        while registry.finished.len() > self.settings.max_retained_results.max(1) {
            if let Some(evicted) = registry.finished.pop_front() {
                registry.jobs.remove(&evicted);
            }
        }
    }
}

fn terminal(
    handle: &JobHandle,
    started_at: DateTime<Utc>,
    error: Option<&JobError>,
    payload: Option<JobPayload>,
) -> JobResult {
    let status = match error {
        None => JobStatus::Succeeded,
        Some(JobError::Cancelled) => JobStatus::Cancelled,
        Some(_) => JobStatus::Failed,
    };
    JobResult {
        job_id: handle.job_id,
        kind: handle.kind,
        target_id: handle.target_id,
        status,
        error_kind: error.map(JobError::kind),
        message: error.map(ToString::to_string),
        payload,
        started_at,
        finished_at: Utc::now(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{FaultPlan, MemoryContactStore};
    use crate::types::{
        CampaignId, CampaignStatus, ColumnMapping, ContactCandidate, CreatePhonebookRequest,
        DuplicatePolicy, ErrorKind, JobKind, PhonebookId,
    };

    fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 2,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
        }
    }

    fn settings() -> ExecutorSettings {
        ExecutorSettings {
            worker_count: 2,
            queue_capacity: 16,
            conflict_policy: ConflictPolicy::Coalesce,
            lease_ttl: Duration::from_secs(5),
            lease_wait: Duration::from_secs(5),
            lease_poll_interval: Duration::from_millis(5),
            max_retained_results: 100,
            upload_dir: std::env::temp_dir(),
            history_file: None,
            retry: fast_retry(),
            import: ImportSettings {
                batch_size: 2,
                retry: fast_retry(),
                ..ImportSettings::default()
            },
            collect: CollectSettings {
                batch_size: 2,
                retry: fast_retry(),
            },
        }
    }

    fn reject_settings() -> ExecutorSettings {
        ExecutorSettings {
            conflict_policy: ConflictPolicy::Reject,
            ..settings()
        }
    }

    async fn phonebook(store: &MemoryContactStore, contacts: usize) -> PhonebookId {
        let pb = store
            .create_phonebook(&CreatePhonebookRequest {
                name: "pb".to_string(),
                description: String::new(),
                account_id: 1,
            })
            .await
            .unwrap()
            .id;
        let batch: Vec<ContactCandidate> = (0..contacts)
            .map(|i| ContactCandidate {
                row_number: i as u64 + 2,
                phone: format!("55502{:02}", i),
                first_name: None,
                last_name: None,
                email: None,
                status: None,
            })
            .collect();
        if !batch.is_empty() {
            store.write_contact_batch(pb, &batch, DuplicatePolicy::Skip).await.unwrap();
        }
        pb
    }

    async fn campaign(store: &MemoryContactStore, contacts: usize) -> CampaignId {
        let pb = phonebook(store, contacts).await;
        store.add_campaign("campaign", CampaignStatus::Started, vec![pb])
    }

    fn upload_dir_with(name: &str, contents: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("dialer-uploads-{}", Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join(name), contents).unwrap();
        dir
    }

    async fn wait_until_running(executor: &JobExecutor, job_id: Uuid, min_batches: u32) {
        for _ in 0..1000 {
            if let Some(JobPoll::Running { progress }) = executor.poll(job_id) {
                if progress.batches_committed >= min_batches {
                    return;
                }
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        panic!("job {} never reached the running state", job_id);
    }

    async fn lease_is_free(store: &MemoryContactStore, kind: JobKind, target_id: i64) -> bool {
        store
            .acquire_lease(LeaseKey { kind, target_id }, Uuid::new_v4(), Duration::from_secs(1))
            .await
            .unwrap()
    }

    #[test]
    fn test_conflict_policy_parses() {
        assert_eq!("reject".parse::<ConflictPolicy>().unwrap(), ConflictPolicy::Reject);
        assert_eq!(" Coalesce ".parse::<ConflictPolicy>().unwrap(), ConflictPolicy::Coalesce);
        assert!("queue".parse::<ConflictPolicy>().is_err());
    }

    #[tokio::test]
    async fn test_collect_job_succeeds_and_is_recorded() {
        let store = Arc::new(MemoryContactStore::new());
        let campaign_id = campaign(&store, 3).await;
        let executor = JobExecutor::new(store.clone(), settings());

        let handle = executor.submit(JobSpec::Collect { campaign_id }).await;
        assert!(!handle.coalesced);
        let result = executor.await_result(handle.job_id).await.unwrap();

        assert_eq!(result.status, JobStatus::Succeeded);
        assert_eq!(result.error_kind, None);
        assert_eq!(result.collect_result().unwrap().subscribers_added, 3);
        assert!(result.finished_at >= result.started_at);
        assert!(executor.poll(handle.job_id).unwrap().is_finished());
        assert_eq!(executor.history().get_recent(10).jobs[0].id, handle.job_id);
        assert!(!executor.is_inflight(LeaseKey { kind: JobKind::Collect, target_id: campaign_id }));
        assert!(lease_is_free(&store, JobKind::Collect, campaign_id).await);
    }

    #[tokio::test]
    async fn test_import_job_reads_file_from_upload_dir() {
        let store = Arc::new(MemoryContactStore::new());
        let pb = phonebook(&store, 0).await;
        let dir = upload_dir_with("list.csv", "phone,first_name\n555-0100,A\n5550100,C\nbad,E\n");
        let executor = JobExecutor::new(
            store.clone(),
            ExecutorSettings {
                upload_dir: dir.clone(),
                ..settings()
            },
        );

        let handle = executor
            .submit(JobSpec::Import {
                phonebook_id: pb,
                file_reference: "list.csv".to_string(),
                column_mapping: ColumnMapping::phone_only("phone"),
                duplicate_policy: DuplicatePolicy::Skip,
            })
            .await;
        let result = executor.await_result(handle.job_id).await.unwrap();

        assert_eq!(result.status, JobStatus::Succeeded);
        let import = result.import_result().unwrap();
        assert_eq!(import.rows_total, 3);
        assert_eq!(import.rows_inserted, 1);
        assert_eq!(import.rows_skipped_duplicate, 1);
        assert_eq!(import.rows_invalid, 1);

        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn test_duplicate_submission_is_coalesced() {
        let store = Arc::new(MemoryContactStore::with_write_delay(Duration::from_millis(10)));
        let campaign_id = campaign(&store, 6).await;
        let executor = JobExecutor::new(store.clone(), settings());

        let first = executor.submit(JobSpec::Collect { campaign_id }).await;
        let second = executor.submit(JobSpec::Collect { campaign_id }).await;

        assert_eq!(first.job_id, second.job_id);
        assert!(second.coalesced);

        let result = executor.await_result(first.job_id).await.unwrap();
        assert_eq!(result.collect_result().unwrap().subscribers_added, 6);

        // Once finished, a new submission is a new job
        let third = executor.submit(JobSpec::Collect { campaign_id }).await;
        assert_ne!(third.job_id, first.job_id);
        let rerun = executor.await_result(third.job_id).await.unwrap();
        assert_eq!(rerun.collect_result().unwrap().subscribers_added, 0);
    }

    #[tokio::test]
    async fn test_duplicate_submission_is_rejected() {
        let store = Arc::new(MemoryContactStore::with_write_delay(Duration::from_millis(10)));
        let campaign_id = campaign(&store, 6).await;
        let executor = JobExecutor::new(store.clone(), reject_settings());

        let first = executor.submit(JobSpec::Collect { campaign_id }).await;
        let second = executor.submit(JobSpec::Collect { campaign_id }).await;
        assert_ne!(first.job_id, second.job_id);

        let rejected = executor.await_result(second.job_id).await.unwrap();
        assert_eq!(rejected.status, JobStatus::Failed);
        assert_eq!(rejected.error_kind, Some(ErrorKind::Conflict));
        assert!(rejected.payload.is_none());

        let result = executor.await_result(first.job_id).await.unwrap();
        assert_eq!(result.status, JobStatus::Succeeded);
        assert_eq!(store.subscribers(campaign_id).await.unwrap().len(), 6);
    }

    #[tokio::test]
    async fn test_lease_excludes_second_executor() {
        let store = Arc::new(MemoryContactStore::with_write_delay(Duration::from_millis(10)));
        let campaign_id = campaign(&store, 6).await;
        let a = JobExecutor::new(store.clone(), reject_settings());
        let b = JobExecutor::new(store.clone(), reject_settings());

        let running = a.submit(JobSpec::Collect { campaign_id }).await;
        wait_until_running(&a, running.job_id, 0).await;

        let blocked = b.submit(JobSpec::Collect { campaign_id }).await;
        let conflict = b.await_result(blocked.job_id).await.unwrap();
        assert_eq!(conflict.error_kind, Some(ErrorKind::Conflict));

        let done = a.await_result(running.job_id).await.unwrap();
        assert_eq!(done.collect_result().unwrap().subscribers_added, 6);

        let after = b.submit(JobSpec::Collect { campaign_id }).await;
        let rerun = b.await_result(after.job_id).await.unwrap();
        assert_eq!(rerun.status, JobStatus::Succeeded);
        assert_eq!(rerun.collect_result().unwrap().subscribers_added, 0);
    }

    #[tokio::test]
    async fn test_second_executor_waits_for_lease() {
        let store = Arc::new(MemoryContactStore::with_write_delay(Duration::from_millis(10)));
        let campaign_id = campaign(&store, 6).await;
        let a = JobExecutor::new(store.clone(), settings());
        let b = JobExecutor::new(store.clone(), settings());

        let first = a.submit(JobSpec::Collect { campaign_id }).await;
        wait_until_running(&a, first.job_id, 0).await;
        let second = b.submit(JobSpec::Collect { campaign_id }).await;

        let first = a.await_result(first.job_id).await.unwrap();
        let second = b.await_result(second.job_id).await.unwrap();

        // The waiting job only ran after the first released the lease
        assert_eq!(first.collect_result().unwrap().subscribers_added, 6);
        assert_eq!(second.status, JobStatus::Succeeded);
        assert_eq!(second.collect_result().unwrap().subscribers_added, 0);
        assert_eq!(store.subscribers(campaign_id).await.unwrap().len(), 6);
    }

    #[tokio::test]
    async fn test_cancel_running_job_keeps_committed_batches() {
        let store = Arc::new(MemoryContactStore::with_write_delay(Duration::from_millis(10)));
        let pb = phonebook(&store, 0).await;
        let mut text = String::from("phone\n");
        for i in 0..20 {
            text.push_str(&format!("55503{:02}\n", i));
        }
        let dir = upload_dir_with("big.csv", &text);
        let executor = JobExecutor::new(
            store.clone(),
            ExecutorSettings {
                upload_dir: dir.clone(),
                ..settings()
            },
        );

        let handle = executor
            .submit(JobSpec::Import {
                phonebook_id: pb,
                file_reference: "big.csv".to_string(),
                column_mapping: ColumnMapping::phone_only("phone"),
                duplicate_policy: DuplicatePolicy::Skip,
            })
            .await;
        wait_until_running(&executor, handle.job_id, 1).await;
        assert!(executor.cancel(handle.job_id));

        let result = executor.await_result(handle.job_id).await.unwrap();
        assert_eq!(result.status, JobStatus::Cancelled);
        assert_eq!(result.error_kind, Some(ErrorKind::Cancelled));
        let partial = result.import_result().unwrap();
        assert!(partial.aborted);
        assert!(partial.rows_inserted < 20);
        assert_eq!(partial.rows_inserted, store.count_contacts(pb).await.unwrap());
        assert_eq!(partial.rows_inserted, partial.batches_committed as u64 * 2);
        assert!(lease_is_free(&store, JobKind::Import, pb).await);

        let _ = std::fs::remove_dir_all(dir);
    }

    fn short_lease_settings() -> ExecutorSettings {
        ExecutorSettings {
            lease_ttl: Duration::from_millis(60),
            collect: CollectSettings {
                batch_size: 1,
                retry: fast_retry(),
            },
            ..settings()
        }
    }

    #[tokio::test]
    async fn test_lease_takeover_stops_running_job() {
        let store = Arc::new(MemoryContactStore::with_write_delay(Duration::from_millis(30)));
        let campaign_id = campaign(&store, 10).await;
        let executor = JobExecutor::new(store.clone(), short_lease_settings());

        let handle = executor.submit(JobSpec::Collect { campaign_id }).await;
        wait_until_running(&executor, handle.job_id, 1).await;

        let key = LeaseKey {
            kind: JobKind::Collect,
            target_id: campaign_id,
        };
        let other = Uuid::new_v4();
        store.release_lease(key, handle.job_id).await.unwrap();
        assert!(store.acquire_lease(key, other, Duration::from_secs(60)).await.unwrap());

        let result = executor.await_result(handle.job_id).await.unwrap();
        assert_eq!(result.status, JobStatus::Failed);
        assert_eq!(result.error_kind, Some(ErrorKind::Conflict));
        let partial = result.collect_result().unwrap();
        assert!(partial.aborted);
        assert!(partial.subscribers_added < 10);
        assert_eq!(
            store.subscribers(campaign_id).await.unwrap().len() as u64,
            partial.subscribers_added
        );

        // The new holder keeps its lease
        assert!(!lease_is_free(&store, JobKind::Collect, campaign_id).await);
        assert!(store.renew_lease(key, other, Duration::from_secs(60)).await.unwrap());
    }

    #[tokio::test]
    async fn test_unrenewable_lease_stops_running_job() {
        let store = Arc::new(MemoryContactStore::with_write_delay(Duration::from_millis(30)));
        let campaign_id = campaign(&store, 10).await;
        let executor = JobExecutor::new(store.clone(), short_lease_settings());

        let handle = executor.submit(JobSpec::Collect { campaign_id }).await;
        wait_until_running(&executor, handle.job_id, 1).await;
        store.set_faults(FaultPlan {
            fail_lease_renewals: true,
            ..FaultPlan::default()
        });

        let result = executor.await_result(handle.job_id).await.unwrap();
        assert_eq!(result.error_kind, Some(ErrorKind::Conflict));
        let partial = result.collect_result().unwrap();
        assert!(partial.aborted);
        assert!(partial.subscribers_added < 10);
    }

    #[tokio::test]
    async fn test_renewal_keeps_lease_past_its_ttl() {
        let store = Arc::new(MemoryContactStore::with_write_delay(Duration::from_millis(30)));
        let campaign_id = campaign(&store, 6).await;
        let executor = JobExecutor::new(store.clone(), short_lease_settings());

        let handle = executor.submit(JobSpec::Collect { campaign_id }).await;
        wait_until_running(&executor, handle.job_id, 4).await;
        // Four batches in, the first TTL has long passed
        assert!(!lease_is_free(&store, JobKind::Collect, campaign_id).await);

        let result = executor.await_result(handle.job_id).await.unwrap();
        assert_eq!(result.status, JobStatus::Succeeded);
        assert_eq!(result.collect_result().unwrap().subscribers_added, 6);
    }

    #[tokio::test]
    async fn test_cancel_queued_job() {
        let store = Arc::new(MemoryContactStore::with_write_delay(Duration::from_millis(5)));
        let busy = campaign(&store, 4).await;
        let waiting = campaign(&store, 4).await;
        let executor = JobExecutor::new(
            store.clone(),
            ExecutorSettings {
                worker_count: 1,
                ..settings()
            },
        );

        let first = executor.submit(JobSpec::Collect { campaign_id: busy }).await;
        let second = executor.submit(JobSpec::Collect { campaign_id: waiting }).await;
        assert!(executor.cancel(second.job_id));

        let cancelled = executor.await_result(second.job_id).await.unwrap();
        assert_eq!(cancelled.status, JobStatus::Cancelled);
        assert!(cancelled.payload.is_none());
        assert!(store.subscribers(waiting).await.unwrap().is_empty());

        let done = executor.await_result(first.job_id).await.unwrap();
        assert_eq!(done.status, JobStatus::Succeeded);
        assert!(!executor.cancel(first.job_id));
    }

    #[tokio::test]
    async fn test_store_failure_reports_partial_counts_and_releases_lease() {
        let store = Arc::new(MemoryContactStore::new());
        let campaign_id = campaign(&store, 6).await;
        store.set_faults(FaultPlan {
            fail_writes_after: Some(1),
            ..FaultPlan::default()
        });
        let executor = JobExecutor::new(store.clone(), settings());

        let handle = executor.submit(JobSpec::Collect { campaign_id }).await;
        let result = executor.await_result(handle.job_id).await.unwrap();

        assert_eq!(result.status, JobStatus::Failed);
        assert_eq!(result.error_kind, Some(ErrorKind::Store));
        let partial = result.collect_result().unwrap();
        assert!(partial.aborted);
        assert_eq!(partial.subscribers_added, 2);
        assert!(lease_is_free(&store, JobKind::Collect, campaign_id).await);
    }

    #[tokio::test]
    async fn test_panic_is_reported_as_internal() {
        let store = Arc::new(MemoryContactStore::new());
        let campaign_id = campaign(&store, 2).await;
        store.set_faults(FaultPlan {
            panic_on_write: true,
            ..FaultPlan::default()
        });
        let executor = JobExecutor::new(store.clone(), settings());

        let handle = executor.submit(JobSpec::Collect { campaign_id }).await;
        let result = executor.await_result(handle.job_id).await.unwrap();

        assert_eq!(result.status, JobStatus::Failed);
        assert_eq!(result.error_kind, Some(ErrorKind::Internal));
        assert!(result.payload.is_none());

        // The lease was released and the executor keeps working
        let retry = executor.submit(JobSpec::Collect { campaign_id }).await;
        let result = executor.await_result(retry.job_id).await.unwrap();
        assert_eq!(result.collect_result().unwrap().subscribers_added, 2);
    }

    #[tokio::test]
    async fn test_unknown_targets_and_bad_input() {
        let store = Arc::new(MemoryContactStore::new());
        let executor = JobExecutor::new(store.clone(), settings());

        let missing = executor.submit(JobSpec::Collect { campaign_id: 404 }).await;
        let result = executor.await_result(missing.job_id).await.unwrap();
        assert_eq!(result.error_kind, Some(ErrorKind::NotFound));

        let pb = phonebook(&store, 0).await;
        let escape = executor
            .submit(JobSpec::Import {
                phonebook_id: pb,
                file_reference: "../etc/passwd".to_string(),
                column_mapping: ColumnMapping::default(),
                duplicate_policy: DuplicatePolicy::Skip,
            })
            .await;
        let result = executor.await_result(escape.job_id).await.unwrap();
        assert_eq!(result.error_kind, Some(ErrorKind::InvalidInput));
    }

    #[tokio::test]
    async fn test_unknown_job_ids() {
        let executor = JobExecutor::new(Arc::new(MemoryContactStore::new()), settings());
        let unknown = Uuid::new_v4();
        assert!(executor.poll(unknown).is_none());
        assert!(executor.await_result(unknown).await.is_none());
        assert!(!executor.cancel(unknown));
    }

    #[tokio::test]
    async fn test_oldest_results_are_evicted() {
        let store = Arc::new(MemoryContactStore::new());
        let executor = JobExecutor::new(
            store.clone(),
            ExecutorSettings {
                max_retained_results: 2,
                ..settings()
            },
        );

        let mut ids = Vec::new();
        for _ in 0..3 {
            let campaign_id = campaign(&store, 1).await;
            let handle = executor.submit(JobSpec::Collect { campaign_id }).await;
            executor.await_result(handle.job_id).await.unwrap();
            ids.push(handle.job_id);
        }

        assert!(executor.poll(ids[0]).is_none());
        assert!(executor.poll(ids[1]).is_some());
        assert!(executor.poll(ids[2]).is_some());
    }

    #[tokio::test]
    async fn test_sweep_collects_started_campaigns_only() {
        let store = Arc::new(MemoryContactStore::new());
        let started = campaign(&store, 2).await;
        let pb = phonebook(&store, 2).await;
        let paused = store.add_campaign("paused", CampaignStatus::Paused, vec![pb]);
        let executor = JobExecutor::new(store.clone(), settings());

        let handles = executor.sweep_started_campaigns().await;
        assert_eq!(handles.len(), 1);
        assert_eq!(handles[0].target_id, started);

        executor.await_result(handles[0].job_id).await.unwrap();
        assert_eq!(store.subscribers(started).await.unwrap().len(), 2);
        assert!(store.subscribers(paused).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_drain_cancels_running_and_queued_jobs() {
        let store = Arc::new(MemoryContactStore::with_write_delay(Duration::from_millis(10)));
        let busy = campaign(&store, 20).await;
        let waiting = campaign(&store, 4).await;
        let executor = JobExecutor::new(
            store.clone(),
            ExecutorSettings {
                worker_count: 1,
                ..settings()
            },
        );

        let running = executor.submit(JobSpec::Collect { campaign_id: busy }).await;
        let queued = executor.submit(JobSpec::Collect { campaign_id: waiting }).await;
        wait_until_running(&executor, running.job_id, 1).await;

        executor.drain().await;

        let running = executor.poll(running.job_id).unwrap();
        let queued = executor.poll(queued.job_id).unwrap();
        for poll in [running, queued] {
            match poll {
                JobPoll::Finished { result } => assert_eq!(result.status, JobStatus::Cancelled),
                other => panic!("job still active after drain: {:?}", other),
            }
        }
        assert!(store.subscribers(busy).await.unwrap().len() < 20);
        assert!(lease_is_free(&store, JobKind::Collect, busy).await);
    }

    #[tokio::test]
    async fn test_shutdown_drains_queue() {
        let store = Arc::new(MemoryContactStore::new());
        let campaign_id = campaign(&store, 3).await;
        let executor = JobExecutor::new(store.clone(), settings());

        executor.submit(JobSpec::Collect { campaign_id }).await;
        executor.shutdown().await;

        assert_eq!(store.subscribers(campaign_id).await.unwrap().len(), 3);
    }
}
