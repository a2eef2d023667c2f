//! Cancellation registry for background jobs
//!
//! Provides cooperative cancellation keyed by job id and RAII-based automatic
//! cleanup via `JobGuard`. Pipelines observe cancellation through `RunControl`
//! at batch boundaries only.

use std::collections::HashMap;
use std::sync::Arc;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::types::JobProgress;

/// RAII guard that automatically removes the job from the registry when dropped.
/// Must be kept alive from submission until the job has a terminal result.
pub struct JobGuard {
    job_id: Uuid,
    token: CancellationToken,
    registry: CancellationRegistry,
}

impl JobGuard {
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }
}

impl Drop for JobGuard {
    fn drop(&mut self) {
        self.registry.remove(&self.job_id);
    }
}

/// Thread-safe registry of queued and running jobs and their cancellation tokens.
#[derive(Clone, Default)]
pub struct CancellationRegistry {
    jobs: Arc<Mutex<HashMap<Uuid, CancellationToken>>>,
}

impl CancellationRegistry {
    /// Register a job. Returns a `JobGuard` that must be held until the job
    /// finishes. When the guard is dropped, the job is removed from the registry.
    pub fn register(&self, job_id: Uuid) -> JobGuard {
        let token = CancellationToken::new();
        self.jobs.lock().insert(job_id, token.clone());
        JobGuard {
            job_id,
            token,
            registry: self.clone(),
        }
    }

    /// Cancel a job.
    ///
    /// Returns `true` if the job was queued or running, `false` if it is
    /// unknown or already finished.
    pub fn cancel(&self, job_id: &Uuid) -> bool {
        match self.jobs.lock().get(job_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancel every registered job. Returns how many there were.
    pub fn cancel_all(&self) -> usize {
        let jobs = self.jobs.lock();
        for token in jobs.values() {
            token.cancel();
        }
        jobs.len()
    }

    /// Check if a job has been cancelled
    #[cfg(test)]
    fn is_cancelled(&self, job_id: &Uuid) -> bool {
        self.jobs.lock()
            .get(job_id)
            .map_or(false, |token| token.is_cancelled())
    }

    /// Remove a finished job from the registry.
    /// Called automatically by `JobGuard::drop`.
    pub fn remove(&self, job_id: &Uuid) {
        self.jobs.lock().remove(job_id);
    }

    #[cfg(test)]
    fn contains(&self, job_id: &Uuid) -> bool {
        self.jobs.lock().contains_key(job_id)
    }
}

type ProgressFn = Arc<dyn Fn(JobProgress) + Send + Sync>;

/// What a running pipeline sees of its job: the cancellation signal and a
/// progress sink.
#[derive(Clone)]
pub struct RunControl {
    token: CancellationToken,
    on_progress: Option<ProgressFn>,
}

impl RunControl {
    pub fn new(token: CancellationToken) -> Self {
        Self {
            token,
            on_progress: None,
        }
    }

    /// Control for a run outside the executor: never cancelled, progress ignored
    pub fn detached() -> Self {
        Self::new(CancellationToken::new())
    }

    pub fn with_progress(mut self, on_progress: impl Fn(JobProgress) + Send + Sync + 'static) -> Self {
        self.on_progress = Some(Arc::new(on_progress));
        self
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn report(&self, progress: JobProgress) {
        if let Some(on_progress) = &self.on_progress {
            on_progress(progress);
        }
    }
}
