//! Job history service
//!
//! Stores recent job completions in memory with optional file-backed
//! persistence so history survives worker restarts.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;
use chrono::{DateTime, Utc};

use crate::types::{JobHistoryRequest, JobKind, JobResult, JobStatus};

const MAX_HISTORY_SIZE: usize = 100;

/// Job entry in history
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobHistoryEntry {
    pub id: Uuid,
    pub kind: JobKind,
    pub target_id: i64,
    pub status: JobStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub error: Option<String>,
    pub details: Option<String>,
}

impl From<&JobResult> for JobHistoryEntry {
    fn from(result: &JobResult) -> Self {
        let duration_ms = (result.finished_at - result.started_at).num_milliseconds().max(0) as u64;
        Self {
            id: result.job_id,
            kind: result.kind,
            target_id: result.target_id,
            status: result.status,
            started_at: result.started_at,
            completed_at: result.finished_at,
            duration_ms,
            error: result.message.clone(),
            details: result.payload.as_ref().map(|p| p.summary()),
        }
    }
}

/// Response for listing job history
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobHistoryResponse {
    pub jobs: Vec<JobHistoryEntry>,
    pub total: usize,
}

/// Job history storage backed by an in-memory deque + JSON file on disk.
pub struct JobHistoryService {
    history: Arc<RwLock<VecDeque<JobHistoryEntry>>>,
    file: Option<PathBuf>,
}

impl JobHistoryService {
    /// Create the service, loading earlier entries from `file` if it exists
    pub fn new(file: Option<PathBuf>) -> Self {
        let mut deque = VecDeque::with_capacity(MAX_HISTORY_SIZE);
        if let Some(loaded) = file.as_deref().and_then(Self::load_from_disk) {
            for entry in loaded.into_iter().take(MAX_HISTORY_SIZE) {
                deque.push_back(entry);
            }
            info!("Loaded {} job history entries from disk", deque.len());
        }
        Self {
            history: Arc::new(RwLock::new(deque)),
            file,
        }
    }

    /// Record a finished job
    pub fn record(&self, result: &JobResult) {
        let mut history = self.history.write();

        if history.len() >= MAX_HISTORY_SIZE {
            history.pop_back();
        }

        history.push_front(JobHistoryEntry::from(result));

        if let Some(file) = &self.file {
            Self::save_to_disk(file, &history);
        }
    }

    /// Answer a history request, most recent first
    pub fn query(&self, request: &JobHistoryRequest) -> JobHistoryResponse {
        let history = self.history.read();
        let jobs: Vec<JobHistoryEntry> = history
            .iter()
            .filter(|j| request.kind.map_or(true, |kind| j.kind == kind))
            .filter(|j| request.status.map_or(true, |status| j.status == status))
            .take(request.limit)
            .cloned()
            .collect();
        let total = jobs.len();

        JobHistoryResponse { jobs, total }
    }

    #[cfg(test)]
    pub fn get_recent(&self, limit: usize) -> JobHistoryResponse {
        self.query(&JobHistoryRequest {
            limit,
            kind: None,
            status: None,
        })
    }

    fn load_from_disk(path: &Path) -> Option<Vec<JobHistoryEntry>> {
        if !path.exists() {
            return None;
        }
        match std::fs::read_to_string(path) {
            Ok(content) => match serde_json::from_str::<Vec<JobHistoryEntry>>(&content) {
                Ok(entries) => Some(entries),
                Err(e) => {
                    warn!("Failed to parse job history file: {}", e);
                    None
                }
            },
            Err(e) => {
                warn!("Failed to read job history file: {}", e);
                None
            }
        }
    }

    fn save_to_disk(path: &Path, history: &VecDeque<JobHistoryEntry>) {
        if let Some(dir) = path.parent() {
            if let Err(e) = std::fs::create_dir_all(dir) {
                warn!("Failed to create job history directory: {}", e);
                return;
            }
        }
        let entries: Vec<&JobHistoryEntry> = history.iter().collect();
        match serde_json::to_string_pretty(&entries) {
            Ok(json) => {
                if let Err(e) = std::fs::write(path, json) {
                    warn!("Failed to write job history file: {}", e);
                }
            }
            Err(e) => warn!("Failed to serialize job history: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{CollectResult, ErrorKind, JobPayload};

    fn fresh_service() -> JobHistoryService {
        JobHistoryService::new(None)
    }

    fn result(kind: JobKind, status: JobStatus) -> JobResult {
        let finished_at = Utc::now();
        JobResult {
            job_id: Uuid::new_v4(),
            kind,
            target_id: 7,
            status,
            error_kind: (status == JobStatus::Failed).then_some(ErrorKind::Store),
            message: (status == JobStatus::Failed).then(|| "Connection timeout".to_string()),
            payload: Some(JobPayload::Collect(CollectResult {
                subscribers_added: 5,
                phonebooks_scanned: 1,
                batches_committed: 1,
                aborted: false,
            })),
            started_at: finished_at - chrono::Duration::seconds(5),
            finished_at,
        }
    }

    #[test]
    fn test_record_succeeded_job() {
        let service = fresh_service();
        let job = result(JobKind::Collect, JobStatus::Succeeded);

        service.record(&job);

        let history = service.get_recent(10);
        assert_eq!(history.jobs.len(), 1);
        assert_eq!(history.jobs[0].id, job.job_id);
        assert_eq!(history.jobs[0].status, JobStatus::Succeeded);
        assert_eq!(history.jobs[0].target_id, 7);
        assert_eq!(history.jobs[0].duration_ms, 5000);
        assert_eq!(
            history.jobs[0].details.as_deref(),
            Some("5 subscribers added from 1 phonebooks")
        );
    }

    #[test]
    fn test_record_failed_job() {
        let service = fresh_service();
        service.record(&result(JobKind::Import, JobStatus::Failed));

        let history = service.get_recent(10);
        assert_eq!(history.jobs[0].status, JobStatus::Failed);
        assert_eq!(history.jobs[0].error, Some("Connection timeout".to_string()));
    }

    #[test]
    fn test_history_limit() {
        let service = fresh_service();

        for _ in 0..150 {
            service.record(&result(JobKind::Collect, JobStatus::Succeeded));
        }

        let history = service.get_recent(200);
        assert_eq!(history.jobs.len(), MAX_HISTORY_SIZE);
    }

    #[test]
    fn test_most_recent_first() {
        let service = fresh_service();
        let older = result(JobKind::Import, JobStatus::Succeeded);
        let newer = result(JobKind::Collect, JobStatus::Succeeded);
        service.record(&older);
        service.record(&newer);

        let history = service.get_recent(1);
        assert_eq!(history.jobs[0].id, newer.job_id);
    }

    #[test]
    fn test_filter_by_kind_and_status() {
        let service = fresh_service();

        service.record(&result(JobKind::Import, JobStatus::Succeeded));
        service.record(&result(JobKind::Collect, JobStatus::Succeeded));
        service.record(&result(JobKind::Import, JobStatus::Cancelled));

        let imports = service.query(&JobHistoryRequest {
            limit: 10,
            kind: Some(JobKind::Import),
            status: None,
        });
        assert_eq!(imports.jobs.len(), 2);
        let cancelled = service.query(&JobHistoryRequest {
            limit: 10,
            kind: None,
            status: Some(JobStatus::Cancelled),
        });
        assert_eq!(cancelled.jobs.len(), 1);

        let both = service.query(&JobHistoryRequest {
            limit: 10,
            kind: Some(JobKind::Import),
            status: Some(JobStatus::Succeeded),
        });
        assert_eq!(both.total, 1);
    }

    #[test]
    fn test_persists_across_instances() {
        let path = std::env::temp_dir().join(format!("job-history-{}.json", Uuid::new_v4()));

        let service = JobHistoryService::new(Some(path.clone()));
        let job = result(JobKind::Collect, JobStatus::Succeeded);
        service.record(&job);

        let reloaded = JobHistoryService::new(Some(path.clone()));
        let history = reloaded.get_recent(10);
        assert_eq!(history.jobs.len(), 1);
        assert_eq!(history.jobs[0].id, job.job_id);

        let _ = std::fs::remove_file(path);
    }
}
