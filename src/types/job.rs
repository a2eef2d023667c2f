//! Background job types
//!
//! A job is one pipeline invocation (import or collection) against one target.
//! Callers receive a `JobHandle` on submission and later poll or await a
//! `JobResult`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::campaign::{CampaignId, CollectResult};
use super::import::{ColumnMapping, DuplicatePolicy, ImportResult};
use super::phonebook::PhonebookId;

/// Which pipeline a job runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Import,
    Collect,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Import => "import",
            JobKind::Collect => "collect",
        }
    }
}

impl std::fmt::Display for JobKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Exclusive-execution key: at most one job per `(kind, target)` runs at a time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaseKey {
    pub kind: JobKind,
    pub target_id: i64,
}

impl std::fmt::Display for LeaseKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.kind, self.target_id)
    }
}

/// What to run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobSpec {
    #[serde(rename_all = "camelCase")]
    Import {
        phonebook_id: PhonebookId,
        file_reference: String,
        column_mapping: ColumnMapping,
        #[serde(default)]
        duplicate_policy: DuplicatePolicy,
    },
    #[serde(rename_all = "camelCase")]
    Collect { campaign_id: CampaignId },
}

impl JobSpec {
    pub fn kind(&self) -> JobKind {
        match self {
            JobSpec::Import { .. } => JobKind::Import,
            JobSpec::Collect { .. } => JobKind::Collect,
        }
    }

    pub fn target_id(&self) -> i64 {
        match self {
            JobSpec::Import { phonebook_id, .. } => *phonebook_id,
            JobSpec::Collect { campaign_id } => *campaign_id,
        }
    }

    pub fn lease_key(&self) -> LeaseKey {
        LeaseKey {
            kind: self.kind(),
            target_id: self.target_id(),
        }
    }
}

/// Returned on submission
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobHandle {
    pub job_id: Uuid,
    pub kind: JobKind,
    pub target_id: i64,
    /// True when the submission joined an already queued or running job
    pub coalesced: bool,
}

/// Terminal status of a job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Succeeded,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }
}

/// Failure category reported to callers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Conflict,
    Store,
    Cancelled,
    InvalidInput,
    NotFound,
    Internal,
}

/// Pipeline-specific counts, complete or partial
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum JobPayload {
    Import(ImportResult),
    Collect(CollectResult),
}

impl JobPayload {
    /// One-line summary for logs and job history
    pub fn summary(&self) -> String {
        match self {
            JobPayload::Import(r) => format!(
                "{} rows: {} inserted, {} updated, {} duplicates, {} invalid",
                r.rows_total, r.rows_inserted, r.rows_updated, r.rows_skipped_duplicate, r.rows_invalid
            ),
            JobPayload::Collect(r) => format!(
                "{} subscribers added from {} phonebooks",
                r.subscribers_added, r.phonebooks_scanned
            ),
        }
    }
}

/// Structured terminal result of a job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobResult {
    pub job_id: Uuid,
    pub kind: JobKind,
    pub target_id: i64,
    pub status: JobStatus,
    pub error_kind: Option<ErrorKind>,
    pub message: Option<String>,
    pub payload: Option<JobPayload>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl JobResult {
    pub fn import_result(&self) -> Option<&ImportResult> {
        match &self.payload {
            Some(JobPayload::Import(r)) => Some(r),
            _ => None,
        }
    }

    pub fn collect_result(&self) -> Option<&CollectResult> {
        match &self.payload {
            Some(JobPayload::Collect(r)) => Some(r),
            _ => None,
        }
    }
}

/// Progress of a running job, updated after every committed batch
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobProgress {
    pub batches_committed: u32,
    pub rows_processed: u64,
}

/// Answer to a result poll
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum JobPoll {
    Queued,
    Running { progress: JobProgress },
    Finished { result: JobResult },
}

impl JobPoll {
    pub fn is_finished(&self) -> bool {
        matches!(self, JobPoll::Finished { .. })
    }
}
