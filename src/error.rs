//! Job and store error types

use thiserror::Error;

use crate::types::{ErrorKind, LeaseKey};

/// Persistence fault raised by a `ContactStore`
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    /// Connection lost, pool exhausted or timed out
    #[error("store unavailable: {0}")]
    Unavailable(String),
    /// Serialization failure or deadlock; the transaction was rolled back
    #[error("store contention: {0}")]
    Contention(String),
    #[error("store query failed: {0}")]
    Query(String),
    /// Stored data that cannot be decoded
    #[error("corrupt store data: {0}")]
    Corrupt(String),
}

impl StoreError {
    /// Whether retrying the same operation may succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Unavailable(_) | StoreError::Contention(_))
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed
            | sqlx::Error::Protocol(_) => StoreError::Unavailable(err.to_string()),
            sqlx::Error::Database(db_err) => match db_err.code().as_deref() {
                // serialization_failure, deadlock_detected
                Some("40001") | Some("40P01") => StoreError::Contention(err.to_string()),
                // connection_exception class, admin_shutdown, cannot_connect_now
                Some(code) if code.starts_with("08") || code == "57P01" || code == "57P03" => {
                    StoreError::Unavailable(err.to_string())
                }
                _ => StoreError::Query(err.to_string()),
            },
            sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) | sqlx::Error::TypeNotFound { .. } => {
                StoreError::Corrupt(err.to_string())
            }
            _ => StoreError::Query(err.to_string()),
        }
    }
}

/// Job-level fault. Always converted into a `JobResult` before reaching a caller.
#[derive(Debug, Clone, Error)]
pub enum JobError {
    #[error("{0} is already being processed")]
    Conflict(LeaseKey),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("job cancelled")]
    Cancelled,
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("{0} not found")]
    NotFound(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl JobError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            JobError::Conflict(_) => ErrorKind::Conflict,
            JobError::Store(_) => ErrorKind::Store,
            JobError::Cancelled => ErrorKind::Cancelled,
            JobError::InvalidInput(_) => ErrorKind::InvalidInput,
            JobError::NotFound(_) => ErrorKind::NotFound,
            JobError::Internal(_) => ErrorKind::Internal,
        }
    }
}

/// A pipeline run that stopped early, with the counts of the batches it
/// committed before stopping.
#[derive(Debug, Clone)]
pub struct Interrupted<T> {
    pub partial: T,
    pub cause: JobError,
}

impl<T> Interrupted<T> {
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Interrupted<U> {
        Interrupted {
            partial: f(self.partial),
            cause: self.cause,
        }
    }
}
