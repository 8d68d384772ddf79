//! Errors - エラー型と分類
//!
//! - `HandlerError`: handler が返すエラー（Transient / Permanent）
//! - `FailureKind` / `JobFailure`: 1 回の attempt の失敗分類
//! - `StoreError`: 永続化ストア（port）のエラー
//! - `QueueError`: 利用者に見えるエラー（not found と store unavailable を区別）

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::ids::{BatchId, DeadLetterId, JobId};

/// Error returned by a job handler.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HandlerError {
    /// Retryable; goes through backoff.
    #[error("transient: {0}")]
    Transient(String),

    /// Retrying is pointless; the job goes straight to the dead-letter store.
    #[error("permanent: {0}")]
    Permanent(String),
}

impl HandlerError {
    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Transient(msg.into())
    }

    pub fn permanent(msg: impl Into<String>) -> Self {
        Self::Permanent(msg.into())
    }
}

/// Classification of a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Transient,
    Permanent,
    UnknownJobType,
    DeadlineExceeded,
    /// The handler panicked. Treated like a transient error.
    Panicked,
    /// Found stuck in `processing` by the reaper with no attempts left.
    Abandoned,
}

impl FailureKind {
    /// Whether another attempt may succeed (subject to `max_attempts`).
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            FailureKind::Transient | FailureKind::DeadlineExceeded | FailureKind::Panicked
        )
    }
}

/// A failed attempt: what kind of failure and the message kept for operators.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("{kind:?}: {message}")]
pub struct JobFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl JobFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn unknown_job_type(job_type: &str) -> Self {
        Self::new(
            FailureKind::UnknownJobType,
            format!("no handler registered for job_type={job_type}"),
        )
    }
}

impl From<HandlerError> for JobFailure {
    fn from(err: HandlerError) -> Self {
        match err {
            HandlerError::Transient(msg) => Self::new(FailureKind::Transient, msg),
            HandlerError::Permanent(msg) => Self::new(FailureKind::Permanent, msg),
        }
    }
}

/// Error raised by a store port.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// The backing store is unreachable. The caller retries with its own backoff.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// The write would break an invariant (illegal status edge, counter overflow).
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("record not found: {0}")]
    NotFound(String),
}

/// User-visible error of the submission / query / replay API.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("job not found: {0}")]
    JobNotFound(JobId),

    #[error("batch not found: {0}")]
    BatchNotFound(BatchId),

    #[error("dead letter not found: {0}")]
    DeadLetterNotFound(DeadLetterId),

    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("store conflict: {0}")]
    Conflict(String),

    #[error("priority {0} is outside 1..=10")]
    InvalidPriority(u8),

    #[error("max_attempts must be at least 1")]
    InvalidMaxAttempts,

    #[error("batch must contain at least one job")]
    EmptyBatch,

    #[error("payload encode: {0}")]
    Encode(String),

    #[error("handler registry: {0}")]
    Registry(String),

    #[error("configuration: {0}")]
    Config(String),
}

impl From<StoreError> for QueueError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Unavailable(msg) => QueueError::StoreUnavailable(msg),
            StoreError::Conflict(msg) => QueueError::Conflict(msg),
            StoreError::NotFound(msg) => QueueError::StoreUnavailable(format!(
                "record vanished during operation: {msg}"
            )),
        }
    }
}
