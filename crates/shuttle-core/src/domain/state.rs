//! Job status state machine.

use serde::{Deserialize, Serialize};

/// Job status.
///
/// State transitions:
/// - Pending -> Processing -> Completed
/// - Pending -> Processing -> RetryScheduled -> Pending -> Processing -> ...
/// - Pending -> Processing -> Failed (retries exhausted, moved to dead-letter)
/// - Processing -> Pending (reaper recovery only)
///
/// No transition skips `Processing`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting in the priority queue.
    Pending,

    /// Claimed by a worker.
    Processing,

    /// Handler succeeded.
    Completed,

    /// Waiting for the backoff delay before going back to pending.
    RetryScheduled,

    /// Retries exhausted (or permanent failure); a dead-letter entry exists.
    Failed,
}

impl JobStatus {
    /// Is this a terminal state (no further transitions)?
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    /// Whether `self -> next` is a legal edge.
    ///
    /// Self-edges are legal so a re-delivered write leaves the record unchanged.
    /// `RetryScheduled -> Processing` covers the implicit pending leg: the
    /// store promotes a retry to pending once its delay elapses and a claimer
    /// takes it from there.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        use JobStatus::*;
        if self == next {
            return true;
        }
        matches!(
            (self, next),
            (Pending, Processing)
                | (Processing, Completed)
                | (Processing, RetryScheduled)
                | (Processing, Failed)
                | (Processing, Pending)
                | (RetryScheduled, Pending)
                | (RetryScheduled, Processing)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::RetryScheduled => "retry_scheduled",
            JobStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
