//! Dead-letter entry: what is kept for operators once a job gives up.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::errors::{FailureKind, JobFailure};
use super::ids::DeadLetterId;
use super::job::JobRecord;

/// Full snapshot of the job at the moment it was given up on, plus the
/// error that ended it. Entries are append-only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    pub id: DeadLetterId,
    pub job: JobRecord,
    pub kind: FailureKind,
    pub error: String,
    pub dead_at: DateTime<Utc>,
}

impl DeadLetterEntry {
    pub fn new(
        id: DeadLetterId,
        job: JobRecord,
        failure: &JobFailure,
        dead_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            job,
            kind: failure.kind,
            error: failure.message.clone(),
            dead_at,
        }
    }

    pub fn queue(&self) -> &str {
        &self.job.queue
    }
}
