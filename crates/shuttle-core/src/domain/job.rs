//! Job record, partial updates, and the client-facing view.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::errors::{FailureKind, JobFailure, StoreError};
use super::ids::{BatchId, JobId};
use super::priority::Priority;
use super::state::JobStatus;

/// What a producer submits for one job.
///
/// `priority` / `max_attempts` left as `None` take the configured defaults
/// (5 and 3 out of the box).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewJob {
    pub job_type: String,
    pub payload: Vec<u8>,
    #[serde(default)]
    pub priority: Option<Priority>,
    #[serde(default)]
    pub max_attempts: Option<u32>,
}

impl NewJob {
    pub fn new(job_type: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            job_type: job_type.into(),
            payload: payload.into(),
            priority: None,
            max_attempts: None,
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }
}

/// Single source of truth for a job's lifecycle fields.
///
/// Queue structures hold `JobId` only; everything else lives here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: JobId,
    pub queue: String,
    pub job_type: String,
    pub payload: Vec<u8>,

    /// Current priority (may have been nudged up by retries).
    pub priority: Priority,
    /// Priority at submission; replays start from this one.
    pub base_priority: Priority,

    pub status: JobStatus,

    /// Number of claims so far (including the current one while processing).
    pub attempts: u32,
    pub max_attempts: u32,

    pub created_at: DateTime<Utc>,
    /// Time of the latest insertion into the queue; basis of the score.
    pub enqueued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// When a scheduled retry becomes claimable.
    pub run_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,

    pub last_error: Option<String>,
    /// Kind of the failure that made the job `failed`.
    #[serde(default)]
    pub failure_kind: Option<FailureKind>,
    pub result: Option<Vec<u8>>,
    pub batch_id: Option<BatchId>,
}

impl JobRecord {
    /// Build a pending record. Defaults must already be resolved.
    pub fn new(
        id: JobId,
        queue: impl Into<String>,
        job_type: impl Into<String>,
        payload: Vec<u8>,
        priority: Priority,
        max_attempts: u32,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            queue: queue.into(),
            job_type: job_type.into(),
            payload,
            priority,
            base_priority: priority,
            status: JobStatus::Pending,
            attempts: 0,
            max_attempts,
            created_at: now,
            enqueued_at: now,
            started_at: None,
            completed_at: None,
            run_at: None,
            updated_at: now,
            last_error: None,
            failure_kind: None,
            result: None,
            batch_id: None,
        }
    }

    pub fn in_batch(mut self, batch_id: BatchId) -> Self {
        self.batch_id = Some(batch_id);
        self
    }

    /// Status as a client should see it at `now`.
    ///
    /// A retry whose delay has elapsed is pending, even before a claimer
    /// picks it up.
    pub fn effective_status(&self, now: DateTime<Utc>) -> JobStatus {
        match (self.status, self.run_at) {
            (JobStatus::RetryScheduled, Some(run_at)) if run_at <= now => JobStatus::Pending,
            (status, _) => status,
        }
    }

    pub fn attempts_exhausted(&self) -> bool {
        self.attempts >= self.max_attempts
    }

    /// Apply a partial update (last writer wins).
    ///
    /// Applying the same patch twice yields the same record: `updated_at`
    /// only moves when a field actually changed.
    pub fn apply(&mut self, patch: &JobPatch, now: DateTime<Utc>) -> Result<(), StoreError> {
        if let Some(expected) = patch.if_attempts
            && self.attempts != expected
        {
            return Err(StoreError::Conflict(format!(
                "job {} is on attempt {}, patch was written for attempt {}",
                self.id, self.attempts, expected
            )));
        }
        if let Some(next) = patch.status
            && !self.status.can_transition_to(next)
        {
            return Err(StoreError::Conflict(format!(
                "job {} cannot go from {} to {}",
                self.id, self.status, next
            )));
        }
        if let Some(attempts) = patch.attempts
            && attempts > self.max_attempts
        {
            return Err(StoreError::Conflict(format!(
                "job {} attempts {} would exceed max_attempts {}",
                self.id, attempts, self.max_attempts
            )));
        }

        let before = self.clone();

        if let Some(status) = patch.status {
            self.status = status;
        }
        if let Some(attempts) = patch.attempts {
            self.attempts = attempts;
        }
        if let Some(priority) = patch.priority {
            self.priority = priority;
        }
        if let Some(enqueued_at) = patch.enqueued_at {
            self.enqueued_at = enqueued_at;
        }
        if let Some(started_at) = patch.started_at {
            self.started_at = Some(started_at);
        }
        if let Some(completed_at) = patch.completed_at {
            self.completed_at = Some(completed_at);
        }
        if let Some(run_at) = patch.run_at {
            self.run_at = run_at;
        }
        if let Some(error) = &patch.last_error {
            self.last_error = Some(error.clone());
        }
        if let Some(kind) = patch.failure_kind {
            self.failure_kind = Some(kind);
        }
        if let Some(result) = &patch.result {
            self.result = Some(result.clone());
        }

        if *self != before {
            self.updated_at = now;
        }
        Ok(())
    }
}

/// Partial update of a [`JobRecord`]. `None` leaves the field untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobPatch {
    pub status: Option<JobStatus>,
    pub attempts: Option<u32>,
    pub priority: Option<Priority>,
    pub enqueued_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// `Some(None)` clears the field.
    pub run_at: Option<Option<DateTime<Utc>>>,
    pub last_error: Option<String>,
    pub failure_kind: Option<FailureKind>,
    pub result: Option<Vec<u8>>,
    /// Compare-and-set guard: reject the patch unless the record is still on
    /// this attempt.
    pub if_attempts: Option<u32>,
}

impl JobPatch {
    /// Only apply while the record is still on attempt `attempts`.
    pub fn for_attempt(mut self, attempts: u32) -> Self {
        self.if_attempts = Some(attempts);
        self
    }

    /// A worker claimed the job for attempt number `attempts`.
    pub fn claimed(attempts: u32, now: DateTime<Utc>) -> Self {
        Self {
            status: Some(JobStatus::Processing),
            attempts: Some(attempts),
            started_at: Some(now),
            run_at: Some(None),
            ..Self::default()
        }
    }

    pub fn completed(now: DateTime<Utc>, result: Vec<u8>) -> Self {
        Self {
            status: Some(JobStatus::Completed),
            completed_at: Some(now),
            result: Some(result),
            ..Self::default()
        }
    }

    pub fn retry_scheduled(run_at: DateTime<Utc>, priority: Priority, error: String) -> Self {
        Self {
            status: Some(JobStatus::RetryScheduled),
            priority: Some(priority),
            enqueued_at: Some(run_at),
            run_at: Some(Some(run_at)),
            last_error: Some(error),
            ..Self::default()
        }
    }

    pub fn failed(now: DateTime<Utc>, failure: &JobFailure) -> Self {
        Self {
            status: Some(JobStatus::Failed),
            completed_at: Some(now),
            last_error: Some(failure.message.clone()),
            failure_kind: Some(failure.kind),
            ..Self::default()
        }
    }

    /// Reaper recovery: a stuck claim goes back to pending.
    pub fn requeued(now: DateTime<Utc>, error: String) -> Self {
        Self {
            status: Some(JobStatus::Pending),
            enqueued_at: Some(now),
            run_at: Some(None),
            last_error: Some(error),
            ..Self::default()
        }
    }
}

/// Serializable view of a job for status queries. The payload is left out.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobView {
    pub id: JobId,
    pub queue: String,
    pub job_type: String,
    pub status: JobStatus,
    pub priority: Priority,
    pub attempts: u32,
    pub max_attempts: u32,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub run_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub result: Option<Vec<u8>>,
    pub batch_id: Option<BatchId>,
}

impl JobView {
    pub fn from_record(record: &JobRecord, now: DateTime<Utc>) -> Self {
        Self {
            id: record.id,
            queue: record.queue.clone(),
            job_type: record.job_type.clone(),
            status: record.effective_status(now),
            priority: record.priority,
            attempts: record.attempts,
            max_attempts: record.max_attempts,
            created_at: record.created_at,
            started_at: record.started_at,
            completed_at: record.completed_at,
            run_at: record.run_at,
            last_error: record.last_error.clone(),
            result: record.result.clone(),
            batch_id: record.batch_id,
        }
    }
}
