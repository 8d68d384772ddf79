//! Batch record: aggregate counters for jobs submitted together.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::errors::StoreError;
use super::ids::{BatchId, JobId};

/// Terminal outcome of one member job, as counted by its batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchOutcome {
    Completed,
    Failed,
}

/// Counters of a batch.
///
/// Invariant: `completed + failed <= total`. `counted` makes
/// [`BatchRecord::record`] idempotent per member job without scanning jobs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchRecord {
    pub id: BatchId,
    pub queue: String,
    pub total: u32,
    pub completed: u32,
    pub failed: u32,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    counted: HashSet<JobId>,
}

impl BatchRecord {
    pub fn new(id: BatchId, queue: impl Into<String>, total: u32, now: DateTime<Utc>) -> Self {
        Self {
            id,
            queue: queue.into(),
            total,
            completed: 0,
            failed: 0,
            created_at: now,
            counted: HashSet::new(),
        }
    }

    /// Count the terminal outcome of `job_id`.
    ///
    /// Returns `Ok(false)` when this member was already counted.
    pub fn record(&mut self, job_id: JobId, outcome: BatchOutcome) -> Result<bool, StoreError> {
        if self.counted.contains(&job_id) {
            return Ok(false);
        }
        if self.resolved() >= self.total {
            return Err(StoreError::Conflict(format!(
                "batch {} already has {} of {} jobs resolved",
                self.id,
                self.resolved(),
                self.total
            )));
        }
        match outcome {
            BatchOutcome::Completed => self.completed += 1,
            BatchOutcome::Failed => self.failed += 1,
        }
        self.counted.insert(job_id);
        Ok(true)
    }

    pub fn resolved(&self) -> u32 {
        self.completed + self.failed
    }

    pub fn is_done(&self) -> bool {
        self.resolved() == self.total
    }

    pub fn view(&self) -> BatchView {
        BatchView {
            batch_id: self.id,
            total: self.total,
            completed: self.completed,
            failed: self.failed,
            pending: self.total - self.resolved(),
            done: self.is_done(),
        }
    }
}

/// Serializable batch status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchView {
    pub batch_id: BatchId,
    pub total: u32,
    pub completed: u32,
    pub failed: u32,
    /// Members not yet terminally resolved (queued, running or retrying).
    pub pending: u32,
    pub done: bool,
}
