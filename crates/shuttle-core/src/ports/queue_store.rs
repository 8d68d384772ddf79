//! PriorityQueueStore port - 優先度付きキューと in-flight 集合
//!
//! # 設計原則
//! - キューは `JobId` と順序キーのみを持つ（状態・payload は JobStatusTable）
//! - `claim_next` は pending からの削除と in-flight への登録を 1 つの操作で行う
//! - `block_timeout` 付きで待つので、ワーカーは shutdown を定期的に確認できる

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{JobId, JobRecord, Priority, StoreError, score};

/// One insertion into a queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueEntry {
    pub queue: String,
    pub job_id: JobId,
    pub priority: Priority,
    /// Basis of the score.
    pub enqueued_at: DateTime<Utc>,
    /// Not claimable before this instant (retry backoff).
    pub available_at: DateTime<Utc>,
}

impl QueueEntry {
    /// Entry for a record as it stands in the status table.
    pub fn for_record(record: &JobRecord) -> Self {
        Self {
            queue: record.queue.clone(),
            job_id: record.id,
            priority: record.priority,
            enqueued_at: record.enqueued_at,
            available_at: record.run_at.unwrap_or(record.enqueued_at),
        }
    }

    pub fn score(&self) -> i64 {
        score(self.enqueued_at, self.priority)
    }
}

/// A successful claim: the job is now in-flight for this queue.
///
/// `lease` identifies this particular claim. A job re-queued by the reaper
/// and claimed again gets a new lease, so a stale holder can no longer
/// release or re-queue it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Claim {
    pub queue: String,
    pub job_id: JobId,
    pub lease: u64,
    pub claimed_at: DateTime<Utc>,
}

/// Approximate per-queue gauges.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueDepth {
    /// Claimable now.
    pub pending: usize,
    /// Waiting for a retry delay.
    pub scheduled: usize,
    /// Claimed and not yet released.
    pub processing: usize,
}

#[async_trait]
pub trait PriorityQueueStore: Send + Sync {
    /// Insert a job. Any entry already pending for the same id is replaced.
    async fn push(&self, entry: QueueEntry) -> Result<(), StoreError>;

    /// Atomically take the lowest-score claimable job and mark it in-flight.
    ///
    /// Exactly one caller receives any given job. Returns `None` when nothing
    /// became claimable within `block_timeout`. Must be cancel-safe: a
    /// dropped future has either claimed nothing or already returned.
    async fn claim_next(
        &self,
        queue: &str,
        block_timeout: Duration,
    ) -> Result<Option<Claim>, StoreError>;

    /// Atomically drop the in-flight marker of `claim` and insert `entry`.
    ///
    /// Fails with `NotFound` when `claim` no longer holds the job, so two
    /// parties cannot both re-queue the same claim.
    async fn requeue(&self, claim: &Claim, entry: QueueEntry) -> Result<(), StoreError>;

    /// Drop the in-flight marker of `claim`. Returns `false` if it was
    /// already gone (or now belongs to a newer claim).
    async fn release(&self, claim: &Claim) -> Result<bool, StoreError>;

    /// Snapshot of the in-flight set of a queue.
    async fn in_flight(&self, queue: &str) -> Result<Vec<Claim>, StoreError>;

    /// Approximate gauges; must not contend with claimers.
    fn depth(&self, queue: &str) -> QueueDepth;

    /// Queues this store has seen.
    fn queue_names(&self) -> Vec<String>;
}
