//! Reaper - `processing` のまま止まった job の回収
//!
//! # フロー（interval ごと）
//! 1. 全 queue の in-flight claim を列挙
//! 2. `claimed_at + deadline(job_type) + stuck_grace` を過ぎたものだけ対象
//! 3. record の状態で分岐
//!    - terminal: batch の集計と dead-letter を（冪等に）やり直してから marker を外す
//!    - pending / retry_scheduled（worker が queue 操作の前に落ちた）: そのまま再投入
//!    - processing で attempts が残っている: `pending` に戻して再投入
//!    - processing で attempts が尽きている: `Abandoned` として dead-letter
//!
//! 生きている worker は deadline で handler を打ち切るので、grace を
//! 十分に取れば通常の実行と競合しません。それでも同じ job が二度走る
//! 可能性はあり（at-least-once）、handler は冪等であるべきです。

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::app::batch::BatchTracker;
use crate::app::metrics::JobCounters;
use crate::app::retry::RetryScheduler;
use crate::domain::{BatchOutcome, FailureKind, JobFailure, JobPatch, JobStatus, StoreError};
use crate::impls::Stores;
use crate::ports::{Claim, Clock, QueueEntry};
use crate::runtime::HandlerRegistry;

/// Counts of one reaper pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReapReport {
    pub requeued: usize,
    pub dead_lettered: usize,
    pub released: usize,
}

impl ReapReport {
    pub fn total(&self) -> usize {
        self.requeued + self.dead_lettered + self.released
    }
}

pub struct Reaper {
    stores: Stores,
    registry: Arc<HandlerRegistry>,
    scheduler: RetryScheduler,
    batches: BatchTracker,
    clock: Arc<dyn Clock>,
    counters: Arc<JobCounters>,
    interval: Duration,
    stuck_grace: Duration,
}

impl Reaper {
    pub fn new(
        stores: Stores,
        registry: Arc<HandlerRegistry>,
        scheduler: RetryScheduler,
        batches: BatchTracker,
        clock: Arc<dyn Clock>,
        counters: Arc<JobCounters>,
        interval: Duration,
        stuck_grace: Duration,
    ) -> Self {
        Self {
            stores,
            registry,
            scheduler,
            batches,
            clock,
            counters,
            interval,
            stuck_grace,
        }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // the first tick fires immediately; nothing can be stuck yet
        ticker.tick().await;

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    // a dropped sender means the owner is gone
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    match self.reap_once().await {
                        Ok(report) if report.total() > 0 => {
                            info!(
                                requeued = report.requeued,
                                dead_lettered = report.dead_lettered,
                                released = report.released,
                                "reaper pass reconciled stuck claims"
                            );
                        }
                        Ok(_) => debug!("reaper pass found nothing"),
                        Err(e) => warn!(error = %e, "reaper pass failed"),
                    }
                }
            }
        }
        debug!("reaper stopped");
    }

    /// One pass over every queue.
    pub async fn reap_once(&self) -> Result<ReapReport, StoreError> {
        let mut report = ReapReport::default();
        let now = self.clock.now();

        for queue in self.stores.queue.queue_names() {
            for claim in self.stores.queue.in_flight(&queue).await? {
                let action = match self.reconcile(&claim, now).await {
                    Ok(action) => action,
                    Err(StoreError::Conflict(msg)) | Err(StoreError::NotFound(msg)) => {
                        // the owning worker got there first
                        debug!(job_id = %claim.job_id, reason = %msg, "claim moved on during reap");
                        None
                    }
                    Err(e) => return Err(e),
                };
                match action {
                    Some(Action::Requeued) => report.requeued += 1,
                    Some(Action::DeadLettered) => report.dead_lettered += 1,
                    Some(Action::Released) => report.released += 1,
                    None => continue,
                }
                self.counters.reaped();
            }
        }
        Ok(report)
    }

    async fn reconcile(&self, claim: &Claim, now: DateTime<Utc>) -> Result<Option<Action>, StoreError> {
        let Some(record) = self.stores.status.get(claim.job_id).await? else {
            if !self.is_stuck(claim, "", now) {
                return Ok(None);
            }
            warn!(job_id = %claim.job_id, queue = %claim.queue, "in-flight job has no record, releasing");
            self.stores.queue.release(claim).await?;
            return Ok(Some(Action::Released));
        };
        if !self.is_stuck(claim, &record.job_type, now) {
            return Ok(None);
        }

        match record.status {
            JobStatus::Completed | JobStatus::Failed => {
                // the worker may have been stranded between the status write
                // and these; both are idempotent per job
                if record.status == JobStatus::Completed {
                    self.batches.record_outcome(&record, BatchOutcome::Completed).await?;
                } else {
                    self.scheduler.file_dead_letter(&record).await?;
                }
                self.stores.queue.release(claim).await?;
                info!(job_id = %record.id, status = %record.status, "released marker of finished job");
                Ok(Some(Action::Released))
            }
            JobStatus::Pending | JobStatus::RetryScheduled => {
                self.stores
                    .queue
                    .requeue(claim, QueueEntry::for_record(&record))
                    .await?;
                warn!(job_id = %record.id, status = %record.status, "re-queued claim that never started");
                Ok(Some(Action::Requeued))
            }
            JobStatus::Processing if record.attempts_exhausted() => {
                let failure = JobFailure::new(
                    FailureKind::Abandoned,
                    format!(
                        "stuck in processing since {} with no attempts left",
                        claim.claimed_at
                    ),
                );
                self.scheduler.give_up(&record, &failure).await?;
                self.stores.queue.release(claim).await?;
                Ok(Some(Action::DeadLettered))
            }
            JobStatus::Processing => {
                let patch = JobPatch::requeued(
                    now,
                    format!("stuck in processing since {}", claim.claimed_at),
                )
                .for_attempt(record.attempts);
                let updated = self
                    .stores
                    .status
                    .update(record.id, patch)
                    .await?
                    .ok_or_else(|| StoreError::NotFound(format!("job {}", record.id)))?;
                // status first, then the queue; requeue also drops the stale lease
                self.stores
                    .queue
                    .requeue(claim, QueueEntry::for_record(&updated))
                    .await?;
                warn!(
                    job_id = %record.id,
                    queue = %record.queue,
                    attempt = record.attempts,
                    max_attempts = record.max_attempts,
                    "stuck job returned to pending"
                );
                Ok(Some(Action::Requeued))
            }
        }
    }

    fn is_stuck(&self, claim: &Claim, job_type: &str, now: DateTime<Utc>) -> bool {
        let limit = self.registry.deadline(job_type) + self.stuck_grace;
        match (now - claim.claimed_at).to_std() {
            Ok(age) => age > limit,
            Err(_) => false,
        }
    }
}

enum Action {
    Requeued,
    DeadLettered,
    Released,
}
