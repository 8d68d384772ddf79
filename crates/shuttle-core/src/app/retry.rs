//! Retry policy and scheduler.
//!
//! `RetryPolicy::decide` is pure (record + failure + now -> decision), so
//! backoff and the attempt ceiling are testable without a clock.
//! `RetryScheduler` applies the decision to the stores.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, error, warn};

use crate::app::batch::BatchTracker;
use crate::app::metrics::JobCounters;
use crate::app::store_retry::StoreRetry;
use crate::config::RetryConfig;
use crate::domain::{
    BatchOutcome, DeadLetterEntry, DeadLetterId, FailureKind, JobFailure, JobPatch, JobRecord,
    Priority, StoreError,
};
use crate::impls::Stores;
use crate::ports::{Claim, Clock, IdGenerator, QueueEntry};

/// Retry policy for failed jobs.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Delay before the first retry.
    pub base_delay: Duration,

    /// Backoff multiplier: delay = base_delay * multiplier^(attempts - 1).
    pub multiplier: f64,

    /// Upper bound for any single delay.
    pub max_delay: Duration,

    /// Added to the job's priority on each retry.
    pub priority_boost: u8,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

/// What to do with a failed attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    Retry {
        delay: Duration,
        run_at: DateTime<Utc>,
        priority: Priority,
    },
    DeadLetter,
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            base_delay: Duration::from_millis(config.base_delay_ms),
            multiplier: config.multiplier,
            max_delay: Duration::from_millis(config.max_delay_ms),
            priority_boost: config.priority_boost,
        }
    }

    /// Delay after the failure of attempt number `attempts` (1-indexed).
    ///
    /// With base_delay=1s, multiplier=2.0: 1s, 2s, 4s, 8s, ...
    pub fn next_delay(&self, attempts: u32) -> Duration {
        let exponent = i32::try_from(attempts.saturating_sub(1)).unwrap_or(i32::MAX);
        let secs = self.base_delay.as_secs_f64() * self.multiplier.powi(exponent);
        Duration::try_from_secs_f64(secs)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    pub fn decide(&self, record: &JobRecord, failure: &JobFailure, now: DateTime<Utc>) -> RetryDecision {
        if !failure.kind.is_retryable() || record.attempts_exhausted() {
            return RetryDecision::DeadLetter;
        }

        let delay = self.next_delay(record.attempts);
        let run_at = chrono::TimeDelta::from_std(delay)
            .ok()
            .and_then(|d| now.checked_add_signed(d))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);

        RetryDecision::Retry {
            delay,
            run_at,
            priority: record.priority.boosted(self.priority_boost),
        }
    }
}

/// Where a failed attempt ended up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    /// Back in the queue, claimable from `run_at`.
    Retried { run_at: DateTime<Utc> },
    DeadLettered(DeadLetterId),
    /// Someone else (the reaper) already moved the job on.
    Superseded,
}

/// Applies [`RetryPolicy`] decisions to the stores.
#[derive(Clone)]
pub struct RetryScheduler {
    policy: RetryPolicy,
    stores: Stores,
    batches: BatchTracker,
    ids: Arc<dyn IdGenerator>,
    clock: Arc<dyn Clock>,
    counters: Arc<JobCounters>,
    writes: StoreRetry,
}

impl RetryScheduler {
    pub fn new(
        policy: RetryPolicy,
        stores: Stores,
        batches: BatchTracker,
        ids: Arc<dyn IdGenerator>,
        clock: Arc<dyn Clock>,
        counters: Arc<JobCounters>,
        writes: StoreRetry,
    ) -> Self {
        Self {
            policy,
            stores,
            batches,
            ids,
            clock,
            counters,
            writes,
        }
    }

    /// Route a failed attempt. `record` is the record as of this attempt
    /// (status `processing`, `attempts` already counting it).
    ///
    /// A retry re-queues through `claim`, so the in-flight marker is gone
    /// when this returns `Retried`. Otherwise the caller still releases it.
    pub async fn handle_failure(
        &self,
        claim: &Claim,
        record: &JobRecord,
        failure: JobFailure,
    ) -> Result<Disposition, StoreError> {
        let now = self.clock.now();
        match self.policy.decide(record, &failure, now) {
            RetryDecision::Retry {
                delay,
                run_at,
                priority,
            } => {
                let patch = JobPatch::retry_scheduled(run_at, priority, failure.message.clone())
                    .for_attempt(record.attempts);
                let updated = match self.write(record, patch).await {
                    Ok(updated) => updated,
                    Err(StoreError::Conflict(msg)) => {
                        debug!(job_id = %record.id, reason = %msg, "retry write superseded");
                        return Ok(Disposition::Superseded);
                    }
                    Err(e) => return Err(e),
                };

                // status first, then the queue: a claimer never sees a stale attempt
                match self
                    .stores
                    .queue
                    .requeue(claim, QueueEntry::for_record(&updated))
                    .await
                {
                    Ok(()) => {}
                    Err(StoreError::NotFound(msg)) => {
                        debug!(job_id = %record.id, reason = %msg, "claim already re-queued");
                        return Ok(Disposition::Superseded);
                    }
                    Err(e) => return Err(e),
                }

                self.counters.retried();
                warn!(
                    job_id = %record.id,
                    queue = %record.queue,
                    attempt = record.attempts,
                    max_attempts = record.max_attempts,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    priority = updated.priority.get(),
                    kind = ?failure.kind,
                    error = %failure.message,
                    "job failed, retry scheduled"
                );
                Ok(Disposition::Retried { run_at })
            }
            RetryDecision::DeadLetter => match self.give_up(record, &failure).await {
                Ok(id) => Ok(Disposition::DeadLettered(id)),
                Err(StoreError::Conflict(msg)) => {
                    debug!(job_id = %record.id, reason = %msg, "dead-letter write superseded");
                    Ok(Disposition::Superseded)
                }
                Err(e) => Err(e),
            },
        }
    }

    /// Mark `record` failed, write its dead-letter entry and count it in its
    /// batch. Does not touch the queue.
    pub async fn give_up(
        &self,
        record: &JobRecord,
        failure: &JobFailure,
    ) -> Result<DeadLetterId, StoreError> {
        let patch = JobPatch::failed(self.clock.now(), failure).for_attempt(record.attempts);
        let failed = self.write(record, patch).await?;
        let id = self.file_dead_letter(&failed).await?;

        error!(
            job_id = %record.id,
            queue = %record.queue,
            dead_letter_id = %id,
            attempts = failed.attempts,
            kind = ?failure.kind,
            error = %failure.message,
            "job moved to dead-letter store"
        );
        Ok(id)
    }

    /// Side effects of a record that is already `failed`: one dead-letter
    /// entry per job and the batch `failed` count. Safe to repeat, so the
    /// reaper can finish what a stranded worker started.
    pub async fn file_dead_letter(&self, failed: &JobRecord) -> Result<DeadLetterId, StoreError> {
        let existing = self
            .writes
            .run("dead_letter.find_by_job", || self.stores.dead_letters.find_by_job(failed.id))
            .await?;
        let id = match existing {
            Some(entry) => entry.id,
            None => {
                let failure = JobFailure::new(
                    failed.failure_kind.unwrap_or(FailureKind::Abandoned),
                    failed.last_error.clone().unwrap_or_default(),
                );
                let dead_at = failed.completed_at.unwrap_or_else(|| self.clock.now());
                let entry =
                    DeadLetterEntry::new(self.ids.dead_letter_id(), failed.clone(), &failure, dead_at);
                let id = entry.id;
                self.writes
                    .run("dead_letter.append", || self.stores.dead_letters.append(entry.clone()))
                    .await?;
                self.counters.dead_lettered();
                id
            }
        };
        self.writes
            .run("batch.record_failed", || {
                self.batches.record_outcome(failed, BatchOutcome::Failed)
            })
            .await?;
        Ok(id)
    }

    async fn write(&self, record: &JobRecord, patch: JobPatch) -> Result<JobRecord, StoreError> {
        self.writes
            .run("status.update", || self.stores.status.update(record.id, patch.clone()))
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("job {}", record.id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QueueConfig;
    use crate::domain::{JobId, JobStatus};
    use crate::ports::{FixedClock, UlidGenerator};
    use chrono::TimeZone;
    use rstest::rstest;
    use ulid::Ulid;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap()
    }

    fn policy() -> RetryPolicy {
        RetryPolicy {
            base_delay: Duration::from_secs(1),
            multiplier: 2.0,
            max_delay: Duration::from_secs(60),
            priority_boost: 1,
        }
    }

    fn record_on_attempt(attempts: u32, max_attempts: u32) -> JobRecord {
        let mut r = JobRecord::new(
            JobId::from_ulid(Ulid::new()),
            "q",
            "t",
            vec![],
            Priority::DEFAULT,
            max_attempts,
            t0(),
        );
        r.status = JobStatus::Processing;
        r.attempts = attempts;
        r
    }

    #[rstest]
    #[case(1, 1)]
    #[case(2, 2)]
    #[case(3, 4)]
    #[case(4, 8)]
    fn backoff_doubles(#[case] attempts: u32, #[case] secs: u64) {
        assert_eq!(policy().next_delay(attempts), Duration::from_secs(secs));
    }

    #[test]
    fn backoff_is_capped() {
        assert_eq!(policy().next_delay(10), Duration::from_secs(60));
        assert_eq!(policy().next_delay(u32::MAX), Duration::from_secs(60));
    }

    #[test]
    fn transient_failure_with_attempts_left_is_retried() {
        let r = record_on_attempt(2, 3);
        let failure = JobFailure::new(FailureKind::Transient, "boom");

        let decision = policy().decide(&r, &failure, t0());
        assert_eq!(
            decision,
            RetryDecision::Retry {
                delay: Duration::from_secs(2),
                run_at: t0() + chrono::Duration::seconds(2),
                priority: Priority::new(6).unwrap(),
            }
        );
    }

    #[rstest]
    #[case(FailureKind::Transient, 3, 3)]
    #[case(FailureKind::DeadlineExceeded, 3, 3)]
    #[case(FailureKind::Permanent, 1, 3)]
    #[case(FailureKind::UnknownJobType, 1, 3)]
    fn exhausted_or_non_retryable_goes_to_dead_letter(
        #[case] kind: FailureKind,
        #[case] attempts: u32,
        #[case] max_attempts: u32,
    ) {
        let r = record_on_attempt(attempts, max_attempts);
        let decision = policy().decide(&r, &JobFailure::new(kind, "x"), t0());
        assert_eq!(decision, RetryDecision::DeadLetter);
    }

    #[test]
    fn boost_saturates_at_max_priority() {
        let mut r = record_on_attempt(1, 3);
        r.priority = Priority::MAX;
        let decision = policy().decide(&r, &JobFailure::new(FailureKind::Transient, "x"), t0());
        assert!(matches!(decision, RetryDecision::Retry { priority, .. } if priority == Priority::MAX));
    }

    struct Fixture {
        scheduler: RetryScheduler,
        stores: Stores,
        clock: Arc<FixedClock>,
    }

    fn fixture() -> Fixture {
        let clock = Arc::new(FixedClock::new(t0()));
        let dyn_clock: Arc<dyn Clock> = clock.clone();
        let stores = Stores::in_memory(Arc::clone(&dyn_clock));
        let ids: Arc<dyn IdGenerator> = Arc::new(UlidGenerator::new(Arc::clone(&dyn_clock)));
        let counters = JobCounters::new();
        let batches = BatchTracker::new(
            stores.clone(),
            Arc::clone(&ids),
            Arc::clone(&dyn_clock),
            QueueConfig::default(),
            Arc::clone(&counters),
        );
        let scheduler = RetryScheduler::new(
            policy(),
            stores.clone(),
            batches,
            ids,
            dyn_clock,
            counters,
            StoreRetry::new(1, Duration::ZERO),
        );
        Fixture {
            scheduler,
            stores,
            clock,
        }
    }

    /// Insert, push and claim a job; returns the claim and the processing record.
    async fn claimed(stores: &Stores, max_attempts: u32) -> (Claim, JobRecord) {
        let r = JobRecord::new(
            JobId::from_ulid(Ulid::new()),
            "q",
            "t",
            vec![],
            Priority::DEFAULT,
            max_attempts,
            t0(),
        );
        stores.status.insert(r.clone()).await.unwrap();
        stores.queue.push(QueueEntry::for_record(&r)).await.unwrap();
        let claim = stores
            .queue
            .claim_next("q", Duration::ZERO)
            .await
            .unwrap()
            .unwrap();
        let record = stores
            .status
            .update(r.id, JobPatch::claimed(1, t0()))
            .await
            .unwrap()
            .unwrap();
        (claim, record)
    }

    #[tokio::test]
    async fn retry_is_not_claimable_before_its_delay() {
        let f = fixture();
        let (claim, record) = claimed(&f.stores, 3).await;

        let d = f
            .scheduler
            .handle_failure(&claim, &record, JobFailure::new(FailureKind::Transient, "boom"))
            .await
            .unwrap();
        assert_eq!(
            d,
            Disposition::Retried {
                run_at: t0() + chrono::Duration::seconds(1)
            }
        );

        let stored = f.stores.status.get(record.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::RetryScheduled);
        assert_eq!(stored.priority.get(), 6);
        assert_eq!(stored.last_error.as_deref(), Some("boom"));
        assert_eq!(f.stores.queue.depth("q").processing, 0);
        assert_eq!(f.stores.queue.depth("q").scheduled, 1);

        assert!(
            f.stores
                .queue
                .claim_next("q", Duration::ZERO)
                .await
                .unwrap()
                .is_none()
        );
        f.clock.advance(chrono::Duration::seconds(1));
        let again = f
            .stores
            .queue
            .claim_next("q", Duration::ZERO)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(again.job_id, record.id);
    }

    #[tokio::test]
    async fn permanent_failure_is_dead_lettered_with_its_error() {
        let f = fixture();
        let (claim, record) = claimed(&f.stores, 3).await;

        let d = f
            .scheduler
            .handle_failure(&claim, &record, JobFailure::new(FailureKind::Permanent, "bad input"))
            .await
            .unwrap();
        let Disposition::DeadLettered(dlq_id) = d else {
            panic!("expected dead letter, got {d:?}");
        };

        let entry = f.stores.dead_letters.get(dlq_id).await.unwrap().unwrap();
        assert_eq!(entry.kind, FailureKind::Permanent);
        assert_eq!(entry.error, "bad input");
        assert_eq!(entry.job.status, JobStatus::Failed);
        assert_eq!(entry.job.attempts, 1);

        // the caller still holds the marker; nothing was re-queued
        assert_eq!(f.stores.queue.depth("q").processing, 1);
        assert_eq!(f.stores.queue.depth("q").pending, 0);
    }

    #[tokio::test]
    async fn stale_attempt_is_superseded() {
        let f = fixture();
        let (claim, mut record) = claimed(&f.stores, 3).await;
        // the reaper already took this attempt back
        f.stores
            .status
            .update(record.id, JobPatch::requeued(t0(), "stuck".into()))
            .await
            .unwrap();
        record.status = JobStatus::Processing;

        let d = f
            .scheduler
            .handle_failure(&claim, &record, JobFailure::new(FailureKind::Transient, "late"))
            .await
            .unwrap();
        assert_eq!(d, Disposition::Superseded);
        assert_eq!(f.stores.dead_letters.count(), 0);
    }
}
