//! BatchTracker - まとめて投入した job の完了・失敗の集計
//!
//! # 作成順序
//! 1. 全 NewJob を検証して JobRecord を組み立てる（失敗したら何も書かない）
//! 2. BatchRecord（counter = 0）を作成
//! 3. batch_id 付きの JobRecord を status table に登録
//! 4. 最後に queue へ push
//!
//! push より前に counter が存在するので、完了がバッチ作成を追い越しません。
//!
//! # 途中で store が落ちた場合
//! queue に入らなかった member は二度と実行されないので、その場で batch の
//! `failed` として数えます（`done` に到達できるように）。status table に
//! 残った `pending` の record は単発 enqueue と同じく孤児になり、`error!`
//! で記録したうえで `StoreUnavailable` を返します。

use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::app::client::new_record;
use crate::app::metrics::JobCounters;
use crate::config::QueueConfig;
use crate::domain::{
    BatchId, BatchOutcome, BatchRecord, BatchView, JobId, JobRecord, NewJob, QueueError,
    StoreError,
};
use crate::impls::Stores;
use crate::ports::{Clock, IdGenerator, QueueEntry};

#[derive(Clone)]
pub struct BatchTracker {
    stores: Stores,
    ids: Arc<dyn IdGenerator>,
    clock: Arc<dyn Clock>,
    defaults: QueueConfig,
    counters: Arc<JobCounters>,
}

impl BatchTracker {
    pub fn new(
        stores: Stores,
        ids: Arc<dyn IdGenerator>,
        clock: Arc<dyn Clock>,
        defaults: QueueConfig,
        counters: Arc<JobCounters>,
    ) -> Self {
        Self {
            stores,
            ids,
            clock,
            defaults,
            counters,
        }
    }

    pub async fn create_batch(
        &self,
        queue: &str,
        jobs: Vec<NewJob>,
    ) -> Result<(BatchId, Vec<JobId>), QueueError> {
        if jobs.is_empty() {
            return Err(QueueError::EmptyBatch);
        }
        let total = u32::try_from(jobs.len())
            .map_err(|_| QueueError::Conflict(format!("batch of {} jobs is too large", jobs.len())))?;

        let batch_id = self.ids.batch_id();
        let records: Vec<JobRecord> = jobs
            .into_iter()
            .map(|job| {
                new_record(&*self.ids, &*self.clock, &self.defaults, queue, job)
                    .map(|r| r.in_batch(batch_id))
            })
            .collect::<Result<_, _>>()?;
        let job_ids: Vec<JobId> = records.iter().map(|r| r.id).collect();

        self.stores
            .batches
            .create(BatchRecord::new(batch_id, queue, total, self.clock.now()))
            .await?;

        if let Err((pushed, e)) = self.write_members(&records).await {
            self.counters.enqueued(u64::try_from(pushed).unwrap_or(u64::MAX));
            error!(
                batch_id = %batch_id,
                queue,
                total,
                pushed,
                error = %e,
                "batch enqueue interrupted, counting the rest as failed"
            );
            for record in &records[pushed..] {
                if let Err(e) = self.record_outcome(record, BatchOutcome::Failed).await {
                    error!(
                        batch_id = %batch_id,
                        job_id = %record.id,
                        error = %e,
                        "could not count unqueued member"
                    );
                }
            }
            return Err(e.into());
        }

        self.counters.enqueued(u64::from(total));
        info!(batch_id = %batch_id, queue, total, "batch enqueued");
        Ok((batch_id, job_ids))
    }

    /// Insert every member, then push them. On error, returns how many
    /// members reached the queue.
    async fn write_members(&self, records: &[JobRecord]) -> Result<(), (usize, StoreError)> {
        for record in records {
            self.stores
                .status
                .insert(record.clone())
                .await
                .map_err(|e| (0, e))?;
        }
        for (pushed, record) in records.iter().enumerate() {
            self.stores
                .queue
                .push(QueueEntry::for_record(record))
                .await
                .map_err(|e| (pushed, e))?;
        }
        Ok(())
    }

    pub async fn status(&self, id: BatchId) -> Result<BatchView, QueueError> {
        let batch = self
            .stores
            .batches
            .get(id)
            .await?
            .ok_or(QueueError::BatchNotFound(id))?;
        Ok(batch.view())
    }

    /// Count the terminal outcome of `job` in its batch, if it has one.
    ///
    /// Idempotent per job: a second call for the same job changes nothing.
    pub async fn record_outcome(
        &self,
        job: &JobRecord,
        outcome: BatchOutcome,
    ) -> Result<(), StoreError> {
        let Some(batch_id) = job.batch_id else {
            return Ok(());
        };

        let counted = match self
            .stores
            .batches
            .record_outcome(batch_id, job.id, outcome)
            .await
        {
            Ok(counted) => counted,
            Err(StoreError::NotFound(msg)) => {
                warn!(batch_id = %batch_id, job_id = %job.id, reason = %msg, "batch is gone, outcome dropped");
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        if !counted {
            debug!(batch_id = %batch_id, job_id = %job.id, "batch outcome already counted");
            return Ok(());
        }

        if let Some(batch) = self.stores.batches.get(batch_id).await?
            && batch.is_done()
        {
            info!(
                batch_id = %batch_id,
                total = batch.total,
                completed = batch.completed,
                failed = batch.failed,
                "batch done"
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{JobStatus, Priority};
    use crate::impls::InMemoryQueueStore;
    use crate::impls::flaky::{Flaky, Outage};
    use crate::ports::{FixedClock, PriorityQueueStore, UlidGenerator};
    use chrono::{TimeZone, Utc};
    use std::time::Duration;

    fn tracker() -> (BatchTracker, Stores) {
        tracker_with(|_, _| {})
    }

    fn tracker_with(wrap: impl FnOnce(&mut Stores, &Arc<dyn Clock>)) -> (BatchTracker, Stores) {
        let clock: Arc<dyn Clock> =
            Arc::new(FixedClock::new(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()));
        let mut stores = Stores::in_memory(Arc::clone(&clock));
        wrap(&mut stores, &clock);
        let ids = Arc::new(UlidGenerator::new(Arc::clone(&clock)));
        let tracker = BatchTracker::new(
            stores.clone(),
            ids,
            clock,
            QueueConfig::default(),
            JobCounters::new(),
        );
        (tracker, stores)
    }

    fn new_jobs(n: usize) -> Vec<NewJob> {
        (0..n)
            .map(|i| NewJob::new("thumb", vec![i as u8]))
            .collect()
    }

    #[tokio::test]
    async fn members_are_tagged_and_counters_start_at_zero() {
        let (tracker, stores) = tracker();
        let (batch_id, job_ids) = tracker.create_batch("media", new_jobs(4)).await.unwrap();

        assert_eq!(job_ids.len(), 4);
        let view = tracker.status(batch_id).await.unwrap();
        assert_eq!((view.total, view.completed, view.failed, view.pending), (4, 0, 0, 4));
        assert!(!view.done);

        for id in &job_ids {
            let record = stores.status.get(*id).await.unwrap().unwrap();
            assert_eq!(record.batch_id, Some(batch_id));
            assert_eq!(record.status, JobStatus::Pending);
        }
        assert_eq!(stores.queue.depth("media").pending, 4);
    }

    #[tokio::test]
    async fn empty_batch_is_rejected() {
        let (tracker, _) = tracker();
        let err = tracker.create_batch("q", Vec::new()).await.unwrap_err();
        assert!(matches!(err, QueueError::EmptyBatch));
    }

    #[tokio::test]
    async fn invalid_member_writes_nothing() {
        let (tracker, stores) = tracker();
        let mut jobs = new_jobs(2);
        jobs.push(NewJob::new("thumb", vec![]).with_max_attempts(0));

        let err = tracker.create_batch("q", jobs).await.unwrap_err();
        assert!(matches!(err, QueueError::InvalidMaxAttempts));
        assert_eq!(stores.queue.depth("q").pending, 0);
    }

    #[tokio::test]
    async fn outcomes_are_counted_once_per_job() {
        let (tracker, stores) = tracker();
        let (batch_id, job_ids) = tracker.create_batch("q", new_jobs(2)).await.unwrap();

        let first = stores.status.get(job_ids[0]).await.unwrap().unwrap();
        tracker
            .record_outcome(&first, BatchOutcome::Completed)
            .await
            .unwrap();
        tracker
            .record_outcome(&first, BatchOutcome::Completed)
            .await
            .unwrap();

        let second = stores.status.get(job_ids[1]).await.unwrap().unwrap();
        tracker
            .record_outcome(&second, BatchOutcome::Failed)
            .await
            .unwrap();

        let view = tracker.status(batch_id).await.unwrap();
        assert_eq!((view.completed, view.failed, view.pending), (1, 1, 0));
        assert!(view.done);
    }

    #[tokio::test]
    async fn jobs_outside_a_batch_are_ignored() {
        let (tracker, _) = tracker();
        let ids = UlidGenerator::new(Arc::new(FixedClock::new(Utc::now())));
        let job = JobRecord::new(
            ids.job_id(),
            "q",
            "t",
            vec![],
            Priority::DEFAULT,
            1,
            Utc::now(),
        );
        tracker
            .record_outcome(&job, BatchOutcome::Completed)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn interrupted_batch_counts_unqueued_members_as_failed() {
        let outage = Outage::new();
        let (tracker, stores) = tracker_with(|stores, clock| {
            let queue: Arc<dyn PriorityQueueStore> =
                Arc::new(Flaky::new(InMemoryQueueStore::new(Arc::clone(clock)), &outage));
            stores.queue = queue;
        });
        outage.schedule(2, 1);

        let err = tracker.create_batch("q", new_jobs(4)).await.unwrap_err();
        assert!(matches!(err, QueueError::StoreUnavailable(_)));
        assert_eq!(stores.queue.depth("q").pending, 2);

        // the two queued members still run and finish the batch
        let mut batch_id = None;
        while let Some(claim) = stores.queue.claim_next("q", Duration::ZERO).await.unwrap() {
            let record = stores.status.get(claim.job_id).await.unwrap().unwrap();
            batch_id = record.batch_id;
            let view = tracker.status(record.batch_id.unwrap()).await.unwrap();
            assert!(!view.done);
            tracker
                .record_outcome(&record, BatchOutcome::Completed)
                .await
                .unwrap();
        }

        let view = tracker.status(batch_id.unwrap()).await.unwrap();
        assert_eq!((view.total, view.completed, view.failed, view.pending), (4, 2, 2, 0));
        assert!(view.done);
    }
}
