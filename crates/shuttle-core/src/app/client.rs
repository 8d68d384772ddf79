//! QueueClient - 投入・照会・dead-letter の再投入
//!
//! 書き込み順は常に「JobStatusTable → PriorityQueueStore」。claim できる
//! 時点で status 側の記録は必ず存在します。

use std::sync::Arc;

use tracing::{error, info};

use crate::app::batch::BatchTracker;
use crate::app::metrics::JobCounters;
use crate::config::QueueConfig;
use crate::domain::{
    BatchId, BatchView, DeadLetterEntry, DeadLetterId, JobId, JobRecord, JobView, NewJob,
    Priority, QueueError,
};
use crate::impls::Stores;
use crate::ports::{Clock, IdGenerator, QueueEntry};
use crate::typed::{JobKind, encode_payload};

/// Submission API and status queries.
#[derive(Clone)]
pub struct QueueClient {
    stores: Stores,
    ids: Arc<dyn IdGenerator>,
    clock: Arc<dyn Clock>,
    defaults: QueueConfig,
    batches: BatchTracker,
    counters: Arc<JobCounters>,
}

impl QueueClient {
    pub fn new(
        stores: Stores,
        ids: Arc<dyn IdGenerator>,
        clock: Arc<dyn Clock>,
        defaults: QueueConfig,
        counters: Arc<JobCounters>,
    ) -> Self {
        let batches = BatchTracker::new(
            stores.clone(),
            Arc::clone(&ids),
            Arc::clone(&clock),
            defaults.clone(),
            Arc::clone(&counters),
        );
        Self {
            stores,
            ids,
            clock,
            defaults,
            batches,
            counters,
        }
    }

    pub async fn enqueue(&self, queue: &str, job: NewJob) -> Result<JobId, QueueError> {
        let record = new_record(&*self.ids, &*self.clock, &self.defaults, queue, job)?;
        let id = record.id;
        let entry = QueueEntry::for_record(&record);

        self.stores.status.insert(record).await?;
        if let Err(e) = self.stores.queue.push(entry).await {
            error!(job_id = %id, queue, error = %e, "status recorded but queue push failed");
            return Err(e.into());
        }

        self.counters.enqueued(1);
        info!(job_id = %id, queue, "job enqueued");
        Ok(id)
    }

    /// Encode `job` as JSON and submit it under `T::TYPE`.
    pub async fn enqueue_typed<T: JobKind>(
        &self,
        queue: &str,
        job: &T,
        priority: Option<Priority>,
    ) -> Result<JobId, QueueError> {
        let payload = encode_payload(job).map_err(|e| QueueError::Encode(e.to_string()))?;
        let mut new_job = NewJob::new(T::TYPE, payload);
        new_job.priority = priority;
        self.enqueue(queue, new_job).await
    }

    pub async fn enqueue_batch(
        &self,
        queue: &str,
        jobs: Vec<NewJob>,
    ) -> Result<(BatchId, Vec<JobId>), QueueError> {
        self.batches.create_batch(queue, jobs).await
    }

    pub async fn get_job(&self, id: JobId) -> Result<JobView, QueueError> {
        let record = self
            .stores
            .status
            .get(id)
            .await?
            .ok_or(QueueError::JobNotFound(id))?;
        Ok(JobView::from_record(&record, self.clock.now()))
    }

    pub async fn get_batch(&self, id: BatchId) -> Result<BatchView, QueueError> {
        self.batches.status(id).await
    }

    /// Oldest first.
    pub async fn list_dead_letters(
        &self,
        queue: &str,
        limit: usize,
    ) -> Result<Vec<DeadLetterEntry>, QueueError> {
        Ok(self.stores.dead_letters.list(queue, limit).await?)
    }

    pub async fn get_dead_letter(&self, id: DeadLetterId) -> Result<DeadLetterEntry, QueueError> {
        self.stores
            .dead_letters
            .get(id)
            .await?
            .ok_or(QueueError::DeadLetterNotFound(id))
    }

    /// Submit a dead-lettered job again as a brand-new job.
    ///
    /// The new job gets a fresh id, the original (un-boosted) priority, the
    /// same queue, type, payload and `max_attempts`, and no batch.
    pub async fn replay(&self, id: DeadLetterId) -> Result<JobId, QueueError> {
        let entry = self.get_dead_letter(id).await?;
        let job = &entry.job;
        let new_job = NewJob::new(job.job_type.clone(), job.payload.clone())
            .with_priority(job.base_priority)
            .with_max_attempts(job.max_attempts);

        let new_id = self.enqueue(&job.queue, new_job).await?;
        info!(dead_letter_id = %id, old_job_id = %job.id, job_id = %new_id, "dead letter replayed");
        Ok(new_id)
    }
}

/// Resolve defaults and build the pending record for one submission.
pub(crate) fn new_record(
    ids: &dyn IdGenerator,
    clock: &dyn Clock,
    defaults: &QueueConfig,
    queue: &str,
    job: NewJob,
) -> Result<JobRecord, QueueError> {
    let priority = match job.priority {
        Some(p) => p,
        None => Priority::new(defaults.default_priority)?,
    };
    let max_attempts = job.max_attempts.unwrap_or(defaults.default_max_attempts);
    if max_attempts == 0 {
        return Err(QueueError::InvalidMaxAttempts);
    }

    Ok(JobRecord::new(
        ids.job_id(),
        queue,
        job.job_type,
        job.payload,
        priority,
        max_attempts,
        clock.now(),
    ))
}
