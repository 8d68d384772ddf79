//! Flaky - 指定した回数だけ `Unavailable` を返す store wrapper（テスト用）
//!
//! 書き込み系の操作（push / record_outcome / append）だけが失敗します。
//! 読み取りと in-flight の操作はそのまま中身に流します。

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use crate::domain::{
    BatchId, BatchOutcome, BatchRecord, DeadLetterEntry, DeadLetterId, JobId, StoreError,
};
use crate::ports::{BatchStore, Claim, DeadLetterStore, PriorityQueueStore, QueueDepth, QueueEntry};

/// Shared failure schedule: let `pass` writes through, then fail `fail` of them.
#[derive(Default)]
pub(crate) struct Outage {
    pass: AtomicU32,
    fail: AtomicU32,
}

impl Outage {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn schedule(&self, pass: u32, fail: u32) {
        self.pass.store(pass, Ordering::SeqCst);
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub(crate) fn heal(&self) {
        self.schedule(0, 0);
    }

    fn check(&self, op: &str) -> Result<(), StoreError> {
        let take = |n: u32| n.checked_sub(1);
        if self.pass.fetch_update(Ordering::SeqCst, Ordering::SeqCst, take).is_ok() {
            return Ok(());
        }
        if self.fail.fetch_update(Ordering::SeqCst, Ordering::SeqCst, take).is_ok() {
            return Err(StoreError::Unavailable(format!("{op}: connection reset")));
        }
        Ok(())
    }
}

pub(crate) struct Flaky<S> {
    inner: S,
    outage: Arc<Outage>,
}

impl<S> Flaky<S> {
    pub(crate) fn new(inner: S, outage: &Arc<Outage>) -> Self {
        Self {
            inner,
            outage: Arc::clone(outage),
        }
    }
}

#[async_trait]
impl<S: PriorityQueueStore> PriorityQueueStore for Flaky<S> {
    async fn push(&self, entry: QueueEntry) -> Result<(), StoreError> {
        self.outage.check("queue.push")?;
        self.inner.push(entry).await
    }

    async fn claim_next(
        &self,
        queue: &str,
        block_timeout: Duration,
    ) -> Result<Option<Claim>, StoreError> {
        self.inner.claim_next(queue, block_timeout).await
    }

    async fn requeue(&self, claim: &Claim, entry: QueueEntry) -> Result<(), StoreError> {
        self.inner.requeue(claim, entry).await
    }

    async fn release(&self, claim: &Claim) -> Result<bool, StoreError> {
        self.inner.release(claim).await
    }

    async fn in_flight(&self, queue: &str) -> Result<Vec<Claim>, StoreError> {
        self.inner.in_flight(queue).await
    }

    fn depth(&self, queue: &str) -> QueueDepth {
        self.inner.depth(queue)
    }

    fn queue_names(&self) -> Vec<String> {
        self.inner.queue_names()
    }
}

#[async_trait]
impl<S: BatchStore> BatchStore for Flaky<S> {
    async fn create(&self, batch: BatchRecord) -> Result<(), StoreError> {
        self.inner.create(batch).await
    }

    async fn get(&self, id: BatchId) -> Result<Option<BatchRecord>, StoreError> {
        self.inner.get(id).await
    }

    async fn record_outcome(
        &self,
        id: BatchId,
        job_id: JobId,
        outcome: BatchOutcome,
    ) -> Result<bool, StoreError> {
        self.outage.check("batch.record_outcome")?;
        self.inner.record_outcome(id, job_id, outcome).await
    }
}

#[async_trait]
impl<S: DeadLetterStore> DeadLetterStore for Flaky<S> {
    async fn append(&self, entry: DeadLetterEntry) -> Result<(), StoreError> {
        self.outage.check("dead_letter.append")?;
        self.inner.append(entry).await
    }

    async fn get(&self, id: DeadLetterId) -> Result<Option<DeadLetterEntry>, StoreError> {
        self.inner.get(id).await
    }

    async fn find_by_job(&self, job_id: JobId) -> Result<Option<DeadLetterEntry>, StoreError> {
        self.inner.find_by_job(job_id).await
    }

    async fn list(&self, queue: &str, limit: usize) -> Result<Vec<DeadLetterEntry>, StoreError> {
        self.inner.list(queue, limit).await
    }

    fn count(&self) -> usize {
        self.inner.count()
    }
}
