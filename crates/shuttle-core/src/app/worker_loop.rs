//! Worker - claim → execute → settle のループ
//!
//! # フロー（1 job）
//! 1. `claim_next()` で JobId を取得（pending から外れ in-flight に入る）
//! 2. status を `processing` に（attempts + 1, started_at）
//! 3. handler を別 task で実行し、job type の deadline で打ち切る
//! 4. 成功: `completed` + batch の completed、失敗: RetryScheduler へ
//! 5. in-flight marker を外す（handler の結果に関わらず必ず）
//!
//! handler のエラーや panic で Worker のループが落ちることはありません。

use std::any::Any;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::app::batch::BatchTracker;
use crate::app::metrics::JobCounters;
use crate::app::retry::{Disposition, RetryScheduler};
use crate::app::store_retry::StoreRetry;
use crate::domain::{BatchOutcome, FailureKind, JobFailure, JobPatch, JobRecord, StoreError};
use crate::impls::Stores;
use crate::ports::{Claim, Clock};
use crate::runtime::{HandlerRegistry, JobContext};

/// How one claimed job ended, as seen by the worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Settled {
    Completed,
    Failed(Disposition),
    /// Record missing or already terminal; only the marker was cleared.
    Skipped,
    /// A store write kept failing (or could not start the attempt); the
    /// claim is left for the reaper.
    Stranded,
}

/// Everything a worker needs; cheap to clone, shared by a pool's workers.
#[derive(Clone)]
pub struct WorkerContext {
    pub stores: Stores,
    pub registry: Arc<HandlerRegistry>,
    pub scheduler: RetryScheduler,
    pub batches: BatchTracker,
    pub clock: Arc<dyn Clock>,
    pub counters: Arc<JobCounters>,
    pub writes: StoreRetry,
    pub poll_timeout: Duration,
    pub store_backoff: Duration,
    /// Jobs currently between claim and release, across every worker
    /// sharing this context.
    pub executing: Arc<AtomicUsize>,
}

/// Keeps [`WorkerContext::executing`] up to date, even if processing unwinds.
struct Executing<'a>(&'a AtomicUsize);

impl<'a> Executing<'a> {
    fn enter(count: &'a AtomicUsize) -> Self {
        count.fetch_add(1, Ordering::SeqCst);
        Self(count)
    }
}

impl Drop for Executing<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct Worker {
    id: usize,
    queue: String,
    ctx: WorkerContext,
}

impl Worker {
    pub fn new(id: usize, queue: impl Into<String>, ctx: WorkerContext) -> Self {
        Self {
            id,
            queue: queue.into(),
            ctx,
        }
    }

    /// Loop until `shutdown` turns true. A job already claimed is always
    /// run to the end before the flag is checked again.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        debug!(worker = self.id, queue = %self.queue, "worker started");
        loop {
            if *shutdown.borrow() {
                break;
            }

            // claim_next is cancel-safe, so racing it against shutdown is fine
            let claimed = tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
                claimed = self.ctx.stores.queue.claim_next(&self.queue, self.ctx.poll_timeout) => claimed,
            };

            match claimed {
                Ok(Some(claim)) => {
                    self.process(claim).await;
                }
                Ok(None) => {
                    trace!(worker = self.id, queue = %self.queue, "poll timed out");
                }
                Err(e) => {
                    warn!(worker = self.id, queue = %self.queue, error = %e, "claim failed, backing off");
                    tokio::select! {
                        _ = shutdown.changed() => {}
                        _ = tokio::time::sleep(self.ctx.store_backoff) => {}
                    }
                }
            }
        }
        debug!(worker = self.id, queue = %self.queue, "worker stopped");
    }

    /// Claim and process at most one job. Returns `None` when nothing was
    /// claimable within the poll timeout.
    pub async fn run_once(&self) -> Result<Option<Settled>, StoreError> {
        match self
            .ctx
            .stores
            .queue
            .claim_next(&self.queue, self.ctx.poll_timeout)
            .await?
        {
            Some(claim) => Ok(Some(self.process(claim).await)),
            None => Ok(None),
        }
    }

    /// Run one claimed job to the end and clear its in-flight marker.
    pub async fn process(&self, claim: Claim) -> Settled {
        let _executing = Executing::enter(&self.ctx.executing);
        let settled = match self.settle(&claim).await {
            Ok(settled) => settled,
            Err(e) => {
                error!(
                    worker = self.id,
                    job_id = %claim.job_id,
                    queue = %claim.queue,
                    error = %e,
                    "status write lost, leaving claim for the reaper"
                );
                Settled::Stranded
            }
        };

        if settled != Settled::Stranded {
            // after a retry the lease is already consumed and this is a no-op
            if let Err(e) = self.ctx.stores.queue.release(&claim).await {
                warn!(job_id = %claim.job_id, error = %e, "failed to clear in-flight marker");
            }
        }
        settled
    }

    async fn settle(&self, claim: &Claim) -> Result<Settled, StoreError> {
        let writes = self.ctx.writes;
        let status = &self.ctx.stores.status;

        let Some(record) = writes.run("status.get", || status.get(claim.job_id)).await? else {
            warn!(job_id = %claim.job_id, "claimed job has no status record");
            return Ok(Settled::Skipped);
        };
        if record.status.is_terminal() {
            debug!(job_id = %record.id, status = %record.status, "claimed job already terminal");
            return Ok(Settled::Skipped);
        }

        let attempt = record.attempts + 1;
        let claimed = JobPatch::claimed(attempt, self.ctx.clock.now()).for_attempt(record.attempts);
        // a conflict here leaves the claim in place for the reaper to sort out
        let Some(record) = writes
            .run("status.claimed", || status.update(record.id, claimed.clone()))
            .await?
        else {
            return Ok(Settled::Skipped);
        };

        info!(
            worker = self.id,
            job_id = %record.id,
            queue = %record.queue,
            job_type = %record.job_type,
            attempt,
            max_attempts = record.max_attempts,
            "job claimed"
        );

        match self.execute(&record).await {
            Ok(result) => self.complete(&record, result).await,
            Err(failure) => {
                let disposition = self.ctx.scheduler.handle_failure(claim, &record, failure).await?;
                Ok(Settled::Failed(disposition))
            }
        }
    }

    /// Run the handler in its own task under the job type's deadline.
    async fn execute(&self, record: &JobRecord) -> Result<Vec<u8>, JobFailure> {
        let Some(handler) = self.ctx.registry.get(&record.job_type) else {
            return Err(JobFailure::unknown_job_type(&record.job_type));
        };
        let deadline = self.ctx.registry.deadline(&record.job_type);
        let cancel = CancellationToken::new();
        let ctx = JobContext {
            job_id: record.id,
            queue: record.queue.clone(),
            job_type: record.job_type.clone(),
            payload: record.payload.clone(),
            attempt: record.attempts,
            max_attempts: record.max_attempts,
            cancel: cancel.clone(),
        };

        let mut task = tokio::spawn(async move { handler.handle(ctx).await });
        match tokio::time::timeout(deadline, &mut task).await {
            Ok(Ok(Ok(result))) => Ok(result),
            Ok(Ok(Err(err))) => Err(err.into()),
            Ok(Err(join_err)) => Err(panicked(join_err)),
            Err(_) => {
                // give the handler its signal, then make sure it is really gone
                cancel.cancel();
                task.abort();
                let _ = task.await;
                Err(JobFailure::new(
                    FailureKind::DeadlineExceeded,
                    format!("handler exceeded deadline of {}ms", deadline.as_millis()),
                ))
            }
        }
    }

    async fn complete(&self, record: &JobRecord, result: Vec<u8>) -> Result<Settled, StoreError> {
        let writes = self.ctx.writes;
        let patch = JobPatch::completed(self.ctx.clock.now(), result).for_attempt(record.attempts);
        let completed = match writes
            .run("status.completed", || {
                self.ctx.stores.status.update(record.id, patch.clone())
            })
            .await
        {
            Ok(Some(completed)) => completed,
            Ok(None) => return Ok(Settled::Skipped),
            Err(StoreError::Conflict(msg)) => {
                warn!(job_id = %record.id, reason = %msg, "completion superseded");
                return Ok(Settled::Skipped);
            }
            Err(e) => return Err(e),
        };

        // counted with the status write; the reaper repeats only the batch part
        self.ctx.counters.completed();
        writes
            .run("batch.record_completed", || {
                self.ctx.batches.record_outcome(&completed, BatchOutcome::Completed)
            })
            .await?;

        info!(
            worker = self.id,
            job_id = %record.id,
            queue = %record.queue,
            attempt = record.attempts,
            "job completed"
        );
        Ok(Settled::Completed)
    }
}

fn panicked(err: JoinError) -> JobFailure {
    if !err.is_panic() {
        return JobFailure::new(FailureKind::Panicked, "handler task was cancelled");
    }
    let payload = err.into_panic();
    JobFailure::new(
        FailureKind::Panicked,
        format!("handler panicked: {}", panic_message(payload.as_ref())),
    )
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s
    } else {
        "non-string panic payload"
    }
}
