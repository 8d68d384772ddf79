//! BatchStore port - バッチのカウンタ

use async_trait::async_trait;

use crate::domain::{BatchId, BatchOutcome, BatchRecord, JobId, StoreError};

#[async_trait]
pub trait BatchStore: Send + Sync {
    async fn create(&self, batch: BatchRecord) -> Result<(), StoreError>;

    async fn get(&self, id: BatchId) -> Result<Option<BatchRecord>, StoreError>;

    /// Atomically count a member's terminal outcome.
    ///
    /// Idempotent per `job_id`; returns `false` when it was already counted.
    async fn record_outcome(
        &self,
        id: BatchId,
        job_id: JobId,
        outcome: BatchOutcome,
    ) -> Result<bool, StoreError>;
}
