//! DeadLetterStore port - append-only の dead-letter 置き場

use async_trait::async_trait;

use crate::domain::{DeadLetterEntry, DeadLetterId, JobId, StoreError};

#[async_trait]
pub trait DeadLetterStore: Send + Sync {
    /// Keep `entry`. A job is dead-lettered at most once; appending a second
    /// entry for the same job keeps the first one.
    async fn append(&self, entry: DeadLetterEntry) -> Result<(), StoreError>;

    async fn get(&self, id: DeadLetterId) -> Result<Option<DeadLetterEntry>, StoreError>;

    /// The entry written for `job_id`, if any.
    async fn find_by_job(&self, job_id: JobId) -> Result<Option<DeadLetterEntry>, StoreError>;

    /// Oldest first, at most `limit` entries of `queue`.
    async fn list(&self, queue: &str, limit: usize) -> Result<Vec<DeadLetterEntry>, StoreError>;

    /// Approximate total size across all queues.
    fn count(&self) -> usize;
}
