//! InMemoryBatchStore

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::domain::{BatchId, BatchOutcome, BatchRecord, JobId, StoreError};
use crate::ports::BatchStore;

#[derive(Default)]
pub struct InMemoryBatchStore {
    batches: Mutex<HashMap<BatchId, BatchRecord>>,
}

impl InMemoryBatchStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BatchStore for InMemoryBatchStore {
    async fn create(&self, batch: BatchRecord) -> Result<(), StoreError> {
        let mut batches = self.batches.lock().await;
        if batches.contains_key(&batch.id) {
            return Err(StoreError::Conflict(format!(
                "batch {} already exists",
                batch.id
            )));
        }
        batches.insert(batch.id, batch);
        Ok(())
    }

    async fn get(&self, id: BatchId) -> Result<Option<BatchRecord>, StoreError> {
        Ok(self.batches.lock().await.get(&id).cloned())
    }

    async fn record_outcome(
        &self,
        id: BatchId,
        job_id: JobId,
        outcome: BatchOutcome,
    ) -> Result<bool, StoreError> {
        let mut batches = self.batches.lock().await;
        let batch = batches
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("batch {id}")))?;
        batch.record(job_id, outcome)
    }
}
