//! InMemoryStatusTable - JobRecord の正本（開発・テスト用）

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::domain::{JobId, JobPatch, JobRecord, StoreError};
use crate::ports::{Clock, JobStatusTable};

pub struct InMemoryStatusTable {
    records: RwLock<HashMap<JobId, JobRecord>>,
    clock: Arc<dyn Clock>,
}

impl InMemoryStatusTable {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            clock,
        }
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }
}

#[async_trait]
impl JobStatusTable for InMemoryStatusTable {
    async fn insert(&self, record: JobRecord) -> Result<(), StoreError> {
        let mut records = self.records.write().await;
        if records.contains_key(&record.id) {
            return Err(StoreError::Conflict(format!(
                "job {} already exists",
                record.id
            )));
        }
        records.insert(record.id, record);
        Ok(())
    }

    async fn get(&self, id: JobId) -> Result<Option<JobRecord>, StoreError> {
        Ok(self.records.read().await.get(&id).cloned())
    }

    async fn update(&self, id: JobId, patch: JobPatch) -> Result<Option<JobRecord>, StoreError> {
        let mut records = self.records.write().await;
        let Some(record) = records.get_mut(&id) else {
            return Ok(None);
        };
        // apply validates before mutating, so a rejected patch leaves the record intact
        record.apply(&patch, self.clock.now())?;
        Ok(Some(record.clone()))
    }

    async fn purge_finished(&self, before: DateTime<Utc>) -> Result<usize, StoreError> {
        let mut records = self.records.write().await;
        let start = records.len();
        records.retain(|_, r| !(r.status.is_terminal() && r.updated_at < before));
        Ok(start - records.len())
    }
}
