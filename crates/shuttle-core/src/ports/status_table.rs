//! JobStatusTable port - JobId をキーにした状態の正本
//!
//! キュー上の位置とは独立にポイント参照・更新します。

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::domain::{JobId, JobPatch, JobRecord, StoreError};

#[async_trait]
pub trait JobStatusTable: Send + Sync {
    /// Insert a new record. Fails with `Conflict` if the id already exists.
    async fn insert(&self, record: JobRecord) -> Result<(), StoreError>;

    async fn get(&self, id: JobId) -> Result<Option<JobRecord>, StoreError>;

    /// Partial, last-writer-wins update. Returns the updated record, or
    /// `None` if there is no such job. Illegal status edges are `Conflict`.
    async fn update(&self, id: JobId, patch: JobPatch) -> Result<Option<JobRecord>, StoreError>;

    /// Remove terminal records last touched before `before`. Returns how many.
    async fn purge_finished(&self, before: DateTime<Utc>) -> Result<usize, StoreError>;
}
