//! Impls - ports の実装（開発用・テスト用）
//!
//! # 含まれる実装
//! - **InMemoryQueueStore**: queue 名ごとの shard を持つ優先度付きキュー
//! - **InMemoryStatusTable**: JobRecord の正本
//! - **InMemoryBatchStore** / **InMemoryDeadLetterStore**
//!
//! 本番用の実装（共有の key-value / ordered-set ストア）は別クレートに置き、
//! [`Stores`] に差し込みます。

#[cfg(test)]
pub(crate) mod flaky;
pub mod memory_batch;
pub mod memory_dead_letter;
pub mod memory_queue;
pub mod memory_status;

use std::sync::Arc;

use crate::ports::{BatchStore, Clock, DeadLetterStore, JobStatusTable, PriorityQueueStore};

pub use self::memory_batch::InMemoryBatchStore;
pub use self::memory_dead_letter::InMemoryDeadLetterStore;
pub use self::memory_queue::InMemoryQueueStore;
pub use self::memory_status::InMemoryStatusTable;

/// The four stores every component shares.
#[derive(Clone)]
pub struct Stores {
    pub queue: Arc<dyn PriorityQueueStore>,
    pub status: Arc<dyn JobStatusTable>,
    pub batches: Arc<dyn BatchStore>,
    pub dead_letters: Arc<dyn DeadLetterStore>,
}

impl Stores {
    pub fn in_memory(clock: Arc<dyn Clock>) -> Self {
        Self {
            queue: Arc::new(InMemoryQueueStore::new(Arc::clone(&clock))),
            status: Arc::new(InMemoryStatusTable::new(clock)),
            batches: Arc::new(InMemoryBatchStore::new()),
            dead_letters: Arc::new(InMemoryDeadLetterStore::new()),
        }
    }
}
