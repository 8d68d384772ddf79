//! InMemoryDeadLetterStore - append 順に保持する

use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::domain::{DeadLetterEntry, DeadLetterId, JobId, StoreError};
use crate::ports::DeadLetterStore;

#[derive(Default)]
pub struct InMemoryDeadLetterStore {
    entries: RwLock<Vec<DeadLetterEntry>>,
    count: AtomicUsize,
}

impl InMemoryDeadLetterStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DeadLetterStore for InMemoryDeadLetterStore {
    async fn append(&self, entry: DeadLetterEntry) -> Result<(), StoreError> {
        let mut entries = self.entries.write().await;
        // a job is dead-lettered at most once
        if entries.iter().any(|e| e.job.id == entry.job.id) {
            return Ok(());
        }
        entries.push(entry);
        self.count.store(entries.len(), Ordering::Relaxed);
        Ok(())
    }

    async fn get(&self, id: DeadLetterId) -> Result<Option<DeadLetterEntry>, StoreError> {
        let entries = self.entries.read().await;
        Ok(entries.iter().find(|e| e.id == id).cloned())
    }

    async fn find_by_job(&self, job_id: JobId) -> Result<Option<DeadLetterEntry>, StoreError> {
        let entries = self.entries.read().await;
        Ok(entries.iter().find(|e| e.job.id == job_id).cloned())
    }

    async fn list(&self, queue: &str, limit: usize) -> Result<Vec<DeadLetterEntry>, StoreError> {
        let entries = self.entries.read().await;
        Ok(entries
            .iter()
            .filter(|e| e.queue() == queue)
            .take(limit)
            .cloned()
            .collect())
    }

    fn count(&self) -> usize {
        self.count.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{FailureKind, JobFailure, JobId, JobRecord, Priority};
    use chrono::Utc;
    use ulid::Ulid;

    fn dead(queue: &str) -> DeadLetterEntry {
        let job = JobRecord::new(
            JobId::from_ulid(Ulid::new()),
            queue,
            "noop",
            Vec::new(),
            Priority::DEFAULT,
            1,
            Utc::now(),
        );
        DeadLetterEntry::new(
            DeadLetterId::from_ulid(Ulid::new()),
            job,
            &JobFailure::new(FailureKind::Permanent, "bad"),
            Utc::now(),
        )
    }

    #[tokio::test]
    async fn list_is_oldest_first_and_filtered_by_queue() {
        let store = InMemoryDeadLetterStore::new();
        let a = dead("mail");
        let b = dead("media");
        let c = dead("mail");
        for e in [&a, &b, &c] {
            store.append(e.clone()).await.unwrap();
        }

        let mail = store.list("mail", 10).await.unwrap();
        assert_eq!(
            mail.iter().map(|e| e.id).collect::<Vec<_>>(),
            vec![a.id, c.id]
        );
        assert_eq!(store.list("mail", 1).await.unwrap().len(), 1);
        assert_eq!(store.count(), 3);
    }

    #[tokio::test]
    async fn duplicate_append_for_same_job_is_ignored() {
        let store = InMemoryDeadLetterStore::new();
        let a = dead("q");
        let mut again = a.clone();
        again.id = DeadLetterId::from_ulid(Ulid::new());

        store.append(a.clone()).await.unwrap();
        store.append(again).await.unwrap();

        assert_eq!(store.count(), 1);
        assert!(store.get(a.id).await.unwrap().is_some());
        let found = store.find_by_job(a.job.id).await.unwrap().unwrap();
        assert_eq!(found.id, a.id);
        assert!(store.find_by_job(JobId::from_ulid(Ulid::new())).await.unwrap().is_none());
    }
}
