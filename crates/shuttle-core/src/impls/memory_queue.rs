//! InMemoryQueueStore - 開発・テスト用の優先度付きキュー
//!
//! # 実装詳細
//! - queue 名ごとに shard を持ち、shard 内の操作は 1 つの Mutex で完結する
//! - ready: `BTreeMap<(score, seq), JobId>`（score が小さいものから claim）
//! - delayed: retry backoff 待ちの min-heap（available_at 順）
//! - gauges は Atomic で、metrics は shard の Mutex を取らずに読める
//! - ロックを保持したまま await しない（claim の待機は Mutex の外）

use std::cmp::Ordering as CmpOrdering;
use std::collections::{BTreeMap, BinaryHeap, HashMap};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, Notify};

use crate::domain::{JobId, StoreError};
use crate::ports::{Claim, Clock, PriorityQueueStore, QueueDepth, QueueEntry};

/// Delayed entry for the retry heap.
///
/// Reverse ordering so BinaryHeap acts as a min-heap (earliest first).
#[derive(Debug, Clone)]
struct Delayed {
    available_at: DateTime<Utc>,
    seq: u64,
    entry: QueueEntry,
}

impl PartialEq for Delayed {
    fn eq(&self, other: &Self) -> bool {
        self.available_at == other.available_at && self.seq == other.seq
    }
}

impl Eq for Delayed {}

impl PartialOrd for Delayed {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Delayed {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other
            .available_at
            .cmp(&self.available_at)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Default)]
struct Shard {
    ready: BTreeMap<(i64, u64), JobId>,
    ready_index: HashMap<JobId, (i64, u64)>,

    delayed: BinaryHeap<Delayed>,
    /// Live delayed entries (job -> seq). Heap entries with another seq are stale.
    delayed_index: HashMap<JobId, u64>,

    /// job -> (lease, claimed_at)
    in_flight: HashMap<JobId, (u64, DateTime<Utc>)>,
}

impl Shard {
    fn remove_pending(&mut self, job_id: JobId) {
        if let Some(key) = self.ready_index.remove(&job_id) {
            self.ready.remove(&key);
        }
        self.delayed_index.remove(&job_id);
    }

    fn insert(&mut self, entry: QueueEntry, seq: u64, now: DateTime<Utc>) {
        self.remove_pending(entry.job_id);
        if entry.available_at <= now {
            let key = (entry.score(), seq);
            self.ready.insert(key, entry.job_id);
            self.ready_index.insert(entry.job_id, key);
        } else {
            self.delayed_index.insert(entry.job_id, seq);
            self.delayed.push(Delayed {
                available_at: entry.available_at,
                seq,
                entry,
            });
        }
    }

    /// Move entries whose delay has elapsed into the ready set.
    fn promote(&mut self, now: DateTime<Utc>) {
        while let Some(top) = self.delayed.peek() {
            if top.available_at > now {
                break;
            }
            let Some(Delayed { seq, entry, .. }) = self.delayed.pop() else {
                break;
            };
            if self.delayed_index.get(&entry.job_id) != Some(&seq) {
                continue;
            }
            self.delayed_index.remove(&entry.job_id);
            let key = (entry.score(), seq);
            self.ready.insert(key, entry.job_id);
            self.ready_index.insert(entry.job_id, key);
        }
    }

    fn pop_ready(&mut self) -> Option<JobId> {
        let (_, job_id) = self.ready.pop_first()?;
        self.ready_index.remove(&job_id);
        Some(job_id)
    }

    /// Earliest live delayed entry.
    fn next_due(&mut self) -> Option<DateTime<Utc>> {
        while let Some(top) = self.delayed.peek() {
            if self.delayed_index.get(&top.entry.job_id) == Some(&top.seq) {
                return Some(top.available_at);
            }
            self.delayed.pop();
        }
        None
    }
}

#[derive(Default)]
struct Gauges {
    pending: AtomicUsize,
    scheduled: AtomicUsize,
    processing: AtomicUsize,
}

struct ShardHandle {
    state: Mutex<Shard>,
    notify: Notify,
    gauges: Gauges,
}

impl ShardHandle {
    fn new() -> Self {
        Self {
            state: Mutex::new(Shard::default()),
            notify: Notify::new(),
            gauges: Gauges::default(),
        }
    }

    fn sync_gauges(&self, shard: &Shard) {
        self.gauges
            .pending
            .store(shard.ready.len(), Ordering::Relaxed);
        self.gauges
            .scheduled
            .store(shard.delayed_index.len(), Ordering::Relaxed);
        self.gauges
            .processing
            .store(shard.in_flight.len(), Ordering::Relaxed);
    }
}

/// In-memory priority queue store.
pub struct InMemoryQueueStore {
    shards: RwLock<HashMap<String, Arc<ShardHandle>>>,
    seq: AtomicU64,
    clock: Arc<dyn Clock>,
}

impl InMemoryQueueStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            shards: RwLock::new(HashMap::new()),
            seq: AtomicU64::new(0),
            clock,
        }
    }

    fn shard(&self, queue: &str) -> Arc<ShardHandle> {
        {
            let shards = self.shards.read().unwrap_or_else(|e| e.into_inner());
            if let Some(handle) = shards.get(queue) {
                return Arc::clone(handle);
            }
        }
        let mut shards = self.shards.write().unwrap_or_else(|e| e.into_inner());
        Arc::clone(
            shards
                .entry(queue.to_string())
                .or_insert_with(|| Arc::new(ShardHandle::new())),
        )
    }

    fn existing_shard(&self, queue: &str) -> Option<Arc<ShardHandle>> {
        let shards = self.shards.read().unwrap_or_else(|e| e.into_inner());
        shards.get(queue).cloned()
    }

    fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::Relaxed)
    }

    /// Remove the in-flight marker if `claim` still holds it.
    fn take_claim(shard: &mut Shard, claim: &Claim) -> bool {
        match shard.in_flight.get(&claim.job_id) {
            Some(&(lease, _)) if lease == claim.lease => {
                shard.in_flight.remove(&claim.job_id);
                true
            }
            _ => false,
        }
    }
}

#[async_trait]
impl PriorityQueueStore for InMemoryQueueStore {
    async fn push(&self, entry: QueueEntry) -> Result<(), StoreError> {
        let handle = self.shard(&entry.queue);
        {
            let mut shard = handle.state.lock().await;
            if shard.in_flight.contains_key(&entry.job_id) {
                return Err(StoreError::Conflict(format!(
                    "job {} is in-flight on queue {}",
                    entry.job_id, entry.queue
                )));
            }
            let seq = self.next_seq();
            shard.insert(entry, seq, self.clock.now());
            handle.sync_gauges(&shard);
        }
        handle.notify.notify_one();
        Ok(())
    }

    async fn claim_next(
        &self,
        queue: &str,
        block_timeout: Duration,
    ) -> Result<Option<Claim>, StoreError> {
        let handle = self.shard(queue);
        let deadline = tokio::time::Instant::now() + block_timeout;

        loop {
            let notified = handle.notify.notified();

            let next_due = {
                let mut shard = handle.state.lock().await;
                let now = self.clock.now();
                shard.promote(now);

                if let Some(job_id) = shard.pop_ready() {
                    let lease = self.next_seq();
                    shard.in_flight.insert(job_id, (lease, now));
                    handle.sync_gauges(&shard);
                    return Ok(Some(Claim {
                        queue: queue.to_string(),
                        job_id,
                        lease,
                        claimed_at: now,
                    }));
                }

                handle.sync_gauges(&shard);
                shard
                    .next_due()
                    .map(|at| (at - now).to_std().unwrap_or(Duration::ZERO))
            };

            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            let wait = next_due.map_or(remaining, |due| due.min(remaining));

            // Wait for a push OR the next delayed entry OR the block timeout
            tokio::select! {
                _ = notified => {},
                _ = tokio::time::sleep(wait) => {},
            }
        }
    }

    async fn requeue(&self, claim: &Claim, entry: QueueEntry) -> Result<(), StoreError> {
        if entry.job_id != claim.job_id || entry.queue != claim.queue {
            return Err(StoreError::Conflict(format!(
                "entry {}@{} does not match claim {}@{}",
                entry.job_id, entry.queue, claim.job_id, claim.queue
            )));
        }
        let handle = self.shard(&claim.queue);
        {
            let mut shard = handle.state.lock().await;
            if !Self::take_claim(&mut shard, claim) {
                return Err(StoreError::NotFound(format!(
                    "job {} is not held by lease {} on queue {}",
                    claim.job_id, claim.lease, claim.queue
                )));
            }
            let seq = self.next_seq();
            shard.insert(entry, seq, self.clock.now());
            handle.sync_gauges(&shard);
        }
        handle.notify.notify_one();
        Ok(())
    }

    async fn release(&self, claim: &Claim) -> Result<bool, StoreError> {
        let Some(handle) = self.existing_shard(&claim.queue) else {
            return Ok(false);
        };
        let mut shard = handle.state.lock().await;
        let removed = Self::take_claim(&mut shard, claim);
        handle.sync_gauges(&shard);
        Ok(removed)
    }

    async fn in_flight(&self, queue: &str) -> Result<Vec<Claim>, StoreError> {
        let Some(handle) = self.existing_shard(queue) else {
            return Ok(Vec::new());
        };
        let shard = handle.state.lock().await;
        let mut claims: Vec<Claim> = shard
            .in_flight
            .iter()
            .map(|(&job_id, &(lease, claimed_at))| Claim {
                queue: queue.to_string(),
                job_id,
                lease,
                claimed_at,
            })
            .collect();
        claims.sort_by_key(|c| c.claimed_at);
        Ok(claims)
    }

    fn depth(&self, queue: &str) -> QueueDepth {
        let Some(handle) = self.existing_shard(queue) else {
            return QueueDepth::default();
        };
        QueueDepth {
            pending: handle.gauges.pending.load(Ordering::Relaxed),
            scheduled: handle.gauges.scheduled.load(Ordering::Relaxed),
            processing: handle.gauges.processing.load(Ordering::Relaxed),
        }
    }

    fn queue_names(&self) -> Vec<String> {
        let shards = self.shards.read().unwrap_or_else(|e| e.into_inner());
        let mut names: Vec<String> = shards.keys().cloned().collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Priority;
    use crate::ports::{FixedClock, SystemClock};
    use chrono::TimeZone;
    use std::collections::HashSet;
    use ulid::Ulid;

    const NO_WAIT: Duration = Duration::ZERO;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap()
    }

    fn entry(queue: &str, priority: u8, at: DateTime<Utc>) -> QueueEntry {
        QueueEntry {
            queue: queue.to_string(),
            job_id: JobId::from_ulid(Ulid::new()),
            priority: Priority::new(priority).unwrap(),
            enqueued_at: at,
            available_at: at,
        }
    }

    async fn drain(store: &InMemoryQueueStore, queue: &str) -> Vec<JobId> {
        let mut out = Vec::new();
        while let Some(claim) = store.claim_next(queue, NO_WAIT).await.unwrap() {
            out.push(claim.job_id);
        }
        out
    }

    #[tokio::test]
    async fn higher_priority_is_claimed_first() {
        let store = InMemoryQueueStore::new(Arc::new(FixedClock::new(t0())));
        let low = entry("q", 1, t0());
        let high = entry("q", 10, t0());
        let mid = entry("q", 5, t0());
        for e in [&low, &high, &mid] {
            store.push(e.clone()).await.unwrap();
        }

        let order = drain(&store, "q").await;
        assert_eq!(order, vec![high.job_id, mid.job_id, low.job_id]);
    }

    #[tokio::test]
    async fn equal_priority_is_fifo() {
        let store = InMemoryQueueStore::new(Arc::new(FixedClock::new(t0())));
        let a = entry("q", 5, t0());
        let b = entry("q", 5, t0());
        let c = entry("q", 5, t0());
        for e in [&a, &b, &c] {
            store.push(e.clone()).await.unwrap();
        }

        assert_eq!(drain(&store, "q").await, vec![a.job_id, b.job_id, c.job_id]);
    }

    #[tokio::test]
    async fn claim_moves_job_to_in_flight() {
        let store = InMemoryQueueStore::new(Arc::new(FixedClock::new(t0())));
        let e = entry("q", 5, t0());
        store.push(e.clone()).await.unwrap();
        assert_eq!(store.depth("q").pending, 1);

        let claim = store.claim_next("q", NO_WAIT).await.unwrap().unwrap();
        assert_eq!(claim.job_id, e.job_id);
        assert_eq!(claim.claimed_at, t0());
        assert_eq!(
            store.depth("q"),
            QueueDepth {
                pending: 0,
                scheduled: 0,
                processing: 1
            }
        );

        assert!(store.release(&claim).await.unwrap());
        assert!(!store.release(&claim).await.unwrap());
        assert_eq!(store.depth("q").processing, 0);
    }

    #[tokio::test]
    async fn queues_are_independent() {
        let store = InMemoryQueueStore::new(Arc::new(FixedClock::new(t0())));
        store.push(entry("a", 5, t0())).await.unwrap();

        assert!(store.claim_next("b", NO_WAIT).await.unwrap().is_none());
        assert!(store.claim_next("a", NO_WAIT).await.unwrap().is_some());
        assert_eq!(store.queue_names(), vec!["a".to_string(), "b".to_string()]);
    }

    #[tokio::test]
    async fn delayed_entry_waits_for_its_time() {
        let clock = Arc::new(FixedClock::new(t0()));
        let store = InMemoryQueueStore::new(clock.clone());
        let mut e = entry("q", 5, t0());
        e.available_at = t0() + chrono::Duration::seconds(4);
        store.push(e.clone()).await.unwrap();
        assert_eq!(store.depth("q").scheduled, 1);

        assert!(store.claim_next("q", NO_WAIT).await.unwrap().is_none());

        clock.advance(chrono::Duration::seconds(3));
        assert!(store.claim_next("q", NO_WAIT).await.unwrap().is_none());

        clock.advance(chrono::Duration::seconds(1));
        let claim = store.claim_next("q", NO_WAIT).await.unwrap().unwrap();
        assert_eq!(claim.job_id, e.job_id);
    }

    #[tokio::test]
    async fn empty_queue_returns_none_after_timeout() {
        let store = InMemoryQueueStore::new(Arc::new(SystemClock));
        let start = tokio::time::Instant::now();
        let got = store
            .claim_next("idle", Duration::from_millis(50))
            .await
            .unwrap();
        assert!(got.is_none());
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[tokio::test]
    async fn push_wakes_blocked_claimer() {
        let store = Arc::new(InMemoryQueueStore::new(Arc::new(SystemClock)));
        let e = entry("q", 5, Utc::now());

        let waiter = tokio::spawn({
            let store = Arc::clone(&store);
            async move { store.claim_next("q", Duration::from_secs(5)).await.unwrap() }
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        store.push(e.clone()).await.unwrap();

        let claim = waiter.await.unwrap().unwrap();
        assert_eq!(claim.job_id, e.job_id);
    }

    #[tokio::test]
    async fn requeue_requires_the_current_lease() {
        let store = InMemoryQueueStore::new(Arc::new(FixedClock::new(t0())));
        let e = entry("q", 5, t0());
        store.push(e.clone()).await.unwrap();

        let first = store.claim_next("q", NO_WAIT).await.unwrap().unwrap();
        store.requeue(&first, e.clone()).await.unwrap();
        assert_eq!(store.depth("q").processing, 0);
        assert_eq!(store.depth("q").pending, 1);

        // a second requeue of the same claim is refused
        let err = store.requeue(&first, e.clone()).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));

        let second = store.claim_next("q", NO_WAIT).await.unwrap().unwrap();
        assert_ne!(first.lease, second.lease);

        // the stale holder cannot strip the new claim
        assert!(!store.release(&first).await.unwrap());
        assert_eq!(store.depth("q").processing, 1);
        assert!(store.release(&second).await.unwrap());
    }

    #[tokio::test]
    async fn in_flight_lists_claims_oldest_first() {
        let clock = Arc::new(FixedClock::new(t0()));
        let store = InMemoryQueueStore::new(clock.clone());
        store.push(entry("q", 5, t0())).await.unwrap();
        store.push(entry("q", 5, t0())).await.unwrap();

        let a = store.claim_next("q", NO_WAIT).await.unwrap().unwrap();
        clock.advance(chrono::Duration::seconds(1));
        let b = store.claim_next("q", NO_WAIT).await.unwrap().unwrap();

        assert_eq!(store.in_flight("q").await.unwrap(), vec![a, b]);
        assert!(store.in_flight("other").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn push_of_in_flight_job_is_a_conflict() {
        let store = InMemoryQueueStore::new(Arc::new(FixedClock::new(t0())));
        let e = entry("q", 5, t0());
        store.push(e.clone()).await.unwrap();
        store.claim_next("q", NO_WAIT).await.unwrap().unwrap();

        let err = store.push(e).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
    }

    #[tokio::test]
    async fn repush_replaces_pending_entry() {
        let store = InMemoryQueueStore::new(Arc::new(FixedClock::new(t0())));
        let mut e = entry("q", 1, t0());
        store.push(e.clone()).await.unwrap();
        e.priority = Priority::MAX;
        store.push(e.clone()).await.unwrap();

        assert_eq!(store.depth("q").pending, 1);
        assert_eq!(drain(&store, "q").await, vec![e.job_id]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_claimers_never_share_a_job() {
        let store = Arc::new(InMemoryQueueStore::new(Arc::new(SystemClock)));
        let mut ids = HashSet::new();
        for _ in 0..200 {
            let e = entry("q", 5, Utc::now());
            ids.insert(e.job_id);
            store.push(e).await.unwrap();
        }

        let mut tasks = Vec::new();
        for _ in 0..16 {
            let store = Arc::clone(&store);
            tasks.push(tokio::spawn(async move {
                let mut mine = Vec::new();
                while let Some(claim) = store.claim_next("q", NO_WAIT).await.unwrap() {
                    mine.push(claim.job_id);
                }
                mine
            }));
        }

        let mut seen = HashSet::new();
        let mut total = 0;
        for t in tasks {
            for id in t.await.unwrap() {
                total += 1;
                assert!(seen.insert(id), "job {id} claimed twice");
            }
        }
        assert_eq!(total, 200);
        assert_eq!(seen, ids);
    }
}
