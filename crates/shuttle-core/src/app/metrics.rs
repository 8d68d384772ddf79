//! MetricsExporter - pull 型のスナップショット
//!
//! queue の gauge と dead-letter の件数は各 store の Atomic から読むだけで、
//! claim や enqueue の hot path とロックを取り合いません。値は近似です。

use std::fmt::Write as _;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ports::{Clock, DeadLetterStore, PriorityQueueStore};

/// Monotonic lifecycle counters, shared by client, workers and reaper.
#[derive(Debug, Default)]
pub struct JobCounters {
    enqueued: AtomicU64,
    completed: AtomicU64,
    retried: AtomicU64,
    dead_lettered: AtomicU64,
    reaped: AtomicU64,
}

impl JobCounters {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn enqueued(&self, n: u64) {
        self.enqueued.fetch_add(n, Ordering::Relaxed);
    }

    pub fn completed(&self) {
        self.completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn retried(&self) {
        self.retried.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dead_lettered(&self) {
        self.dead_lettered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn reaped(&self) {
        self.reaped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            enqueued: self.enqueued.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
            reaped: self.reaped.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterSnapshot {
    pub enqueued: u64,
    pub completed: u64,
    pub retried: u64,
    pub dead_lettered: u64,
    pub reaped: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueMetrics {
    pub queue: String,
    pub pending: usize,
    pub scheduled: usize,
    pub processing: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub queues: Vec<QueueMetrics>,
    pub dead_letter_count: usize,
    pub totals: CounterSnapshot,
    pub collected_at: DateTime<Utc>,
}

impl MetricsSnapshot {
    pub fn queue(&self, name: &str) -> Option<&QueueMetrics> {
        self.queues.iter().find(|q| q.queue == name)
    }

    /// Prometheus text exposition format.
    pub fn to_prometheus(&self) -> String {
        let mut out = String::new();

        gauge_header(&mut out, "shuttle_queue_pending", "Jobs claimable now.");
        for q in &self.queues {
            let _ = writeln!(out, "shuttle_queue_pending{{queue=\"{}\"}} {}", escape(&q.queue), q.pending);
        }
        gauge_header(
            &mut out,
            "shuttle_queue_scheduled",
            "Jobs waiting for a retry delay.",
        );
        for q in &self.queues {
            let _ = writeln!(out, "shuttle_queue_scheduled{{queue=\"{}\"}} {}", escape(&q.queue), q.scheduled);
        }
        gauge_header(&mut out, "shuttle_queue_processing", "Jobs in flight.");
        for q in &self.queues {
            let _ = writeln!(out, "shuttle_queue_processing{{queue=\"{}\"}} {}", escape(&q.queue), q.processing);
        }

        gauge_header(
            &mut out,
            "shuttle_dead_letter_count",
            "Entries in the dead-letter store.",
        );
        let _ = writeln!(out, "shuttle_dead_letter_count {}", self.dead_letter_count);

        let totals = [
            ("shuttle_jobs_enqueued_total", "Jobs submitted.", self.totals.enqueued),
            ("shuttle_jobs_completed_total", "Jobs completed.", self.totals.completed),
            ("shuttle_jobs_retried_total", "Retries scheduled.", self.totals.retried),
            ("shuttle_jobs_dead_lettered_total", "Jobs moved to the dead-letter store.", self.totals.dead_lettered),
            ("shuttle_jobs_reaped_total", "Stuck claims reconciled by the reaper.", self.totals.reaped),
        ];
        for (name, help, value) in totals {
            let _ = writeln!(out, "# HELP {name} {help}");
            let _ = writeln!(out, "# TYPE {name} counter");
            let _ = writeln!(out, "{name} {value}");
        }

        out
    }
}

fn gauge_header(out: &mut String, name: &str, help: &str) {
    let _ = writeln!(out, "# HELP {name} {help}");
    let _ = writeln!(out, "# TYPE {name} gauge");
}

fn escape(label: &str) -> String {
    label
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n")
}

/// Read-only aggregation over the queue store and the dead-letter store.
#[derive(Clone)]
pub struct MetricsExporter {
    queue: Arc<dyn PriorityQueueStore>,
    dead_letters: Arc<dyn DeadLetterStore>,
    counters: Arc<JobCounters>,
    clock: Arc<dyn Clock>,
}

impl MetricsExporter {
    pub fn new(
        queue: Arc<dyn PriorityQueueStore>,
        dead_letters: Arc<dyn DeadLetterStore>,
        counters: Arc<JobCounters>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            queue,
            dead_letters,
            counters,
            clock,
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let queues = self
            .queue
            .queue_names()
            .into_iter()
            .map(|name| {
                let depth = self.queue.depth(&name);
                QueueMetrics {
                    queue: name,
                    pending: depth.pending,
                    scheduled: depth.scheduled,
                    processing: depth.processing,
                }
            })
            .collect();

        MetricsSnapshot {
            queues,
            dead_letter_count: self.dead_letters.count(),
            totals: self.counters.snapshot(),
            collected_at: self.clock.now(),
        }
    }

    pub fn render_prometheus(&self) -> String {
        self.snapshot().to_prometheus()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{JobId, Priority};
    use crate::impls::Stores;
    use crate::ports::{FixedClock, QueueEntry};
    use chrono::TimeZone;
    use std::time::Duration;
    use ulid::Ulid;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap()
    }

    fn entry(queue: &str) -> QueueEntry {
        QueueEntry {
            queue: queue.into(),
            job_id: JobId::from_ulid(Ulid::new()),
            priority: Priority::DEFAULT,
            enqueued_at: t0(),
            available_at: t0(),
        }
    }

    #[tokio::test]
    async fn snapshot_reports_per_queue_gauges() {
        let clock = Arc::new(FixedClock::new(t0()));
        let stores = Stores::in_memory(clock.clone());
        let counters = JobCounters::new();
        let exporter = MetricsExporter::new(
            Arc::clone(&stores.queue),
            Arc::clone(&stores.dead_letters),
            Arc::clone(&counters),
            clock,
        );

        for _ in 0..3 {
            stores.queue.push(entry("mail")).await.unwrap();
        }
        stores.queue.push(entry("media")).await.unwrap();
        stores
            .queue
            .claim_next("mail", Duration::ZERO)
            .await
            .unwrap()
            .unwrap();
        counters.enqueued(4);

        let snap = exporter.snapshot();
        let mail = snap.queue("mail").unwrap();
        assert_eq!((mail.pending, mail.processing), (2, 1));
        assert_eq!(snap.queue("media").unwrap().pending, 1);
        assert_eq!(snap.dead_letter_count, 0);
        assert_eq!(snap.totals.enqueued, 4);
        assert_eq!(snap.collected_at, t0());
    }

    #[test]
    fn prometheus_text_has_one_sample_per_queue() {
        let snap = MetricsSnapshot {
            queues: vec![
                QueueMetrics {
                    queue: "mail".into(),
                    pending: 2,
                    scheduled: 1,
                    processing: 3,
                },
                QueueMetrics {
                    queue: "media".into(),
                    pending: 0,
                    scheduled: 0,
                    processing: 0,
                },
            ],
            dead_letter_count: 7,
            totals: CounterSnapshot::default(),
            collected_at: t0(),
        };

        let text = snap.to_prometheus();
        assert!(text.contains("# TYPE shuttle_queue_pending gauge"));
        assert!(text.contains("shuttle_queue_pending{queue=\"mail\"} 2"));
        assert!(text.contains("shuttle_queue_processing{queue=\"mail\"} 3"));
        assert!(text.contains("shuttle_queue_pending{queue=\"media\"} 0"));
        assert!(text.contains("shuttle_dead_letter_count 7"));
        assert!(text.contains("# TYPE shuttle_jobs_completed_total counter"));
    }

    #[test]
    fn label_values_are_escaped() {
        assert_eq!(escape(r#"a"b\c"#), r#"a\"b\\c"#);
    }
}
