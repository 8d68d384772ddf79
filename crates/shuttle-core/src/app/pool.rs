//! WorkerPool - 複数 Worker の起動と graceful shutdown
//!
//! # 停止の流れ
//! 1. `watch` channel に `true` を送る（新しい claim をやめる）
//! 2. 実行中の handler は最後まで走らせ、`grace` まで待つ
//! 3. 間に合わなかった worker は detach する（abort はしない）
//!
//! detach された job は `processing` のまま残り、次の Reaper が拾います。

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::app::builder::Shuttle;
use crate::app::worker_loop::Worker;
use crate::domain::QueueError;
use crate::runtime::HandlerRegistry;

/// Result of [`WorkerPool::stop`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Jobs still executing when `stop` returned.
    pub in_flight: usize,
    /// Workers that exited within the grace period.
    pub drained: usize,
    /// Workers left running in the background after the grace period.
    pub detached: usize,
}

/// Configures and starts a [`WorkerPool`]. Obtained from [`Shuttle::pool`].
pub struct WorkerPoolBuilder {
    shuttle: Shuttle,
    registry: Arc<HandlerRegistry>,
    queues: Vec<(String, usize)>,
    reaper: bool,
    gc: bool,
}

impl WorkerPoolBuilder {
    pub(crate) fn new(shuttle: Shuttle, registry: Arc<HandlerRegistry>) -> Self {
        let reaper = shuttle.config().reaper.enabled;
        let gc = shuttle.config().gc.enabled;
        Self {
            shuttle,
            registry,
            queues: Vec::new(),
            reaper,
            gc,
        }
    }

    /// Run `concurrency` workers against `queue`. May be called once per queue.
    pub fn queue(mut self, queue: impl Into<String>, concurrency: usize) -> Self {
        self.queues.push((queue.into(), concurrency));
        self
    }

    pub fn without_reaper(mut self) -> Self {
        self.reaper = false;
        self
    }

    pub fn without_gc(mut self) -> Self {
        self.gc = false;
        self
    }

    pub fn start(self) -> Result<WorkerPool, QueueError> {
        if self.queues.is_empty() {
            return Err(QueueError::Config("worker pool needs at least one queue".into()));
        }
        for (queue, concurrency) in &self.queues {
            if *concurrency == 0 {
                return Err(QueueError::Config(format!(
                    "queue {queue} needs a concurrency of at least 1"
                )));
            }
            if self.queues.iter().filter(|(q, _)| q == queue).count() > 1 {
                return Err(QueueError::Config(format!("queue {queue} listed twice")));
            }
        }

        let (shutdown, rx) = watch::channel(false);
        let ctx = self.shuttle.worker_context(Arc::clone(&self.registry));
        let executing = Arc::clone(&ctx.executing);

        let mut workers = Vec::new();
        for (queue, concurrency) in &self.queues {
            for _ in 0..*concurrency {
                let worker = Worker::new(workers.len(), queue.clone(), ctx.clone());
                workers.push(tokio::spawn(worker.run(rx.clone())));
            }
            info!(queue = %queue, concurrency, "workers started");
        }

        let mut background = Vec::new();
        if self.reaper {
            let reaper = self.shuttle.reaper(Arc::clone(&self.registry));
            background.push(tokio::spawn(reaper.run(rx.clone())));
        }
        if self.gc {
            background.push(tokio::spawn(self.shuttle.gc().run(rx.clone())));
        }

        info!(
            workers = workers.len(),
            job_types = ?self.registry.job_types(),
            "worker pool started"
        );
        Ok(WorkerPool {
            shutdown,
            workers,
            background,
            executing,
        })
    }
}

/// A running set of workers (plus reaper and gc loops).
///
/// Dropping the pool also signals shutdown, but without waiting.
pub struct WorkerPool {
    shutdown: watch::Sender<bool>,
    workers: Vec<JoinHandle<()>>,
    background: Vec<JoinHandle<()>>,
    executing: Arc<AtomicUsize>,
}

impl WorkerPool {
    /// Convenience for a single queue with the default background loops.
    pub fn start(
        shuttle: &Shuttle,
        queue: impl Into<String>,
        concurrency: usize,
        registry: Arc<HandlerRegistry>,
    ) -> Result<Self, QueueError> {
        shuttle.pool(registry).queue(queue, concurrency).start()
    }

    /// Jobs between claim and release right now.
    pub fn in_flight(&self) -> usize {
        self.executing.load(Ordering::SeqCst)
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Stop claiming new jobs. Running handlers are not touched.
    pub fn request_shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    /// Stop claiming and wait up to `grace` for running jobs to finish.
    pub async fn stop(self, grace: Duration) -> ShutdownReport {
        self.request_shutdown();
        info!(
            in_flight = self.in_flight(),
            grace_ms = u64::try_from(grace.as_millis()).unwrap_or(u64::MAX),
            "worker pool stopping"
        );

        let deadline = tokio::time::Instant::now() + grace;
        let mut drained = 0;
        let mut detached = 0;
        for mut handle in self.workers {
            match tokio::time::timeout_at(deadline, &mut handle).await {
                Ok(Ok(())) => drained += 1,
                Ok(Err(e)) => {
                    warn!(error = %e, "worker task ended abnormally");
                    drained += 1;
                }
                // dropping the handle detaches the task; its job stays processing
                Err(_) => detached += 1,
            }
        }
        for mut handle in self.background {
            if tokio::time::timeout_at(deadline, &mut handle).await.is_err() {
                warn!("background loop still busy after grace period");
            }
        }

        let report = ShutdownReport {
            in_flight: self.executing.load(Ordering::SeqCst),
            drained,
            detached,
        };
        if report.detached > 0 {
            warn!(
                in_flight = report.in_flight,
                detached = report.detached,
                "grace period elapsed, unfinished jobs left for the reaper"
            );
        } else {
            info!(drained = report.drained, "worker pool stopped");
        }
        report
    }
}
