//! Shuttle - ワイヤリング
//!
//! config・clock・stores・id generator を一度だけ組み立て、各コンポーネント
//! （client / worker / reaper / gc / pool / metrics）を同じ部品から作ります。
//!
//! # 起動時検証（Fail-fast）
//! - `build()` は config を検証してから組み立てる
//! - handler 側の検証は [`RegistryBuilder::build`] が担当
//!
//! # 使用例
//! ```ignore
//! let shuttle = Shuttle::builder().config(ShuttleConfig::load(None)?).build()?;
//! let registry = shuttle
//!     .registry_builder()
//!     .register("mail.send", handler_fn(send_mail))?
//!     .build()?;
//! let pool = shuttle.pool(registry).queue("mail", 4).start()?;
//! shuttle.client().enqueue("mail", NewJob::new("mail.send", payload)).await?;
//! pool.stop(Duration::from_secs(30)).await;
//! ```

use std::sync::Arc;
use std::sync::atomic::AtomicUsize;

use crate::app::batch::BatchTracker;
use crate::app::client::QueueClient;
use crate::app::gc_loop::GcLoop;
use crate::app::metrics::{JobCounters, MetricsExporter};
use crate::app::pool::WorkerPoolBuilder;
use crate::app::reaper_loop::Reaper;
use crate::app::retry::{RetryPolicy, RetryScheduler};
use crate::app::store_retry::StoreRetry;
use crate::app::worker_loop::WorkerContext;
use crate::config::ShuttleConfig;
use crate::domain::QueueError;
use crate::impls::Stores;
use crate::ports::{Clock, IdGenerator, SystemClock, UlidGenerator};
use crate::runtime::{HandlerRegistry, RegistryBuilder};

/// Builds a [`Shuttle`]. Anything not set falls back to the system clock,
/// in-memory stores, ULID ids and default configuration.
#[derive(Default)]
pub struct ShuttleBuilder {
    config: Option<ShuttleConfig>,
    clock: Option<Arc<dyn Clock>>,
    stores: Option<Stores>,
    ids: Option<Arc<dyn IdGenerator>>,
}

impl ShuttleBuilder {
    pub fn config(mut self, config: ShuttleConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Use external stores instead of the in-memory ones.
    pub fn stores(mut self, stores: Stores) -> Self {
        self.stores = Some(stores);
        self
    }

    pub fn id_generator(mut self, ids: Arc<dyn IdGenerator>) -> Self {
        self.ids = Some(ids);
        self
    }

    pub fn build(self) -> Result<Shuttle, QueueError> {
        let config = self.config.unwrap_or_default();
        config.validate()?;

        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let stores = self
            .stores
            .unwrap_or_else(|| Stores::in_memory(Arc::clone(&clock)));
        let ids = self
            .ids
            .unwrap_or_else(|| Arc::new(UlidGenerator::new(Arc::clone(&clock))));

        Ok(Shuttle {
            config: Arc::new(config),
            clock,
            stores,
            ids,
            counters: JobCounters::new(),
        })
    }
}

/// The assembled job-processing core. Cheap to clone; every clone shares
/// the same stores and counters.
#[derive(Clone)]
pub struct Shuttle {
    config: Arc<ShuttleConfig>,
    clock: Arc<dyn Clock>,
    stores: Stores,
    ids: Arc<dyn IdGenerator>,
    counters: Arc<JobCounters>,
}

impl Shuttle {
    pub fn builder() -> ShuttleBuilder {
        ShuttleBuilder::default()
    }

    pub fn config(&self) -> &ShuttleConfig {
        &self.config
    }

    pub fn stores(&self) -> &Stores {
        &self.stores
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn client(&self) -> QueueClient {
        QueueClient::new(
            self.stores.clone(),
            Arc::clone(&self.ids),
            Arc::clone(&self.clock),
            self.config.queue.clone(),
            Arc::clone(&self.counters),
        )
    }

    pub fn batches(&self) -> BatchTracker {
        BatchTracker::new(
            self.stores.clone(),
            Arc::clone(&self.ids),
            Arc::clone(&self.clock),
            self.config.queue.clone(),
            Arc::clone(&self.counters),
        )
    }

    pub fn scheduler(&self) -> RetryScheduler {
        RetryScheduler::new(
            RetryPolicy::from_config(&self.config.retry),
            self.stores.clone(),
            self.batches(),
            Arc::clone(&self.ids),
            Arc::clone(&self.clock),
            Arc::clone(&self.counters),
            self.writes(),
        )
    }

    pub fn metrics(&self) -> MetricsExporter {
        MetricsExporter::new(
            Arc::clone(&self.stores.queue),
            Arc::clone(&self.stores.dead_letters),
            Arc::clone(&self.counters),
            Arc::clone(&self.clock),
        )
    }

    /// A registry builder whose default deadline comes from `worker.default_deadline_ms`.
    pub fn registry_builder(&self) -> RegistryBuilder {
        HandlerRegistry::builder().default_deadline(self.config.worker.default_deadline())
    }

    /// Shared state for the workers of one pool.
    pub fn worker_context(&self, registry: Arc<HandlerRegistry>) -> WorkerContext {
        WorkerContext {
            stores: self.stores.clone(),
            registry,
            scheduler: self.scheduler(),
            batches: self.batches(),
            clock: Arc::clone(&self.clock),
            counters: Arc::clone(&self.counters),
            writes: self.writes(),
            poll_timeout: self.config.worker.poll_timeout(),
            store_backoff: self.config.worker.store_backoff(),
            executing: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn reaper(&self, registry: Arc<HandlerRegistry>) -> Reaper {
        Reaper::new(
            self.stores.clone(),
            registry,
            self.scheduler(),
            self.batches(),
            Arc::clone(&self.clock),
            Arc::clone(&self.counters),
            self.config.reaper.interval(),
            self.config.reaper.stuck_grace(),
        )
    }

    pub fn gc(&self) -> GcLoop {
        GcLoop::new(
            Arc::clone(&self.stores.status),
            Arc::clone(&self.clock),
            self.config.gc.interval(),
            self.config.gc.retention(),
        )
    }

    /// Start configuring a worker pool that runs `registry`'s handlers.
    pub fn pool(&self, registry: Arc<HandlerRegistry>) -> WorkerPoolBuilder {
        WorkerPoolBuilder::new(self.clone(), registry)
    }

    fn writes(&self) -> StoreRetry {
        StoreRetry::new(
            self.config.worker.status_write_attempts,
            self.config.worker.store_backoff(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::NewJob;
    use crate::ports::FixedClock;
    use crate::runtime::handler_fn;
    use chrono::{TimeZone, Utc};
    use std::time::Duration;

    #[test]
    fn invalid_config_fails_the_build() {
        let mut config = ShuttleConfig::default();
        config.retry.multiplier = 0.5;
        let err = Shuttle::builder().config(config).build().err().unwrap();
        assert!(matches!(err, QueueError::Config(_)));
    }

    #[test]
    fn registry_builder_uses_the_configured_deadline() {
        let mut config = ShuttleConfig::default();
        config.worker.default_deadline_ms = 1_500;
        let shuttle = Shuttle::builder().config(config).build().unwrap();

        let registry = shuttle
            .registry_builder()
            .register("a", handler_fn(|_ctx| async move { Ok(Vec::new()) }))
            .unwrap()
            .build()
            .unwrap();
        assert_eq!(registry.deadline("a"), Duration::from_millis(1_500));
    }

    #[tokio::test]
    async fn clones_share_stores_and_counters() {
        let clock = Arc::new(FixedClock::new(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()));
        let shuttle = Shuttle::builder().clock(clock).build().unwrap();
        let other = shuttle.clone();

        let id = shuttle
            .client()
            .enqueue("q", NewJob::new("t", vec![]))
            .await
            .unwrap();
        assert!(other.client().get_job(id).await.is_ok());

        let snapshot = other.metrics().snapshot();
        assert_eq!(snapshot.totals.enqueued, 1);
        assert_eq!(snapshot.queue("q").unwrap().pending, 1);
        assert_eq!(
            snapshot.collected_at,
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
        );
    }
}
