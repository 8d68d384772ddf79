//! App - アプリケーション層
//!
//! ports を組み合わせて queue の振る舞いを実装します。
//!
//! # 主要コンポーネント
//! - **Shuttle**: 部品の組み立て（builder）
//! - **QueueClient**: 投入・照会・dead-letter の再投入
//! - **BatchTracker**: バッチの作成と完了集計
//! - **Worker** / **WorkerPool**: claim → execute → settle のループと、その束
//! - **RetryScheduler**: backoff 付き再投入と dead-letter
//! - **Reaper**: `processing` のまま止まった job の回収
//! - **GcLoop**: 終了した record の TTL 削除
//! - **MetricsExporter**: queue depth の pull 型スナップショット

pub mod batch;
pub mod builder;
pub mod client;
pub mod gc_loop;
pub mod metrics;
pub mod pool;
pub mod reaper_loop;
pub mod retry;
pub mod store_retry;
pub mod worker_loop;

pub use self::batch::BatchTracker;
pub use self::builder::{Shuttle, ShuttleBuilder};
pub use self::client::QueueClient;
pub use self::gc_loop::GcLoop;
pub use self::metrics::{CounterSnapshot, JobCounters, MetricsExporter, MetricsSnapshot, QueueMetrics};
pub use self::pool::{ShutdownReport, WorkerPool, WorkerPoolBuilder};
pub use self::reaper_loop::{ReapReport, Reaper};
pub use self::retry::{Disposition, RetryDecision, RetryPolicy, RetryScheduler};
pub use self::store_retry::StoreRetry;
pub use self::worker_loop::{Settled, Worker, WorkerContext};
