//! shuttle-core
//!
//! Priority job queue core: producers enqueue, a pool of workers claims and
//! runs jobs, failures retry with backoff and end in a dead-letter store.
//!
//! # モジュール構成
//! - **domain**: 値型（ids, priority, job / batch / dead-letter records, errors）
//! - **ports**: 抽象化レイヤー（PriorityQueueStore, JobStatusTable, BatchStore, DeadLetterStore, Clock, IdGenerator）
//! - **impls**: ports の in-memory 実装
//! - **runtime**: handler trait と HandlerRegistry
//! - **typed**: serde で型付けされた job の API
//! - **app**: client, worker, pool, retry, reaper, gc, metrics と、それらを組み立てる Shuttle
//! - **config**: TOML + 環境変数の設定

pub mod app;
pub mod config;
pub mod domain;
pub mod impls;
pub mod ports;
pub mod runtime;
pub mod typed;

pub use app::{QueueClient, Shuttle, WorkerPool};
pub use config::ShuttleConfig;
pub use domain::{JobId, JobStatus, NewJob, Priority, QueueError};
pub use runtime::{HandlerRegistry, JobContext, JobHandler, handler_fn};
