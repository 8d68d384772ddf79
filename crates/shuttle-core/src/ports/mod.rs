//! Ports - 抽象化レイヤー
//!
//! Hexagonal Architecture の「ポート」。永続化の具体的な製品はここに出てきません。
//! claim の原子性を満たせる key-value / ordered-set ストアなら何でも実装できます。

pub mod batch_store;
pub mod clock;
pub mod dead_letter_store;
pub mod id_generator;
pub mod queue_store;
pub mod status_table;

pub use self::batch_store::BatchStore;
pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::dead_letter_store::DeadLetterStore;
pub use self::id_generator::{IdGenerator, UlidGenerator};
pub use self::queue_store::{Claim, PriorityQueueStore, QueueDepth, QueueEntry};
pub use self::status_table::JobStatusTable;
