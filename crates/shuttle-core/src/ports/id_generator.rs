//! IdGenerator port - ID 生成の抽象化
//!
//! # 実装
//! - **UlidGenerator**: Clock の時刻 + ランダム部分から ULID を生成

use std::sync::Arc;

use ulid::Ulid;

use crate::domain::ids::{BatchId, DeadLetterId, JobId};
use crate::ports::Clock;

/// IdGenerator は一度しか払い出さない ID を生成
pub trait IdGenerator: Send + Sync {
    fn job_id(&self) -> JobId;

    fn batch_id(&self) -> BatchId;

    fn dead_letter_id(&self) -> DeadLetterId;
}

/// UlidGenerator は ULID ベースの ID 生成器
///
/// FixedClock を渡すと timestamp 部分は固定になりますが、ランダム部分が
/// あるので ID は一意のままです。
pub struct UlidGenerator {
    clock: Arc<dyn Clock>,
}

impl UlidGenerator {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { clock }
    }

    fn next(&self) -> Ulid {
        let timestamp_ms = self.clock.now().timestamp_millis().max(0) as u64;
        Ulid::from_parts(timestamp_ms, rand::random())
    }
}

impl IdGenerator for UlidGenerator {
    fn job_id(&self) -> JobId {
        JobId::from(self.next())
    }

    fn batch_id(&self) -> BatchId {
        BatchId::from(self.next())
    }

    fn dead_letter_id(&self) -> DeadLetterId {
        DeadLetterId::from(self.next())
    }
}
