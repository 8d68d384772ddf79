//! GcLoop - 終了した JobRecord の期限切れ削除
//!
//! `completed` / `failed` のまま `retention` を過ぎた record を status table
//! から消します。dead-letter entry は record のコピーを持つので影響を受けません。

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::domain::StoreError;
use crate::ports::{Clock, JobStatusTable};

pub struct GcLoop {
    status: Arc<dyn JobStatusTable>,
    clock: Arc<dyn Clock>,
    interval: Duration,
    retention: Duration,
}

impl GcLoop {
    pub fn new(
        status: Arc<dyn JobStatusTable>,
        clock: Arc<dyn Clock>,
        interval: Duration,
        retention: Duration,
    ) -> Self {
        Self {
            status,
            clock,
            interval,
            retention,
        }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    // a dropped sender means the owner is gone
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    match self.purge_once().await {
                        Ok(0) => debug!("gc pass found nothing"),
                        Ok(purged) => info!(purged, "expired finished job records"),
                        Err(e) => warn!(error = %e, "gc pass failed"),
                    }
                }
            }
        }
        debug!("gc stopped");
    }

    /// Drop every terminal record last touched before `now - retention`.
    pub async fn purge_once(&self) -> Result<usize, StoreError> {
        let retention = chrono::TimeDelta::from_std(self.retention).unwrap_or(chrono::TimeDelta::MAX);
        let Some(before) = self.clock.now().checked_sub_signed(retention) else {
            return Ok(0);
        };
        self.status.purge_finished(before).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{JobId, JobPatch, JobRecord, JobStatus, Priority};
    use crate::impls::InMemoryStatusTable;
    use crate::ports::FixedClock;
    use chrono::{TimeZone, Utc};
    use ulid::Ulid;

    fn record(clock: &FixedClock) -> JobRecord {
        JobRecord::new(
            JobId::from_ulid(Ulid::new()),
            "q",
            "t",
            vec![],
            Priority::DEFAULT,
            1,
            clock.now(),
        )
    }

    #[tokio::test]
    async fn only_expired_finished_records_are_purged() {
        let clock = Arc::new(FixedClock::new(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()));
        let table = Arc::new(InMemoryStatusTable::new(clock.clone()));

        let done = record(&clock);
        let running = record(&clock);
        table.insert(done.clone()).await.unwrap();
        table.insert(running.clone()).await.unwrap();
        for id in [done.id, running.id] {
            table
                .update(id, JobPatch::claimed(1, clock.now()))
                .await
                .unwrap();
        }
        table
            .update(done.id, JobPatch::completed(clock.now(), vec![]))
            .await
            .unwrap();

        let gc = GcLoop::new(
            table.clone(),
            clock.clone(),
            Duration::from_secs(60),
            Duration::from_secs(3_600),
        );

        clock.advance(chrono::Duration::minutes(30));
        assert_eq!(gc.purge_once().await.unwrap(), 0);

        clock.advance(chrono::Duration::minutes(31));
        assert_eq!(gc.purge_once().await.unwrap(), 1);
        assert!(table.get(done.id).await.unwrap().is_none());
        let left = table.get(running.id).await.unwrap().unwrap();
        assert_eq!(left.status, JobStatus::Processing);
    }

    #[tokio::test]
    async fn stops_on_shutdown() {
        let clock = Arc::new(FixedClock::new(Utc::now()));
        let table = Arc::new(InMemoryStatusTable::new(clock.clone()));
        let gc = GcLoop::new(table, clock, Duration::from_millis(5), Duration::from_secs(1));
        let (tx, rx) = watch::channel(false);

        let handle = tokio::spawn(gc.run(rx));
        tokio::time::sleep(Duration::from_millis(20)).await;
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
