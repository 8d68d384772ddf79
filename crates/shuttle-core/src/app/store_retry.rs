//! Store-level retry for writes that must not be lost.
//!
//! Job-level retries (backoff, attempts) live in `retry`. This one only
//! repeats a single store call while the store reports `Unavailable`.

use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::domain::StoreError;

#[derive(Debug, Clone, Copy)]
pub struct StoreRetry {
    attempts: u32,
    backoff: Duration,
}

impl StoreRetry {
    pub fn new(attempts: u32, backoff: Duration) -> Self {
        Self {
            attempts: attempts.max(1),
            backoff,
        }
    }

    /// Run `op` until it succeeds, fails with something other than
    /// `Unavailable`, or the attempts are used up. The backoff doubles
    /// between tries.
    ///
    /// `op` must be idempotent.
    pub async fn run<T, F, Fut>(&self, what: &'static str, mut op: F) -> Result<T, StoreError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        let mut delay = self.backoff;
        let mut tries = 1;
        loop {
            match op().await {
                Err(StoreError::Unavailable(msg)) if tries < self.attempts => {
                    warn!(
                        op = what,
                        attempt = tries,
                        max_attempts = self.attempts,
                        error = %msg,
                        "store unavailable, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    delay = delay.saturating_mul(2);
                    tries += 1;
                }
                other => return other,
            }
        }
    }
}
