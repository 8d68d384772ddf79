//! Job priority and the ordering score of the priority queue.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::errors::QueueError;

/// Weight of one priority step in the score, in milliseconds (~31.7 years).
///
/// Any priority difference outweighs any age difference a queue will see,
/// so equal priorities fall back to FIFO by enqueue time.
pub const PRIORITY_WEIGHT_MS: i64 = 1_000_000_000_000;

/// Bounded job priority. Higher is processed sooner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct Priority(u8);

impl Priority {
    pub const MIN: Priority = Priority(1);
    pub const MAX: Priority = Priority(10);
    pub const DEFAULT: Priority = Priority(5);

    pub fn new(value: u8) -> Result<Self, QueueError> {
        if (Self::MIN.0..=Self::MAX.0).contains(&value) {
            Ok(Self(value))
        } else {
            Err(QueueError::InvalidPriority(value))
        }
    }

    pub fn get(self) -> u8 {
        self.0
    }

    /// Raise the priority by `steps`, saturating at [`Priority::MAX`].
    pub fn boosted(self, steps: u8) -> Self {
        Self(self.0.saturating_add(steps).min(Self::MAX.0))
    }
}

impl Default for Priority {
    fn default() -> Self {
        Self::DEFAULT
    }
}

impl TryFrom<u8> for Priority {
    type Error = QueueError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Priority> for u8 {
    fn from(p: Priority) -> Self {
        p.0
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Ordering key of a pending entry: lower scores are claimed first.
///
/// `score = enqueue_time - priority * K`
pub fn score(enqueued_at: DateTime<Utc>, priority: Priority) -> i64 {
    enqueued_at.timestamp_millis() - i64::from(priority.0) * PRIORITY_WEIGHT_MS
}
