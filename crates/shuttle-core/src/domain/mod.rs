//! Domain model (ids, priority, job / batch / dead-letter records, errors).
//!
//! I/O を一切持たない値型だけを置きます。

pub mod batch;
pub mod dead_letter;
pub mod errors;
pub mod ids;
pub mod job;
pub mod priority;
pub mod state;

pub use batch::{BatchOutcome, BatchRecord, BatchView};
pub use dead_letter::DeadLetterEntry;
pub use errors::{FailureKind, HandlerError, JobFailure, QueueError, StoreError};
pub use ids::{BatchId, DeadLetterId, Id, IdMarker, JobId, ParseIdError};
pub use job::{JobPatch, JobRecord, JobView, NewJob};
pub use priority::{PRIORITY_WEIGHT_MS, Priority, score};
pub use state::JobStatus;
