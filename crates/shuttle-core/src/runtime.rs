//! Runtime - handler の登録と job_type による dispatch
//!
//! `HandlerRegistry` は起動時に `RegistryBuilder` で一度だけ組み立て、
//! 以後は `Arc` で各 Worker に共有する（実行中に handler 集合は変わらない）。

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::domain::{HandlerError, JobId, QueueError};

/// Deadline used when a job type is registered without one.
pub const DEFAULT_DEADLINE: Duration = Duration::from_secs(30);

/// Everything a handler gets to see about one attempt.
#[derive(Debug, Clone)]
pub struct JobContext {
    pub job_id: JobId,
    pub queue: String,
    pub job_type: String,
    pub payload: Vec<u8>,
    /// 1-based attempt number.
    pub attempt: u32,
    pub max_attempts: u32,
    /// Cancelled when the deadline of this job type elapses. The worker
    /// abandons the attempt right after, so long-running handlers should
    /// watch it and stop at a safe point.
    pub cancel: CancellationToken,
}

impl JobContext {
    pub fn is_last_attempt(&self) -> bool {
        self.attempt >= self.max_attempts
    }
}

/// A handler for one job type.
///
/// Payload bytes are opaque to the queue; the handler decodes them. The
/// returned bytes are stored as the job result.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, ctx: JobContext) -> Result<Vec<u8>, HandlerError>;
}

/// Closure handler, see [`handler_fn`].
pub struct FnHandler<F>(F);

/// Wrap an async closure as a [`JobHandler`].
///
/// ```ignore
/// let greet = handler_fn(|ctx| async move { Ok(ctx.payload) });
/// ```
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(JobContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Vec<u8>, HandlerError>> + Send + 'static,
{
    FnHandler(f)
}

#[async_trait]
impl<F, Fut> JobHandler for FnHandler<F>
where
    F: Fn(JobContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Vec<u8>, HandlerError>> + Send + 'static,
{
    async fn handle(&self, ctx: JobContext) -> Result<Vec<u8>, HandlerError> {
        (self.0)(ctx).await
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("handler for job type '{0}' is already registered")]
    AlreadyRegistered(String),

    #[error("missing job types: {0:?}. These types were expected but not registered.")]
    MissingJobTypes(Vec<String>),

    #[error("deadline for job type '{0}' must be greater than zero")]
    ZeroDeadline(String),
}

impl From<RegistryError> for QueueError {
    fn from(err: RegistryError) -> Self {
        QueueError::Registry(err.to_string())
    }
}

struct Registration {
    handler: Arc<dyn JobHandler>,
    deadline: Duration,
}

/// Immutable job_type -> handler mapping.
pub struct HandlerRegistry {
    handlers: HashMap<String, Registration>,
    default_deadline: Duration,
}

impl HandlerRegistry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::new()
    }

    pub fn get(&self, job_type: &str) -> Option<Arc<dyn JobHandler>> {
        self.handlers.get(job_type).map(|r| Arc::clone(&r.handler))
    }

    pub fn contains(&self, job_type: &str) -> bool {
        self.handlers.contains_key(job_type)
    }

    /// Execution deadline of `job_type`. Unknown types get the default.
    pub fn deadline(&self, job_type: &str) -> Duration {
        self.handlers
            .get(job_type)
            .map_or(self.default_deadline, |r| r.deadline)
    }

    /// Registered types, sorted.
    pub fn job_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.handlers.keys().cloned().collect();
        types.sort();
        types
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

/// Builds a [`HandlerRegistry`].
///
/// # Fail-fast
/// - 同じ job_type の二重登録はエラー
/// - `expect_types()` で指定した型が未登録なら `build()` がエラー
pub struct RegistryBuilder {
    handlers: HashMap<String, (Arc<dyn JobHandler>, Option<Duration>)>,
    expected: Option<Vec<String>>,
    default_deadline: Duration,
}

impl RegistryBuilder {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
            expected: None,
            default_deadline: DEFAULT_DEADLINE,
        }
    }

    /// Deadline for types registered without an explicit one.
    pub fn default_deadline(mut self, deadline: Duration) -> Self {
        self.default_deadline = deadline;
        self
    }

    pub fn register<H>(self, job_type: impl Into<String>, handler: H) -> Result<Self, RegistryError>
    where
        H: JobHandler + 'static,
    {
        self.insert(job_type.into(), Arc::new(handler), None)
    }

    pub fn register_with_deadline<H>(
        self,
        job_type: impl Into<String>,
        deadline: Duration,
        handler: H,
    ) -> Result<Self, RegistryError>
    where
        H: JobHandler + 'static,
    {
        self.insert(job_type.into(), Arc::new(handler), Some(deadline))
    }

    pub(crate) fn insert(
        mut self,
        job_type: String,
        handler: Arc<dyn JobHandler>,
        deadline: Option<Duration>,
    ) -> Result<Self, RegistryError> {
        if self.handlers.contains_key(&job_type) {
            return Err(RegistryError::AlreadyRegistered(job_type));
        }
        if deadline == Some(Duration::ZERO) {
            return Err(RegistryError::ZeroDeadline(job_type));
        }
        // None is resolved at build() so default_deadline() may come later
        self.handlers.insert(job_type, (handler, deadline));
        Ok(self)
    }

    pub fn expect_types(mut self, job_types: &[&str]) -> Self {
        self.expected = Some(job_types.iter().map(|t| t.to_string()).collect());
        self
    }

    pub fn build(self) -> Result<Arc<HandlerRegistry>, RegistryError> {
        if let Some(expected) = &self.expected {
            let missing: Vec<String> = expected
                .iter()
                .filter(|t| !self.handlers.contains_key(*t))
                .cloned()
                .collect();
            if !missing.is_empty() {
                return Err(RegistryError::MissingJobTypes(missing));
            }
        }

        let default_deadline = self.default_deadline;
        let handlers = self
            .handlers
            .into_iter()
            .map(|(job_type, (handler, deadline))| {
                let registration = Registration {
                    handler,
                    deadline: deadline.unwrap_or(default_deadline),
                };
                (job_type, registration)
            })
            .collect();

        Ok(Arc::new(HandlerRegistry {
            handlers,
            default_deadline,
        }))
    }
}

impl Default for RegistryBuilder {
    fn default() -> Self {
        Self::new()
    }
}
