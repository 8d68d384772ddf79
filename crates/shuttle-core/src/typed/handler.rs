//! TypedHandler trait と dyn 化アダプタ
//!
//! `Typed<T, H>` が payload を decode して `TypedHandler<T>` を呼び、結果を
//! JSON に encode します（type erasure: `TypedHandler<T>` → `JobHandler`）。

use std::marker::PhantomData;

use async_trait::async_trait;

use super::codec::decode_payload;
use super::kind::JobKind;
use crate::domain::HandlerError;
use crate::runtime::{JobContext, JobHandler};

/// Handler for a typed job.
///
/// `ctx` still carries the attempt number and the cancellation token.
#[async_trait]
pub trait TypedHandler<T: JobKind>: Send + Sync {
    async fn handle(&self, job: T, ctx: &JobContext) -> Result<T::Output, HandlerError>;
}

/// Adapter registered in the [`HandlerRegistry`](crate::runtime::HandlerRegistry).
pub struct Typed<T: JobKind, H: TypedHandler<T>> {
    handler: H,
    _marker: PhantomData<fn() -> T>,
}

impl<T: JobKind, H: TypedHandler<T>> Typed<T, H> {
    pub fn new(handler: H) -> Self {
        Self {
            handler,
            _marker: PhantomData,
        }
    }
}

#[async_trait]
impl<T: JobKind, H: TypedHandler<T>> JobHandler for Typed<T, H> {
    async fn handle(&self, ctx: JobContext) -> Result<Vec<u8>, HandlerError> {
        // a payload that does not decode will not decode on the next attempt either
        let job: T = decode_payload(&ctx.payload)
            .map_err(|e| HandlerError::permanent(e.to_string()))?;
        let output = self.handler.handle(job, &ctx).await?;
        serde_json::to_vec(&output)
            .map_err(|e| HandlerError::permanent(format!("encode result of {}: {e}", T::TYPE)))
    }
}
