//! RegistryBuilder への typed 登録

use std::sync::Arc;
use std::time::Duration;

use super::handler::{Typed, TypedHandler};
use super::kind::JobKind;
use crate::runtime::{RegistryBuilder, RegistryError};

impl RegistryBuilder {
    /// Register `handler` under `T::TYPE`.
    ///
    /// ```ignore
    /// let registry = HandlerRegistry::builder()
    ///     .register_typed::<SendEmail, _>(SendEmailHandler)?
    ///     .expect_types(&[SendEmail::TYPE])
    ///     .build()?;
    /// ```
    pub fn register_typed<T, H>(self, handler: H) -> Result<Self, RegistryError>
    where
        T: JobKind,
        H: TypedHandler<T> + 'static,
    {
        self.insert(T::TYPE.to_string(), Arc::new(Typed::<T, H>::new(handler)), None)
    }

    pub fn register_typed_with_deadline<T, H>(
        self,
        deadline: Duration,
        handler: H,
    ) -> Result<Self, RegistryError>
    where
        T: JobKind,
        H: TypedHandler<T> + 'static,
    {
        self.insert(
            T::TYPE.to_string(),
            Arc::new(Typed::<T, H>::new(handler)),
            Some(deadline),
        )
    }
}
