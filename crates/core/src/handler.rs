//! Handler trait: what the consumer calls for every envelope.

use async_trait::async_trait;
use std::future::Future;

use crate::context::Context;
use crate::envelope::Envelope;
use crate::error::Result;

/// Processes one envelope.
///
/// Return a [`crate::ClassifiedError`] (via `Error::Handler`) when the kind of
/// failure is known; anything else is classified by its text.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, ctx: &Context, envelope: &Envelope) -> Result<()>;
}

/// Adapter that turns a closure into a [`Handler`]. See [`handler_fn`].
pub struct HandlerFn<F> {
    f: F,
}

/// Wrap an async closure as a handler.
///
/// The closure receives owned copies so it can move them into its future.
///
/// ```ignore
/// let handler = handler_fn(|_ctx, envelope| async move {
///     let order: Order = envelope.decode_json()?;
///     repo.save(order).await.map_err(|e| ClassifiedError::transient("save failed").with_source(e))?;
///     Ok(())
/// });
/// ```
pub fn handler_fn<F, Fut>(f: F) -> HandlerFn<F>
where
    F: Fn(Context, Envelope) -> Fut + Send + Sync,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    HandlerFn { f }
}

#[async_trait]
impl<F, Fut> Handler for HandlerFn<F>
where
    F: Fn(Context, Envelope) -> Fut + Send + Sync,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    async fn handle(&self, ctx: &Context, envelope: &Envelope) -> Result<()> {
        (self.f)(ctx.clone(), envelope.clone()).await
    }
}
