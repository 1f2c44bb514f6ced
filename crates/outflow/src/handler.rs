//! Handler trait for event subscribers.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::ledger::{HandlerError, RunContext};
use crate::store::Store;

/// A durable workflow subscribed to one event.
///
/// The handler receives a typed payload and a [`RunContext`] whose step
/// ledger makes side effects at-most-once per run. Delivery is
/// at-least-once: the same event may be handled again after a transient
/// failure, with completed steps replayed from the ledger.
///
/// # Results
///
/// | Result | Worker behavior |
/// |--------|-----------------|
/// | `Ok(())` | Flush buffered events, mark the event processed |
/// | `Err(Transient)` | Retry with exponential backoff, then dead letter |
/// | `Err(Fatal)` | Dead letter immediately |
/// | `Err(Suspended)` | Flush, record the sleep, schedule a resume |
///
/// For **expected outcomes** (enrollment no longer active, approval still
/// pending), return `Ok(())` after handling the condition — errors are for
/// situations where the run itself cannot make progress.
#[async_trait]
pub trait EventHandler<S: Store>: Send + Sync + 'static {
    /// The event name this handler subscribes to.
    const EVENT: &'static str;

    /// Workflow type name, used for rate and concurrency governance.
    const WORKFLOW: &'static str;

    /// Typed payload carried by the event.
    type Payload: DeserializeOwned + Send;

    async fn handle(
        &self,
        ctx: &mut RunContext<'_, S>,
        payload: Self::Payload,
    ) -> Result<(), HandlerError>;
}

/// Object-safe adapter over [`EventHandler`] for the registry.
#[async_trait]
pub(crate) trait ErasedHandler<S>: Send + Sync {
    fn event_name(&self) -> &'static str;

    fn workflow(&self) -> &'static str;

    async fn call(
        &self,
        ctx: &mut RunContext<'_, S>,
        payload: &Value,
    ) -> Result<(), HandlerError>;
}

pub(crate) struct Subscription<H>(pub(crate) H);

#[async_trait]
impl<S, H> ErasedHandler<S> for Subscription<H>
where
    S: Store,
    H: EventHandler<S>,
{
    fn event_name(&self) -> &'static str {
        H::EVENT
    }

    fn workflow(&self) -> &'static str {
        H::WORKFLOW
    }

    async fn call(
        &self,
        ctx: &mut RunContext<'_, S>,
        payload: &Value,
    ) -> Result<(), HandlerError> {
        // A payload that does not deserialize will never succeed.
        let payload: H::Payload = serde_json::from_value(payload.clone())
            .map_err(|err| HandlerError::Fatal(format!("payload for {}: {err}", H::EVENT)))?;
        self.0.handle(ctx, payload).await
    }
}
