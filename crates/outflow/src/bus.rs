//! Publishing surface of the event bus.
//!
//! Publishing only enqueues; delivery happens on the engine's worker loops.
//! Handlers must never publish through the bus directly — follow-up events
//! go through [`RunContext::send_event`](crate::ledger::RunContext::send_event)
//! so they are buffered until the run succeeds.

use serde::Serialize;
use time::OffsetDateTime;
use tracing::debug;

use crate::error::Result;
use crate::event::NewEvent;
use crate::store::Store;

/// Handle for publishing events onto the bus.
#[derive(Debug, Clone)]
pub struct EventBus<S> {
    store: S,
}

impl<S: Store> EventBus<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    /// Publish an event for immediate delivery.
    pub async fn publish(&self, name: &str, payload: impl Serialize) -> Result<()> {
        self.publish_all(vec![NewEvent::new(name, payload)?]).await
    }

    /// Publish an event for delivery no earlier than `when`.
    pub async fn publish_at(
        &self,
        name: &str,
        payload: impl Serialize,
        when: OffsetDateTime,
    ) -> Result<()> {
        self.publish_all(vec![NewEvent::new(name, payload)?.at(when)])
            .await
    }

    /// Publish a batch of events atomically.
    pub async fn publish_all(&self, events: Vec<NewEvent>) -> Result<()> {
        for event in &events {
            debug!(
                event = %event.name,
                deliver_at = ?event.deliver_at,
                dedupe_key = ?event.dedupe_key,
                "publishing event"
            );
        }
        self.store.enqueue(events).await
    }

    pub fn store(&self) -> &S {
        &self.store
    }
}
