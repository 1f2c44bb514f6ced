//! Delivery worker: claims due events and executes their handlers.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::json;
use tokio::sync::watch;
use tokio::time::interval;
use tracing::{debug, error, info, warn};

use super::RuntimeConfig;
use crate::engine::Engine;
use crate::error::Result;
use crate::event::NewEvent;
use crate::governor::Governor;
use crate::handler::ErasedHandler;
use crate::ledger::{sleep_step_name, HandlerError, RunContext};
use crate::store::Store;

/// Polls the store for due events and runs them to completion.
///
/// # Lifecycle
///
/// 1. Poll for a due event at `delivery_poll_interval`
/// 2. Claim it (atomic lock with timeout)
/// 3. Wait for governor admission for the handler's workflow type
/// 4. Hydrate the run's step ledger and call the handler
/// 5. Flush, suspend, retry, or dead-letter per the handler's result
/// 6. Repeat until shutdown signal
pub(crate) struct DeliveryWorker<S: Store> {
    engine: Engine<S>,
    worker_id: String,
}

impl<S: Store> DeliveryWorker<S> {
    pub fn new(engine: Engine<S>, worker_id: String) -> Self {
        Self { engine, worker_id }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut poll = interval(self.engine.config().delivery_poll_interval);
        poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        info!(worker_id = %self.worker_id, "delivery worker started");

        loop {
            tokio::select! {
                _ = poll.tick() => {
                    // Drain the backlog before sleeping again.
                    loop {
                        match self.engine.process_one_as(&self.worker_id).await {
                            Ok(true) => continue,
                            Ok(false) => break,
                            Err(err) => {
                                error!(error = %err, "error processing event");
                                break;
                            }
                        }
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!(worker_id = %self.worker_id, "delivery worker shutting down");
                        break;
                    }
                }
            }
        }
    }
}

/// Claim and execute one event. Returns whether an event was processed.
pub(crate) async fn process_one<S: Store>(
    store: &S,
    handlers: &HashMap<&'static str, Arc<dyn ErasedHandler<S>>>,
    governor: &Governor,
    config: &RuntimeConfig,
    worker_id: &str,
) -> Result<bool> {
    let max_attempts = config.retry_policy.max_attempts;
    let delivery = store
        .claim_event(worker_id, config.delivery_lock_duration, max_attempts)
        .await?;
    let Some(delivery) = delivery else {
        return Ok(false);
    };

    debug!(
        event_id = %delivery.id,
        event = %delivery.name,
        run_id = %delivery.run_id,
        attempt = delivery.attempts + 1,
        "processing event"
    );

    let Some(handler) = handlers.get(delivery.name.as_str()) else {
        // No subscriber means a wiring error, not a transient condition.
        let error_msg = format!("no subscriber for event: {}", delivery.name);
        warn!(event_id = %delivery.id, error = %error_msg, "dead letter: unknown event");
        store
            .record_permanent_failure(delivery.id, &error_msg, max_attempts)
            .await?;
        return Ok(true);
    };

    let _permit = governor.admit(handler.workflow()).await;

    let mut ctx = RunContext::new(store, delivery.run_id, &delivery.name, delivery.attempts);
    ctx.hydrate().await?;

    match handler.call(&mut ctx, &delivery.payload).await {
        Ok(()) => {
            ctx.flush().await?;
            store.mark_processed(delivery.id).await?;
            debug!(event_id = %delivery.id, "event processed");
        }
        Err(HandlerError::Suspended { label, until }) => {
            // Flush what the run produced so far, record the sleep, and
            // schedule a resume that replays the same run.
            ctx.flush().await?;
            store
                .record_step(delivery.run_id, &sleep_step_name(&label), json!(true))
                .await?;
            let resume = NewEvent {
                name: delivery.name.clone(),
                payload: delivery.payload.clone(),
                deliver_at: Some(until),
                run_id: Some(delivery.run_id),
                dedupe_key: None,
            };
            store.enqueue(vec![resume]).await?;
            store.mark_processed(delivery.id).await?;
            debug!(
                event_id = %delivery.id,
                run_id = %delivery.run_id,
                label,
                resume_at = %until,
                "run suspended"
            );
        }
        Err(HandlerError::Fatal(message)) => {
            warn!(
                event_id = %delivery.id,
                error = %message,
                "fatal handler error, moving to dead letter"
            );
            store
                .record_permanent_failure(delivery.id, &message, max_attempts)
                .await?;
        }
        Err(HandlerError::Transient(message)) => {
            let failed_attempt = delivery.attempts + 1;
            if config.retry_policy.should_retry(failed_attempt) {
                let backoff = config.retry_policy.backoff_duration(failed_attempt);
                debug!(
                    event_id = %delivery.id,
                    error = %message,
                    attempt = failed_attempt,
                    backoff = ?backoff,
                    "transient failure, will retry"
                );
                store.record_failure(delivery.id, &message, backoff).await?;
            } else {
                warn!(
                    event_id = %delivery.id,
                    error = %message,
                    attempts = failed_attempt,
                    "retries exhausted, moving to dead letter"
                );
                store
                    .record_permanent_failure(delivery.id, &message, max_attempts)
                    .await?;
            }
        }
    }

    Ok(true)
}
