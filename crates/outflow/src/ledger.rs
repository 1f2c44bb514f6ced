//! Durable step ledger and the per-run execution context.
//!
//! A handler's work is broken into named steps. Each step's result is
//! recorded in the run's ledger the first time it completes; when the run
//! is retried, completed steps return their recorded result instead of
//! re-executing. Side effects therefore execute at most once per run as
//! long as they live inside a step.
//!
//! Two rules keep replay safe:
//!
//! - Follow-up events are buffered on the context and enqueued only after
//!   the handler returns success or suspends. A naked publish inside a
//!   handler would re-fire on every retry.
//! - Guard reads (checking that an enrollment is still active, that a
//!   pending email is still approved) must NOT go through the ledger — a
//!   memoized guard would freeze a stale answer across a retry.

use std::fmt::Display;
use std::future::Future;

use serde::de::DeserializeOwned;
use serde::Serialize;
use time::OffsetDateTime;
use tracing::debug;
use uuid::Uuid;

use crate::event::NewEvent;
use crate::store::{StepLedger, Store};

/// Failure mode of a handler attempt.
///
/// | Variant | Worker behavior |
/// |-------------|-------------------------------------------------------|
/// | `Transient` | Retry with exponential backoff, dead-letter when exhausted |
/// | `Fatal` | Dead-letter immediately, no retries |
/// | `Suspended` | Not a failure: flush buffered events, schedule a resume |
///
/// `Suspended` is control flow for [`RunContext::sleep_until`]; handlers
/// propagate it with `?` and never construct it directly.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    /// Retryable failure (provider timeout, transient storage error).
    #[error("transient: {0}")]
    Transient(String),

    /// Non-retryable failure (missing entity, malformed payload).
    #[error("fatal: {0}")]
    Fatal(String),

    /// The run parked itself until `until`; resume replays the ledger.
    #[error("suspended at {label} until {until}")]
    Suspended {
        label: String,
        until: OffsetDateTime,
    },
}

impl HandlerError {
    pub fn transient(err: impl Display) -> Self {
        Self::Transient(err.to_string())
    }

    pub fn fatal(err: impl Display) -> Self {
        Self::Fatal(err.to_string())
    }
}

impl From<crate::Error> for HandlerError {
    fn from(err: crate::Error) -> Self {
        match err {
            // A payload that cannot (de)serialize will never succeed.
            crate::Error::Serialization(_) => Self::Fatal(err.to_string()),
            // Everything else surfacing through `?` is storage-shaped.
            other => Self::Transient(other.to_string()),
        }
    }
}

/// Execution context for one handler attempt of one run.
///
/// Created by the delivery worker with the run's ledger preloaded. Steps
/// record their results as they complete; buffered follow-up events are
/// flushed by the worker after the attempt succeeds or suspends.
pub struct RunContext<'a, S> {
    store: &'a S,
    run_id: Uuid,
    event_name: &'a str,
    attempt: u32,
    ledger: StepLedger,
    pending: Vec<(String, NewEvent)>,
}

impl<'a, S: Store> RunContext<'a, S> {
    pub fn new(store: &'a S, run_id: Uuid, event_name: &'a str, attempt: u32) -> Self {
        Self {
            store,
            run_id,
            event_name,
            attempt,
            ledger: StepLedger::new(),
            pending: Vec::new(),
        }
    }

    /// Load the run's existing ledger from the store.
    pub async fn hydrate(&mut self) -> crate::Result<()> {
        self.ledger = self.store.load_ledger(self.run_id).await?;
        Ok(())
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Current attempt number (0-based; first execution is attempt 0).
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn is_retry(&self) -> bool {
        self.attempt > 0
    }

    /// Current time as observed by the store.
    pub fn now(&self) -> OffsetDateTime {
        self.store.now()
    }

    /// Whether a step already completed in this run.
    ///
    /// Used by guards that must behave differently on a replay (the
    /// recorded send already happened) than on a genuinely fresh run.
    pub fn has_step(&self, name: &str) -> bool {
        self.ledger.contains_key(name)
    }

    /// Execute a named step at most once per run.
    ///
    /// If the step already completed in a previous attempt, its recorded
    /// result is returned and `f` is never called. Otherwise `f` runs and,
    /// on success, its result is recorded durably before this returns.
    ///
    /// Step names must be unique within a run and stable across attempts.
    pub async fn run_step<T, F, Fut>(&mut self, name: &str, f: F) -> Result<T, HandlerError>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, HandlerError>>,
    {
        if let Some(recorded) = self.ledger.get(name) {
            debug!(
                run_id = %self.run_id,
                event = self.event_name,
                step = name,
                "step replayed from ledger"
            );
            return serde_json::from_value(recorded.clone())
                .map_err(|err| HandlerError::Fatal(format!("recorded step {name}: {err}")));
        }

        let result = f().await?;
        let value = serde_json::to_value(&result)
            .map_err(|err| HandlerError::Fatal(format!("step result {name}: {err}")))?;
        self.store.record_step(self.run_id, name, value.clone()).await?;
        self.ledger.insert(name.to_string(), value);
        debug!(
            run_id = %self.run_id,
            event = self.event_name,
            step = name,
            "step completed"
        );
        Ok(result)
    }

    /// Buffer a follow-up event, keyed by a step name.
    ///
    /// The event is enqueued only after the handler attempt succeeds or
    /// suspends; a retried run skips steps that already flushed. The event
    /// starts a fresh run with its own ledger.
    pub fn send_event(&mut self, step_name: &str, event: NewEvent) {
        if self.ledger.contains_key(step_name) {
            return;
        }
        self.pending.push((step_name.to_string(), event));
    }

    /// Park the run until `when`.
    ///
    /// Returns `Err(Suspended)` on first encounter, which the handler
    /// propagates with `?`. The worker flushes buffered events, records
    /// the sleep in the ledger, and schedules a resume delivery that
    /// replays the run past this point.
    pub fn sleep_until(&self, label: &str, when: OffsetDateTime) -> Result<(), HandlerError> {
        if self.ledger.contains_key(&sleep_step_name(label)) {
            return Ok(());
        }
        Err(HandlerError::Suspended {
            label: label.to_string(),
            until: when,
        })
    }

    /// Enqueue buffered events and record their flush markers.
    ///
    /// Events go out before markers are recorded, so a crash in between
    /// re-delivers rather than drops (at-least-once).
    pub async fn flush(self) -> crate::Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let events: Vec<NewEvent> = self.pending.iter().map(|(_, e)| e.clone()).collect();
        self.store.enqueue(events).await?;
        for (step_name, event) in &self.pending {
            let marker = serde_json::json!({
                "event": event.name,
                "deliver_at": event.deliver_at.map(|at| at.unix_timestamp()),
            });
            self.store.record_step(self.run_id, step_name, marker).await?;
        }
        Ok(())
    }
}

/// Ledger key recording a completed sleep.
pub(crate) fn sleep_step_name(label: &str) -> String {
    format!("sleep:{label}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemStore;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn step_executes_once_across_attempts() {
        let store = MemStore::new();
        let run_id = Uuid::now_v7();
        let calls = AtomicU32::new(0);

        for attempt in 0..3 {
            let mut ctx = RunContext::new(&store, run_id, "test/event", attempt);
            ctx.hydrate().await.unwrap();
            let value: u32 = ctx
                .run_step("compute", || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(41 + calls.load(Ordering::SeqCst))
                })
                .await
                .unwrap();
            assert_eq!(value, 42);
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_step_reruns_but_earlier_steps_replay() {
        let store = MemStore::new();
        let run_id = Uuid::now_v7();
        let first_calls = AtomicU32::new(0);

        // Attempt 0: first step succeeds, second fails.
        let mut ctx = RunContext::new(&store, run_id, "test/event", 0);
        ctx.hydrate().await.unwrap();
        let _: String = ctx
            .run_step("first", || async {
                first_calls.fetch_add(1, Ordering::SeqCst);
                Ok("done".to_string())
            })
            .await
            .unwrap();
        let failed: Result<String, _> = ctx
            .run_step("second", || async { Err(HandlerError::transient("boom")) })
            .await;
        assert!(matches!(failed, Err(HandlerError::Transient(_))));

        // Attempt 1: first replays from the ledger, second runs fresh.
        let mut ctx = RunContext::new(&store, run_id, "test/event", 1);
        ctx.hydrate().await.unwrap();
        let _: String = ctx
            .run_step("first", || async {
                first_calls.fetch_add(1, Ordering::SeqCst);
                Ok("done".to_string())
            })
            .await
            .unwrap();
        let ok: String = ctx
            .run_step("second", || async { Ok("recovered".to_string()) })
            .await
            .unwrap();

        assert_eq!(first_calls.load(Ordering::SeqCst), 1);
        assert_eq!(ok, "recovered");
    }

    #[tokio::test]
    async fn buffered_events_enqueue_only_on_flush() {
        let store = MemStore::new();
        let run_id = Uuid::now_v7();

        let mut ctx = RunContext::new(&store, run_id, "test/event", 0);
        ctx.hydrate().await.unwrap();
        ctx.send_event(
            "emit-next",
            NewEvent::new("other/event", json!({})).unwrap(),
        );
        assert_eq!(store.pending_count(), 0);

        ctx.flush().await.unwrap();
        assert_eq!(store.pending_count(), 1);
    }

    #[tokio::test]
    async fn flushed_event_does_not_rebuffer_on_replay() {
        let store = MemStore::new();
        let run_id = Uuid::now_v7();

        let mut ctx = RunContext::new(&store, run_id, "test/event", 0);
        ctx.hydrate().await.unwrap();
        ctx.send_event("emit-next", NewEvent::new("other/event", json!({})).unwrap());
        ctx.flush().await.unwrap();

        let mut ctx = RunContext::new(&store, run_id, "test/event", 1);
        ctx.hydrate().await.unwrap();
        ctx.send_event("emit-next", NewEvent::new("other/event", json!({})).unwrap());
        ctx.flush().await.unwrap();

        assert_eq!(store.pending_count(), 1);
    }

    #[tokio::test]
    async fn sleep_suspends_then_passes_after_marker() {
        let store = MemStore::new();
        let run_id = Uuid::now_v7();
        let until = OffsetDateTime::now_utc() + time::Duration::hours(2);

        let mut ctx = RunContext::new(&store, run_id, "test/event", 0);
        ctx.hydrate().await.unwrap();
        let err = ctx.sleep_until("await-send", until).unwrap_err();
        assert!(matches!(err, HandlerError::Suspended { .. }));

        // The worker records the sleep marker before scheduling the resume.
        store
            .record_step(run_id, &sleep_step_name("await-send"), json!(true))
            .await
            .unwrap();

        let mut ctx = RunContext::new(&store, run_id, "test/event", 0);
        ctx.hydrate().await.unwrap();
        assert!(ctx.sleep_until("await-send", until).is_ok());
    }
}
