//! Storage abstraction for the event bus, step ledger, and cron bookkeeping.
//!
//! This module provides the [`Store`] trait that abstracts over storage
//! backends. Two implementations are provided:
//!
//! - [`MemStore`] — in-memory storage for tests and embedded use
//! - [`PgStore`] — PostgreSQL storage for production (requires `postgres` feature)

mod memory;
#[cfg(feature = "postgres")]
mod postgres;

use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use serde_json::Value;
use time::OffsetDateTime;
use uuid::Uuid;

pub use memory::MemStore;
#[cfg(feature = "postgres")]
pub use postgres::PgStore;

use crate::error::Result;
use crate::event::NewEvent;

/// A claimed event delivery, ready for handler execution.
///
/// Each delivery carries the `run_id` that keys the run's step ledger.
/// Retries of the same event and sleep resumes reuse the run_id, so the
/// ledger survives across attempts.
#[derive(Debug, Clone)]
pub struct Delivery {
    /// Unique identifier for this event (UUID v7).
    pub id: Uuid,
    /// The run whose ledger this delivery executes under.
    pub run_id: Uuid,
    /// Event name, used to route to the subscribed handler.
    pub name: String,
    /// The event payload as JSON.
    pub payload: Value,
    /// Number of previous attempts (0 for first try).
    pub attempts: u32,
    /// When the event was published.
    pub created_at: OffsetDateTime,
}

/// A dead-lettered event that has exceeded maximum retry attempts.
///
/// Dead letters are events that failed permanently or exceeded the
/// configured `max_attempts`. They remain in the store for inspection
/// and manual retry.
#[derive(Debug, Clone)]
pub struct DeadLetter {
    /// Unique identifier for this event (UUID v7).
    pub id: Uuid,
    /// The run the event belongs to.
    pub run_id: Uuid,
    /// Event name.
    pub name: String,
    /// The event payload as JSON.
    pub payload: Value,
    /// Number of failed attempts.
    pub attempts: u32,
    /// The last error message from the most recent failure.
    pub last_error: Option<String>,
    /// When the event was published.
    pub created_at: OffsetDateTime,
}

/// Query parameters for fetching dead letters.
#[derive(Debug, Clone, Default)]
pub struct DeadLetterQuery {
    /// Filter by event name.
    pub event_name: Option<String>,
    /// Filter by run ID.
    pub run_id: Option<Uuid>,
    /// Maximum number of results to return.
    pub limit: Option<u32>,
}

impl DeadLetterQuery {
    /// Create a new empty query (matches all dead letters).
    pub fn new() -> Self {
        Self::default()
    }

    /// Filter by event name.
    pub fn event_name(mut self, name: impl Into<String>) -> Self {
        self.event_name = Some(name.into());
        self
    }

    /// Filter by run ID.
    pub fn run_id(mut self, run_id: Uuid) -> Self {
        self.run_id = Some(run_id);
        self
    }

    /// Limit the number of results.
    pub fn limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// Memoized step results for one run, keyed by step name.
pub type StepLedger = HashMap<String, Value>;

/// Storage backend for events, step ledgers, and cron state.
///
/// # Locking Protocol
///
/// Events are claimed using optimistic locking:
/// 1. `claim_event` atomically selects and locks a due event
/// 2. The event is locked for `lock_duration`
/// 3. `mark_processed` or `record_failure` must be called before the lock expires
/// 4. If a worker crashes, the lock expires and another worker can claim it
pub trait Store: Send + Sync + Clone + 'static {
    /// Current time as observed by the store.
    ///
    /// Scheduling decisions go through this so a test store can pin the
    /// clock. Production stores use the wall clock.
    fn now(&self) -> OffsetDateTime {
        OffsetDateTime::now_utc()
    }

    /// Enqueue events atomically.
    ///
    /// Either every event in the batch becomes visible or none does. An
    /// event with a `dedupe_key` replaces any pending undelivered event
    /// carrying the same key. An event without a `run_id` is assigned a
    /// fresh one.
    fn enqueue(&self, events: Vec<NewEvent>) -> impl Future<Output = Result<()>> + Send;

    /// Claim the next due event for processing.
    ///
    /// Returns `None` if no events are due. An event is due when its
    /// `deliver_at` (or publish time) is at or before now and it is not
    /// locked. The event is locked for `lock_duration` to prevent
    /// double-processing.
    ///
    /// Events where `attempts >= max_attempts` are excluded (dead letters).
    fn claim_event(
        &self,
        worker_id: &str,
        lock_duration: Duration,
        max_attempts: u32,
    ) -> impl Future<Output = Result<Option<Delivery>>> + Send;

    /// Mark an event as successfully processed.
    ///
    /// Sets `processed_at` to the current time, removing it from the
    /// pending queue.
    fn mark_processed(&self, event_id: Uuid) -> impl Future<Output = Result<()>> + Send;

    /// Record a failure and schedule retry with backoff.
    ///
    /// Increments `attempts`, records the error message, and sets
    /// `locked_until` to `now + backoff_duration` to delay retry.
    fn record_failure(
        &self,
        event_id: Uuid,
        error: &str,
        backoff_duration: Duration,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Record a permanent failure, immediately dead-lettering the event.
    ///
    /// This sets `attempts` to `max_attempts` to exclude the event from retries.
    fn record_permanent_failure(
        &self,
        event_id: Uuid,
        error: &str,
        max_attempts: u32,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Load the step ledger for a run.
    fn load_ledger(&self, run_id: Uuid) -> impl Future<Output = Result<StepLedger>> + Send;

    /// Record a completed step's result in the run's ledger.
    ///
    /// Idempotent: re-recording an existing step name is a no-op, the
    /// first recorded value wins.
    fn record_step(
        &self,
        run_id: Uuid,
        step_name: &str,
        value: Value,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Fetch dead-lettered events matching the query.
    fn fetch_dead_letters(
        &self,
        query: &DeadLetterQuery,
        max_attempts: u32,
    ) -> impl Future<Output = Result<Vec<DeadLetter>>> + Send;

    /// Count dead-lettered events matching the query.
    fn count_dead_letters(
        &self,
        query: &DeadLetterQuery,
        max_attempts: u32,
    ) -> impl Future<Output = Result<u64>> + Send;

    /// Retry a dead-lettered event.
    ///
    /// Resets the event's `attempts` to 0 and clears `locked_until`,
    /// making it available for processing again. The run's existing step
    /// ledger is preserved, so completed steps are not re-executed.
    ///
    /// Returns `Ok(true)` if the event was found and reset,
    /// `Ok(false)` if the event was not found or already processed.
    fn retry_dead_letter(&self, event_id: Uuid) -> impl Future<Output = Result<bool>> + Send;

    /// Load the last fire time recorded for a cron job.
    fn cron_last_fired(
        &self,
        job_name: &str,
    ) -> impl Future<Output = Result<Option<OffsetDateTime>>> + Send;

    /// Persist the last fire time for a cron job.
    fn set_cron_last_fired(
        &self,
        job_name: &str,
        fired_at: OffsetDateTime,
    ) -> impl Future<Output = Result<()>> + Send;
}
