//! In-memory store for tests and embedded single-process use.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde_json::Value;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::Result;
use crate::event::NewEvent;
use crate::store::{DeadLetter, DeadLetterQuery, Delivery, StepLedger, Store};

#[derive(Debug, Clone)]
struct EventRow {
    id: Uuid,
    run_id: Uuid,
    name: String,
    payload: Value,
    deliver_at: OffsetDateTime,
    dedupe_key: Option<String>,
    attempts: u32,
    last_error: Option<String>,
    locked_until: Option<OffsetDateTime>,
    locked_by: Option<String>,
    processed_at: Option<OffsetDateTime>,
    created_at: OffsetDateTime,
}

impl EventRow {
    fn is_pending(&self) -> bool {
        self.processed_at.is_none()
    }

    fn is_locked(&self, now: OffsetDateTime) -> bool {
        self.locked_until.is_some_and(|until| until > now)
    }
}

#[derive(Debug, Default)]
struct Inner {
    events: Vec<EventRow>,
    ledgers: HashMap<Uuid, StepLedger>,
    cron: HashMap<String, OffsetDateTime>,
    now_override: Option<OffsetDateTime>,
}

/// In-memory [`Store`] backed by a mutex.
///
/// The clock can be pinned with [`MemStore::set_now`], which makes scheduled
/// delivery and lock expiry deterministic in tests.
#[derive(Debug, Clone, Default)]
pub struct MemStore {
    inner: Arc<Mutex<Inner>>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Pin the store's clock to `now`.
    pub fn set_now(&self, now: OffsetDateTime) {
        self.lock().now_override = Some(now);
    }

    /// Advance the pinned clock. Pins to the wall clock first if unpinned.
    pub fn advance(&self, by: Duration) {
        let mut inner = self.lock();
        let now = inner.now_override.unwrap_or_else(OffsetDateTime::now_utc);
        inner.now_override = Some(now + by);
    }

    fn now_inner(inner: &Inner) -> OffsetDateTime {
        inner.now_override.unwrap_or_else(OffsetDateTime::now_utc)
    }

    /// Current store time, honoring a pinned clock.
    pub fn now(&self) -> OffsetDateTime {
        Self::now_inner(&self.lock())
    }

    /// Number of unprocessed events, due or not.
    pub fn pending_count(&self) -> usize {
        self.lock().events.iter().filter(|e| e.is_pending()).count()
    }

    /// Pending events' names with their delivery times, soonest first.
    pub fn pending_events(&self) -> Vec<(String, OffsetDateTime)> {
        let inner = self.lock();
        let mut pending: Vec<_> = inner
            .events
            .iter()
            .filter(|e| e.is_pending())
            .map(|e| (e.name.clone(), e.deliver_at))
            .collect();
        pending.sort_by_key(|(_, at)| *at);
        pending
    }
}

fn matches_query(row: &EventRow, query: &DeadLetterQuery) -> bool {
    if let Some(name) = &query.event_name {
        if row.name != *name {
            return false;
        }
    }
    if let Some(run_id) = query.run_id {
        if row.run_id != run_id {
            return false;
        }
    }
    true
}

impl Store for MemStore {
    fn now(&self) -> OffsetDateTime {
        Self::now_inner(&self.lock())
    }

    async fn enqueue(&self, events: Vec<NewEvent>) -> Result<()> {
        let mut inner = self.lock();
        let now = Self::now_inner(&inner);
        for event in events {
            if let Some(key) = &event.dedupe_key {
                // Replace any undelivered event with the same key that is
                // not mid-flight.
                inner.events.retain(|row| {
                    !(row.dedupe_key.as_deref() == Some(key)
                        && row.is_pending()
                        && !row.is_locked(now))
                });
            }
            inner.events.push(EventRow {
                id: Uuid::now_v7(),
                run_id: event.run_id.unwrap_or_else(Uuid::now_v7),
                name: event.name,
                payload: event.payload,
                deliver_at: event.deliver_at.unwrap_or(now),
                dedupe_key: event.dedupe_key,
                attempts: 0,
                last_error: None,
                locked_until: None,
                locked_by: None,
                processed_at: None,
                created_at: now,
            });
        }
        Ok(())
    }

    async fn claim_event(
        &self,
        worker_id: &str,
        lock_duration: Duration,
        max_attempts: u32,
    ) -> Result<Option<Delivery>> {
        let mut inner = self.lock();
        let now = Self::now_inner(&inner);
        let candidate = inner
            .events
            .iter_mut()
            .filter(|row| {
                row.is_pending()
                    && row.deliver_at <= now
                    && !row.is_locked(now)
                    && row.attempts < max_attempts
            })
            .min_by_key(|row| (row.deliver_at, row.created_at, row.id));
        let Some(row) = candidate else {
            return Ok(None);
        };
        row.locked_until = Some(now + lock_duration);
        row.locked_by = Some(worker_id.to_string());
        Ok(Some(Delivery {
            id: row.id,
            run_id: row.run_id,
            name: row.name.clone(),
            payload: row.payload.clone(),
            attempts: row.attempts,
            created_at: row.created_at,
        }))
    }

    async fn mark_processed(&self, event_id: Uuid) -> Result<()> {
        let mut inner = self.lock();
        let now = Self::now_inner(&inner);
        if let Some(row) = inner.events.iter_mut().find(|row| row.id == event_id) {
            row.processed_at = Some(now);
            row.locked_until = None;
            row.locked_by = None;
        }
        Ok(())
    }

    async fn record_failure(
        &self,
        event_id: Uuid,
        error: &str,
        backoff_duration: Duration,
    ) -> Result<()> {
        let mut inner = self.lock();
        let now = Self::now_inner(&inner);
        if let Some(row) = inner.events.iter_mut().find(|row| row.id == event_id) {
            row.attempts += 1;
            row.last_error = Some(error.to_string());
            row.locked_until = Some(now + backoff_duration);
            row.locked_by = None;
        }
        Ok(())
    }

    async fn record_permanent_failure(
        &self,
        event_id: Uuid,
        error: &str,
        max_attempts: u32,
    ) -> Result<()> {
        let mut inner = self.lock();
        if let Some(row) = inner.events.iter_mut().find(|row| row.id == event_id) {
            row.attempts = max_attempts;
            row.last_error = Some(error.to_string());
            row.locked_until = None;
            row.locked_by = None;
        }
        Ok(())
    }

    async fn load_ledger(&self, run_id: Uuid) -> Result<StepLedger> {
        Ok(self.lock().ledgers.get(&run_id).cloned().unwrap_or_default())
    }

    async fn record_step(&self, run_id: Uuid, step_name: &str, value: Value) -> Result<()> {
        self.lock()
            .ledgers
            .entry(run_id)
            .or_default()
            .entry(step_name.to_string())
            .or_insert(value);
        Ok(())
    }

    async fn fetch_dead_letters(
        &self,
        query: &DeadLetterQuery,
        max_attempts: u32,
    ) -> Result<Vec<DeadLetter>> {
        let inner = self.lock();
        let mut letters: Vec<_> = inner
            .events
            .iter()
            .filter(|row| {
                row.is_pending() && row.attempts >= max_attempts && matches_query(row, query)
            })
            .map(|row| DeadLetter {
                id: row.id,
                run_id: row.run_id,
                name: row.name.clone(),
                payload: row.payload.clone(),
                attempts: row.attempts,
                last_error: row.last_error.clone(),
                created_at: row.created_at,
            })
            .collect();
        letters.sort_by_key(|l| l.created_at);
        if let Some(limit) = query.limit {
            letters.truncate(limit as usize);
        }
        Ok(letters)
    }

    async fn count_dead_letters(
        &self,
        query: &DeadLetterQuery,
        max_attempts: u32,
    ) -> Result<u64> {
        let inner = self.lock();
        Ok(inner
            .events
            .iter()
            .filter(|row| {
                row.is_pending() && row.attempts >= max_attempts && matches_query(row, query)
            })
            .count() as u64)
    }

    async fn retry_dead_letter(&self, event_id: Uuid) -> Result<bool> {
        let mut inner = self.lock();
        match inner
            .events
            .iter_mut()
            .find(|row| row.id == event_id && row.is_pending())
        {
            Some(row) => {
                row.attempts = 0;
                row.locked_until = None;
                row.locked_by = None;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn cron_last_fired(&self, job_name: &str) -> Result<Option<OffsetDateTime>> {
        Ok(self.lock().cron.get(job_name).copied())
    }

    async fn set_cron_last_fired(
        &self,
        job_name: &str,
        fired_at: OffsetDateTime,
    ) -> Result<()> {
        self.lock().cron.insert(job_name.to_string(), fired_at);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    const WORKER: &str = "test-worker";
    const LOCK: Duration = Duration::from_secs(30);
    const MAX_ATTEMPTS: u32 = 5;

    fn event(name: &str) -> NewEvent {
        NewEvent::new(name, serde_json::json!({})).unwrap()
    }

    #[tokio::test]
    async fn claims_in_delivery_order() {
        let store = MemStore::new();
        let now = datetime!(2026-01-05 09:00 UTC);
        store.set_now(now);

        store
            .enqueue(vec![
                event("second").at(now + Duration::from_secs(10)),
                event("first"),
            ])
            .await
            .unwrap();
        store.advance(Duration::from_secs(60));

        let a = store.claim_event(WORKER, LOCK, MAX_ATTEMPTS).await.unwrap();
        let b = store.claim_event(WORKER, LOCK, MAX_ATTEMPTS).await.unwrap();
        assert_eq!(a.unwrap().name, "first");
        assert_eq!(b.unwrap().name, "second");
    }

    #[tokio::test]
    async fn scheduled_event_is_invisible_until_due() {
        let store = MemStore::new();
        let now = datetime!(2026-01-05 09:00 UTC);
        store.set_now(now);

        store
            .enqueue(vec![event("later").at(now + Duration::from_secs(3600))])
            .await
            .unwrap();

        assert!(store
            .claim_event(WORKER, LOCK, MAX_ATTEMPTS)
            .await
            .unwrap()
            .is_none());

        store.advance(Duration::from_secs(3600));
        assert!(store
            .claim_event(WORKER, LOCK, MAX_ATTEMPTS)
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn claimed_event_is_locked_until_expiry() {
        let store = MemStore::new();
        store.set_now(datetime!(2026-01-05 09:00 UTC));
        store.enqueue(vec![event("job")]).await.unwrap();

        let first = store.claim_event(WORKER, LOCK, MAX_ATTEMPTS).await.unwrap();
        assert!(first.is_some());
        assert!(store
            .claim_event("other", LOCK, MAX_ATTEMPTS)
            .await
            .unwrap()
            .is_none());

        // Lock expires; another worker may claim.
        store.advance(LOCK + Duration::from_secs(1));
        assert!(store
            .claim_event("other", LOCK, MAX_ATTEMPTS)
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn dedupe_key_replaces_pending_event() {
        let store = MemStore::new();
        let now = datetime!(2026-01-05 09:00 UTC);
        store.set_now(now);

        store
            .enqueue(vec![event("tick")
                .at(now + Duration::from_secs(600))
                .dedupe("send:a:1")])
            .await
            .unwrap();
        store
            .enqueue(vec![event("tick")
                .at(now + Duration::from_secs(1200))
                .dedupe("send:a:1")])
            .await
            .unwrap();

        assert_eq!(store.pending_count(), 1);
        let (_, at) = store.pending_events().pop().unwrap();
        assert_eq!(at, now + Duration::from_secs(1200));
    }

    #[tokio::test]
    async fn failure_backoff_delays_reclaim_then_dead_letters() {
        let store = MemStore::new();
        store.set_now(datetime!(2026-01-05 09:00 UTC));
        store.enqueue(vec![event("flaky")]).await.unwrap();

        for attempt in 0..MAX_ATTEMPTS {
            let delivery = store
                .claim_event(WORKER, LOCK, MAX_ATTEMPTS)
                .await
                .unwrap()
                .unwrap();
            assert_eq!(delivery.attempts, attempt);
            store
                .record_failure(delivery.id, "boom", Duration::from_secs(10))
                .await
                .unwrap();
            // Backoff makes it invisible until the delay elapses.
            assert!(store
                .claim_event(WORKER, LOCK, MAX_ATTEMPTS)
                .await
                .unwrap()
                .is_none());
            store.advance(Duration::from_secs(11));
        }

        // Exhausted: no longer claimable, visible as a dead letter.
        assert!(store
            .claim_event(WORKER, LOCK, MAX_ATTEMPTS)
            .await
            .unwrap()
            .is_none());
        let letters = store
            .fetch_dead_letters(&DeadLetterQuery::new(), MAX_ATTEMPTS)
            .await
            .unwrap();
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].last_error.as_deref(), Some("boom"));

        // Manual retry resets attempts.
        assert!(store.retry_dead_letter(letters[0].id).await.unwrap());
        assert!(store
            .claim_event(WORKER, LOCK, MAX_ATTEMPTS)
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn ledger_first_write_wins() {
        let store = MemStore::new();
        let run_id = Uuid::now_v7();

        store
            .record_step(run_id, "generate", serde_json::json!({"subject": "a"}))
            .await
            .unwrap();
        store
            .record_step(run_id, "generate", serde_json::json!({"subject": "b"}))
            .await
            .unwrap();

        let ledger = store.load_ledger(run_id).await.unwrap();
        assert_eq!(ledger["generate"], serde_json::json!({"subject": "a"}));
    }

    #[tokio::test]
    async fn cron_bookkeeping_round_trips() {
        let store = MemStore::new();
        let at = datetime!(2026-01-05 06:00 UTC);

        assert!(store.cron_last_fired("rollup").await.unwrap().is_none());
        store.set_cron_last_fired("rollup", at).await.unwrap();
        assert_eq!(store.cron_last_fired("rollup").await.unwrap(), Some(at));
    }
}
