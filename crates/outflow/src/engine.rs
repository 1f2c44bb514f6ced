//! Engine assembly: subscriptions, governance, dispatcher, worker fleet.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{info, warn};
use uuid::Uuid;

use crate::bus::EventBus;
use crate::dispatch::{CronJob, FanOut};
use crate::error::{Error, Result};
use crate::governor::{Governor, WorkflowLimits};
use crate::handler::{ErasedHandler, EventHandler, Subscription};
use crate::runtime::{CronWorker, DeliveryWorker, RuntimeConfig};
use crate::store::{DeadLetter, DeadLetterQuery, Store};

/// Builder for [`Engine`].
///
/// # Example
///
/// ```ignore
/// let engine = EngineBuilder::new(store)
///     .subscribe(StepGenerateHandler::new(repo.clone(), generator, spam))
///     .subscribe(StepSendHandler::new(repo.clone(), mailer))
///     .limit(WF_STEP_SEND, WorkflowLimits::throttled(100, Duration::from_secs(60)))
///     .dispatcher(Arc::new(RepoFanOut::new(repo)), standard_jobs()?)
///     .build()?;
/// ```
pub struct EngineBuilder<S: Store> {
    store: S,
    subscriptions: Vec<Arc<dyn ErasedHandler<S>>>,
    limits: HashMap<String, WorkflowLimits>,
    fan_out: Option<Arc<dyn FanOut>>,
    jobs: Vec<CronJob>,
    config: RuntimeConfig,
}

impl<S: Store> EngineBuilder<S> {
    pub fn new(store: S) -> Self {
        Self {
            store,
            subscriptions: Vec::new(),
            limits: HashMap::new(),
            fan_out: None,
            jobs: Vec::new(),
            config: RuntimeConfig::default(),
        }
    }

    /// Subscribe a handler to its event.
    ///
    /// Duplicate subscriptions for the same event are rejected at
    /// [`build`](Self::build) time.
    pub fn subscribe<H: EventHandler<S>>(mut self, handler: H) -> Self {
        self.subscriptions.push(Arc::new(Subscription(handler)));
        self
    }

    /// Apply rate/concurrency limits to a workflow type.
    pub fn limit(mut self, workflow: impl Into<String>, limits: WorkflowLimits) -> Self {
        self.limits.insert(workflow.into(), limits);
        self
    }

    /// Attach the cron dispatcher.
    pub fn dispatcher(mut self, fan_out: Arc<dyn FanOut>, jobs: Vec<CronJob>) -> Self {
        self.fan_out = Some(fan_out);
        self.jobs = jobs;
        self
    }

    pub fn config(mut self, config: RuntimeConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> Result<Engine<S>> {
        let mut handlers: HashMap<&'static str, Arc<dyn ErasedHandler<S>>> = HashMap::new();
        for subscription in self.subscriptions {
            let event = subscription.event_name();
            if handlers.insert(event, subscription).is_some() {
                return Err(Error::DuplicateSubscription(event.to_string()));
            }
        }

        let worker_id = self
            .config
            .worker_id
            .clone()
            .unwrap_or_else(|| format!("worker-{}", Uuid::new_v4()));

        Ok(Engine {
            inner: Arc::new(EngineInner {
                store: self.store,
                handlers,
                governor: Governor::new(self.limits),
                fan_out: self.fan_out,
                jobs: self.jobs,
                config: self.config,
                worker_id,
            }),
        })
    }
}

struct EngineInner<S: Store> {
    store: S,
    handlers: HashMap<&'static str, Arc<dyn ErasedHandler<S>>>,
    governor: Governor,
    fan_out: Option<Arc<dyn FanOut>>,
    jobs: Vec<CronJob>,
    config: RuntimeConfig,
    worker_id: String,
}

/// The assembled engine. Cheap to clone; all clones share the same
/// subscriptions, governor, and store handle.
pub struct Engine<S: Store> {
    inner: Arc<EngineInner<S>>,
}

impl<S: Store> Clone for Engine<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S: Store> Engine<S> {
    /// Publishing handle onto the engine's bus.
    pub fn bus(&self) -> EventBus<S> {
        EventBus::new(self.inner.store.clone())
    }

    pub fn store(&self) -> &S {
        &self.inner.store
    }

    pub(crate) fn config(&self) -> &RuntimeConfig {
        &self.inner.config
    }

    /// Run the worker fleet until `shutdown` signals `true`.
    ///
    /// Spawns `delivery_workers` event pollers plus a cron worker when a
    /// dispatcher is attached. On shutdown, in-flight runs get
    /// `shutdown_timeout` to finish before the workers are aborted.
    pub async fn run(&self, shutdown: watch::Receiver<bool>) {
        let mut tasks = JoinSet::new();

        for n in 0..self.inner.config.delivery_workers.max(1) {
            let worker = DeliveryWorker::new(
                self.clone(),
                format!("{}-{n}", self.inner.worker_id),
            );
            tasks.spawn(worker.run(shutdown.clone()));
        }
        if self.inner.fan_out.is_some() {
            tasks.spawn(CronWorker::new(self.clone()).run(shutdown.clone()));
        }

        info!(
            worker_id = %self.inner.worker_id,
            delivery_workers = self.inner.config.delivery_workers.max(1),
            cron = self.inner.fan_out.is_some(),
            "engine started"
        );

        let mut shutdown_rx = shutdown;
        loop {
            tokio::select! {
                joined = tasks.join_next() => {
                    if joined.is_none() {
                        break;
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        let drain = async {
                            while tasks.join_next().await.is_some() {}
                        };
                        if tokio::time::timeout(self.inner.config.shutdown_timeout, drain)
                            .await
                            .is_err()
                        {
                            warn!("shutdown timeout elapsed, aborting workers");
                            tasks.abort_all();
                        }
                        break;
                    }
                }
            }
        }
        info!("engine stopped");
    }

    /// Claim and process a single due event, if any.
    ///
    /// This is the same code path the delivery workers run; exposed so
    /// embedders and tests can drive the engine deterministically.
    pub async fn process_one(&self) -> Result<bool> {
        self.process_one_as(&self.inner.worker_id).await
    }

    pub(crate) async fn process_one_as(&self, worker_id: &str) -> Result<bool> {
        crate::runtime::process_one(
            &self.inner.store,
            &self.inner.handlers,
            &self.inner.governor,
            &self.inner.config,
            worker_id,
        )
        .await
    }

    /// Process due events until the queue is quiet. Returns how many were
    /// processed. Events scheduled for the future stay queued.
    pub async fn drain(&self) -> Result<u32> {
        let mut processed = 0;
        while self.process_one().await? {
            processed += 1;
        }
        Ok(processed)
    }

    /// Fire every cron job whose next occurrence has come due, fanning
    /// out its events onto the bus. Returns the number of events
    /// published.
    pub async fn tick_cron(&self) -> Result<u32> {
        let Some(fan_out) = &self.inner.fan_out else {
            return Ok(0);
        };
        let store = &self.inner.store;
        let mut published = 0u32;

        for job in &self.inner.jobs {
            let now = store.now();
            match store.cron_last_fired(job.name).await? {
                None => {
                    // First sighting: start the schedule from now rather
                    // than replaying past occurrences.
                    store.set_cron_last_fired(job.name, now).await?;
                }
                Some(last) => {
                    let due = job.next_after(last).is_some_and(|next| next <= now);
                    if due {
                        let events = fan_out.fan_out(job.name, now).await?;
                        let count = events.len();
                        if count > 0 {
                            store.enqueue(events).await?;
                        }
                        store.set_cron_last_fired(job.name, now).await?;
                        info!(job = job.name, events = count, "cron job fired");
                        published += count as u32;
                    }
                }
            }
        }
        Ok(published)
    }

    /// Fetch dead-lettered events matching the query.
    pub async fn dead_letters(&self, query: &DeadLetterQuery) -> Result<Vec<DeadLetter>> {
        self.inner
            .store
            .fetch_dead_letters(query, self.inner.config.retry_policy.max_attempts)
            .await
    }

    /// Count dead-lettered events matching the query.
    pub async fn dead_letter_count(&self, query: &DeadLetterQuery) -> Result<u64> {
        self.inner
            .store
            .count_dead_letters(query, self.inner.config.retry_policy.max_attempts)
            .await
    }

    /// Requeue a dead-lettered event. Its run's step ledger is preserved,
    /// so already-completed steps are not re-executed.
    pub async fn retry_dead_letter(&self, event_id: Uuid) -> Result<bool> {
        self.inner.store.retry_dead_letter(event_id).await
    }
}
