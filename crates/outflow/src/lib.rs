//! Durable outreach orchestration: an event bus with at-least-once
//! delivery, a step ledger that makes multi-step workflows replay-safe,
//! and the sales-sequence workflows built on top of them.
//!
//! # Architecture
//!
//! ```text
//! OutreachService ──publish──▶ Store (events) ◀──claim── DeliveryWorker
//!                                                             │
//! CronWorker ──fan out──▶ Store (events)                 RunContext
//!                                                       (step ledger)
//!                                                             │
//!                                              StepGenerate / StepSend /
//!                                              Reply / fleet handlers
//! ```
//!
//! Every workflow is an [`EventHandler`] subscribed to one event name.
//! Handlers split their work into ledgered steps via
//! [`RunContext::run_step`]: a step's side effect executes at most once
//! per run, no matter how many times delivery retries. Long waits go
//! through [`RunContext::sleep_until`], which parks the run and resumes
//! it later with the ledger intact.
//!
//! Domain state lives behind the [`PersistenceStore`] trait, implemented
//! by the embedding application. All enrollment status changes are
//! conditional updates, so concurrent workflows race safely.
//!
//! # Example
//!
//! ```ignore
//! let store = MemStore::new();
//! let engine = EngineBuilder::new(store.clone())
//!     .subscribe(StepGenerateHandler::new(repo.clone(), generator, spam))
//!     .subscribe(StepSendHandler::new(repo.clone(), mailer))
//!     .subscribe(ReplyHandler::new(repo.clone(), classifier))
//!     .dispatcher(Arc::new(RepoFanOut::new(repo.clone())), standard_jobs()?)
//!     .build()?;
//!
//! let service = OutreachService::new(repo, engine.bus());
//! service.enroll_contact(sequence_id, contact_id).await?;
//!
//! let (tx, rx) = tokio::sync::watch::channel(false);
//! engine.run(rx).await;
//! ```

pub mod bus;
pub mod capability;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod event;
pub mod governor;
pub mod handler;
pub mod ledger;
pub mod model;
pub mod repo;
pub mod runtime;
pub mod scoring;
pub mod service;
pub mod store;
pub mod workflows;

pub use bus::EventBus;
pub use engine::{Engine, EngineBuilder};
pub use error::{Error, Result};
pub use event::NewEvent;
pub use governor::{Governor, Throttle, WorkflowLimits};
pub use handler::EventHandler;
pub use ledger::{HandlerError, RunContext};
pub use repo::PersistenceStore;
pub use runtime::{RetryPolicy, RuntimeConfig};
pub use scoring::ApprovalPolicy;
pub use service::OutreachService;
pub use store::{DeadLetterQuery, MemStore, Store};
#[cfg(feature = "postgres")]
pub use store::PgStore;
