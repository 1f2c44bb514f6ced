#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use time::macros::datetime;
use time::OffsetDateTime;
use uuid::Uuid;

use outflow::dispatch::{standard_jobs, RepoFanOut};
use outflow::model::Company;
use outflow::workflows::{
    BounceCheckHandler, DailyRollupHandler, DealScoreHandler, MeetingPrepHandler, ReplyHandler,
    StepGenerateHandler, StepSendHandler,
};
use outflow::{Engine, EngineBuilder, MemStore, OutreachService};
use outflow_test_utils::{
    fixtures, init_test_tracing, FixedSpamChecker, MemRepo, RecordingMailSender,
    ScriptedGenerator,
};

/// Pinned start of every test's clock. A Monday morning, well inside any
/// send window.
pub const START: OffsetDateTime = datetime!(2026-01-05 09:00 UTC);

/// A fully wired engine over in-memory storage with a pinned clock.
pub struct Harness {
    pub store: MemStore,
    pub repo: MemRepo,
    pub generator: ScriptedGenerator,
    pub spam: FixedSpamChecker,
    pub mailer: RecordingMailSender,
    pub engine: Engine<MemStore>,
    pub service: OutreachService<MemRepo, MemStore>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_fakes(
            ScriptedGenerator::new(),
            FixedSpamChecker::new(0.0),
            RecordingMailSender::new(),
        )
    }

    pub fn with_fakes(
        generator: ScriptedGenerator,
        spam: FixedSpamChecker,
        mailer: RecordingMailSender,
    ) -> Self {
        init_test_tracing();
        let store = MemStore::new();
        store.set_now(START);
        let repo = MemRepo::new();

        let engine = EngineBuilder::new(store.clone())
            .subscribe(StepGenerateHandler::new(
                repo.clone(),
                generator.clone(),
                spam.clone(),
            ))
            .subscribe(StepSendHandler::new(repo.clone(), mailer.clone()))
            .subscribe(ReplyHandler::new(repo.clone(), generator.clone()))
            .subscribe(DailyRollupHandler::new(repo.clone()))
            .subscribe(BounceCheckHandler::new(repo.clone()))
            .subscribe(MeetingPrepHandler::new(repo.clone(), generator.clone()))
            .subscribe(DealScoreHandler::new(repo.clone()))
            .dispatcher(
                Arc::new(RepoFanOut::new(repo.clone())),
                standard_jobs().expect("standard cron jobs parse"),
            )
            .build()
            .expect("engine builds");
        let service = OutreachService::new(repo.clone(), engine.bus());

        Self {
            store,
            repo,
            generator,
            spam,
            mailer,
            engine,
            service,
        }
    }

    /// Seed a sequence plus a contact with company enrichment, so drafts
    /// score high enough to auto-approve.
    pub fn seed_enrollable(&self, steps: u32, delay_days: u32) -> (Uuid, Uuid) {
        let sequence_id = Uuid::now_v7();
        let contact_id = Uuid::now_v7();
        let company_id = Uuid::now_v7();
        self.repo
            .put_sequence(fixtures::sequence(sequence_id, steps, delay_days));
        self.repo.put_company(Company {
            id: company_id,
            name: "Acme Robotics".to_string(),
            industry: Some("Manufacturing".to_string()),
            description: None,
        });
        self.repo
            .put_contact(fixtures::contact(contact_id, Some(company_id)));
        (sequence_id, contact_id)
    }

    /// Seed a sequence plus a contact with no company data. Drafts score
    /// below the auto-approve threshold and queue for manual review.
    pub fn seed_enrollable_without_company(&self, steps: u32, delay_days: u32) -> (Uuid, Uuid) {
        let sequence_id = Uuid::now_v7();
        let contact_id = Uuid::now_v7();
        self.repo
            .put_sequence(fixtures::sequence(sequence_id, steps, delay_days));
        self.repo.put_contact(fixtures::contact(contact_id, None));
        (sequence_id, contact_id)
    }

    pub async fn drain(&self) -> u32 {
        self.engine.drain().await.expect("drain")
    }

    /// Drain repeatedly, advancing the pinned clock by `step` between
    /// rounds so retry backoff and scheduled deliveries come due. Stops
    /// early once nothing is pending.
    pub async fn drain_advancing(&self, rounds: u32, step: Duration) -> u32 {
        let mut total = self.drain().await;
        for _ in 0..rounds {
            if self.store.pending_count() == 0 {
                break;
            }
            self.store.advance(step);
            total += self.drain().await;
        }
        total
    }
}
