//! Step generation: gather context, draft, spam-check, score, gate.

use async_trait::async_trait;
use tracing::info;
use uuid::Uuid;

use crate::capability::{Cache, ContentGenerator, EmailContext, NoopCache, SpamChecker};
use crate::event::{NewEvent, StepJob, EV_STEP_GENERATE, EV_STEP_SEND};
use crate::handler::EventHandler;
use crate::ledger::{HandlerError, RunContext};
use crate::model::{
    Company, PendingEmail, PendingEmailStatus, UsageKind, UsageRecord,
};
use crate::repo::PersistenceStore;
use crate::scoring::{confidence_score, ApprovalPolicy};
use crate::store::Store;
use crate::workflows::WF_STEP_GENERATE;

const COMPANY_CACHE_TTL_SECONDS: u64 = 24 * 60 * 60;
const PRIOR_SUBJECT_LOOKBACK: u32 = 10;

/// Generates one step's email for an enrollment and parks it at the
/// approval gate. Auto-approved drafts immediately trigger the send
/// workflow; everything else waits for manual review.
pub struct StepGenerateHandler<R, G, K, C = NoopCache> {
    repo: R,
    generator: G,
    spam: K,
    cache: C,
    policy: ApprovalPolicy,
}

impl<R, G, K> StepGenerateHandler<R, G, K, NoopCache> {
    pub fn new(repo: R, generator: G, spam: K) -> Self {
        Self {
            repo,
            generator,
            spam,
            cache: NoopCache,
            policy: ApprovalPolicy::default(),
        }
    }
}

impl<R, G, K, C> StepGenerateHandler<R, G, K, C> {
    pub fn with_cache<C2>(self, cache: C2) -> StepGenerateHandler<R, G, K, C2> {
        StepGenerateHandler {
            repo: self.repo,
            generator: self.generator,
            spam: self.spam,
            cache,
            policy: self.policy,
        }
    }

    pub fn with_policy(mut self, policy: ApprovalPolicy) -> Self {
        self.policy = policy;
        self
    }
}

impl<R, G, K, C> StepGenerateHandler<R, G, K, C>
where
    R: PersistenceStore,
    C: Cache,
{
    /// Company context, via the enrichment cache when warm.
    async fn company_context(&self, company_id: Uuid) -> crate::Result<Option<Company>> {
        let key = format!("company:{company_id}");
        if let Some(cached) = self.cache.get(&key).await {
            if let Ok(company) = serde_json::from_value(cached) {
                return Ok(Some(company));
            }
        }
        let company = self.repo.company(company_id).await?;
        if let Some(company) = &company {
            self.cache
                .set(&key, serde_json::to_value(company)?, COMPANY_CACHE_TTL_SECONDS)
                .await;
        }
        Ok(company)
    }

    async fn gather(&self, job: &StepJob) -> Result<EmailContext, HandlerError> {
        let enrollment = self
            .repo
            .enrollment(job.enrollment_id)
            .await?
            .ok_or_else(|| HandlerError::fatal(format!("enrollment {} missing", job.enrollment_id)))?;
        let sequence = self
            .repo
            .sequence(enrollment.sequence_id)
            .await?
            .ok_or_else(|| {
                HandlerError::fatal(format!("sequence {} missing", enrollment.sequence_id))
            })?;
        let step = sequence
            .step(job.step_number)
            .ok_or_else(|| {
                HandlerError::fatal(format!(
                    "sequence {} has no step {}",
                    sequence.id, job.step_number
                ))
            })?
            .clone();
        let contact = self
            .repo
            .contact(enrollment.contact_id)
            .await?
            .ok_or_else(|| {
                HandlerError::fatal(format!("contact {} missing", enrollment.contact_id))
            })?;
        let company = match contact.company_id {
            Some(company_id) => self.company_context(company_id).await?,
            None => None,
        };
        let prior_subjects = self
            .repo
            .prior_outbound_subjects(contact.id, PRIOR_SUBJECT_LOOKBACK)
            .await?;

        Ok(EmailContext {
            contact,
            company,
            sequence_name: sequence.name,
            step,
            prior_subjects,
            ab_variant: enrollment.ab_variant,
        })
    }
}

#[async_trait]
impl<S, R, G, K, C> EventHandler<S> for StepGenerateHandler<R, G, K, C>
where
    S: Store,
    R: PersistenceStore,
    G: ContentGenerator,
    K: SpamChecker,
    C: Cache,
{
    const EVENT: &'static str = EV_STEP_GENERATE;
    const WORKFLOW: &'static str = WF_STEP_GENERATE;

    type Payload = StepJob;

    async fn handle(
        &self,
        ctx: &mut RunContext<'_, S>,
        job: StepJob,
    ) -> Result<(), HandlerError> {
        // Fresh guard: an enrollment halted since this event was published
        // must not generate anything.
        let Some(enrollment) = self.repo.enrollment(job.enrollment_id).await? else {
            return Err(HandlerError::fatal(format!(
                "enrollment {} missing",
                job.enrollment_id
            )));
        };
        if !enrollment.is_active() {
            info!(
                enrollment_id = %job.enrollment_id,
                status = %enrollment.status,
                "enrollment no longer active, skipping generation"
            );
            return Ok(());
        }

        let context = ctx
            .run_step("gather-context", || self.gather(&job))
            .await?;
        let has_company = context.company.is_some();

        let draft = ctx
            .run_step("generate", || async {
                self.generator
                    .generate_email(&context)
                    .await
                    .map_err(HandlerError::transient)
            })
            .await?;

        let verdict = ctx
            .run_step("spam-check", || async {
                self.spam
                    .check(&draft.subject, &draft.body)
                    .await
                    .map_err(HandlerError::transient)
            })
            .await?;

        let confidence = confidence_score(verdict.score, has_company, job.step_number);
        let auto_approved = self.policy.auto_approves(confidence, verdict.score);

        let now = ctx.now();
        let _email_id: Uuid = ctx
            .run_step("persist-pending", || async {
                let email = PendingEmail {
                    id: Uuid::now_v7(),
                    enrollment_id: job.enrollment_id,
                    step_number: job.step_number,
                    subject: draft.subject.clone(),
                    body: draft.body.clone(),
                    ai_confidence: confidence,
                    spam_score: verdict.score,
                    status: if auto_approved {
                        PendingEmailStatus::Approved
                    } else {
                        PendingEmailStatus::Pending
                    },
                    created_at: now,
                };
                let id = email.id;
                self.repo.upsert_pending_email(email).await?;
                self.repo
                    .record_usage(UsageRecord {
                        id: Uuid::now_v7(),
                        workspace_id: None,
                        kind: UsageKind::EmailGenerated,
                        tokens_used: draft.tokens_used,
                        occurred_at: now,
                    })
                    .await?;
                Ok(id)
            })
            .await?;

        info!(
            enrollment_id = %job.enrollment_id,
            step = job.step_number,
            confidence,
            spam_score = verdict.score,
            auto_approved,
            "step email generated"
        );

        if auto_approved {
            // Trigger the send at the enrollment's scheduled slot, not
            // now: steps are generated ahead of their send time.
            let send_at = enrollment.next_send_at.unwrap_or(now).max(now);
            let key = job.send_dedupe_key();
            ctx.send_event(
                "emit-send",
                NewEvent::new(EV_STEP_SEND, &job)?.at(send_at).dedupe(key),
            );
        }
        Ok(())
    }
}
