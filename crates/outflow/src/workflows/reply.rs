//! Reply processing: classify, annotate, halt the sequence.

use async_trait::async_trait;
use tracing::info;
use uuid::Uuid;

use crate::capability::ContentGenerator;
use crate::event::{ReplyJob, EV_REPLY_RECEIVED};
use crate::handler::EventHandler;
use crate::ledger::{HandlerError, RunContext};
use crate::model::{
    disposition, EnrollmentStatus, InteractionKind, ReplyCategory, UsageKind, UsageRecord,
};
use crate::repo::PersistenceStore;
use crate::store::Store;
use crate::workflows::WF_REPLY;

/// Classifies an inbound reply into the closed category set, annotates the
/// interaction, and halts the contact's active enrollments.
///
/// Out-of-office is the one category that leaves the sequence running; an
/// unsubscribe halts into `unsubscribed`, every other halting category
/// into `replied`.
pub struct ReplyHandler<R, G> {
    repo: R,
    generator: G,
}

impl<R, G> ReplyHandler<R, G> {
    pub fn new(repo: R, generator: G) -> Self {
        Self { repo, generator }
    }
}

fn halt_status(category: ReplyCategory) -> EnrollmentStatus {
    match category {
        ReplyCategory::Unsubscribe => EnrollmentStatus::Unsubscribed,
        _ => EnrollmentStatus::Replied,
    }
}

#[async_trait]
impl<S, R, G> EventHandler<S> for ReplyHandler<R, G>
where
    S: Store,
    R: PersistenceStore,
    G: ContentGenerator,
{
    const EVENT: &'static str = EV_REPLY_RECEIVED;
    const WORKFLOW: &'static str = WF_REPLY;

    type Payload = ReplyJob;

    async fn handle(
        &self,
        ctx: &mut RunContext<'_, S>,
        job: ReplyJob,
    ) -> Result<(), HandlerError> {
        let interaction = self
            .repo
            .interaction(job.interaction_id)
            .await?
            .ok_or_else(|| {
                HandlerError::fatal(format!("interaction {} missing", job.interaction_id))
            })?;
        if interaction.kind != InteractionKind::InboundEmail {
            return Err(HandlerError::fatal(format!(
                "interaction {} is not an inbound email",
                job.interaction_id
            )));
        }

        let classification = ctx
            .run_step("classify", || async {
                self.generator
                    .classify_reply(&interaction.body)
                    .await
                    .map_err(HandlerError::transient)
            })
            .await?;
        let category = classification.category;
        let (sentiment, suggested) = disposition(category);

        let now = ctx.now();
        ctx.run_step("annotate", || async {
            self.repo
                .annotate_reply(
                    job.interaction_id,
                    category,
                    sentiment,
                    suggested.map(str::to_string),
                )
                .await?;
            self.repo
                .record_usage(UsageRecord {
                    id: Uuid::now_v7(),
                    workspace_id: None,
                    kind: UsageKind::ReplyClassified,
                    tokens_used: 0,
                    occurred_at: now,
                })
                .await?;
            Ok(())
        })
        .await?;

        let halted: u32 = if category.halts_sequence() {
            ctx.run_step("halt-sequence", || async {
                self.repo
                    .halt_enrollments_for_contact(interaction.contact_id, halt_status(category))
                    .await
                    .map_err(HandlerError::from)
            })
            .await?
        } else {
            0
        };

        info!(
            interaction_id = %job.interaction_id,
            contact_id = %interaction.contact_id,
            category = ?category,
            confidence = classification.confidence,
            halted_enrollments = halted,
            "reply processed"
        );
        Ok(())
    }
}
