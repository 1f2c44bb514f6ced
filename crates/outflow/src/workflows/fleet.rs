//! Fleet workflows fanned out by the cron dispatcher: rollups, bounce
//! sweeps, meeting prep, deal scoring. Each handles exactly one entity,
//! so one bad workspace retries alone.

use async_trait::async_trait;
use time::{Duration, OffsetDateTime};
use tracing::info;
use uuid::Uuid;

use crate::capability::ContentGenerator;
use crate::event::{DealJob, MeetingJob, WorkspaceJob, EV_BOUNCE_CHECK, EV_DEAL_SCORE, EV_MEETING_PREP, EV_ROLLUP_DUE};
use crate::handler::EventHandler;
use crate::ledger::{HandlerError, RunContext};
use crate::model::{DealStage, EnrollmentStatus, UsageKind, UsageRecord};
use crate::repo::{PersistenceStore, WorkspaceRollup};
use crate::store::Store;
use crate::workflows::{WF_BOUNCE_CHECK, WF_DAILY_ROLLUP, WF_DEAL_SCORE, WF_MEETING_PREP};

/// How far back the bounce sweep looks. Wider than the 4-hour cadence so
/// a missed fire cannot drop a bounce.
const BOUNCE_LOOKBACK: Duration = Duration::hours(24);

/// Computes and records daily engagement aggregates for one workspace.
pub struct DailyRollupHandler<R> {
    repo: R,
}

impl<R> DailyRollupHandler<R> {
    pub fn new(repo: R) -> Self {
        Self { repo }
    }
}

#[async_trait]
impl<S, R> EventHandler<S> for DailyRollupHandler<R>
where
    S: Store,
    R: PersistenceStore,
{
    const EVENT: &'static str = EV_ROLLUP_DUE;
    const WORKFLOW: &'static str = WF_DAILY_ROLLUP;

    type Payload = WorkspaceJob;

    async fn handle(
        &self,
        ctx: &mut RunContext<'_, S>,
        job: WorkspaceJob,
    ) -> Result<(), HandlerError> {
        let now = ctx.now();
        let rollup: WorkspaceRollup = ctx
            .run_step("rollup", || async {
                let rollup = self.repo.rollup_workspace_stats(job.workspace_id).await?;
                self.repo
                    .record_usage(UsageRecord {
                        id: Uuid::now_v7(),
                        workspace_id: Some(job.workspace_id),
                        kind: UsageKind::RollupComputed,
                        tokens_used: 0,
                        occurred_at: now,
                    })
                    .await?;
                Ok(rollup)
            })
            .await?;
        info!(
            workspace_id = %job.workspace_id,
            emails_sent = rollup.emails_sent,
            replies = rollup.replies,
            reply_rate = rollup.reply_rate,
            "daily rollup recorded"
        );
        Ok(())
    }
}

/// Sweeps recent hard bounces for one workspace and halts the affected
/// contacts' enrollments into `bounced`.
pub struct BounceCheckHandler<R> {
    repo: R,
}

impl<R> BounceCheckHandler<R> {
    pub fn new(repo: R) -> Self {
        Self { repo }
    }
}

#[async_trait]
impl<S, R> EventHandler<S> for BounceCheckHandler<R>
where
    S: Store,
    R: PersistenceStore,
{
    const EVENT: &'static str = EV_BOUNCE_CHECK;
    const WORKFLOW: &'static str = WF_BOUNCE_CHECK;

    type Payload = WorkspaceJob;

    async fn handle(
        &self,
        ctx: &mut RunContext<'_, S>,
        job: WorkspaceJob,
    ) -> Result<(), HandlerError> {
        let now = ctx.now();
        let bounces = self
            .repo
            .recent_hard_bounces(job.workspace_id, now - BOUNCE_LOOKBACK)
            .await?;

        let mut halted_total = 0u32;
        for bounce in &bounces {
            // One ledgered step per contact: a retry mid-sweep does not
            // re-halt contacts already handled.
            let halted: u32 = ctx
                .run_step(&format!("halt:{}", bounce.contact_id), || async {
                    self.repo
                        .halt_enrollments_for_contact(bounce.contact_id, EnrollmentStatus::Bounced)
                        .await
                        .map_err(HandlerError::from)
                })
                .await?;
            halted_total += halted;
        }

        info!(
            workspace_id = %job.workspace_id,
            bounces = bounces.len(),
            halted_enrollments = halted_total,
            "bounce sweep complete"
        );
        Ok(())
    }
}

/// Drafts prep notes for one upcoming meeting.
pub struct MeetingPrepHandler<R, G> {
    repo: R,
    generator: G,
}

impl<R, G> MeetingPrepHandler<R, G> {
    pub fn new(repo: R, generator: G) -> Self {
        Self { repo, generator }
    }
}

#[async_trait]
impl<S, R, G> EventHandler<S> for MeetingPrepHandler<R, G>
where
    S: Store,
    R: PersistenceStore,
    G: ContentGenerator,
{
    const EVENT: &'static str = EV_MEETING_PREP;
    const WORKFLOW: &'static str = WF_MEETING_PREP;

    type Payload = MeetingJob;

    async fn handle(
        &self,
        ctx: &mut RunContext<'_, S>,
        job: MeetingJob,
    ) -> Result<(), HandlerError> {
        let Some(meeting) = self.repo.meeting(job.meeting_id).await? else {
            return Err(HandlerError::fatal(format!(
                "meeting {} missing",
                job.meeting_id
            )));
        };
        if meeting.prep_notes.is_some() {
            return Ok(());
        }
        let contact = self
            .repo
            .contact(meeting.contact_id)
            .await?
            .ok_or_else(|| {
                HandlerError::fatal(format!("contact {} missing", meeting.contact_id))
            })?;

        let notes = ctx
            .run_step("draft-notes", || async {
                self.generator
                    .meeting_notes(&meeting, &contact)
                    .await
                    .map_err(HandlerError::transient)
            })
            .await?;

        let now = ctx.now();
        let saved: bool = ctx
            .run_step("save", || async {
                let saved = self
                    .repo
                    .save_meeting_prep(job.meeting_id, notes.clone())
                    .await?;
                if saved {
                    self.repo
                        .record_usage(UsageRecord {
                            id: Uuid::now_v7(),
                            workspace_id: Some(meeting.workspace_id),
                            kind: UsageKind::MeetingPrepared,
                            tokens_used: 0,
                            occurred_at: now,
                        })
                        .await?;
                }
                Ok(saved)
            })
            .await?;

        info!(meeting_id = %job.meeting_id, saved, "meeting prep drafted");
        Ok(())
    }
}

/// Deterministic deal score: stage base, value bonus, staleness penalty.
///
/// | Component | Contribution |
/// |-----------|--------------|
/// | Stage | lead 20, qualified 40, proposal 60, negotiation 80 |
/// | Value ≥ $5,000 | +10 |
/// | Untouched for 14+ days | −10 |
pub fn deal_score(stage: DealStage, value_cents: i64, updated_at: OffsetDateTime, now: OffsetDateTime) -> u8 {
    let base: i32 = match stage {
        DealStage::Lead => 20,
        DealStage::Qualified => 40,
        DealStage::Proposal => 60,
        DealStage::Negotiation => 80,
        DealStage::ClosedWon | DealStage::ClosedLost => 0,
    };
    let mut score = base;
    if value_cents >= 500_000 {
        score += 10;
    }
    if now - updated_at >= Duration::days(14) {
        score -= 10;
    }
    score.clamp(0, 100) as u8
}

/// Scores one open deal. Closed deals are skipped and never re-scored.
pub struct DealScoreHandler<R> {
    repo: R,
}

impl<R> DealScoreHandler<R> {
    pub fn new(repo: R) -> Self {
        Self { repo }
    }
}

#[async_trait]
impl<S, R> EventHandler<S> for DealScoreHandler<R>
where
    S: Store,
    R: PersistenceStore,
{
    const EVENT: &'static str = EV_DEAL_SCORE;
    const WORKFLOW: &'static str = WF_DEAL_SCORE;

    type Payload = DealJob;

    async fn handle(
        &self,
        ctx: &mut RunContext<'_, S>,
        job: DealJob,
    ) -> Result<(), HandlerError> {
        let Some(deal) = self.repo.deal(job.deal_id).await? else {
            return Err(HandlerError::fatal(format!("deal {} missing", job.deal_id)));
        };
        if deal.stage.is_closed() {
            return Ok(());
        }

        let now = ctx.now();
        let score = deal_score(deal.stage, deal.value_cents, deal.updated_at, now);
        ctx.run_step("score", || async {
            let updated = self.repo.set_deal_score(job.deal_id, score).await?;
            if updated {
                self.repo
                    .record_usage(UsageRecord {
                        id: Uuid::now_v7(),
                        workspace_id: Some(deal.workspace_id),
                        kind: UsageKind::DealScored,
                        tokens_used: 0,
                        occurred_at: now,
                    })
                    .await?;
            }
            Ok(updated)
        })
        .await?;

        info!(deal_id = %job.deal_id, score, stage = ?deal.stage, "deal scored");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn score_rises_with_stage() {
        let now = datetime!(2026-01-05 12:00 UTC);
        let fresh = now - Duration::days(1);

        assert_eq!(deal_score(DealStage::Lead, 100_000, fresh, now), 20);
        assert_eq!(deal_score(DealStage::Qualified, 100_000, fresh, now), 40);
        assert_eq!(deal_score(DealStage::Proposal, 100_000, fresh, now), 60);
        assert_eq!(deal_score(DealStage::Negotiation, 100_000, fresh, now), 80);
    }

    #[test]
    fn value_bonus_and_staleness_penalty() {
        let now = datetime!(2026-01-05 12:00 UTC);
        let fresh = now - Duration::days(1);
        let stale = now - Duration::days(30);

        assert_eq!(deal_score(DealStage::Proposal, 500_000, fresh, now), 70);
        assert_eq!(deal_score(DealStage::Proposal, 100_000, stale, now), 50);
        assert_eq!(deal_score(DealStage::Negotiation, 500_000, stale, now), 80);
    }

    #[test]
    fn score_is_deterministic() {
        let now = datetime!(2026-01-05 12:00 UTC);
        let touched = now - Duration::days(3);

        let a = deal_score(DealStage::Qualified, 750_000, touched, now);
        let b = deal_score(DealStage::Qualified, 750_000, touched, now);
        assert_eq!(a, b);
        assert_eq!(a, 50);
    }
}
