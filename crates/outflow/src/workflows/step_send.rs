//! Step send: gate check, dispatch, bookkeeping, schedule the next step.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::info;
use uuid::Uuid;

use crate::capability::MailSender;
use crate::event::{NewEvent, StepJob, EV_STEP_GENERATE, EV_STEP_SEND};
use crate::handler::EventHandler;
use crate::ledger::{HandlerError, RunContext};
use crate::model::{
    EnrollmentStatus, Interaction, InteractionKind, PendingEmailStatus, UsageKind, UsageRecord,
};
use crate::repo::PersistenceStore;
use crate::store::Store;
use crate::workflows::WF_STEP_SEND;

/// Outcome of the schedule-next step, recorded in the ledger.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ScheduleOutcome {
    /// `(step_number, send_at)` of the next step, or `None` when the
    /// sequence is exhausted.
    next: Option<(u32, OffsetDateTime)>,
}

/// Sends one approved step email, records the interaction, and advances
/// the enrollment to its next step.
///
/// The approval gate is re-read fresh on every attempt. An email still
/// awaiting review does not fail the run; the handler schedules a delayed
/// re-check under the step's dedupe key and returns success, so approval
/// at any later time lets the sequence continue.
pub struct StepSendHandler<R, M> {
    repo: R,
    mailer: M,
    recheck_delay: Duration,
}

impl<R, M> StepSendHandler<R, M> {
    pub fn new(repo: R, mailer: M) -> Self {
        Self {
            repo,
            mailer,
            recheck_delay: Duration::from_secs(60 * 60),
        }
    }

    /// How long to wait before re-checking an unapproved email.
    pub fn with_recheck_delay(mut self, delay: Duration) -> Self {
        self.recheck_delay = delay;
        self
    }
}

#[async_trait]
impl<S, R, M> EventHandler<S> for StepSendHandler<R, M>
where
    S: Store,
    R: PersistenceStore,
    M: MailSender,
{
    const EVENT: &'static str = EV_STEP_SEND;
    const WORKFLOW: &'static str = WF_STEP_SEND;

    type Payload = StepJob;

    async fn handle(
        &self,
        ctx: &mut RunContext<'_, S>,
        job: StepJob,
    ) -> Result<(), HandlerError> {
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
                "enrollment no longer active, skipping send"
            );
            return Ok(());
        }

        // Gate check. Skipped on replay: if this run already sent, the
        // pending email reads `Sent` and the ledger carries the proof.
        if !ctx.has_step("send") {
            let pending = self
                .repo
                .pending_email_for_step(job.enrollment_id, job.step_number)
                .await?;
            match pending.as_ref().map(|p| p.status) {
                Some(PendingEmailStatus::Approved) => {}
                None | Some(PendingEmailStatus::Pending) => {
                    // Not approved yet. Queue a re-check and succeed; the
                    // dedupe key collapses repeated re-checks into one.
                    let when = ctx.now() + self.recheck_delay;
                    info!(
                        enrollment_id = %job.enrollment_id,
                        step = job.step_number,
                        recheck_at = %when,
                        "email not yet approved, scheduling re-check"
                    );
                    ctx.send_event(
                        "recheck",
                        NewEvent::new(EV_STEP_SEND, &job)?
                            .at(when)
                            .dedupe(job.send_dedupe_key()),
                    );
                    return Ok(());
                }
                Some(PendingEmailStatus::Rejected) => {
                    info!(
                        enrollment_id = %job.enrollment_id,
                        step = job.step_number,
                        "email rejected, not sending"
                    );
                    return Ok(());
                }
                Some(PendingEmailStatus::Sent) => {
                    // Another run already sent this step.
                    return Ok(());
                }
            }

            // Daily cap: a sequence at its cap queues the send for later
            // rather than dropping it.
            let sequence = self
                .repo
                .sequence(enrollment.sequence_id)
                .await?
                .ok_or_else(|| {
                    HandlerError::fatal(format!("sequence {} missing", enrollment.sequence_id))
                })?;
            let now = ctx.now();
            let day_start = now.replace_time(time::Time::MIDNIGHT);
            let sent_today = self
                .repo
                .sent_count_since(enrollment.sequence_id, day_start)
                .await?;
            if sent_today >= sequence.settings.daily_cap {
                let when = now + self.recheck_delay;
                info!(
                    enrollment_id = %job.enrollment_id,
                    step = job.step_number,
                    sent_today,
                    daily_cap = sequence.settings.daily_cap,
                    recheck_at = %when,
                    "daily send cap reached, queuing send"
                );
                ctx.send_event(
                    "cap-recheck",
                    NewEvent::new(EV_STEP_SEND, &job)?
                        .at(when)
                        .dedupe(job.send_dedupe_key()),
                );
                return Ok(());
            }
        }

        let pending = self
            .repo
            .pending_email_for_step(job.enrollment_id, job.step_number)
            .await?
            .ok_or_else(|| {
                HandlerError::fatal(format!(
                    "pending email for enrollment {} step {} missing",
                    job.enrollment_id, job.step_number
                ))
            })?;
        let contact = self
            .repo
            .contact(enrollment.contact_id)
            .await?
            .ok_or_else(|| {
                HandlerError::fatal(format!("contact {} missing", enrollment.contact_id))
            })?;

        let receipt = ctx
            .run_step("send", || async {
                self.mailer
                    .send(&contact.email, &pending.subject, &pending.body)
                    .await
                    .map_err(HandlerError::transient)
            })
            .await?;

        let now = ctx.now();
        let _interaction_id: Uuid = ctx
            .run_step("record-sent", || async {
                let interaction = Interaction {
                    id: Uuid::now_v7(),
                    contact_id: contact.id,
                    kind: InteractionKind::OutboundEmail,
                    subject: pending.subject.clone(),
                    body: pending.body.clone(),
                    message_id: Some(receipt.message_id.clone()),
                    category: None,
                    sentiment: None,
                    suggested_reply: None,
                    occurred_at: now,
                };
                let id = interaction.id;
                self.repo.record_interaction(interaction).await?;
                self.repo
                    .set_pending_status(
                        pending.id,
                        PendingEmailStatus::Approved,
                        PendingEmailStatus::Sent,
                    )
                    .await?;
                self.repo
                    .record_usage(UsageRecord {
                        id: Uuid::now_v7(),
                        workspace_id: None,
                        kind: UsageKind::EmailSent,
                        tokens_used: 0,
                        occurred_at: now,
                    })
                    .await?;
                Ok(id)
            })
            .await?;

        let outcome = ctx
            .run_step("schedule-next", || async {
                let sequence = self
                    .repo
                    .sequence(enrollment.sequence_id)
                    .await?
                    .ok_or_else(|| {
                        HandlerError::fatal(format!(
                            "sequence {} missing",
                            enrollment.sequence_id
                        ))
                    })?;
                match sequence.next_step(job.step_number) {
                    Some(next) => {
                        let raw = now + time::Duration::days(next.delay_days as i64);
                        let send_at = sequence.settings.clamp_to_window(raw);
                        self.repo
                            .advance_enrollment(job.enrollment_id, next.step_number, send_at)
                            .await?;
                        Ok(ScheduleOutcome {
                            next: Some((next.step_number, send_at)),
                        })
                    }
                    None => Ok(ScheduleOutcome { next: None }),
                }
            })
            .await?;

        match outcome.next {
            Some((next_step, send_at)) => {
                let next_job = StepJob::new(job.enrollment_id, next_step);
                // Generate ahead of time so review can happen before the
                // send slot arrives.
                ctx.send_event("gen-next", NewEvent::new(EV_STEP_GENERATE, &next_job)?);
                ctx.sleep_until("await-next-send", send_at)?;
                ctx.send_event(
                    "emit-next-send",
                    NewEvent::new(EV_STEP_SEND, &next_job)?
                        .dedupe(next_job.send_dedupe_key()),
                );
                info!(
                    enrollment_id = %job.enrollment_id,
                    step = job.step_number,
                    next_step,
                    send_at = %send_at,
                    "step sent, next step scheduled"
                );
            }
            None => {
                ctx.run_step("complete", || async {
                    self.repo
                        .transition_enrollment(
                            job.enrollment_id,
                            EnrollmentStatus::Active,
                            EnrollmentStatus::Completed,
                        )
                        .await
                        .map_err(HandlerError::from)
                })
                .await?;
                info!(
                    enrollment_id = %job.enrollment_id,
                    step = job.step_number,
                    "final step sent, enrollment completed"
                );
            }
        }
        Ok(())
    }
}
