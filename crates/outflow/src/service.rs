//! Application-facing surface: enrollment, review actions, reply intake.
//!
//! The service performs the synchronous, user-triggered writes and
//! publishes the events that hand the rest of the work to the engine's
//! workflows.

use time::OffsetDateTime;
use tracing::info;
use uuid::Uuid;

use crate::bus::EventBus;
use crate::error::{Error, Result};
use crate::event::{ReplyJob, StepJob, EV_REPLY_RECEIVED, EV_STEP_GENERATE, EV_STEP_SEND};
use crate::event::NewEvent;
use crate::model::{
    pick_variant, Enrollment, EnrollmentStatus, Interaction, InteractionKind, PendingEmail,
    PendingEmailStatus, SequenceStatus,
};
use crate::repo::PersistenceStore;
use crate::store::Store;

/// Entry points for enrolling contacts, reviewing drafts, and recording
/// inbound replies.
#[derive(Clone)]
pub struct OutreachService<R, S> {
    repo: R,
    bus: EventBus<S>,
}

impl<R, S> OutreachService<R, S>
where
    R: PersistenceStore,
    S: Store,
{
    pub fn new(repo: R, bus: EventBus<S>) -> Self {
        Self { repo, bus }
    }

    /// Enroll a contact into a sequence and kick off step 1 generation.
    ///
    /// Rejected when the sequence is not active, fails validation, or the
    /// contact already has a non-terminal enrollment in it.
    pub async fn enroll_contact(&self, sequence_id: Uuid, contact_id: Uuid) -> Result<Enrollment> {
        let sequence = self
            .repo
            .sequence(sequence_id)
            .await?
            .ok_or_else(|| Error::not_found("sequence", sequence_id))?;
        if sequence.status != SequenceStatus::Active {
            return Err(Error::conflict(
                "sequence",
                sequence_id,
                "sequence is not active",
            ));
        }
        sequence.validate()?;

        self.repo
            .contact(contact_id)
            .await?
            .ok_or_else(|| Error::not_found("contact", contact_id))?;

        if self
            .repo
            .open_enrollment(contact_id, sequence_id)
            .await?
            .is_some()
        {
            return Err(Error::AlreadyEnrolled {
                contact_id,
                sequence_id,
            });
        }

        let now = self.bus.store().now();
        let enrollment = Enrollment {
            id: Uuid::now_v7(),
            sequence_id,
            contact_id,
            status: EnrollmentStatus::Active,
            current_step: 1,
            next_send_at: Some(now),
            ab_variant: pick_variant(contact_id, &sequence.variant_tags()),
            created_at: now,
        };
        self.repo.insert_enrollment(enrollment.clone()).await?;

        self.bus
            .publish(EV_STEP_GENERATE, StepJob::new(enrollment.id, 1))
            .await?;

        info!(
            enrollment_id = %enrollment.id,
            sequence_id = %sequence_id,
            contact_id = %contact_id,
            variant = ?enrollment.ab_variant,
            "contact enrolled"
        );
        Ok(enrollment)
    }

    /// Approve a pending email and trigger its send.
    ///
    /// The trigger respects the enrollment's scheduled slot: a draft
    /// approved ahead of time sends when the slot arrives, not
    /// immediately. Fails with a conflict if the email is no longer
    /// awaiting review.
    pub async fn approve_pending_email(&self, email_id: Uuid) -> Result<()> {
        let pending = self
            .repo
            .pending_email(email_id)
            .await?
            .ok_or_else(|| Error::not_found("pending email", email_id))?;
        let updated = self
            .repo
            .set_pending_status(
                email_id,
                PendingEmailStatus::Pending,
                PendingEmailStatus::Approved,
            )
            .await?;
        if !updated {
            return Err(Error::conflict(
                "pending email",
                email_id,
                format!("expected pending, found {:?}", pending.status),
            ));
        }

        let now = self.bus.store().now();
        let send_at = self
            .repo
            .enrollment(pending.enrollment_id)
            .await?
            .and_then(|e| e.next_send_at)
            .map_or(now, |at| at.max(now));
        let job = StepJob::new(pending.enrollment_id, pending.step_number);
        let key = job.send_dedupe_key();
        self.bus
            .publish_all(vec![NewEvent::new(EV_STEP_SEND, &job)?.at(send_at).dedupe(key)])
            .await?;

        info!(email_id = %email_id, send_at = %send_at, "pending email approved");
        Ok(())
    }

    /// Reject a pending email. The enrollment stays active; the step will
    /// not send unless a new draft is generated and approved.
    pub async fn reject_pending_email(&self, email_id: Uuid) -> Result<()> {
        let updated = self
            .repo
            .set_pending_status(
                email_id,
                PendingEmailStatus::Pending,
                PendingEmailStatus::Rejected,
            )
            .await?;
        if !updated {
            return Err(Error::conflict(
                "pending email",
                email_id,
                "not awaiting review",
            ));
        }
        info!(email_id = %email_id, "pending email rejected");
        Ok(())
    }

    /// Record an inbound reply and hand it to the reply workflow.
    pub async fn record_reply(
        &self,
        contact_id: Uuid,
        subject: impl Into<String>,
        body: impl Into<String>,
        occurred_at: OffsetDateTime,
    ) -> Result<Uuid> {
        let interaction = Interaction {
            id: Uuid::now_v7(),
            contact_id,
            kind: InteractionKind::InboundEmail,
            subject: subject.into(),
            body: body.into(),
            message_id: None,
            category: None,
            sentiment: None,
            suggested_reply: None,
            occurred_at,
        };
        let interaction_id = interaction.id;
        self.repo.record_interaction(interaction).await?;
        self.bus
            .publish(EV_REPLY_RECEIVED, ReplyJob { interaction_id })
            .await?;
        Ok(interaction_id)
    }

    /// Pause an active enrollment. Fails with a conflict if the
    /// enrollment already left `active`.
    pub async fn pause_enrollment(&self, enrollment_id: Uuid) -> Result<()> {
        let updated = self
            .repo
            .transition_enrollment(
                enrollment_id,
                EnrollmentStatus::Active,
                EnrollmentStatus::Paused,
            )
            .await?;
        if !updated {
            return Err(Error::conflict("enrollment", enrollment_id, "not active"));
        }
        Ok(())
    }

    /// Halt all of a contact's active enrollments as unsubscribed.
    /// Returns how many enrollments were halted.
    pub async fn unsubscribe_contact(&self, contact_id: Uuid) -> Result<u32> {
        let halted = self
            .repo
            .halt_enrollments_for_contact(contact_id, EnrollmentStatus::Unsubscribed)
            .await?;
        info!(contact_id = %contact_id, halted, "contact unsubscribed");
        Ok(halted)
    }

    pub async fn enrollment(&self, id: Uuid) -> Result<Option<Enrollment>> {
        self.repo.enrollment(id).await
    }

    pub async fn pending_email(&self, id: Uuid) -> Result<Option<PendingEmail>> {
        self.repo.pending_email(id).await
    }

    /// Drafts awaiting manual review, oldest first.
    pub async fn review_queue(&self, limit: u32) -> Result<Vec<PendingEmail>> {
        self.repo.pending_review_queue(limit).await
    }
}
