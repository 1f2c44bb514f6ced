//! Repository contract for the domain persistence store.
//!
//! The engine never owns domain tables; it drives a repository implemented
//! by the surrounding application (Supabase/Postgres in production, an
//! in-memory fake in tests). All state transitions go through conditional
//! updates scoped by id and expected current state — the methods return
//! `false` when the expectation no longer holds, and callers treat a lost
//! race as a normal control-flow branch, never an error.

use std::future::Future;

use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::Result;
use crate::model::{
    BounceRecord, Company, Contact, Deal, Enrollment, EnrollmentStatus, Interaction, Meeting,
    PendingEmail, PendingEmailStatus, ReplyCategory, Sentiment, Sequence, UsageRecord, Workspace,
};

/// Aggregates produced by the daily rollup for one workspace.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct WorkspaceRollup {
    pub workspace_id: Uuid,
    pub emails_sent: u64,
    pub replies: u64,
    pub reply_rate: f64,
}

/// Repository-style CRUD over the domain entities, with conditional updates.
pub trait PersistenceStore: Send + Sync + Clone + 'static {
    // -- enrollments ---------------------------------------------------------

    fn insert_enrollment(
        &self,
        enrollment: Enrollment,
    ) -> impl Future<Output = Result<()>> + Send;

    fn enrollment(
        &self,
        id: Uuid,
    ) -> impl Future<Output = Result<Option<Enrollment>>> + Send;

    /// The contact's non-terminal enrollment in the sequence, if one exists.
    /// Backs the one-open-enrollment-per-(contact, sequence) invariant.
    fn open_enrollment(
        &self,
        contact_id: Uuid,
        sequence_id: Uuid,
    ) -> impl Future<Output = Result<Option<Enrollment>>> + Send;

    /// Conditional status transition: applied only when the current status
    /// matches `expected`. Returns whether the update landed. A terminal
    /// transition clears `next_send_at`.
    fn transition_enrollment(
        &self,
        id: Uuid,
        expected: EnrollmentStatus,
        to: EnrollmentStatus,
    ) -> impl Future<Output = Result<bool>> + Send;

    /// Advance an active enrollment to `next_step` with a new `next_send_at`.
    /// Applied only while active and only if `next_step` is strictly greater
    /// than the current step (monotonic advancement).
    fn advance_enrollment(
        &self,
        id: Uuid,
        next_step: u32,
        next_send_at: OffsetDateTime,
    ) -> impl Future<Output = Result<bool>> + Send;

    /// Transition every active enrollment of the contact to `to`. Returns
    /// the number of enrollments that transitioned.
    fn halt_enrollments_for_contact(
        &self,
        contact_id: Uuid,
        to: EnrollmentStatus,
    ) -> impl Future<Output = Result<u32>> + Send;

    /// Active enrollments whose `next_send_at` is at or before `now`.
    fn due_enrollments(
        &self,
        now: OffsetDateTime,
        limit: u32,
    ) -> impl Future<Output = Result<Vec<Enrollment>>> + Send;

    // -- sequences / contacts ------------------------------------------------

    fn sequence(&self, id: Uuid) -> impl Future<Output = Result<Option<Sequence>>> + Send;

    fn contact(&self, id: Uuid) -> impl Future<Output = Result<Option<Contact>>> + Send;

    fn company(&self, id: Uuid) -> impl Future<Output = Result<Option<Company>>> + Send;

    // -- pending emails ------------------------------------------------------

    /// Insert or replace the pending email for its (enrollment, step) slot.
    /// At most one row exists per slot.
    fn upsert_pending_email(
        &self,
        email: PendingEmail,
    ) -> impl Future<Output = Result<()>> + Send;

    fn pending_email(
        &self,
        id: Uuid,
    ) -> impl Future<Output = Result<Option<PendingEmail>>> + Send;

    fn pending_email_for_step(
        &self,
        enrollment_id: Uuid,
        step_number: u32,
    ) -> impl Future<Output = Result<Option<PendingEmail>>> + Send;

    /// Conditional status update on a pending email.
    fn set_pending_status(
        &self,
        id: Uuid,
        expected: PendingEmailStatus,
        to: PendingEmailStatus,
    ) -> impl Future<Output = Result<bool>> + Send;

    /// Pending emails awaiting manual review, oldest first.
    fn pending_review_queue(
        &self,
        limit: u32,
    ) -> impl Future<Output = Result<Vec<PendingEmail>>> + Send;

    /// Number of emails the sequence has sent since `since`. Backs the
    /// daily send cap.
    fn sent_count_since(
        &self,
        sequence_id: Uuid,
        since: OffsetDateTime,
    ) -> impl Future<Output = Result<u32>> + Send;

    // -- interactions --------------------------------------------------------

    fn record_interaction(
        &self,
        interaction: Interaction,
    ) -> impl Future<Output = Result<()>> + Send;

    fn interaction(
        &self,
        id: Uuid,
    ) -> impl Future<Output = Result<Option<Interaction>>> + Send;

    /// Attach reply annotations to an inbound interaction.
    fn annotate_reply(
        &self,
        id: Uuid,
        category: ReplyCategory,
        sentiment: Sentiment,
        suggested_reply: Option<String>,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Subjects of the most recent outbound emails to the contact,
    /// newest first, bounded by `limit`.
    fn prior_outbound_subjects(
        &self,
        contact_id: Uuid,
        limit: u32,
    ) -> impl Future<Output = Result<Vec<String>>> + Send;

    // -- fleet enumeration ---------------------------------------------------

    fn workspaces(&self) -> impl Future<Output = Result<Vec<Workspace>>> + Send;

    fn workspaces_with_mailbox(&self) -> impl Future<Output = Result<Vec<Workspace>>> + Send;

    /// Meetings starting before `before` that still lack prep notes.
    fn meetings_needing_prep(
        &self,
        before: OffsetDateTime,
    ) -> impl Future<Output = Result<Vec<Meeting>>> + Send;

    fn meeting(&self, id: Uuid) -> impl Future<Output = Result<Option<Meeting>>> + Send;

    /// Set prep notes only if none exist yet. Returns whether the write landed.
    fn save_meeting_prep(
        &self,
        meeting_id: Uuid,
        notes: String,
    ) -> impl Future<Output = Result<bool>> + Send;

    fn open_deals(&self) -> impl Future<Output = Result<Vec<Deal>>> + Send;

    fn deal(&self, id: Uuid) -> impl Future<Output = Result<Option<Deal>>> + Send;

    /// Update the deal score only while the deal is not closed.
    fn set_deal_score(
        &self,
        id: Uuid,
        score: u8,
    ) -> impl Future<Output = Result<bool>> + Send;

    /// Hard bounces recorded for the workspace since `since`.
    fn recent_hard_bounces(
        &self,
        workspace_id: Uuid,
        since: OffsetDateTime,
    ) -> impl Future<Output = Result<Vec<BounceRecord>>> + Send;

    /// Compute send/reply aggregates for a workspace.
    fn rollup_workspace_stats(
        &self,
        workspace_id: Uuid,
    ) -> impl Future<Output = Result<WorkspaceRollup>> + Send;

    // -- audit ---------------------------------------------------------------

    fn record_usage(&self, record: UsageRecord) -> impl Future<Output = Result<()>> + Send;
}
