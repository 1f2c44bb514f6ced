//! In-memory [`PersistenceStore`] with the same conditional-update
//! semantics the production repository provides.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use time::OffsetDateTime;
use uuid::Uuid;

use outflow::error::{Error, Result};
use outflow::model::{
    BounceRecord, Company, Contact, Deal, Enrollment, EnrollmentStatus, Interaction,
    InteractionKind, Meeting, PendingEmail, PendingEmailStatus, ReplyCategory, Sentiment,
    Sequence, UsageRecord, Workspace,
};
use outflow::repo::{PersistenceStore, WorkspaceRollup};

#[derive(Debug, Default)]
struct Inner {
    enrollments: HashMap<Uuid, Enrollment>,
    sequences: HashMap<Uuid, Sequence>,
    contacts: HashMap<Uuid, Contact>,
    companies: HashMap<Uuid, Company>,
    pending: HashMap<Uuid, PendingEmail>,
    interactions: HashMap<Uuid, Interaction>,
    workspaces: HashMap<Uuid, Workspace>,
    meetings: HashMap<Uuid, Meeting>,
    deals: HashMap<Uuid, Deal>,
    bounces: Vec<(Uuid, BounceRecord)>,
    rollups: HashMap<Uuid, WorkspaceRollup>,
    usage: Vec<UsageRecord>,
}

/// Mutex-backed in-memory repository.
#[derive(Debug, Clone, Default)]
pub struct MemRepo {
    inner: Arc<Mutex<Inner>>,
}

impl MemRepo {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // -- seeders -------------------------------------------------------------

    pub fn put_sequence(&self, sequence: Sequence) {
        self.lock().sequences.insert(sequence.id, sequence);
    }

    pub fn put_contact(&self, contact: Contact) {
        self.lock().contacts.insert(contact.id, contact);
    }

    pub fn put_company(&self, company: Company) {
        self.lock().companies.insert(company.id, company);
    }

    pub fn put_workspace(&self, workspace: Workspace) {
        self.lock().workspaces.insert(workspace.id, workspace);
    }

    pub fn put_meeting(&self, meeting: Meeting) {
        self.lock().meetings.insert(meeting.id, meeting);
    }

    pub fn put_deal(&self, deal: Deal) {
        self.lock().deals.insert(deal.id, deal);
    }

    pub fn push_bounce(&self, workspace_id: Uuid, bounce: BounceRecord) {
        self.lock().bounces.push((workspace_id, bounce));
    }

    pub fn set_rollup(&self, rollup: WorkspaceRollup) {
        self.lock().rollups.insert(rollup.workspace_id, rollup);
    }

    // -- inspectors ----------------------------------------------------------

    pub fn usage_records(&self) -> Vec<UsageRecord> {
        self.lock().usage.clone()
    }

    pub fn interactions_for(&self, contact_id: Uuid) -> Vec<Interaction> {
        let mut out: Vec<Interaction> = self
            .lock()
            .interactions
            .values()
            .filter(|i| i.contact_id == contact_id)
            .cloned()
            .collect();
        out.sort_by_key(|i| i.occurred_at);
        out
    }

    pub fn all_enrollments(&self) -> Vec<Enrollment> {
        self.lock().enrollments.values().cloned().collect()
    }
}

impl PersistenceStore for MemRepo {
    async fn insert_enrollment(&self, enrollment: Enrollment) -> Result<()> {
        self.lock().enrollments.insert(enrollment.id, enrollment);
        Ok(())
    }

    async fn enrollment(&self, id: Uuid) -> Result<Option<Enrollment>> {
        Ok(self.lock().enrollments.get(&id).cloned())
    }

    async fn open_enrollment(
        &self,
        contact_id: Uuid,
        sequence_id: Uuid,
    ) -> Result<Option<Enrollment>> {
        Ok(self
            .lock()
            .enrollments
            .values()
            .find(|e| {
                e.contact_id == contact_id && e.sequence_id == sequence_id && e.is_active()
            })
            .cloned())
    }

    async fn transition_enrollment(
        &self,
        id: Uuid,
        expected: EnrollmentStatus,
        to: EnrollmentStatus,
    ) -> Result<bool> {
        let mut inner = self.lock();
        match inner.enrollments.get_mut(&id) {
            Some(e) if e.status == expected && expected.can_transition_to(to) => {
                e.status = to;
                if to.is_terminal() {
                    e.next_send_at = None;
                }
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Err(Error::not_found("enrollment", id)),
        }
    }

    async fn advance_enrollment(
        &self,
        id: Uuid,
        next_step: u32,
        next_send_at: OffsetDateTime,
    ) -> Result<bool> {
        let mut inner = self.lock();
        match inner.enrollments.get_mut(&id) {
            Some(e) if e.is_active() && next_step > e.current_step => {
                e.current_step = next_step;
                e.next_send_at = Some(next_send_at);
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Err(Error::not_found("enrollment", id)),
        }
    }

    async fn halt_enrollments_for_contact(
        &self,
        contact_id: Uuid,
        to: EnrollmentStatus,
    ) -> Result<u32> {
        let mut halted = 0;
        for e in self.lock().enrollments.values_mut() {
            if e.contact_id == contact_id && e.is_active() {
                e.status = to;
                e.next_send_at = None;
                halted += 1;
            }
        }
        Ok(halted)
    }

    async fn due_enrollments(&self, now: OffsetDateTime, limit: u32) -> Result<Vec<Enrollment>> {
        let mut due: Vec<Enrollment> = self
            .lock()
            .enrollments
            .values()
            .filter(|e| e.is_active() && e.next_send_at.is_some_and(|at| at <= now))
            .cloned()
            .collect();
        due.sort_by_key(|e| e.next_send_at);
        due.truncate(limit as usize);
        Ok(due)
    }

    async fn sequence(&self, id: Uuid) -> Result<Option<Sequence>> {
        Ok(self.lock().sequences.get(&id).cloned())
    }

    async fn contact(&self, id: Uuid) -> Result<Option<Contact>> {
        Ok(self.lock().contacts.get(&id).cloned())
    }

    async fn company(&self, id: Uuid) -> Result<Option<Company>> {
        Ok(self.lock().companies.get(&id).cloned())
    }

    async fn upsert_pending_email(&self, email: PendingEmail) -> Result<()> {
        let mut inner = self.lock();
        inner.pending.retain(|_, p| {
            !(p.enrollment_id == email.enrollment_id && p.step_number == email.step_number)
        });
        inner.pending.insert(email.id, email);
        Ok(())
    }

    async fn pending_email(&self, id: Uuid) -> Result<Option<PendingEmail>> {
        Ok(self.lock().pending.get(&id).cloned())
    }

    async fn pending_email_for_step(
        &self,
        enrollment_id: Uuid,
        step_number: u32,
    ) -> Result<Option<PendingEmail>> {
        Ok(self
            .lock()
            .pending
            .values()
            .find(|p| p.enrollment_id == enrollment_id && p.step_number == step_number)
            .cloned())
    }

    async fn set_pending_status(
        &self,
        id: Uuid,
        expected: PendingEmailStatus,
        to: PendingEmailStatus,
    ) -> Result<bool> {
        let mut inner = self.lock();
        match inner.pending.get_mut(&id) {
            Some(p) if p.status == expected => {
                p.status = to;
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Err(Error::not_found("pending email", id)),
        }
    }

    async fn pending_review_queue(&self, limit: u32) -> Result<Vec<PendingEmail>> {
        let mut queue: Vec<PendingEmail> = self
            .lock()
            .pending
            .values()
            .filter(|p| p.status == PendingEmailStatus::Pending)
            .cloned()
            .collect();
        queue.sort_by_key(|p| p.created_at);
        queue.truncate(limit as usize);
        Ok(queue)
    }

    async fn sent_count_since(
        &self,
        sequence_id: Uuid,
        since: OffsetDateTime,
    ) -> Result<u32> {
        let inner = self.lock();
        let contacts: HashSet<Uuid> = inner
            .enrollments
            .values()
            .filter(|e| e.sequence_id == sequence_id)
            .map(|e| e.contact_id)
            .collect();
        Ok(inner
            .interactions
            .values()
            .filter(|i| {
                i.kind == InteractionKind::OutboundEmail
                    && i.occurred_at >= since
                    && contacts.contains(&i.contact_id)
            })
            .count() as u32)
    }

    async fn record_interaction(&self, interaction: Interaction) -> Result<()> {
        self.lock().interactions.insert(interaction.id, interaction);
        Ok(())
    }

    async fn interaction(&self, id: Uuid) -> Result<Option<Interaction>> {
        Ok(self.lock().interactions.get(&id).cloned())
    }

    async fn annotate_reply(
        &self,
        id: Uuid,
        category: ReplyCategory,
        sentiment: Sentiment,
        suggested_reply: Option<String>,
    ) -> Result<()> {
        let mut inner = self.lock();
        let interaction = inner
            .interactions
            .get_mut(&id)
            .ok_or_else(|| Error::not_found("interaction", id))?;
        interaction.category = Some(category);
        interaction.sentiment = Some(sentiment);
        interaction.suggested_reply = suggested_reply;
        Ok(())
    }

    async fn prior_outbound_subjects(
        &self,
        contact_id: Uuid,
        limit: u32,
    ) -> Result<Vec<String>> {
        let mut outbound: Vec<(OffsetDateTime, String)> = self
            .lock()
            .interactions
            .values()
            .filter(|i| i.contact_id == contact_id && i.kind == InteractionKind::OutboundEmail)
            .map(|i| (i.occurred_at, i.subject.clone()))
            .collect();
        outbound.sort_by_key(|(at, _)| std::cmp::Reverse(*at));
        Ok(outbound
            .into_iter()
            .take(limit as usize)
            .map(|(_, subject)| subject)
            .collect())
    }

    async fn workspaces(&self) -> Result<Vec<Workspace>> {
        let mut all: Vec<Workspace> = self.lock().workspaces.values().cloned().collect();
        all.sort_by_key(|w| w.id);
        Ok(all)
    }

    async fn workspaces_with_mailbox(&self) -> Result<Vec<Workspace>> {
        let mut all: Vec<Workspace> = self
            .lock()
            .workspaces
            .values()
            .filter(|w| w.mailbox_connected)
            .cloned()
            .collect();
        all.sort_by_key(|w| w.id);
        Ok(all)
    }

    async fn meetings_needing_prep(&self, before: OffsetDateTime) -> Result<Vec<Meeting>> {
        let mut due: Vec<Meeting> = self
            .lock()
            .meetings
            .values()
            .filter(|m| m.starts_at <= before && m.prep_notes.is_none())
            .cloned()
            .collect();
        due.sort_by_key(|m| m.starts_at);
        Ok(due)
    }

    async fn meeting(&self, id: Uuid) -> Result<Option<Meeting>> {
        Ok(self.lock().meetings.get(&id).cloned())
    }

    async fn save_meeting_prep(&self, meeting_id: Uuid, notes: String) -> Result<bool> {
        let mut inner = self.lock();
        match inner.meetings.get_mut(&meeting_id) {
            Some(m) if m.prep_notes.is_none() => {
                m.prep_notes = Some(notes);
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Err(Error::not_found("meeting", meeting_id)),
        }
    }

    async fn open_deals(&self) -> Result<Vec<Deal>> {
        let mut open: Vec<Deal> = self
            .lock()
            .deals
            .values()
            .filter(|d| !d.stage.is_closed())
            .cloned()
            .collect();
        open.sort_by_key(|d| d.id);
        Ok(open)
    }

    async fn deal(&self, id: Uuid) -> Result<Option<Deal>> {
        Ok(self.lock().deals.get(&id).cloned())
    }

    async fn set_deal_score(&self, id: Uuid, score: u8) -> Result<bool> {
        let mut inner = self.lock();
        match inner.deals.get_mut(&id) {
            Some(d) if !d.stage.is_closed() => {
                d.score = Some(score);
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Err(Error::not_found("deal", id)),
        }
    }

    async fn recent_hard_bounces(
        &self,
        workspace_id: Uuid,
        since: OffsetDateTime,
    ) -> Result<Vec<BounceRecord>> {
        Ok(self
            .lock()
            .bounces
            .iter()
            .filter(|(ws, b)| *ws == workspace_id && b.bounced_at >= since)
            .map(|(_, b)| b.clone())
            .collect())
    }

    async fn rollup_workspace_stats(&self, workspace_id: Uuid) -> Result<WorkspaceRollup> {
        Ok(self
            .lock()
            .rollups
            .get(&workspace_id)
            .cloned()
            .unwrap_or(WorkspaceRollup {
                workspace_id,
                emails_sent: 0,
                replies: 0,
                reply_rate: 0.0,
            }))
    }

    async fn record_usage(&self, record: UsageRecord) -> Result<()> {
        self.lock().usage.push(record);
        Ok(())
    }
}
