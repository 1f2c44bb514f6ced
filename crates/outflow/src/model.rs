//! Domain data model: enrollments, sequences, pending emails, interactions,
//! and the fleet entities enumerated by the scheduled dispatchers.
//!
//! Status machines are closed enums. An enrollment leaves `active` exactly
//! once; every off-`active` state is terminal and is never revisited by
//! scheduling. Transitions are applied by the persistence store as
//! conditional updates (`WHERE status = expected`), so concurrent writers
//! race safely: the loser's update is discarded.

use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime, Time, Weekday};
use uuid::Uuid;

use crate::error::{Error, Result};

// =============================================================================
// Enrollment
// =============================================================================

/// A contact's run through one sequence.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Enrollment {
    pub id: Uuid,
    pub sequence_id: Uuid,
    pub contact_id: Uuid,
    pub status: EnrollmentStatus,
    /// 1-based step the enrollment is currently on. Monotonically increasing
    /// while active.
    pub current_step: u32,
    /// Set only while `status == Active`.
    pub next_send_at: Option<OffsetDateTime>,
    /// A/B variant tag chosen at enrollment time, if the sequence carries
    /// variant-tagged steps.
    pub ab_variant: Option<String>,
    pub created_at: OffsetDateTime,
}

impl Enrollment {
    pub fn is_active(&self) -> bool {
        self.status == EnrollmentStatus::Active
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EnrollmentStatus {
    Active,
    Paused,
    Completed,
    Replied,
    Bounced,
    Unsubscribed,
}

impl EnrollmentStatus {
    /// Every state except `Active` is terminal for scheduling purposes.
    pub fn is_terminal(self) -> bool {
        self != EnrollmentStatus::Active
    }

    /// Transitions are only valid out of `Active`.
    pub fn can_transition_to(self, to: EnrollmentStatus) -> bool {
        self == EnrollmentStatus::Active && to != EnrollmentStatus::Active
    }
}

impl std::fmt::Display for EnrollmentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            EnrollmentStatus::Active => "active",
            EnrollmentStatus::Paused => "paused",
            EnrollmentStatus::Completed => "completed",
            EnrollmentStatus::Replied => "replied",
            EnrollmentStatus::Bounced => "bounced",
            EnrollmentStatus::Unsubscribed => "unsubscribed",
        };
        f.write_str(s)
    }
}

// =============================================================================
// Sequence
// =============================================================================

/// Ordered template of steps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sequence {
    pub id: Uuid,
    pub name: String,
    pub status: SequenceStatus,
    /// Steps ordered by `step_number`, which must form a contiguous 1..=N.
    pub steps: Vec<SequenceStep>,
    pub settings: SendSettings,
    pub stats: SequenceStats,
}

impl Sequence {
    /// Validate structural invariants: contiguous step numbers starting at
    /// 1, and a send window forming a real hour range.
    ///
    /// `delay_days` is unsigned, so non-negativity holds by construction.
    pub fn validate(&self) -> Result<()> {
        if self.steps.is_empty() {
            return Err(Error::InvalidSequence(format!(
                "sequence {} has no steps",
                self.id
            )));
        }
        for (i, step) in self.steps.iter().enumerate() {
            let expected = i as u32 + 1;
            if step.step_number != expected {
                return Err(Error::InvalidSequence(format!(
                    "sequence {}: expected step {expected}, found {}",
                    self.id, step.step_number
                )));
            }
        }
        let start = self.settings.window_start_hour;
        let end = self.settings.window_end_hour;
        if start >= end || end > 24 {
            return Err(Error::InvalidSequence(format!(
                "sequence {}: send window {start}..{end} is not a valid hour range",
                self.id
            )));
        }
        Ok(())
    }

    /// Look up a step template by 1-based number.
    pub fn step(&self, step_number: u32) -> Option<&SequenceStep> {
        self.steps
            .iter()
            .find(|s| s.step_number == step_number)
    }

    /// The step after `step_number`, if any.
    pub fn next_step(&self, step_number: u32) -> Option<&SequenceStep> {
        self.step(step_number + 1)
    }

    /// Distinct variant tags carried by the sequence's steps.
    pub fn variant_tags(&self) -> Vec<String> {
        let mut tags: Vec<String> = self
            .steps
            .iter()
            .filter_map(|s| s.ab_variant.clone())
            .collect();
        tags.sort();
        tags.dedup();
        tags
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SequenceStatus {
    Draft,
    Active,
    Paused,
    Completed,
}

/// One templated email slot within a sequence.
///
/// Immutable once referenced by an in-flight enrollment's pending email;
/// edits apply only to future generations.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SequenceStep {
    /// 1-based position in the sequence.
    pub step_number: u32,
    /// Days after the previous step's send time (not after enrollment time).
    pub delay_days: u32,
    pub subject_template: String,
    pub body_template: String,
    pub ab_variant: Option<String>,
}

/// Per-sequence send-window and rate settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SendSettings {
    /// Maximum emails sent per day across the sequence.
    pub daily_cap: u32,
    /// Working-hour window start (UTC hour, inclusive).
    pub window_start_hour: u8,
    /// Working-hour window end (UTC hour, exclusive).
    pub window_end_hour: u8,
    pub skip_weekends: bool,
}

impl Default for SendSettings {
    fn default() -> Self {
        Self {
            daily_cap: 100,
            window_start_hour: 8,
            window_end_hour: 18,
            skip_weekends: true,
        }
    }
}

impl SendSettings {
    /// Push `when` forward into the next valid send slot: inside the
    /// working-hour window and, if configured, off weekends. Never moves a
    /// timestamp backwards.
    pub fn clamp_to_window(&self, when: OffsetDateTime) -> OffsetDateTime {
        // Normalized to a non-empty in-range window so the loop always
        // terminates, even on a stored row that predates validation.
        let start_hour = self.window_start_hour.min(23);
        let end_hour = self.window_end_hour.clamp(start_hour + 1, 24);
        let start = Time::from_hms(start_hour, 0, 0).unwrap_or(Time::MIDNIGHT);
        let mut when = when;

        loop {
            if self.skip_weekends
                && matches!(when.weekday(), Weekday::Saturday | Weekday::Sunday)
            {
                when = (when + Duration::days(1)).replace_time(start);
                continue;
            }
            if when.hour() < start_hour {
                when = when.replace_time(start);
                continue;
            }
            if when.hour() >= end_hour {
                when = (when + Duration::days(1)).replace_time(start);
                continue;
            }
            return when;
        }
    }
}

/// Aggregate engagement stats maintained by the daily rollup.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SequenceStats {
    pub emails_sent: u64,
    pub replies: u64,
    pub open_rate: f64,
    pub reply_rate: f64,
}

/// Deterministic A/B variant pick for a contact.
///
/// Same contact always lands on the same variant, so a re-enrolled contact
/// sees a consistent track.
pub fn pick_variant(contact_id: Uuid, tags: &[String]) -> Option<String> {
    if tags.is_empty() {
        return None;
    }
    let index = (contact_id.as_u128() % tags.len() as u128) as usize;
    Some(tags[index].clone())
}

// =============================================================================
// Pending email
// =============================================================================

/// A generated-but-unsent email awaiting the approval gate.
///
/// At most one exists per (enrollment, step). A send never happens without
/// observing `Approved`; auto-approval is a policy applied to the confidence
/// score, not a bypass of the gate.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PendingEmail {
    pub id: Uuid,
    pub enrollment_id: Uuid,
    pub step_number: u32,
    pub subject: String,
    pub body: String,
    /// 0–100.
    pub ai_confidence: u8,
    pub spam_score: f64,
    pub status: PendingEmailStatus,
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PendingEmailStatus {
    Pending,
    Approved,
    Rejected,
    Sent,
}

// =============================================================================
// Interactions and reply taxonomy
// =============================================================================

/// A recorded touchpoint with a contact (sent email, inbound reply).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Interaction {
    pub id: Uuid,
    pub contact_id: Uuid,
    pub kind: InteractionKind,
    pub subject: String,
    pub body: String,
    /// Provider message id for outbound sends.
    pub message_id: Option<String>,
    /// Reply annotations, set by the reply-processing workflow.
    pub category: Option<ReplyCategory>,
    pub sentiment: Option<Sentiment>,
    pub suggested_reply: Option<String>,
    pub occurred_at: OffsetDateTime,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum InteractionKind {
    OutboundEmail,
    InboundEmail,
}

/// Closed set of reply classifications.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ReplyCategory {
    Interested,
    NotInterested,
    Objection,
    OutOfOffice,
    WrongPerson,
    Unsubscribe,
    MeetingRequest,
    Question,
    Other,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Sentiment {
    Positive,
    Neutral,
    Negative,
}

/// Total mapping from a reply category to its sentiment and an optional
/// suggested-reply template. Non-actionable categories carry no template.
pub fn disposition(category: ReplyCategory) -> (Sentiment, Option<&'static str>) {
    match category {
        ReplyCategory::Interested => (
            Sentiment::Positive,
            Some("Great to hear! Would {day} work for a quick call?"),
        ),
        ReplyCategory::MeetingRequest => (
            Sentiment::Positive,
            Some("Happy to meet — here is my calendar link: {calendar_link}"),
        ),
        ReplyCategory::Question => (
            Sentiment::Neutral,
            Some("Good question — {answer}. Want me to expand on anything?"),
        ),
        ReplyCategory::Objection => (
            Sentiment::Negative,
            Some("Understood — many teams felt the same before seeing {proof_point}."),
        ),
        ReplyCategory::NotInterested => (Sentiment::Negative, None),
        ReplyCategory::OutOfOffice => (Sentiment::Neutral, None),
        ReplyCategory::WrongPerson => (
            Sentiment::Neutral,
            Some("Thanks for letting me know — could you point me to the right person?"),
        ),
        ReplyCategory::Unsubscribe => (Sentiment::Negative, None),
        ReplyCategory::Other => (Sentiment::Neutral, None),
    }
}

impl ReplyCategory {
    /// All categories, for exhaustive sweeps in tests and review tooling.
    pub const ALL: [ReplyCategory; 9] = [
        ReplyCategory::Interested,
        ReplyCategory::NotInterested,
        ReplyCategory::Objection,
        ReplyCategory::OutOfOffice,
        ReplyCategory::WrongPerson,
        ReplyCategory::Unsubscribe,
        ReplyCategory::MeetingRequest,
        ReplyCategory::Question,
        ReplyCategory::Other,
    ];

    /// Whether a reply in this category should halt the contact's active
    /// enrollment. Out-of-office is the one category that leaves the
    /// sequence running.
    pub fn halts_sequence(self) -> bool {
        !matches!(self, ReplyCategory::OutOfOffice)
    }
}

// =============================================================================
// Fleet entities
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Contact {
    pub id: Uuid,
    pub email: String,
    pub first_name: String,
    pub last_name: String,
    pub title: Option<String>,
    pub company_id: Option<Uuid>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Company {
    pub id: Uuid,
    pub name: String,
    pub industry: Option<String>,
    pub description: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workspace {
    pub id: Uuid,
    pub name: String,
    /// True when a Gmail/Outlook integration is connected.
    pub mailbox_connected: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Meeting {
    pub id: Uuid,
    pub workspace_id: Uuid,
    pub contact_id: Uuid,
    pub title: String,
    pub starts_at: OffsetDateTime,
    pub prep_notes: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Deal {
    pub id: Uuid,
    pub workspace_id: Uuid,
    pub name: String,
    pub stage: DealStage,
    pub value_cents: i64,
    pub score: Option<u8>,
    pub updated_at: OffsetDateTime,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DealStage {
    Lead,
    Qualified,
    Proposal,
    Negotiation,
    ClosedWon,
    ClosedLost,
}

impl DealStage {
    pub fn is_closed(self) -> bool {
        matches!(self, DealStage::ClosedWon | DealStage::ClosedLost)
    }
}

/// A hard bounce correlated to a contact's address.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BounceRecord {
    pub contact_id: Uuid,
    pub address: String,
    pub bounced_at: OffsetDateTime,
}

/// Usage/audit record appended by terminal workflow steps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageRecord {
    pub id: Uuid,
    pub workspace_id: Option<Uuid>,
    pub kind: UsageKind,
    pub tokens_used: u32,
    pub occurred_at: OffsetDateTime,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum UsageKind {
    EmailGenerated,
    EmailSent,
    ReplyClassified,
    RollupComputed,
    DealScored,
    MeetingPrepared,
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    fn step(n: u32, delay: u32) -> SequenceStep {
        SequenceStep {
            step_number: n,
            delay_days: delay,
            subject_template: format!("subject {n}"),
            body_template: format!("body {n}"),
            ab_variant: None,
        }
    }

    fn sequence(steps: Vec<SequenceStep>) -> Sequence {
        Sequence {
            id: Uuid::nil(),
            name: "test".into(),
            status: SequenceStatus::Active,
            steps,
            settings: SendSettings::default(),
            stats: SequenceStats::default(),
        }
    }

    #[test]
    fn terminal_states() {
        assert!(!EnrollmentStatus::Active.is_terminal());
        for status in [
            EnrollmentStatus::Paused,
            EnrollmentStatus::Completed,
            EnrollmentStatus::Replied,
            EnrollmentStatus::Bounced,
            EnrollmentStatus::Unsubscribed,
        ] {
            assert!(status.is_terminal());
            // No transition out of a terminal state.
            assert!(!status.can_transition_to(EnrollmentStatus::Active));
            assert!(!status.can_transition_to(EnrollmentStatus::Completed));
        }
    }

    #[test]
    fn active_transitions_anywhere_but_active() {
        assert!(EnrollmentStatus::Active.can_transition_to(EnrollmentStatus::Replied));
        assert!(!EnrollmentStatus::Active.can_transition_to(EnrollmentStatus::Active));
    }

    #[test]
    fn sequence_validation_accepts_contiguous_steps() {
        let seq = sequence(vec![step(1, 0), step(2, 3), step(3, 5)]);
        assert!(seq.validate().is_ok());
    }

    #[test]
    fn sequence_validation_rejects_gaps() {
        let seq = sequence(vec![step(1, 0), step(3, 3)]);
        assert!(matches!(seq.validate(), Err(Error::InvalidSequence(_))));
    }

    #[test]
    fn sequence_validation_rejects_empty() {
        let seq = sequence(vec![]);
        assert!(seq.validate().is_err());
    }

    #[test]
    fn sequence_validation_rejects_inverted_send_window() {
        let mut seq = sequence(vec![step(1, 0)]);
        seq.settings.window_start_hour = 18;
        seq.settings.window_end_hour = 8;
        assert!(matches!(seq.validate(), Err(Error::InvalidSequence(_))));

        seq.settings.window_start_hour = 8;
        seq.settings.window_end_hour = 30;
        assert!(matches!(seq.validate(), Err(Error::InvalidSequence(_))));
    }

    #[test]
    fn next_step_lookup() {
        let seq = sequence(vec![step(1, 0), step(2, 3)]);
        assert_eq!(seq.next_step(1).map(|s| s.step_number), Some(2));
        assert!(seq.next_step(2).is_none());
    }

    #[test]
    fn disposition_is_total() {
        for category in ReplyCategory::ALL {
            // Must not panic; template may be None for non-actionable ones.
            let _ = disposition(category);
        }
        let (sentiment, template) = disposition(ReplyCategory::Interested);
        assert_eq!(sentiment, Sentiment::Positive);
        assert!(template.is_some());

        let (sentiment, template) = disposition(ReplyCategory::OutOfOffice);
        assert_eq!(sentiment, Sentiment::Neutral);
        assert!(template.is_none());
    }

    #[test]
    fn out_of_office_does_not_halt() {
        assert!(!ReplyCategory::OutOfOffice.halts_sequence());
        assert!(ReplyCategory::Interested.halts_sequence());
        assert!(ReplyCategory::Unsubscribe.halts_sequence());
    }

    #[test]
    fn clamp_inside_window_is_identity() {
        let settings = SendSettings::default();
        // 2024-01-03 is a Wednesday.
        let when = datetime!(2024-01-03 10:30 UTC);
        assert_eq!(settings.clamp_to_window(when), when);
    }

    #[test]
    fn clamp_before_window_moves_to_start() {
        let settings = SendSettings::default();
        let when = datetime!(2024-01-03 05:00 UTC);
        assert_eq!(
            settings.clamp_to_window(when),
            datetime!(2024-01-03 08:00 UTC)
        );
    }

    #[test]
    fn clamp_after_window_moves_to_next_day() {
        let settings = SendSettings::default();
        let when = datetime!(2024-01-03 19:00 UTC);
        assert_eq!(
            settings.clamp_to_window(when),
            datetime!(2024-01-04 08:00 UTC)
        );
    }

    #[test]
    fn clamp_skips_weekend() {
        let settings = SendSettings::default();
        // 2024-01-06 is a Saturday.
        let when = datetime!(2024-01-06 10:00 UTC);
        assert_eq!(
            settings.clamp_to_window(when),
            datetime!(2024-01-08 08:00 UTC)
        );
    }

    #[test]
    fn clamp_friday_evening_lands_monday() {
        let settings = SendSettings::default();
        // 2024-01-05 is a Friday.
        let when = datetime!(2024-01-05 20:00 UTC);
        assert_eq!(
            settings.clamp_to_window(when),
            datetime!(2024-01-08 08:00 UTC)
        );
    }

    #[test]
    fn clamp_terminates_on_inverted_window() {
        // An inverted window slipped into storage must not spin forever;
        // it collapses to the one-hour slot at the start hour.
        let settings = SendSettings {
            window_start_hour: 18,
            window_end_hour: 8,
            ..SendSettings::default()
        };
        let when = datetime!(2024-01-03 19:00 UTC);
        assert_eq!(
            settings.clamp_to_window(when),
            datetime!(2024-01-04 18:00 UTC)
        );
    }

    #[test]
    fn clamp_terminates_on_out_of_range_hours() {
        let settings = SendSettings {
            window_start_hour: 25,
            window_end_hour: 30,
            ..SendSettings::default()
        };
        let when = datetime!(2024-01-03 10:00 UTC);
        assert_eq!(
            settings.clamp_to_window(when),
            datetime!(2024-01-03 23:00 UTC)
        );
    }

    #[test]
    fn weekend_allowed_when_not_skipped() {
        let settings = SendSettings {
            skip_weekends: false,
            ..SendSettings::default()
        };
        let when = datetime!(2024-01-06 10:00 UTC);
        assert_eq!(settings.clamp_to_window(when), when);
    }

    #[test]
    fn variant_pick_is_deterministic() {
        let tags = vec!["a".to_string(), "b".to_string()];
        let contact = Uuid::from_u128(7);

        assert_eq!(pick_variant(contact, &tags), pick_variant(contact, &tags));
        assert_eq!(pick_variant(contact, &[]), None);
        assert_eq!(pick_variant(Uuid::from_u128(6), &tags).as_deref(), Some("a"));
        assert_eq!(pick_variant(Uuid::from_u128(7), &tags).as_deref(), Some("b"));
    }
}
