//! Event envelope and typed payloads carried on the bus.
//!
//! Events are immutable once published. Delivery is at-least-once, so every
//! subscriber must be idempotent or protected by the step ledger. An event
//! may carry:
//!
//! - `deliver_at` — deliver no earlier than this instant (scheduled delivery)
//! - `run_id` — inherit an existing run's ledger (used for sleep resumes)
//! - `dedupe_key` — replace a pending undelivered event with the same key,
//!   so repeated dispatch ticks do not stack identical deliveries

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::Result;

/// Generation trigger for one enrollment step.
pub const EV_STEP_GENERATE: &str = "sequence/step.generate";
/// Send trigger for one enrollment step (requires an approved pending email).
pub const EV_STEP_SEND: &str = "sequence/step.send";
/// An inbound reply interaction was recorded and needs processing.
pub const EV_REPLY_RECEIVED: &str = "inbox/reply.received";
/// Daily analytics rollup for one workspace.
pub const EV_ROLLUP_DUE: &str = "workspace/rollup.due";
/// Bounce check for one workspace with an active mailbox.
pub const EV_BOUNCE_CHECK: &str = "mailbox/bounce.check";
/// Prep-note generation for one upcoming meeting.
pub const EV_MEETING_PREP: &str = "meeting/prep.due";
/// Scoring pass for one open deal.
pub const EV_DEAL_SCORE: &str = "deal/score.due";

/// An event to enqueue on the bus.
#[derive(Debug, Clone)]
pub struct NewEvent {
    /// Event name, used to route to the subscribed handler.
    pub name: String,
    /// JSON payload.
    pub payload: Value,
    /// Deliver no earlier than this instant. `None` means immediately.
    pub deliver_at: Option<OffsetDateTime>,
    /// Inherit an existing run's step ledger instead of starting a fresh run.
    pub run_id: Option<Uuid>,
    /// Replace any pending undelivered event with the same key.
    pub dedupe_key: Option<String>,
}

impl NewEvent {
    /// Create an event for immediate delivery.
    pub fn new(name: impl Into<String>, payload: impl Serialize) -> Result<Self> {
        Ok(Self {
            name: name.into(),
            payload: serde_json::to_value(payload)?,
            deliver_at: None,
            run_id: None,
            dedupe_key: None,
        })
    }

    /// Schedule delivery no earlier than `when`.
    pub fn at(mut self, when: OffsetDateTime) -> Self {
        self.deliver_at = Some(when);
        self
    }

    /// Set a dedupe key.
    pub fn dedupe(mut self, key: impl Into<String>) -> Self {
        self.dedupe_key = Some(key.into());
        self
    }
}

/// Payload for [`EV_STEP_GENERATE`] and [`EV_STEP_SEND`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StepJob {
    pub enrollment_id: Uuid,
    pub step_number: u32,
}

impl StepJob {
    pub fn new(enrollment_id: Uuid, step_number: u32) -> Self {
        Self {
            enrollment_id,
            step_number,
        }
    }

    /// Dedupe key for send triggers, shared by the dispatcher tick, the
    /// approval path, and the unapproved re-check loop.
    pub fn send_dedupe_key(&self) -> String {
        format!("send:{}:{}", self.enrollment_id, self.step_number)
    }
}

/// Payload for [`EV_REPLY_RECEIVED`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplyJob {
    pub interaction_id: Uuid,
}

/// Payload for [`EV_ROLLUP_DUE`] and [`EV_BOUNCE_CHECK`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkspaceJob {
    pub workspace_id: Uuid,
}

/// Payload for [`EV_MEETING_PREP`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeetingJob {
    pub meeting_id: Uuid,
}

/// Payload for [`EV_DEAL_SCORE`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DealJob {
    pub deal_id: Uuid,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_event_defaults_to_immediate() {
        let event = NewEvent::new(EV_STEP_SEND, StepJob::new(Uuid::nil(), 1)).unwrap();

        assert_eq!(event.name, EV_STEP_SEND);
        assert!(event.deliver_at.is_none());
        assert!(event.run_id.is_none());
        assert!(event.dedupe_key.is_none());
    }

    #[test]
    fn scheduled_event_carries_deliver_at() {
        let when = OffsetDateTime::now_utc() + time::Duration::hours(1);
        let event = NewEvent::new(EV_STEP_SEND, StepJob::new(Uuid::nil(), 2))
            .unwrap()
            .at(when)
            .dedupe("send:x:2");

        assert_eq!(event.deliver_at, Some(when));
        assert_eq!(event.dedupe_key.as_deref(), Some("send:x:2"));
    }

    #[test]
    fn send_dedupe_key_is_stable_per_step() {
        let id = Uuid::nil();
        let a = StepJob::new(id, 3).send_dedupe_key();
        let b = StepJob::new(id, 3).send_dedupe_key();
        let c = StepJob::new(id, 4).send_dedupe_key();

        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
