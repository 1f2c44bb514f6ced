//! Scheduled job dispatcher: cron cadences fanned out to per-entity events.
//!
//! Each cron job enumerates a set of entities and publishes one event per
//! entity, so fleet work rides the same bus as everything else: per-entity
//! retries, dead letters, and governance all apply. A slow workspace rollup
//! cannot block the bounce check.

use std::str::FromStr;

use async_trait::async_trait;
use time::OffsetDateTime;
use tracing::warn;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::event::{
    DealJob, MeetingJob, NewEvent, StepJob, WorkspaceJob, EV_BOUNCE_CHECK, EV_DEAL_SCORE,
    EV_MEETING_PREP, EV_ROLLUP_DUE, EV_STEP_SEND,
};
use crate::repo::PersistenceStore;

/// Daily analytics rollup, 06:00 UTC.
pub const JOB_DAILY_ROLLUP: &str = "daily-rollup";
/// Bounce detection sweep, every 4 hours.
pub const JOB_BOUNCE_CHECK: &str = "bounce-check";
/// Meeting prep notes, hourly.
pub const JOB_MEETING_PREP: &str = "meeting-prep";
/// Deal scoring, daily at 07:00 UTC.
pub const JOB_DEAL_SCORING: &str = "deal-scoring";
/// Due-enrollment send tick, every 15 minutes.
pub const JOB_SEQUENCE_TICK: &str = "sequence-tick";

/// How far ahead the meeting-prep job looks for upcoming meetings. The
/// job fires hourly, so two hours keeps prep fresh without re-surfacing
/// meetings all day.
const MEETING_PREP_LOOKAHEAD: time::Duration = time::Duration::hours(2);
/// Upper bound on enrollments fanned out per tick.
const TICK_BATCH: u32 = 200;

/// A named cron cadence.
#[derive(Debug, Clone)]
pub struct CronJob {
    pub name: &'static str,
    schedule: cron::Schedule,
}

impl CronJob {
    pub fn new(name: &'static str, expression: &str) -> Result<Self> {
        let schedule =
            cron::Schedule::from_str(expression).map_err(|err| Error::InvalidCronExpression {
                expression: expression.to_string(),
                detail: err.to_string(),
            })?;
        Ok(Self { name, schedule })
    }

    /// Next fire time strictly after `after`, in UTC.
    pub fn next_after(&self, after: OffsetDateTime) -> Option<OffsetDateTime> {
        self.schedule.after(&to_chrono(after)).next().map(to_time)
    }
}

// The `cron` crate speaks chrono; the rest of the codebase speaks `time`.
// Conversions stay confined to this boundary.
fn to_chrono(t: OffsetDateTime) -> chrono::DateTime<chrono::Utc> {
    chrono::DateTime::from_timestamp(t.unix_timestamp(), t.nanosecond())
        .unwrap_or_default()
}

fn to_time(t: chrono::DateTime<chrono::Utc>) -> OffsetDateTime {
    OffsetDateTime::from_unix_timestamp(t.timestamp())
        .unwrap_or(OffsetDateTime::UNIX_EPOCH)
        + time::Duration::nanoseconds(t.timestamp_subsec_nanos() as i64)
}

/// The five standard cadences.
pub fn standard_jobs() -> Result<Vec<CronJob>> {
    Ok(vec![
        CronJob::new(JOB_DAILY_ROLLUP, "0 0 6 * * *")?,
        CronJob::new(JOB_BOUNCE_CHECK, "0 0 */4 * * *")?,
        CronJob::new(JOB_MEETING_PREP, "0 0 * * * *")?,
        CronJob::new(JOB_DEAL_SCORING, "0 0 7 * * *")?,
        CronJob::new(JOB_SEQUENCE_TICK, "0 */15 * * * *")?,
    ])
}

/// Expands a fired cron job into per-entity events.
#[async_trait]
pub trait FanOut: Send + Sync + 'static {
    async fn fan_out(&self, job: &str, now: OffsetDateTime) -> Result<Vec<NewEvent>>;
}

/// Standard fan-out backed by the persistence store.
#[derive(Debug, Clone)]
pub struct RepoFanOut<R> {
    repo: R,
}

impl<R: PersistenceStore> RepoFanOut<R> {
    pub fn new(repo: R) -> Self {
        Self { repo }
    }

    async fn rollup_events(&self) -> Result<Vec<NewEvent>> {
        let mut events = Vec::new();
        for workspace in self.repo.workspaces().await? {
            events.push(workspace_event(EV_ROLLUP_DUE, workspace.id)?);
        }
        Ok(events)
    }

    async fn bounce_events(&self) -> Result<Vec<NewEvent>> {
        let mut events = Vec::new();
        for workspace in self.repo.workspaces_with_mailbox().await? {
            events.push(workspace_event(EV_BOUNCE_CHECK, workspace.id)?);
        }
        Ok(events)
    }

    async fn meeting_events(&self, now: OffsetDateTime) -> Result<Vec<NewEvent>> {
        let mut events = Vec::new();
        for meeting in self
            .repo
            .meetings_needing_prep(now + MEETING_PREP_LOOKAHEAD)
            .await?
        {
            events.push(NewEvent::new(
                EV_MEETING_PREP,
                MeetingJob {
                    meeting_id: meeting.id,
                },
            )?);
        }
        Ok(events)
    }

    async fn deal_events(&self) -> Result<Vec<NewEvent>> {
        let mut events = Vec::new();
        for deal in self.repo.open_deals().await? {
            events.push(NewEvent::new(EV_DEAL_SCORE, DealJob { deal_id: deal.id })?);
        }
        Ok(events)
    }

    /// One send trigger per due enrollment. Dedupe keys keep repeated
    /// ticks from stacking triggers for the same step.
    async fn tick_events(&self, now: OffsetDateTime) -> Result<Vec<NewEvent>> {
        let mut events = Vec::new();
        for enrollment in self.repo.due_enrollments(now, TICK_BATCH).await? {
            let job = StepJob::new(enrollment.id, enrollment.current_step);
            let key = job.send_dedupe_key();
            events.push(NewEvent::new(EV_STEP_SEND, job)?.dedupe(key));
        }
        Ok(events)
    }
}

fn workspace_event(name: &str, workspace_id: Uuid) -> Result<NewEvent> {
    NewEvent::new(name, WorkspaceJob { workspace_id })
}

#[async_trait]
impl<R: PersistenceStore> FanOut for RepoFanOut<R> {
    async fn fan_out(&self, job: &str, now: OffsetDateTime) -> Result<Vec<NewEvent>> {
        match job {
            JOB_DAILY_ROLLUP => self.rollup_events().await,
            JOB_BOUNCE_CHECK => self.bounce_events().await,
            JOB_MEETING_PREP => self.meeting_events(now).await,
            JOB_DEAL_SCORING => self.deal_events().await,
            JOB_SEQUENCE_TICK => self.tick_events(now).await,
            other => {
                warn!(job = other, "unknown cron job, nothing to fan out");
                Ok(Vec::new())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn standard_jobs_parse() {
        let jobs = standard_jobs().unwrap();
        assert_eq!(jobs.len(), 5);
    }

    #[test]
    fn invalid_expression_is_rejected() {
        let err = CronJob::new("bad", "not a cron").unwrap_err();
        assert!(matches!(err, Error::InvalidCronExpression { .. }));
    }

    #[test]
    fn tick_fires_every_fifteen_minutes() {
        let jobs = standard_jobs().unwrap();
        let tick = jobs
            .iter()
            .find(|j| j.name == JOB_SEQUENCE_TICK)
            .unwrap();

        let next = tick.next_after(datetime!(2026-01-05 09:07 UTC)).unwrap();
        assert_eq!(next, datetime!(2026-01-05 09:15 UTC));

        let next = tick.next_after(datetime!(2026-01-05 09:15 UTC)).unwrap();
        assert_eq!(next, datetime!(2026-01-05 09:30 UTC));
    }

    #[test]
    fn rollup_fires_daily_at_six() {
        let jobs = standard_jobs().unwrap();
        let rollup = jobs.iter().find(|j| j.name == JOB_DAILY_ROLLUP).unwrap();

        let next = rollup.next_after(datetime!(2026-01-05 06:00 UTC)).unwrap();
        assert_eq!(next, datetime!(2026-01-06 06:00 UTC));
    }

    #[test]
    fn bounce_check_fires_every_four_hours() {
        let jobs = standard_jobs().unwrap();
        let bounce = jobs.iter().find(|j| j.name == JOB_BOUNCE_CHECK).unwrap();

        let next = bounce.next_after(datetime!(2026-01-05 05:00 UTC)).unwrap();
        assert_eq!(next, datetime!(2026-01-05 08:00 UTC));
    }
}
