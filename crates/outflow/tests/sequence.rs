//! End-to-end sequence lifecycle: enrollment, generation, the approval
//! gate, sending, scheduling, and reply handling, all driven through the
//! engine against in-memory storage with a pinned clock.

mod support;

use std::time::Duration;

use uuid::Uuid;

use outflow::event::{StepJob, EV_STEP_SEND};
use outflow::model::{
    Company, EnrollmentStatus, PendingEmailStatus, ReplyCategory, Sentiment, UsageKind,
};
use outflow::store::DeadLetterQuery;
use outflow::{Error, PersistenceStore};
use outflow_test_utils::{fixtures, FixedSpamChecker, RecordingMailSender, ScriptedGenerator};

use support::{Harness, START};

const THREE_DAYS: Duration = Duration::from_secs(3 * 24 * 60 * 60);

#[tokio::test]
async fn auto_approved_sequence_runs_to_completion() {
    let h = Harness::new();
    let (sequence_id, contact_id) = h.seed_enrollable(3, 3);
    let enrollment = h
        .service
        .enroll_contact(sequence_id, contact_id)
        .await
        .unwrap();

    h.drain().await;
    assert_eq!(h.mailer.sent().len(), 1);
    let e = h.service.enrollment(enrollment.id).await.unwrap().unwrap();
    assert_eq!(e.status, EnrollmentStatus::Active);
    assert_eq!(e.current_step, 2);
    assert_eq!(e.next_send_at, Some(START + THREE_DAYS));

    h.store.advance(THREE_DAYS);
    h.drain().await;
    assert_eq!(h.mailer.sent().len(), 2);

    h.store.advance(THREE_DAYS);
    h.drain().await;

    let sent = h.mailer.sent();
    assert_eq!(sent.len(), 3);
    assert_eq!(sent[0].subject, "Subject 1");
    assert_eq!(sent[1].subject, "Subject 2");
    assert_eq!(sent[2].subject, "Subject 3");
    assert!(sent[0].body.contains("Jordan"));

    let e = h.service.enrollment(enrollment.id).await.unwrap().unwrap();
    assert_eq!(e.status, EnrollmentStatus::Completed);
    assert!(e.next_send_at.is_none());

    let usage = h.repo.usage_records();
    let generated = usage
        .iter()
        .filter(|u| u.kind == UsageKind::EmailGenerated)
        .count();
    let sent = usage.iter().filter(|u| u.kind == UsageKind::EmailSent).count();
    assert_eq!(generated, 3);
    assert_eq!(sent, 3);

    assert_eq!(h.store.pending_count(), 0);
}

#[tokio::test]
async fn duplicate_enrollment_is_rejected() {
    let h = Harness::new();
    let (sequence_id, contact_id) = h.seed_enrollable(2, 1);

    h.service
        .enroll_contact(sequence_id, contact_id)
        .await
        .unwrap();
    let err = h
        .service
        .enroll_contact(sequence_id, contact_id)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::AlreadyEnrolled { .. }));
}

#[tokio::test]
async fn draft_without_company_waits_for_manual_approval() {
    let h = Harness::new();
    let (sequence_id, contact_id) = h.seed_enrollable_without_company(1, 0);
    let enrollment = h
        .service
        .enroll_contact(sequence_id, contact_id)
        .await
        .unwrap();

    h.drain().await;
    assert!(h.mailer.sent().is_empty());

    let queue = h.service.review_queue(10).await.unwrap();
    assert_eq!(queue.len(), 1);
    assert_eq!(queue[0].ai_confidence, 85);
    assert_eq!(queue[0].status, PendingEmailStatus::Pending);

    h.service.approve_pending_email(queue[0].id).await.unwrap();
    h.drain().await;

    assert_eq!(h.mailer.sent().len(), 1);
    let e = h.service.enrollment(enrollment.id).await.unwrap().unwrap();
    assert_eq!(e.status, EnrollmentStatus::Completed);

    // The draft moved on; a second approval has nothing to act on.
    let err = h
        .service
        .approve_pending_email(queue[0].id)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Conflict { .. }));
}

#[tokio::test]
async fn unapproved_send_trigger_parks_a_recheck() {
    let h = Harness::new();
    let (sequence_id, contact_id) = h.seed_enrollable_without_company(1, 0);
    let enrollment = h
        .service
        .enroll_contact(sequence_id, contact_id)
        .await
        .unwrap();
    h.drain().await;

    // A dispatcher-style trigger arrives while the draft is still in
    // review: nothing sends, a re-check is parked instead.
    h.engine
        .bus()
        .publish(EV_STEP_SEND, StepJob::new(enrollment.id, 1))
        .await
        .unwrap();
    h.drain().await;
    assert!(h.mailer.sent().is_empty());
    assert_eq!(h.store.pending_count(), 1);

    // Approval publishes under the same dedupe key, replacing the parked
    // re-check with an immediate trigger.
    let queue = h.service.review_queue(10).await.unwrap();
    h.service.approve_pending_email(queue[0].id).await.unwrap();
    assert_eq!(h.store.pending_count(), 1);

    h.drain().await;
    assert_eq!(h.mailer.sent().len(), 1);
    assert_eq!(h.store.pending_count(), 0);
}

#[tokio::test]
async fn rejected_draft_never_sends() {
    let h = Harness::new();
    let (sequence_id, contact_id) = h.seed_enrollable_without_company(1, 0);
    let enrollment = h
        .service
        .enroll_contact(sequence_id, contact_id)
        .await
        .unwrap();
    h.drain().await;

    let queue = h.service.review_queue(10).await.unwrap();
    h.service.reject_pending_email(queue[0].id).await.unwrap();

    h.engine
        .bus()
        .publish(EV_STEP_SEND, StepJob::new(enrollment.id, 1))
        .await
        .unwrap();
    h.drain().await;

    assert!(h.mailer.sent().is_empty());
    assert_eq!(h.store.pending_count(), 0);
    let email = h.service.pending_email(queue[0].id).await.unwrap().unwrap();
    assert_eq!(email.status, PendingEmailStatus::Rejected);
    // The enrollment stays active; rejection is not a halt.
    let e = h.service.enrollment(enrollment.id).await.unwrap().unwrap();
    assert_eq!(e.status, EnrollmentStatus::Active);
}

#[tokio::test]
async fn duplicate_send_trigger_is_ignored_after_send() {
    let h = Harness::new();
    let (sequence_id, contact_id) = h.seed_enrollable(3, 3);
    let enrollment = h
        .service
        .enroll_contact(sequence_id, contact_id)
        .await
        .unwrap();
    h.drain().await;
    assert_eq!(h.mailer.sent().len(), 1);

    // A stray second trigger for the already-sent step does nothing.
    h.engine
        .bus()
        .publish(EV_STEP_SEND, StepJob::new(enrollment.id, 1))
        .await
        .unwrap();
    h.drain().await;
    assert_eq!(h.mailer.sent().len(), 1);
}

#[tokio::test]
async fn interested_reply_halts_remaining_steps() {
    let h = Harness::with_fakes(
        ScriptedGenerator::new().classifying(ReplyCategory::Interested),
        FixedSpamChecker::new(0.0),
        RecordingMailSender::new(),
    );
    let (sequence_id, contact_id) = h.seed_enrollable(3, 3);
    let enrollment = h
        .service
        .enroll_contact(sequence_id, contact_id)
        .await
        .unwrap();
    h.drain().await;
    assert_eq!(h.mailer.sent().len(), 1);

    let interaction_id = h
        .service
        .record_reply(
            contact_id,
            "Re: Subject 1",
            "Sounds interesting, tell me more",
            h.store.now(),
        )
        .await
        .unwrap();
    h.drain().await;

    let e = h.service.enrollment(enrollment.id).await.unwrap().unwrap();
    assert_eq!(e.status, EnrollmentStatus::Replied);
    assert!(e.next_send_at.is_none());

    let interaction = h
        .repo
        .interactions_for(contact_id)
        .into_iter()
        .find(|i| i.id == interaction_id)
        .unwrap();
    assert_eq!(interaction.category, Some(ReplyCategory::Interested));
    assert_eq!(interaction.sentiment, Some(Sentiment::Positive));
    assert!(interaction.suggested_reply.is_some());

    // The parked next step wakes up and finds the enrollment halted.
    h.store.advance(THREE_DAYS);
    h.drain().await;
    assert_eq!(h.mailer.sent().len(), 1);
    assert_eq!(h.store.pending_count(), 0);
}

#[tokio::test]
async fn out_of_office_reply_keeps_sequence_running() {
    let h = Harness::with_fakes(
        ScriptedGenerator::new().classifying(ReplyCategory::OutOfOffice),
        FixedSpamChecker::new(0.0),
        RecordingMailSender::new(),
    );
    let (sequence_id, contact_id) = h.seed_enrollable(2, 3);
    let enrollment = h
        .service
        .enroll_contact(sequence_id, contact_id)
        .await
        .unwrap();
    h.drain().await;

    let interaction_id = h
        .service
        .record_reply(
            contact_id,
            "Automatic reply",
            "I am out of the office until next week",
            h.store.now(),
        )
        .await
        .unwrap();
    h.drain().await;

    // Annotated, but the sequence keeps going.
    let interaction = h
        .repo
        .interactions_for(contact_id)
        .into_iter()
        .find(|i| i.id == interaction_id)
        .unwrap();
    assert_eq!(interaction.category, Some(ReplyCategory::OutOfOffice));
    let e = h.service.enrollment(enrollment.id).await.unwrap().unwrap();
    assert_eq!(e.status, EnrollmentStatus::Active);

    h.store.advance(THREE_DAYS);
    h.drain().await;
    assert_eq!(h.mailer.sent().len(), 2);
    let e = h.service.enrollment(enrollment.id).await.unwrap().unwrap();
    assert_eq!(e.status, EnrollmentStatus::Completed);
}

#[tokio::test]
async fn unsubscribe_reply_halts_into_unsubscribed() {
    let h = Harness::with_fakes(
        ScriptedGenerator::new().classifying(ReplyCategory::Unsubscribe),
        FixedSpamChecker::new(0.0),
        RecordingMailSender::new(),
    );
    let (sequence_id, contact_id) = h.seed_enrollable(3, 3);
    let enrollment = h
        .service
        .enroll_contact(sequence_id, contact_id)
        .await
        .unwrap();
    h.drain().await;

    h.service
        .record_reply(contact_id, "Unsubscribe", "please remove me", h.store.now())
        .await
        .unwrap();
    h.drain().await;

    let e = h.service.enrollment(enrollment.id).await.unwrap().unwrap();
    assert_eq!(e.status, EnrollmentStatus::Unsubscribed);
}

#[tokio::test]
async fn pause_and_unsubscribe_respect_enrollment_state() {
    let h = Harness::new();
    let (sequence_id, contact_id) = h.seed_enrollable(3, 3);
    let enrollment = h
        .service
        .enroll_contact(sequence_id, contact_id)
        .await
        .unwrap();

    h.service.pause_enrollment(enrollment.id).await.unwrap();
    let e = h.service.enrollment(enrollment.id).await.unwrap().unwrap();
    assert_eq!(e.status, EnrollmentStatus::Paused);

    // Pausing twice conflicts; the enrollment already left `active`.
    let err = h.service.pause_enrollment(enrollment.id).await.unwrap_err();
    assert!(matches!(err, Error::Conflict { .. }));

    // Unsubscribing only touches active enrollments.
    assert_eq!(h.service.unsubscribe_contact(contact_id).await.unwrap(), 0);
}

#[tokio::test]
async fn generator_outage_retries_without_duplicate_work() {
    let h = Harness::with_fakes(
        ScriptedGenerator::new().failing_generations(2),
        FixedSpamChecker::new(0.0),
        RecordingMailSender::new(),
    );
    let (sequence_id, contact_id) = h.seed_enrollable(1, 0);
    let enrollment = h
        .service
        .enroll_contact(sequence_id, contact_id)
        .await
        .unwrap();

    h.drain_advancing(10, Duration::from_secs(30)).await;

    // Two failed attempts plus the success, but every other step ran once.
    assert_eq!(h.generator.generate_calls(), 3);
    assert_eq!(h.spam.calls(), 1);
    assert_eq!(h.mailer.sent().len(), 1);
    let e = h.service.enrollment(enrollment.id).await.unwrap().unwrap();
    assert_eq!(e.status, EnrollmentStatus::Completed);
}

#[tokio::test]
async fn flaky_mailer_retries_and_records_one_interaction() {
    let h = Harness::with_fakes(
        ScriptedGenerator::new(),
        FixedSpamChecker::new(0.0),
        RecordingMailSender::new().failing_sends(1),
    );
    let (sequence_id, contact_id) = h.seed_enrollable(1, 0);
    h.service
        .enroll_contact(sequence_id, contact_id)
        .await
        .unwrap();

    h.drain_advancing(10, Duration::from_secs(30)).await;

    assert_eq!(h.mailer.sent().len(), 1);
    let outbound = h.repo.interactions_for(contact_id);
    assert_eq!(outbound.len(), 1);
    assert_eq!(
        outbound[0].message_id.as_deref(),
        Some("msg-1"),
        "exactly one send recorded despite the retry"
    );
}

#[tokio::test]
async fn exhausted_retries_dead_letter_and_manual_retry_resumes() {
    let h = Harness::with_fakes(
        ScriptedGenerator::new().failing_generations(5),
        FixedSpamChecker::new(0.0),
        RecordingMailSender::new(),
    );
    let (sequence_id, contact_id) = h.seed_enrollable(1, 0);
    h.service
        .enroll_contact(sequence_id, contact_id)
        .await
        .unwrap();

    h.drain_advancing(20, Duration::from_secs(60)).await;
    assert!(h.mailer.sent().is_empty());
    assert_eq!(h.generator.generate_calls(), 5);

    let query = DeadLetterQuery::new().event_name(outflow::event::EV_STEP_GENERATE);
    let letters = h.engine.dead_letters(&query).await.unwrap();
    assert_eq!(letters.len(), 1);
    assert!(letters[0]
        .last_error
        .as_deref()
        .unwrap()
        .contains("generator unavailable"));
    assert_eq!(h.engine.dead_letter_count(&query).await.unwrap(), 1);

    // The generator has recovered; requeue the event. The run's ledger
    // survives, so the steps completed before the outage do not rerun.
    assert!(h.engine.retry_dead_letter(letters[0].id).await.unwrap());
    h.drain_advancing(10, Duration::from_secs(60)).await;

    assert_eq!(h.generator.generate_calls(), 6);
    assert_eq!(h.spam.calls(), 1);
    assert_eq!(h.mailer.sent().len(), 1);
    assert_eq!(h.engine.dead_letter_count(&query).await.unwrap(), 0);
}

#[tokio::test]
async fn daily_cap_queues_sends_instead_of_dropping() {
    let h = Harness::new();
    let sequence_id = Uuid::now_v7();
    let mut sequence = fixtures::sequence(sequence_id, 1, 0);
    sequence.settings.daily_cap = 1;
    h.repo.put_sequence(sequence);

    let company_id = Uuid::now_v7();
    h.repo.put_company(Company {
        id: company_id,
        name: "Acme Robotics".to_string(),
        industry: None,
        description: None,
    });
    let contact_a = Uuid::now_v7();
    let contact_b = Uuid::now_v7();
    h.repo
        .put_contact(fixtures::contact(contact_a, Some(company_id)));
    h.repo
        .put_contact(fixtures::contact(contact_b, Some(company_id)));

    h.service.enroll_contact(sequence_id, contact_a).await.unwrap();
    h.service.enroll_contact(sequence_id, contact_b).await.unwrap();
    h.drain().await;

    // One send fits under the cap; the other is queued, not dropped.
    assert_eq!(h.mailer.sent().len(), 1);
    assert_eq!(h.store.pending_count(), 1);

    // Next day the cap window resets and the queued send goes out.
    h.store.advance(Duration::from_secs(24 * 60 * 60));
    h.drain().await;
    assert_eq!(h.mailer.sent().len(), 2);
    assert_eq!(h.store.pending_count(), 0);
}

#[tokio::test]
async fn terminal_enrollments_cannot_be_revived() {
    let h = Harness::new();
    let (sequence_id, contact_id) = h.seed_enrollable(1, 0);
    let enrollment = h
        .service
        .enroll_contact(sequence_id, contact_id)
        .await
        .unwrap();
    h.drain().await;

    let e = h.service.enrollment(enrollment.id).await.unwrap().unwrap();
    assert_eq!(e.status, EnrollmentStatus::Completed);

    // No conditional update moves a terminal enrollment anywhere.
    assert!(!h
        .repo
        .transition_enrollment(e.id, EnrollmentStatus::Completed, EnrollmentStatus::Active)
        .await
        .unwrap());
    assert!(!h
        .repo
        .advance_enrollment(e.id, 5, h.store.now())
        .await
        .unwrap());
    let err = h.service.pause_enrollment(e.id).await.unwrap_err();
    assert!(matches!(err, Error::Conflict { .. }));
}

#[tokio::test]
async fn step_advancement_is_monotonic() {
    let h = Harness::new();
    let (sequence_id, contact_id) = h.seed_enrollable(3, 3);
    let enrollment = h
        .service
        .enroll_contact(sequence_id, contact_id)
        .await
        .unwrap();
    h.drain().await;

    // Now on step 2; neither a rewind nor a same-step write is accepted.
    let e = h.service.enrollment(enrollment.id).await.unwrap().unwrap();
    assert_eq!(e.current_step, 2);
    assert!(!h
        .repo
        .advance_enrollment(e.id, 1, h.store.now())
        .await
        .unwrap());
    assert!(!h
        .repo
        .advance_enrollment(e.id, 2, h.store.now())
        .await
        .unwrap());
    assert!(h
        .repo
        .advance_enrollment(e.id, 3, h.store.now())
        .await
        .unwrap());
}
