//! Scripted capability fakes with call counting.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;

use outflow::capability::{
    ContentGenerator, EmailContext, GeneratedEmail, MailSender, ReplyClassification,
    SendReceipt, SpamChecker, SpamVerdict,
};
use outflow::model::{Contact, Meeting, ReplyCategory};

/// Content generator producing deterministic drafts from the step
/// templates. Can be scripted to fail its first N calls.
#[derive(Clone, Default)]
pub struct ScriptedGenerator {
    inner: Arc<Mutex<GeneratorState>>,
}

#[derive(Default)]
struct GeneratorState {
    generate_calls: u32,
    classify_calls: u32,
    fail_generations: u32,
    fail_classifications: u32,
    classification: Option<ReplyCategory>,
}

impl ScriptedGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, GeneratorState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Fail the next `n` generation calls with a transient-looking error.
    pub fn failing_generations(self, n: u32) -> Self {
        self.lock().fail_generations = n;
        self
    }

    /// Fail the next `n` classification calls.
    pub fn failing_classifications(self, n: u32) -> Self {
        self.lock().fail_classifications = n;
        self
    }

    /// Classify every reply into `category`.
    pub fn classifying(self, category: ReplyCategory) -> Self {
        self.lock().classification = Some(category);
        self
    }

    pub fn generate_calls(&self) -> u32 {
        self.lock().generate_calls
    }

    pub fn classify_calls(&self) -> u32 {
        self.lock().classify_calls
    }
}

#[async_trait]
impl ContentGenerator for ScriptedGenerator {
    type Error = String;

    async fn generate_email(
        &self,
        context: &EmailContext,
    ) -> Result<GeneratedEmail, Self::Error> {
        let mut state = self.lock();
        state.generate_calls += 1;
        if state.fail_generations > 0 {
            state.fail_generations -= 1;
            return Err("generator unavailable".to_string());
        }
        Ok(GeneratedEmail {
            subject: context.step.subject_template.clone(),
            body: format!(
                "Hi {}, {}",
                context.contact.first_name, context.step.body_template
            ),
            tokens_used: 120,
        })
    }

    async fn classify_reply(&self, _text: &str) -> Result<ReplyClassification, Self::Error> {
        let mut state = self.lock();
        state.classify_calls += 1;
        if state.fail_classifications > 0 {
            state.fail_classifications -= 1;
            return Err("classifier unavailable".to_string());
        }
        Ok(ReplyClassification {
            category: state.classification.unwrap_or(ReplyCategory::Other),
            confidence: 0.92,
        })
    }

    async fn meeting_notes(
        &self,
        meeting: &Meeting,
        contact: &Contact,
    ) -> Result<String, Self::Error> {
        Ok(format!(
            "Prep for {}: meeting {} {}",
            meeting.title, contact.first_name, contact.last_name
        ))
    }
}

/// Spam checker returning a fixed score.
#[derive(Clone)]
pub struct FixedSpamChecker {
    score: f64,
    calls: Arc<AtomicU32>,
}

impl FixedSpamChecker {
    pub fn new(score: f64) -> Self {
        Self {
            score,
            calls: Arc::new(AtomicU32::new(0)),
        }
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SpamChecker for FixedSpamChecker {
    type Error = String;

    async fn check(&self, _subject: &str, _body: &str) -> Result<SpamVerdict, Self::Error> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(SpamVerdict {
            score: self.score,
            flags: Vec::new(),
        })
    }
}

/// One recorded outbound send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentMail {
    pub to: String,
    pub subject: String,
    pub body: String,
}

/// Mail sender that records every send. Can be scripted to fail its
/// first N calls.
#[derive(Clone, Default)]
pub struct RecordingMailSender {
    sent: Arc<Mutex<Vec<SentMail>>>,
    fail_next: Arc<AtomicU32>,
}

impl RecordingMailSender {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `n` sends.
    pub fn failing_sends(self, n: u32) -> Self {
        self.fail_next.store(n, Ordering::SeqCst);
        self
    }

    pub fn sent(&self) -> Vec<SentMail> {
        self.sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl MailSender for RecordingMailSender {
    type Error = String;

    async fn send(
        &self,
        to: &str,
        subject: &str,
        body: &str,
    ) -> Result<SendReceipt, Self::Error> {
        if self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err("smtp connection reset".to_string());
        }
        let mut sent = self.sent.lock().unwrap_or_else(PoisonError::into_inner);
        sent.push(SentMail {
            to: to.to_string(),
            subject: subject.to_string(),
            body: body.to_string(),
        });
        Ok(SendReceipt {
            message_id: format!("msg-{}", sent.len()),
        })
    }
}
