//! Narrow contracts for the external collaborators the engine consumes.
//!
//! These are implemented outside this crate (LLM provider, spam service,
//! Gmail/Outlook client, Redis). The engine treats every failure from a
//! capability as transient and lets the bus retry with backoff; capability
//! clients are responsible for their own request timeouts.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::model::{Company, Contact, Meeting, ReplyCategory, SequenceStep};

/// Structured context handed to the content generator for one step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailContext {
    pub contact: Contact,
    pub company: Option<Company>,
    pub sequence_name: String,
    pub step: SequenceStep,
    /// Subjects of emails previously sent to this contact, bounded lookback.
    pub prior_subjects: Vec<String>,
    pub ab_variant: Option<String>,
}

/// A generated draft.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GeneratedEmail {
    pub subject: String,
    pub body: String,
    pub tokens_used: u32,
}

/// Closed-set classification of an inbound reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplyClassification {
    pub category: ReplyCategory,
    /// Classifier confidence in [0, 1].
    pub confidence: f64,
}

/// Content-generation capability. Must be side-effect-free and retryable.
#[async_trait]
pub trait ContentGenerator: Send + Sync + 'static {
    type Error: std::fmt::Display + Send;

    /// Draft one outreach email from structured context.
    async fn generate_email(&self, context: &EmailContext)
        -> Result<GeneratedEmail, Self::Error>;

    /// Classify an inbound reply into the closed category set.
    async fn classify_reply(&self, text: &str) -> Result<ReplyClassification, Self::Error>;

    /// Draft prep notes for an upcoming meeting.
    async fn meeting_notes(
        &self,
        meeting: &Meeting,
        contact: &Contact,
    ) -> Result<String, Self::Error>;
}

/// Spam verdict for a drafted subject + body.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SpamVerdict {
    pub score: f64,
    pub flags: Vec<String>,
}

#[async_trait]
pub trait SpamChecker: Send + Sync + 'static {
    type Error: std::fmt::Display + Send;

    async fn check(&self, subject: &str, body: &str) -> Result<SpamVerdict, Self::Error>;
}

/// Receipt from the external mail provider.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SendReceipt {
    pub message_id: String,
}

/// External email dispatch. Failures are transient and retryable unless the
/// address is confirmed-bounced, which surfaces through the bounce-check job
/// rather than the send path.
#[async_trait]
pub trait MailSender: Send + Sync + 'static {
    type Error: std::fmt::Display + Send;

    async fn send(&self, to: &str, subject: &str, body: &str)
        -> Result<SendReceipt, Self::Error>;
}

/// Optional enrichment-result cache. A miss is never an error; a failed
/// write is logged and ignored by callers.
#[async_trait]
pub trait Cache: Send + Sync + 'static {
    async fn get(&self, key: &str) -> Option<Value>;
    async fn set(&self, key: &str, value: Value, ttl_seconds: u64);
}

/// Cache that stores nothing. The default for deployments without Redis.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopCache;

#[async_trait]
impl Cache for NoopCache {
    async fn get(&self, _key: &str) -> Option<Value> {
        None
    }

    async fn set(&self, _key: &str, _value: Value, _ttl_seconds: u64) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn noop_cache_always_misses() {
        let cache = NoopCache;
        cache.set("k", Value::from(1), 60).await;
        assert!(cache.get("k").await.is_none());
    }
}
