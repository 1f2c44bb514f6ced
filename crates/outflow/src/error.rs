//! Error types for outflow.

use thiserror::Error;

/// A `Result` alias with [`enum@Error`] as the error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in outflow operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Failed to serialize or deserialize an event payload or ledger entry.
    ///
    /// This typically indicates a mismatch between a stored payload and the
    /// current payload type definition.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A referenced entity does not exist.
    ///
    /// This is a data-integrity error: it is never retried and surfaces via
    /// the dead-letter queue when raised inside a workflow run.
    #[error("{entity} not found: {id}")]
    NotFound {
        /// Entity kind (e.g. "enrollment", "sequence").
        entity: &'static str,
        /// The id that failed to resolve.
        id: String,
    },

    /// A contact already has a non-terminal enrollment in the sequence.
    #[error("contact {contact_id} already enrolled in sequence {sequence_id}")]
    AlreadyEnrolled {
        contact_id: uuid::Uuid,
        sequence_id: uuid::Uuid,
    },

    /// A conditional update found the entity in an unexpected state.
    #[error("conflict on {entity} {id}: {detail}")]
    Conflict {
        entity: &'static str,
        id: String,
        detail: String,
    },

    /// A sequence definition violates its structural invariants
    /// (non-contiguous step numbers, negative delays).
    #[error("invalid sequence: {0}")]
    InvalidSequence(String),

    /// A cron expression failed to parse at registration time.
    #[error("invalid cron expression {expression:?}: {detail}")]
    InvalidCronExpression { expression: String, detail: String },

    /// An event name was subscribed to more than once.
    #[error("duplicate subscription for event: {0}")]
    DuplicateSubscription(String),

    /// PostgreSQL storage error.
    ///
    /// Preserves the full `sqlx::Error` for matching on specific database
    /// error conditions (connection timeout, constraint violation, etc.).
    #[cfg(feature = "postgres")]
    #[error("postgres error: {0}")]
    Postgres(#[from] sqlx::Error),

    /// Repository (domain persistence) failure reported by the collaborator.
    #[error("persistence store error: {0}")]
    Repository(String),
}

impl Error {
    /// Create a not-found error with context.
    pub fn not_found(entity: &'static str, id: impl std::fmt::Display) -> Self {
        Error::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    /// Create a conflict error with context.
    pub fn conflict(
        entity: &'static str,
        id: impl std::fmt::Display,
        detail: impl Into<String>,
    ) -> Self {
        Error::Conflict {
            entity,
            id: id.to_string(),
            detail: detail.into(),
        }
    }
}
