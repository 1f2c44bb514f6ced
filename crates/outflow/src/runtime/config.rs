//! Runtime configuration.

use std::time::Duration;

use super::RetryPolicy;

/// Configuration for the engine's worker runtime.
///
/// Controls polling intervals, lock durations, retry behavior, and worker
/// concurrency.
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use outflow::RuntimeConfig;
///
/// let config = RuntimeConfig {
///     delivery_poll_interval: Duration::from_millis(100),
///     delivery_workers: 4, // Process up to 4 events in parallel
///     ..Default::default()
/// };
/// ```
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// How often each delivery worker polls for due events.
    ///
    /// Lower values reduce latency but increase store load.
    /// Default: 100ms.
    pub delivery_poll_interval: Duration,

    /// How often the cron worker checks schedules.
    ///
    /// Cron precision is limited by this interval. The finest standard
    /// cadence is 15 minutes, so the default is generous.
    /// Default: 30 seconds.
    pub cron_poll_interval: Duration,

    /// How long to hold a lock on a claimed event while processing.
    ///
    /// Should be longer than the longest expected handler execution.
    /// If a worker crashes, the event becomes available again after this
    /// duration. Default: 5 minutes.
    pub delivery_lock_duration: Duration,

    /// Maximum time to wait for in-flight runs during shutdown.
    ///
    /// After this timeout, remaining workers are aborted.
    /// Default: 30 seconds.
    pub shutdown_timeout: Duration,

    /// Retry policy for transient handler failures.
    pub retry_policy: RetryPolicy,

    /// Worker identifier prefix for distributed coordination.
    ///
    /// Used in the `locked_by` field to identify which worker holds a
    /// lock. If `None`, a UUID is generated at engine build time.
    pub worker_id: Option<String>,

    /// Number of delivery workers to spawn.
    ///
    /// Each worker polls the store independently; `FOR UPDATE SKIP LOCKED`
    /// (or the in-memory equivalent) keeps them from claiming the same
    /// event twice. Default: 1.
    pub delivery_workers: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            delivery_poll_interval: Duration::from_millis(100),
            cron_poll_interval: Duration::from_secs(30),
            delivery_lock_duration: Duration::from_secs(300),
            shutdown_timeout: Duration::from_secs(30),
            retry_policy: RetryPolicy::default(),
            worker_id: None,
            delivery_workers: 1,
        }
    }
}
