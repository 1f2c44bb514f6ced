//! Rate and concurrency governance per workflow type.
//!
//! Admission happens after an event is claimed and before its handler
//! runs. A run that exceeds a limit waits for capacity; nothing is ever
//! dropped. Limits apply per workflow type, so a burst of step sends
//! cannot starve reply processing.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tracing::debug;

/// Sliding-window rate limit: at most `limit` admissions per `period`.
#[derive(Debug, Clone, Copy)]
pub struct Throttle {
    pub limit: u32,
    pub period: Duration,
}

/// Limits applied to one workflow type.
#[derive(Debug, Clone, Copy, Default)]
pub struct WorkflowLimits {
    /// Rate limit on admissions. `None` means unlimited.
    pub throttle: Option<Throttle>,
    /// Ceiling on concurrently executing runs. `None` means unlimited.
    pub max_concurrent: Option<u32>,
}

impl WorkflowLimits {
    pub fn throttled(limit: u32, period: Duration) -> Self {
        Self {
            throttle: Some(Throttle { limit, period }),
            max_concurrent: None,
        }
    }

    pub fn max_concurrent(mut self, ceiling: u32) -> Self {
        self.max_concurrent = Some(ceiling);
        self
    }
}

#[derive(Debug)]
struct Window {
    started: Instant,
    used: u32,
}

#[derive(Debug)]
struct Lane {
    throttle: Option<(Throttle, Mutex<Window>)>,
    semaphore: Option<Arc<Semaphore>>,
}

/// Per-workflow-type admission control.
#[derive(Debug, Default)]
pub struct Governor {
    lanes: HashMap<String, Lane>,
}

/// Held for the duration of a governed run. Dropping it releases the
/// concurrency slot; rate-limit tokens are not returned.
#[derive(Debug, Default)]
pub struct GovernorPermit {
    _concurrency: Option<OwnedSemaphorePermit>,
}

impl Governor {
    pub fn new(limits: HashMap<String, WorkflowLimits>) -> Self {
        let lanes = limits
            .into_iter()
            .map(|(workflow, limits)| {
                let throttle = limits.throttle.map(|t| {
                    (
                        t,
                        Mutex::new(Window {
                            started: Instant::now(),
                            used: 0,
                        }),
                    )
                });
                let semaphore = limits
                    .max_concurrent
                    .map(|n| Arc::new(Semaphore::new(n as usize)));
                (workflow, Lane { throttle, semaphore })
            })
            .collect();
        Self { lanes }
    }

    /// Wait until the workflow type has capacity, then take a permit.
    pub async fn admit(&self, workflow: &str) -> GovernorPermit {
        let Some(lane) = self.lanes.get(workflow) else {
            return GovernorPermit::default();
        };

        if let Some((throttle, window)) = &lane.throttle {
            loop {
                let wait = {
                    let mut window = window.lock().await;
                    let now = Instant::now();
                    if now.duration_since(window.started) >= throttle.period {
                        window.started = now;
                        window.used = 0;
                    }
                    if window.used < throttle.limit {
                        window.used += 1;
                        None
                    } else {
                        Some(window.started + throttle.period - now)
                    }
                };
                match wait {
                    None => break,
                    Some(until_reset) => {
                        debug!(workflow, wait = ?until_reset, "rate limit reached, queuing");
                        tokio::time::sleep(until_reset).await;
                    }
                }
            }
        }

        let concurrency = match &lane.semaphore {
            Some(semaphore) => Arc::clone(semaphore).acquire_owned().await.ok(),
            None => None,
        };
        GovernorPermit {
            _concurrency: concurrency,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn governor_with(workflow: &str, limits: WorkflowLimits) -> Governor {
        Governor::new(HashMap::from([(workflow.to_string(), limits)]))
    }

    #[tokio::test]
    async fn unknown_workflow_is_unlimited() {
        let governor = Governor::default();
        for _ in 0..100 {
            governor.admit("anything").await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn throttle_queues_until_window_resets() {
        let governor = governor_with(
            "step-send",
            WorkflowLimits::throttled(2, Duration::from_secs(60)),
        );

        governor.admit("step-send").await;
        governor.admit("step-send").await;

        // Third admission must wait out the window.
        let start = Instant::now();
        governor.admit("step-send").await;
        assert!(start.elapsed() >= Duration::from_secs(59));
    }

    #[tokio::test]
    async fn concurrency_ceiling_blocks_third_run() {
        let governor = Arc::new(governor_with(
            "step-send",
            WorkflowLimits::default().max_concurrent(2),
        ));

        let a = governor.admit("step-send").await;
        let _b = governor.admit("step-send").await;

        let blocked = tokio::time::timeout(
            Duration::from_millis(50),
            governor.admit("step-send"),
        )
        .await;
        assert!(blocked.is_err());

        // Releasing a permit unblocks the waiter.
        drop(a);
        let admitted = tokio::time::timeout(
            Duration::from_millis(50),
            governor.admit("step-send"),
        )
        .await;
        assert!(admitted.is_ok());
    }
}
