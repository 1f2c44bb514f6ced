//! Cron worker: fires scheduled jobs and fans them out onto the bus.

use tokio::sync::watch;
use tokio::time::interval;
use tracing::{error, info};

use crate::engine::Engine;
use crate::store::Store;

/// Checks cron schedules on an interval and publishes fan-out events for
/// every cadence that has come due.
///
/// Last-fired bookkeeping lives in the store, so a restarted process picks
/// up where it left off instead of re-firing. A job seen for the first
/// time is initialized to "fired now" — past occurrences are never
/// replayed.
pub(crate) struct CronWorker<S: Store> {
    engine: Engine<S>,
}

impl<S: Store> CronWorker<S> {
    pub fn new(engine: Engine<S>) -> Self {
        Self { engine }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut poll = interval(self.engine.config().cron_poll_interval);
        poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        info!("cron worker started");

        loop {
            tokio::select! {
                _ = poll.tick() => {
                    if let Err(err) = self.engine.tick_cron().await {
                        error!(error = %err, "error firing cron jobs");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("cron worker shutting down");
                        break;
                    }
                }
            }
        }
    }
}
