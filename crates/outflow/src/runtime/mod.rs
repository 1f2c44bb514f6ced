//! Worker runtime: polling loops, retry policy, configuration.

mod config;
mod cron_worker;
mod delivery_worker;
mod retry;

pub use config::RuntimeConfig;
pub use retry::RetryPolicy;

pub(crate) use cron_worker::CronWorker;
pub(crate) use delivery_worker::{process_one, DeliveryWorker};
