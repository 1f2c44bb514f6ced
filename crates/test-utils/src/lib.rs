//! Test support for outflow: an in-memory [`PersistenceStore`], scripted
//! capability fakes, and fixture builders.
//!
//! [`PersistenceStore`]: outflow::PersistenceStore

mod fakes;
mod repo;

pub mod fixtures;

pub use fakes::{FixedSpamChecker, RecordingMailSender, ScriptedGenerator, SentMail};
pub use repo::MemRepo;

/// Install a test tracing subscriber that respects `RUST_LOG`.
///
/// Safe to call from every test; only the first call wins.
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
