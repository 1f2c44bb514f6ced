//! The durable workflows subscribed to the bus.
//!
//! Every handler follows the same shape: fresh guard reads up front
//! (enrollment still active? approval still standing?), then side effects
//! inside ledgered steps, then buffered follow-up events. Guards are
//! deliberately outside the ledger so a retry re-checks the world instead
//! of trusting a stale snapshot.

mod fleet;
mod reply;
mod step_generate;
mod step_send;

pub use fleet::{
    deal_score, BounceCheckHandler, DailyRollupHandler, DealScoreHandler, MeetingPrepHandler,
};
pub use reply::ReplyHandler;
pub use step_generate::StepGenerateHandler;
pub use step_send::StepSendHandler;

/// Workflow type names, used as governance keys.
pub const WF_STEP_GENERATE: &str = "step-generate";
pub const WF_STEP_SEND: &str = "step-send";
pub const WF_REPLY: &str = "reply";
pub const WF_DAILY_ROLLUP: &str = "daily-rollup";
pub const WF_BOUNCE_CHECK: &str = "bounce-check";
pub const WF_MEETING_PREP: &str = "meeting-prep";
pub const WF_DEAL_SCORE: &str = "deal-score";
