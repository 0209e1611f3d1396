//! Allocation feedback
//!
//! Outcomes of bindings (accepted, rejected by the offer, reclaimed) are
//! recorded once each and fed back into the scoring model in batches.

mod record;
mod recorder;
mod worker;

pub use record::{record_id, FeedbackOutcome, FeedbackRecord};
pub use recorder::{AppliedBatch, FeedbackRecorder};
pub use worker::FeedbackWorker;
