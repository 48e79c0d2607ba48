pub mod attempt_ctx;
pub mod backoff;
pub mod submission_flow;

pub use attempt_ctx::AttemptCtx;
pub use backoff::BackoffPolicy;
pub use submission_flow::{AttemptResult, ClaimOutcome, SubmissionEngine, SubmissionLimits};
