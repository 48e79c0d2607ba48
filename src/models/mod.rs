pub mod attempt;
pub mod event;
pub mod evidence;
pub mod loaders;
pub mod report_type;
pub mod request;
pub mod state;

pub use attempt::{Attempt, AttemptId, AttemptOutcome};
pub use event::TransitionEvent;
pub use evidence::{EvidenceId, EvidenceRecord};
pub use loaders::{load_all_intake_files, load_intake_file, IntakeRequest};
pub use report_type::ReportType;
pub use request::{ExternalRef, Priority, Request, RequestFields, RequestId, Requestor};
pub use state::LifecycleState;
