pub mod events;
pub mod evidence;
pub mod follow_up;
pub mod pacing;
pub mod portal;
pub mod sanitizer;

pub use events::{ChannelSink, EventSink, FanoutSink, LogSink, WebhookSink};
pub use evidence::{EvidenceRecorder, EvidenceStore, FsEvidenceStore, MemoryEvidenceStore, Snapshot};
pub use follow_up::FollowUpWriter;
pub use pacing::{pause, FixedPacing, JitterPacing, PacingModel, PacingProfile, StepKind};
pub use portal::{Confirmation, ExternalStatus, PhoenixPortal, PortalDriver, PortalSession, StatusClass};
pub use sanitizer::{Sanitized, Sanitizer, Violation, ViolationKind};
