//! Run lifecycle: the status machine, the driving loop and recovery.

pub mod controller;
pub mod drivers;
pub mod escalation;
pub mod prompts;
pub mod recovery;
pub mod status;

pub use controller::{Collaborators, PatchRunRequest, RunController, SecurityVerdict};
pub use escalation::{EscalationPayload, InputRequest};
pub use recovery::{ProcessProbe, SystemProbe};
pub use status::{ReviewerVerdict, RunEvent, RunStatus, TriggeredBy};
