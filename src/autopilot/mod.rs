//! Unattended run selection per project.

pub mod engine;
pub mod policy;

pub use engine::{AutopilotEngine, AutopilotState, AutopilotStatus, AutopilotTick};
pub use policy::select_candidate;
