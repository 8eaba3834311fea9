pub mod lifecycle;
pub mod router;

pub use lifecycle::{CommStatus, Intent, Scope};
pub use router::{EscalationRouter, RuleTriage, TriageDecider, TriageDecision, TriageOutcome};
