//! Per-intent communication lifecycles.

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum Intent {
    Escalation,
    Request,
    Message,
    Suggestion,
    Status,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum Scope {
    Project,
    Global,
    User,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum CommStatus {
    Open,
    Claimed,
    Resolved,
    EscalatedToUser,
    Accepted,
    Declined,
    Read,
    Acknowledged,
    Closed,
}

impl CommStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommStatus::Open => "open",
            CommStatus::Claimed => "claimed",
            CommStatus::Resolved => "resolved",
            CommStatus::EscalatedToUser => "escalated_to_user",
            CommStatus::Accepted => "accepted",
            CommStatus::Declined => "declined",
            CommStatus::Read => "read",
            CommStatus::Acknowledged => "acknowledged",
            CommStatus::Closed => "closed",
        }
    }

    /// Stamps `resolved_at` when reached.
    pub fn is_final(&self) -> bool {
        matches!(self, CommStatus::Resolved | CommStatus::Closed)
    }
}

impl fmt::Display for CommStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Intent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Intent::Escalation => "escalation",
            Intent::Request => "request",
            Intent::Message => "message",
            Intent::Suggestion => "suggestion",
            Intent::Status => "status",
        }
    }

    pub fn can_transition(&self, from: CommStatus, to: CommStatus) -> bool {
        use CommStatus::*;

        match self {
            Intent::Escalation => matches!(
                (from, to),
                (Open, Claimed)
                    | (Open, Resolved)
                    | (Open, EscalatedToUser)
                    | (Claimed, Resolved)
                    | (Claimed, EscalatedToUser)
                    | (EscalatedToUser, Resolved)
            ),
            Intent::Request => matches!(
                (from, to),
                (Open, Accepted)
                    | (Open, Declined)
                    | (Open, Closed)
                    | (Accepted, Closed)
                    | (Declined, Closed)
            ),
            Intent::Message | Intent::Suggestion | Intent::Status => matches!(
                (from, to),
                (Open, Read)
                    | (Open, Closed)
                    | (Read, Acknowledged)
                    | (Read, Closed)
                    | (Acknowledged, Closed)
            ),
        }
    }

    /// Status a direct resolution lands in for this intent.
    pub fn resolved_status(&self) -> CommStatus {
        match self {
            Intent::Escalation => CommStatus::Resolved,
            _ => CommStatus::Closed,
        }
    }
}

impl fmt::Display for Intent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_escalation_lifecycle() {
        let e = Intent::Escalation;
        assert!(e.can_transition(CommStatus::Open, CommStatus::Claimed));
        assert!(e.can_transition(CommStatus::Claimed, CommStatus::EscalatedToUser));
        assert!(e.can_transition(CommStatus::EscalatedToUser, CommStatus::Resolved));
        assert!(!e.can_transition(CommStatus::Resolved, CommStatus::Open));
        assert!(!e.can_transition(CommStatus::EscalatedToUser, CommStatus::Claimed));
        assert!(!e.can_transition(CommStatus::Open, CommStatus::Read));
    }

    #[test]
    fn test_request_lifecycle() {
        let r = Intent::Request;
        assert!(r.can_transition(CommStatus::Open, CommStatus::Accepted));
        assert!(r.can_transition(CommStatus::Declined, CommStatus::Closed));
        assert!(!r.can_transition(CommStatus::Accepted, CommStatus::Declined));
        assert!(!r.can_transition(CommStatus::Open, CommStatus::Claimed));
    }

    #[test]
    fn test_message_acknowledge_is_optional() {
        for intent in [Intent::Message, Intent::Suggestion, Intent::Status] {
            assert!(intent.can_transition(CommStatus::Read, CommStatus::Closed));
            assert!(intent.can_transition(CommStatus::Read, CommStatus::Acknowledged));
            assert!(intent.can_transition(CommStatus::Acknowledged, CommStatus::Closed));
            assert!(!intent.can_transition(CommStatus::Open, CommStatus::Acknowledged));
        }
    }
}
