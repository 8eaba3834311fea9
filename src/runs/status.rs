//! Run status machine. Every status change a run can go through is an
//! edge in [`RunStatus::apply`]; anything else is rejected.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::database::work_orders::WorkOrderStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum RunStatus {
    Queued,
    BaselineFailed,
    Building,
    WaitingForInput,
    SecurityHold,
    AiReview,
    Testing,
    YouReview,
    Merged,
    MergeConflict,
    Failed,
    Canceled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunEvent {
    /// Worktree ready, builder about to be spawned
    Start,
    BaselineFailed,
    EscalationRaised,
    InputProvided,
    BuildCompleted,
    TestsFailed,
    TestsPassed,
    ChangesRequested,
    ReviewApproved,
    IterationLimit,
    SecurityFlagged,
    SecurityCleared,
    SecurityRejected,
    MergeSucceeded,
    MergeConflicted,
    ConflictResolved,
    OperationalFailure,
    Orphaned,
    Cancel,
}

impl RunStatus {
    pub const ALL: [RunStatus; 12] = [
        RunStatus::Queued,
        RunStatus::BaselineFailed,
        RunStatus::Building,
        RunStatus::WaitingForInput,
        RunStatus::SecurityHold,
        RunStatus::AiReview,
        RunStatus::Testing,
        RunStatus::YouReview,
        RunStatus::Merged,
        RunStatus::MergeConflict,
        RunStatus::Failed,
        RunStatus::Canceled,
    ];

    /// Statuses a reconciliation pass treats as "a subprocess should be alive".
    pub const SUPERVISED: [RunStatus; 3] =
        [RunStatus::Building, RunStatus::Testing, RunStatus::AiReview];

    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Queued => "queued",
            RunStatus::BaselineFailed => "baseline_failed",
            RunStatus::Building => "building",
            RunStatus::WaitingForInput => "waiting_for_input",
            RunStatus::SecurityHold => "security_hold",
            RunStatus::AiReview => "ai_review",
            RunStatus::Testing => "testing",
            RunStatus::YouReview => "you_review",
            RunStatus::Merged => "merged",
            RunStatus::MergeConflict => "merge_conflict",
            RunStatus::Failed => "failed",
            RunStatus::Canceled => "canceled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Merged | RunStatus::Failed | RunStatus::Canceled
        )
    }

    /// The status this run moves to on `event`, if that edge exists.
    pub fn apply(self, event: RunEvent) -> Option<RunStatus> {
        use RunEvent as E;
        use RunStatus as S;

        if self.is_terminal() {
            return None;
        }

        match (self, event) {
            (_, E::Cancel) => Some(S::Canceled),
            (S::SecurityHold, E::SecurityFlagged) => None,
            (_, E::SecurityFlagged) => Some(S::SecurityHold),

            (S::Queued, E::Start) => Some(S::Building),
            (S::Queued, E::OperationalFailure) => Some(S::Failed),

            (S::Building, E::BaselineFailed) => Some(S::BaselineFailed),
            (S::Building, E::EscalationRaised) => Some(S::WaitingForInput),
            (S::Building, E::BuildCompleted) => Some(S::Testing),
            (S::WaitingForInput, E::InputProvided) => Some(S::Building),

            (S::Testing, E::TestsPassed) => Some(S::AiReview),
            (S::Testing, E::TestsFailed) => Some(S::Building),

            (S::AiReview, E::ReviewApproved) => Some(S::YouReview),
            (S::AiReview, E::ChangesRequested) => Some(S::Building),
            (S::Testing | S::AiReview, E::IterationLimit) => Some(S::Failed),

            (S::SecurityHold, E::SecurityCleared) => Some(S::YouReview),
            (S::SecurityHold, E::SecurityRejected) => Some(S::Failed),

            (S::AiReview | S::YouReview, E::MergeSucceeded) => Some(S::Merged),
            (S::AiReview | S::YouReview, E::MergeConflicted) => Some(S::MergeConflict),
            (S::MergeConflict, E::ConflictResolved) => Some(S::Merged),

            (S::Building | S::Testing | S::AiReview, E::OperationalFailure) => Some(S::Failed),
            (S::Building | S::Testing | S::AiReview, E::Orphaned) => Some(S::Failed),

            _ => None,
        }
    }

    /// Work order status that mirrors a run sitting in this status.
    pub fn work_order_status(&self) -> WorkOrderStatus {
        match self {
            RunStatus::Queued
            | RunStatus::Building
            | RunStatus::Testing
            | RunStatus::WaitingForInput => WorkOrderStatus::Building,
            RunStatus::AiReview => WorkOrderStatus::AiReview,
            RunStatus::YouReview | RunStatus::MergeConflict => WorkOrderStatus::YouReview,
            RunStatus::BaselineFailed | RunStatus::SecurityHold => WorkOrderStatus::Blocked,
            RunStatus::Merged => WorkOrderStatus::Done,
            RunStatus::Failed | RunStatus::Canceled => WorkOrderStatus::Ready,
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl RunEvent {
    pub const ALL: [RunEvent; 19] = [
        RunEvent::Start,
        RunEvent::BaselineFailed,
        RunEvent::EscalationRaised,
        RunEvent::InputProvided,
        RunEvent::BuildCompleted,
        RunEvent::TestsFailed,
        RunEvent::TestsPassed,
        RunEvent::ChangesRequested,
        RunEvent::ReviewApproved,
        RunEvent::IterationLimit,
        RunEvent::SecurityFlagged,
        RunEvent::SecurityCleared,
        RunEvent::SecurityRejected,
        RunEvent::MergeSucceeded,
        RunEvent::MergeConflicted,
        RunEvent::ConflictResolved,
        RunEvent::OperationalFailure,
        RunEvent::Orphaned,
        RunEvent::Cancel,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RunEvent::Start => "start",
            RunEvent::BaselineFailed => "baseline_failed",
            RunEvent::EscalationRaised => "escalation_raised",
            RunEvent::InputProvided => "input_provided",
            RunEvent::BuildCompleted => "build_completed",
            RunEvent::TestsFailed => "tests_failed",
            RunEvent::TestsPassed => "tests_passed",
            RunEvent::ChangesRequested => "changes_requested",
            RunEvent::ReviewApproved => "review_approved",
            RunEvent::IterationLimit => "iteration_limit",
            RunEvent::SecurityFlagged => "security_flagged",
            RunEvent::SecurityCleared => "security_cleared",
            RunEvent::SecurityRejected => "security_rejected",
            RunEvent::MergeSucceeded => "merge_succeeded",
            RunEvent::MergeConflicted => "merge_conflicted",
            RunEvent::ConflictResolved => "conflict_resolved",
            RunEvent::OperationalFailure => "operational_failure",
            RunEvent::Orphaned => "orphaned",
            RunEvent::Cancel => "cancel",
        }
    }
}

impl fmt::Display for RunEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum TriggeredBy {
    Manual,
    Autopilot,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum ReviewerVerdict {
    Approved,
    ChangesRequested,
}

/// Values written to `runs.failure_reason`.
pub mod failure_reason {
    pub const ITERATION_LIMIT: &str = "iteration_limit";
    pub const ORPHANED: &str = "orphaned";
    pub const AGENT_CRASHED: &str = "agent_crashed";
    pub const WORKTREE_FAILED: &str = "worktree_failed";
    pub const SECURITY_REJECTED: &str = "security_rejected";
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    /// The full edge list, written out independently of `apply`.
    fn allowed_edges() -> HashSet<(RunStatus, RunEvent, RunStatus)> {
        use RunEvent as E;
        use RunStatus as S;

        let mut edges = HashSet::from([
            (S::Queued, E::Start, S::Building),
            (S::Queued, E::OperationalFailure, S::Failed),
            (S::Building, E::BaselineFailed, S::BaselineFailed),
            (S::Building, E::EscalationRaised, S::WaitingForInput),
            (S::Building, E::BuildCompleted, S::Testing),
            (S::WaitingForInput, E::InputProvided, S::Building),
            (S::Testing, E::TestsPassed, S::AiReview),
            (S::Testing, E::TestsFailed, S::Building),
            (S::Testing, E::IterationLimit, S::Failed),
            (S::AiReview, E::ReviewApproved, S::YouReview),
            (S::AiReview, E::ChangesRequested, S::Building),
            (S::AiReview, E::IterationLimit, S::Failed),
            (S::SecurityHold, E::SecurityCleared, S::YouReview),
            (S::SecurityHold, E::SecurityRejected, S::Failed),
            (S::AiReview, E::MergeSucceeded, S::Merged),
            (S::YouReview, E::MergeSucceeded, S::Merged),
            (S::AiReview, E::MergeConflicted, S::MergeConflict),
            (S::YouReview, E::MergeConflicted, S::MergeConflict),
            (S::MergeConflict, E::ConflictResolved, S::Merged),
        ]);
        for status in [S::Building, S::Testing, S::AiReview] {
            edges.insert((status, E::OperationalFailure, S::Failed));
            edges.insert((status, E::Orphaned, S::Failed));
        }
        for status in RunStatus::ALL.iter().filter(|s| !s.is_terminal()) {
            edges.insert((*status, E::Cancel, S::Canceled));
            if *status != S::SecurityHold {
                edges.insert((*status, E::SecurityFlagged, S::SecurityHold));
            }
        }
        edges
    }

    #[test]
    fn test_every_status_event_pair_follows_the_edge_list() {
        let edges = allowed_edges();
        for from in RunStatus::ALL {
            for event in RunEvent::ALL {
                let expected = edges
                    .iter()
                    .find(|(f, e, _)| *f == from && *e == event)
                    .map(|(_, _, to)| *to);
                assert_eq!(
                    from.apply(event),
                    expected,
                    "({}, {}) produced an unexpected result",
                    from,
                    event
                );
            }
        }
    }

    #[test]
    fn test_terminal_statuses_have_no_exits() {
        for status in [RunStatus::Merged, RunStatus::Failed, RunStatus::Canceled] {
            assert!(status.is_terminal());
            for event in RunEvent::ALL {
                assert_eq!(status.apply(event), None);
            }
        }
        assert!(!RunStatus::MergeConflict.is_terminal());
    }

    #[test]
    fn test_waiting_for_input_resumes_only_through_input() {
        let exits: Vec<RunEvent> = RunEvent::ALL
            .into_iter()
            .filter(|e| RunStatus::WaitingForInput.apply(*e) == Some(RunStatus::Building))
            .collect();
        assert_eq!(exits, vec![RunEvent::InputProvided]);
    }

    #[test]
    fn test_merge_conflict_is_never_retried() {
        assert_eq!(RunStatus::MergeConflict.apply(RunEvent::MergeSucceeded), None);
        assert_eq!(
            RunStatus::MergeConflict.apply(RunEvent::ConflictResolved),
            Some(RunStatus::Merged)
        );
    }

    #[test]
    fn test_work_order_mirror() {
        assert_eq!(RunStatus::Merged.work_order_status(), WorkOrderStatus::Done);
        assert_eq!(RunStatus::Failed.work_order_status(), WorkOrderStatus::Ready);
        assert_eq!(
            RunStatus::MergeConflict.work_order_status(),
            WorkOrderStatus::YouReview
        );
    }
}
