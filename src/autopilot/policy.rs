use std::collections::HashSet;

use crate::database::autopilot::AutopilotPolicy;
use crate::database::work_orders::{WorkOrder, WorkOrderStatus};

/// True when the policy admits this work order, dependencies aside.
/// `min_priority` is a floor on the priority number: `priority >= min_priority`.
pub fn admits(policy: &AutopilotPolicy, work_order: &WorkOrder) -> bool {
    if let Some(min_priority) = policy.min_priority {
        if work_order.priority < min_priority {
            return false;
        }
    }
    if !policy.allowed_tags.is_empty()
        && !work_order
            .tags
            .iter()
            .any(|tag| policy.allowed_tags.contains(tag))
    {
        return false;
    }
    true
}

/// Picks the next work order to run: `ready`, every dependency `done`,
/// admitted by the policy; most important priority first, then creation
/// order.
pub fn select_candidate<'a>(
    work_orders: &'a [WorkOrder],
    done: &HashSet<String>,
    policy: &AutopilotPolicy,
) -> Option<&'a WorkOrder> {
    work_orders
        .iter()
        .filter(|wo| wo.status == WorkOrderStatus::Ready)
        .filter(|wo| wo.depends_on.iter().all(|dep| done.contains(dep)))
        .filter(|wo| admits(policy, wo))
        .min_by_key(|wo| (wo.priority, wo.seq))
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::types::Json;

    fn wo(id: &str, seq: i64, priority: i64, deps: &[&str], tags: &[&str]) -> WorkOrder {
        WorkOrder {
            id: id.to_string(),
            project_id: "p".to_string(),
            seq,
            title: id.to_string(),
            goal: "goal".to_string(),
            acceptance_criteria: Json(vec!["ac".to_string()]),
            stop_conditions: Json(vec!["stop".to_string()]),
            status: WorkOrderStatus::Ready,
            priority,
            depends_on: Json(deps.iter().map(|d| d.to_string()).collect()),
            tags: Json(tags.iter().map(|t| t.to_string()).collect()),
            base_branch: None,
            created_at: String::new(),
            updated_at: String::new(),
        }
    }

    fn enabled_policy() -> AutopilotPolicy {
        AutopilotPolicy {
            enabled: true,
            ..AutopilotPolicy::disabled("p")
        }
    }

    #[test]
    fn test_orders_by_priority_then_creation() {
        let orders = vec![
            wo("late-high", 3, 1, &[], &[]),
            wo("early-low", 1, 4, &[], &[]),
            wo("early-high", 2, 1, &[], &[]),
        ];
        let picked = select_candidate(&orders, &HashSet::new(), &enabled_policy()).unwrap();
        assert_eq!(picked.id, "early-high");
    }

    #[test]
    fn test_skips_unmet_dependencies_and_non_ready() {
        let mut building = wo("building", 1, 1, &[], &[]);
        building.status = WorkOrderStatus::Building;
        let orders = vec![
            building,
            wo("blocked-on-x", 2, 1, &["x"], &[]),
            wo("free", 3, 2, &["y"], &[]),
        ];
        let done: HashSet<String> = ["y".to_string()].into_iter().collect();
        let picked = select_candidate(&orders, &done, &enabled_policy()).unwrap();
        assert_eq!(picked.id, "free");
    }

    #[test]
    fn test_policy_filters() {
        let orders = vec![
            wo("p4-backend", 1, 4, &[], &["backend"]),
            wo("p2-frontend", 2, 2, &[], &["frontend"]),
            wo("p2-backend", 3, 2, &[], &["backend", "api"]),
        ];
        let mut policy = enabled_policy();
        policy.allowed_tags = Json(vec!["backend".to_string()]);

        let picked = select_candidate(&orders, &HashSet::new(), &policy).unwrap();
        assert_eq!(picked.id, "p2-backend");

        policy.min_priority = Some(3);
        let picked = select_candidate(&orders, &HashSet::new(), &policy).unwrap();
        assert_eq!(picked.id, "p4-backend");

        policy.min_priority = Some(5);
        assert!(select_candidate(&orders, &HashSet::new(), &policy).is_none());
    }

    #[test]
    fn test_min_priority_is_inclusive_floor() {
        let mut policy = enabled_policy();
        policy.min_priority = Some(2);
        assert!(!admits(&policy, &wo("p1", 1, 1, &[], &[])));
        assert!(admits(&policy, &wo("p2", 2, 2, &[], &[])));
        assert!(admits(&policy, &wo("p5", 3, 5, &[], &[])));
    }
}
