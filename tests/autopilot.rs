mod common;

use common::{ready_request, Script, TestHarness};
use pretty_assertions::assert_eq;

use foreman::{
    autopilot::AutopilotState,
    database::{
        autopilot::UpdatePolicyRequest,
        projects::{Project, ProjectStatus},
        work_orders::{CreateWorkOrderRequest, WorkOrder},
    },
    runs::{RunStatus, TriggeredBy},
};

fn enabled() -> UpdatePolicyRequest {
    UpdatePolicyRequest {
        enabled: Some(true),
        max_concurrent_runs: Some(1),
        stop_on_failure_count: Some(3),
        ..Default::default()
    }
}

#[tokio::test]
async fn test_disabled_autopilot_starts_nothing() {
    let h = TestHarness::new().await;
    let project = h.project("alpha").await;
    h.ready_work_order(&project.id, "Idle").await;

    let tick = h.state.autopilot.tick(&project.id).await.unwrap();
    assert_eq!(tick.status.state, AutopilotState::Disabled);
    assert!(tick.started_run.is_none());
    assert_eq!(h.provider.started(), 0);
}

#[tokio::test]
async fn test_picks_best_ready_work_order_with_done_dependencies() {
    let h = TestHarness::new().await;
    let project = h.project("alpha").await;
    let base = h.ready_work_order(&project.id, "Base").await;
    h.work_order(
        &project.id,
        CreateWorkOrderRequest {
            priority: Some(1),
            depends_on: vec![base.id.clone()],
            ..ready_request("Blocked on base")
        },
    )
    .await;
    let urgent = h
        .work_order(
            &project.id,
            CreateWorkOrderRequest {
                priority: Some(2),
                ..ready_request("Urgent")
            },
        )
        .await;
    h.state
        .autopilot
        .update_policy(&project.id, enabled())
        .await
        .unwrap();

    let tick = h.state.autopilot.tick(&project.id).await.unwrap();
    let run = tick.started_run.expect("autopilot should start a run");
    assert_eq!(run.work_order_id, urgent.id);
    assert_eq!(run.triggered_by, TriggeredBy::Autopilot);
    assert_eq!(tick.status.state, AutopilotState::Running);

    // One run at a time.
    let tick = h.state.autopilot.tick(&project.id).await.unwrap();
    assert!(tick.started_run.is_none());
    assert_eq!(tick.status.blocked_reason.as_deref(), Some("active_run"));
    assert_eq!(tick.status.active_run.as_deref(), Some(run.id.as_str()));

    h.wait_for(&run.id, RunStatus::YouReview).await;
}

#[tokio::test]
async fn test_policy_filters_by_tag_and_priority() {
    let h = TestHarness::new().await;
    let project = h.project("alpha").await;
    let backend = h
        .work_order(
            &project.id,
            CreateWorkOrderRequest {
                priority: Some(4),
                tags: vec!["backend".to_string()],
                ..ready_request("Low priority")
            },
        )
        .await;
    h.work_order(
        &project.id,
        CreateWorkOrderRequest {
            priority: Some(1),
            tags: vec!["frontend".to_string()],
            ..ready_request("Wrong tag")
        },
    )
    .await;
    h.state
        .autopilot
        .update_policy(
            &project.id,
            UpdatePolicyRequest {
                allowed_tags: Some(vec!["backend".to_string()]),
                min_priority: Some(5),
                ..enabled()
            },
        )
        .await
        .unwrap();

    let tick = h.state.autopilot.tick(&project.id).await.unwrap();
    assert!(tick.started_run.is_none());
    assert_eq!(tick.status.blocked_reason.as_deref(), Some("no_candidate"));
    assert_eq!(tick.status.state, AutopilotState::Idle);

    // Priority 4 clears a floor of 4; the priority 1 work order stays out on its tag.
    h.state
        .autopilot
        .update_policy(
            &project.id,
            UpdatePolicyRequest {
                min_priority: Some(4),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    let run = h
        .state
        .autopilot
        .tick(&project.id)
        .await
        .unwrap()
        .started_run
        .expect("floor of 4 admits the priority 4 work order");
    assert_eq!(run.work_order_id, backend.id);
    h.wait_for(&run.id, RunStatus::YouReview).await;
}

#[tokio::test]
async fn test_pauses_after_consecutive_failures_until_reset() {
    let h = TestHarness::new().await;
    let project = h.project("alpha").await;
    let wo = h.ready_work_order(&project.id, "Doomed").await;
    h.state
        .autopilot
        .update_policy(&project.id, enabled())
        .await
        .unwrap();

    for attempt in 1..=3 {
        h.provider.push_builder(Script::lines(&["boom"], 1));
        let tick = h.state.autopilot.tick(&project.id).await.unwrap();
        let run = tick.started_run.expect("run should start while under the limit");
        assert_eq!(run.work_order_id, wo.id);
        h.wait_for(&run.id, RunStatus::Failed).await;

        let status = h.state.autopilot.status(&project.id).await.unwrap();
        assert_eq!(status.failure_count, attempt);
    }

    let tick = h.state.autopilot.tick(&project.id).await.unwrap();
    assert!(tick.started_run.is_none());
    assert_eq!(tick.status.state, AutopilotState::Paused);
    assert_eq!(tick.status.blocked_reason.as_deref(), Some("failure_limit"));

    // Manual runs do not count against autopilot.
    let manual = h
        .state
        .controller
        .launch(&project.id, &wo.id, TriggeredBy::Manual, None)
        .await
        .unwrap();
    h.wait_for(&manual.id, RunStatus::YouReview).await;
    h.state.controller.cancel(&manual.id).await.unwrap();
    assert_eq!(
        h.state.autopilot.status(&project.id).await.unwrap().failure_count,
        3
    );

    let status = h.state.autopilot.reset(&project.id).await.unwrap();
    assert_eq!(status.failure_count, 0);
    assert_ne!(status.state, AutopilotState::Paused);

    let tick = h.state.autopilot.tick(&project.id).await.unwrap();
    let run = tick.started_run.expect("reset lifts the pause");
    h.wait_for(&run.id, RunStatus::YouReview).await;
}

#[tokio::test]
async fn test_merge_resets_failure_count() {
    let h = TestHarness::with_config(|c| c.runs.auto_merge = true).await;
    let project = h.project("alpha").await;
    h.ready_work_order(&project.id, "First").await;
    h.state
        .autopilot
        .update_policy(&project.id, enabled())
        .await
        .unwrap();

    h.provider.push_builder(Script::lines(&["boom"], 1));
    let run = h.state.autopilot.tick(&project.id).await.unwrap().started_run.unwrap();
    h.wait_for(&run.id, RunStatus::Failed).await;
    assert_eq!(
        h.state.autopilot.status(&project.id).await.unwrap().failure_count,
        1
    );

    let run = h.state.autopilot.tick(&project.id).await.unwrap().started_run.unwrap();
    h.wait_for(&run.id, RunStatus::Merged).await;
    assert_eq!(
        h.state.autopilot.status(&project.id).await.unwrap().failure_count,
        0
    );
}

#[tokio::test]
async fn test_manual_merge_resets_failure_count() {
    let h = TestHarness::new().await;
    let project = h.project("alpha").await;
    h.ready_work_order(&project.id, "Flaky").await;
    h.state
        .autopilot
        .update_policy(&project.id, enabled())
        .await
        .unwrap();

    h.provider.push_builder(Script::lines(&["boom"], 1));
    let run = h.state.autopilot.tick(&project.id).await.unwrap().started_run.unwrap();
    h.wait_for(&run.id, RunStatus::Failed).await;
    assert_eq!(
        h.state.autopilot.status(&project.id).await.unwrap().failure_count,
        1
    );

    h.state
        .autopilot
        .update_policy(
            &project.id,
            UpdatePolicyRequest {
                enabled: Some(false),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    let wo = h.ready_work_order(&project.id, "Hand picked").await;
    let manual = h
        .state
        .controller
        .launch(&project.id, &wo.id, TriggeredBy::Manual, None)
        .await
        .unwrap();
    h.wait_for(&manual.id, RunStatus::YouReview).await;
    let merged = h.state.controller.approve(&manual.id).await.unwrap();
    assert_eq!(merged.status, RunStatus::Merged);

    assert_eq!(
        h.state.autopilot.status(&project.id).await.unwrap().failure_count,
        0
    );
}

#[tokio::test]
async fn test_budget_exhaustion_raises_single_warning() {
    let h = TestHarness::with_config(|c| c.budget.monthly_budget_usd = 0.0).await;
    let project = h.project("alpha").await;
    let wo = h.ready_work_order(&project.id, "Expensive").await;
    h.state
        .autopilot
        .update_policy(&project.id, enabled())
        .await
        .unwrap();

    for _ in 0..2 {
        let tick = h.state.autopilot.tick(&project.id).await.unwrap();
        assert!(tick.started_run.is_none());
        assert_eq!(tick.status.blocked_reason.as_deref(), Some("budget"));
    }

    let warnings: Vec<_> = h
        .state
        .router
        .global_inbox()
        .await
        .unwrap()
        .into_iter()
        .filter(|c| c.comm_type.as_deref() == Some("budget_warning"))
        .collect();
    assert_eq!(warnings.len(), 1);
    assert_eq!(warnings[0].project_id.as_deref(), Some(project.id.as_str()));

    let err = h
        .state
        .controller
        .create_run(&project.id, &wo.id, TriggeredBy::Manual, None)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "budget_exhausted");
    assert_eq!(err.details()["budget_blocked"]["reason"], "exhausted");
    assert_eq!(
        WorkOrder::require(&h.state.db, &wo.id).await.unwrap().status,
        foreman::database::work_orders::WorkOrderStatus::Ready
    );
}

#[tokio::test]
async fn test_skips_projects_that_are_not_active() {
    let h = TestHarness::new().await;
    let project = h.project("alpha").await;
    h.ready_work_order(&project.id, "Parked work").await;
    h.state
        .autopilot
        .update_policy(&project.id, enabled())
        .await
        .unwrap();
    Project::set_status(&h.state.db, &project.id, ProjectStatus::Parked)
        .await
        .unwrap();

    let tick = h.state.autopilot.tick(&project.id).await.unwrap();
    assert!(tick.started_run.is_none());
    assert_eq!(tick.status.blocked_reason.as_deref(), Some("project_parked"));

    let ticks = h.state.autopilot.tick_all().await.unwrap();
    assert_eq!(ticks.len(), 1);
    assert!(ticks[0].started_run.is_none());
}
