pub mod autopilot;
pub mod communications;
pub mod context;
pub mod projects;
pub mod runs;
pub mod work_orders;

use axum::{
    routing::{get, post},
    Router,
};

use crate::server::AppState;

/// Create the API router with all endpoint routes
pub fn create_api_router() -> Router<AppState> {
    Router::new()
        // Projects and work orders
        .route(
            "/projects",
            get(projects::list_projects).post(projects::create_project),
        )
        .route("/projects/:project_id", get(projects::get_project))
        .route(
            "/projects/:project_id/status",
            post(projects::set_project_status),
        )
        .route(
            "/projects/:project_id/work-orders",
            get(work_orders::list_work_orders).post(work_orders::create_work_order),
        )
        .route(
            "/work-orders/:work_order_id",
            get(work_orders::get_work_order).patch(work_orders::update_work_order),
        )
        .route(
            "/work-orders/:work_order_id/status",
            post(work_orders::set_work_order_status),
        )
        .route(
            "/work-orders/:work_order_id/ready-check",
            get(work_orders::ready_check),
        )
        // Runs
        .route("/projects/:project_id/runs", post(runs::create_run))
        .route("/runs", get(runs::list_runs))
        .route("/runs/:run_id", get(runs::get_run).patch(runs::patch_run))
        .route("/runs/:run_id/cancel", post(runs::cancel_run))
        .route("/runs/:run_id/input", post(runs::provide_input))
        .route("/runs/:run_id/approve", post(runs::approve_run))
        .route("/runs/:run_id/security-hold", post(runs::flag_security))
        .route(
            "/runs/:run_id/security-verdict",
            post(runs::security_verdict),
        )
        // Escalations and communications
        .route(
            "/projects/:project_id/escalations",
            post(communications::create_escalation),
        )
        .route(
            "/projects/:project_id/communications",
            post(communications::create_project_communication),
        )
        .route(
            "/communications",
            post(communications::create_global_communication),
        )
        .route("/communications/:id", get(communications::get_communication))
        .route(
            "/communications/:id/:action",
            post(communications::communication_action),
        )
        .route(
            "/projects/:project_id/inbox",
            get(communications::project_inbox),
        )
        .route("/inbox/global", get(communications::global_inbox))
        .route("/inbox/user", get(communications::user_inbox))
        .route("/human-queue", get(communications::human_queue))
        .route("/triage", post(communications::triage))
        // Autopilot
        .route(
            "/projects/:project_id/autopilot",
            get(autopilot::get_policy).put(autopilot::update_policy),
        )
        .route(
            "/projects/:project_id/autopilot/status",
            get(autopilot::get_status),
        )
        .route(
            "/projects/:project_id/autopilot/reset",
            post(autopilot::reset),
        )
        .route("/projects/:project_id/autopilot/tick", post(autopilot::tick))
        // Budget, context and shifts
        .route("/budget", get(context::budget))
        .route("/context", get(context::global_context))
        .route(
            "/projects/:project_id/context",
            get(context::project_context),
        )
        .route(
            "/projects/:project_id/shifts",
            post(context::start_shift),
        )
        .route(
            "/projects/:project_id/shifts/active",
            get(context::active_shift),
        )
        .route("/shifts/:shift_id/complete", post(context::complete_shift))
        .route("/scheduler/tick", post(context::scheduler_tick))
}
