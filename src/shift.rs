//! Time-boxed unattended shifts and the read models a shift loop consumes.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::autopilot::{AutopilotEngine, AutopilotStatus};
use crate::budget::{BudgetMeter, BudgetSummary};
use crate::communications::router::CreateCommunicationRequest;
use crate::communications::{EscalationRouter, Intent, Scope, TriageDecider};
use crate::config::SchedulerConfig;
use crate::database::communications::Communication;
use crate::database::projects::Project;
use crate::database::runs::Run;
use crate::database::shifts::Shift;
use crate::database::work_orders::{WorkOrder, WorkOrderStatus};
use crate::database::DbPool;
use crate::error::Result;
use crate::runs::RunController;

#[derive(Debug, Default, Deserialize)]
pub struct StartShiftRequest {
    pub minutes: Option<i64>,
}

#[derive(Debug, Default, Deserialize)]
pub struct CompleteShiftRequest {
    pub summary: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ShiftContext {
    pub project: Project,
    pub work_orders: BTreeMap<String, i64>,
    pub active_runs: Vec<Run>,
    pub autopilot: AutopilotStatus,
    pub inbox_size: usize,
    pub open_escalations: i64,
    pub budget: BudgetSummary,
    pub active_shift: Option<Shift>,
}

#[derive(Debug, Clone, Serialize)]
pub struct GlobalContext {
    pub projects: BTreeMap<String, i64>,
    pub work_orders_ready: i64,
    pub work_orders_building: i64,
    pub work_orders_blocked: i64,
    pub active_runs: i64,
    pub open_escalations: i64,
    pub human_queue: usize,
    pub active_shifts: i64,
    pub budget: BudgetSummary,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SchedulerTick {
    pub orphaned_runs: usize,
    pub expired_shifts: usize,
    pub triaged: usize,
    pub autopilot_runs_started: usize,
}

/// Composes reconciliation, shift expiry, global triage and autopilot into
/// one periodic pass.
#[derive(Clone)]
pub struct ShiftScheduler {
    db: DbPool,
    config: SchedulerConfig,
    controller: RunController,
    autopilot: AutopilotEngine,
    router: EscalationRouter,
    budget: BudgetMeter,
    decider: Arc<dyn TriageDecider>,
}

impl ShiftScheduler {
    pub fn new(
        db: DbPool,
        config: SchedulerConfig,
        controller: RunController,
        autopilot: AutopilotEngine,
        router: EscalationRouter,
        budget: BudgetMeter,
        decider: Arc<dyn TriageDecider>,
    ) -> Self {
        Self {
            db,
            config,
            controller,
            autopilot,
            router,
            budget,
            decider,
        }
    }

    pub async fn tick(&self) -> Result<SchedulerTick> {
        let mut tick = SchedulerTick::default();

        if self.config.reconcile {
            match self.controller.reconcile_orphans().await {
                Ok(orphaned) => tick.orphaned_runs = orphaned.len(),
                Err(e) => warn!("Orphan reconciliation failed: {}", e),
            }
        }

        let expired = Shift::expire_overdue(&self.db).await?;
        tick.expired_shifts = expired.len();
        for shift in &expired {
            self.report_expired(shift).await;
        }

        match self.router.triage_global(self.decider.as_ref()).await {
            Ok(outcomes) => tick.triaged = outcomes.len(),
            Err(e) => warn!("Global triage failed: {}", e),
        }

        if self.config.autopilot {
            tick.autopilot_runs_started = self
                .autopilot
                .tick_all()
                .await?
                .iter()
                .filter(|t| t.started_run.is_some())
                .count();
        }

        debug!(
            orphaned = tick.orphaned_runs,
            expired = tick.expired_shifts,
            triaged = tick.triaged,
            started = tick.autopilot_runs_started,
            "Scheduler tick complete"
        );
        Ok(tick)
    }

    async fn report_expired(&self, shift: &Shift) {
        info!(shift_id = %shift.id, project_id = %shift.project_id, "Shift expired");
        let result = self
            .router
            .create_communication(
                Some(&shift.project_id),
                CreateCommunicationRequest {
                    intent: Intent::Status,
                    comm_type: Some("shift_expired".to_string()),
                    from_scope: None,
                    to_scope: Scope::User,
                    to_project_id: None,
                    summary: format!("Shift {} ran out of time", shift.id),
                    body: format!("Started {}, ended {}", shift.started_at, shift.ends_at),
                    payload: None,
                    run_id: None,
                    shift_id: Some(shift.id.clone()),
                },
            )
            .await;
        if let Err(e) = result {
            warn!(shift_id = %shift.id, "Failed to report expired shift: {}", e);
        }
    }

    pub async fn start_shift(&self, project_id: &str, minutes: Option<i64>) -> Result<Shift> {
        Project::require(&self.db, project_id).await?;
        let shift = Shift::start(
            &self.db,
            project_id,
            minutes.unwrap_or(self.config.shift_minutes),
        )
        .await?;
        info!(shift_id = %shift.id, project_id = %project_id, ends_at = %shift.ends_at, "Shift started");
        Ok(shift)
    }

    pub async fn complete_shift(&self, shift_id: &str, summary: Option<&str>) -> Result<Shift> {
        let shift = Shift::complete(&self.db, shift_id, summary).await?;
        info!(shift_id = %shift.id, "Shift completed");
        Ok(shift)
    }

    pub async fn active_shift(&self, project_id: &str) -> Result<Option<Shift>> {
        Project::require(&self.db, project_id).await?;
        Shift::active(&self.db, project_id).await
    }

    pub async fn shift_context(&self, project_id: &str) -> Result<ShiftContext> {
        let project = Project::require(&self.db, project_id).await?;

        let work_orders = WorkOrder::count_by_status(&self.db, Some(project_id))
            .await?
            .into_iter()
            .map(|(status, count)| (status.to_string(), count))
            .collect();

        Ok(ShiftContext {
            project,
            work_orders,
            active_runs: Run::active_for_project(&self.db, project_id, None).await?,
            autopilot: self.autopilot.status(project_id).await?,
            inbox_size: Communication::project_inbox(&self.db, project_id).await?.len(),
            open_escalations: Communication::count_open_escalations(&self.db, Some(project_id))
                .await?,
            budget: self.budget.summary().await?,
            active_shift: Shift::active(&self.db, project_id).await?,
        })
    }

    pub async fn global_context(&self) -> Result<GlobalContext> {
        let projects = Project::count_by_status(&self.db)
            .await?
            .into_iter()
            .map(|(status, count)| {
                let key = serde_json::to_value(status)
                    .ok()
                    .and_then(|v| v.as_str().map(str::to_string))
                    .unwrap_or_default();
                (key, count)
            })
            .collect();

        let work_orders: HashMap<WorkOrderStatus, i64> =
            WorkOrder::count_by_status(&self.db, None)
                .await?
                .into_iter()
                .collect();
        let count = |status| work_orders.get(&status).copied().unwrap_or(0);

        Ok(GlobalContext {
            projects,
            work_orders_ready: count(WorkOrderStatus::Ready),
            work_orders_building: count(WorkOrderStatus::Building),
            work_orders_blocked: count(WorkOrderStatus::Blocked),
            active_runs: Run::count_active(&self.db).await?,
            open_escalations: Communication::count_open_escalations(&self.db, None).await?,
            human_queue: self.router.human_queue().await?.len(),
            active_shifts: Shift::count_active(&self.db).await?,
            budget: self.budget.summary().await?,
        })
    }
}
