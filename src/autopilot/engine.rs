use serde::Serialize;
use serde_json::json;
use tracing::{debug, info, warn};

use super::policy::select_candidate;
use crate::communications::router::CreateEscalationRequest;
use crate::communications::EscalationRouter;
use crate::database::autopilot::{AutopilotPolicy, UpdatePolicyRequest};
use crate::database::communications::Communication;
use crate::database::projects::{Project, ProjectStatus};
use crate::database::runs::Run;
use crate::database::work_orders::{WorkOrder, WorkOrderStatus};
use crate::database::DbPool;
use crate::error::{AppError, Result};
use crate::runs::{RunController, TriggeredBy};

pub const BUDGET_WARNING: &str = "budget_warning";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AutopilotState {
    Disabled,
    Paused,
    Running,
    Idle,
}

/// Derived on every read, never persisted.
#[derive(Debug, Clone, Serialize)]
pub struct AutopilotStatus {
    pub project_id: String,
    pub state: AutopilotState,
    pub failure_count: i64,
    pub active_run: Option<String>,
    pub blocked_reason: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AutopilotTick {
    pub status: AutopilotStatus,
    pub started_run: Option<Run>,
}

/// Per-project policy loop. Holds no state between ticks.
#[derive(Clone)]
pub struct AutopilotEngine {
    db: DbPool,
    controller: RunController,
    router: EscalationRouter,
}

enum Gate {
    Stop(AutopilotStatus),
    Open {
        policy: AutopilotPolicy,
        active: Vec<Run>,
    },
}

impl AutopilotEngine {
    pub fn new(db: DbPool, controller: RunController, router: EscalationRouter) -> Self {
        Self {
            db,
            controller,
            router,
        }
    }

    pub async fn policy(&self, project_id: &str) -> Result<AutopilotPolicy> {
        Project::require(&self.db, project_id).await?;
        AutopilotPolicy::get(&self.db, project_id).await
    }

    pub async fn update_policy(
        &self,
        project_id: &str,
        req: UpdatePolicyRequest,
    ) -> Result<AutopilotPolicy> {
        Project::require(&self.db, project_id).await?;
        let policy = AutopilotPolicy::upsert(&self.db, project_id, req).await?;
        info!(
            project_id = %project_id,
            enabled = policy.enabled,
            max_concurrent_runs = policy.max_concurrent_runs,
            "Autopilot policy updated"
        );
        Ok(policy)
    }

    /// Clears the failure counter, lifting a pause.
    pub async fn reset(&self, project_id: &str) -> Result<AutopilotStatus> {
        Project::require(&self.db, project_id).await?;
        AutopilotPolicy::reset(&self.db, project_id).await?;
        info!(project_id = %project_id, "Autopilot failure count reset");
        self.status(project_id).await
    }

    fn status_of(
        policy: &AutopilotPolicy,
        state: AutopilotState,
        active: &[Run],
        blocked_reason: Option<&str>,
    ) -> AutopilotStatus {
        AutopilotStatus {
            project_id: policy.project_id.clone(),
            state,
            failure_count: policy.failure_count,
            active_run: active.first().map(|r| r.id.clone()),
            blocked_reason: blocked_reason.map(str::to_string),
        }
    }

    async fn gate(&self, project_id: &str) -> Result<Gate> {
        let project = Project::require(&self.db, project_id).await?;
        let policy = AutopilotPolicy::get(&self.db, project_id).await?;

        if !policy.enabled {
            return Ok(Gate::Stop(Self::status_of(
                &policy,
                AutopilotState::Disabled,
                &[],
                None,
            )));
        }

        if policy.stop_on_failure_count > 0 && policy.failure_count >= policy.stop_on_failure_count
        {
            return Ok(Gate::Stop(Self::status_of(
                &policy,
                AutopilotState::Paused,
                &[],
                Some("failure_limit"),
            )));
        }

        let active =
            Run::active_for_project(&self.db, project_id, Some(TriggeredBy::Autopilot)).await?;
        if active.len() as i64 >= policy.max_concurrent_runs {
            return Ok(Gate::Stop(Self::status_of(
                &policy,
                AutopilotState::Running,
                &active,
                Some("active_run"),
            )));
        }

        if project.status != ProjectStatus::Active {
            let state = if active.is_empty() {
                AutopilotState::Idle
            } else {
                AutopilotState::Running
            };
            let reason = match project.status {
                ProjectStatus::Blocked => "project_blocked",
                _ => "project_parked",
            };
            return Ok(Gate::Stop(Self::status_of(
                &policy,
                state,
                &active,
                Some(reason),
            )));
        }

        Ok(Gate::Open { policy, active })
    }

    /// Current status without starting anything.
    pub async fn status(&self, project_id: &str) -> Result<AutopilotStatus> {
        match self.gate(project_id).await? {
            Gate::Stop(status) => Ok(status),
            Gate::Open { policy, active } => {
                let state = if active.is_empty() {
                    AutopilotState::Idle
                } else {
                    AutopilotState::Running
                };
                Ok(Self::status_of(&policy, state, &active, None))
            }
        }
    }

    /// One policy decision for one project; starts at most one run.
    pub async fn tick(&self, project_id: &str) -> Result<AutopilotTick> {
        let (policy, active) = match self.gate(project_id).await? {
            Gate::Stop(status) => {
                debug!(project_id = %project_id, state = ?status.state, "Autopilot not starting a run");
                return Ok(AutopilotTick {
                    status,
                    started_run: None,
                });
            }
            Gate::Open { policy, active } => (policy, active),
        };
        let idle_state = if active.is_empty() {
            AutopilotState::Idle
        } else {
            AutopilotState::Running
        };

        let ready = WorkOrder::list(&self.db, project_id, Some(WorkOrderStatus::Ready)).await?;
        let done = WorkOrder::done_ids(&self.db, project_id).await?;
        let Some(candidate) = select_candidate(&ready, &done, &policy) else {
            debug!(project_id = %project_id, "Autopilot found no eligible work order");
            return Ok(AutopilotTick {
                status: Self::status_of(&policy, idle_state, &active, Some("no_candidate")),
                started_run: None,
            });
        };

        match self
            .controller
            .launch(project_id, &candidate.id, TriggeredBy::Autopilot, None)
            .await
        {
            Ok(run) => {
                info!(
                    project_id = %project_id,
                    work_order_id = %candidate.id,
                    run_id = %run.id,
                    "Autopilot started run"
                );
                let mut status =
                    Self::status_of(&policy, AutopilotState::Running, &active, None);
                status.active_run = Some(run.id.clone());
                Ok(AutopilotTick {
                    status,
                    started_run: Some(run),
                })
            }
            Err(AppError::BudgetExhausted(block)) => {
                warn!(project_id = %project_id, reason = ?block.reason, "Autopilot blocked by budget");
                self.raise_budget_warning(project_id, &block.remediation, json!(block))
                    .await?;
                Ok(AutopilotTick {
                    status: Self::status_of(&policy, idle_state, &active, Some("budget")),
                    started_run: None,
                })
            }
            Err(AppError::ActiveRunExists { .. }) | Err(AppError::StaleTransition { .. }) => {
                debug!(project_id = %project_id, work_order_id = %candidate.id, "Candidate was claimed concurrently");
                Ok(AutopilotTick {
                    status: Self::status_of(&policy, idle_state, &active, Some("active_run")),
                    started_run: None,
                })
            }
            Err(e) => Err(e),
        }
    }

    /// Ticks every project with an enabled policy. A failing project does
    /// not stop the others.
    pub async fn tick_all(&self) -> Result<Vec<AutopilotTick>> {
        let policies = AutopilotPolicy::list_enabled(&self.db).await?;
        let mut ticks = Vec::with_capacity(policies.len());
        for policy in policies {
            match self.tick(&policy.project_id).await {
                Ok(tick) => ticks.push(tick),
                Err(e) => warn!(project_id = %policy.project_id, "Autopilot tick failed: {}", e),
            }
        }
        Ok(ticks)
    }

    async fn raise_budget_warning(
        &self,
        project_id: &str,
        remediation: &str,
        block: serde_json::Value,
    ) -> Result<()> {
        if Communication::open_escalation_of_type(&self.db, project_id, BUDGET_WARNING)
            .await?
            .is_some()
        {
            return Ok(());
        }
        self.router
            .create_escalation(
                project_id,
                CreateEscalationRequest {
                    comm_type: BUDGET_WARNING.to_string(),
                    summary: "Autopilot paused by the budget gate".to_string(),
                    body: remediation.to_string(),
                    payload: Some(json!({ "budget_blocked": block })),
                    run_id: None,
                    shift_id: None,
                    to_scope: None,
                },
            )
            .await?;
        Ok(())
    }
}
