use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use super::lifecycle::{CommStatus, Intent, Scope};
use crate::database::communications::{Communication, NewCommunication};
use crate::database::projects::Project;
use crate::database::DbPool;
use crate::error::{AppError, Result};

/// Outcome of triaging one globally addressed communication.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TriageDecision {
    Resolve { resolution: String },
    Delegate { to_project_id: String },
    Report,
    Wait,
}

#[async_trait]
pub trait TriageDecider: Send + Sync {
    async fn decide(&self, item: &Communication) -> Result<TriageDecision>;
}

/// Escalation subtypes that always need a human.
const REPORTED_TYPES: &[&str] = &["need_input", "blocked", "budget_warning", "security"];

/// Deterministic default triage.
#[derive(Debug, Default, Clone)]
pub struct RuleTriage;

#[async_trait]
impl TriageDecider for RuleTriage {
    async fn decide(&self, item: &Communication) -> Result<TriageDecision> {
        let decision = match item.intent {
            Intent::Escalation => match item.comm_type.as_deref() {
                Some(t) if REPORTED_TYPES.contains(&t) => TriageDecision::Report,
                _ => TriageDecision::Wait,
            },
            Intent::Request => match item
                .payload
                .as_ref()
                .and_then(|p| p.get("to_project_id"))
                .and_then(Value::as_str)
            {
                Some(target) => TriageDecision::Delegate {
                    to_project_id: target.to_string(),
                },
                None => TriageDecision::Wait,
            },
            Intent::Message | Intent::Status => TriageDecision::Resolve {
                resolution: "noted by global triage".to_string(),
            },
            Intent::Suggestion => TriageDecision::Wait,
        };
        Ok(decision)
    }
}

#[derive(Debug, Deserialize)]
pub struct CreateEscalationRequest {
    #[serde(rename = "type")]
    pub comm_type: String,
    pub summary: String,
    #[serde(default)]
    pub body: String,
    pub payload: Option<Value>,
    pub run_id: Option<String>,
    pub shift_id: Option<String>,
    pub to_scope: Option<Scope>,
}

#[derive(Debug, Deserialize)]
pub struct CreateCommunicationRequest {
    pub intent: Intent,
    #[serde(rename = "type")]
    pub comm_type: Option<String>,
    pub from_scope: Option<Scope>,
    pub to_scope: Scope,
    pub to_project_id: Option<String>,
    pub summary: String,
    #[serde(default)]
    pub body: String,
    pub payload: Option<Value>,
    pub run_id: Option<String>,
    pub shift_id: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TriageOutcome {
    pub communication_id: String,
    pub decision: TriageDecision,
    /// Communication created by DELEGATE, or the user copy created by REPORT
    pub created: Option<Communication>,
}

/// Routes communications between project, global and user scopes. All
/// state lives in the communications table.
#[derive(Clone)]
pub struct EscalationRouter {
    db: DbPool,
}

impl EscalationRouter {
    pub fn new(db: DbPool) -> Self {
        Self { db }
    }

    pub async fn create_escalation(
        &self,
        project_id: &str,
        req: CreateEscalationRequest,
    ) -> Result<Communication> {
        self.create_communication(
            Some(project_id),
            CreateCommunicationRequest {
                intent: Intent::Escalation,
                comm_type: Some(req.comm_type),
                from_scope: Some(Scope::Project),
                to_scope: req.to_scope.unwrap_or(Scope::Global),
                to_project_id: None,
                summary: req.summary,
                body: req.body,
                payload: req.payload,
                run_id: req.run_id,
                shift_id: req.shift_id,
            },
        )
        .await
    }

    pub async fn create_communication(
        &self,
        project_id: Option<&str>,
        req: CreateCommunicationRequest,
    ) -> Result<Communication> {
        if req.summary.trim().is_empty() {
            return Err(AppError::Validation("summary is required".to_string()));
        }
        if req.intent == Intent::Escalation
            && req.comm_type.as_deref().map_or(true, |t| t.trim().is_empty())
        {
            return Err(AppError::Validation(
                "escalations require a type".to_string(),
            ));
        }
        if let Some(project_id) = project_id {
            Project::require(&self.db, project_id).await?;
        }

        let to_project_id = match req.to_scope {
            Scope::Project => {
                let target = req
                    .to_project_id
                    .or_else(|| project_id.map(str::to_string))
                    .ok_or_else(|| {
                        AppError::Validation(
                            "to_project_id is required for project-scoped communications"
                                .to_string(),
                        )
                    })?;
                Project::require(&self.db, &target).await?;
                Some(target)
            }
            _ => None,
        };

        let from_scope = req.from_scope.unwrap_or(if project_id.is_some() {
            Scope::Project
        } else {
            Scope::Global
        });

        let communication = Communication::insert(
            &self.db,
            NewCommunication {
                intent: req.intent,
                comm_type: req.comm_type,
                from_scope,
                to_scope: req.to_scope,
                project_id: project_id.map(str::to_string),
                to_project_id,
                run_id: req.run_id,
                shift_id: req.shift_id,
                parent_id: None,
                summary: req.summary,
                body: req.body,
                payload: req.payload,
            },
        )
        .await?;

        info!(
            communication_id = %communication.id,
            intent = %communication.intent,
            to_scope = ?communication.to_scope,
            "Communication created"
        );
        Ok(communication)
    }

    pub async fn get(&self, id: &str) -> Result<Communication> {
        Communication::require(&self.db, id).await
    }

    /// Lifecycle-checked compare-and-swap.
    pub async fn transition(
        &self,
        id: &str,
        to: CommStatus,
        resolution: Option<&str>,
    ) -> Result<Communication> {
        let current = Communication::require(&self.db, id).await?;
        if !current.intent.can_transition(current.status, to) {
            return Err(AppError::invalid_transition(
                current.status,
                format!("{} -> {}", current.intent, to),
            ));
        }

        let updated = Communication::swap_status(
            &self.db,
            id,
            current.status,
            to,
            resolution,
            to.is_final(),
        )
        .await?;

        match updated {
            Some(communication) => {
                debug!(communication_id = %id, from = %current.status, to = %to, "Communication transitioned");
                Ok(communication)
            }
            None => {
                let actual = Communication::require(&self.db, id).await?;
                Err(AppError::StaleTransition {
                    id: id.to_string(),
                    expected: current.status.to_string(),
                    actual: actual.status.to_string(),
                })
            }
        }
    }

    pub async fn claim(&self, id: &str) -> Result<Communication> {
        self.transition(id, CommStatus::Claimed, None).await
    }

    pub async fn resolve(&self, id: &str, resolution: Option<&str>) -> Result<Communication> {
        self.transition(id, CommStatus::Resolved, resolution).await
    }

    pub async fn escalate_to_user(&self, id: &str) -> Result<Communication> {
        self.transition(id, CommStatus::EscalatedToUser, None).await
    }

    pub async fn read(&self, id: &str) -> Result<Communication> {
        self.transition(id, CommStatus::Read, None).await
    }

    pub async fn acknowledge(&self, id: &str) -> Result<Communication> {
        self.transition(id, CommStatus::Acknowledged, None).await
    }

    pub async fn accept(&self, id: &str) -> Result<Communication> {
        self.transition(id, CommStatus::Accepted, None).await
    }

    pub async fn decline(&self, id: &str, reason: Option<&str>) -> Result<Communication> {
        self.transition(id, CommStatus::Declined, reason).await
    }

    pub async fn close(&self, id: &str, resolution: Option<&str>) -> Result<Communication> {
        self.transition(id, CommStatus::Closed, resolution).await
    }

    pub async fn inbox(&self, project_id: &str) -> Result<Vec<Communication>> {
        Project::require(&self.db, project_id).await?;
        Communication::project_inbox(&self.db, project_id).await
    }

    pub async fn global_inbox(&self) -> Result<Vec<Communication>> {
        Communication::scope_inbox(&self.db, Scope::Global).await
    }

    pub async fn user_inbox(&self) -> Result<Vec<Communication>> {
        Communication::scope_inbox(&self.db, Scope::User).await
    }

    /// Only escalations in `escalated_to_user` wait on a human.
    pub async fn human_queue(&self) -> Result<Vec<Communication>> {
        Communication::escalated_to_user(&self.db).await
    }

    /// Mirrors a run-level pause for visibility. The run row stays the
    /// authoritative record.
    pub async fn mirror_run_escalation(
        &self,
        project_id: &str,
        run_id: &str,
        summary: &str,
        payload: Value,
    ) -> Result<Communication> {
        self.create_escalation(
            project_id,
            CreateEscalationRequest {
                comm_type: "need_input".to_string(),
                summary: summary.to_string(),
                body: String::new(),
                payload: Some(payload),
                run_id: Some(run_id.to_string()),
                shift_id: None,
                to_scope: Some(Scope::Global),
            },
        )
        .await
    }

    pub async fn resolve_run_mirrors(&self, run_id: &str, resolution: &str) -> Result<usize> {
        let mirrors = Communication::unresolved_for_run(&self.db, run_id).await?;
        let mut resolved = 0;
        for mirror in mirrors {
            match self.resolve(&mirror.id, Some(resolution)).await {
                Ok(_) => resolved += 1,
                Err(e) => warn!(
                    communication_id = %mirror.id,
                    run_id = %run_id,
                    "Failed to resolve run escalation mirror: {}",
                    e
                ),
            }
        }
        Ok(resolved)
    }

    /// Runs the decider over every open global item and applies exactly one
    /// decision to each. A failing item is logged and left for the next pass;
    /// a delegation to an unknown project is reported to the user instead.
    pub async fn triage_global(&self, decider: &dyn TriageDecider) -> Result<Vec<TriageOutcome>> {
        let items = Communication::open_for_scope(&self.db, Scope::Global).await?;
        let mut outcomes = Vec::with_capacity(items.len());

        for item in items {
            let decision = match decider.decide(&item).await {
                Ok(decision) => decision,
                Err(e) => {
                    warn!(communication_id = %item.id, "Triage decider failed: {}", e);
                    continue;
                }
            };
            let (decision, created) = match self.apply_decision(&item, &decision).await {
                Ok(created) => (decision, created),
                Err(AppError::StaleTransition { .. }) => {
                    debug!(communication_id = %item.id, "Item changed during triage, skipping");
                    continue;
                }
                Err(AppError::NotFound(message))
                    if matches!(decision, TriageDecision::Delegate { .. }) =>
                {
                    warn!(
                        communication_id = %item.id,
                        "Delegation target missing, reporting to user: {}",
                        message
                    );
                    match self.apply_decision(&item, &TriageDecision::Report).await {
                        Ok(created) => (TriageDecision::Report, created),
                        Err(e) => {
                            warn!(communication_id = %item.id, "Failed to report item: {}", e);
                            continue;
                        }
                    }
                }
                Err(e) => {
                    warn!(communication_id = %item.id, "Failed to apply triage decision: {}", e);
                    continue;
                }
            };

            info!(
                communication_id = %item.id,
                decision = ?decision,
                "Global communication triaged"
            );
            outcomes.push(TriageOutcome {
                communication_id: item.id.clone(),
                decision,
                created,
            });
        }

        Ok(outcomes)
    }

    async fn apply_decision(
        &self,
        item: &Communication,
        decision: &TriageDecision,
    ) -> Result<Option<Communication>> {
        match decision {
            TriageDecision::Resolve { resolution } => {
                self.transition(&item.id, item.intent.resolved_status(), Some(resolution))
                    .await?;
                Ok(None)
            }
            TriageDecision::Delegate { to_project_id } => {
                Project::require(&self.db, to_project_id).await?;
                let handed_off = match item.intent {
                    Intent::Escalation => CommStatus::Claimed,
                    Intent::Request => CommStatus::Accepted,
                    _ => CommStatus::Read,
                };
                self.transition(&item.id, handed_off, Some("delegated"))
                    .await?;
                let delegated = self
                    .derive(item, Scope::Project, Some(to_project_id.clone()))
                    .await?;
                Ok(Some(delegated))
            }
            TriageDecision::Report => {
                if item.intent == Intent::Escalation {
                    self.escalate_to_user(&item.id).await?;
                    Ok(None)
                } else {
                    self.transition(&item.id, CommStatus::Closed, Some("reported to user"))
                        .await?;
                    let copy = self.derive(item, Scope::User, None).await?;
                    Ok(Some(copy))
                }
            }
            TriageDecision::Wait => Ok(None),
        }
    }

    /// New communication carrying `item`'s content to another scope.
    async fn derive(
        &self,
        item: &Communication,
        to_scope: Scope,
        to_project_id: Option<String>,
    ) -> Result<Communication> {
        Communication::insert(
            &self.db,
            NewCommunication {
                intent: item.intent,
                comm_type: item.comm_type.clone(),
                from_scope: Scope::Global,
                to_scope,
                project_id: item.project_id.clone(),
                to_project_id,
                run_id: item.run_id.clone(),
                shift_id: item.shift_id.clone(),
                parent_id: Some(item.id.clone()),
                summary: item.summary.clone(),
                body: item.body.clone(),
                payload: item.payload.as_ref().map(|p| p.0.clone()),
            },
        )
        .await
    }
}
