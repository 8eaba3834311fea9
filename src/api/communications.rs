use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json},
};
use serde::Deserialize;

use crate::{
    communications::{
        router::{CreateCommunicationRequest, CreateEscalationRequest},
        CommStatus, RuleTriage,
    },
    error::AppError,
    server::AppState,
};

/// Optional body for lifecycle actions.
#[derive(Debug, Default, Deserialize)]
pub struct ResolutionRequest {
    pub resolution: Option<String>,
}

pub async fn create_escalation(
    State(state): State<AppState>,
    Path(project_id): Path<String>,
    Json(req): Json<CreateEscalationRequest>,
) -> Result<impl IntoResponse, AppError> {
    let escalation = state.router.create_escalation(&project_id, req).await?;

    Ok((StatusCode::CREATED, Json(escalation)))
}

pub async fn create_project_communication(
    State(state): State<AppState>,
    Path(project_id): Path<String>,
    Json(req): Json<CreateCommunicationRequest>,
) -> Result<impl IntoResponse, AppError> {
    let communication = state
        .router
        .create_communication(Some(&project_id), req)
        .await?;

    Ok((StatusCode::CREATED, Json(communication)))
}

/// POST /api/communications - sent from global scope
pub async fn create_global_communication(
    State(state): State<AppState>,
    Json(req): Json<CreateCommunicationRequest>,
) -> Result<impl IntoResponse, AppError> {
    let communication = state.router.create_communication(None, req).await?;

    Ok((StatusCode::CREATED, Json(communication)))
}

pub async fn get_communication(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let communication = state.router.get(&id).await?;

    Ok((StatusCode::OK, Json(communication)))
}

/// POST /api/communications/:id/:action
pub async fn communication_action(
    State(state): State<AppState>,
    Path((id, action)): Path<(String, String)>,
    body: Option<Json<ResolutionRequest>>,
) -> Result<impl IntoResponse, AppError> {
    let resolution = body.and_then(|Json(b)| b.resolution);
    let target = match action.as_str() {
        "claim" => CommStatus::Claimed,
        "resolve" => CommStatus::Resolved,
        "escalate" => CommStatus::EscalatedToUser,
        "read" => CommStatus::Read,
        "acknowledge" => CommStatus::Acknowledged,
        "accept" => CommStatus::Accepted,
        "decline" => CommStatus::Declined,
        "close" => CommStatus::Closed,
        other => {
            return Err(AppError::NotFound(format!(
                "Unknown communication action '{}'",
                other
            )))
        }
    };
    let communication = state
        .router
        .transition(&id, target, resolution.as_deref())
        .await?;

    Ok((StatusCode::OK, Json(communication)))
}

pub async fn project_inbox(
    State(state): State<AppState>,
    Path(project_id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let items = state.router.inbox(&project_id).await?;

    Ok((StatusCode::OK, Json(items)))
}

pub async fn global_inbox(State(state): State<AppState>) -> Result<impl IntoResponse, AppError> {
    let items = state.router.global_inbox().await?;

    Ok((StatusCode::OK, Json(items)))
}

pub async fn user_inbox(State(state): State<AppState>) -> Result<impl IntoResponse, AppError> {
    let items = state.router.user_inbox().await?;

    Ok((StatusCode::OK, Json(items)))
}

/// GET /api/human-queue - escalations waiting on a person
pub async fn human_queue(State(state): State<AppState>) -> Result<impl IntoResponse, AppError> {
    let items = state.router.human_queue().await?;

    Ok((StatusCode::OK, Json(items)))
}

/// POST /api/triage - run one global triage pass now
pub async fn triage(State(state): State<AppState>) -> Result<impl IntoResponse, AppError> {
    let outcomes = state.router.triage_global(&RuleTriage).await?;

    Ok((StatusCode::OK, Json(outcomes)))
}
