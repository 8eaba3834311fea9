use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json},
};
use serde::Deserialize;
use serde_json::{Map, Value};

use crate::{
    error::AppError,
    runs::{
        controller::CreateRunRequest, PatchRunRequest, RunStatus, SecurityVerdict, TriggeredBy,
    },
    server::AppState,
};

#[derive(Debug, Deserialize)]
pub struct RunFilter {
    pub project_id: Option<String>,
    pub status: Option<RunStatus>,
}

#[derive(Debug, Deserialize)]
pub struct SecurityHoldRequest {
    pub reason: String,
}

#[derive(Debug, Deserialize)]
pub struct SecurityVerdictRequest {
    pub verdict: SecurityVerdict,
    pub notes: Option<String>,
}

/// POST /api/projects/:project_id/runs - create a run and start driving it
pub async fn create_run(
    State(state): State<AppState>,
    Path(project_id): Path<String>,
    Json(req): Json<CreateRunRequest>,
) -> Result<impl IntoResponse, AppError> {
    let run = state
        .controller
        .launch(
            &project_id,
            &req.work_order_id,
            TriggeredBy::Manual,
            req.provider.as_deref(),
        )
        .await?;

    Ok((StatusCode::CREATED, Json(run)))
}

pub async fn list_runs(
    State(state): State<AppState>,
    Query(filter): Query<RunFilter>,
) -> Result<impl IntoResponse, AppError> {
    let runs = state
        .controller
        .list(filter.project_id.as_deref(), filter.status)
        .await?;

    Ok((StatusCode::OK, Json(runs)))
}

pub async fn get_run(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let run = state.controller.get(&run_id).await?;

    Ok((StatusCode::OK, Json(run)))
}

/// PATCH /api/runs/:run_id - manual conflict resolution and annotations
pub async fn patch_run(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
    Json(req): Json<PatchRunRequest>,
) -> Result<impl IntoResponse, AppError> {
    let run = state.controller.patch(&run_id, req).await?;

    Ok((StatusCode::OK, Json(run)))
}

pub async fn cancel_run(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let run = state.controller.cancel(&run_id).await?;

    Ok((StatusCode::OK, Json(run)))
}

/// POST /api/runs/:run_id/input - body is `{key: value, ...}`
pub async fn provide_input(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
    Json(inputs): Json<Map<String, Value>>,
) -> Result<impl IntoResponse, AppError> {
    let run = state.controller.provide_input(&run_id, inputs).await?;

    Ok((StatusCode::OK, Json(run)))
}

pub async fn approve_run(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let run = state.controller.approve(&run_id).await?;

    Ok((StatusCode::OK, Json(run)))
}

pub async fn flag_security(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
    Json(req): Json<SecurityHoldRequest>,
) -> Result<impl IntoResponse, AppError> {
    if req.reason.trim().is_empty() {
        return Err(AppError::BadRequest("reason is required".to_string()));
    }
    let run = state.controller.flag_security(&run_id, &req.reason).await?;

    Ok((StatusCode::OK, Json(run)))
}

pub async fn security_verdict(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
    Json(req): Json<SecurityVerdictRequest>,
) -> Result<impl IntoResponse, AppError> {
    let run = state
        .controller
        .resolve_security_hold(&run_id, req.verdict, req.notes)
        .await?;

    Ok((StatusCode::OK, Json(run)))
}
