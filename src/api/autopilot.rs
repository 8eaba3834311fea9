use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json},
};

use crate::{database::autopilot::UpdatePolicyRequest, error::AppError, server::AppState};

pub async fn get_policy(
    State(state): State<AppState>,
    Path(project_id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let policy = state.autopilot.policy(&project_id).await?;

    Ok((StatusCode::OK, Json(policy)))
}

pub async fn update_policy(
    State(state): State<AppState>,
    Path(project_id): Path<String>,
    Json(req): Json<UpdatePolicyRequest>,
) -> Result<impl IntoResponse, AppError> {
    let policy = state.autopilot.update_policy(&project_id, req).await?;

    Ok((StatusCode::OK, Json(policy)))
}

pub async fn get_status(
    State(state): State<AppState>,
    Path(project_id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let status = state.autopilot.status(&project_id).await?;

    Ok((StatusCode::OK, Json(status)))
}

/// POST /api/projects/:project_id/autopilot/reset - lift a failure pause
pub async fn reset(
    State(state): State<AppState>,
    Path(project_id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let status = state.autopilot.reset(&project_id).await?;

    Ok((StatusCode::OK, Json(status)))
}

pub async fn tick(
    State(state): State<AppState>,
    Path(project_id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let tick = state.autopilot.tick(&project_id).await?;

    Ok((StatusCode::OK, Json(tick)))
}
