use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json},
};

use crate::{
    error::AppError,
    server::AppState,
    shift::{CompleteShiftRequest, StartShiftRequest},
};

pub async fn budget(State(state): State<AppState>) -> Result<impl IntoResponse, AppError> {
    let summary = state.budget.summary().await?;

    Ok((StatusCode::OK, Json(summary)))
}

pub async fn global_context(State(state): State<AppState>) -> Result<impl IntoResponse, AppError> {
    let context = state.scheduler.global_context().await?;

    Ok((StatusCode::OK, Json(context)))
}

pub async fn project_context(
    State(state): State<AppState>,
    Path(project_id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let context = state.scheduler.shift_context(&project_id).await?;

    Ok((StatusCode::OK, Json(context)))
}

pub async fn start_shift(
    State(state): State<AppState>,
    Path(project_id): Path<String>,
    body: Option<Json<StartShiftRequest>>,
) -> Result<impl IntoResponse, AppError> {
    let minutes = body.and_then(|Json(b)| b.minutes);
    let shift = state.scheduler.start_shift(&project_id, minutes).await?;

    Ok((StatusCode::CREATED, Json(shift)))
}

pub async fn active_shift(
    State(state): State<AppState>,
    Path(project_id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let shift = state.scheduler.active_shift(&project_id).await?;

    Ok((StatusCode::OK, Json(shift)))
}

pub async fn complete_shift(
    State(state): State<AppState>,
    Path(shift_id): Path<String>,
    body: Option<Json<CompleteShiftRequest>>,
) -> Result<impl IntoResponse, AppError> {
    let summary = body.and_then(|Json(b)| b.summary);
    let shift = state
        .scheduler
        .complete_shift(&shift_id, summary.as_deref())
        .await?;

    Ok((StatusCode::OK, Json(shift)))
}

/// POST /api/scheduler/tick - one scheduler pass on demand
pub async fn scheduler_tick(State(state): State<AppState>) -> Result<impl IntoResponse, AppError> {
    let tick = state.scheduler.tick().await?;

    Ok((StatusCode::OK, Json(tick)))
}
