use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json},
};
use serde::Deserialize;

use crate::{
    database::{
        projects::Project,
        work_orders::{
            CreateWorkOrderRequest, UpdateWorkOrderRequest, WorkOrder, WorkOrderStatus,
        },
    },
    error::AppError,
    server::AppState,
};

#[derive(Debug, Deserialize)]
pub struct WorkOrderFilter {
    pub status: Option<WorkOrderStatus>,
}

#[derive(Debug, Deserialize)]
pub struct WorkOrderStatusRequest {
    pub status: WorkOrderStatus,
}

/// GET /api/projects/:project_id/work-orders
pub async fn list_work_orders(
    State(state): State<AppState>,
    Path(project_id): Path<String>,
    Query(filter): Query<WorkOrderFilter>,
) -> Result<impl IntoResponse, AppError> {
    Project::require(&state.db, &project_id).await?;
    let work_orders = WorkOrder::list(&state.db, &project_id, filter.status).await?;

    Ok((StatusCode::OK, Json(work_orders)))
}

/// POST /api/projects/:project_id/work-orders
pub async fn create_work_order(
    State(state): State<AppState>,
    Path(project_id): Path<String>,
    Json(req): Json<CreateWorkOrderRequest>,
) -> Result<impl IntoResponse, AppError> {
    Project::require(&state.db, &project_id).await?;
    let work_order = WorkOrder::create(&state.db, &project_id, req).await?;

    Ok((StatusCode::CREATED, Json(work_order)))
}

pub async fn get_work_order(
    State(state): State<AppState>,
    Path(work_order_id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let work_order = WorkOrder::require(&state.db, &work_order_id).await?;

    Ok((StatusCode::OK, Json(work_order)))
}

pub async fn update_work_order(
    State(state): State<AppState>,
    Path(work_order_id): Path<String>,
    Json(req): Json<UpdateWorkOrderRequest>,
) -> Result<impl IntoResponse, AppError> {
    let work_order = WorkOrder::update(&state.db, &work_order_id, req).await?;

    Ok((StatusCode::OK, Json(work_order)))
}

/// POST /api/work-orders/:work_order_id/status - direct edits only
pub async fn set_work_order_status(
    State(state): State<AppState>,
    Path(work_order_id): Path<String>,
    Json(req): Json<WorkOrderStatusRequest>,
) -> Result<impl IntoResponse, AppError> {
    let work_order = WorkOrder::set_status(&state.db, &work_order_id, req.status).await?;

    Ok((StatusCode::OK, Json(work_order)))
}

pub async fn ready_check(
    State(state): State<AppState>,
    Path(work_order_id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let work_order = WorkOrder::require(&state.db, &work_order_id).await?;

    Ok((StatusCode::OK, Json(work_order.ready_check())))
}
