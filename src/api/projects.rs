use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json},
};
use serde::Deserialize;

use crate::{
    database::projects::{CreateProjectRequest, Project, ProjectStatus},
    error::AppError,
    server::AppState,
};

#[derive(Debug, Deserialize)]
pub struct ProjectStatusRequest {
    pub status: ProjectStatus,
}

/// GET /api/projects - List all projects
pub async fn list_projects(State(state): State<AppState>) -> Result<impl IntoResponse, AppError> {
    let projects = Project::list(&state.db).await?;

    Ok((StatusCode::OK, Json(projects)))
}

/// POST /api/projects
pub async fn create_project(
    State(state): State<AppState>,
    Json(req): Json<CreateProjectRequest>,
) -> Result<impl IntoResponse, AppError> {
    let project = Project::create(&state.db, req).await?;

    Ok((StatusCode::CREATED, Json(project)))
}

/// GET /api/projects/:project_id - Get specific project by ID
pub async fn get_project(
    State(state): State<AppState>,
    Path(project_id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let project = Project::require(&state.db, &project_id).await?;

    Ok((StatusCode::OK, Json(project)))
}

/// POST /api/projects/:project_id/status
pub async fn set_project_status(
    State(state): State<AppState>,
    Path(project_id): Path<String>,
    Json(req): Json<ProjectStatusRequest>,
) -> Result<impl IntoResponse, AppError> {
    let project = Project::set_status(&state.db, &project_id, req.status).await?;

    Ok((StatusCode::OK, Json(project)))
}
