use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use super::DbPool;
use crate::error::{AppError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum ProjectStatus {
    Active,
    Blocked,
    Parked,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Project {
    pub id: String,
    pub name: String,
    pub path: String,
    pub base_branch: String,
    pub status: ProjectStatus,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Deserialize)]
pub struct CreateProjectRequest {
    pub name: String,
    pub path: String,
    pub base_branch: Option<String>,
}

impl Project {
    pub async fn create(pool: &DbPool, req: CreateProjectRequest) -> Result<Project> {
        if req.name.trim().is_empty() {
            return Err(AppError::Validation("project name is required".to_string()));
        }

        let project = sqlx::query_as::<_, Project>(
            r#"
            INSERT INTO projects (id, name, path, base_branch)
            VALUES (?1, ?2, ?3, ?4)
            RETURNING id, name, path, base_branch, status, created_at, updated_at
        "#,
        )
        .bind(Uuid::new_v4().to_string())
        .bind(req.name.trim())
        .bind(&req.path)
        .bind(req.base_branch.as_deref().unwrap_or("main"))
        .fetch_one(pool)
        .await?;

        Ok(project)
    }

    pub async fn get(pool: &DbPool, project_id: &str) -> Result<Option<Project>> {
        let project = sqlx::query_as::<_, Project>(
            r#"
            SELECT id, name, path, base_branch, status, created_at, updated_at
            FROM projects
            WHERE id = ?1
        "#,
        )
        .bind(project_id)
        .fetch_optional(pool)
        .await?;

        Ok(project)
    }

    pub async fn require(pool: &DbPool, project_id: &str) -> Result<Project> {
        Self::get(pool, project_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Project '{}' not found", project_id)))
    }

    pub async fn list(pool: &DbPool) -> Result<Vec<Project>> {
        let projects = sqlx::query_as::<_, Project>(
            r#"
            SELECT id, name, path, base_branch, status, created_at, updated_at
            FROM projects
            ORDER BY created_at ASC, name ASC
        "#,
        )
        .fetch_all(pool)
        .await?;

        Ok(projects)
    }

    pub async fn set_status(
        pool: &DbPool,
        project_id: &str,
        status: ProjectStatus,
    ) -> Result<Project> {
        sqlx::query_as::<_, Project>(
            r#"
            UPDATE projects SET status = ?1, updated_at = datetime('now')
            WHERE id = ?2
            RETURNING id, name, path, base_branch, status, created_at, updated_at
        "#,
        )
        .bind(status)
        .bind(project_id)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Project '{}' not found", project_id)))
    }

    pub async fn count_by_status(pool: &DbPool) -> Result<Vec<(ProjectStatus, i64)>> {
        let counts = sqlx::query_as::<_, (ProjectStatus, i64)>(
            "SELECT status, COUNT(*) FROM projects GROUP BY status",
        )
        .fetch_all(pool)
        .await?;

        Ok(counts)
    }
}
