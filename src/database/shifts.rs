use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use super::DbPool;
use crate::error::{AppError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum ShiftStatus {
    Active,
    Completed,
    Expired,
}

/// A time-boxed unattended session over one project.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Shift {
    pub id: String,
    pub project_id: String,
    pub status: ShiftStatus,
    pub started_at: String,
    pub ends_at: String,
    pub completed_at: Option<String>,
    pub summary: Option<String>,
}

const SHIFT_COLUMNS: &str =
    "id, project_id, status, started_at, ends_at, completed_at, summary";

impl Shift {
    pub async fn start(pool: &DbPool, project_id: &str, minutes: i64) -> Result<Shift> {
        if minutes <= 0 {
            return Err(AppError::Validation(
                "shift length must be positive".to_string(),
            ));
        }

        sqlx::query_as::<_, Shift>(&format!(
            r#"
            INSERT INTO shifts (id, project_id, ends_at)
            VALUES (?1, ?2, datetime('now', ?3))
            RETURNING {}
        "#,
            SHIFT_COLUMNS
        ))
        .bind(Uuid::new_v4().to_string())
        .bind(project_id)
        .bind(format!("+{} minutes", minutes))
        .fetch_one(pool)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(ref db_err) if db_err.is_unique_violation() => {
                AppError::Validation(format!(
                    "project '{}' already has an active shift",
                    project_id
                ))
            }
            other => AppError::Database(other),
        })
    }

    pub async fn get(pool: &DbPool, shift_id: &str) -> Result<Option<Shift>> {
        let shift = sqlx::query_as::<_, Shift>(&format!(
            "SELECT {} FROM shifts WHERE id = ?1",
            SHIFT_COLUMNS
        ))
        .bind(shift_id)
        .fetch_optional(pool)
        .await?;

        Ok(shift)
    }

    pub async fn active(pool: &DbPool, project_id: &str) -> Result<Option<Shift>> {
        let shift = sqlx::query_as::<_, Shift>(&format!(
            "SELECT {} FROM shifts WHERE project_id = ?1 AND status = 'active'",
            SHIFT_COLUMNS
        ))
        .bind(project_id)
        .fetch_optional(pool)
        .await?;

        Ok(shift)
    }

    pub async fn count_active(pool: &DbPool) -> Result<i64> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM shifts WHERE status = 'active'")
                .fetch_one(pool)
                .await?;
        Ok(count)
    }

    pub async fn complete(pool: &DbPool, shift_id: &str, summary: Option<&str>) -> Result<Shift> {
        sqlx::query_as::<_, Shift>(&format!(
            r#"
            UPDATE shifts
            SET status = 'completed', completed_at = datetime('now'), summary = ?1
            WHERE id = ?2 AND status = 'active'
            RETURNING {}
        "#,
            SHIFT_COLUMNS
        ))
        .bind(summary)
        .bind(shift_id)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Active shift '{}' not found", shift_id)))
    }

    /// Closes every active shift whose end time has passed.
    pub async fn expire_overdue(pool: &DbPool) -> Result<Vec<Shift>> {
        let expired = sqlx::query_as::<_, Shift>(&format!(
            r#"
            UPDATE shifts
            SET status = 'expired', completed_at = datetime('now')
            WHERE status = 'active' AND ends_at <= datetime('now')
            RETURNING {}
        "#,
            SHIFT_COLUMNS
        ))
        .fetch_all(pool)
        .await?;

        Ok(expired)
    }
}
