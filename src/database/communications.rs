use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::{types::Json, FromRow};
use uuid::Uuid;

use super::DbPool;
use crate::communications::lifecycle::{CommStatus, Intent, Scope};
use crate::error::{AppError, Result};

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Communication {
    pub id: String,
    pub intent: Intent,
    #[serde(rename = "type")]
    pub comm_type: Option<String>,
    pub from_scope: Scope,
    pub to_scope: Scope,
    pub project_id: Option<String>,
    pub to_project_id: Option<String>,
    pub run_id: Option<String>,
    pub shift_id: Option<String>,
    pub parent_id: Option<String>,
    pub summary: String,
    pub body: String,
    pub payload: Option<Json<Value>>,
    pub status: CommStatus,
    pub resolution: Option<String>,
    pub created_at: String,
    pub updated_at: String,
    pub resolved_at: Option<String>,
}

#[derive(Debug, Clone)]
pub struct NewCommunication {
    pub intent: Intent,
    pub comm_type: Option<String>,
    pub from_scope: Scope,
    pub to_scope: Scope,
    pub project_id: Option<String>,
    pub to_project_id: Option<String>,
    pub run_id: Option<String>,
    pub shift_id: Option<String>,
    pub parent_id: Option<String>,
    pub summary: String,
    pub body: String,
    pub payload: Option<Value>,
}

const COMM_COLUMNS: &str = r#"
    id, intent, comm_type, from_scope, to_scope, project_id, to_project_id, run_id, shift_id,
    parent_id, summary, body, payload, status, resolution, created_at, updated_at, resolved_at
"#;

/// Statuses after which an item no longer shows up in any inbox.
const FINAL_STATUSES: &str = "('resolved', 'closed', 'declined')";

impl Communication {
    pub async fn insert(pool: &DbPool, new: NewCommunication) -> Result<Communication> {
        let communication = sqlx::query_as::<_, Communication>(&format!(
            r#"
            INSERT INTO communications (
                id, intent, comm_type, from_scope, to_scope, project_id, to_project_id,
                run_id, shift_id, parent_id, summary, body, payload
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
            RETURNING {}
        "#,
            COMM_COLUMNS
        ))
        .bind(Uuid::new_v4().to_string())
        .bind(new.intent)
        .bind(&new.comm_type)
        .bind(new.from_scope)
        .bind(new.to_scope)
        .bind(&new.project_id)
        .bind(&new.to_project_id)
        .bind(&new.run_id)
        .bind(&new.shift_id)
        .bind(&new.parent_id)
        .bind(&new.summary)
        .bind(&new.body)
        .bind(new.payload.map(Json))
        .fetch_one(pool)
        .await?;

        Ok(communication)
    }

    pub async fn get(pool: &DbPool, id: &str) -> Result<Option<Communication>> {
        let communication = sqlx::query_as::<_, Communication>(&format!(
            "SELECT {} FROM communications WHERE id = ?1",
            COMM_COLUMNS
        ))
        .bind(id)
        .fetch_optional(pool)
        .await?;

        Ok(communication)
    }

    pub async fn require(pool: &DbPool, id: &str) -> Result<Communication> {
        Self::get(pool, id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Communication '{}' not found", id)))
    }

    /// Compare-and-swap on status. Returns `None` when the row moved on.
    pub async fn swap_status(
        pool: &DbPool,
        id: &str,
        from: CommStatus,
        to: CommStatus,
        resolution: Option<&str>,
        closes: bool,
    ) -> Result<Option<Communication>> {
        let communication = sqlx::query_as::<_, Communication>(&format!(
            r#"
            UPDATE communications SET
                status = ?1,
                resolution = COALESCE(?2, resolution),
                updated_at = datetime('now'),
                resolved_at = CASE WHEN ?3 THEN datetime('now') ELSE resolved_at END
            WHERE id = ?4 AND status = ?5
            RETURNING {}
        "#,
            COMM_COLUMNS
        ))
        .bind(to)
        .bind(resolution)
        .bind(closes)
        .bind(id)
        .bind(from)
        .fetch_optional(pool)
        .await?;

        Ok(communication)
    }

    pub async fn project_inbox(pool: &DbPool, project_id: &str) -> Result<Vec<Communication>> {
        let items = sqlx::query_as::<_, Communication>(&format!(
            r#"
            SELECT {} FROM communications
            WHERE to_scope = 'project' AND to_project_id = ?1 AND status NOT IN {}
            ORDER BY created_at ASC, rowid ASC
        "#,
            COMM_COLUMNS, FINAL_STATUSES
        ))
        .bind(project_id)
        .fetch_all(pool)
        .await?;

        Ok(items)
    }

    pub async fn scope_inbox(pool: &DbPool, scope: Scope) -> Result<Vec<Communication>> {
        let items = sqlx::query_as::<_, Communication>(&format!(
            r#"
            SELECT {} FROM communications
            WHERE to_scope = ?1 AND status NOT IN {}
            ORDER BY created_at ASC, rowid ASC
        "#,
            COMM_COLUMNS, FINAL_STATUSES
        ))
        .bind(scope)
        .fetch_all(pool)
        .await?;

        Ok(items)
    }

    pub async fn open_for_scope(pool: &DbPool, scope: Scope) -> Result<Vec<Communication>> {
        let items = sqlx::query_as::<_, Communication>(&format!(
            r#"
            SELECT {} FROM communications
            WHERE to_scope = ?1 AND status = 'open'
            ORDER BY created_at ASC, rowid ASC
        "#,
            COMM_COLUMNS
        ))
        .bind(scope)
        .fetch_all(pool)
        .await?;

        Ok(items)
    }

    /// Escalations waiting on a human, from any scope.
    pub async fn escalated_to_user(pool: &DbPool) -> Result<Vec<Communication>> {
        let items = sqlx::query_as::<_, Communication>(&format!(
            r#"
            SELECT {} FROM communications
            WHERE intent = 'escalation' AND status = 'escalated_to_user'
            ORDER BY created_at ASC, rowid ASC
        "#,
            COMM_COLUMNS
        ))
        .fetch_all(pool)
        .await?;

        Ok(items)
    }

    pub async fn unresolved_for_run(pool: &DbPool, run_id: &str) -> Result<Vec<Communication>> {
        let items = sqlx::query_as::<_, Communication>(&format!(
            r#"
            SELECT {} FROM communications
            WHERE run_id = ?1 AND intent = 'escalation' AND status NOT IN {}
        "#,
            COMM_COLUMNS, FINAL_STATUSES
        ))
        .bind(run_id)
        .fetch_all(pool)
        .await?;

        Ok(items)
    }

    pub async fn open_escalation_of_type(
        pool: &DbPool,
        project_id: &str,
        comm_type: &str,
    ) -> Result<Option<Communication>> {
        let item = sqlx::query_as::<_, Communication>(&format!(
            r#"
            SELECT {} FROM communications
            WHERE project_id = ?1 AND intent = 'escalation' AND comm_type = ?2
              AND status NOT IN {}
            LIMIT 1
        "#,
            COMM_COLUMNS, FINAL_STATUSES
        ))
        .bind(project_id)
        .bind(comm_type)
        .fetch_optional(pool)
        .await?;

        Ok(item)
    }

    pub async fn count_open_escalations(pool: &DbPool, project_id: Option<&str>) -> Result<i64> {
        let query = format!(
            r#"
            SELECT COUNT(*) FROM communications
            WHERE intent = 'escalation' AND status NOT IN {}
            {}
        "#,
            FINAL_STATUSES,
            if project_id.is_some() {
                "AND project_id = ?1"
            } else {
                ""
            }
        );
        let mut q = sqlx::query_as::<_, (i64,)>(&query);
        if let Some(project_id) = project_id {
            q = q.bind(project_id);
        }
        let (count,) = q.fetch_one(pool).await?;
        Ok(count)
    }
}
