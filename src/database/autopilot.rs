use serde::{Deserialize, Serialize};
use sqlx::{types::Json, FromRow, SqliteConnection};
use tracing::debug;

use super::DbPool;
use crate::error::{AppError, Result};

/// Persisted per-project autopilot policy, including the durable failure
/// counter.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct AutopilotPolicy {
    pub project_id: String,
    pub enabled: bool,
    pub max_concurrent_runs: i64,
    pub allowed_tags: Json<Vec<String>>,
    pub min_priority: Option<i64>,
    pub stop_on_failure_count: i64,
    pub schedule_cron: Option<String>,
    pub failure_count: i64,
    pub updated_at: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct UpdatePolicyRequest {
    pub enabled: Option<bool>,
    pub max_concurrent_runs: Option<i64>,
    pub allowed_tags: Option<Vec<String>>,
    pub min_priority: Option<i64>,
    pub stop_on_failure_count: Option<i64>,
    pub schedule_cron: Option<String>,
}

impl AutopilotPolicy {
    pub fn disabled(project_id: &str) -> Self {
        Self {
            project_id: project_id.to_string(),
            enabled: false,
            max_concurrent_runs: 1,
            allowed_tags: Json(Vec::new()),
            min_priority: None,
            stop_on_failure_count: 3,
            schedule_cron: None,
            failure_count: 0,
            updated_at: String::new(),
        }
    }

    pub async fn get(pool: &DbPool, project_id: &str) -> Result<AutopilotPolicy> {
        let policy = sqlx::query_as::<_, AutopilotPolicy>(
            r#"
            SELECT project_id, enabled, max_concurrent_runs, allowed_tags, min_priority,
                   stop_on_failure_count, schedule_cron, failure_count, updated_at
            FROM autopilot_policies
            WHERE project_id = ?1
        "#,
        )
        .bind(project_id)
        .fetch_optional(pool)
        .await?;

        Ok(policy.unwrap_or_else(|| Self::disabled(project_id)))
    }

    pub async fn list_enabled(pool: &DbPool) -> Result<Vec<AutopilotPolicy>> {
        let policies = sqlx::query_as::<_, AutopilotPolicy>(
            r#"
            SELECT project_id, enabled, max_concurrent_runs, allowed_tags, min_priority,
                   stop_on_failure_count, schedule_cron, failure_count, updated_at
            FROM autopilot_policies
            WHERE enabled = 1
            ORDER BY project_id ASC
        "#,
        )
        .fetch_all(pool)
        .await?;

        Ok(policies)
    }

    /// Merges the request into the stored policy. The failure counter is
    /// never touched here.
    pub async fn upsert(
        pool: &DbPool,
        project_id: &str,
        req: UpdatePolicyRequest,
    ) -> Result<AutopilotPolicy> {
        let mut policy = Self::get(pool, project_id).await?;

        if let Some(enabled) = req.enabled {
            policy.enabled = enabled;
        }
        if let Some(max) = req.max_concurrent_runs {
            if max < 1 {
                return Err(AppError::Validation(
                    "max_concurrent_runs must be at least 1".to_string(),
                ));
            }
            policy.max_concurrent_runs = max;
        }
        if let Some(tags) = req.allowed_tags {
            policy.allowed_tags = Json(tags);
        }
        if let Some(min_priority) = req.min_priority {
            if !(1..=5).contains(&min_priority) {
                return Err(AppError::Validation(
                    "min_priority must be between 1 and 5".to_string(),
                ));
            }
            policy.min_priority = Some(min_priority);
        }
        if let Some(stop) = req.stop_on_failure_count {
            if stop < 0 {
                return Err(AppError::Validation(
                    "stop_on_failure_count must not be negative".to_string(),
                ));
            }
            policy.stop_on_failure_count = stop;
        }
        if let Some(cron) = req.schedule_cron {
            policy.schedule_cron = Some(cron).filter(|c| !c.trim().is_empty());
        }

        let stored = sqlx::query_as::<_, AutopilotPolicy>(
            r#"
            INSERT INTO autopilot_policies (
                project_id, enabled, max_concurrent_runs, allowed_tags, min_priority,
                stop_on_failure_count, schedule_cron
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ON CONFLICT(project_id) DO UPDATE SET
                enabled = excluded.enabled,
                max_concurrent_runs = excluded.max_concurrent_runs,
                allowed_tags = excluded.allowed_tags,
                min_priority = excluded.min_priority,
                stop_on_failure_count = excluded.stop_on_failure_count,
                schedule_cron = excluded.schedule_cron,
                updated_at = datetime('now')
            RETURNING project_id, enabled, max_concurrent_runs, allowed_tags, min_priority,
                      stop_on_failure_count, schedule_cron, failure_count, updated_at
        "#,
        )
        .bind(project_id)
        .bind(policy.enabled)
        .bind(policy.max_concurrent_runs)
        .bind(&policy.allowed_tags)
        .bind(policy.min_priority)
        .bind(policy.stop_on_failure_count)
        .bind(&policy.schedule_cron)
        .fetch_one(pool)
        .await?;

        Ok(stored)
    }

    pub(crate) async fn record_failure(conn: &mut SqliteConnection, project_id: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE autopilot_policies
            SET failure_count = failure_count + 1, updated_at = datetime('now')
            WHERE project_id = ?1
        "#,
        )
        .bind(project_id)
        .execute(conn)
        .await?;
        debug!(project_id = %project_id, "Autopilot failure recorded");
        Ok(())
    }

    pub(crate) async fn reset_failures(conn: &mut SqliteConnection, project_id: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE autopilot_policies
            SET failure_count = 0, updated_at = datetime('now')
            WHERE project_id = ?1
        "#,
        )
        .bind(project_id)
        .execute(conn)
        .await?;
        Ok(())
    }

    /// Manual reset that lifts a paused autopilot.
    pub async fn reset(pool: &DbPool, project_id: &str) -> Result<AutopilotPolicy> {
        let mut conn = pool.acquire().await?;
        Self::reset_failures(&mut *conn, project_id).await?;
        drop(conn);
        Self::get(pool, project_id).await
    }
}
