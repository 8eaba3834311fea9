use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sqlx::{types::Json, FromRow};
use tracing::{debug, info};

use super::autopilot::AutopilotPolicy;
use super::work_orders::WorkOrder;
use super::DbPool;
use crate::error::{AppError, Result};
use crate::runs::escalation::EscalationPayload;
use crate::runs::status::{ReviewerVerdict, RunEvent, RunStatus, TriggeredBy};

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Run {
    pub id: String,
    pub project_id: String,
    pub work_order_id: String,
    pub provider: String,
    pub triggered_by: TriggeredBy,
    pub status: RunStatus,
    pub iteration: i64,
    pub test_failures: i64,
    pub baseline_passed: bool,
    pub reviewer_verdict: Option<ReviewerVerdict>,
    pub reviewer_notes: Option<String>,
    pub escalation: Option<Json<EscalationPayload>>,
    pub provided_inputs: Option<Json<Map<String, Value>>>,
    pub failure_reason: Option<String>,
    pub error: Option<String>,
    pub merge_status: Option<String>,
    pub security_reason: Option<String>,
    pub run_dir: Option<String>,
    pub branch: Option<String>,
    pub log_path: String,
    pub last_log_excerpt: Option<String>,
    pub last_test_output: Option<String>,
    pub pid: Option<i64>,
    pub cost_usd: f64,
    pub created_at: String,
    pub updated_at: String,
    pub finished_at: Option<String>,
}

#[derive(Debug, Clone)]
pub struct NewRun {
    pub id: String,
    pub project_id: String,
    pub work_order_id: String,
    pub provider: String,
    pub triggered_by: TriggeredBy,
    pub log_path: String,
}

/// Column changes applied together with a status transition. `None`
/// leaves the column untouched.
#[derive(Debug, Default, Clone)]
pub struct RunPatch {
    pub bump_iteration: bool,
    pub bump_test_failures: bool,
    pub reviewer_verdict: Option<ReviewerVerdict>,
    pub reviewer_notes: Option<String>,
    pub escalation: Option<EscalationPayload>,
    pub provided_inputs: Option<Map<String, Value>>,
    pub failure_reason: Option<String>,
    pub error: Option<String>,
    pub merge_status: Option<String>,
    pub security_reason: Option<String>,
    pub run_dir: Option<String>,
    pub branch: Option<String>,
    pub last_log_excerpt: Option<String>,
    pub last_test_output: Option<String>,
    pub clear_pid: bool,
}

impl RunPatch {
    pub fn failure(reason: &str, error: impl Into<String>) -> Self {
        Self {
            failure_reason: Some(reason.to_string()),
            error: Some(error.into()),
            ..Default::default()
        }
    }
}

const RUN_COLUMNS: &str = r#"
    id, project_id, work_order_id, provider, triggered_by, status, iteration, test_failures,
    baseline_passed, reviewer_verdict, reviewer_notes, escalation, provided_inputs,
    failure_reason, error, merge_status, security_reason, run_dir, branch, log_path,
    last_log_excerpt, last_test_output, pid, cost_usd, created_at, updated_at, finished_at
"#;

impl Run {
    pub fn is_active(&self) -> bool {
        !self.status.is_terminal()
    }

    pub fn escalation_payload(&self) -> Option<&EscalationPayload> {
        self.escalation.as_ref().map(|json| &json.0)
    }

    /// Inserts a `queued` run. The partial unique index on active runs turns
    /// a concurrent second insert for the same work order into
    /// `ActiveRunExists`.
    pub async fn insert(pool: &DbPool, new_run: NewRun) -> Result<Run> {
        let mut tx = pool.begin().await?;

        let run = sqlx::query_as::<_, Run>(&format!(
            r#"
            INSERT INTO runs (id, project_id, work_order_id, provider, triggered_by, status, log_path)
            VALUES (?1, ?2, ?3, ?4, ?5, 'queued', ?6)
            RETURNING {}
        "#,
            RUN_COLUMNS
        ))
        .bind(&new_run.id)
        .bind(&new_run.project_id)
        .bind(&new_run.work_order_id)
        .bind(&new_run.provider)
        .bind(new_run.triggered_by)
        .bind(&new_run.log_path)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(ref db_err) if db_err.is_unique_violation() => {
                AppError::ActiveRunExists {
                    work_order_id: new_run.work_order_id.clone(),
                }
            }
            other => AppError::Database(other),
        })?;

        WorkOrder::apply_run_status(
            &mut *tx,
            &run.work_order_id,
            RunStatus::Queued.work_order_status(),
        )
        .await?;

        tx.commit().await?;

        info!(
            run_id = %run.id,
            work_order_id = %run.work_order_id,
            triggered_by = ?run.triggered_by,
            "Run queued"
        );
        Ok(run)
    }

    pub async fn get(pool: &DbPool, run_id: &str) -> Result<Option<Run>> {
        let run = sqlx::query_as::<_, Run>(&format!("SELECT {} FROM runs WHERE id = ?1", RUN_COLUMNS))
            .bind(run_id)
            .fetch_optional(pool)
            .await?;

        Ok(run)
    }

    pub async fn require(pool: &DbPool, run_id: &str) -> Result<Run> {
        Self::get(pool, run_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Run '{}' not found", run_id)))
    }

    pub async fn list(
        pool: &DbPool,
        project_id: Option<&str>,
        status_filter: Option<RunStatus>,
    ) -> Result<Vec<Run>> {
        let mut query = format!("SELECT {} FROM runs WHERE 1 = 1", RUN_COLUMNS);
        if project_id.is_some() {
            query.push_str(" AND project_id = ?1");
        }
        if status_filter.is_some() {
            query.push_str(if project_id.is_some() {
                " AND status = ?2"
            } else {
                " AND status = ?1"
            });
        }
        query.push_str(" ORDER BY created_at DESC, id ASC");

        let mut q = sqlx::query_as::<_, Run>(&query);
        if let Some(project_id) = project_id {
            q = q.bind(project_id);
        }
        if let Some(status) = status_filter {
            q = q.bind(status);
        }

        Ok(q.fetch_all(pool).await?)
    }

    pub async fn list_in_statuses(pool: &DbPool, statuses: &[RunStatus]) -> Result<Vec<Run>> {
        if statuses.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders = (1..=statuses.len())
            .map(|i| format!("?{}", i))
            .collect::<Vec<_>>()
            .join(", ");
        let query = format!(
            "SELECT {} FROM runs WHERE status IN ({}) ORDER BY created_at ASC",
            RUN_COLUMNS, placeholders
        );

        let mut q = sqlx::query_as::<_, Run>(&query);
        for status in statuses {
            q = q.bind(*status);
        }

        Ok(q.fetch_all(pool).await?)
    }

    pub async fn active_for_work_order(pool: &DbPool, work_order_id: &str) -> Result<Option<Run>> {
        let run = sqlx::query_as::<_, Run>(&format!(
            r#"
            SELECT {} FROM runs
            WHERE work_order_id = ?1 AND status NOT IN ('merged', 'failed', 'canceled')
        "#,
            RUN_COLUMNS
        ))
        .bind(work_order_id)
        .fetch_optional(pool)
        .await?;

        Ok(run)
    }

    pub async fn active_for_project(
        pool: &DbPool,
        project_id: &str,
        triggered_by: Option<TriggeredBy>,
    ) -> Result<Vec<Run>> {
        let mut query = format!(
            r#"
            SELECT {} FROM runs
            WHERE project_id = ?1 AND status NOT IN ('merged', 'failed', 'canceled')
        "#,
            RUN_COLUMNS
        );
        if triggered_by.is_some() {
            query.push_str(" AND triggered_by = ?2");
        }
        query.push_str(" ORDER BY created_at ASC");

        let mut q = sqlx::query_as::<_, Run>(&query).bind(project_id);
        if let Some(triggered_by) = triggered_by {
            q = q.bind(triggered_by);
        }

        Ok(q.fetch_all(pool).await?)
    }

    pub async fn count_active(pool: &DbPool) -> Result<i64> {
        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM runs WHERE status NOT IN ('merged', 'failed', 'canceled')",
        )
        .fetch_one(pool)
        .await?;
        Ok(count)
    }

    /// Compare-and-swap status change. The update only lands if the run is
    /// still in `from`; the work order mirror and the autopilot failure
    /// counter commit in the same transaction.
    pub async fn transition(
        pool: &DbPool,
        run_id: &str,
        from: RunStatus,
        event: RunEvent,
        patch: RunPatch,
    ) -> Result<Run> {
        let to = from
            .apply(event)
            .ok_or_else(|| AppError::invalid_transition(from, event))?;
        let clear_pid = patch.clear_pid || to.is_terminal();

        let mut tx = pool.begin().await?;

        let updated = sqlx::query_as::<_, Run>(&format!(
            r#"
            UPDATE runs SET
                status = ?1,
                iteration = iteration + ?2,
                test_failures = test_failures + ?3,
                reviewer_verdict = COALESCE(?4, reviewer_verdict),
                reviewer_notes = COALESCE(?5, reviewer_notes),
                escalation = COALESCE(?6, escalation),
                provided_inputs = COALESCE(?7, provided_inputs),
                failure_reason = COALESCE(?8, failure_reason),
                error = COALESCE(?9, error),
                merge_status = COALESCE(?10, merge_status),
                security_reason = COALESCE(?11, security_reason),
                run_dir = COALESCE(?12, run_dir),
                branch = COALESCE(?13, branch),
                last_log_excerpt = COALESCE(?14, last_log_excerpt),
                last_test_output = COALESCE(?15, last_test_output),
                pid = CASE WHEN ?16 THEN NULL ELSE pid END,
                updated_at = datetime('now'),
                finished_at = CASE WHEN ?17 THEN datetime('now') ELSE finished_at END
            WHERE id = ?18 AND status = ?19
            RETURNING {}
        "#,
            RUN_COLUMNS
        ))
        .bind(to)
        .bind(i64::from(patch.bump_iteration))
        .bind(i64::from(patch.bump_test_failures))
        .bind(patch.reviewer_verdict)
        .bind(patch.reviewer_notes)
        .bind(patch.escalation.map(Json))
        .bind(patch.provided_inputs.map(Json))
        .bind(patch.failure_reason)
        .bind(patch.error)
        .bind(patch.merge_status)
        .bind(patch.security_reason)
        .bind(patch.run_dir)
        .bind(patch.branch)
        .bind(patch.last_log_excerpt)
        .bind(patch.last_test_output)
        .bind(clear_pid)
        .bind(to.is_terminal())
        .bind(run_id)
        .bind(from)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(run) = updated else {
            tx.rollback().await?;
            let current = Self::require(pool, run_id).await?;
            debug!(
                run_id = %run_id,
                expected = %from,
                actual = %current.status,
                event = %event,
                "Stale run transition rejected"
            );
            return Err(AppError::StaleTransition {
                id: run_id.to_string(),
                expected: from.to_string(),
                actual: current.status.to_string(),
            });
        };

        WorkOrder::apply_run_status(&mut *tx, &run.work_order_id, to.work_order_status()).await?;

        // Only autopilot failures count, but any merge clears the streak.
        match to {
            RunStatus::Failed if run.triggered_by == TriggeredBy::Autopilot => {
                AutopilotPolicy::record_failure(&mut *tx, &run.project_id).await?
            }
            RunStatus::Merged => AutopilotPolicy::reset_failures(&mut *tx, &run.project_id).await?,
            _ => {}
        }

        tx.commit().await?;

        info!(
            run_id = %run.id,
            from = %from,
            to = %to,
            event = %event,
            iteration = run.iteration,
            "Run transitioned"
        );
        Ok(run)
    }

    pub async fn record_pid(pool: &DbPool, run_id: &str, pid: Option<u32>) -> Result<()> {
        sqlx::query("UPDATE runs SET pid = ?1, updated_at = datetime('now') WHERE id = ?2")
            .bind(pid.map(i64::from))
            .bind(run_id)
            .execute(pool)
            .await?;
        Ok(())
    }

    pub async fn mark_baseline_passed(pool: &DbPool, run_id: &str) -> Result<()> {
        sqlx::query(
            "UPDATE runs SET baseline_passed = 1, updated_at = datetime('now') WHERE id = ?1",
        )
        .bind(run_id)
        .execute(pool)
        .await?;
        Ok(())
    }

    pub async fn record_log_excerpt(pool: &DbPool, run_id: &str, excerpt: &str) -> Result<()> {
        sqlx::query("UPDATE runs SET last_log_excerpt = ?1 WHERE id = ?2")
            .bind(excerpt)
            .bind(run_id)
            .execute(pool)
            .await?;
        Ok(())
    }

    /// Non-status annotations written by an operator patch.
    pub async fn annotate(
        pool: &DbPool,
        run_id: &str,
        merge_status: Option<&str>,
        error: Option<&str>,
    ) -> Result<Run> {
        sqlx::query_as::<_, Run>(&format!(
            r#"
            UPDATE runs SET
                merge_status = COALESCE(?1, merge_status),
                error = COALESCE(?2, error),
                updated_at = datetime('now')
            WHERE id = ?3
            RETURNING {}
        "#,
            RUN_COLUMNS
        ))
        .bind(merge_status)
        .bind(error)
        .bind(run_id)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Run '{}' not found", run_id)))
    }
}
