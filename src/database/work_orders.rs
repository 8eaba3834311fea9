use serde::{Deserialize, Serialize};
use sqlx::{types::Json, FromRow, SqliteConnection};
use std::collections::HashSet;
use tracing::{debug, info};
use uuid::Uuid;

use super::dag::DependencyGraph;
use super::DbPool;
use crate::error::{AppError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum WorkOrderStatus {
    Backlog,
    Ready,
    Building,
    AiReview,
    YouReview,
    Done,
    Blocked,
    Parked,
}

impl WorkOrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkOrderStatus::Backlog => "backlog",
            WorkOrderStatus::Ready => "ready",
            WorkOrderStatus::Building => "building",
            WorkOrderStatus::AiReview => "ai_review",
            WorkOrderStatus::YouReview => "you_review",
            WorkOrderStatus::Done => "done",
            WorkOrderStatus::Blocked => "blocked",
            WorkOrderStatus::Parked => "parked",
        }
    }

    /// Statuses a direct edit may set. The rest mirror an active run and are
    /// written by the run controller.
    pub fn is_direct_edit(&self) -> bool {
        matches!(
            self,
            WorkOrderStatus::Backlog
                | WorkOrderStatus::Ready
                | WorkOrderStatus::Blocked
                | WorkOrderStatus::Parked
        )
    }
}

impl std::fmt::Display for WorkOrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct WorkOrder {
    pub id: String,
    pub project_id: String,
    pub seq: i64,
    pub title: String,
    pub goal: String,
    pub acceptance_criteria: Json<Vec<String>>,
    pub stop_conditions: Json<Vec<String>>,
    pub status: WorkOrderStatus,
    pub priority: i64,
    pub depends_on: Json<Vec<String>>,
    pub tags: Json<Vec<String>>,
    pub base_branch: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct CreateWorkOrderRequest {
    pub title: String,
    #[serde(default)]
    pub goal: String,
    #[serde(default)]
    pub acceptance_criteria: Vec<String>,
    #[serde(default)]
    pub stop_conditions: Vec<String>,
    pub priority: Option<i64>,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    pub base_branch: Option<String>,
    pub status: Option<WorkOrderStatus>,
}

#[derive(Debug, Default, Deserialize)]
pub struct UpdateWorkOrderRequest {
    pub title: Option<String>,
    pub goal: Option<String>,
    pub acceptance_criteria: Option<Vec<String>>,
    pub stop_conditions: Option<Vec<String>>,
    pub priority: Option<i64>,
    pub depends_on: Option<Vec<String>>,
    pub tags: Option<Vec<String>>,
    pub base_branch: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReadyCheckError {
    pub field: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadyCheck {
    pub ok: bool,
    pub errors: Vec<ReadyCheckError>,
}

impl ReadyCheck {
    pub fn missing_fields(&self) -> Vec<String> {
        self.errors.iter().map(|e| e.field.clone()).collect()
    }
}

const SELECT_COLUMNS: &str = r#"
    SELECT id, project_id, seq, title, goal, acceptance_criteria, stop_conditions, status,
           priority, depends_on, tags, base_branch, created_at, updated_at
    FROM work_orders
"#;

fn blank(items: &[String]) -> bool {
    items.iter().all(|item| item.trim().is_empty())
}

fn validate_priority(priority: i64) -> Result<()> {
    if !(1..=5).contains(&priority) {
        return Err(AppError::Validation(format!(
            "priority must be between 1 and 5, got {}",
            priority
        )));
    }
    Ok(())
}

impl WorkOrder {
    /// Checks the Ready contract: goal, acceptance criteria and stop
    /// conditions must all be present.
    pub fn ready_check(&self) -> ReadyCheck {
        let mut errors = Vec::new();
        if self.goal.trim().is_empty() {
            errors.push(ReadyCheckError {
                field: "goal".to_string(),
                message: "goal is required".to_string(),
            });
        }
        if blank(&self.acceptance_criteria) {
            errors.push(ReadyCheckError {
                field: "acceptance_criteria".to_string(),
                message: "at least one acceptance criterion is required".to_string(),
            });
        }
        if blank(&self.stop_conditions) {
            errors.push(ReadyCheckError {
                field: "stop_conditions".to_string(),
                message: "at least one stop condition is required".to_string(),
            });
        }

        ReadyCheck {
            ok: errors.is_empty(),
            errors,
        }
    }

    fn ensure_ready_contract(&self) -> Result<()> {
        let check = self.ready_check();
        if check.ok {
            Ok(())
        } else {
            Err(AppError::NotReady {
                work_order_id: self.id.clone(),
                missing: check.missing_fields(),
            })
        }
    }

    pub fn effective_base_branch<'a>(&'a self, project_default: &'a str) -> &'a str {
        self.base_branch.as_deref().unwrap_or(project_default)
    }

    pub async fn create(
        pool: &DbPool,
        project_id: &str,
        req: CreateWorkOrderRequest,
    ) -> Result<WorkOrder> {
        if req.title.trim().is_empty() {
            return Err(AppError::Validation("title is required".to_string()));
        }
        let priority = req.priority.unwrap_or(3);
        validate_priority(priority)?;

        let status = req.status.unwrap_or(WorkOrderStatus::Backlog);
        if !status.is_direct_edit() {
            return Err(AppError::Validation(format!(
                "work orders cannot be created in status '{}'",
                status
            )));
        }

        let id = Uuid::new_v4().to_string();
        let mut tx = pool.begin().await?;
        Self::lock_graph(&mut tx, project_id).await?;
        Self::validate_dependencies(&mut tx, project_id, &id, &req.depends_on).await?;

        let draft = WorkOrder {
            id: id.clone(),
            project_id: project_id.to_string(),
            seq: 0,
            title: req.title.trim().to_string(),
            goal: req.goal,
            acceptance_criteria: Json(req.acceptance_criteria),
            stop_conditions: Json(req.stop_conditions),
            status,
            priority,
            depends_on: Json(req.depends_on),
            tags: Json(req.tags),
            base_branch: req.base_branch,
            created_at: String::new(),
            updated_at: String::new(),
        };
        if status == WorkOrderStatus::Ready {
            draft.ensure_ready_contract()?;
        }

        let work_order = sqlx::query_as::<_, WorkOrder>(
            r#"
            INSERT INTO work_orders (
                id, project_id, seq, title, goal, acceptance_criteria, stop_conditions,
                status, priority, depends_on, tags, base_branch
            )
            VALUES (
                ?1, ?2, (SELECT COALESCE(MAX(seq), 0) + 1 FROM work_orders), ?3, ?4, ?5, ?6,
                ?7, ?8, ?9, ?10, ?11
            )
            RETURNING id, project_id, seq, title, goal, acceptance_criteria, stop_conditions, status,
                      priority, depends_on, tags, base_branch, created_at, updated_at
        "#,
        )
        .bind(&draft.id)
        .bind(&draft.project_id)
        .bind(&draft.title)
        .bind(&draft.goal)
        .bind(&draft.acceptance_criteria)
        .bind(&draft.stop_conditions)
        .bind(draft.status)
        .bind(draft.priority)
        .bind(&draft.depends_on)
        .bind(&draft.tags)
        .bind(&draft.base_branch)
        .fetch_one(&mut *tx)
        .await?;
        tx.commit().await?;

        info!(work_order_id = %work_order.id, project_id = %project_id, "Created work order");
        Ok(work_order)
    }

    pub async fn get(pool: &DbPool, work_order_id: &str) -> Result<Option<WorkOrder>> {
        let work_order = sqlx::query_as::<_, WorkOrder>(&format!("{} WHERE id = ?1", SELECT_COLUMNS))
            .bind(work_order_id)
            .fetch_optional(pool)
            .await?;

        Ok(work_order)
    }

    pub async fn require(pool: &DbPool, work_order_id: &str) -> Result<WorkOrder> {
        Self::get(pool, work_order_id).await?.ok_or_else(|| {
            AppError::NotFound(format!("Work order '{}' not found", work_order_id))
        })
    }

    pub async fn list(
        pool: &DbPool,
        project_id: &str,
        status_filter: Option<WorkOrderStatus>,
    ) -> Result<Vec<WorkOrder>> {
        let mut query = format!("{} WHERE project_id = ?1", SELECT_COLUMNS);
        if status_filter.is_some() {
            query.push_str(" AND status = ?2");
        }
        query.push_str(" ORDER BY priority ASC, seq ASC");

        let mut q = sqlx::query_as::<_, WorkOrder>(&query).bind(project_id);
        if let Some(status) = status_filter {
            q = q.bind(status);
        }

        Ok(q.fetch_all(pool).await?)
    }

    pub async fn update(
        pool: &DbPool,
        work_order_id: &str,
        req: UpdateWorkOrderRequest,
    ) -> Result<WorkOrder> {
        let current = Self::require(pool, work_order_id).await?;
        let mut tx = pool.begin().await?;
        Self::lock_graph(&mut tx, &current.project_id).await?;
        let mut work_order = sqlx::query_as::<_, WorkOrder>(&format!("{} WHERE id = ?1", SELECT_COLUMNS))
            .bind(work_order_id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Work order '{}' not found", work_order_id)))?;

        if let Some(title) = req.title {
            if title.trim().is_empty() {
                return Err(AppError::Validation("title is required".to_string()));
            }
            work_order.title = title.trim().to_string();
        }
        if let Some(goal) = req.goal {
            work_order.goal = goal;
        }
        if let Some(criteria) = req.acceptance_criteria {
            work_order.acceptance_criteria = Json(criteria);
        }
        if let Some(conditions) = req.stop_conditions {
            work_order.stop_conditions = Json(conditions);
        }
        if let Some(priority) = req.priority {
            validate_priority(priority)?;
            work_order.priority = priority;
        }
        if let Some(tags) = req.tags {
            work_order.tags = Json(tags);
        }
        if let Some(base_branch) = req.base_branch {
            work_order.base_branch = Some(base_branch).filter(|b| !b.trim().is_empty());
        }
        if let Some(depends_on) = req.depends_on {
            Self::validate_dependencies(&mut tx, &work_order.project_id, work_order_id, &depends_on)
                .await?;
            work_order.depends_on = Json(depends_on);
        }

        // A ready work order has to keep honouring the contract
        if work_order.status == WorkOrderStatus::Ready {
            work_order.ensure_ready_contract()?;
        }

        let updated = sqlx::query_as::<_, WorkOrder>(
            r#"
            UPDATE work_orders
            SET title = ?1, goal = ?2, acceptance_criteria = ?3, stop_conditions = ?4,
                priority = ?5, depends_on = ?6, tags = ?7, base_branch = ?8,
                updated_at = datetime('now')
            WHERE id = ?9
            RETURNING id, project_id, seq, title, goal, acceptance_criteria, stop_conditions, status,
                      priority, depends_on, tags, base_branch, created_at, updated_at
        "#,
        )
        .bind(&work_order.title)
        .bind(&work_order.goal)
        .bind(&work_order.acceptance_criteria)
        .bind(&work_order.stop_conditions)
        .bind(work_order.priority)
        .bind(&work_order.depends_on)
        .bind(&work_order.tags)
        .bind(&work_order.base_branch)
        .bind(work_order_id)
        .fetch_one(&mut *tx)
        .await?;
        tx.commit().await?;

        Ok(updated)
    }

    /// Direct status edit. Run-driven statuses are rejected here.
    pub async fn set_status(
        pool: &DbPool,
        work_order_id: &str,
        status: WorkOrderStatus,
    ) -> Result<WorkOrder> {
        let work_order = Self::require(pool, work_order_id).await?;

        if !status.is_direct_edit() {
            return Err(AppError::Validation(format!(
                "status '{}' is set by runs, not by direct edits",
                status
            )));
        }
        if !work_order.status.is_direct_edit() {
            return Err(AppError::Validation(format!(
                "work order '{}' is in run-driven status '{}'",
                work_order_id, work_order.status
            )));
        }
        if status == WorkOrderStatus::Ready {
            work_order.ensure_ready_contract()?;
        }

        // Conditioned on the status we validated against
        let updated = sqlx::query_as::<_, WorkOrder>(
            r#"
            UPDATE work_orders SET status = ?1, updated_at = datetime('now')
            WHERE id = ?2 AND status = ?3
            RETURNING id, project_id, seq, title, goal, acceptance_criteria, stop_conditions, status,
                      priority, depends_on, tags, base_branch, created_at, updated_at
        "#,
        )
        .bind(status)
        .bind(work_order_id)
        .bind(work_order.status)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| {
            AppError::Validation(format!(
                "work order '{}' changed status concurrently",
                work_order_id
            ))
        })?;

        debug!(work_order_id = %work_order_id, status = %status, "Work order status set");
        Ok(updated)
    }

    /// Mirrors a run transition onto the work order inside the run's own
    /// transaction.
    pub(crate) async fn apply_run_status(
        conn: &mut SqliteConnection,
        work_order_id: &str,
        status: WorkOrderStatus,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE work_orders SET status = ?1, updated_at = datetime('now') WHERE id = ?2",
        )
        .bind(status)
        .bind(work_order_id)
        .execute(conn)
        .await?;
        Ok(())
    }

    pub async fn done_ids(pool: &DbPool, project_id: &str) -> Result<HashSet<String>> {
        let ids = sqlx::query_as::<_, (String,)>(
            "SELECT id FROM work_orders WHERE project_id = ?1 AND status = 'done'",
        )
        .bind(project_id)
        .fetch_all(pool)
        .await?
        .into_iter()
        .map(|(id,)| id)
        .collect();

        Ok(ids)
    }

    pub async fn count_by_status(
        pool: &DbPool,
        project_id: Option<&str>,
    ) -> Result<Vec<(WorkOrderStatus, i64)>> {
        let counts = match project_id {
            Some(project_id) => {
                sqlx::query_as::<_, (WorkOrderStatus, i64)>(
                    "SELECT status, COUNT(*) FROM work_orders WHERE project_id = ?1 GROUP BY status",
                )
                .bind(project_id)
                .fetch_all(pool)
                .await?
            }
            None => {
                sqlx::query_as::<_, (WorkOrderStatus, i64)>(
                    "SELECT status, COUNT(*) FROM work_orders GROUP BY status",
                )
                .fetch_all(pool)
                .await?
            }
        };

        Ok(counts)
    }

    /// Takes the database write lock before the graph is read, so two edits
    /// of the same project validate and commit one after the other.
    async fn lock_graph(conn: &mut SqliteConnection, project_id: &str) -> Result<()> {
        sqlx::query("UPDATE projects SET name = name WHERE id = ?1")
            .bind(project_id)
            .execute(conn)
            .await?;
        Ok(())
    }

    /// Rejects unknown ids and any edit that would make the project's
    /// dependency graph cyclic. Runs inside the writing transaction.
    async fn validate_dependencies(
        conn: &mut SqliteConnection,
        project_id: &str,
        work_order_id: &str,
        depends_on: &[String],
    ) -> Result<()> {
        let existing = sqlx::query_as::<_, (String, Json<Vec<String>>)>(
            "SELECT id, depends_on FROM work_orders WHERE project_id = ?1",
        )
        .bind(project_id)
        .fetch_all(conn)
        .await?;
        let known: HashSet<&str> = existing
            .iter()
            .map(|(id, _)| id.as_str())
            .chain(std::iter::once(work_order_id))
            .collect();

        if let Some(unknown) = depends_on.iter().find(|dep| !known.contains(dep.as_str())) {
            return Err(AppError::Validation(format!(
                "unknown dependency '{}' in project '{}'",
                unknown, project_id
            )));
        }

        let mut graph = DependencyGraph::new();
        graph.add_node(work_order_id);
        for dep in depends_on {
            graph.add_edge(work_order_id, dep.as_str());
        }
        for (id, deps) in existing.iter().filter(|(id, _)| id != work_order_id) {
            graph.add_node(id.as_str());
            for dep in deps.iter() {
                graph.add_edge(id.as_str(), dep.as_str());
            }
        }

        graph
            .topological_order()
            .map(|_| ())
            .map_err(|path| AppError::DependencyCycle { path })
    }
}
