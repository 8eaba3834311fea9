use anyhow::Result;
use sqlx::sqlite::SqlitePool;
use tracing::{debug, info};

pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    info!("Running database migrations");

    create_projects_table(pool).await?;
    create_work_orders_table(pool).await?;
    create_runs_table(pool).await?;
    create_communications_table(pool).await?;
    create_autopilot_policies_table(pool).await?;
    create_spend_entries_table(pool).await?;
    create_shifts_table(pool).await?;

    info!("Database migrations completed successfully");
    Ok(())
}

async fn create_projects_table(pool: &SqlitePool) -> Result<()> {
    debug!("Creating projects table");
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS projects (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL UNIQUE,
            path TEXT NOT NULL,
            base_branch TEXT NOT NULL DEFAULT 'main',
            status TEXT NOT NULL DEFAULT 'active' CHECK (status IN ('active', 'blocked', 'parked')),
            created_at TEXT NOT NULL DEFAULT (datetime('now')),
            updated_at TEXT NOT NULL DEFAULT (datetime('now'))
        )
    "#,
    )
    .execute(pool)
    .await?;
    Ok(())
}

async fn create_work_orders_table(pool: &SqlitePool) -> Result<()> {
    debug!("Creating work_orders table");
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS work_orders (
            id TEXT PRIMARY KEY,
            project_id TEXT NOT NULL,
            seq INTEGER NOT NULL,
            title TEXT NOT NULL,
            goal TEXT NOT NULL DEFAULT '',
            acceptance_criteria TEXT NOT NULL DEFAULT '[]',
            stop_conditions TEXT NOT NULL DEFAULT '[]',
            status TEXT NOT NULL DEFAULT 'backlog' CHECK (status IN (
                'backlog', 'ready', 'building', 'ai_review', 'you_review', 'done', 'blocked', 'parked'
            )),
            priority INTEGER NOT NULL DEFAULT 3 CHECK (priority BETWEEN 1 AND 5),
            depends_on TEXT NOT NULL DEFAULT '[]',
            tags TEXT NOT NULL DEFAULT '[]',
            base_branch TEXT,
            created_at TEXT NOT NULL DEFAULT (datetime('now')),
            updated_at TEXT NOT NULL DEFAULT (datetime('now')),
            FOREIGN KEY (project_id) REFERENCES projects(id) ON DELETE CASCADE
        )
    "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_work_orders_project_status ON work_orders(project_id, status)",
    )
    .execute(pool)
    .await?;
    Ok(())
}

async fn create_runs_table(pool: &SqlitePool) -> Result<()> {
    debug!("Creating runs table");
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS runs (
            id TEXT PRIMARY KEY,
            project_id TEXT NOT NULL,
            work_order_id TEXT NOT NULL,
            provider TEXT NOT NULL,
            triggered_by TEXT NOT NULL CHECK (triggered_by IN ('manual', 'autopilot')),
            status TEXT NOT NULL DEFAULT 'queued' CHECK (status IN (
                'queued', 'baseline_failed', 'building', 'waiting_for_input', 'security_hold',
                'ai_review', 'testing', 'you_review', 'merged', 'merge_conflict', 'failed', 'canceled'
            )),
            iteration INTEGER NOT NULL DEFAULT 1,
            test_failures INTEGER NOT NULL DEFAULT 0,
            baseline_passed INTEGER NOT NULL DEFAULT 0,
            reviewer_verdict TEXT CHECK (reviewer_verdict IN ('approved', 'changes_requested')),
            reviewer_notes TEXT,
            escalation TEXT,
            provided_inputs TEXT,
            failure_reason TEXT,
            error TEXT,
            merge_status TEXT,
            security_reason TEXT,
            run_dir TEXT,
            branch TEXT,
            log_path TEXT NOT NULL,
            last_log_excerpt TEXT,
            last_test_output TEXT,
            pid INTEGER,
            cost_usd REAL NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL DEFAULT (datetime('now')),
            updated_at TEXT NOT NULL DEFAULT (datetime('now')),
            finished_at TEXT,
            FOREIGN KEY (project_id) REFERENCES projects(id) ON DELETE CASCADE,
            FOREIGN KEY (work_order_id) REFERENCES work_orders(id) ON DELETE CASCADE
        )
    "#,
    )
    .execute(pool)
    .await?;

    // At most one non-terminal run per work order, enforced by the store
    sqlx::query(
        r#"
        CREATE UNIQUE INDEX IF NOT EXISTS idx_runs_one_active
        ON runs(project_id, work_order_id)
        WHERE status NOT IN ('merged', 'failed', 'canceled')
    "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_runs_status ON runs(status)")
        .execute(pool)
        .await?;
    Ok(())
}

async fn create_communications_table(pool: &SqlitePool) -> Result<()> {
    debug!("Creating communications table");
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS communications (
            id TEXT PRIMARY KEY,
            intent TEXT NOT NULL CHECK (intent IN ('escalation', 'request', 'message', 'suggestion', 'status')),
            comm_type TEXT,
            from_scope TEXT NOT NULL CHECK (from_scope IN ('project', 'global', 'user')),
            to_scope TEXT NOT NULL CHECK (to_scope IN ('project', 'global', 'user')),
            project_id TEXT,
            to_project_id TEXT,
            run_id TEXT,
            shift_id TEXT,
            parent_id TEXT,
            summary TEXT NOT NULL,
            body TEXT NOT NULL DEFAULT '',
            payload TEXT,
            status TEXT NOT NULL DEFAULT 'open' CHECK (status IN (
                'open', 'claimed', 'resolved', 'escalated_to_user',
                'accepted', 'declined', 'read', 'acknowledged', 'closed'
            )),
            resolution TEXT,
            created_at TEXT NOT NULL DEFAULT (datetime('now')),
            updated_at TEXT NOT NULL DEFAULT (datetime('now')),
            resolved_at TEXT,
            FOREIGN KEY (parent_id) REFERENCES communications(id)
        )
    "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_communications_scope ON communications(to_scope, status)",
    )
    .execute(pool)
    .await?;
    Ok(())
}

async fn create_autopilot_policies_table(pool: &SqlitePool) -> Result<()> {
    debug!("Creating autopilot_policies table");
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS autopilot_policies (
            project_id TEXT PRIMARY KEY,
            enabled INTEGER NOT NULL DEFAULT 0,
            max_concurrent_runs INTEGER NOT NULL DEFAULT 1,
            allowed_tags TEXT NOT NULL DEFAULT '[]',
            min_priority INTEGER,
            stop_on_failure_count INTEGER NOT NULL DEFAULT 3,
            schedule_cron TEXT,
            failure_count INTEGER NOT NULL DEFAULT 0,
            updated_at TEXT NOT NULL DEFAULT (datetime('now')),
            FOREIGN KEY (project_id) REFERENCES projects(id) ON DELETE CASCADE
        )
    "#,
    )
    .execute(pool)
    .await?;
    Ok(())
}

async fn create_spend_entries_table(pool: &SqlitePool) -> Result<()> {
    debug!("Creating spend_entries table");
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS spend_entries (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            project_id TEXT,
            run_id TEXT,
            amount_usd REAL NOT NULL CHECK (amount_usd >= 0),
            recorded_at TEXT NOT NULL DEFAULT (datetime('now'))
        )
    "#,
    )
    .execute(pool)
    .await?;
    Ok(())
}

async fn create_shifts_table(pool: &SqlitePool) -> Result<()> {
    debug!("Creating shifts table");
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS shifts (
            id TEXT PRIMARY KEY,
            project_id TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'active' CHECK (status IN ('active', 'completed', 'expired')),
            started_at TEXT NOT NULL DEFAULT (datetime('now')),
            ends_at TEXT NOT NULL,
            completed_at TEXT,
            summary TEXT,
            FOREIGN KEY (project_id) REFERENCES projects(id) ON DELETE CASCADE
        )
    "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE UNIQUE INDEX IF NOT EXISTS idx_shifts_one_active
        ON shifts(project_id) WHERE status = 'active'
    "#,
    )
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn get_database_info(pool: &SqlitePool) -> Result<String> {
    let (version,): (String,) = sqlx::query_as("SELECT sqlite_version()")
        .fetch_one(pool)
        .await?;
    Ok(version)
}
