use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqliteConnection};

use super::DbPool;
use crate::error::{AppError, Result};

/// Append-only spend ledger row.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct SpendEntry {
    pub id: i64,
    pub project_id: Option<String>,
    pub run_id: Option<String>,
    pub amount_usd: f64,
    pub recorded_at: String,
}

impl SpendEntry {
    pub async fn record(
        conn: &mut SqliteConnection,
        project_id: Option<&str>,
        run_id: Option<&str>,
        amount_usd: f64,
    ) -> Result<SpendEntry> {
        if !amount_usd.is_finite() || amount_usd < 0.0 {
            return Err(AppError::Validation(format!(
                "spend amount must be a non-negative number, got {}",
                amount_usd
            )));
        }

        let entry = sqlx::query_as::<_, SpendEntry>(
            r#"
            INSERT INTO spend_entries (project_id, run_id, amount_usd)
            VALUES (?1, ?2, ?3)
            RETURNING id, project_id, run_id, amount_usd, recorded_at
        "#,
        )
        .bind(project_id)
        .bind(run_id)
        .bind(amount_usd)
        .fetch_one(conn)
        .await?;

        Ok(entry)
    }

    /// Spend recorded since the first day of the current calendar month (UTC).
    pub async fn month_to_date(pool: &DbPool) -> Result<f64> {
        let (total,): (f64,) = sqlx::query_as(
            r#"
            SELECT COALESCE(SUM(amount_usd), 0.0)
            FROM spend_entries
            WHERE recorded_at >= strftime('%Y-%m-01 00:00:00', 'now')
        "#,
        )
        .fetch_one(pool)
        .await?;

        Ok(total)
    }

    pub async fn trailing_days(pool: &DbPool, days: u32) -> Result<f64> {
        let (total,): (f64,) = sqlx::query_as(
            r#"
            SELECT COALESCE(SUM(amount_usd), 0.0)
            FROM spend_entries
            WHERE recorded_at >= datetime('now', ?1)
        "#,
        )
        .bind(format!("-{} days", days))
        .fetch_one(pool)
        .await?;

        Ok(total)
    }

    pub async fn for_run(pool: &DbPool, run_id: &str) -> Result<Vec<SpendEntry>> {
        let entries = sqlx::query_as::<_, SpendEntry>(
            r#"
            SELECT id, project_id, run_id, amount_usd, recorded_at
            FROM spend_entries
            WHERE run_id = ?1
            ORDER BY id ASC
        "#,
        )
        .bind(run_id)
        .fetch_all(pool)
        .await?;

        Ok(entries)
    }
}
