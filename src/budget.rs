//! Spend tracking and the launch gate in front of run creation.

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::BudgetConfig;
use crate::database::{spend::SpendEntry, DbPool};
use crate::error::{AppError, Result};

const TRAILING_WINDOW_DAYS: u32 = 7;
const CRITICAL_RUNWAY_DAYS: f64 = 3.0;
const WARNING_RUNWAY_DAYS: f64 = 10.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BudgetStatus {
    Healthy,
    Warning,
    Critical,
}

impl BudgetStatus {
    /// `None` runway means spend is flat and the budget never runs out.
    pub fn from_runway(runway_days: Option<f64>) -> Self {
        match runway_days {
            Some(days) if days < CRITICAL_RUNWAY_DAYS => BudgetStatus::Critical,
            Some(days) if days < WARNING_RUNWAY_DAYS => BudgetStatus::Warning,
            _ => BudgetStatus::Healthy,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetSummary {
    pub monthly_budget: f64,
    pub spent: f64,
    pub remaining: f64,
    pub daily_rate: f64,
    /// Absent when the daily rate is zero
    pub runway_days: Option<f64>,
    pub status: BudgetStatus,
}

impl BudgetSummary {
    pub fn compute(monthly_budget: f64, spent: f64, trailing_week_spend: f64) -> Self {
        let remaining = monthly_budget - spent;
        let daily_rate = trailing_week_spend / TRAILING_WINDOW_DAYS as f64;
        // Exhausted reads as zero days even when spend is flat.
        let runway_days = if remaining <= 0.0 {
            Some(0.0)
        } else if daily_rate > 0.0 {
            Some(remaining / daily_rate)
        } else {
            None
        };

        Self {
            monthly_budget,
            spent,
            remaining,
            daily_rate,
            runway_days,
            status: BudgetStatus::from_runway(runway_days),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BudgetBlockReason {
    /// Nothing left this month
    Exhausted,
    /// A run would eat into the configured reserve
    Threshold,
}

impl std::fmt::Display for BudgetBlockReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BudgetBlockReason::Exhausted => f.write_str("monthly budget exhausted"),
            BudgetBlockReason::Threshold => f.write_str("projected run cost breaches the reserve"),
        }
    }
}

/// Structured rejection returned when a run may not start.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetBlock {
    pub reason: BudgetBlockReason,
    pub remaining_usd: f64,
    pub estimated_run_cost_usd: f64,
    pub reserve_usd: f64,
    pub runway_days: Option<f64>,
    pub status: BudgetStatus,
    pub remediation: String,
}

#[derive(Clone)]
pub struct BudgetMeter {
    db: DbPool,
    config: BudgetConfig,
}

impl BudgetMeter {
    pub fn new(db: DbPool, config: BudgetConfig) -> Self {
        Self { db, config }
    }

    pub async fn summary(&self) -> Result<BudgetSummary> {
        let spent = SpendEntry::month_to_date(&self.db).await?;
        let trailing = SpendEntry::trailing_days(&self.db, TRAILING_WINDOW_DAYS).await?;
        Ok(BudgetSummary::compute(
            self.config.monthly_budget_usd,
            spent,
            trailing,
        ))
    }

    /// Gate evaluated before a run row is created.
    pub async fn check_run_allowed(&self, project_id: &str) -> Result<BudgetSummary> {
        let summary = self.summary().await?;
        match self.evaluate(&summary) {
            None => {
                debug!(project_id = %project_id, remaining = summary.remaining, "Budget allows run");
                Ok(summary)
            }
            Some(block) => {
                warn!(
                    project_id = %project_id,
                    reason = ?block.reason,
                    remaining = block.remaining_usd,
                    "Run rejected by budget gate"
                );
                Err(AppError::BudgetExhausted(Box::new(block)))
            }
        }
    }

    pub fn evaluate(&self, summary: &BudgetSummary) -> Option<BudgetBlock> {
        let reason = if summary.remaining <= 0.0 {
            BudgetBlockReason::Exhausted
        } else if summary.remaining - self.config.estimated_run_cost_usd < self.config.reserve_usd {
            BudgetBlockReason::Threshold
        } else {
            return None;
        };

        let remediation = match reason {
            BudgetBlockReason::Exhausted => format!(
                "Raise the monthly budget above ${:.2} or wait for the next billing month",
                summary.monthly_budget
            ),
            BudgetBlockReason::Threshold => format!(
                "Remaining ${:.2} minus the estimated ${:.2} run cost would drop below the ${:.2} reserve; raise the budget or lower the reserve",
                summary.remaining, self.config.estimated_run_cost_usd, self.config.reserve_usd
            ),
        };

        Some(BudgetBlock {
            reason,
            remaining_usd: summary.remaining,
            estimated_run_cost_usd: self.config.estimated_run_cost_usd,
            reserve_usd: self.config.reserve_usd,
            runway_days: summary.runway_days,
            status: summary.status,
            remediation,
        })
    }

    /// Appends to the ledger and accumulates the cost on the run row.
    pub async fn record_run_spend(
        &self,
        project_id: &str,
        run_id: &str,
        amount_usd: f64,
    ) -> Result<()> {
        let mut tx = self.db.begin().await?;
        SpendEntry::record(&mut *tx, Some(project_id), Some(run_id), amount_usd).await?;
        sqlx::query("UPDATE runs SET cost_usd = cost_usd + ?1 WHERE id = ?2")
            .bind(amount_usd)
            .bind(run_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        debug!(run_id = %run_id, amount_usd, "Recorded run spend");
        Ok(())
    }
}
