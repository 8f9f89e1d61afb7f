/// Cost ledger persistence
///
/// Rows are only ever inserted.
use anyhow::{Context, Result};
use sdk::types::CostLedgerEntry;
use sqlx::{Row, SqlitePool};

#[derive(Clone)]
pub struct LedgerRepository {
    pool: SqlitePool,
}

impl LedgerRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn append(&self, entry: &CostLedgerEntry) -> Result<()> {
        sqlx::query(
            "INSERT INTO cost_ledger (operation_id, term_id, amount, created_at) VALUES (?, ?, ?, ?)",
        )
        .bind(&entry.operation_id)
        .bind(&entry.term_id)
        .bind(entry.amount)
        .bind(entry.timestamp)
        .execute(&self.pool)
        .await
        .context("Failed to append cost ledger entry")?;

        Ok(())
    }

    /// Entries of one operation in append order
    pub async fn list(&self, operation_id: &str) -> Result<Vec<CostLedgerEntry>> {
        let rows = sqlx::query(
            "SELECT operation_id, term_id, amount, created_at FROM cost_ledger WHERE operation_id = ? ORDER BY id",
        )
        .bind(operation_id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to list cost ledger entries")?;

        Ok(rows
            .iter()
            .map(|r| CostLedgerEntry {
                operation_id: r.get("operation_id"),
                term_id: r.get("term_id"),
                amount: r.get("amount"),
                timestamp: r.get("created_at"),
            })
            .collect())
    }

    pub async fn total_for(&self, operation_id: &str) -> Result<f64> {
        let total: Option<f64> =
            sqlx::query_scalar("SELECT SUM(amount) FROM cost_ledger WHERE operation_id = ?")
                .bind(operation_id)
                .fetch_one(&self.pool)
                .await
                .context("Failed to sum operation spend")?;

        Ok(total.unwrap_or(0.0))
    }

    /// Spend across every operation ever recorded
    pub async fn total(&self) -> Result<f64> {
        let total: Option<f64> = sqlx::query_scalar("SELECT SUM(amount) FROM cost_ledger")
            .fetch_one(&self.pool)
            .await
            .context("Failed to sum global spend")?;

        Ok(total.unwrap_or(0.0))
    }
}
