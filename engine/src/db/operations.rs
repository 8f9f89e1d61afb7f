/// Operation persistence
///
/// Each save writes the whole `BatchOperation` as a JSON snapshot plus the
/// indexed columns used for history and recovery queries.
use anyhow::{Context, Result};
use sdk::types::{now_millis, BatchOperation, OperationErrorRecord, OperationStatus, Phase};
use sqlx::{Row, SqlitePool};
use std::collections::HashSet;

const INTERRUPTED: &str = "interrupted by process shutdown";

#[derive(Clone)]
pub struct OperationRepository {
    pool: SqlitePool,
}

impl OperationRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert or replace an operation snapshot
    pub async fn save(&self, operation: &BatchOperation) -> Result<()> {
        let snapshot =
            serde_json::to_string(operation).context("Failed to serialize operation snapshot")?;

        sqlx::query(
            "INSERT INTO operations (id, column_id, status, priority, created_at, updated_at, finished_at, snapshot)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                status = excluded.status,
                updated_at = excluded.updated_at,
                finished_at = excluded.finished_at,
                snapshot = excluded.snapshot",
        )
        .bind(&operation.operation_id)
        .bind(&operation.column_id)
        .bind(operation.status.as_str())
        .bind(operation.priority as i64)
        .bind(operation.created_at)
        .bind(operation.last_update_time)
        .bind(operation.finished_at)
        .bind(snapshot)
        .execute(&self.pool)
        .await
        .context("Failed to save operation")?;

        Ok(())
    }

    pub async fn get(&self, operation_id: &str) -> Result<Option<BatchOperation>> {
        let row = sqlx::query("SELECT snapshot FROM operations WHERE id = ?")
            .bind(operation_id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch operation")?;

        row.map(|r| decode(&r.get::<String, _>("snapshot")))
            .transpose()
    }

    /// Most recent operations first
    pub async fn list_recent(&self, limit: i64) -> Result<Vec<BatchOperation>> {
        let rows = sqlx::query("SELECT snapshot FROM operations ORDER BY created_at DESC, id LIMIT ?")
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .context("Failed to list operations")?;

        rows.iter()
            .map(|r| decode(&r.get::<String, _>("snapshot")))
            .collect()
    }

    /// Columns with at least one completed operation
    pub async fn completed_columns(&self) -> Result<HashSet<String>> {
        let columns: Vec<String> =
            sqlx::query_scalar("SELECT DISTINCT column_id FROM operations WHERE status = ?")
                .bind(OperationStatus::Completed.as_str())
                .fetch_all(&self.pool)
                .await
                .context("Failed to fetch completed columns")?;

        Ok(columns.into_iter().collect())
    }

    /// Fail every operation a previous process left non-terminal.
    ///
    /// Returns the ids that were marked.
    pub async fn mark_interrupted(&self) -> Result<Vec<String>> {
        let rows = sqlx::query(
            "SELECT snapshot FROM operations WHERE status NOT IN ('completed', 'failed', 'cancelled')",
        )
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch unfinished operations")?;

        let mut marked = Vec::with_capacity(rows.len());
        for row in rows {
            let mut operation = decode(&row.get::<String, _>("snapshot"))?;
            let now = now_millis();

            // Recovery bypasses the lifecycle edges: a queued operation can
            // never reach failed through `transition`.
            operation.status = OperationStatus::Failed;
            operation.pause_reason = None;
            operation.failure_reason = Some(INTERRUPTED.to_string());
            operation.finished_at = Some(now);
            operation.last_update_time = now;
            operation.errors.push(OperationErrorRecord {
                term_id: String::new(),
                phase: Phase::Finalization,
                message: INTERRUPTED.to_string(),
                timestamp: now,
                retry_count: 0,
                resolved: false,
            });

            self.save(&operation).await?;
            tracing::warn!(
                operation_id = %operation.operation_id,
                column_id = %operation.column_id,
                "Marked interrupted operation as failed"
            );
            marked.push(operation.operation_id);
        }

        Ok(marked)
    }
}

fn decode(snapshot: &str) -> Result<BatchOperation> {
    serde_json::from_str(snapshot).context("Failed to decode operation snapshot")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use sdk::types::SafetyPolicy;
    use tempfile::TempDir;

    async fn setup() -> (TempDir, Database) {
        let temp_dir = TempDir::new().unwrap();
        let db = Database::new(&temp_dir.path().join("test.db")).await.unwrap();
        (temp_dir, db)
    }

    fn operation(id: &str, column: &str) -> BatchOperation {
        BatchOperation::new(id, column, 1, 10.0, SafetyPolicy::default())
    }

    #[tokio::test]
    async fn test_save_and_get() {
        let (_dir, db) = setup().await;
        let repo = db.operations();

        let mut op = operation("op-1", "term");
        repo.save(&op).await.unwrap();

        op.transition(OperationStatus::Preparing).unwrap();
        op.transition(OperationStatus::Running).unwrap();
        op.processed_terms = 3;
        op.successful_terms = 3;
        repo.save(&op).await.unwrap();

        let loaded = repo.get("op-1").await.unwrap().unwrap();
        assert_eq!(loaded, op);
        assert!(repo.get("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_completed_columns() {
        let (_dir, db) = setup().await;
        let repo = db.operations();

        let mut done = operation("op-1", "term");
        done.transition(OperationStatus::Preparing).unwrap();
        done.transition(OperationStatus::Running).unwrap();
        done.transition(OperationStatus::Completed).unwrap();
        repo.save(&done).await.unwrap();

        let mut cancelled = operation("op-2", "key_concepts");
        cancelled.transition(OperationStatus::Cancelled).unwrap();
        repo.save(&cancelled).await.unwrap();

        let columns = repo.completed_columns().await.unwrap();
        assert!(columns.contains("term"));
        assert!(!columns.contains("key_concepts"));
    }

    #[tokio::test]
    async fn test_mark_interrupted() {
        let (_dir, db) = setup().await;
        let repo = db.operations();

        let queued = operation("op-q", "term");
        repo.save(&queued).await.unwrap();

        let mut running = operation("op-r", "examples");
        running.transition(OperationStatus::Preparing).unwrap();
        running.transition(OperationStatus::Running).unwrap();
        repo.save(&running).await.unwrap();

        let mut done = operation("op-d", "applications");
        done.transition(OperationStatus::Cancelled).unwrap();
        repo.save(&done).await.unwrap();

        let mut marked = repo.mark_interrupted().await.unwrap();
        marked.sort();
        assert_eq!(marked, vec!["op-q".to_string(), "op-r".to_string()]);

        let reloaded = repo.get("op-r").await.unwrap().unwrap();
        assert_eq!(reloaded.status, OperationStatus::Failed);
        assert_eq!(reloaded.failure_reason.as_deref(), Some(INTERRUPTED));
        assert_eq!(reloaded.errors.len(), 1);

        assert_eq!(
            repo.get("op-d").await.unwrap().unwrap().status,
            OperationStatus::Cancelled
        );
        assert!(repo.mark_interrupted().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_list_recent_orders_newest_first() {
        let (_dir, db) = setup().await;
        let repo = db.operations();

        let mut older = operation("op-old", "term");
        older.created_at = 1_000;
        let mut newer = operation("op-new", "examples");
        newer.created_at = 2_000;
        repo.save(&older).await.unwrap();
        repo.save(&newer).await.unwrap();

        let listed = repo.list_recent(10).await.unwrap();
        let ids: Vec<_> = listed.iter().map(|op| op.operation_id.as_str()).collect();
        assert_eq!(ids, vec!["op-new", "op-old"]);

        assert_eq!(repo.list_recent(1).await.unwrap().len(), 1);
    }
}
