/// Integration tests for persisted scheduler state
///
/// Runs operations against a SQLite database in a temporary directory and
/// restarts the scheduler over the same file:
/// - Operation snapshots, ledger entries and accepted content are durable
/// - Recovery restores completed columns and global spend
/// - Operations left unfinished by a previous process are marked failed
mod common;

use colgen_engine::db::Database;
use colgen_engine::executor::TermCatalog;
use colgen_engine::scheduler::Scheduler;
use common::*;
use sdk::types::{BatchOperation, OperationStatus, SafetyPolicy};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

fn durable_scheduler(db: &Database) -> Scheduler {
    durable_scheduler_with(db, Arc::new(ScriptedProvider::new()))
}

fn durable_scheduler_with(db: &Database, provider: Arc<ScriptedProvider>) -> Scheduler {
    let catalog: Arc<dyn TermCatalog> = Arc::new(db.content());
    Scheduler::builder(&scheduler_config(3), registry(), provider, catalog)
        .journal(db.journal())
        .build()
}

async fn seeded_database(path: &Path, term_count: usize) -> Database {
    let db = Database::new(path).await.unwrap();
    let content = db.content();
    for term in terms(term_count) {
        content.add_term(&term).await.unwrap();
    }
    db
}

#[tokio::test]
async fn test_completed_run_survives_restart() {
    let temp_dir = TempDir::new().unwrap();
    let db_path = temp_dir.path().join("colgen.db");

    let db = seeded_database(&db_path, 4).await;
    let scheduler = durable_scheduler(&db);

    let id = scheduler.start("term", fast_config()).await.unwrap();
    let op = finish(&scheduler, &id).await.operation;
    assert_eq!(op.status, OperationStatus::Completed);
    assert_eq!(op.successful_terms, 4);

    let persisted = db.operations().get(&id).await.unwrap().unwrap();
    assert_eq!(persisted.status, OperationStatus::Completed);
    assert_eq!(persisted.successful_terms, 4);
    assert!(persisted.counters_consistent());

    let entries = db.ledger().list(&id).await.unwrap();
    assert_eq!(entries.len(), 4);
    assert!((db.ledger().total_for(&id).await.unwrap() - 0.20).abs() < 1e-9);

    let stored = db.content().get_content("t01", "term").await.unwrap().unwrap();
    assert_eq!(stored.operation_id.as_deref(), Some(id.as_str()));
    assert_eq!(stored.quality_score, 9);

    db.close().await.unwrap();

    // Restart over the same file
    let db = Database::new(&db_path).await.unwrap();
    let scheduler = durable_scheduler(&db);
    let report = scheduler.recover().await.unwrap();

    assert!(report.interrupted.is_empty());
    assert_eq!(report.completed_columns, 1);
    assert_eq!(report.history_loaded, 1);
    assert!((report.restored_spend - 0.20).abs() < 1e-9);

    assert!(scheduler.completed_columns().await.contains("term"));
    let snapshot = scheduler.get_operation_status(&id).await.unwrap();
    assert_eq!(snapshot.operation.status, OperationStatus::Completed);
    assert!((scheduler.get_system_metrics().await.total_spend - 0.20).abs() < 1e-9);

    // The dependency recorded by the previous process still counts
    let next = scheduler
        .start("definition_overview", fast_config())
        .await
        .unwrap();
    assert_eq!(
        finish(&scheduler, &next).await.operation.status,
        OperationStatus::Completed
    );
    assert_eq!(db.operations().list_recent(10).await.unwrap().len(), 2);

    db.close().await.unwrap();
}

#[tokio::test]
async fn test_unfinished_operation_is_marked_failed_on_recovery() {
    let temp_dir = TempDir::new().unwrap();
    let db_path = temp_dir.path().join("colgen.db");
    let db = seeded_database(&db_path, 2).await;

    let mut stale = BatchOperation::new("op-stale", "term", 0, 10.0, SafetyPolicy::default());
    stale.transition(OperationStatus::Preparing).unwrap();
    stale.transition(OperationStatus::Running).unwrap();
    stale.total_terms = 2;
    stale.processed_terms = 1;
    stale.successful_terms = 1;
    db.operations().save(&stale).await.unwrap();

    let scheduler = durable_scheduler(&db);
    let report = scheduler.recover().await.unwrap();

    assert_eq!(report.interrupted, vec!["op-stale".to_string()]);
    assert_eq!(report.completed_columns, 0);

    let recovered = db.operations().get("op-stale").await.unwrap().unwrap();
    assert_eq!(recovered.status, OperationStatus::Failed);
    assert!(recovered.failure_reason.is_some());
    assert!(recovered.finished_at.is_some());
    assert_eq!(recovered.processed_terms, 1);

    // A second recovery is a no-op
    assert!(scheduler.recover().await.unwrap().interrupted.is_empty());

    // The interrupted column is free to run again
    let id = scheduler.start("term", fast_config()).await.unwrap();
    assert_eq!(
        finish(&scheduler, &id).await.operation.status,
        OperationStatus::Completed
    );

    db.close().await.unwrap();
}

#[tokio::test]
async fn test_skip_existing_uses_stored_content() {
    let temp_dir = TempDir::new().unwrap();
    let db_path = temp_dir.path().join("colgen.db");
    let db = seeded_database(&db_path, 3).await;
    let scheduler = durable_scheduler(&db);

    let first = scheduler.start("term", fast_config()).await.unwrap();
    finish(&scheduler, &first).await;

    let config = sdk::types::OperationConfig {
        skip_existing: true,
        ..fast_config()
    };
    let second = scheduler.start("term", config).await.unwrap();
    let op = finish(&scheduler, &second).await.operation;

    assert_eq!(op.status, OperationStatus::Completed);
    assert_eq!(op.skipped_terms, 3);
    assert_eq!(op.successful_terms, 0);
    assert_eq!(op.actual_cost, 0.0);
    assert!(db.ledger().list(&second).await.unwrap().is_empty());

    db.close().await.unwrap();
}

#[tokio::test]
async fn test_cancelled_run_ledger_is_final() {
    let temp_dir = TempDir::new().unwrap();
    let db_path = temp_dir.path().join("colgen.db");
    let db = seeded_database(&db_path, 30).await;
    let provider = Arc::new(ScriptedProvider::new().with_latency(Duration::from_millis(20)));
    let scheduler = durable_scheduler_with(&db, Arc::clone(&provider));

    let config = sdk::types::OperationConfig {
        batch_size: Some(5),
        ..fast_config()
    };
    let id = scheduler.start("term", config).await.unwrap();
    wait_until(&scheduler, &id, |s| s.operation.processed_terms >= 2).await;
    scheduler.cancel(&id).await.unwrap();
    let op = finish(&scheduler, &id).await.operation;
    assert_eq!(op.status, OperationStatus::Cancelled);

    // One ledger entry per finalized term, and none after the cancel
    let entries = db.ledger().list(&id).await.unwrap().len();
    assert_eq!(entries as u64, op.successful_terms);

    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(db.ledger().list(&id).await.unwrap().len(), entries);
    let persisted = db.operations().get(&id).await.unwrap().unwrap();
    assert_eq!(persisted.status, OperationStatus::Cancelled);
    assert_eq!(persisted.processed_terms, op.processed_terms);
    assert!((db.ledger().total_for(&id).await.unwrap() - persisted.actual_cost).abs() < 1e-9);

    db.close().await.unwrap();
}
