//! Status aggregation
//!
//! Keeps a read projection of every operation so pollers never touch the
//! executor's working state. The scheduler refreshes a snapshot after each
//! mutation; reads clone out of the projection.

use sdk::types::{now_millis, BatchOperation, OperationId, OperationSnapshot, OperationStatus, SystemMetrics};
use std::collections::HashMap;
use std::sync::RwLock;

/// Compute a snapshot of `operation` as of `now` (unix millis)
pub fn project(operation: &BatchOperation, now: i64) -> OperationSnapshot {
    let progress_percent = if operation.total_terms == 0 {
        if operation.status == OperationStatus::Completed {
            100.0
        } else {
            0.0
        }
    } else {
        (operation.processed_terms as f64 / operation.total_terms as f64 * 100.0).min(100.0)
    };

    let avg_ms_per_term = match operation.start_time {
        Some(start) if operation.processed_terms > 0 => {
            let end = operation.finished_at.unwrap_or(now);
            let elapsed = end.saturating_sub(start).max(0) as u64;
            Some(elapsed / operation.processed_terms)
        }
        _ => None,
    };

    let eta_secs = if operation.status.is_terminal() {
        None
    } else {
        avg_ms_per_term.map(|avg| avg.saturating_mul(operation.remaining_terms()) / 1000)
    };

    OperationSnapshot {
        operation: operation.clone(),
        progress_percent,
        avg_ms_per_term,
        eta_secs,
        refreshed_at: now,
    }
}

#[derive(Default)]
pub struct StatusAggregator {
    snapshots: RwLock<HashMap<OperationId, OperationSnapshot>>,
}

impl StatusAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Re-project one operation
    pub fn refresh(&self, operation: &BatchOperation) -> OperationSnapshot {
        let snapshot = project(operation, now_millis());
        self.snapshots
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(operation.operation_id.clone(), snapshot.clone());
        snapshot
    }

    pub fn get(&self, operation_id: &str) -> Option<OperationSnapshot> {
        self.snapshots
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(operation_id)
            .cloned()
    }

    /// Keep only the `keep` newest terminal snapshots. Returns how many
    /// were dropped.
    pub fn prune_terminal(&self, keep: usize) -> usize {
        let mut snapshots = self
            .snapshots
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let mut terminal: Vec<(i64, OperationId)> = snapshots
            .values()
            .filter(|s| s.operation.status.is_terminal())
            .map(|s| (s.operation.created_at, s.operation.operation_id.clone()))
            .collect();
        if terminal.len() <= keep {
            return 0;
        }

        terminal.sort_by(|a, b| b.cmp(a));
        let dropped = terminal.split_off(keep);
        for (_, operation_id) in &dropped {
            snapshots.remove(operation_id);
        }
        dropped.len()
    }

    /// All snapshots, newest first
    pub fn list(&self) -> Vec<OperationSnapshot> {
        let mut all: Vec<OperationSnapshot> = self
            .snapshots
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .values()
            .cloned()
            .collect();
        all.sort_by(|a, b| {
            b.operation
                .created_at
                .cmp(&a.operation.created_at)
                .then_with(|| a.operation.operation_id.cmp(&b.operation.operation_id))
        });
        all
    }

    /// Count operations by status and fold in the budget state
    pub fn system_metrics(
        &self,
        max_concurrent_operations: usize,
        total_spend: f64,
        global_budget_limit: Option<f64>,
        emergency_stop: bool,
    ) -> SystemMetrics {
        let snapshots = self
            .snapshots
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let mut metrics = SystemMetrics {
            max_concurrent_operations,
            total_spend,
            global_budget_limit,
            emergency_stop,
            ..SystemMetrics::default()
        };

        for snapshot in snapshots.values() {
            let op = &snapshot.operation;
            match op.status {
                OperationStatus::Queued => metrics.queued_operations += 1,
                OperationStatus::Preparing => metrics.preparing_operations += 1,
                OperationStatus::Running => metrics.running_operations += 1,
                OperationStatus::Paused => metrics.paused_operations += 1,
                OperationStatus::Completed => metrics.completed_operations += 1,
                OperationStatus::Failed => metrics.failed_operations += 1,
                OperationStatus::Cancelled => metrics.cancelled_operations += 1,
            }
            if !op.status.is_terminal() {
                metrics.active_operations += 1;
            }
            metrics.terms_processed += op.processed_terms;
        }

        metrics.load = if max_concurrent_operations == 0 {
            0.0
        } else {
            metrics.active_operations as f64 / max_concurrent_operations as f64
        };
        metrics
    }
}
