//! Per-operation handle
//!
//! `OperationHandle::update` is the only way a `BatchOperation` is mutated.
//! Each update writes the snapshot through the journal before refreshing the
//! status projection and waking waiters. The operation lock is held
//! throughout, so persisted snapshots never go backwards and a waiter that
//! sees a terminal status can rely on it being on disk.

use crate::db::Journal;
use crate::status::StatusAggregator;
use sdk::types::{now_millis, BatchOperation, CostLedgerEntry, OperationStatus, Phase};
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tokio_util::sync::CancellationToken;

pub struct OperationHandle {
    operation_id: String,
    column_id: String,
    state: Mutex<BatchOperation>,
    status_tx: watch::Sender<OperationStatus>,
    approved_tx: watch::Sender<bool>,
    cancel: CancellationToken,
    projection: Arc<StatusAggregator>,
    journal: Option<Journal>,
}

impl OperationHandle {
    pub fn new(
        operation: BatchOperation,
        cancel: CancellationToken,
        projection: Arc<StatusAggregator>,
        journal: Option<Journal>,
    ) -> Self {
        let (status_tx, _) = watch::channel(operation.status);
        let (approved_tx, _) = watch::channel(!operation.safety.require_approval);
        Self {
            operation_id: operation.operation_id.clone(),
            column_id: operation.column_id.clone(),
            state: Mutex::new(operation),
            status_tx,
            approved_tx,
            cancel,
            projection,
            journal,
        }
    }

    pub fn id(&self) -> &str {
        &self.operation_id
    }

    pub fn column_id(&self) -> &str {
        &self.column_id
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Last published status
    pub fn status(&self) -> OperationStatus {
        *self.status_tx.borrow()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<OperationStatus> {
        self.status_tx.subscribe()
    }

    pub async fn snapshot(&self) -> BatchOperation {
        self.state.lock().await.clone()
    }

    /// Read a value without publishing anything
    pub async fn read<R>(&self, f: impl FnOnce(&BatchOperation) -> R) -> R {
        f(&*self.state.lock().await)
    }

    /// Mutate the operation and publish the result
    pub async fn update<R>(&self, f: impl FnOnce(&mut BatchOperation) -> R) -> R {
        let mut operation = self.state.lock().await;
        let result = f(&mut operation);
        operation.last_update_time = now_millis();

        if let Some(journal) = &self.journal {
            if let Err(e) = journal.operations.save(&operation).await {
                tracing::warn!(
                    operation_id = %self.operation_id,
                    error = %e,
                    "Failed to persist operation snapshot"
                );
            }
        }

        self.projection.refresh(&operation);
        self.status_tx.send_replace(operation.status);

        result
    }

    /// Record the phase a term is in. Refreshes the projection only.
    pub async fn set_phase(&self, phase: Phase) {
        let mut operation = self.state.lock().await;
        if operation.current_phase != phase {
            operation.current_phase = phase;
            self.projection.refresh(&operation);
        }
    }

    /// Append a committed ledger entry to the journal
    pub async fn record_spend(&self, entry: &CostLedgerEntry) {
        if let Some(journal) = &self.journal {
            if let Err(e) = journal.ledger.append(entry).await {
                tracing::warn!(
                    operation_id = %self.operation_id,
                    term_id = %entry.term_id,
                    error = %e,
                    "Failed to persist cost ledger entry"
                );
            }
        }
    }

    /// Release an operation held for approval. Returns false if it already was.
    pub fn approve(&self) -> bool {
        !self.approved_tx.send_replace(true)
    }

    pub fn is_approved(&self) -> bool {
        *self.approved_tx.borrow()
    }

    /// Wait for approval. Returns false if the operation was cancelled first.
    pub async fn wait_approved(&self) -> bool {
        let mut approved = self.approved_tx.subscribe();
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => false,
            result = approved.wait_for(|approved| *approved) => result.is_ok(),
        }
    }

    /// Wait for the operation to reach a terminal status
    pub async fn wait_terminal(&self) -> OperationStatus {
        let mut status = self.status_tx.subscribe();
        let result = status.wait_for(|status| status.is_terminal()).await.map(|s| *s);
        result.unwrap_or_else(|_| self.status())
    }
}
