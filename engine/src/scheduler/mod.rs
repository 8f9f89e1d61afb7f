//! Operation Scheduler
//!
//! Entry point for every operator action. `start` validates a column against
//! the emergency stop, per-column single flight, the concurrency ceiling and
//! dependency readiness, then hands a new operation to a spawned executor
//! task. `pause`, `resume`, `cancel` and `approve` act on the operation's
//! handle; the executor observes them at batch boundaries.
//!
//! When an executor task ends, the operation's ledger, token and handle are
//! dropped; the status projection keeps its final snapshot, and actions on
//! it answer from there.
//!
//! A dependency column is ready once it has at least one completed
//! operation, in this process or in the persisted history. With
//! `skip_existing`, accepted content already in the term store also counts.

mod handle;

pub use handle::OperationHandle;

use crate::budget::CostTracker;
use crate::config::SchedulerConfig;
use crate::db::Journal;
use crate::executor::{BatchExecutor, ExecutionPlan, TermCatalog};
use crate::message_bus::{Event, EventType, MessageBus};
use crate::provider::ContentProvider;
use crate::registry::ColumnRegistry;
use crate::safety::SafetyController;
use crate::status::StatusAggregator;
use anyhow::Context;
use sdk::errors::EngineError;
use sdk::types::{
    BatchOperation, OperationConfig, OperationId, OperationSnapshot, OperationStatus,
    PauseReason, SystemMetrics,
};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::{info, warn};

/// What `recover` found in the persisted history
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecoveryReport {
    /// Operations a previous process left unfinished, now failed
    pub interrupted: Vec<OperationId>,
    pub completed_columns: usize,
    pub restored_spend: f64,
    pub history_loaded: usize,
}

/// Number of historical operations loaded into the status projection
const HISTORY_LIMIT: i64 = 200;

/// Terminal snapshots kept in the status projection
const RETAINED_SNAPSHOTS: usize = HISTORY_LIMIT as usize;

/// An operation as seen by operator actions
enum Lookup {
    Live(Arc<OperationHandle>),
    /// Executor finished and the handle was dropped
    Finished(OperationStatus),
}

pub struct SchedulerBuilder {
    max_concurrent_operations: usize,
    global_budget_limit: Option<f64>,
    registry: Arc<ColumnRegistry>,
    provider: Arc<dyn ContentProvider>,
    catalog: Arc<dyn TermCatalog>,
    journal: Option<Journal>,
    bus: Option<Arc<MessageBus>>,
}

impl SchedulerBuilder {
    /// Persist operations and ledger entries through `journal`
    pub fn journal(mut self, journal: Journal) -> Self {
        self.journal = Some(journal);
        self
    }

    /// Publish lifecycle events on an existing bus
    pub fn bus(mut self, bus: Arc<MessageBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn build(self) -> Scheduler {
        let tracker = Arc::new(CostTracker::new(self.global_budget_limit));
        let safety = Arc::new(SafetyController::new());
        let bus = self.bus.unwrap_or_default();
        let executor = Arc::new(BatchExecutor::new(
            self.provider,
            Arc::clone(&self.catalog),
            Arc::clone(&tracker),
            Arc::clone(&safety),
            Arc::clone(&bus),
        ));

        Scheduler {
            inner: Arc::new(Inner {
                max_concurrent_operations: self.max_concurrent_operations,
                registry: self.registry,
                catalog: self.catalog,
                executor,
                tracker,
                safety,
                status: Arc::new(StatusAggregator::new()),
                bus,
                journal: self.journal,
                operations: RwLock::new(HashMap::new()),
                completed_history: RwLock::new(HashSet::new()),
                admission: Mutex::new(()),
                recovered: AtomicBool::new(false),
            }),
        }
    }
}

struct Inner {
    max_concurrent_operations: usize,
    registry: Arc<ColumnRegistry>,
    catalog: Arc<dyn TermCatalog>,
    executor: Arc<BatchExecutor>,
    tracker: Arc<CostTracker>,
    safety: Arc<SafetyController>,
    status: Arc<StatusAggregator>,
    bus: Arc<MessageBus>,
    journal: Option<Journal>,
    operations: RwLock<HashMap<OperationId, Arc<OperationHandle>>>,
    /// Columns completed by earlier processes or by released operations
    completed_history: RwLock<HashSet<String>>,
    /// Serializes admission so capacity and single-flight checks hold
    admission: Mutex<()>,
    recovered: AtomicBool,
}

#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl Scheduler {
    pub fn builder(
        config: &SchedulerConfig,
        registry: Arc<ColumnRegistry>,
        provider: Arc<dyn ContentProvider>,
        catalog: Arc<dyn TermCatalog>,
    ) -> SchedulerBuilder {
        SchedulerBuilder {
            max_concurrent_operations: config.max_concurrent_operations,
            global_budget_limit: config.global_budget_limit,
            registry,
            provider,
            catalog,
            journal: None,
            bus: None,
        }
    }

    pub fn registry(&self) -> &ColumnRegistry {
        &self.inner.registry
    }

    pub fn bus(&self) -> &Arc<MessageBus> {
        &self.inner.bus
    }

    /// Reload persisted state: fail interrupted operations, restore the
    /// completed-column set and global spend, and project recent history.
    ///
    /// Runs once per scheduler, before any operation starts. Later calls
    /// return an empty report.
    pub async fn recover(&self) -> anyhow::Result<RecoveryReport> {
        let Some(journal) = &self.inner.journal else {
            return Ok(RecoveryReport::default());
        };
        if self.inner.recovered.swap(true, Ordering::AcqRel) {
            tracing::debug!("Scheduler state already recovered");
            return Ok(RecoveryReport::default());
        }

        let interrupted = journal
            .operations
            .mark_interrupted()
            .await
            .context("Failed to mark interrupted operations")?;

        let completed = journal.operations.completed_columns().await?;
        let restored_spend = journal.ledger.total().await?;
        self.inner.tracker.restore_global_spend(restored_spend);

        let history = journal.operations.list_recent(HISTORY_LIMIT).await?;
        for operation in &history {
            self.inner.status.refresh(operation);
        }

        let report = RecoveryReport {
            interrupted,
            completed_columns: completed.len(),
            restored_spend,
            history_loaded: history.len(),
        };
        *self.inner.completed_history.write().await = completed;

        info!(
            interrupted = report.interrupted.len(),
            completed_columns = report.completed_columns,
            restored_spend = report.restored_spend,
            "Scheduler state recovered"
        );
        Ok(report)
    }

    /// Create and launch an operation for `column_id`
    pub async fn start(
        &self,
        column_id: &str,
        config: OperationConfig,
    ) -> Result<OperationId, EngineError> {
        let _admission = self.inner.admission.lock().await;

        if self.inner.safety.is_engaged() {
            return Err(EngineError::EmergencyStopActive);
        }

        let column = self.inner.registry.get(column_id)?.clone();
        if !config.budget_limit.is_finite() || config.budget_limit < 0.0 {
            return Err(EngineError::InvalidBudget(format!(
                "budget_limit must be a non-negative number, got {}",
                config.budget_limit
            )));
        }

        {
            let operations = self.inner.operations.read().await;
            if let Some(busy) = operations
                .values()
                .find(|h| h.column_id() == column_id && !h.status().is_terminal())
            {
                return Err(EngineError::ColumnBusy {
                    column: column_id.to_string(),
                    operation_id: busy.id().to_string(),
                });
            }

            let active = operations
                .values()
                .filter(|h| !h.status().is_terminal())
                .count();
            if active >= self.inner.max_concurrent_operations {
                return Err(EngineError::CapacityExceeded {
                    active,
                    limit: self.inner.max_concurrent_operations,
                });
            }
        }

        let missing = self.unsatisfied_dependencies(column_id, &config).await?;
        if !missing.is_empty() {
            return Err(EngineError::DependencyNotSatisfied {
                column: column_id.to_string(),
                missing,
            });
        }

        let operation_id = uuid::Uuid::new_v4().to_string();
        let priority = config.priority.unwrap_or(column.priority);
        let operation = BatchOperation::new(
            operation_id.clone(),
            column_id,
            priority,
            config.budget_limit,
            config.safety.clone(),
        );
        let awaiting_approval = config.safety.require_approval;

        self.inner
            .tracker
            .register(
                &operation_id,
                config.budget_limit,
                config.safety.max_cost_per_term,
            )
            .await;
        let cancel = self.inner.safety.register(&operation_id);

        let handle = Arc::new(OperationHandle::new(
            operation,
            cancel,
            Arc::clone(&self.inner.status),
            self.inner.journal.clone(),
        ));
        // Initial projection and snapshot
        handle.update(|_| ()).await;

        self.inner
            .operations
            .write()
            .await
            .insert(operation_id.clone(), Arc::clone(&handle));

        info!(
            operation_id = %operation_id,
            column_id,
            priority,
            budget_limit = config.budget_limit,
            awaiting_approval,
            "Operation queued"
        );
        self.inner
            .bus
            .publish(Event::OperationQueued {
                operation_id: operation_id.clone(),
                column_id: column_id.to_string(),
                awaiting_approval,
            })
            .await;

        let plan = ExecutionPlan::new(column, config);
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let id = handle.id().to_string();
            let column_id = handle.column_id().to_string();
            let status = inner.executor.run(handle, plan).await;
            inner.release(&id, &column_id, status).await;
            tracing::debug!(operation_id = %id, %status, "Executor task finished");
        });

        Ok(operation_id)
    }

    /// Release an operation held for approval
    pub async fn approve(&self, operation_id: &str) -> Result<(), EngineError> {
        let handle = match self.lookup(operation_id).await? {
            Lookup::Live(handle) => handle,
            Lookup::Finished(status) => {
                return Err(EngineError::InvalidTransition {
                    operation_id: operation_id.to_string(),
                    from: status,
                    to: OperationStatus::Preparing,
                })
            }
        };
        let status = handle.status();
        if status.is_terminal() {
            return Err(EngineError::InvalidTransition {
                operation_id: operation_id.to_string(),
                from: status,
                to: OperationStatus::Preparing,
            });
        }

        if handle.approve() {
            info!(operation_id, "Operation approved");
        }
        Ok(())
    }

    /// `running -> paused`; a no-op on a paused operation
    pub async fn pause(&self, operation_id: &str) -> Result<(), EngineError> {
        let handle = self.live(operation_id, OperationStatus::Paused).await?;
        let paused = handle
            .update(|op| -> Result<bool, EngineError> {
                if op.status == OperationStatus::Paused {
                    return Ok(false);
                }
                op.transition(OperationStatus::Paused)?;
                op.pause_reason = Some(PauseReason::Operator);
                Ok(true)
            })
            .await?;

        if paused {
            info!(operation_id, "Operation paused by operator");
            self.inner
                .bus
                .publish(Event::OperationPaused {
                    operation_id: operation_id.to_string(),
                    reason: PauseReason::Operator,
                })
                .await;
        }
        Ok(())
    }

    /// `paused -> running`; a no-op on a running operation
    pub async fn resume(&self, operation_id: &str) -> Result<(), EngineError> {
        let handle = self.live(operation_id, OperationStatus::Running).await?;
        let resumed = handle
            .update(|op| -> Result<bool, EngineError> {
                if op.status == OperationStatus::Running {
                    return Ok(false);
                }
                op.transition(OperationStatus::Running)?;
                Ok(true)
            })
            .await?;

        if resumed {
            info!(operation_id, "Operation resumed");
            self.inner
                .bus
                .publish(Event::OperationResumed {
                    operation_id: operation_id.to_string(),
                })
                .await;
        }
        Ok(())
    }

    /// Request cooperative cancellation. The executor makes the terminal
    /// transition at its next suspension point.
    pub async fn cancel(&self, operation_id: &str) -> Result<(), EngineError> {
        let (handle, status) = match self.lookup(operation_id).await? {
            Lookup::Live(handle) => {
                let status = handle.status();
                (Some(handle), status)
            }
            Lookup::Finished(status) => (None, status),
        };
        match status {
            OperationStatus::Cancelled => return Ok(()),
            OperationStatus::Completed | OperationStatus::Failed => {
                return Err(EngineError::InvalidTransition {
                    operation_id: operation_id.to_string(),
                    from: status,
                    to: OperationStatus::Cancelled,
                })
            }
            _ => {}
        }

        let Some(handle) = handle else {
            return Ok(());
        };
        handle.update(|op| op.cancel_requested = true).await;
        if !self.inner.safety.cancel(operation_id) {
            // Token already unregistered by a finishing executor
            handle.cancel_token().cancel();
        }
        info!(operation_id, %status, "Cancellation requested");
        Ok(())
    }

    /// Engage the global stop and cancel every non-terminal operation.
    ///
    /// Returns the number of operations signalled.
    pub async fn emergency_stop(&self) -> usize {
        // No start is mid-admission while the stop engages
        let _admission = self.inner.admission.lock().await;
        let newly = self.inner.safety.engage();

        let handles: Vec<Arc<OperationHandle>> = self
            .inner
            .operations
            .read()
            .await
            .values()
            .filter(|h| !h.status().is_terminal())
            .cloned()
            .collect();

        for handle in &handles {
            handle.update(|op| op.cancel_requested = true).await;
            handle.cancel_token().cancel();
        }

        if newly {
            warn!(operations = handles.len(), "Emergency stop: all operations cancelling");
            self.inner
                .bus
                .publish(Event::EmergencyStop { engaged: true })
                .await;
        }
        handles.len()
    }

    /// Operator action that re-enables `start`
    pub async fn clear_emergency_stop(&self) -> bool {
        let cleared = self.inner.safety.clear();
        if cleared {
            self.inner
                .bus
                .publish(Event::EmergencyStop { engaged: false })
                .await;
        }
        cleared
    }

    pub fn emergency_stop_engaged(&self) -> bool {
        self.inner.safety.is_engaged()
    }

    /// Change an unfinished operation's budget
    pub async fn set_budget_limit(
        &self,
        operation_id: &str,
        budget_limit: f64,
    ) -> Result<(), EngineError> {
        if !budget_limit.is_finite() || budget_limit < 0.0 {
            return Err(EngineError::InvalidBudget(format!(
                "budget_limit must be a non-negative number, got {}",
                budget_limit
            )));
        }

        let handle = match self.lookup(operation_id).await? {
            Lookup::Live(handle) if !handle.status().is_terminal() => handle,
            Lookup::Live(handle) => return Err(already_finished(operation_id, handle.status())),
            Lookup::Finished(status) => return Err(already_finished(operation_id, status)),
        };

        self.inner
            .tracker
            .set_budget_limit(operation_id, budget_limit)
            .await?;
        handle.update(|op| op.budget_limit = budget_limit).await;
        info!(operation_id, budget_limit, "Budget limit changed");
        Ok(())
    }

    pub async fn get_operation_status(
        &self,
        operation_id: &str,
    ) -> Result<OperationSnapshot, EngineError> {
        self.inner
            .status
            .get(operation_id)
            .ok_or_else(|| EngineError::OperationNotFound(operation_id.to_string()))
    }

    pub async fn get_system_metrics(&self) -> SystemMetrics {
        self.inner.status.system_metrics(
            self.inner.max_concurrent_operations,
            self.inner.tracker.global_spend(),
            self.inner.tracker.global_limit(),
            self.inner.safety.is_engaged(),
        )
    }

    /// Every known operation, newest first
    pub async fn list_operations(&self) -> Vec<OperationSnapshot> {
        self.inner.status.list()
    }

    /// Wait until an operation reaches a terminal status
    pub async fn wait(&self, operation_id: &str) -> Result<OperationSnapshot, EngineError> {
        if let Lookup::Live(handle) = self.lookup(operation_id).await? {
            handle.wait_terminal().await;
        }
        self.get_operation_status(operation_id).await
    }

    /// Subscribe to lifecycle events
    pub async fn subscribe(&self, event_type: EventType) -> mpsc::Receiver<Event> {
        self.inner.bus.subscribe(event_type).await
    }

    /// Operations whose executor task has not finished
    pub async fn live_operation_count(&self) -> usize {
        self.inner.operations.read().await.len()
    }

    /// Columns with at least one completed operation
    pub async fn completed_columns(&self) -> HashSet<String> {
        let mut completed = self.inner.completed_history.read().await.clone();
        for handle in self.inner.operations.read().await.values() {
            if handle.status() == OperationStatus::Completed {
                completed.insert(handle.column_id().to_string());
            }
        }
        completed
    }

    async fn unsatisfied_dependencies(
        &self,
        column_id: &str,
        config: &OperationConfig,
    ) -> Result<Vec<String>, EngineError> {
        let completed = self.completed_columns().await;
        let missing = self
            .inner
            .registry
            .missing_dependencies(column_id, &completed)?;
        if missing.is_empty() || !config.skip_existing {
            return Ok(missing);
        }

        let mut still_missing = Vec::new();
        for dependency in missing {
            match self.inner.catalog.column_has_content(&dependency).await {
                Ok(true) => {}
                Ok(false) => still_missing.push(dependency),
                Err(e) => {
                    warn!(column_id = %dependency, error = %e, "Content lookup failed");
                    still_missing.push(dependency);
                }
            }
        }
        Ok(still_missing)
    }

    async fn lookup(&self, operation_id: &str) -> Result<Lookup, EngineError> {
        if let Some(handle) = self.inner.operations.read().await.get(operation_id) {
            return Ok(Lookup::Live(Arc::clone(handle)));
        }
        self.inner
            .status
            .get(operation_id)
            .map(|snapshot| Lookup::Finished(snapshot.operation.status))
            .ok_or_else(|| EngineError::OperationNotFound(operation_id.to_string()))
    }

    /// Live handle, or `InvalidTransition` towards `to` for a finished operation
    async fn live(
        &self,
        operation_id: &str,
        to: OperationStatus,
    ) -> Result<Arc<OperationHandle>, EngineError> {
        match self.lookup(operation_id).await? {
            Lookup::Live(handle) => Ok(handle),
            Lookup::Finished(from) => Err(EngineError::InvalidTransition {
                operation_id: operation_id.to_string(),
                from,
                to,
            }),
        }
    }
}

impl Inner {
    /// Drop what a finished operation held. The projection keeps its snapshot.
    async fn release(&self, operation_id: &str, column_id: &str, status: OperationStatus) {
        self.safety.unregister(operation_id);
        self.tracker.unregister(operation_id).await;
        if status == OperationStatus::Completed {
            self.completed_history
                .write()
                .await
                .insert(column_id.to_string());
        }
        if status.is_terminal() {
            self.operations.write().await.remove(operation_id);
        }
        self.status.prune_terminal(RETAINED_SNAPSHOTS);
    }
}

fn already_finished(operation_id: &str, status: OperationStatus) -> EngineError {
    EngineError::InvalidBudget(format!(
        "operation {} is already {}",
        operation_id, status
    ))
}
