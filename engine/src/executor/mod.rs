//! Batch Executor
//!
//! Owns one operation from `queued` to a terminal status:
//!
//! 1. Waits for approval when the safety policy requires it.
//! 2. Pre-flight in `preparing`: per-term estimate against the caps, catalog
//!    read, term filter and ordering. Failures go straight to `failed`.
//! 3. Splits the terms into `ceil(total / batch_size)` batches and runs them
//!    in order. Before each batch it observes cancellation, operator pauses
//!    and the error-rate breaker. After each batch it sleeps the configured
//!    delay. The breaker runs once more after the final batch, so an
//!    operation whose failures crossed the limit there never completes.
//!
//! Inside a batch, terms are admitted one at a time through the cost
//! tracker, then up to `max_parallel_terms` admitted terms run through the
//! quality gate concurrently. Cancellation is also observed before each such
//! group, so in-flight terms finish and nothing new starts. A rejected
//! reservation lets the admitted terms finish, pauses the operation for
//! budget and, after `resume`, retries the same term.

pub mod catalog;

pub use catalog::{AcceptedContent, MemoryCatalog, Term, TermCatalog};

use crate::budget::{CostTracker, Reservation};
use crate::message_bus::{Event, MessageBus};
use crate::provider::{ContentProvider, GenerationRequest};
use crate::quality::{GateOutcome, GatePolicy, PhaseObserver, QualityGate};
use crate::registry::ColumnDefinition;
use crate::safety::SafetyController;
use crate::scheduler::OperationHandle;
use crate::secrets::scrub;
use async_trait::async_trait;
use sdk::errors::EngineError;
use sdk::types::{
    now_millis, OperationConfig, OperationErrorRecord, OperationStatus, PauseReason, Phase,
    ProcessingOrder,
};
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn, Instrument};

const DEFAULT_TEMPERATURE: f32 = 0.7;
const DEFAULT_MAX_TOKENS: u32 = 800;

/// Column definition plus the caller's configuration for one operation
#[derive(Debug, Clone)]
pub struct ExecutionPlan {
    pub column: ColumnDefinition,
    pub config: OperationConfig,
}

impl ExecutionPlan {
    pub fn new(column: ColumnDefinition, config: OperationConfig) -> Self {
        Self { column, config }
    }

    pub fn batch_size(&self) -> usize {
        self.config
            .batch_size
            .unwrap_or(self.column.batch_size)
            .max(1)
    }

    pub fn quality_threshold(&self) -> u8 {
        self.config
            .quality_threshold
            .unwrap_or(self.column.quality_threshold)
            .clamp(1, 10)
    }

    pub fn retry_limit(&self) -> u32 {
        self.config.retry_limit.unwrap_or(self.column.retry_limit)
    }

    pub fn parallelism(&self) -> usize {
        self.config.max_parallel_terms.max(1)
    }

    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.config.delay_between_batches_ms)
    }
}

/// Whether the batch loop may continue
enum Boundary {
    Proceed,
    Stop(OperationStatus),
}

/// Mirrors gate phases onto the operation
struct HandleObserver<'a> {
    handle: &'a OperationHandle,
}

#[async_trait]
impl<'a> PhaseObserver for HandleObserver<'a> {
    async fn on_phase(&self, _term_id: &str, phase: Phase) {
        self.handle.set_phase(phase).await;
    }
}

pub struct BatchExecutor {
    gate: QualityGate,
    catalog: Arc<dyn TermCatalog>,
    tracker: Arc<CostTracker>,
    safety: Arc<SafetyController>,
    bus: Arc<MessageBus>,
}

impl BatchExecutor {
    pub fn new(
        provider: Arc<dyn ContentProvider>,
        catalog: Arc<dyn TermCatalog>,
        tracker: Arc<CostTracker>,
        safety: Arc<SafetyController>,
        bus: Arc<MessageBus>,
    ) -> Self {
        Self {
            gate: QualityGate::new(provider),
            catalog,
            tracker,
            safety,
            bus,
        }
    }

    /// Reservation amount for one term of `column`
    pub fn estimate(&self, column: &ColumnDefinition) -> f64 {
        self.gate.provider().estimated_cost(column.estimated_tokens)
    }

    /// Drive the operation to a terminal status and return it
    pub async fn run(&self, handle: Arc<OperationHandle>, plan: ExecutionPlan) -> OperationStatus {
        let span = tracing::info_span!(
            "operation",
            operation_id = %handle.id(),
            column_id = %plan.column.id
        );
        self.drive(&handle, &plan).instrument(span).await
    }

    async fn drive(&self, handle: &OperationHandle, plan: &ExecutionPlan) -> OperationStatus {
        if !handle.is_approved() {
            info!("Waiting for approval");
            if !handle.wait_approved().await {
                return self.cancel(handle).await;
            }
        }
        if handle.cancel_token().is_cancelled() {
            return self.cancel(handle).await;
        }

        if let Err(e) = handle
            .update(|op| op.transition(OperationStatus::Preparing))
            .await
        {
            warn!(error = %e, "Operation could not enter preparing");
            return handle.status();
        }

        let estimate = self.estimate(&plan.column);
        let terms = match self.preflight(plan, estimate).await {
            Ok(terms) => terms,
            Err(reason) => return self.fail(handle, reason).await,
        };

        if handle.cancel_token().is_cancelled() {
            return self.cancel(handle).await;
        }

        let total_terms = terms.len() as u64;
        let batch_size = plan.batch_size();
        let total_batches = total_terms.div_ceil(batch_size as u64);

        let started = handle
            .update(|op| {
                op.total_terms = total_terms;
                op.total_batches = total_batches;
                op.estimated_cost = estimate * total_terms as f64;
                op.transition(OperationStatus::Running)
            })
            .await;
        if let Err(e) = started {
            warn!(error = %e, "Operation could not start running");
            return handle.status();
        }

        info!(total_terms, total_batches, batch_size, "Operation running");
        self.bus
            .publish(Event::OperationStarted {
                operation_id: handle.id().to_string(),
                column_id: plan.column.id.clone(),
                total_terms,
            })
            .await;

        for (index, batch) in terms.chunks(batch_size).enumerate() {
            if let Boundary::Stop(status) = self.checkpoint(handle).await {
                return status;
            }

            let batch_index = index as u64;
            handle.update(|op| op.current_batch_index = batch_index).await;
            debug!(batch = batch_index, size = batch.len(), "Starting batch");

            if let Boundary::Stop(status) = self.run_batch(handle, plan, batch, estimate).await {
                return status;
            }

            let processed_terms = handle.read(|op| op.processed_terms).await;
            info!(
                batch = batch_index,
                total_batches, processed_terms, "Batch completed"
            );
            self.bus
                .publish(Event::BatchCompleted {
                    operation_id: handle.id().to_string(),
                    batch_index,
                    total_batches,
                    processed_terms,
                })
                .await;

            if batch_index + 1 < total_batches {
                tokio::select! {
                    _ = handle.cancel_token().cancelled() => {}
                    _ = tokio::time::sleep(plan.delay()) => {}
                }
            }
        }

        loop {
            if handle.cancel_token().is_cancelled() {
                return self.cancel(handle).await;
            }
            if handle.status() != OperationStatus::Paused {
                if let Some(status) = self.check_breaker(handle).await {
                    if status.is_terminal() {
                        return status;
                    }
                    continue;
                }
                if let Some(status) = self.complete(handle).await {
                    return status;
                }
            }
            // Paused during the final batch
            if let Boundary::Stop(status) = self.wait_while_paused(handle).await {
                return status;
            }
        }
    }

    /// Resolve the term list, or a failure reason
    async fn preflight(&self, plan: &ExecutionPlan, estimate: f64) -> Result<Vec<Term>, String> {
        let safety = &plan.config.safety;
        if estimate > safety.max_cost_per_term {
            return Err(format!(
                "estimated cost per term {:.4} exceeds max_cost_per_term {:.4}",
                estimate, safety.max_cost_per_term
            ));
        }
        if estimate > plan.config.budget_limit {
            return Err(format!(
                "estimated cost per term {:.4} exceeds budget_limit {:.4}",
                estimate, plan.config.budget_limit
            ));
        }

        let mut terms = self
            .catalog
            .list_terms()
            .await
            .map_err(|e| format!("term catalog unavailable: {e:#}"))?;

        if let Some(ids) = &plan.config.term_ids {
            let wanted: HashSet<&str> = ids.iter().map(String::as_str).collect();
            terms.retain(|term| wanted.contains(term.id.as_str()));
        }
        if plan.config.order == ProcessingOrder::BottomUp {
            terms.reverse();
        }

        if terms.is_empty() {
            return Err("no terms to process".to_string());
        }
        Ok(terms)
    }

    /// Batch-boundary checks: cancellation, operator pause, error-rate breaker
    async fn checkpoint(&self, handle: &OperationHandle) -> Boundary {
        loop {
            if handle.cancel_token().is_cancelled() {
                return Boundary::Stop(self.cancel(handle).await);
            }

            if handle.status() == OperationStatus::Paused {
                info!("Holding at batch boundary while paused");
                if let Boundary::Stop(status) = self.wait_while_paused(handle).await {
                    return Boundary::Stop(status);
                }
                continue;
            }

            if let Some(status) = self.check_breaker(handle).await {
                if status.is_terminal() {
                    return Boundary::Stop(status);
                }
                // A pause landed before the failure could apply
                continue;
            }

            return Boundary::Proceed;
        }
    }

    /// Fail the operation if its error rate is over the limit
    ///
    /// Returns `None` when the breaker holds, otherwise the status after the
    /// failure was attempted.
    async fn check_breaker(&self, handle: &OperationHandle) -> Option<OperationStatus> {
        let operation = handle.snapshot().await;
        let tripped = self.safety.check_error_rate(&operation).err()?;
        error!(
            error_count = operation.error_count,
            processed_terms = operation.processed_terms,
            "Error-rate breaker tripped"
        );
        Some(self.fail(handle, tripped.to_string()).await)
    }

    async fn run_batch(
        &self,
        handle: &OperationHandle,
        plan: &ExecutionPlan,
        batch: &[Term],
        estimate: f64,
    ) -> Boundary {
        let mut queue: VecDeque<&Term> = batch.iter().collect();

        while !queue.is_empty() {
            if handle.cancel_token().is_cancelled() {
                return Boundary::Stop(self.cancel(handle).await);
            }

            let mut admitted: Vec<(&Term, Reservation)> = Vec::new();
            let mut budget_blocked = false;
            let mut fatal = None;

            while admitted.len() < plan.parallelism() {
                let Some(term) = queue.front().copied() else {
                    break;
                };

                if plan.config.skip_existing && self.has_content(term, plan).await {
                    queue.pop_front();
                    debug!(term_id = %term.id, "Skipping term with existing content");
                    handle
                        .update(|op| {
                            op.processed_terms += 1;
                            op.skipped_terms += 1;
                        })
                        .await;
                    continue;
                }

                match self.tracker.reserve(handle.id(), estimate).await {
                    Ok(Some(reservation)) => {
                        queue.pop_front();
                        admitted.push((term, reservation));
                    }
                    Ok(None) => {
                        budget_blocked = true;
                        break;
                    }
                    Err(e) => {
                        fatal = Some(e.to_string());
                        break;
                    }
                }
            }

            futures::future::join_all(
                admitted
                    .into_iter()
                    .map(|(term, reservation)| self.process_term(handle, plan, term, reservation)),
            )
            .await;

            if let Some(reason) = fatal {
                return Boundary::Stop(self.fail(handle, reason).await);
            }
            if budget_blocked {
                if let Boundary::Stop(status) = self.pause_for_budget(handle).await {
                    return Boundary::Stop(status);
                }
            }
        }

        Boundary::Proceed
    }

    async fn has_content(&self, term: &Term, plan: &ExecutionPlan) -> bool {
        match self
            .catalog
            .has_accepted_content(&term.id, &plan.column.id)
            .await
        {
            Ok(found) => found,
            Err(e) => {
                warn!(term_id = %term.id, error = %e, "Content lookup failed, processing term");
                false
            }
        }
    }

    /// Run one term through the gate with retries, then commit its spend once
    async fn process_term(
        &self,
        handle: &OperationHandle,
        plan: &ExecutionPlan,
        term: &Term,
        reservation: Reservation,
    ) {
        let retry_limit = plan.retry_limit();
        let policy = GatePolicy {
            quality_threshold: plan.quality_threshold(),
            retry_limit,
        };
        let observer = HandleObserver { handle };
        let mut spent = 0.0;
        let mut attempt: u32 = 0;

        let outcome = loop {
            let request = GenerationRequest {
                term_id: term.id.clone(),
                term_name: term.name.clone(),
                column_id: plan.column.id.clone(),
                column_name: plan.column.display_name.clone(),
                capability: plan.column.recommended_capability.clone(),
                temperature: plan.config.temperature.unwrap_or(DEFAULT_TEMPERATURE),
                max_tokens: plan.config.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
                use_fallback: retry_limit > 0 && attempt == retry_limit,
            };

            match self.gate.run(&request, policy, &observer).await {
                Ok(outcome) => {
                    spent += outcome.cost;
                    match self.store(handle, plan, term, &outcome).await {
                        Ok(()) => break Some(outcome),
                        Err(message) => {
                            self.record_error(handle, term, Phase::Finalization, message, attempt)
                                .await;
                            break None;
                        }
                    }
                }
                Err(failure) => {
                    spent += failure.cost_spent;
                    let message = scrub(&failure.error.to_string());
                    warn!(
                        term_id = %term.id,
                        attempt,
                        phase = %failure.phase,
                        error = %message,
                        "Term attempt failed"
                    );
                    self.record_error(handle, term, failure.phase, message, attempt)
                        .await;

                    if attempt >= retry_limit {
                        break None;
                    }
                    attempt += 1;
                    handle.update(|op| op.retry_count += 1).await;
                    tokio::time::sleep(plan.delay() * attempt).await;
                }
            }
        };

        self.settle(handle, term, reservation, spent).await;

        handle
            .update(|op| {
                op.processed_terms += 1;
                match &outcome {
                    Some(outcome) => {
                        op.successful_terms += 1;
                        op.quality_distribution.record(outcome.final_score);
                        if outcome.low_quality {
                            op.low_quality_terms += 1;
                        }
                        for record in op.errors.iter_mut().filter(|r| r.term_id == term.id) {
                            record.resolved = true;
                        }
                    }
                    None => {
                        op.failed_terms += 1;
                        op.error_count += 1;
                    }
                }
            })
            .await;

        match outcome {
            Some(outcome) => debug!(
                term_id = %term.id,
                score = outcome.final_score,
                rounds = outcome.improvement_rounds,
                cost = spent,
                "Term finalized"
            ),
            None => warn!(term_id = %term.id, attempts = attempt + 1, "Term failed after retries"),
        }
    }

    async fn store(
        &self,
        handle: &OperationHandle,
        plan: &ExecutionPlan,
        term: &Term,
        outcome: &GateOutcome,
    ) -> Result<(), String> {
        let content = AcceptedContent {
            term_id: term.id.clone(),
            column_id: plan.column.id.clone(),
            content: outcome.content.clone(),
            quality_score: outcome.final_score,
            low_quality: outcome.low_quality,
            operation_id: Some(handle.id().to_string()),
        };
        self.catalog
            .save_content(&content)
            .await
            .map_err(|e| format!("failed to store content: {e:#}"))
    }

    async fn record_error(
        &self,
        handle: &OperationHandle,
        term: &Term,
        phase: Phase,
        message: String,
        attempt: u32,
    ) {
        handle
            .update(|op| {
                op.errors.push(OperationErrorRecord {
                    term_id: term.id.clone(),
                    phase,
                    message,
                    timestamp: now_millis(),
                    retry_count: attempt,
                    resolved: false,
                })
            })
            .await;
    }

    /// Commit the term's total spend as one ledger entry, or release the hold
    async fn settle(
        &self,
        handle: &OperationHandle,
        term: &Term,
        reservation: Reservation,
        spent: f64,
    ) {
        if spent <= 0.0 {
            if let Err(e) = self.tracker.release(reservation).await {
                warn!(term_id = %term.id, error = %e, "Failed to release reservation");
            }
            return;
        }

        match self.tracker.commit(reservation, &term.id, spent).await {
            Ok(entry) => {
                handle.record_spend(&entry).await;
                if let Ok(actual) = self.tracker.actual_cost(handle.id()).await {
                    handle
                        .update(|op| op.actual_cost = op.actual_cost.max(actual))
                        .await;
                }
            }
            Err(e) => warn!(term_id = %term.id, error = %e, "Failed to commit term cost"),
        }
    }

    async fn pause_for_budget(&self, handle: &OperationHandle) -> Boundary {
        let paused = handle
            .update(|op| -> Result<Option<(f64, f64)>, EngineError> {
                if op.status != OperationStatus::Running {
                    return Ok(None);
                }
                op.transition(OperationStatus::Paused)?;
                op.pause_reason = Some(PauseReason::BudgetExhausted);
                Ok(Some((op.actual_cost, op.budget_limit)))
            })
            .await;

        match paused {
            Ok(Some((actual_cost, budget_limit))) => {
                warn!(actual_cost, budget_limit, "Budget exhausted, operation paused");
                self.bus
                    .publish(Event::OperationPaused {
                        operation_id: handle.id().to_string(),
                        reason: PauseReason::BudgetExhausted,
                    })
                    .await;
            }
            Ok(None) => {}
            Err(e) => warn!(error = %e, "Budget pause rejected"),
        }

        self.wait_while_paused(handle).await
    }

    async fn wait_while_paused(&self, handle: &OperationHandle) -> Boundary {
        let mut status = handle.subscribe_status();
        let resumed = tokio::select! {
            biased;
            _ = handle.cancel_token().cancelled() => false,
            result = status.wait_for(|status| *status != OperationStatus::Paused) => result.is_ok(),
        };

        if resumed {
            info!("Operation resumed");
            Boundary::Proceed
        } else {
            Boundary::Stop(self.cancel(handle).await)
        }
    }

    async fn cancel(&self, handle: &OperationHandle) -> OperationStatus {
        let result = handle
            .update(|op| {
                op.cancel_requested = true;
                op.transition(OperationStatus::Cancelled)
            })
            .await;
        if let Err(e) = result {
            warn!(error = %e, "Cancellation could not be applied");
            return handle.status();
        }

        info!("Operation cancelled");
        self.bus
            .publish(Event::OperationCancelled {
                operation_id: handle.id().to_string(),
            })
            .await;
        self.notify(handle).await;
        OperationStatus::Cancelled
    }

    async fn fail(&self, handle: &OperationHandle, reason: String) -> OperationStatus {
        let result = handle
            .update(|op| -> Result<(), EngineError> {
                op.transition(OperationStatus::Failed)?;
                op.failure_reason = Some(reason.clone());
                Ok(())
            })
            .await;
        if let Err(e) = result {
            warn!(error = %e, "Failure could not be applied");
            return handle.status();
        }

        error!(reason = %reason, "Operation failed");
        self.bus
            .publish(Event::OperationFailed {
                operation_id: handle.id().to_string(),
                reason,
            })
            .await;
        self.notify(handle).await;
        OperationStatus::Failed
    }

    /// `None` when an operator pause landed before completion
    async fn complete(&self, handle: &OperationHandle) -> Option<OperationStatus> {
        let result = handle
            .update(|op| -> Result<bool, EngineError> {
                if op.status == OperationStatus::Paused {
                    return Ok(false);
                }
                op.current_phase = Phase::Finalization;
                op.transition(OperationStatus::Completed)?;
                Ok(true)
            })
            .await;
        match result {
            Ok(true) => {}
            Ok(false) => return None,
            Err(e) => {
                warn!(error = %e, "Completion could not be applied");
                return Some(handle.status());
            }
        }

        let operation = handle.snapshot().await;
        info!(
            successful_terms = operation.successful_terms,
            failed_terms = operation.failed_terms,
            skipped_terms = operation.skipped_terms,
            actual_cost = operation.actual_cost,
            "Operation completed"
        );
        self.bus
            .publish(Event::OperationCompleted {
                operation_id: operation.operation_id.clone(),
                successful_terms: operation.successful_terms,
                failed_terms: operation.failed_terms,
                skipped_terms: operation.skipped_terms,
                actual_cost: operation.actual_cost,
            })
            .await;
        self.notify(handle).await;
        Some(OperationStatus::Completed)
    }

    /// Completion notice for operations that asked for one
    async fn notify(&self, handle: &OperationHandle) {
        let operation = handle.snapshot().await;
        if !operation.safety.notify_on_completion {
            return;
        }

        let summary = format!(
            "{} {}: {}/{} terms processed ({} succeeded, {} failed, {} skipped), ${:.2} spent",
            operation.column_id,
            operation.status,
            operation.processed_terms,
            operation.total_terms,
            operation.successful_terms,
            operation.failed_terms,
            operation.skipped_terms,
            operation.actual_cost
        );
        info!(summary = %summary, "Operation finished");
        self.bus
            .publish(Event::CompletionNotice {
                operation_id: operation.operation_id,
                column_id: operation.column_id,
                status: operation.status,
                summary,
            })
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sdk::types::SafetyPolicy;

    fn column(batch_size: usize) -> ColumnDefinition {
        ColumnDefinition {
            id: "examples".to_string(),
            display_name: "Examples".to_string(),
            category: sdk::types::ColumnCategory::Important,
            priority: 4,
            complexity: Default::default(),
            dependencies: vec![],
            quality_threshold: 7,
            batch_size,
            retry_limit: 2,
            recommended_capability: "default".to_string(),
            estimated_tokens: 500,
        }
    }

    #[test]
    fn test_plan_prefers_config_overrides() {
        let plan = ExecutionPlan::new(
            column(50),
            OperationConfig {
                batch_size: Some(10),
                quality_threshold: Some(12),
                retry_limit: Some(0),
                max_parallel_terms: 0,
                ..OperationConfig::default()
            },
        );

        assert_eq!(plan.batch_size(), 10);
        assert_eq!(plan.quality_threshold(), 10);
        assert_eq!(plan.retry_limit(), 0);
        assert_eq!(plan.parallelism(), 1);
    }

    #[test]
    fn test_plan_falls_back_to_column() {
        let plan = ExecutionPlan::new(
            column(0),
            OperationConfig {
                delay_between_batches_ms: 250,
                safety: SafetyPolicy::default(),
                ..OperationConfig::default()
            },
        );

        assert_eq!(plan.batch_size(), 1);
        assert_eq!(plan.quality_threshold(), 7);
        assert_eq!(plan.retry_limit(), 2);
        assert_eq!(plan.delay(), Duration::from_millis(250));
    }
}
