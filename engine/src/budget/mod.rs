//! Cost & Budget Tracker
//!
//! Every term's spend passes through a reserve/commit pair:
//!
//! 1. `reserve` atomically checks the per-term cap, the operation budget and
//!    the optional global ceiling, and holds the estimate.
//! 2. `commit` releases the hold and appends one immutable `CostLedgerEntry`
//!    with the actual amount.
//!
//! Amounts are tracked internally in integer micro-dollars so repeated sums
//! compare exactly against limits. Each operation's ledger sits behind its own
//! mutex; the global total is a single atomic updated with compare-and-swap.

use sdk::errors::EngineError;
use sdk::types::{now_millis, CostLedgerEntry, OperationId};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

const MICROS_PER_UNIT: f64 = 1_000_000.0;

fn to_micros(amount: f64) -> u64 {
    if amount.is_finite() && amount > 0.0 {
        (amount * MICROS_PER_UNIT).round() as u64
    } else {
        0
    }
}

fn from_micros(micros: u64) -> f64 {
    micros as f64 / MICROS_PER_UNIT
}

/// A held estimate for one term
///
/// Consumed by exactly one of `CostTracker::commit` or `CostTracker::release`.
#[derive(Debug)]
#[must_use = "a reservation must be committed or released"]
pub struct Reservation {
    operation_id: OperationId,
    micros: u64,
}

impl Reservation {
    pub fn operation_id(&self) -> &str {
        &self.operation_id
    }

    pub fn amount(&self) -> f64 {
        from_micros(self.micros)
    }
}

#[derive(Debug)]
struct OperationLedger {
    budget_limit: u64,
    max_cost_per_term: u64,
    actual: u64,
    reserved: u64,
    entries: Vec<CostLedgerEntry>,
}

/// Per-operation and global spend accounting
pub struct CostTracker {
    ledgers: RwLock<HashMap<OperationId, Arc<Mutex<OperationLedger>>>>,
    /// Committed spend across all operations
    global_spent: AtomicU64,
    /// Committed plus reserved spend across all operations
    global_outstanding: AtomicU64,
    global_limit: Option<u64>,
}

impl CostTracker {
    /// Create a tracker with an optional system-wide ceiling
    pub fn new(global_limit: Option<f64>) -> Self {
        Self {
            ledgers: RwLock::new(HashMap::new()),
            global_spent: AtomicU64::new(0),
            global_outstanding: AtomicU64::new(0),
            global_limit: global_limit.map(to_micros),
        }
    }

    /// Seed the global total with spend recorded by earlier processes
    pub fn restore_global_spend(&self, amount: f64) {
        let micros = to_micros(amount);
        self.global_spent.fetch_add(micros, Ordering::AcqRel);
        self.global_outstanding.fetch_add(micros, Ordering::AcqRel);
    }

    /// Open a ledger for an operation
    pub async fn register(&self, operation_id: &str, budget_limit: f64, max_cost_per_term: f64) {
        let ledger = OperationLedger {
            budget_limit: to_micros(budget_limit),
            max_cost_per_term: to_micros(max_cost_per_term),
            actual: 0,
            reserved: 0,
            entries: Vec::new(),
        };
        self.ledgers
            .write()
            .await
            .insert(operation_id.to_string(), Arc::new(Mutex::new(ledger)));
    }

    /// Drop a finished operation's ledger. Its committed spend stays in the
    /// global total.
    pub async fn unregister(&self, operation_id: &str) {
        self.ledgers.write().await.remove(operation_id);
    }

    /// Change an operation's budget; takes effect on the next reservation
    pub async fn set_budget_limit(
        &self,
        operation_id: &str,
        budget_limit: f64,
    ) -> Result<(), EngineError> {
        let ledger = self.ledger(operation_id).await?;
        ledger.lock().await.budget_limit = to_micros(budget_limit);
        Ok(())
    }

    /// Try to hold `estimated_cost` for one term
    ///
    /// Returns `Ok(None)` without reserving anything when the estimate exceeds
    /// the per-term cap, when `actual + reserved + estimate` would exceed the
    /// operation budget, or when the global ceiling would be exceeded.
    pub async fn reserve(
        &self,
        operation_id: &str,
        estimated_cost: f64,
    ) -> Result<Option<Reservation>, EngineError> {
        let ledger = self.ledger(operation_id).await?;
        let mut ledger = ledger.lock().await;
        let estimate = to_micros(estimated_cost);

        if estimate > ledger.max_cost_per_term {
            tracing::debug!(operation_id, estimated_cost, "Estimate exceeds per-term cap");
            return Ok(None);
        }

        if ledger.actual + ledger.reserved + estimate > ledger.budget_limit {
            tracing::debug!(
                operation_id,
                actual = from_micros(ledger.actual),
                reserved = from_micros(ledger.reserved),
                estimated_cost,
                "Operation budget would be exceeded"
            );
            return Ok(None);
        }

        if !self.hold_global(estimate) {
            tracing::warn!(operation_id, estimated_cost, "Global budget ceiling reached");
            return Ok(None);
        }

        ledger.reserved += estimate;
        Ok(Some(Reservation {
            operation_id: operation_id.to_string(),
            micros: estimate,
        }))
    }

    /// Release a reservation and append the actual spend for `term_id`
    pub async fn commit(
        &self,
        reservation: Reservation,
        term_id: &str,
        actual_cost: f64,
    ) -> Result<CostLedgerEntry, EngineError> {
        let ledger = self.ledger(&reservation.operation_id).await?;
        let mut ledger = ledger.lock().await;
        let actual = to_micros(actual_cost);

        ledger.reserved = ledger.reserved.saturating_sub(reservation.micros);
        ledger.actual += actual;

        self.global_spent.fetch_add(actual, Ordering::AcqRel);
        self.adjust_global(reservation.micros, actual);

        let entry = CostLedgerEntry {
            operation_id: reservation.operation_id,
            term_id: term_id.to_string(),
            amount: from_micros(actual),
            timestamp: now_millis(),
        };
        ledger.entries.push(entry.clone());
        Ok(entry)
    }

    /// Drop a reservation without spending anything
    pub async fn release(&self, reservation: Reservation) -> Result<(), EngineError> {
        let ledger = self.ledger(&reservation.operation_id).await?;
        let mut ledger = ledger.lock().await;
        ledger.reserved = ledger.reserved.saturating_sub(reservation.micros);
        self.adjust_global(reservation.micros, 0);
        Ok(())
    }

    /// Committed spend of one operation
    pub async fn actual_cost(&self, operation_id: &str) -> Result<f64, EngineError> {
        let ledger = self.ledger(operation_id).await?;
        let actual = ledger.lock().await.actual;
        Ok(from_micros(actual))
    }

    /// Ledger entries of one operation in append order
    pub async fn entries(&self, operation_id: &str) -> Result<Vec<CostLedgerEntry>, EngineError> {
        let ledger = self.ledger(operation_id).await?;
        let entries = ledger.lock().await.entries.clone();
        Ok(entries)
    }

    /// Committed spend across all operations
    pub fn global_spend(&self) -> f64 {
        from_micros(self.global_spent.load(Ordering::Acquire))
    }

    pub fn global_limit(&self) -> Option<f64> {
        self.global_limit.map(from_micros)
    }

    async fn ledger(&self, operation_id: &str) -> Result<Arc<Mutex<OperationLedger>>, EngineError> {
        self.ledgers
            .read()
            .await
            .get(operation_id)
            .cloned()
            .ok_or_else(|| EngineError::OperationNotFound(operation_id.to_string()))
    }

    fn hold_global(&self, estimate: u64) -> bool {
        let Some(limit) = self.global_limit else {
            self.global_outstanding.fetch_add(estimate, Ordering::AcqRel);
            return true;
        };

        let mut current = self.global_outstanding.load(Ordering::Acquire);
        loop {
            if current + estimate > limit {
                return false;
            }
            match self.global_outstanding.compare_exchange_weak(
                current,
                current + estimate,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(observed) => current = observed,
            }
        }
    }

    /// Replace a held estimate with the actual amount in the global total
    fn adjust_global(&self, held: u64, actual: u64) {
        let mut current = self.global_outstanding.load(Ordering::Acquire);
        loop {
            let next = current.saturating_sub(held) + actual;
            match self.global_outstanding.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return,
                Err(observed) => current = observed,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_seventeenth_term_is_rejected() {
        let tracker = CostTracker::new(None);
        tracker.register("op", 10.0, 1.0).await;

        for i in 0..16 {
            let reservation = tracker
                .reserve("op", 0.60)
                .await
                .unwrap()
                .unwrap_or_else(|| panic!("term {} should be admitted", i + 1));
            tracker
                .commit(reservation, &format!("t{}", i), 0.60)
                .await
                .unwrap();
        }

        assert!((tracker.actual_cost("op").await.unwrap() - 9.60).abs() < 1e-9);
        assert!(tracker.reserve("op", 0.60).await.unwrap().is_none());
        assert_eq!(tracker.entries("op").await.unwrap().len(), 16);
    }

    #[tokio::test]
    async fn test_exact_budget_is_admitted() {
        let tracker = CostTracker::new(None);
        tracker.register("op", 1.0, 1.0).await;

        let reservation = tracker.reserve("op", 1.0).await.unwrap();
        assert!(reservation.is_some());
    }

    #[tokio::test]
    async fn test_per_term_cap() {
        let tracker = CostTracker::new(None);
        tracker.register("op", 100.0, 0.5).await;

        assert!(tracker.reserve("op", 0.51).await.unwrap().is_none());
        assert!(tracker.reserve("op", 0.5).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_outstanding_reservations_count_against_budget() {
        let tracker = CostTracker::new(None);
        tracker.register("op", 1.0, 1.0).await;

        let first = tracker.reserve("op", 0.6).await.unwrap().unwrap();
        assert!(tracker.reserve("op", 0.6).await.unwrap().is_none());

        tracker.release(first).await.unwrap();
        assert!(tracker.reserve("op", 0.6).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_raising_budget_admits_again() {
        let tracker = CostTracker::new(None);
        tracker.register("op", 0.5, 1.0).await;

        assert!(tracker.reserve("op", 0.6).await.unwrap().is_none());
        tracker.set_budget_limit("op", 2.0).await.unwrap();
        assert!(tracker.reserve("op", 0.6).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_global_ceiling_spans_operations() {
        let tracker = CostTracker::new(Some(1.0));
        tracker.register("a", 10.0, 1.0).await;
        tracker.register("b", 10.0, 1.0).await;

        let reservation = tracker.reserve("a", 0.7).await.unwrap().unwrap();
        tracker.commit(reservation, "t1", 0.7).await.unwrap();

        assert!(tracker.reserve("b", 0.4).await.unwrap().is_none());
        assert!(tracker.reserve("b", 0.3).await.unwrap().is_some());
        assert!((tracker.global_spend() - 0.7).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_restored_spend_counts_against_ceiling() {
        let tracker = CostTracker::new(Some(5.0));
        tracker.restore_global_spend(4.5);
        tracker.register("op", 10.0, 1.0).await;

        assert!(tracker.reserve("op", 0.6).await.unwrap().is_none());
        assert!(tracker.reserve("op", 0.5).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_unregister_keeps_global_spend() {
        let tracker = CostTracker::new(Some(2.0));
        tracker.register("op", 10.0, 1.0).await;
        let reservation = tracker.reserve("op", 0.8).await.unwrap().unwrap();
        tracker.commit(reservation, "t1", 0.8).await.unwrap();

        tracker.unregister("op").await;
        assert!(matches!(
            tracker.actual_cost("op").await,
            Err(EngineError::OperationNotFound(_))
        ));
        assert!((tracker.global_spend() - 0.8).abs() < 1e-9);

        tracker.register("next", 10.0, 1.0).await;
        assert!(tracker.reserve("next", 1.0).await.unwrap().is_some());
        assert!(tracker.reserve("next", 0.3).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_unknown_operation() {
        let tracker = CostTracker::new(None);
        assert!(matches!(
            tracker.reserve("ghost", 0.1).await,
            Err(EngineError::OperationNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_concurrent_reservations_never_overshoot() {
        let tracker = Arc::new(CostTracker::new(None));
        tracker.register("op", 3.0, 1.0).await;

        let mut handles = Vec::new();
        for i in 0..20 {
            let tracker = Arc::clone(&tracker);
            handles.push(tokio::spawn(async move {
                if let Some(reservation) = tracker.reserve("op", 0.25).await.unwrap() {
                    tracker
                        .commit(reservation, &format!("t{}", i), 0.25)
                        .await
                        .unwrap();
                    true
                } else {
                    false
                }
            }));
        }

        let mut admitted = 0;
        for handle in handles {
            if handle.await.unwrap() {
                admitted += 1;
            }
        }

        assert_eq!(admitted, 12);
        assert!(tracker.actual_cost("op").await.unwrap() <= 3.0 + 1e-9);
    }
}
