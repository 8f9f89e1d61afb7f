//! Operation, column and metrics types
//!
//! `BatchOperation` is the record the scheduler owns for one run of a column
//! across the term corpus. Its `status` is a closed state machine:
//!
//! ```text
//! queued -> preparing -> running <-> paused
//!                |          |          |
//!                v          v          v
//!             failed    completed   cancelled
//! ```
//!
//! Terminal states (`completed`, `failed`, `cancelled`) are immutable.

use crate::errors::EngineError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

/// Identifier of a batch operation
pub type OperationId = String;

/// Current wall-clock time in unix milliseconds
pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}

/// Column category
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ColumnCategory {
    Essential,
    Important,
    Supplementary,
    Advanced,
}

impl ColumnCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ColumnCategory::Essential => "essential",
            ColumnCategory::Important => "important",
            ColumnCategory::Supplementary => "supplementary",
            ColumnCategory::Advanced => "advanced",
        }
    }
}

/// Lifecycle status of a batch operation
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum OperationStatus {
    Queued,
    Preparing,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl OperationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationStatus::Queued => "queued",
            OperationStatus::Preparing => "preparing",
            OperationStatus::Running => "running",
            OperationStatus::Paused => "paused",
            OperationStatus::Completed => "completed",
            OperationStatus::Failed => "failed",
            OperationStatus::Cancelled => "cancelled",
        }
    }

    /// Terminal states never change again
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OperationStatus::Completed | OperationStatus::Failed | OperationStatus::Cancelled
        )
    }

    /// Whether `self -> next` is an edge of the lifecycle state machine
    pub fn can_transition_to(&self, next: OperationStatus) -> bool {
        use OperationStatus::*;
        match (self, next) {
            (Queued, Preparing) | (Queued, Cancelled) => true,
            (Preparing, Running) | (Preparing, Failed) | (Preparing, Cancelled) => true,
            (Running, Paused)
            | (Running, Completed)
            | (Running, Failed)
            | (Running, Cancelled) => true,
            (Paused, Running) | (Paused, Cancelled) => true,
            (Queued, _) | (Preparing, _) | (Running, _) | (Paused, _) => false,
            (Completed, _) | (Failed, _) | (Cancelled, _) => false,
        }
    }
}

impl fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperationStatus {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(OperationStatus::Queued),
            "preparing" => Ok(OperationStatus::Preparing),
            "running" => Ok(OperationStatus::Running),
            "paused" => Ok(OperationStatus::Paused),
            "completed" => Ok(OperationStatus::Completed),
            "failed" => Ok(OperationStatus::Failed),
            "cancelled" => Ok(OperationStatus::Cancelled),
            other => Err(EngineError::Database(format!(
                "Unknown operation status '{}'",
                other
            ))),
        }
    }
}

/// Why a paused operation is paused
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PauseReason {
    /// Operator called `pause`
    Operator,
    /// A cost reservation was rejected
    BudgetExhausted,
}

/// Phase of the quality pipeline a term is in
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Generation,
    Evaluation,
    Improvement,
    Finalization,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Generation => "generation",
            Phase::Evaluation => "evaluation",
            Phase::Improvement => "improvement",
            Phase::Finalization => "finalization",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Bucket a finalized score falls into
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum QualityBand {
    /// 9-10
    Excellent,
    /// 7-8
    Good,
    /// 5-6
    NeedsWork,
    /// 1-4
    Poor,
}

impl QualityBand {
    /// Band for a score; scores outside 1..=10 are clamped first
    pub fn from_score(score: u8) -> Self {
        match score.clamp(1, 10) {
            9..=10 => QualityBand::Excellent,
            7..=8 => QualityBand::Good,
            5..=6 => QualityBand::NeedsWork,
            _ => QualityBand::Poor,
        }
    }
}

/// Counts of finalized terms per quality band
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct QualityDistribution {
    pub excellent: u64,
    pub good: u64,
    pub needs_work: u64,
    pub poor: u64,
}

impl QualityDistribution {
    /// Count one finalized score
    pub fn record(&mut self, score: u8) {
        match QualityBand::from_score(score) {
            QualityBand::Excellent => self.excellent += 1,
            QualityBand::Good => self.good += 1,
            QualityBand::NeedsWork => self.needs_work += 1,
            QualityBand::Poor => self.poor += 1,
        }
    }

    pub fn total(&self) -> u64 {
        self.excellent + self.good + self.needs_work + self.poor
    }
}

/// A per-term error recorded on an operation
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OperationErrorRecord {
    pub term_id: String,
    pub phase: Phase,
    pub message: String,
    /// Unix millis
    pub timestamp: i64,
    /// Attempt index at which the error happened (0 = first attempt)
    pub retry_count: u32,
    /// Set once a later attempt of the same term succeeded
    pub resolved: bool,
}

/// Safety policy derived from configuration when an operation starts
///
/// Read-only once the operation leaves `queued`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SafetyPolicy {
    /// Fraction of processed terms allowed to fail before the breaker trips
    #[serde(default = "default_max_error_rate")]
    pub max_error_rate: f64,

    /// Ceiling on the estimated cost of a single term
    #[serde(default = "default_max_cost_per_term")]
    pub max_cost_per_term: f64,

    /// Hold the operation in `queued` until approved
    #[serde(default)]
    pub require_approval: bool,

    /// Publish a notification when the operation terminates
    #[serde(default = "default_true")]
    pub notify_on_completion: bool,
}

impl Default for SafetyPolicy {
    fn default() -> Self {
        Self {
            max_error_rate: default_max_error_rate(),
            max_cost_per_term: default_max_cost_per_term(),
            require_approval: false,
            notify_on_completion: true,
        }
    }
}

/// Order in which terms are fed to the executor
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingOrder {
    /// Catalog order
    #[default]
    TopDown,
    /// Reverse catalog order
    BottomUp,
}

/// Caller-supplied configuration for `start`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OperationConfig {
    /// Terms per batch; defaults to the column's batch size
    #[serde(default)]
    pub batch_size: Option<usize>,

    /// Sleep between batches, and the base unit of the retry backoff
    #[serde(default = "default_delay_between_batches_ms")]
    pub delay_between_batches_ms: u64,

    /// Monetary ceiling on this operation's spend
    #[serde(default = "default_budget_limit")]
    pub budget_limit: f64,

    /// Skip terms that already hold accepted content for the column
    #[serde(default)]
    pub skip_existing: bool,

    /// Terms of one batch processed concurrently
    #[serde(default = "default_max_parallel_terms")]
    pub max_parallel_terms: usize,

    #[serde(default)]
    pub order: ProcessingOrder,

    /// Restrict the operation to these term ids
    #[serde(default)]
    pub term_ids: Option<Vec<String>>,

    /// Overrides the column's quality threshold
    #[serde(default)]
    pub quality_threshold: Option<u8>,

    /// Overrides the column's retry limit
    #[serde(default)]
    pub retry_limit: Option<u32>,

    /// Overrides the column's priority
    #[serde(default)]
    pub priority: Option<u32>,

    #[serde(default)]
    pub temperature: Option<f32>,

    #[serde(default)]
    pub max_tokens: Option<u32>,

    #[serde(default)]
    pub safety: SafetyPolicy,
}

impl Default for OperationConfig {
    fn default() -> Self {
        Self {
            batch_size: None,
            delay_between_batches_ms: default_delay_between_batches_ms(),
            budget_limit: default_budget_limit(),
            skip_existing: false,
            max_parallel_terms: default_max_parallel_terms(),
            order: ProcessingOrder::TopDown,
            term_ids: None,
            quality_threshold: None,
            retry_limit: None,
            priority: None,
            temperature: None,
            max_tokens: None,
            safety: SafetyPolicy::default(),
        }
    }
}

/// One run of generation across the term corpus for a single column
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BatchOperation {
    pub operation_id: OperationId,
    pub column_id: String,
    pub status: OperationStatus,
    #[serde(default)]
    pub pause_reason: Option<PauseReason>,
    pub priority: u32,

    pub total_terms: u64,
    pub processed_terms: u64,
    pub successful_terms: u64,
    pub failed_terms: u64,
    pub skipped_terms: u64,
    /// Successful terms finalized below the quality threshold
    pub low_quality_terms: u64,

    pub current_batch_index: u64,
    pub total_batches: u64,
    pub current_phase: Phase,
    pub quality_distribution: QualityDistribution,

    pub estimated_cost: f64,
    pub actual_cost: f64,
    pub budget_limit: f64,

    pub error_count: u64,
    pub retry_count: u64,

    pub created_at: i64,
    #[serde(default)]
    pub start_time: Option<i64>,
    pub last_update_time: i64,
    #[serde(default)]
    pub finished_at: Option<i64>,

    /// Cancellation has been requested but not yet observed
    #[serde(default)]
    pub cancel_requested: bool,
    #[serde(default)]
    pub failure_reason: Option<String>,

    pub safety: SafetyPolicy,
    pub errors: Vec<OperationErrorRecord>,
}

impl BatchOperation {
    /// Create a new operation in `queued`
    pub fn new(
        operation_id: impl Into<String>,
        column_id: impl Into<String>,
        priority: u32,
        budget_limit: f64,
        safety: SafetyPolicy,
    ) -> Self {
        let now = now_millis();
        Self {
            operation_id: operation_id.into(),
            column_id: column_id.into(),
            status: OperationStatus::Queued,
            pause_reason: None,
            priority,
            total_terms: 0,
            processed_terms: 0,
            successful_terms: 0,
            failed_terms: 0,
            skipped_terms: 0,
            low_quality_terms: 0,
            current_batch_index: 0,
            total_batches: 0,
            current_phase: Phase::Generation,
            quality_distribution: QualityDistribution::default(),
            estimated_cost: 0.0,
            actual_cost: 0.0,
            budget_limit,
            error_count: 0,
            retry_count: 0,
            created_at: now,
            start_time: None,
            last_update_time: now,
            finished_at: None,
            cancel_requested: false,
            failure_reason: None,
            safety,
            errors: Vec::new(),
        }
    }

    /// Move to `next`, enforcing the lifecycle state machine
    pub fn transition(&mut self, next: OperationStatus) -> Result<(), EngineError> {
        if !self.status.can_transition_to(next) {
            return Err(EngineError::InvalidTransition {
                operation_id: self.operation_id.clone(),
                from: self.status,
                to: next,
            });
        }

        let now = now_millis();
        if next == OperationStatus::Running && self.start_time.is_none() {
            self.start_time = Some(now);
        }
        if next != OperationStatus::Paused {
            self.pause_reason = None;
        }
        if next.is_terminal() {
            self.finished_at = Some(now);
        }
        self.status = next;
        self.last_update_time = now;
        Ok(())
    }

    /// Terms not yet processed, skipped or exhausted
    pub fn remaining_terms(&self) -> u64 {
        self.total_terms.saturating_sub(self.processed_terms)
    }

    /// `error_count / processed_terms`, zero before anything was processed
    pub fn error_rate(&self) -> f64 {
        if self.processed_terms == 0 {
            0.0
        } else {
            self.error_count as f64 / self.processed_terms as f64
        }
    }

    /// `processed = successful + failed + skipped`
    pub fn counters_consistent(&self) -> bool {
        self.processed_terms == self.successful_terms + self.failed_terms + self.skipped_terms
    }
}

/// An append-only record of money spent on one term
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CostLedgerEntry {
    pub operation_id: OperationId,
    pub term_id: String,
    pub amount: f64,
    /// Unix millis
    pub timestamp: i64,
}

/// Read projection of one operation served to pollers
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OperationSnapshot {
    pub operation: BatchOperation,
    /// 0.0-100.0
    pub progress_percent: f64,
    #[serde(default)]
    pub avg_ms_per_term: Option<u64>,
    #[serde(default)]
    pub eta_secs: Option<u64>,
    /// Unix millis of the projection refresh
    pub refreshed_at: i64,
}

/// System-wide projection served to pollers
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SystemMetrics {
    pub queued_operations: usize,
    pub preparing_operations: usize,
    pub running_operations: usize,
    pub paused_operations: usize,
    pub completed_operations: usize,
    pub failed_operations: usize,
    pub cancelled_operations: usize,
    /// Non-terminal operations
    pub active_operations: usize,
    pub max_concurrent_operations: usize,
    /// `active_operations / max_concurrent_operations`
    pub load: f64,
    pub total_spend: f64,
    #[serde(default)]
    pub global_budget_limit: Option<f64>,
    pub terms_processed: u64,
    pub emergency_stop: bool,
}

// Default value functions
fn default_max_error_rate() -> f64 {
    0.10
}

fn default_max_cost_per_term() -> f64 {
    1.0
}

fn default_true() -> bool {
    true
}

fn default_delay_between_batches_ms() -> u64 {
    2_000
}

fn default_budget_limit() -> f64 {
    10.0
}

fn default_max_parallel_terms() -> usize {
    1
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn operation() -> BatchOperation {
        BatchOperation::new("op-1", "term", 0, 10.0, SafetyPolicy::default())
    }

    #[test]
    fn test_happy_path_transitions() {
        let mut op = operation();
        op.transition(OperationStatus::Preparing).unwrap();
        op.transition(OperationStatus::Running).unwrap();
        assert!(op.start_time.is_some());
        op.transition(OperationStatus::Paused).unwrap();
        op.transition(OperationStatus::Running).unwrap();
        op.transition(OperationStatus::Completed).unwrap();
        assert!(op.finished_at.is_some());
    }

    #[test]
    fn test_terminal_states_are_immutable() {
        for terminal in [
            OperationStatus::Completed,
            OperationStatus::Failed,
            OperationStatus::Cancelled,
        ] {
            for next in [
                OperationStatus::Queued,
                OperationStatus::Preparing,
                OperationStatus::Running,
                OperationStatus::Paused,
                OperationStatus::Completed,
                OperationStatus::Failed,
                OperationStatus::Cancelled,
            ] {
                assert!(!terminal.can_transition_to(next));
            }
        }
    }

    #[test]
    fn test_preflight_failure_skips_running() {
        let mut op = operation();
        op.transition(OperationStatus::Preparing).unwrap();
        op.transition(OperationStatus::Failed).unwrap();
        assert!(op.start_time.is_none());
    }

    #[test]
    fn test_invalid_transition_reports_states() {
        let mut op = operation();
        let err = op.transition(OperationStatus::Paused).unwrap_err();
        match err {
            EngineError::InvalidTransition { from, to, .. } => {
                assert_eq!(from, OperationStatus::Queued);
                assert_eq!(to, OperationStatus::Paused);
            }
            other => panic!("unexpected error: {}", other),
        }
        assert_eq!(op.status, OperationStatus::Queued);
    }

    #[test]
    fn test_leaving_pause_clears_reason() {
        let mut op = operation();
        op.transition(OperationStatus::Preparing).unwrap();
        op.transition(OperationStatus::Running).unwrap();
        op.transition(OperationStatus::Paused).unwrap();
        op.pause_reason = Some(PauseReason::BudgetExhausted);
        op.transition(OperationStatus::Running).unwrap();
        assert_eq!(op.pause_reason, None);
    }

    #[test]
    fn test_quality_bands() {
        assert_eq!(QualityBand::from_score(10), QualityBand::Excellent);
        assert_eq!(QualityBand::from_score(9), QualityBand::Excellent);
        assert_eq!(QualityBand::from_score(8), QualityBand::Good);
        assert_eq!(QualityBand::from_score(7), QualityBand::Good);
        assert_eq!(QualityBand::from_score(6), QualityBand::NeedsWork);
        assert_eq!(QualityBand::from_score(5), QualityBand::NeedsWork);
        assert_eq!(QualityBand::from_score(4), QualityBand::Poor);
        assert_eq!(QualityBand::from_score(0), QualityBand::Poor);
        assert_eq!(QualityBand::from_score(42), QualityBand::Excellent);
    }

    #[test]
    fn test_status_round_trip_through_str() {
        for status in [
            OperationStatus::Queued,
            OperationStatus::Preparing,
            OperationStatus::Running,
            OperationStatus::Paused,
            OperationStatus::Completed,
            OperationStatus::Failed,
            OperationStatus::Cancelled,
        ] {
            assert_eq!(status.as_str().parse::<OperationStatus>().unwrap(), status);
        }
        assert!("exploded".parse::<OperationStatus>().is_err());
    }

    #[test]
    fn test_operation_config_defaults_from_empty_json() {
        let config: OperationConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config, OperationConfig::default());
        assert_eq!(config.safety.max_error_rate, 0.10);
        assert_eq!(config.max_parallel_terms, 1);
    }

    proptest! {
        #[test]
        fn prop_distribution_counts_every_score(scores in proptest::collection::vec(0u8..=12, 0..200)) {
            let mut dist = QualityDistribution::default();
            for score in &scores {
                dist.record(*score);
            }
            prop_assert_eq!(dist.total(), scores.len() as u64);
        }

        #[test]
        fn prop_error_rate_is_bounded(errors in 0u64..1000, extra in 0u64..1000) {
            let mut op = operation();
            op.processed_terms = errors + extra;
            op.error_count = errors;
            let rate = op.error_rate();
            prop_assert!((0.0..=1.0).contains(&rate));
        }
    }
}
