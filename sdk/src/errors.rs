//! Error types and handling
//!
//! This module provides the error types used throughout the colgen engine.
//! All errors implement the `ColgenErrorExt` trait which provides operator-facing
//! hints and indicates whether errors are recoverable.
//!
//! Scheduler rejections (`DependencyNotSatisfied`, `CapacityExceeded`, ...) are
//! returned synchronously to the caller. Provider, budget and error-rate
//! conditions are recorded on the operation as data; the variants below exist so
//! they can be reported uniformly.

use crate::types::OperationStatus;
use thiserror::Error;

/// Trait for colgen error extensions
pub trait ColgenErrorExt {
    /// Returns an operator-facing hint for the error
    ///
    /// The hint never contains secrets or provider payloads.
    fn user_hint(&self) -> &str;

    /// Returns whether the error is recoverable
    ///
    /// Recoverable errors can be retried by the caller, possibly after adjusting
    /// the request. Non-recoverable errors require operator intervention.
    fn is_recoverable(&self) -> bool;
}

/// Main engine error type
///
/// # Error Categories
///
/// - **Registry**: unknown columns, invalid or cyclic column catalogs
/// - **Scheduler**: readiness, capacity and lifecycle rejections
/// - **Execution**: provider, budget and error-rate conditions
/// - **Ambient**: configuration, database and IO failures
///
/// # Examples
///
/// ```
/// use sdk::errors::{ColgenErrorExt, EngineError};
///
/// let error = EngineError::CapacityExceeded { active: 3, limit: 3 };
/// println!("Hint: {}", error.user_hint());
/// assert!(error.is_recoverable());
///
/// let fatal = EngineError::CyclicDependency(vec!["a".into(), "b".into()]);
/// assert!(!fatal.is_recoverable());
/// ```
#[derive(Debug, Error)]
pub enum EngineError {
    // Registry errors
    #[error("Unknown column: {0}")]
    UnknownColumn(String),

    #[error("Cyclic column dependency among: {}", .0.join(", "))]
    CyclicDependency(Vec<String>),

    #[error("Invalid column definition '{column}': {reason}")]
    InvalidColumnDefinition { column: String, reason: String },

    // Scheduler errors
    #[error("Column '{column}' has unsatisfied dependencies: {}", .missing.join(", "))]
    DependencyNotSatisfied { column: String, missing: Vec<String> },

    #[error("Capacity exceeded: {active}/{limit} operations active")]
    CapacityExceeded { active: usize, limit: usize },

    #[error("Column '{column}' already has active operation {operation_id}")]
    ColumnBusy {
        column: String,
        operation_id: String,
    },

    #[error("Invalid transition for operation {operation_id}: {from} -> {to}")]
    InvalidTransition {
        operation_id: String,
        from: OperationStatus,
        to: OperationStatus,
    },

    #[error("Emergency stop is active")]
    EmergencyStopActive,

    #[error("Operation not found: {0}")]
    OperationNotFound(String),

    #[error("Invalid budget: {0}")]
    InvalidBudget(String),

    // Execution errors
    #[error("Provider error: {0}")]
    ProviderError(String),

    #[error("Budget exhausted for operation {operation_id}")]
    BudgetExhausted { operation_id: String },

    #[error("Error rate exceeded for operation {operation_id}: {rate:.3} > {limit:.3}")]
    ErrorRateExceeded {
        operation_id: String,
        rate: f64,
        limit: f64,
    },

    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    // Database errors
    #[error("Database error: {0}")]
    Database(String),

    // Secret store errors
    #[error("Secret store error: {0}")]
    Secret(String),

    // Generic IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ColgenErrorExt for EngineError {
    fn user_hint(&self) -> &str {
        match self {
            // Registry errors
            Self::UnknownColumn(_) => "Check the column id against 'colgen columns'",
            Self::CyclicDependency(_) => "Fix the column catalog: dependencies must not form a cycle",
            Self::InvalidColumnDefinition { .. } => "Fix the column catalog entry and restart",

            // Scheduler errors
            Self::DependencyNotSatisfied { .. } => {
                "Run the dependency columns first, or use --skip-existing if their content already exists"
            }
            Self::CapacityExceeded { .. } => "Too many operations running. Try again later",
            Self::ColumnBusy { .. } => "Wait for the running operation on this column to finish",
            Self::InvalidTransition { .. } => "The operation is not in a state that allows this action",
            Self::EmergencyStopActive => "Clear the emergency stop before starting new operations",
            Self::OperationNotFound(_) => "Check the operation id",
            Self::InvalidBudget(_) => {
                "Budgets must be finite, non-negative and set before the operation finishes"
            }

            // Execution errors
            Self::ProviderError(_) => "Generation provider failed. Check your API key and network",
            Self::BudgetExhausted { .. } => "Raise the budget limit and resume the operation",
            Self::ErrorRateExceeded { .. } => {
                "Too many terms failed. Inspect the operation errors before re-running"
            }

            // Ambient errors
            Self::Config(_) => "Check your config.toml file for errors",
            Self::Database(_) => "Database operation failed. Check the data directory",
            Self::Secret(_) => "Set the provider API key in the environment or the OS keychain",
            Self::Io(_) => "File system operation failed",
        }
    }

    fn is_recoverable(&self) -> bool {
        match self {
            // Non-recoverable errors
            Self::CyclicDependency(_)
            | Self::InvalidColumnDefinition { .. }
            | Self::ErrorRateExceeded { .. } => false,

            // All other errors are potentially recoverable
            _ => true,
        }
    }
}
