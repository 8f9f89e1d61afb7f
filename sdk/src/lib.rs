//! Colgen SDK
//!
//! Shared data contracts for the column generation engine and the clients that
//! poll it. Everything a dashboard needs to read an operation lives here.

/// Error types and handling
pub mod errors;

/// Operation, column and metrics types
pub mod types;

// Re-export commonly used types
pub use errors::{ColgenErrorExt, EngineError};
pub use types::{
    now_millis, BatchOperation, ColumnCategory, CostLedgerEntry, OperationConfig,
    OperationErrorRecord, OperationId, OperationSnapshot, OperationStatus, PauseReason, Phase,
    ProcessingOrder, QualityBand, QualityDistribution, SafetyPolicy, SystemMetrics,
};
