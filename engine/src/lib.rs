//! Colgen Engine Library
//!
//! This library provides the core functionality of the colgen orchestrator.
//! It is used by both the main binary and integration tests.

/// Configuration management module
pub mod config;

/// Secret management module
pub mod secrets;

/// Column catalog and dependency graph
pub mod registry;

/// Database persistence module
pub mod db;

/// Message bus for operation lifecycle events
pub mod message_bus;

/// Content provider abstraction layer
pub mod provider;

/// Generate, evaluate and improve loop
pub mod quality;

/// Cost reservations, ledger and budgets
pub mod budget;

/// Cancellation, emergency stop and error-rate breaker
pub mod safety;

/// Progress projection and system metrics
pub mod status;

/// Batch execution of one operation
pub mod executor;

/// Operation admission and lifecycle control
pub mod scheduler;

/// Telemetry and Observability
pub mod telemetry;

/// CLI interface module
pub mod cli;

/// Command handlers module
pub mod handlers;
