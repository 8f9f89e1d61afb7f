//! CLI interface for colgen
//!
//! Defines every command and global flag with clap's derive API.

use clap::{Parser, Subcommand, ValueEnum};
use sdk::types::ProcessingOrder;
use std::path::PathBuf;

/// Column batch generation orchestrator
///
/// Generates structured content columns across a term corpus through an
/// external generation capability, with dependency checks, a quality gate,
/// budgets and operator safety controls.
#[derive(Parser, Debug)]
#[command(name = "colgen")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Output in JSON format
    #[arg(long, global = true)]
    pub json: bool,

    /// Set log level (error, warn, info, debug, trace)
    #[arg(long, global = true, value_name = "LEVEL")]
    pub log: Option<String>,

    /// Specify alternate configuration file
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// List the column catalog
    Columns {
        /// Show the dependency-first run plan for one column
        #[arg(long, value_name = "COLUMN")]
        plan: Option<String>,
    },

    /// Manage the term corpus
    Terms {
        #[command(subcommand)]
        action: TermAction,
    },

    /// Run a batch operation for one column and follow it to completion
    Run(RunArgs),

    /// Show operation history
    History {
        /// Number of operations to show
        #[arg(short, long, default_value = "10")]
        limit: usize,
    },

    /// Show one operation in detail
    Show {
        /// Operation ID
        operation_id: String,
    },

    /// Show the cost ledger of one operation
    Ledger {
        /// Operation ID
        operation_id: String,
    },

    /// Manage the provider API key in the OS keychain
    Key {
        #[command(subcommand)]
        action: KeyAction,
    },

    /// Validate configuration, column catalog, database and API key
    Doctor,
}

/// API key actions
#[derive(Subcommand, Debug)]
pub enum KeyAction {
    /// Store the API key (read from stdin)
    Set,

    /// Remove the stored API key
    Delete,
}

/// Term corpus actions
#[derive(Subcommand, Debug)]
pub enum TermAction {
    /// List terms in catalog order
    List,

    /// Add a term (or rename an existing one)
    Add {
        /// Term ID
        id: String,
        /// Display name
        name: String,
    },
}

/// Processing order flag
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderArg {
    TopDown,
    BottomUp,
}

impl From<OrderArg> for ProcessingOrder {
    fn from(order: OrderArg) -> Self {
        match order {
            OrderArg::TopDown => ProcessingOrder::TopDown,
            OrderArg::BottomUp => ProcessingOrder::BottomUp,
        }
    }
}

/// Flags of `colgen run`; unset flags fall back to config and the column
#[derive(clap::Args, Debug, Clone)]
pub struct RunArgs {
    /// Column ID
    pub column: String,

    /// Budget limit for this operation
    #[arg(long, value_name = "AMOUNT")]
    pub budget: Option<f64>,

    /// Terms per batch
    #[arg(long)]
    pub batch_size: Option<usize>,

    /// Delay between batches in milliseconds
    #[arg(long, value_name = "MS")]
    pub delay_ms: Option<u64>,

    /// Terms processed concurrently within a batch
    #[arg(long, value_name = "N")]
    pub parallel: Option<usize>,

    /// Skip terms that already hold content for the column
    #[arg(long)]
    pub skip_existing: bool,

    /// Processing order of the term corpus
    #[arg(long, value_enum)]
    pub order: Option<OrderArg>,

    /// Restrict the run to these term IDs (repeatable)
    #[arg(long = "term", value_name = "TERM_ID")]
    pub terms: Vec<String>,

    /// Override the column's quality threshold (1-10)
    #[arg(long, value_name = "SCORE")]
    pub threshold: Option<u8>,

    /// Override the column's retry limit
    #[arg(long)]
    pub retry_limit: Option<u32>,

    /// Raise the budget to AMOUNT and resume once if the operation pauses
    /// for budget
    #[arg(long, value_name = "AMOUNT")]
    pub raise_budget: Option<f64>,
}
