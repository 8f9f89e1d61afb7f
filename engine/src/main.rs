// Colgen column batch generation orchestrator
// Main entry point for the colgen binary

use clap::Parser;
use colgen_engine::cli::{Cli, Command, KeyAction, TermAction};
use colgen_engine::config::Config;
use colgen_engine::handlers::{
    handle_columns, handle_doctor, handle_history, handle_key_delete, handle_key_set,
    handle_ledger, handle_run, handle_show, handle_terms_add, handle_terms_list, OutputFormat,
};
use colgen_engine::telemetry::init_telemetry_with_level;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse CLI arguments
    let cli = Cli::parse();

    // Determine output format
    let format = if cli.json {
        OutputFormat::Json
    } else {
        OutputFormat::Text
    };

    // Load configuration (or use custom path if provided)
    let config = if let Some(config_path) = &cli.config {
        Config::load_from_path(config_path)?
    } else {
        Config::load_or_create()?
    };

    // `--log` wins over the configured level; RUST_LOG wins over both
    let log_level = cli.log.as_deref().unwrap_or(config.core.log_level.as_str());
    init_telemetry_with_level(log_level);

    let version = env!("CARGO_PKG_VERSION");
    let commit = env!("GIT_COMMIT_HASH");
    let timestamp = env!("BUILD_TIMESTAMP");

    tracing::info!("Colgen v{} ({} - {})", version, commit, timestamp);

    // Handle commands
    match cli.command {
        Command::Columns { plan } => {
            tracing::debug!("Listing columns");
            handle_columns(plan, &config, format).await
        }

        Command::Terms { action } => match action {
            TermAction::List => handle_terms_list(&config, format).await,
            TermAction::Add { id, name } => {
                tracing::info!("Adding term: {}", id);
                handle_terms_add(id, name, &config, format).await
            }
        },

        Command::Run(args) => {
            tracing::info!("Running column: {}", args.column);
            handle_run(args, &config, format).await
        }

        Command::History { limit } => {
            tracing::debug!("Showing last {} operations", limit);
            handle_history(limit, &config, format).await
        }

        Command::Show { operation_id } => handle_show(operation_id, &config, format).await,

        Command::Ledger { operation_id } => handle_ledger(operation_id, &config, format).await,

        Command::Key { action } => match action {
            KeyAction::Set => handle_key_set(&config, format).await,
            KeyAction::Delete => handle_key_delete(&config, format).await,
        },

        Command::Doctor => {
            tracing::info!("Running diagnostics...");
            handle_doctor(&config, format).await
        }
    }
}
