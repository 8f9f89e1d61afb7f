//! Command handlers for CLI operations
//!
//! This module implements the handlers for all CLI commands:
//! - columns: List the column catalog or a dependency-first run plan
//! - terms: List or add corpus terms
//! - run: Run one column to completion in the foreground
//! - history / show / ledger: Inspect persisted operations
//! - key: Store or remove the provider API key
//! - doctor: Validate configuration and check dependencies

use anyhow::{Context, Result};
use serde_json::json;
use std::collections::HashSet;
use std::io::{self, Write};
use std::sync::Arc;
use std::time::Duration;

use crate::cli::RunArgs;
use crate::config::Config;
use crate::db::Database;
use crate::executor::{Term, TermCatalog};
use crate::provider::{openai::OpenAIProvider, ContentProvider};
use crate::registry::ColumnRegistry;
use crate::scheduler::Scheduler;
use crate::secrets::{SecretCache, SecretManager};
use sdk::errors::ColgenErrorExt;
use sdk::types::{
    now_millis, BatchOperation, OperationConfig, OperationSnapshot, OperationStatus, PauseReason,
};

/// Keychain service name for provider credentials
const SECRET_SERVICE: &str = "colgen";

/// What `run` does about its operation on a status tick
#[derive(Debug, Clone, Copy, PartialEq)]
enum BudgetPause {
    /// Raise the budget to this limit and resume
    Raise(f64),
    /// No raise left: cancel and report
    Stop,
}

/// Output format for command results
#[derive(Debug, Clone, Copy)]
pub enum OutputFormat {
    /// Human-readable text output
    Text,
    /// JSON output for machine consumption
    Json,
}

/// List the column catalog, or the dependency-first plan for one column
pub async fn handle_columns(
    plan: Option<String>,
    config: &Config,
    format: OutputFormat,
) -> Result<()> {
    let registry = ColumnRegistry::load(config.core.columns_file.as_deref())?;
    let database = open_database(config).await?;
    let completed = database
        .operations()
        .completed_columns()
        .await
        .context("Failed to load completed columns")?;
    let counts = database.content().content_counts().await?;
    database.close().await?;

    let content_count = |column_id: &str| {
        counts
            .iter()
            .find(|(id, _)| id == column_id)
            .map(|(_, n)| *n)
            .unwrap_or(0)
    };

    if let Some(column_id) = plan {
        let order = registry.resolve_dependencies(&column_id)?;

        match format {
            OutputFormat::Text => {
                println!("Run plan for '{}':", column_id);
                println!();
                for (i, id) in order.iter().enumerate() {
                    let state = if completed.contains(id) {
                        "completed"
                    } else {
                        "pending"
                    };
                    println!("  {}. {:<28} {}", i + 1, id, state);
                }
            }
            OutputFormat::Json => {
                let output = json!({
                    "column": column_id,
                    "plan": order.iter().map(|id| json!({
                        "column": id,
                        "completed": completed.contains(id),
                    })).collect::<Vec<_>>(),
                });
                println!("{}", serde_json::to_string_pretty(&output)?);
            }
        }
        return Ok(());
    }

    let columns = registry.list();
    match format {
        OutputFormat::Text => {
            println!("Columns ({}):", columns.len());
            println!();
            for column in &columns {
                let marker = if completed.contains(&column.id) {
                    "✓"
                } else {
                    " "
                };
                println!(
                    "{} {} ({}) [{}] priority {}",
                    marker,
                    column.id,
                    column.display_name,
                    column.category.as_str(),
                    column.priority
                );
                if !column.dependencies.is_empty() {
                    println!("    depends on: {}", column.dependencies.join(", "));
                }
                println!(
                    "    threshold {} | batch {} | retries {} | {} terms with content",
                    column.quality_threshold,
                    column.batch_size,
                    column.retry_limit,
                    content_count(&column.id)
                );
            }
        }
        OutputFormat::Json => {
            let output = json!({
                "columns": columns.iter().map(|column| json!({
                    "definition": column,
                    "completed": completed.contains(&column.id),
                    "content_count": content_count(&column.id),
                })).collect::<Vec<_>>(),
                "count": columns.len(),
            });
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
    }

    Ok(())
}

/// List terms in catalog order
pub async fn handle_terms_list(config: &Config, format: OutputFormat) -> Result<()> {
    let database = open_database(config).await?;
    let terms = database.content().list_terms().await?;
    database.close().await?;

    match format {
        OutputFormat::Text => {
            if terms.is_empty() {
                println!("No terms in the corpus");
                return Ok(());
            }
            println!("Terms ({}):", terms.len());
            for term in &terms {
                println!("  {:<24} {}", term.id, term.name);
            }
        }
        OutputFormat::Json => {
            let output = json!({
                "terms": terms,
                "count": terms.len(),
            });
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
    }

    Ok(())
}

/// Add a term to the corpus
pub async fn handle_terms_add(
    id: String,
    name: String,
    config: &Config,
    format: OutputFormat,
) -> Result<()> {
    let database = open_database(config).await?;
    let term = Term::new(id, name);
    database.content().add_term(&term).await?;
    database.close().await?;

    match format {
        OutputFormat::Text => println!("Added term '{}' ({})", term.id, term.name),
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&json!({ "term": term }))?)
        }
    }

    Ok(())
}

/// Run a batch operation for one column in the foreground
///
/// Invoking `run` counts as operator approval. Ctrl-C cancels the
/// operation at the next term boundary and waits for it to settle. A pause
/// for budget is raised once to `--raise-budget`; after that the operation
/// is cancelled and `run` exits with a hint.
pub async fn handle_run(args: RunArgs, config: &Config, format: OutputFormat) -> Result<()> {
    let database = open_database(config).await?;
    let registry = Arc::new(ColumnRegistry::load(config.core.columns_file.as_deref())?);

    let secret_manager = Arc::new(SecretManager::new(SECRET_SERVICE));
    let secret_cache = Arc::new(SecretCache::new(secret_manager));
    let provider: Arc<dyn ContentProvider> = Arc::new(
        OpenAIProvider::new(config.provider.clone(), secret_cache)
            .context("Failed to initialize content provider")?,
    );
    if !provider.check_health().await {
        database.close().await?;
        anyhow::bail!(
            "Provider '{}' has no API key\nHint: export {} or run 'colgen key set'",
            provider.name(),
            config.provider.api_key_env
        );
    }
    tracing::debug!(provider = provider.name(), "Content provider ready");
    let catalog: Arc<dyn TermCatalog> = Arc::new(database.content());

    let scheduler = Scheduler::builder(&config.scheduler, registry, provider, catalog)
        .journal(database.journal())
        .build();

    let report = scheduler.recover().await?;
    if !report.interrupted.is_empty() {
        tracing::warn!(
            count = report.interrupted.len(),
            "Operations interrupted by a previous shutdown were marked failed"
        );
    }

    let operation_config = build_operation_config(&args, config);
    let operation_id = match scheduler.start(&args.column, operation_config).await {
        Ok(id) => id,
        Err(e) => {
            database.close().await?;
            return Err(anyhow::anyhow!("{}\nHint: {}", e, e.user_hint()));
        }
    };

    if let OutputFormat::Text = format {
        println!("Started operation {} for column '{}'", operation_id, args.column);
    }
    if let Err(e) = scheduler.approve(&operation_id).await {
        tracing::debug!(error = %e, "Operation settled before approval");
    }

    let poll = Duration::from_secs(config.scheduler.status_poll_interval_secs.max(1));
    let mut ticker = tokio::time::interval(poll);
    let mut cancel_sent = false;
    let mut raise_budget = args.raise_budget;
    let mut budget_stopped = false;

    let snapshot = loop {
        tokio::select! {
            result = scheduler.wait(&operation_id) => break result?,
            _ = tokio::signal::ctrl_c(), if !cancel_sent => {
                cancel_sent = true;
                tracing::warn!(operation_id = %operation_id, "Interrupt received, cancelling operation");
                if let Err(e) = scheduler.cancel(&operation_id).await {
                    tracing::warn!(error = %e, "Cancel request rejected");
                }
            }
            _ = ticker.tick() => {
                let Ok(snapshot) = scheduler.get_operation_status(&operation_id).await else {
                    continue;
                };
                if let OutputFormat::Text = format {
                    print_progress(&snapshot);
                }

                match budget_pause_action(&snapshot, raise_budget) {
                    Some(BudgetPause::Raise(limit)) => {
                        raise_budget = None;
                        tracing::info!(
                            operation_id = %operation_id,
                            budget_limit = limit,
                            "Raising budget and resuming"
                        );
                        let resumed = match scheduler.set_budget_limit(&operation_id, limit).await {
                            Ok(()) => scheduler.resume(&operation_id).await,
                            Err(e) => Err(e),
                        };
                        if let Err(e) = resumed {
                            tracing::warn!(error = %e, "Budget raise rejected");
                        }
                    }
                    Some(BudgetPause::Stop) if !cancel_sent => {
                        cancel_sent = true;
                        budget_stopped = true;
                        tracing::warn!(
                            operation_id = %operation_id,
                            "Budget exhausted, cancelling operation"
                        );
                        if let Err(e) = scheduler.cancel(&operation_id).await {
                            tracing::warn!(error = %e, "Cancel request rejected");
                        }
                    }
                    _ => {}
                }
            }
        }
    };

    database.close().await?;

    match format {
        OutputFormat::Text => {
            println!();
            print_operation(&snapshot);
        }
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&snapshot)?);
        }
    }

    if budget_stopped {
        anyhow::bail!(
            "Operation {} stopped: budget exhausted (${:.2} of ${:.2} spent)\nHint: rerun with --skip-existing and a higher --budget, or pass --raise-budget",
            operation_id,
            snapshot.operation.actual_cost,
            snapshot.operation.budget_limit
        );
    }

    if snapshot.operation.status == OperationStatus::Failed {
        anyhow::bail!(
            "Operation {} failed: {}",
            operation_id,
            snapshot
                .operation
                .failure_reason
                .as_deref()
                .unwrap_or("unknown reason")
        );
    }

    Ok(())
}

/// Show the most recent operations
pub async fn handle_history(limit: usize, config: &Config, format: OutputFormat) -> Result<()> {
    let database = open_database(config).await?;
    let operations = database
        .operations()
        .list_recent(limit as i64)
        .await
        .context("Failed to fetch operation history")?;
    database.close().await?;

    match format {
        OutputFormat::Text => {
            if operations.is_empty() {
                println!("No operations in history");
                return Ok(());
            }

            println!("Operation History (last {} operations):", limit);
            println!();

            for op in &operations {
                println!("Operation ID: {}", op.operation_id);
                println!("  Column: {}", op.column_id);
                println!("  Status: {}", op.status);
                println!(
                    "  Terms: {}/{} processed, {} failed",
                    op.processed_terms, op.total_terms, op.failed_terms
                );
                println!("  Cost: ${:.4}", op.actual_cost);
                println!("  Created: {}", format_timestamp(op.created_at));
                println!();
            }
        }
        OutputFormat::Json => {
            let output = json!({
                "operations": operations,
                "count": operations.len(),
                "limit": limit
            });
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
    }

    Ok(())
}

/// Show one operation, including its error records
pub async fn handle_show(operation_id: String, config: &Config, format: OutputFormat) -> Result<()> {
    let database = open_database(config).await?;
    let operation = database
        .operations()
        .get(&operation_id)
        .await
        .context("Failed to fetch operation")?;
    database.close().await?;

    let operation =
        operation.ok_or_else(|| anyhow::anyhow!("Operation not found: {}", operation_id))?;
    let snapshot = crate::status::project(&operation, now_millis());

    match format {
        OutputFormat::Text => {
            print_operation(&snapshot);

            let errors = &snapshot.operation.errors;
            if !errors.is_empty() {
                println!();
                println!("Errors ({} total):", errors.len());
                for record in errors {
                    let state = if record.resolved { "resolved" } else { "open" };
                    println!(
                        "  [{}] {} during {} (retry {}, {}): {}",
                        format_timestamp(record.timestamp),
                        record.term_id,
                        record.phase,
                        record.retry_count,
                        state,
                        record.message
                    );
                }
            }
        }
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&snapshot)?);
        }
    }

    Ok(())
}

/// Show the cost ledger of one operation
pub async fn handle_ledger(
    operation_id: String,
    config: &Config,
    format: OutputFormat,
) -> Result<()> {
    let database = open_database(config).await?;
    let ledger = database.ledger();
    let entries = ledger.list(&operation_id).await?;
    let total = ledger.total_for(&operation_id).await?;
    database.close().await?;

    match format {
        OutputFormat::Text => {
            if entries.is_empty() {
                println!("No ledger entries for operation {}", operation_id);
                return Ok(());
            }
            println!("Cost ledger for {}:", operation_id);
            println!();
            for entry in &entries {
                println!(
                    "  {}  {:<24} ${:.4}",
                    format_timestamp(entry.timestamp),
                    entry.term_id,
                    entry.amount
                );
            }
            println!();
            println!("  Total: ${:.4} ({} entries)", total, entries.len());
        }
        OutputFormat::Json => {
            let output = json!({
                "operation_id": operation_id,
                "entries": entries,
                "count": entries.len(),
                "total": total,
            });
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
    }

    Ok(())
}

/// Store the provider API key in the OS keychain, reading it from stdin
pub async fn handle_key_set(config: &Config, format: OutputFormat) -> Result<()> {
    let key_name = &config.provider.api_key_env;

    if matches!(format, OutputFormat::Text) {
        print!("API key for {}: ", key_name);
        io::stdout().flush()?;
    }
    let mut value = String::new();
    io::stdin()
        .read_line(&mut value)
        .context("Failed to read API key from stdin")?;
    let value = value.trim();
    if value.is_empty() {
        anyhow::bail!("No API key given");
    }

    SecretManager::new(SECRET_SERVICE)
        .set_secret(key_name, value)
        .map_err(|e| anyhow::anyhow!("{}\nHint: {}", e, e.user_hint()))?;

    match format {
        OutputFormat::Text => println!("Stored {} in keychain.", key_name),
        OutputFormat::Json => {
            let output = json!({ "key": key_name, "stored": true });
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
    }

    Ok(())
}

/// Remove the provider API key from the OS keychain
pub async fn handle_key_delete(config: &Config, format: OutputFormat) -> Result<()> {
    let key_name = &config.provider.api_key_env;

    SecretManager::new(SECRET_SERVICE)
        .delete_secret(key_name)
        .map_err(|e| anyhow::anyhow!("{}\nHint: {}", e, e.user_hint()))?;

    match format {
        OutputFormat::Text => println!("Removed {} from keychain.", key_name),
        OutputFormat::Json => {
            let output = json!({ "key": key_name, "deleted": true });
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
    }

    Ok(())
}

/// Validate configuration and check dependencies
pub async fn handle_doctor(config: &Config, format: OutputFormat) -> Result<()> {
    let mut issues = Vec::new();
    let mut checks: Vec<(&str, String)> = Vec::new();

    // Config is already validated when loaded
    checks.push(("Configuration", "Valid".to_string()));

    if config.core.data_dir.exists() {
        checks.push(("Data directory", "Exists".to_string()));
    } else {
        checks.push(("Data directory", "Missing".to_string()));
        issues.push(format!(
            "Data directory does not exist: {:?}",
            config.core.data_dir
        ));
    }

    match ColumnRegistry::load(config.core.columns_file.as_deref()) {
        Ok(registry) => {
            let source = if config.core.columns_file.is_some() {
                "custom"
            } else {
                "built-in"
            };
            checks.push((
                "Column catalog",
                format!("{} columns ({})", registry.len(), source),
            ));
        }
        Err(e) => {
            checks.push(("Column catalog", "Invalid".to_string()));
            issues.push(format!("Cannot load column catalog: {}", e));
        }
    }

    match open_database(config).await {
        Ok(database) => {
            let interrupted = database
                .operations()
                .list_recent(i64::MAX)
                .await
                .map(|ops| ops.iter().filter(|op| !op.status.is_terminal()).count());
            match interrupted {
                Ok(0) => checks.push(("Database", "Accessible".to_string())),
                Ok(n) => {
                    checks.push(("Database", "Accessible".to_string()));
                    issues.push(format!(
                        "{} operation(s) were interrupted and will be marked failed on the next run",
                        n
                    ));
                }
                Err(e) => {
                    checks.push(("Database", "Error".to_string()));
                    issues.push(format!("Cannot read operations: {}", e));
                }
            }
            database.close().await?;
        }
        Err(e) => {
            checks.push(("Database", "Error".to_string()));
            issues.push(format!("Cannot open database: {:#}", e));
        }
    }

    let secret_manager = SecretManager::new(SECRET_SERVICE);
    if secret_manager.has_secret(&config.provider.api_key_env) {
        checks.push(("Provider API key", "Configured".to_string()));
    } else {
        checks.push(("Provider API key", "Not configured".to_string()));
        issues.push(format!(
            "No API key found. Set {} or store it in the OS keychain.",
            config.provider.api_key_env
        ));
    }

    match format {
        OutputFormat::Text => {
            println!("Colgen System Diagnostics");
            println!("============================");
            println!();

            println!("System Checks:");
            for (check, status) in &checks {
                println!("  {:<25} {}", format!("{}:", check), status);
            }

            println!();

            if issues.is_empty() {
                println!("✓ All checks passed!");
            } else {
                println!("⚠ Issues found:");
                println!();
                for (i, issue) in issues.iter().enumerate() {
                    println!("  {}. {}", i + 1, issue);
                }
            }
        }
        OutputFormat::Json => {
            let output = json!({
                "checks": checks.iter().map(|(name, status)| {
                    json!({
                        "name": name,
                        "status": status
                    })
                }).collect::<Vec<_>>(),
                "issues": issues,
                "healthy": issues.is_empty()
            });
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
    }

    Ok(())
}

/// Merge `run` flags over the configured defaults
pub fn build_operation_config(args: &RunArgs, config: &Config) -> OperationConfig {
    let mut operation = config.operation_defaults();

    if let Some(budget) = args.budget {
        operation.budget_limit = budget;
    }
    if let Some(batch_size) = args.batch_size {
        operation.batch_size = Some(batch_size);
    }
    if let Some(delay_ms) = args.delay_ms {
        operation.delay_between_batches_ms = delay_ms;
    }
    if let Some(parallel) = args.parallel {
        operation.max_parallel_terms = parallel;
    }
    if args.skip_existing {
        operation.skip_existing = true;
    }
    if let Some(order) = args.order {
        operation.order = order.into();
    }
    if !args.terms.is_empty() {
        let mut seen = HashSet::new();
        let terms = args
            .terms
            .iter()
            .filter(|id| seen.insert(id.as_str()))
            .cloned()
            .collect();
        operation.term_ids = Some(terms);
    }
    if let Some(threshold) = args.threshold {
        operation.quality_threshold = Some(threshold);
    }
    if let Some(retry_limit) = args.retry_limit {
        operation.retry_limit = Some(retry_limit);
    }

    operation
}

/// Decide what to do about an operation paused for budget
fn budget_pause_action(
    snapshot: &OperationSnapshot,
    raise_to: Option<f64>,
) -> Option<BudgetPause> {
    let op = &snapshot.operation;
    if op.status != OperationStatus::Paused
        || op.pause_reason != Some(PauseReason::BudgetExhausted)
    {
        return None;
    }
    match raise_to {
        Some(limit) if limit > op.budget_limit => Some(BudgetPause::Raise(limit)),
        _ => Some(BudgetPause::Stop),
    }
}

async fn open_database(config: &Config) -> Result<Database> {
    Database::new(&config.db_path())
        .await
        .context("Failed to open database")
}

fn format_timestamp(millis: i64) -> String {
    chrono::DateTime::from_timestamp_millis(millis)
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| "Unknown".to_string())
}

fn print_progress(snapshot: &OperationSnapshot) {
    let op = &snapshot.operation;
    let eta = snapshot
        .eta_secs
        .map(|secs| format!(", ETA {}s", secs))
        .unwrap_or_default();
    println!(
        "[{}] {:>5.1}% {}/{} terms, batch {}/{}, ${:.4} spent{}",
        op.status,
        snapshot.progress_percent,
        op.processed_terms,
        op.total_terms,
        op.current_batch_index,
        op.total_batches,
        op.actual_cost,
        eta
    );
}

fn print_operation(snapshot: &OperationSnapshot) {
    let op: &BatchOperation = &snapshot.operation;
    println!("Operation: {}", op.operation_id);
    println!("  Column: {}", op.column_id);
    println!("  Status: {}", op.status);
    if let Some(reason) = &op.pause_reason {
        println!("  Paused: {:?}", reason);
    }
    if let Some(reason) = &op.failure_reason {
        println!("  Failure: {}", reason);
    }
    println!(
        "  Terms: {}/{} processed ({:.1}%)",
        op.processed_terms, op.total_terms, snapshot.progress_percent
    );
    println!(
        "    successful {} | failed {} | skipped {} | low quality {}",
        op.successful_terms, op.failed_terms, op.skipped_terms, op.low_quality_terms
    );
    let q = &op.quality_distribution;
    println!(
        "  Quality: excellent {} | good {} | needs work {} | poor {}",
        q.excellent, q.good, q.needs_work, q.poor
    );
    println!(
        "  Cost: ${:.4} of ${:.2} budget (estimated ${:.4})",
        op.actual_cost, op.budget_limit, op.estimated_cost
    );
    println!("  Retries: {} | Errors: {}", op.retry_count, op.error_count);
    if let Some(avg) = snapshot.avg_ms_per_term {
        println!("  Average: {}ms per term", avg);
    }
    println!("  Created: {}", format_timestamp(op.created_at));
    if let Some(finished) = op.finished_at {
        println!("  Finished: {}", format_timestamp(finished));
    }
}
