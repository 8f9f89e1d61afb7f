//! Integration tests for configuration loading
//!
//! Loads complete config files from disk and checks that every section
//! reaches the operation defaults and the registry.

use colgen_engine::config::Config;
use colgen_engine::registry::ColumnRegistry;
use sdk::errors::EngineError;
use sdk::types::ProcessingOrder;
use tempfile::TempDir;

fn write_config(dir: &TempDir, body: &str) -> std::path::PathBuf {
    let path = dir.path().join("config.toml");
    let contents = format!(
        "[core]\ndata_dir = {:?}\nlog_level = \"debug\"\n{}",
        dir.path().join("data").display().to_string(),
        body
    );
    std::fs::write(&path, contents).unwrap();
    path
}

#[test]
fn test_full_config_file() {
    let temp_dir = TempDir::new().unwrap();
    let path = write_config(
        &temp_dir,
        r#"
[scheduler]
max_concurrent_operations = 5
global_budget_limit = 50.0
status_poll_interval_secs = 1

[batch]
delay_between_batches_ms = 500
max_parallel_terms = 4
budget_limit = 2.5
skip_existing = true
order = "bottom_up"

[safety]
max_error_rate = 0.25
max_cost_per_term = 0.5
require_approval = true
notify_on_completion = false

[provider]
base_url = "http://localhost:8080/v1"
api_key_env = "COLGEN_TEST_KEY"
default_model = "small-model"
temperature = 0.3
max_tokens = 400

[provider.capability_models]
reasoning = "large-model"
"#,
    );

    let config = Config::load_from_path(&path).unwrap();

    assert_eq!(config.core.log_level, "debug");
    assert!(config.core.data_dir.exists());
    assert_eq!(config.db_path(), temp_dir.path().join("data").join("colgen.db"));

    assert_eq!(config.scheduler.max_concurrent_operations, 5);
    assert_eq!(config.scheduler.global_budget_limit, Some(50.0));
    assert_eq!(config.provider.base_url, "http://localhost:8080/v1");
    assert_eq!(
        config.provider.capability_models.get("reasoning").map(String::as_str),
        Some("large-model")
    );

    let defaults = config.operation_defaults();
    assert_eq!(defaults.delay_between_batches_ms, 500);
    assert_eq!(defaults.max_parallel_terms, 4);
    assert_eq!(defaults.budget_limit, 2.5);
    assert!(defaults.skip_existing);
    assert_eq!(defaults.order, ProcessingOrder::BottomUp);
    assert_eq!(defaults.max_tokens, Some(400));
    assert_eq!(defaults.safety.max_error_rate, 0.25);
    assert_eq!(defaults.safety.max_cost_per_term, 0.5);
    assert!(defaults.safety.require_approval);
    assert!(!defaults.safety.notify_on_completion);
}

#[test]
fn test_unparseable_file_is_config_error() {
    let temp_dir = TempDir::new().unwrap();
    let path = write_config(&temp_dir, "[batch\nbudget_limit = 1.0\n");

    let result = Config::load_from_path(&path);
    assert!(matches!(result, Err(EngineError::Config(_))));
}

#[test]
fn test_missing_file_is_config_error() {
    let temp_dir = TempDir::new().unwrap();
    let result = Config::load_from_path(&temp_dir.path().join("absent.toml"));
    assert!(matches!(result, Err(EngineError::Config(_))));
}

#[test]
fn test_negative_global_budget_rejected() {
    let temp_dir = TempDir::new().unwrap();
    let path = write_config(&temp_dir, "[scheduler]\nglobal_budget_limit = -1.0\n");

    let result = Config::load_from_path(&path);
    assert!(matches!(result, Err(EngineError::Config(_))));
}

#[test]
fn test_columns_file_override() {
    let temp_dir = TempDir::new().unwrap();
    let columns_path = temp_dir.path().join("columns.toml");
    std::fs::write(
        &columns_path,
        r#"
[[columns]]
id = "term"
display_name = "Term"
category = "essential"
priority = 0

[[columns]]
id = "summary"
display_name = "Summary"
category = "important"
priority = 1
dependencies = ["term"]
"#,
    )
    .unwrap();

    let path = write_config(
        &temp_dir,
        &format!("columns_file = {:?}\n", columns_path.display().to_string()),
    );
    let config = Config::load_from_path(&path).unwrap();
    assert_eq!(config.core.columns_file.as_deref(), Some(columns_path.as_path()));

    let contents = std::fs::read_to_string(&columns_path).unwrap();
    let registry = ColumnRegistry::from_toml_str(&contents).unwrap();
    assert_eq!(
        registry.resolve_dependencies("summary").unwrap(),
        vec!["term".to_string(), "summary".to_string()]
    );
}
