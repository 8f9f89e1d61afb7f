//! Shared fixtures for engine integration tests
#![allow(dead_code)]

use async_trait::async_trait;
use colgen_engine::config::SchedulerConfig;
use colgen_engine::executor::{MemoryCatalog, Term, TermCatalog};
use colgen_engine::provider::{
    ContentProvider, Evaluation, Generation, GenerationRequest, Improvement, ProviderError,
    Result as ProviderResult,
};
use colgen_engine::registry::ColumnRegistry;
use colgen_engine::scheduler::Scheduler;
use sdk::types::{OperationConfig, OperationSnapshot, OperationStatus};
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Three-column chain: term -> definition_overview -> examples
pub const CATALOG: &str = r#"
[[columns]]
id = "term"
display_name = "Term"
category = "essential"
priority = 0
quality_threshold = 7
batch_size = 50
retry_limit = 0
estimated_tokens = 100

[[columns]]
id = "definition_overview"
display_name = "Definition and Overview"
category = "essential"
priority = 1
dependencies = ["term"]
quality_threshold = 7
batch_size = 50
retry_limit = 0
estimated_tokens = 100

[[columns]]
id = "examples"
display_name = "Examples"
category = "important"
priority = 2
dependencies = ["definition_overview"]
quality_threshold = 7
batch_size = 50
retry_limit = 0
estimated_tokens = 100
"#;

/// Provider with a fixed score, fixed costs and optional per-term failures
pub struct ScriptedProvider {
    pub estimate: f64,
    pub generate_cost: f64,
    pub score: i64,
    pub latency: Duration,
    pub failing_terms: HashSet<String>,
    pub fail_all: bool,
    pub generate_calls: AtomicUsize,
}

impl ScriptedProvider {
    pub fn new() -> Self {
        Self {
            estimate: 0.05,
            generate_cost: 0.05,
            score: 9,
            latency: Duration::ZERO,
            failing_terms: HashSet::new(),
            fail_all: false,
            generate_calls: AtomicUsize::new(0),
        }
    }

    pub fn with_cost(mut self, cost: f64) -> Self {
        self.estimate = cost;
        self.generate_cost = cost;
        self
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn failing(mut self, term_ids: &[&str]) -> Self {
        self.failing_terms = term_ids.iter().map(|id| id.to_string()).collect();
        self
    }

    pub fn failing_all(mut self) -> Self {
        self.fail_all = true;
        self
    }

    pub fn calls(&self) -> usize {
        self.generate_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ContentProvider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    fn estimated_cost(&self, _tokens: u32) -> f64 {
        self.estimate
    }

    async fn generate(&self, request: &GenerationRequest) -> ProviderResult<Generation> {
        self.generate_calls.fetch_add(1, Ordering::SeqCst);
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        if self.fail_all || self.failing_terms.contains(&request.term_id) {
            return Err(ProviderError::Network("connection reset".to_string()));
        }
        Ok(Generation {
            content: format!("{} for {}", request.column_name, request.term_name),
            prompt_tokens: 50,
            completion_tokens: 100,
            cost: self.generate_cost,
        })
    }

    async fn evaluate(&self, _content: &str, _term_id: &str) -> ProviderResult<Evaluation> {
        Ok(Evaluation {
            score: self.score,
            ..Evaluation::default()
        })
    }

    async fn improve(&self, content: &str, _feedback: &Evaluation) -> ProviderResult<Improvement> {
        Ok(Improvement {
            content: format!("{} (improved)", content),
            cost: 0.0,
        })
    }
}

pub fn registry() -> Arc<ColumnRegistry> {
    Arc::new(ColumnRegistry::from_toml_str(CATALOG).unwrap())
}

pub fn terms(count: usize) -> Vec<Term> {
    (1..=count)
        .map(|i| Term::new(format!("t{:02}", i), format!("Term {}", i)))
        .collect()
}

pub fn scheduler_config(max_concurrent_operations: usize) -> SchedulerConfig {
    SchedulerConfig {
        max_concurrent_operations,
        global_budget_limit: None,
        status_poll_interval_secs: 1,
    }
}

/// Scheduler over an in-memory catalog of `term_count` terms
pub fn scheduler(
    provider: Arc<ScriptedProvider>,
    term_count: usize,
    max_concurrent_operations: usize,
) -> (Scheduler, Arc<MemoryCatalog>) {
    let catalog = Arc::new(MemoryCatalog::with_terms(terms(term_count)));
    let dyn_catalog: Arc<dyn TermCatalog> = catalog.clone();
    let scheduler = Scheduler::builder(
        &scheduler_config(max_concurrent_operations),
        registry(),
        provider,
        dyn_catalog,
    )
    .build();
    (scheduler, catalog)
}

/// Fast defaults: no delay between batches, one term at a time
pub fn fast_config() -> OperationConfig {
    OperationConfig {
        delay_between_batches_ms: 0,
        max_parallel_terms: 1,
        budget_limit: 100.0,
        ..OperationConfig::default()
    }
}

/// Poll until `predicate` holds for the operation, failing after five seconds
pub async fn wait_until(
    scheduler: &Scheduler,
    operation_id: &str,
    predicate: impl Fn(&OperationSnapshot) -> bool,
) -> OperationSnapshot {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Ok(snapshot) = scheduler.get_operation_status(operation_id).await {
                if predicate(&snapshot) {
                    return snapshot;
                }
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("operation did not reach the expected state in time")
}

pub async fn wait_for_status(
    scheduler: &Scheduler,
    operation_id: &str,
    status: OperationStatus,
) -> OperationSnapshot {
    wait_until(scheduler, operation_id, |s| s.operation.status == status).await
}

/// Wait for a terminal status, failing after five seconds
pub async fn finish(scheduler: &Scheduler, operation_id: &str) -> OperationSnapshot {
    tokio::time::timeout(Duration::from_secs(5), scheduler.wait(operation_id))
        .await
        .expect("operation did not finish in time")
        .unwrap()
}
