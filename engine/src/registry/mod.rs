//! Column Registry
//!
//! Immutable metadata for every content column, loaded once at startup from a
//! TOML catalog. Loading validates the catalog: ids are unique, dependencies
//! exist, the dependency graph is acyclic, and every column's priority is at
//! least the priority of each of its dependencies. A catalog that fails any
//! check is fatal.
//!
//! Topological order is computed with Kahn's algorithm, taking ready columns
//! in `(priority, id)` order so the result is deterministic.

use sdk::errors::EngineError;
use sdk::types::ColumnCategory;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::Path;

/// Built-in catalog shipped with the binary
const BUILTIN_CATALOG: &str = include_str!("../../columns.toml");

/// Relative generation difficulty of a column
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Complexity {
    Simple,
    #[default]
    Moderate,
    Complex,
}

/// Metadata for one content column
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ColumnDefinition {
    pub id: String,
    pub display_name: String,
    pub category: ColumnCategory,

    /// Lower runs earlier
    pub priority: u32,

    #[serde(default)]
    pub complexity: Complexity,

    #[serde(default)]
    pub dependencies: Vec<String>,

    /// Minimum accepted evaluation score (1-10)
    #[serde(default = "default_quality_threshold")]
    pub quality_threshold: u8,

    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Improvement rounds per term, and generation retries per term
    #[serde(default = "default_retry_limit")]
    pub retry_limit: u32,

    /// Capability hint passed through to the provider
    #[serde(default = "default_capability")]
    pub recommended_capability: String,

    /// Token estimate for one generation, used for cost reservations
    #[serde(default = "default_estimated_tokens")]
    pub estimated_tokens: u32,
}

fn default_quality_threshold() -> u8 {
    7
}

fn default_batch_size() -> usize {
    50
}

fn default_retry_limit() -> u32 {
    2
}

fn default_capability() -> String {
    "default".to_string()
}

fn default_estimated_tokens() -> u32 {
    500
}

#[derive(Debug, Deserialize)]
struct Catalog {
    #[serde(default)]
    columns: Vec<ColumnDefinition>,
}

/// Validated, immutable column catalog
#[derive(Debug, Clone)]
pub struct ColumnRegistry {
    columns: HashMap<String, ColumnDefinition>,
    /// Every column id, dependency-first
    topo_order: Vec<String>,
}

impl ColumnRegistry {
    /// Load the catalog from `path`, or the built-in catalog when `None`
    pub fn load(path: Option<&Path>) -> Result<Self, EngineError> {
        match path {
            Some(path) => {
                let contents = std::fs::read_to_string(path).map_err(|e| {
                    EngineError::Config(format!(
                        "Failed to read column catalog {}: {}",
                        path.display(),
                        e
                    ))
                })?;
                Self::from_toml_str(&contents)
            }
            None => Self::builtin(),
        }
    }

    /// The catalog shipped with the binary
    pub fn builtin() -> Result<Self, EngineError> {
        Self::from_toml_str(BUILTIN_CATALOG)
    }

    /// Parse and validate a TOML catalog
    pub fn from_toml_str(contents: &str) -> Result<Self, EngineError> {
        let catalog: Catalog = toml::from_str(contents)
            .map_err(|e| EngineError::Config(format!("Failed to parse column catalog: {}", e)))?;
        Self::from_definitions(catalog.columns)
    }

    /// Validate a set of definitions and build the registry
    pub fn from_definitions(definitions: Vec<ColumnDefinition>) -> Result<Self, EngineError> {
        let mut columns = HashMap::with_capacity(definitions.len());

        for def in definitions {
            validate_definition(&def)?;
            let id = def.id.clone();
            if columns.insert(id.clone(), def).is_some() {
                return Err(EngineError::InvalidColumnDefinition {
                    column: id,
                    reason: "duplicate column id".to_string(),
                });
            }
        }

        for def in columns.values() {
            for dep in &def.dependencies {
                if dep == &def.id {
                    return Err(EngineError::CyclicDependency(vec![def.id.clone()]));
                }
                if !columns.contains_key(dep) {
                    return Err(EngineError::InvalidColumnDefinition {
                        column: def.id.clone(),
                        reason: format!("unknown dependency '{}'", dep),
                    });
                }
            }
        }

        let topo_order = topological_order(&columns)?;

        for def in columns.values() {
            for dep in &def.dependencies {
                let dep_priority = columns[dep].priority;
                if def.priority < dep_priority {
                    return Err(EngineError::InvalidColumnDefinition {
                        column: def.id.clone(),
                        reason: format!(
                            "priority {} is lower than dependency '{}' priority {}",
                            def.priority, dep, dep_priority
                        ),
                    });
                }
            }
        }

        tracing::debug!("Loaded column registry with {} columns", columns.len());

        Ok(Self {
            columns,
            topo_order,
        })
    }

    /// Look up a column
    pub fn get(&self, column_id: &str) -> Result<&ColumnDefinition, EngineError> {
        self.columns
            .get(column_id)
            .ok_or_else(|| EngineError::UnknownColumn(column_id.to_string()))
    }

    /// All columns sorted by `(priority, id)`
    pub fn list(&self) -> Vec<&ColumnDefinition> {
        let mut all: Vec<&ColumnDefinition> = self.columns.values().collect();
        all.sort_by(|a, b| a.priority.cmp(&b.priority).then_with(|| a.id.cmp(&b.id)));
        all
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// Transitive dependencies of `column_id` followed by the column itself,
    /// dependency-first
    pub fn resolve_dependencies(&self, column_id: &str) -> Result<Vec<String>, EngineError> {
        self.get(column_id)?;

        let mut needed: HashSet<&str> = HashSet::new();
        let mut stack = vec![column_id];
        while let Some(id) = stack.pop() {
            if !needed.insert(id) {
                continue;
            }
            if let Some(def) = self.columns.get(id) {
                stack.extend(def.dependencies.iter().map(String::as_str));
            }
        }

        Ok(self
            .topo_order
            .iter()
            .filter(|id| needed.contains(id.as_str()))
            .cloned()
            .collect())
    }

    /// Whether every direct dependency of `column_id` is in `completed`
    pub fn is_ready(
        &self,
        column_id: &str,
        completed: &HashSet<String>,
    ) -> Result<bool, EngineError> {
        Ok(self.missing_dependencies(column_id, completed)?.is_empty())
    }

    /// Direct dependencies of `column_id` absent from `completed`
    pub fn missing_dependencies(
        &self,
        column_id: &str,
        completed: &HashSet<String>,
    ) -> Result<Vec<String>, EngineError> {
        let def = self.get(column_id)?;
        Ok(def
            .dependencies
            .iter()
            .filter(|dep| !completed.contains(*dep))
            .cloned()
            .collect())
    }
}

fn validate_definition(def: &ColumnDefinition) -> Result<(), EngineError> {
    let invalid = |reason: &str| EngineError::InvalidColumnDefinition {
        column: def.id.clone(),
        reason: reason.to_string(),
    };

    if def.id.trim().is_empty() {
        return Err(invalid("column id must not be empty"));
    }
    if !(1..=10).contains(&def.quality_threshold) {
        return Err(invalid("quality_threshold must be between 1 and 10"));
    }
    if def.batch_size == 0 {
        return Err(invalid("batch_size must be at least 1"));
    }
    Ok(())
}

/// Kahn's algorithm over the dependency graph
fn topological_order(
    columns: &HashMap<String, ColumnDefinition>,
) -> Result<Vec<String>, EngineError> {
    let mut in_degree: HashMap<&str, usize> = HashMap::new();
    let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();

    for def in columns.values() {
        in_degree.entry(def.id.as_str()).or_insert(0);
        for dep in &def.dependencies {
            *in_degree.entry(def.id.as_str()).or_insert(0) += 1;
            dependents
                .entry(dep.as_str())
                .or_default()
                .push(def.id.as_str());
        }
    }

    let mut ready: BTreeSet<(u32, &str)> = in_degree
        .iter()
        .filter(|(_, degree)| **degree == 0)
        .map(|(id, _)| (columns[*id].priority, *id))
        .collect();

    let mut order = Vec::with_capacity(columns.len());
    while let Some(next) = ready.pop_first() {
        let (_, id) = next;
        order.push(id.to_string());
        if let Some(children) = dependents.get(id) {
            for child in children {
                if let Some(degree) = in_degree.get_mut(child) {
                    *degree = degree.saturating_sub(1);
                    if *degree == 0 {
                        ready.insert((columns[*child].priority, *child));
                    }
                }
            }
        }
    }

    if order.len() < columns.len() {
        let mut cycle: Vec<String> = in_degree
            .into_iter()
            .filter(|(_, degree)| *degree > 0)
            .map(|(id, _)| id.to_string())
            .collect();
        cycle.sort();
        return Err(EngineError::CyclicDependency(cycle));
    }

    Ok(order)
}
