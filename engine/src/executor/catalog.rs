//! Term catalog seam
//!
//! The executor reads the term corpus and writes accepted content through
//! `TermCatalog`. The SQLite `ContentRepository` is the production store;
//! `MemoryCatalog` keeps everything in process.

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::RwLock;

/// One term of the corpus
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Term {
    pub id: String,
    pub name: String,
}

impl Term {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
        }
    }
}

/// Finalized content for one term x column
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AcceptedContent {
    pub term_id: String,
    pub column_id: String,
    pub content: String,
    pub quality_score: u8,
    pub low_quality: bool,
    pub operation_id: Option<String>,
}

#[async_trait]
pub trait TermCatalog: Send + Sync {
    /// Every term in catalog order
    async fn list_terms(&self) -> Result<Vec<Term>>;

    /// Whether any operation has stored content for this term and column
    async fn has_accepted_content(&self, term_id: &str, column_id: &str) -> Result<bool>;

    /// Whether the column holds content for at least one term
    async fn column_has_content(&self, column_id: &str) -> Result<bool>;

    /// Store (or replace) finalized content
    async fn save_content(&self, content: &AcceptedContent) -> Result<()>;
}

/// In-process catalog
#[derive(Default)]
pub struct MemoryCatalog {
    terms: RwLock<Vec<Term>>,
    content: RwLock<HashMap<(String, String), AcceptedContent>>,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_terms(terms: Vec<Term>) -> Self {
        Self {
            terms: RwLock::new(terms),
            content: RwLock::new(HashMap::new()),
        }
    }

    pub async fn add_term(&self, term: Term) {
        self.terms.write().await.push(term);
    }

    pub async fn get_content(&self, term_id: &str, column_id: &str) -> Option<AcceptedContent> {
        self.content
            .read()
            .await
            .get(&(term_id.to_string(), column_id.to_string()))
            .cloned()
    }

    pub async fn content_count(&self, column_id: &str) -> usize {
        self.content
            .read()
            .await
            .keys()
            .filter(|(_, column)| column == column_id)
            .count()
    }
}

#[async_trait]
impl TermCatalog for MemoryCatalog {
    async fn list_terms(&self) -> Result<Vec<Term>> {
        Ok(self.terms.read().await.clone())
    }

    async fn has_accepted_content(&self, term_id: &str, column_id: &str) -> Result<bool> {
        Ok(self
            .content
            .read()
            .await
            .contains_key(&(term_id.to_string(), column_id.to_string())))
    }

    async fn column_has_content(&self, column_id: &str) -> Result<bool> {
        Ok(self.content_count(column_id).await > 0)
    }

    async fn save_content(&self, content: &AcceptedContent) -> Result<()> {
        self.content.write().await.insert(
            (content.term_id.clone(), content.column_id.clone()),
            content.clone(),
        );
        Ok(())
    }
}
