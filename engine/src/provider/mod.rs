//! Generation capability abstraction
//!
//! The orchestrator never produces content itself. It drives an external
//! capability through the `ContentProvider` trait: `generate` a draft,
//! `evaluate` it to a 1-10 score with structured feedback, and `improve` it
//! from that feedback. Every call reports what it cost so the budget tracker
//! can commit real spend.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub mod openai;

/// Result type for provider operations
pub type Result<T> = std::result::Result<T, ProviderError>;

/// Errors that can occur while calling the generation capability
///
/// Every variant is a retryable term failure from the executor's point of view.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Request timed out")]
    Timeout,

    #[error("Rate limit exceeded")]
    RateLimited,

    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Parse error: {0}")]
    Parse(String),
}

/// One generation call for a term x column pair
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GenerationRequest {
    pub term_id: String,
    pub term_name: String,
    pub column_id: String,
    pub column_name: String,
    /// Capability hint from the column definition
    pub capability: String,
    pub temperature: f32,
    pub max_tokens: u32,
    /// Use the provider's fallback capability (final retry attempt)
    #[serde(default)]
    pub use_fallback: bool,
}

/// Generated draft plus token and cost metadata
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Generation {
    pub content: String,
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub cost: f64,
}

/// Structured quality feedback for a draft
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Evaluation {
    /// Raw score as reported by the capability; the quality gate clamps it
    pub score: i64,
    #[serde(default)]
    pub strengths: Vec<String>,
    #[serde(default)]
    pub weaknesses: Vec<String>,
    #[serde(default)]
    pub suggestions: Vec<String>,
    #[serde(default)]
    pub cost: f64,
}

/// Improved draft
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Improvement {
    pub content: String,
    pub cost: f64,
}

/// Generation capability that all providers must implement
#[async_trait]
pub trait ContentProvider: Send + Sync {
    /// Returns the name of the provider (e.g., "openai")
    fn name(&self) -> &str;

    /// Estimated cost in USD of producing `tokens` tokens of content
    fn estimated_cost(&self, tokens: u32) -> f64;

    /// Produce a first draft
    async fn generate(&self, request: &GenerationRequest) -> Result<Generation>;

    /// Score a draft on a 1-10 scale with structured feedback
    async fn evaluate(&self, content: &str, term_id: &str) -> Result<Evaluation>;

    /// Rewrite a draft using evaluation feedback
    async fn improve(&self, content: &str, feedback: &Evaluation) -> Result<Improvement>;

    /// Check that the provider has what it needs to make calls (e.g. credentials)
    async fn check_health(&self) -> bool {
        true
    }
}

/// Extract the first JSON object embedded in model output.
///
/// Handles raw JSON, fenced ```json blocks and JSON surrounded by prose.
pub fn extract_json_object(content: &str) -> Option<serde_json::Value> {
    let trimmed = content.trim();

    if let Ok(value) = serde_json::from_str::<serde_json::Value>(trimmed) {
        if value.is_object() {
            return Some(value);
        }
    }

    let start = trimmed.find('{')?;
    let end = trimmed.rfind('}')?;
    if end <= start {
        return None;
    }

    serde_json::from_str::<serde_json::Value>(&trimmed[start..=end])
        .ok()
        .filter(|v| v.is_object())
}

/// Parse an evaluation reply into `Evaluation` (cost left at zero)
pub fn parse_evaluation(content: &str) -> Result<Evaluation> {
    let value = extract_json_object(content)
        .ok_or_else(|| ProviderError::Parse("No JSON object in evaluation".to_string()))?;

    let score = match value.get("score") {
        Some(serde_json::Value::Number(n)) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f.round() as i64))
            .ok_or_else(|| ProviderError::Parse("Score is not a number".to_string()))?,
        Some(serde_json::Value::String(s)) => s
            .trim()
            .parse::<f64>()
            .map(|f| f.round() as i64)
            .map_err(|_| ProviderError::Parse(format!("Score '{}' is not a number", s)))?,
        _ => return Err(ProviderError::Parse("Evaluation has no score".to_string())),
    };

    let list = |key: &str| -> Vec<String> {
        value
            .get(key)
            .and_then(|v| v.as_array())
            .map(|items| {
                items
                    .iter()
                    .filter_map(|item| item.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default()
    };

    Ok(Evaluation {
        score,
        strengths: list("strengths"),
        weaknesses: list("weaknesses"),
        suggestions: list("suggestions"),
        cost: 0.0,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_raw_json_evaluation() {
        let evaluation = parse_evaluation(
            r#"{"score": 8, "strengths": ["clear"], "weaknesses": [], "suggestions": ["add an example"]}"#,
        )
        .unwrap();

        assert_eq!(evaluation.score, 8);
        assert_eq!(evaluation.strengths, vec!["clear"]);
        assert_eq!(evaluation.suggestions, vec!["add an example"]);
    }

    #[test]
    fn test_parse_fenced_evaluation() {
        let evaluation = parse_evaluation(
            "Here is my review:\n```json\n{\"score\": \"6.6\", \"weaknesses\": [\"vague\"]}\n```\nThanks",
        )
        .unwrap();

        assert_eq!(evaluation.score, 7);
        assert_eq!(evaluation.weaknesses, vec!["vague"]);
        assert!(evaluation.strengths.is_empty());
    }

    #[test]
    fn test_out_of_range_score_is_kept_raw() {
        let evaluation = parse_evaluation(r#"{"score": 14}"#).unwrap();
        assert_eq!(evaluation.score, 14);
    }

    #[test]
    fn test_missing_score_is_parse_error() {
        assert!(matches!(
            parse_evaluation(r#"{"strengths": []}"#),
            Err(ProviderError::Parse(_))
        ));
        assert!(matches!(
            parse_evaluation("no json at all"),
            Err(ProviderError::Parse(_))
        ));
    }
}
