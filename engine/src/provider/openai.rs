//! OpenAI-compatible chat completions provider

use super::{
    parse_evaluation, ContentProvider, Evaluation, Generation, GenerationRequest, Improvement,
    ProviderError,
};
use crate::config::ProviderConfig;
use crate::secrets::SecretCache;
use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

const SYSTEM_PROMPT: &str = "You are an AI/ML educational content assistant.";

const EVALUATOR_PROMPT: &str = "You are a strict reviewer of AI/ML educational content. \
Reply with a single JSON object: {\"score\": <integer 1-10>, \"strengths\": [..], \
\"weaknesses\": [..], \"suggestions\": [..]}";

struct ChatReply {
    content: String,
    prompt_tokens: u32,
    completion_tokens: u32,
}

pub struct OpenAIProvider {
    config: ProviderConfig,
    secret_cache: Arc<SecretCache>,
    client: reqwest::Client,
}

impl OpenAIProvider {
    pub fn new(config: ProviderConfig, secret_cache: Arc<SecretCache>) -> super::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| ProviderError::Network(e.to_string()))?;

        Ok(Self {
            config,
            secret_cache,
            client,
        })
    }

    /// Model for a capability hint
    fn model_for(&self, capability: &str, use_fallback: bool) -> &str {
        if use_fallback {
            if let Some(fallback) = self.config.fallback_model.as_deref() {
                if !fallback.is_empty() {
                    return fallback;
                }
            }
        }
        self.config
            .capability_models
            .get(capability)
            .map(String::as_str)
            .unwrap_or(&self.config.default_model)
    }

    fn cost_of(&self, prompt_tokens: u32, completion_tokens: u32) -> f64 {
        (prompt_tokens as f64 / 1000.0) * self.config.prompt_cost_per_1k
            + (completion_tokens as f64 / 1000.0) * self.config.completion_cost_per_1k
    }

    fn check_length(&self, content: &str) -> super::Result<()> {
        let chars = content.chars().count();
        if chars < self.config.min_content_chars {
            return Err(ProviderError::InvalidResponse(format!(
                "content too short ({} chars)",
                chars
            )));
        }
        Ok(())
    }

    async fn chat(
        &self,
        model: &str,
        system: &str,
        user: &str,
        temperature: f32,
        max_tokens: u32,
    ) -> super::Result<ChatReply> {
        let api_key = self
            .secret_cache
            .get_secret(&self.config.api_key_env)
            .map_err(|e| ProviderError::Authentication(e.to_string()))?;

        let url = format!("{}/chat/completions", self.config.base_url.trim_end_matches('/'));

        let payload = json!({
            "model": model,
            "messages": [
                { "role": "system", "content": system },
                { "role": "user", "content": user }
            ],
            "temperature": temperature,
            "max_tokens": max_tokens,
        });

        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", api_key.unsecure()))
            .header("Content-Type", "application/json")
            .json(&payload)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ProviderError::Timeout
                } else {
                    ProviderError::Network(e.to_string())
                }
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();

            return Err(match status.as_u16() {
                401 | 403 => ProviderError::Authentication(text),
                429 => ProviderError::RateLimited,
                _ => ProviderError::InvalidResponse(format!("HTTP {}: {}", status, text)),
            });
        }

        let data: serde_json::Value = response
            .json()
            .await
            .map_err(|e| ProviderError::Parse(e.to_string()))?;

        let content = data
            .get("choices")
            .and_then(|c| c.as_array())
            .and_then(|c| c.first())
            .and_then(|choice| choice.get("message"))
            .and_then(|message| message.get("content"))
            .and_then(|content| content.as_str())
            .ok_or_else(|| ProviderError::Parse("No message content in response".to_string()))?
            .trim()
            .to_string();

        let usage = data.get("usage");
        let tokens = |key: &str| {
            usage
                .and_then(|u| u.get(key))
                .and_then(|v| v.as_u64())
                .unwrap_or(0) as u32
        };

        Ok(ChatReply {
            content,
            prompt_tokens: tokens("prompt_tokens"),
            completion_tokens: tokens("completion_tokens"),
        })
    }
}

fn generation_prompt(request: &GenerationRequest) -> String {
    format!(
        "For the term \"{}\", please write only the content for this section:\n\n\"{}\"\n\n\
         Do not include any extra headings or formatting, just the prose, \
         concise enough to fit in one spreadsheet cell.",
        request.term_name, request.column_name
    )
}

fn evaluation_prompt(content: &str, term_id: &str) -> String {
    format!(
        "Evaluate this content written for the glossary term '{}':\n\n{}",
        term_id, content
    )
}

fn improvement_prompt(content: &str, feedback: &Evaluation) -> String {
    format!(
        "Rewrite the content below so it scores higher. Keep it concise prose without headings.\n\n\
         Weaknesses: {}\nSuggestions: {}\n\nContent:\n{}",
        feedback.weaknesses.join("; "),
        feedback.suggestions.join("; "),
        content
    )
}

#[async_trait]
impl ContentProvider for OpenAIProvider {
    fn name(&self) -> &str {
        "openai"
    }

    fn estimated_cost(&self, tokens: u32) -> f64 {
        (tokens as f64 / 1000.0) * (self.config.prompt_cost_per_1k + self.config.completion_cost_per_1k)
    }

    async fn check_health(&self) -> bool {
        self.secret_cache
            .get_secret(&self.config.api_key_env)
            .is_ok()
    }

    async fn generate(&self, request: &GenerationRequest) -> super::Result<Generation> {
        let model = self.model_for(&request.capability, request.use_fallback);
        tracing::debug!(
            term_id = %request.term_id,
            column_id = %request.column_id,
            model,
            "Generating content"
        );

        let reply = self
            .chat(
                model,
                SYSTEM_PROMPT,
                &generation_prompt(request),
                request.temperature,
                request.max_tokens,
            )
            .await?;

        self.check_length(&reply.content)?;

        Ok(Generation {
            cost: self.cost_of(reply.prompt_tokens, reply.completion_tokens),
            content: reply.content,
            prompt_tokens: reply.prompt_tokens,
            completion_tokens: reply.completion_tokens,
        })
    }

    async fn evaluate(&self, content: &str, term_id: &str) -> super::Result<Evaluation> {
        let reply = self
            .chat(
                &self.config.default_model,
                EVALUATOR_PROMPT,
                &evaluation_prompt(content, term_id),
                0.0,
                300,
            )
            .await?;

        let mut evaluation = parse_evaluation(&reply.content)?;
        evaluation.cost = self.cost_of(reply.prompt_tokens, reply.completion_tokens);
        Ok(evaluation)
    }

    async fn improve(&self, content: &str, feedback: &Evaluation) -> super::Result<Improvement> {
        let reply = self
            .chat(
                &self.config.default_model,
                SYSTEM_PROMPT,
                &improvement_prompt(content, feedback),
                self.config.temperature,
                self.config.max_tokens,
            )
            .await?;

        self.check_length(&reply.content)?;

        Ok(Improvement {
            cost: self.cost_of(reply.prompt_tokens, reply.completion_tokens),
            content: reply.content,
        })
    }
}
