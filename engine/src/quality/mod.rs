//! Quality Gate
//!
//! Runs the generate -> evaluate -> (improve -> evaluate)* loop for one term
//! and column. The loop is a small state machine over `Phase`:
//!
//! ```text
//! generation -> evaluation -> finalization          (score >= threshold)
//!                   ^   |
//!                   |   v
//!               improvement                         (score < threshold, rounds left)
//! ```
//!
//! When improvement rounds run out the best-scoring draft is finalized and
//! tagged low quality. Provider errors end the run immediately and are
//! handed back to the executor, which owns retries.

use crate::provider::{ContentProvider, Evaluation, GenerationRequest, ProviderError};
use async_trait::async_trait;
use sdk::types::{Phase, QualityBand};
use std::sync::Arc;

/// Clamp a raw evaluation score to 1..=10
pub fn clamp_score(raw: i64) -> u8 {
    raw.clamp(1, 10) as u8
}

/// Thresholds for one run of the gate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GatePolicy {
    pub quality_threshold: u8,
    /// Maximum improvement rounds
    pub retry_limit: u32,
}

/// Receives phase changes as a term moves through the gate
#[async_trait]
pub trait PhaseObserver: Send + Sync {
    async fn on_phase(&self, term_id: &str, phase: Phase);
}

/// Observer that ignores phase changes
pub struct NoopObserver;

#[async_trait]
impl PhaseObserver for NoopObserver {
    async fn on_phase(&self, _term_id: &str, _phase: Phase) {}
}

/// Ephemeral per-term working state
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TermProcessingRecord {
    pub term_id: String,
    /// Evaluations performed
    pub evaluations: u32,
    pub draft: Option<String>,
    pub latest_score: Option<u8>,
    pub phase_history: Vec<Phase>,
}

impl TermProcessingRecord {
    fn new(term_id: &str) -> Self {
        Self {
            term_id: term_id.to_string(),
            ..Self::default()
        }
    }
}

/// A finalized term
#[derive(Debug, Clone, PartialEq)]
pub struct GateOutcome {
    /// Best-scoring draft
    pub content: String,
    /// Maximum clamped score observed
    pub final_score: u8,
    pub improvement_rounds: u32,
    /// Finalized below the threshold
    pub low_quality: bool,
    /// Spend across every call of this run
    pub cost: f64,
    pub record: TermProcessingRecord,
}

impl GateOutcome {
    pub fn band(&self) -> QualityBand {
        QualityBand::from_score(self.final_score)
    }
}

/// A provider error that ended the run
#[derive(Debug)]
pub struct GateFailure {
    pub error: ProviderError,
    pub phase: Phase,
    /// Spend of the calls that succeeded before the error
    pub cost_spent: f64,
}

pub struct QualityGate {
    provider: Arc<dyn ContentProvider>,
}

impl QualityGate {
    pub fn new(provider: Arc<dyn ContentProvider>) -> Self {
        Self { provider }
    }

    pub fn provider(&self) -> &Arc<dyn ContentProvider> {
        &self.provider
    }

    /// Drive one term to finalization
    pub async fn run(
        &self,
        request: &GenerationRequest,
        policy: GatePolicy,
        observer: &dyn PhaseObserver,
    ) -> Result<GateOutcome, GateFailure> {
        let term_id = request.term_id.as_str();
        let mut record = TermProcessingRecord::new(term_id);
        let mut cost = 0.0;
        let mut rounds = 0u32;
        let mut best: Option<(u8, String)> = None;
        let mut feedback = Evaluation::default();
        let mut phase = Phase::Generation;

        loop {
            record.phase_history.push(phase);
            observer.on_phase(term_id, phase).await;

            match phase {
                Phase::Generation => {
                    let generation = self
                        .provider
                        .generate(request)
                        .await
                        .map_err(|error| failure(error, phase, cost))?;
                    cost += generation.cost;
                    record.draft = Some(generation.content);
                    phase = Phase::Evaluation;
                }

                Phase::Evaluation => {
                    let draft = record.draft.clone().unwrap_or_default();
                    let evaluation = self
                        .provider
                        .evaluate(&draft, term_id)
                        .await
                        .map_err(|error| failure(error, phase, cost))?;
                    cost += evaluation.cost;
                    record.evaluations += 1;

                    let score = clamp_score(evaluation.score);
                    record.latest_score = Some(score);
                    if best.as_ref().map_or(true, |(top, _)| score > *top) {
                        best = Some((score, draft));
                    }
                    tracing::debug!(term_id, score, round = rounds, "Draft evaluated");

                    feedback = evaluation;
                    phase = if score >= policy.quality_threshold || rounds >= policy.retry_limit {
                        Phase::Finalization
                    } else {
                        Phase::Improvement
                    };
                }

                Phase::Improvement => {
                    rounds += 1;
                    let draft = record.draft.clone().unwrap_or_default();
                    let improvement = self
                        .provider
                        .improve(&draft, &feedback)
                        .await
                        .map_err(|error| failure(error, phase, cost))?;
                    cost += improvement.cost;
                    record.draft = Some(improvement.content);
                    phase = Phase::Evaluation;
                }

                Phase::Finalization => {
                    let Some((final_score, content)) = best.take() else {
                        return Err(failure(
                            ProviderError::InvalidResponse("no evaluated draft".to_string()),
                            phase,
                            cost,
                        ));
                    };

                    let low_quality = final_score < policy.quality_threshold;
                    if low_quality {
                        tracing::info!(
                            term_id,
                            final_score,
                            threshold = policy.quality_threshold,
                            "Finalized below quality threshold"
                        );
                    }

                    return Ok(GateOutcome {
                        content,
                        final_score,
                        improvement_rounds: rounds,
                        low_quality,
                        cost,
                        record,
                    });
                }
            }
        }
    }
}

fn failure(error: ProviderError, phase: Phase, cost_spent: f64) -> GateFailure {
    GateFailure {
        error,
        phase,
        cost_spent,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{Generation, Improvement};
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Returns scripted scores; improve appends a marker to the draft
    struct ScriptedProvider {
        scores: Mutex<VecDeque<i64>>,
        fail_improve: bool,
    }

    impl ScriptedProvider {
        fn new(scores: &[i64]) -> Self {
            Self {
                scores: Mutex::new(scores.iter().copied().collect()),
                fail_improve: false,
            }
        }
    }

    #[async_trait]
    impl ContentProvider for ScriptedProvider {
        fn name(&self) -> &str {
            "scripted"
        }

        fn estimated_cost(&self, _tokens: u32) -> f64 {
            0.1
        }

        async fn generate(&self, _request: &GenerationRequest) -> crate::provider::Result<Generation> {
            Ok(Generation {
                content: "v0".to_string(),
                prompt_tokens: 10,
                completion_tokens: 10,
                cost: 0.10,
            })
        }

        async fn evaluate(&self, _content: &str, _term_id: &str) -> crate::provider::Result<Evaluation> {
            let score = self.scores.lock().unwrap().pop_front().unwrap_or(1);
            Ok(Evaluation {
                score,
                cost: 0.01,
                ..Evaluation::default()
            })
        }

        async fn improve(
            &self,
            content: &str,
            _feedback: &Evaluation,
        ) -> crate::provider::Result<Improvement> {
            if self.fail_improve {
                return Err(ProviderError::Timeout);
            }
            let round: u32 = content.trim_start_matches('v').parse().unwrap_or(0);
            Ok(Improvement {
                content: format!("v{}", round + 1),
                cost: 0.05,
            })
        }
    }

    fn request() -> GenerationRequest {
        GenerationRequest {
            term_id: "t-1".to_string(),
            term_name: "Attention".to_string(),
            column_id: "examples".to_string(),
            column_name: "Examples".to_string(),
            capability: "default".to_string(),
            temperature: 0.7,
            max_tokens: 400,
            use_fallback: false,
        }
    }

    async fn run(scores: &[i64], threshold: u8, retry_limit: u32) -> GateOutcome {
        let gate = QualityGate::new(Arc::new(ScriptedProvider::new(scores)));
        gate.run(
            &request(),
            GatePolicy {
                quality_threshold: threshold,
                retry_limit,
            },
            &NoopObserver,
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_improves_until_threshold_cleared() {
        let outcome = run(&[5, 6, 8], 7, 2).await;

        assert_eq!(outcome.final_score, 8);
        assert_eq!(outcome.improvement_rounds, 2);
        assert_eq!(outcome.content, "v2");
        assert!(!outcome.low_quality);
        assert_eq!(outcome.band(), QualityBand::Good);
        assert_eq!(
            outcome.record.phase_history,
            vec![
                Phase::Generation,
                Phase::Evaluation,
                Phase::Improvement,
                Phase::Evaluation,
                Phase::Improvement,
                Phase::Evaluation,
                Phase::Finalization,
            ]
        );
        // 0.10 + 3 * 0.01 + 2 * 0.05
        assert!((outcome.cost - 0.23).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_first_draft_accepted() {
        let outcome = run(&[9], 7, 2).await;
        assert_eq!(outcome.final_score, 9);
        assert_eq!(outcome.improvement_rounds, 0);
        assert_eq!(outcome.band(), QualityBand::Excellent);
    }

    #[tokio::test]
    async fn test_best_version_kept_when_rounds_exhausted() {
        let outcome = run(&[6, 4, 5], 7, 2).await;

        assert_eq!(outcome.final_score, 6);
        assert_eq!(outcome.content, "v0");
        assert_eq!(outcome.improvement_rounds, 2);
        assert!(outcome.low_quality);
        assert_eq!(outcome.record.evaluations, 3);
    }

    #[tokio::test]
    async fn test_scores_are_clamped() {
        let outcome = run(&[42], 7, 0).await;
        assert_eq!(outcome.final_score, 10);

        let outcome = run(&[-3], 7, 0).await;
        assert_eq!(outcome.final_score, 1);
        assert!(outcome.low_quality);
        assert_eq!(outcome.band(), QualityBand::Poor);
    }

    #[tokio::test]
    async fn test_provider_error_surfaces_with_phase_and_cost() {
        let provider = ScriptedProvider {
            scores: Mutex::new(VecDeque::from(vec![3])),
            fail_improve: true,
        };
        let gate = QualityGate::new(Arc::new(provider));
        let failure = gate
            .run(
                &request(),
                GatePolicy {
                    quality_threshold: 7,
                    retry_limit: 2,
                },
                &NoopObserver,
            )
            .await
            .unwrap_err();

        assert_eq!(failure.phase, Phase::Improvement);
        assert!(matches!(failure.error, ProviderError::Timeout));
        assert!((failure.cost_spent - 0.11).abs() < 1e-9);
    }

    #[test]
    fn test_clamp_score() {
        assert_eq!(clamp_score(0), 1);
        assert_eq!(clamp_score(7), 7);
        assert_eq!(clamp_score(11), 10);
    }
}
