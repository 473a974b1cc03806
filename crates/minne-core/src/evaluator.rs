// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Continuous recall evaluation: scoring one unchecked point against the
//! conversation.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::warn;

use minne_model::{CompletionRequest, Message, ModelProvider};
use minne_store::{RecallPoint, SessionMessage};

use crate::parse;
use crate::prompts::{self, EvaluationContext};

/// Verdict for one point after one user message.
#[derive(Debug, Clone, Default)]
pub struct PointEvaluation {
    pub success: bool,
    pub confidence: f64,
    pub reasoning: Option<String>,
    pub key_demonstrated_concepts: Vec<String>,
    pub missed_concepts: Vec<String>,
    /// Free-form rating hint; validated against the known ratings before use.
    pub suggested_rating: Option<String>,
}

impl PointEvaluation {
    /// The safe default: not recalled, zero confidence, raw reply preserved
    /// so callers can tell a parse failure from a confident negative.
    pub fn unrecognized(raw_reply: impl Into<String>) -> Self {
        Self {
            reasoning: Some(raw_reply.into()),
            ..Default::default()
        }
    }

    pub fn from_json(v: &Value) -> Self {
        Self {
            success: parse::boolean(v, "success"),
            confidence: parse::confidence(v, "confidence"),
            reasoning: parse::optional_string(v, "reasoning"),
            key_demonstrated_concepts: parse::string_array(v, "key_demonstrated_concepts"),
            missed_concepts: parse::string_array(v, "missed_concepts"),
            suggested_rating: parse::optional_string(v, "suggested_rating"),
        }
    }
}

#[async_trait]
pub trait Evaluator: Send + Sync {
    /// Score whether the conversation demonstrates recall of `point`.
    ///
    /// An `Err` means the model call itself failed; the engine skips the
    /// point for this turn. Parse problems never surface as errors; they
    /// come back as the safe-default evaluation.
    async fn evaluate(
        &self,
        point: &RecallPoint,
        history: &[SessionMessage],
        ctx: &EvaluationContext,
    ) -> anyhow::Result<PointEvaluation>;
}

/// Evaluator backed by a model call per point.
pub struct LlmEvaluator {
    model: Arc<dyn ModelProvider>,
}

impl LlmEvaluator {
    pub fn new(model: Arc<dyn ModelProvider>) -> Self {
        Self { model }
    }
}

#[async_trait]
impl Evaluator for LlmEvaluator {
    async fn evaluate(
        &self,
        point: &RecallPoint,
        history: &[SessionMessage],
        ctx: &EvaluationContext,
    ) -> anyhow::Result<PointEvaluation> {
        let request = CompletionRequest::new(vec![Message::user(
            prompts::build_evaluation_request(point, history, ctx),
        )])
        .with_system(prompts::build_evaluator_prompt())
        // Grading wants determinism, not creativity.
        .with_sampling(0.0, 512);

        let completion = self.model.complete(request).await?;
        match parse::extract_json(&completion.text) {
            Some(v) => Ok(PointEvaluation::from_json(&v)),
            None => {
                warn!(point_id = %point.id, "evaluator reply was not JSON; treating as not recalled");
                Ok(PointEvaluation::unrecognized(completion.text))
            }
        }
    }
}

/// Feedback sentence for a near-miss, naming only a truncated prefix of the
/// fact so the tutor can nudge without revealing it.
pub fn near_miss_sentence(point: &RecallPoint) -> String {
    format!(
        "The learner came close to the fact beginning \"{}\" but has not \
         demonstrated it yet; nudge them toward it without revealing it.",
        truncate_chars(&point.content, 40)
    )
}

/// Truncate on a character boundary, appending an ellipsis when shortened.
fn truncate_chars(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        return s.to_string();
    }
    let prefix: String = s.chars().take(max_chars).collect();
    format!("{}…", prefix.trim_end())
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use minne_fsrs::Scheduler;
    use minne_model::{Completion, ScriptedProvider};

    const NOW: i64 = 1_700_000_000_000;

    fn point(content: &str) -> RecallPoint {
        RecallPoint::new("set", content, "", Scheduler::default().initial_state(NOW), NOW)
    }

    #[tokio::test]
    async fn parses_structured_verdict() {
        let provider = ScriptedProvider::new(vec![Completion::text(
            r#"{"success": true, "confidence": 0.92, "reasoning": "stated it outright",
                "key_demonstrated_concepts": ["meaning"], "suggested_rating": "easy"}"#,
        )]);
        let evaluator = LlmEvaluator::new(Arc::new(provider));
        let eval = evaluator
            .evaluate(&point("tack means thanks"), &[], &EvaluationContext::default())
            .await
            .unwrap();
        assert!(eval.success);
        assert_eq!(eval.confidence, 0.92);
        assert_eq!(eval.suggested_rating.as_deref(), Some("easy"));
        assert_eq!(eval.key_demonstrated_concepts, vec!["meaning".to_string()]);
    }

    #[tokio::test]
    async fn unparseable_reply_defaults_to_not_recalled() {
        let provider = ScriptedProvider::new(vec![Completion::text("I think they did well!")]);
        let evaluator = LlmEvaluator::new(Arc::new(provider));
        let eval = evaluator
            .evaluate(&point("fact"), &[], &EvaluationContext::default())
            .await
            .unwrap();
        assert!(!eval.success);
        assert_eq!(eval.confidence, 0.0);
        // The raw reply survives so a parse failure is distinguishable from
        // a confident negative.
        assert_eq!(eval.reasoning.as_deref(), Some("I think they did well!"));
    }

    #[tokio::test]
    async fn evaluation_request_reaches_the_model() {
        let provider = Arc::new(ScriptedProvider::new(vec![Completion::text("{}")]));
        let requests = provider.requests.clone();
        let evaluator = LlmEvaluator::new(provider);
        evaluator
            .evaluate(&point("unique-fact-xyz"), &[], &EvaluationContext::default())
            .await
            .unwrap();
        let reqs = requests.lock().unwrap();
        assert!(reqs[0].messages[0].content.contains("unique-fact-xyz"));
        assert_eq!(reqs[0].temperature, Some(0.0));
    }

    #[test]
    fn near_miss_truncates_long_facts() {
        let p = point(
            "the Treaty of Roskilde in 1658 transferred Scania from Denmark to Sweden",
        );
        let sentence = near_miss_sentence(&p);
        assert!(sentence.contains("the Treaty of Roskilde in 1658"));
        assert!(!sentence.contains("Denmark to Sweden"));
        assert!(sentence.contains('…'));
    }

    #[test]
    fn near_miss_keeps_short_facts_whole() {
        let sentence = near_miss_sentence(&point("tack means thanks"));
        assert!(sentence.contains("tack means thanks"));
        assert!(!sentence.contains('…'));
    }
}
