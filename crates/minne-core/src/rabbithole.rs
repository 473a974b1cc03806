// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Tangent detection and the dedicated rabbit-hole sub-dialog agent.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::warn;

use minne_model::{Completion, CompletionRequest, Message, ModelProvider, Role};
use minne_store::{ConversationTurn, MessageRole, RecallPoint, SessionMessage};

use crate::parse;
use crate::prompts;

/// Detector verdict for one user message.
#[derive(Debug, Clone)]
pub struct DetectionResult {
    pub is_rabbithole: bool,
    pub topic: Option<String>,
    pub depth: u8,
    pub related_to_current_point: bool,
    pub related_recall_point_ids: Vec<String>,
    pub confidence: f64,
    pub reasoning: Option<String>,
}

impl DetectionResult {
    /// Safe default: no tangent. Used on parse failure, with the raw reply
    /// kept as reasoning.
    pub fn none(raw_reply: impl Into<String>) -> Self {
        Self {
            is_rabbithole: false,
            topic: None,
            depth: 1,
            related_to_current_point: false,
            related_recall_point_ids: Vec::new(),
            confidence: 0.0,
            reasoning: Some(raw_reply.into()),
        }
    }

    pub fn from_json(v: &Value) -> Self {
        Self {
            is_rabbithole: parse::boolean(v, "is_rabbithole"),
            topic: parse::optional_string(v, "topic"),
            depth: normalize_depth(v["depth"].as_i64()),
            related_to_current_point: parse::boolean(v, "related_to_current_point"),
            related_recall_point_ids: parse::string_array(v, "related_recall_point_ids"),
            confidence: parse::confidence(v, "confidence"),
            reasoning: parse::optional_string(v, "reasoning"),
        }
    }
}

/// Return-detector verdict.
#[derive(Debug, Clone)]
pub struct ReturnResult {
    pub has_returned: bool,
    pub confidence: f64,
    pub reasoning: Option<String>,
}

impl ReturnResult {
    /// Safe default: has not returned.
    pub fn not_yet(raw_reply: impl Into<String>) -> Self {
        Self {
            has_returned: false,
            confidence: 0.0,
            reasoning: Some(raw_reply.into()),
        }
    }

    pub fn from_json(v: &Value) -> Self {
        Self {
            has_returned: parse::boolean(v, "has_returned"),
            confidence: parse::confidence(v, "confidence"),
            reasoning: parse::optional_string(v, "reasoning"),
        }
    }
}

/// Clamp a model-supplied depth into the {1, 2, 3} classification.
pub fn normalize_depth(raw: Option<i64>) -> u8 {
    raw.unwrap_or(1).clamp(1, 3) as u8
}

/// Depth class from the number of consecutive exchanges on the tangent:
/// 1 (1–2), 2 (3–5), 3 (6+).
pub fn depth_for_exchanges(exchanges: usize) -> u8 {
    match exchanges {
        0..=2 => 1,
        3..=5 => 2,
        _ => 3,
    }
}

/// Topic key used for session-level deduplication.
pub fn normalize_topic(topic: &str) -> String {
    topic.trim().to_lowercase()
}

#[async_trait]
pub trait TangentDetector: Send + Sync {
    /// Inspect the recent window for a new tangent.
    async fn detect(
        &self,
        window: &[SessionMessage],
        probe: Option<&RecallPoint>,
        target_points: &[RecallPoint],
        known_topics: &[String],
    ) -> anyhow::Result<DetectionResult>;

    /// Decide whether the conversation has returned from `topic`.
    async fn detect_return(
        &self,
        topic: &str,
        window: &[SessionMessage],
        probe: Option<&RecallPoint>,
    ) -> anyhow::Result<ReturnResult>;
}

/// Detector backed by model calls.
pub struct LlmTangentDetector {
    model: Arc<dyn ModelProvider>,
}

impl LlmTangentDetector {
    pub fn new(model: Arc<dyn ModelProvider>) -> Self {
        Self { model }
    }
}

#[async_trait]
impl TangentDetector for LlmTangentDetector {
    async fn detect(
        &self,
        window: &[SessionMessage],
        probe: Option<&RecallPoint>,
        target_points: &[RecallPoint],
        known_topics: &[String],
    ) -> anyhow::Result<DetectionResult> {
        let request = CompletionRequest::new(vec![Message::user(
            prompts::build_detection_request(window, probe, target_points),
        )])
        .with_system(prompts::build_detector_prompt(known_topics))
        .with_sampling(0.0, 512);

        let completion = self.model.complete(request).await?;
        Ok(match parse::extract_json(&completion.text) {
            Some(v) => DetectionResult::from_json(&v),
            None => {
                warn!("detector reply was not JSON; treating as no tangent");
                DetectionResult::none(completion.text)
            }
        })
    }

    async fn detect_return(
        &self,
        topic: &str,
        window: &[SessionMessage],
        probe: Option<&RecallPoint>,
    ) -> anyhow::Result<ReturnResult> {
        let request = CompletionRequest::new(vec![Message::user(
            prompts::build_return_request(window, probe),
        )])
        .with_system(prompts::build_return_prompt(topic))
        .with_sampling(0.0, 256);

        let completion = self.model.complete(request).await?;
        Ok(match parse::extract_json(&completion.text) {
            Some(v) => ReturnResult::from_json(&v),
            None => {
                warn!(topic, "return-detector reply was not JSON; treating as not returned");
                ReturnResult::not_yet(completion.text)
            }
        })
    }
}

/// The dedicated sub-dialog agent for one rabbit hole.
///
/// Owns its own system prompt and conversation history; its turns are never
/// written to the main dialog. The full conversation is persisted into the
/// event row when the rabbit hole is exited or abandoned.
pub struct RabbitholeAgent {
    model: Arc<dyn ModelProvider>,
    topic: String,
    system: String,
    history: Vec<Message>,
}

impl RabbitholeAgent {
    pub fn new(
        model: Arc<dyn ModelProvider>,
        topic: impl Into<String>,
        set_name: &str,
        set_description: &str,
    ) -> Self {
        let topic = topic.into();
        let system = prompts::build_rabbithole_prompt(&topic, set_name, set_description);
        Self { model, topic, system, history: Vec::new() }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Produce the opening message. The synthetic kick-off instruction is
    /// not recorded in the agent's history; only the reply is.
    pub async fn opening(&mut self) -> anyhow::Result<Completion> {
        let request = CompletionRequest::new(vec![Message::user(
            "The learner has just agreed to explore the tangent. Open the discussion.",
        )])
        .with_system(self.system.clone());
        let completion = self.model.complete(request).await?;
        self.history.push(Message::assistant(&completion.text));
        Ok(completion)
    }

    /// One sub-dialog turn: record the user text, ask the model, record the
    /// reply.
    pub async fn reply(&mut self, user_text: &str) -> anyhow::Result<Completion> {
        self.history.push(Message::user(user_text));
        let request = CompletionRequest::new(self.history.clone()).with_system(self.system.clone());
        match self.model.complete(request).await {
            Ok(completion) => {
                self.history.push(Message::assistant(&completion.text));
                Ok(completion)
            }
            Err(e) => {
                // Keep the history consistent with "no reply happened".
                self.history.pop();
                Err(e)
            }
        }
    }

    /// Number of user/assistant exchanges so far.
    pub fn exchanges(&self) -> usize {
        self.history.iter().filter(|m| m.role == Role::User).count()
    }

    /// The conversation in its persisted shape.
    pub fn conversation(&self) -> Vec<ConversationTurn> {
        self.history
            .iter()
            .map(|m| ConversationTurn {
                role: match m.role {
                    Role::User => MessageRole::User,
                    Role::Assistant => MessageRole::Assistant,
                    Role::System => MessageRole::System,
                },
                content: m.content.clone(),
            })
            .collect()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use minne_model::ScriptedProvider;
    use serde_json::json;

    #[test]
    fn depth_classification_bands() {
        assert_eq!(depth_for_exchanges(0), 1);
        assert_eq!(depth_for_exchanges(2), 1);
        assert_eq!(depth_for_exchanges(3), 2);
        assert_eq!(depth_for_exchanges(5), 2);
        assert_eq!(depth_for_exchanges(6), 3);
        assert_eq!(depth_for_exchanges(40), 3);
    }

    #[test]
    fn depth_normalization_clamps() {
        assert_eq!(normalize_depth(Some(0)), 1);
        assert_eq!(normalize_depth(Some(2)), 2);
        assert_eq!(normalize_depth(Some(17)), 3);
        assert_eq!(normalize_depth(None), 1);
    }

    #[test]
    fn topic_normalization_folds_case_and_space() {
        assert_eq!(normalize_topic("  Etymology "), "etymology");
    }

    #[test]
    fn detection_from_json_filters_loose_types() {
        let v = json!({
            "is_rabbithole": "yes",           // non-boolean → false
            "topic": "etymology",
            "depth": 9,                        // clamped
            "confidence": 78,                  // percentage
            "related_recall_point_ids": ["p1", 7],
        });
        let d = DetectionResult::from_json(&v);
        assert!(!d.is_rabbithole);
        assert_eq!(d.depth, 3);
        assert_eq!(d.confidence, 0.78);
        assert_eq!(d.related_recall_point_ids, vec!["p1".to_string()]);
    }

    #[tokio::test]
    async fn agent_opening_keeps_only_the_reply_in_history() {
        let provider = Arc::new(ScriptedProvider::texts(&["Let's dig in."]));
        let mut agent = RabbitholeAgent::new(provider, "etymology", "Swedish", "vocab");
        let opening = agent.opening().await.unwrap();
        assert_eq!(opening.text, "Let's dig in.");
        assert_eq!(agent.history.len(), 1);
        assert_eq!(agent.history[0].role, Role::Assistant);
        assert_eq!(agent.exchanges(), 0);
    }

    #[tokio::test]
    async fn agent_reply_accumulates_history() {
        let provider = Arc::new(ScriptedProvider::texts(&["opening", "first", "second"]));
        let mut agent = RabbitholeAgent::new(provider, "t", "s", "d");
        agent.opening().await.unwrap();
        agent.reply("tell me more").await.unwrap();
        agent.reply("and then?").await.unwrap();
        assert_eq!(agent.exchanges(), 2);
        let conversation = agent.conversation();
        assert_eq!(conversation.len(), 5);
        assert_eq!(conversation[1].role, MessageRole::User);
        assert_eq!(conversation[1].content, "tell me more");
    }

    #[tokio::test]
    async fn detector_safe_defaults_on_prose_reply() {
        let provider = Arc::new(ScriptedProvider::texts(&["hmm, hard to say"]));
        let detector = LlmTangentDetector::new(provider);
        let result = detector.detect(&[], None, &[], &[]).await.unwrap();
        assert!(!result.is_rabbithole);
        assert_eq!(result.reasoning.as_deref(), Some("hmm, hard to say"));
        let ret = detector.detect_return("t", &[], None).await.unwrap();
        assert!(!ret.has_returned);
    }
}
