// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::{Completion, CompletionRequest, Role, StopReason, Usage};

/// Deterministic mock provider for tests. Echoes the last user message
/// back as the response.
#[derive(Default)]
pub struct MockProvider;

#[async_trait]
impl crate::ModelProvider for MockProvider {
    fn name(&self) -> &str {
        "mock"
    }
    fn model_name(&self) -> &str {
        "mock-model"
    }

    async fn complete(&self, req: CompletionRequest) -> anyhow::Result<Completion> {
        let reply = req
            .messages
            .iter()
            .rev()
            .find(|m| matches!(m.role, Role::User))
            .map(|m| m.as_text())
            .unwrap_or("[no input]");
        Ok(Completion {
            text: format!("MOCK: {reply}"),
            usage: Usage { input_tokens: 10, output_tokens: 10 },
            stop_reason: StopReason::EndTurn,
        })
    }
}

/// A pre-scripted provider. Each call to `complete` pops the next response
/// from the front of the queue, so tests can specify exact reply sequences
/// without network access. Every request is recorded for inspection.
pub struct ScriptedProvider {
    replies: Mutex<Vec<Completion>>,
    /// Reply used when the script runs dry; `None` yields a marker text.
    fallback: Option<String>,
    /// All `CompletionRequest`s seen by this provider, in call order.
    pub requests: Arc<Mutex<Vec<CompletionRequest>>>,
}

impl ScriptedProvider {
    pub fn new(replies: Vec<Completion>) -> Self {
        Self {
            replies: Mutex::new(replies),
            fallback: None,
            requests: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Provider that returns the given texts in order (with token usage 5/7
    /// so metrics assertions have something to count).
    pub fn texts(texts: &[&str]) -> Self {
        Self::new(
            texts
                .iter()
                .map(|t| Completion {
                    text: (*t).to_string(),
                    usage: Usage { input_tokens: 5, output_tokens: 7 },
                    stop_reason: StopReason::EndTurn,
                })
                .collect(),
        )
    }

    /// Provider that always returns `text`, regardless of how often it is
    /// called.
    pub fn always(text: &str) -> Self {
        let mut p = Self::new(vec![]);
        p.fallback = Some(text.to_string());
        p
    }

    /// Number of completions served so far.
    pub fn calls(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

impl ScriptedProvider {
    fn pop(&self) -> Option<Completion> {
        let mut replies = self.replies.lock().unwrap();
        if replies.is_empty() {
            None
        } else {
            Some(replies.remove(0))
        }
    }
}

#[async_trait]
impl crate::ModelProvider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted-mock"
    }
    fn model_name(&self) -> &str {
        "scripted-mock-model"
    }

    async fn complete(&self, req: CompletionRequest) -> anyhow::Result<Completion> {
        self.requests.lock().unwrap().push(req);
        match self.pop() {
            Some(c) => Ok(c),
            None => match &self.fallback {
                Some(text) => Ok(Completion {
                    text: text.clone(),
                    usage: Usage { input_tokens: 5, output_tokens: 7 },
                    stop_reason: StopReason::EndTurn,
                }),
                None => Ok(Completion::text("[no more scripts]")),
            },
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
