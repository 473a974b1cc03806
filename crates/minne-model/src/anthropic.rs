// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::time::Duration;

use anyhow::{bail, Context};
use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use crate::{Completion, CompletionRequest, Message, Role, StopReason, Usage};

pub struct AnthropicProvider {
    model: String,
    api_key: Option<String>,
    base_url: String,
    max_tokens: u32,
    temperature: f32,
    client: reqwest::Client,
}

impl AnthropicProvider {
    pub fn new(
        model: String,
        api_key: Option<String>,
        base_url: Option<String>,
        max_tokens: Option<u32>,
        temperature: Option<f32>,
        request_timeout: Duration,
    ) -> Self {
        Self {
            model,
            api_key,
            base_url: base_url.unwrap_or_else(|| "https://api.anthropic.com".into()),
            max_tokens: max_tokens.unwrap_or(4096),
            temperature: temperature.unwrap_or(0.2),
            client: reqwest::Client::builder()
                .timeout(request_timeout)
                .build()
                .unwrap_or_default(),
        }
    }

    /// Fold system-role messages out of the history: Anthropic takes the
    /// system prompt as a top-level parameter, not as a message.
    fn split_system(req: &CompletionRequest) -> (String, Vec<&Message>) {
        let mut system = req.system.clone().unwrap_or_default();
        let mut messages = Vec::with_capacity(req.messages.len());
        for m in &req.messages {
            match m.role {
                Role::System => {
                    if !system.is_empty() {
                        system.push_str("\n\n");
                    }
                    system.push_str(&m.content);
                }
                _ => messages.push(m),
            }
        }
        (system, messages)
    }
}

#[async_trait]
impl crate::ModelProvider for AnthropicProvider {
    fn name(&self) -> &str {
        "anthropic"
    }
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn complete(&self, req: CompletionRequest) -> anyhow::Result<Completion> {
        let key = self
            .api_key
            .as_deref()
            .context("anthropic: no API key configured (set api_key_env or ANTHROPIC_API_KEY)")?;

        let (system, messages) = Self::split_system(&req);
        let messages: Vec<Value> = messages
            .iter()
            .map(|m| json!({ "role": m.role.as_str(), "content": m.content }))
            .collect();

        let mut body = json!({
            "model": self.model,
            "messages": messages,
            "max_tokens": req.max_tokens.unwrap_or(self.max_tokens),
            "temperature": req.temperature.unwrap_or(self.temperature),
        });
        if !system.is_empty() {
            body["system"] = json!(system);
        }

        debug!(model = %self.model, messages = messages.len(), "sending anthropic request");

        let resp = self
            .client
            .post(format!("{}/v1/messages", self.base_url))
            .header("x-api-key", key)
            .header("anthropic-version", "2023-06-01")
            .json(&body)
            .send()
            .await
            .context("anthropic request failed")?;

        let status = resp.status();
        let body: Value = resp.json().await.context("anthropic response was not JSON")?;
        if !status.is_success() {
            bail!("anthropic error {status}: {body}");
        }

        let text: String = body["content"]
            .as_array()
            .map(|blocks| {
                blocks
                    .iter()
                    .filter(|b| b["type"] == "text")
                    .filter_map(|b| b["text"].as_str())
                    .collect::<Vec<_>>()
                    .join("")
            })
            .unwrap_or_default();

        let usage = Usage {
            input_tokens: body["usage"]["input_tokens"].as_u64().unwrap_or(0) as u32,
            output_tokens: body["usage"]["output_tokens"].as_u64().unwrap_or(0) as u32,
        };
        let stop_reason = match body["stop_reason"].as_str() {
            Some("end_turn") | Some("stop_sequence") => StopReason::EndTurn,
            Some("max_tokens") => StopReason::MaxTokens,
            _ => StopReason::Other,
        };

        Ok(Completion { text, usage, stop_reason })
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn provider() -> AnthropicProvider {
        AnthropicProvider::new(
            "claude-sonnet-4-5".into(),
            Some("key".into()),
            None,
            None,
            None,
            Duration::from_secs(5),
        )
    }

    #[test]
    fn system_messages_fold_into_system_param() {
        let req = CompletionRequest::new(vec![
            Message::system("rules"),
            Message::user("hello"),
        ])
        .with_system("persona");
        let (system, messages) = AnthropicProvider::split_system(&req);
        assert_eq!(system, "persona\n\nrules");
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].role, Role::User);
    }

    #[test]
    fn default_base_url_points_at_anthropic() {
        assert_eq!(provider().base_url, "https://api.anthropic.com");
    }
}
