// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
pub mod catalog;
mod anthropic;
mod mock;
mod openai_compat;
mod provider;
mod types;

pub use anthropic::AnthropicProvider;
pub use catalog::ModelCatalogEntry;
pub use mock::{MockProvider, ScriptedProvider};
pub use openai_compat::OpenAiProvider;
pub use provider::ModelProvider;
pub use types::*;

use std::sync::Arc;
use std::time::Duration;

use anyhow::bail;
use minne_config::ModelConfig;

/// Construct a [`ModelProvider`] from configuration.
///
/// Selects the driver implementation based on `cfg.provider`. The API key is
/// resolved from `cfg.api_key`, then `cfg.api_key_env`, then the driver's
/// conventional environment variable.
pub fn from_config(cfg: &ModelConfig) -> anyhow::Result<Arc<dyn ModelProvider>> {
    let timeout = Duration::from_secs(cfg.request_timeout_secs);
    match cfg.provider.as_str() {
        "anthropic" => Ok(Arc::new(AnthropicProvider::new(
            cfg.name.clone(),
            resolve_api_key(cfg, Some("ANTHROPIC_API_KEY")),
            cfg.base_url.clone(),
            cfg.max_tokens,
            cfg.temperature,
            timeout,
        ))),
        "openai" => Ok(Arc::new(OpenAiProvider::new(
            cfg.name.clone(),
            resolve_api_key(cfg, Some("OPENAI_API_KEY")),
            cfg.base_url.clone(),
            cfg.max_tokens,
            cfg.temperature,
            timeout,
        ))),
        "mock" => Ok(Arc::new(MockProvider)),
        other => bail!("unknown model provider: {other:?} (expected anthropic, openai, or mock)"),
    }
}

/// Resolve the API key: explicit config value, then the configured env var,
/// then the driver's conventional env var.
fn resolve_api_key(cfg: &ModelConfig, default_env: Option<&str>) -> Option<String> {
    if let Some(key) = &cfg.api_key {
        return Some(key.clone());
    }
    if let Some(env) = &cfg.api_key_env {
        if let Ok(key) = std::env::var(env) {
            return Some(key);
        }
    }
    default_env.and_then(|env| std::env::var(env).ok())
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_config_builds_known_providers() {
        for provider in ["anthropic", "openai", "mock"] {
            let cfg = ModelConfig {
                provider: provider.into(),
                name: "m".into(),
                api_key: Some("k".into()),
                ..Default::default()
            };
            let p = from_config(&cfg).unwrap();
            assert_eq!(p.name(), if provider == "mock" { "mock" } else { provider });
        }
    }

    #[test]
    fn from_config_rejects_unknown_provider() {
        let cfg = ModelConfig {
            provider: "telepathy".into(),
            ..Default::default()
        };
        assert!(from_config(&cfg).is_err());
    }

    #[test]
    fn explicit_api_key_wins_over_env() {
        let cfg = ModelConfig {
            provider: "anthropic".into(),
            api_key: Some("explicit".into()),
            api_key_env: Some("PATH".into()),
            ..Default::default()
        };
        assert_eq!(resolve_api_key(&cfg, None).as_deref(), Some("explicit"));
    }
}
