// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Model catalog: static metadata for known models, including pricing used
//! by the session metrics cost estimation.

use serde::{Deserialize, Serialize};

/// Metadata for a single model.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModelCatalogEntry {
    /// Provider-scoped model identifier (e.g. "gpt-4o", "claude-sonnet-4-5")
    pub id: String,
    /// Provider identifier: "openai" | "anthropic" | "mock"
    pub provider: String,
    /// Total context window in tokens (input + output)
    pub context_window: u32,
    /// Maximum output tokens per completion
    pub max_output_tokens: u32,
    /// Price in USD per million input tokens
    #[serde(default)]
    pub input_cost_per_mtok: f64,
    /// Price in USD per million output tokens
    #[serde(default)]
    pub output_cost_per_mtok: f64,
}

impl ModelCatalogEntry {
    /// Estimated cost in USD for the given token counts.
    pub fn estimate_cost(&self, input_tokens: u64, output_tokens: u64) -> f64 {
        (input_tokens as f64 * self.input_cost_per_mtok
            + output_tokens as f64 * self.output_cost_per_mtok)
            / 1_000_000.0
    }
}

#[derive(Debug, Deserialize)]
struct CatalogFile {
    models: Vec<ModelCatalogEntry>,
}

/// Return all entries from the bundled static catalog.
pub fn static_catalog() -> Vec<ModelCatalogEntry> {
    let yaml = include_str!("../models.yaml");
    let catalog: CatalogFile =
        serde_yaml::from_str(yaml).expect("bundled models.yaml must be valid");
    catalog.models
}

/// Look up a single model by id, across providers.
/// Returns `None` if not found in the static catalog.
pub fn lookup(model_id: &str) -> Option<ModelCatalogEntry> {
    static_catalog().into_iter().find(|e| e.id == model_id)
}

/// Estimated cost in USD for a session's token totals on `model_id`.
/// Unknown models cost 0 (local/mock deployments).
pub fn estimate_cost(model_id: &str, input_tokens: u64, output_tokens: u64) -> f64 {
    lookup(model_id)
        .map(|e| e.estimate_cost(input_tokens, output_tokens))
        .unwrap_or(0.0)
}

// ── Unit tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn static_catalog_is_non_empty() {
        assert!(!static_catalog().is_empty());
    }

    #[test]
    fn catalog_models_have_positive_windows() {
        for entry in static_catalog() {
            assert!(entry.context_window > 0, "{} window", entry.id);
            assert!(entry.max_output_tokens > 0, "{} output cap", entry.id);
        }
    }

    #[test]
    fn cost_estimate_scales_with_tokens() {
        let entry = ModelCatalogEntry {
            id: "m".into(),
            provider: "mock".into(),
            context_window: 1000,
            max_output_tokens: 100,
            input_cost_per_mtok: 3.0,
            output_cost_per_mtok: 15.0,
        };
        let cost = entry.estimate_cost(1_000_000, 1_000_000);
        assert!((cost - 18.0).abs() < 1e-9);
    }

    #[test]
    fn unknown_model_costs_nothing() {
        assert_eq!(estimate_cost("no-such-model", 1_000_000, 1_000_000), 0.0);
    }

    #[test]
    fn claude_sonnet_is_in_catalog() {
        let entry = lookup("claude-sonnet-4-5").expect("claude-sonnet-4-5 must be in catalog");
        assert_eq!(entry.provider, "anthropic");
        assert!(entry.context_window >= 200_000);
        assert!(entry.input_cost_per_mtok > 0.0);
    }
}
