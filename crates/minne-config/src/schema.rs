// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// The tutor model: drives the study conversation.
    #[serde(default)]
    pub model: ModelConfig,
    /// Model used for per-point recall evaluation. Falls back to `model`.
    #[serde(default)]
    pub evaluator_model: Option<ModelConfig>,
    /// Model used for tangent detection. Falls back to `model`.
    #[serde(default)]
    pub detector_model: Option<ModelConfig>,
    /// Model used by the dedicated rabbit-hole agent. Falls back to `model`.
    #[serde(default)]
    pub rabbithole_model: Option<ModelConfig>,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

impl Config {
    /// Effective model config for the evaluator (tutor model when unset).
    pub fn evaluator_model(&self) -> &ModelConfig {
        self.evaluator_model.as_ref().unwrap_or(&self.model)
    }

    pub fn detector_model(&self) -> &ModelConfig {
        self.detector_model.as_ref().unwrap_or(&self.model)
    }

    pub fn rabbithole_model(&self) -> &ModelConfig {
        self.rabbithole_model.as_ref().unwrap_or(&self.model)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Provider identifier: "anthropic" | "openai" | "mock".
    pub provider: String,
    /// Model name forwarded to the provider API.
    pub name: String,
    /// Environment variable that holds the API key (read at runtime).
    pub api_key_env: Option<String>,
    /// Explicit API key; prefer api_key_env in config files to avoid secrets
    /// in version-controlled files.
    pub api_key: Option<String>,
    /// Base URL override. Useful for local proxies or OpenAI-compatible servers.
    pub base_url: Option<String>,
    /// Maximum tokens to request in a single completion.
    pub max_tokens: Option<u32>,
    /// Sampling temperature (0.0–2.0).
    pub temperature: Option<f32>,
    /// Per-request timeout in seconds. Cancellation is the caller dropping
    /// the in-flight completion future.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            provider: "anthropic".into(),
            name: "claude-sonnet-4-5".into(),
            api_key_env: None,
            api_key: None,
            base_url: None,
            max_tokens: None,
            temperature: None,
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

fn default_request_timeout_secs() -> u64 {
    60
}

/// Tunables for the session engine. Defaults match the documented behavior
/// of the engine; override per deployment in config files.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Sampling temperature for tutor replies.
    #[serde(default = "default_tutor_temperature")]
    pub tutor_temperature: f32,
    /// Token cap for tutor replies (they are meant to be 1–3 sentences).
    #[serde(default = "default_tutor_max_tokens")]
    pub tutor_max_tokens: u32,
    /// Evaluator confidence at or above which a successful answer counts as
    /// a recall.
    #[serde(default = "default_recall_confidence")]
    pub recall_confidence_threshold: f64,
    /// Lower bound of the near-miss band; evaluations between this and the
    /// recall threshold feed the tutor a nudge without revealing the point.
    #[serde(default = "default_near_miss")]
    pub near_miss_threshold: f64,
    /// Detector confidence required before a tangent is recorded.
    #[serde(default = "default_detect_confidence")]
    pub detect_confidence_threshold: f64,
    /// Number of user messages for which detection is suppressed after the
    /// user declines a rabbit-hole prompt.
    #[serde(default = "default_decline_cooldown")]
    pub decline_cooldown_messages: u8,
    /// Sliding window of recent messages shown to the tangent detector.
    #[serde(default = "default_detector_window")]
    pub detector_window: usize,
    /// Sliding window of recent messages shown to the return detector.
    #[serde(default = "default_return_window")]
    pub return_window: usize,
    /// Inter-message gaps longer than this don't count as active study time.
    #[serde(default = "default_pause_threshold")]
    pub pause_threshold_minutes: u64,
    /// FSRS retention target.
    #[serde(default = "default_desired_retention")]
    pub desired_retention: f64,
    /// FSRS interval ceiling.
    #[serde(default = "default_maximum_interval")]
    pub maximum_interval_days: f64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            tutor_temperature: default_tutor_temperature(),
            tutor_max_tokens: default_tutor_max_tokens(),
            recall_confidence_threshold: default_recall_confidence(),
            near_miss_threshold: default_near_miss(),
            detect_confidence_threshold: default_detect_confidence(),
            decline_cooldown_messages: default_decline_cooldown(),
            detector_window: default_detector_window(),
            return_window: default_return_window(),
            pause_threshold_minutes: default_pause_threshold(),
            desired_retention: default_desired_retention(),
            maximum_interval_days: default_maximum_interval(),
        }
    }
}

fn default_tutor_temperature() -> f32 {
    0.7
}
fn default_tutor_max_tokens() -> u32 {
    512
}
fn default_recall_confidence() -> f64 {
    0.6
}
fn default_near_miss() -> f64 {
    0.3
}
fn default_detect_confidence() -> f64 {
    0.6
}
fn default_decline_cooldown() -> u8 {
    3
}
fn default_detector_window() -> usize {
    8
}
fn default_return_window() -> usize {
    6
}
fn default_pause_threshold() -> u64 {
    5
}
fn default_desired_retention() -> f64 {
    0.9
}
fn default_maximum_interval() -> f64 {
    365.0
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Data directory for the JSON store. Defaults to the platform data dir
    /// (e.g. `~/.local/share/minne`).
    pub data_dir: Option<PathBuf>,
}

impl StorageConfig {
    pub fn resolved_data_dir(&self) -> PathBuf {
        self.data_dir.clone().unwrap_or_else(|| {
            dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("minne")
        })
    }
}
