// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use async_trait::async_trait;

use crate::{Completion, CompletionRequest};

/// A model backend the engine can request completions from.
///
/// Implementations enforce the per-request timeout configured on their HTTP
/// client; cancellation is the caller dropping the returned future. The
/// engine never depends on a specific provider.
#[async_trait]
pub trait ModelProvider: Send + Sync {
    /// Human-readable provider name for status display.
    fn name(&self) -> &str;

    /// Model identifier as reported to users (and to the pricing catalog).
    fn model_name(&self) -> &str;

    /// Send a completion request and return the full response.
    async fn complete(&self, req: CompletionRequest) -> anyhow::Result<Completion>;
}
