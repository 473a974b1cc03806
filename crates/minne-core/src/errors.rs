// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use minne_store::StoreError;

/// Errors surfaced by the session engine.
///
/// JSON-parse failures from model replies never appear here: they are
/// recovered locally with false-negative defaults (see the `parse` module),
/// so a malformed detector or evaluator response degrades to "nothing
/// detected" rather than an error.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// The operation requires a running session.
    #[error("no active session")]
    NoActiveSession,

    /// `start` was called with zero points due.
    #[error("no recall points due in set {set_id}")]
    NoDuePoints { set_id: String },

    /// `enter_rabbithole` while one is already active.
    #[error("a rabbit hole is already active")]
    NestedRabbithole,

    /// `exit_rabbithole` with no active rabbit hole.
    #[error("no rabbit hole is active")]
    NotInRabbithole,

    /// A model call failed or timed out during `op`. Recoverable per-point
    /// during evaluation; aborts the turn when the tutor or rabbit-hole
    /// agent reply fails.
    #[error("model call failed during {op}: {source}")]
    Llm {
        op: &'static str,
        #[source]
        source: anyhow::Error,
    },

    /// A repository write failed during `op` after invariants were partially
    /// established. The turn is aborted; the session stays resumable.
    #[error("persistence failed during {op}: {source}")]
    Persistence {
        op: &'static str,
        #[source]
        source: StoreError,
    },

    /// Programmer error; fatal.
    #[error("invariant violated: {0}")]
    Invariant(String),
}

impl EngineError {
    pub(crate) fn persistence(op: &'static str, source: StoreError) -> Self {
        Self::Persistence { op, source }
    }

    pub(crate) fn llm(op: &'static str, source: anyhow::Error) -> Self {
        Self::Llm { op, source }
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
