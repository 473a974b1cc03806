// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Narrow repository interfaces consumed by the session engine.
//!
//! The engine takes these as trait objects so tests can drive it against the
//! in-memory store while the CLI wires up the JSON store.

use async_trait::async_trait;

use minne_fsrs::FsrsState;

use crate::types::*;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("{0}")]
    Other(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

#[async_trait]
pub trait RecallSetRepo {
    async fn create_set(&self, set: RecallSet) -> StoreResult<()>;
    async fn find_set(&self, id: &str) -> StoreResult<Option<RecallSet>>;
    async fn find_set_by_name(&self, name: &str) -> StoreResult<Option<RecallSet>>;
    async fn list_sets(&self) -> StoreResult<Vec<RecallSet>>;
    async fn update_set(&self, set: RecallSet) -> StoreResult<()>;
}

#[async_trait]
pub trait RecallPointRepo {
    async fn create_point(&self, point: RecallPoint) -> StoreResult<()>;
    async fn find_point(&self, id: &str) -> StoreResult<Option<RecallPoint>>;
    async fn find_points_by_set(&self, set_id: &str) -> StoreResult<Vec<RecallPoint>>;
    /// Points of the set whose FSRS due date is at or before `as_of_ms`,
    /// ordered by due date (most overdue first).
    async fn find_due_points(&self, set_id: &str, as_of_ms: i64) -> StoreResult<Vec<RecallPoint>>;
    async fn update_fsrs_state(&self, point_id: &str, state: FsrsState) -> StoreResult<()>;
    async fn add_recall_attempt(&self, point_id: &str, attempt: RecallAttempt) -> StoreResult<()>;
}

#[async_trait]
pub trait SessionRepo {
    async fn create_session(&self, session: Session) -> StoreResult<()>;
    async fn find_session(&self, id: &str) -> StoreResult<Option<Session>>;
    /// The set's resumable session (in progress or paused), if any.
    async fn find_active_session(&self, set_id: &str) -> StoreResult<Option<Session>>;
    async fn find_sessions_by_set(&self, set_id: &str) -> StoreResult<Vec<Session>>;
    async fn list_sessions(&self) -> StoreResult<Vec<Session>>;
    async fn update_session(&self, session: Session) -> StoreResult<()>;
    /// Best-effort checklist-progress snapshot; callers treat failures as
    /// non-fatal.
    async fn update_recalled_point_ids(&self, id: &str, recalled: Vec<String>) -> StoreResult<()>;
}

#[async_trait]
pub trait SessionMessageRepo {
    async fn create_message(&self, message: SessionMessage) -> StoreResult<()>;
    /// Messages of the session ordered by timestamp (insert order on ties).
    async fn find_messages(&self, session_id: &str) -> StoreResult<Vec<SessionMessage>>;
}

#[async_trait]
pub trait RecallOutcomeRepo {
    async fn create_outcome(&self, outcome: RecallOutcome) -> StoreResult<()>;
    async fn find_outcomes(&self, session_id: &str) -> StoreResult<Vec<RecallOutcome>>;
}

#[async_trait]
pub trait RabbitholeEventRepo {
    async fn create_rabbithole(&self, event: RabbitholeEvent) -> StoreResult<()>;
    async fn find_rabbithole(&self, id: &str) -> StoreResult<Option<RabbitholeEvent>>;
    async fn find_rabbitholes(&self, session_id: &str) -> StoreResult<Vec<RabbitholeEvent>>;
    async fn update_rabbithole(&self, event: RabbitholeEvent) -> StoreResult<()>;
    async fn update_rabbithole_conversation(
        &self,
        id: &str,
        conversation: Vec<ConversationTurn>,
    ) -> StoreResult<()>;
}

#[async_trait]
pub trait SessionMetricsRepo {
    async fn create_metrics(&self, metrics: SessionMetrics) -> StoreResult<()>;
    async fn find_metrics(&self, session_id: &str) -> StoreResult<Option<SessionMetrics>>;
}

/// The full persistence surface the engine needs, as one object-safe bundle.
pub trait Store:
    RecallSetRepo
    + RecallPointRepo
    + SessionRepo
    + SessionMessageRepo
    + RecallOutcomeRepo
    + RabbitholeEventRepo
    + SessionMetricsRepo
    + Send
    + Sync
{
}

impl<T> Store for T where
    T: RecallSetRepo
        + RecallPointRepo
        + SessionRepo
        + SessionMessageRepo
        + RecallOutcomeRepo
        + RabbitholeEventRepo
        + SessionMetricsRepo
        + Send
        + Sync
{
}
