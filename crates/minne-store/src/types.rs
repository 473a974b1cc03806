// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Persisted row types. All timestamps are integer milliseconds since the
//! Unix epoch.

use minne_fsrs::{FsrsState, Rating};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}

// ─── Recall sets ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SetStatus {
    Active,
    Paused,
    Archived,
}

/// A named collection of recall points sharing tutoring guidelines.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecallSet {
    pub id: String,
    pub name: String,
    pub description: String,
    pub status: SetStatus,
    /// Supplementary guidelines appended verbatim to the tutor prompt.
    #[serde(default)]
    pub discussion_prompt: Option<String>,
    pub created_at_ms: i64,
    pub updated_at_ms: i64,
}

impl RecallSet {
    pub fn new(name: impl Into<String>, description: impl Into<String>, now_ms: i64) -> Self {
        Self {
            id: new_id(),
            name: name.into(),
            description: description.into(),
            status: SetStatus::Active,
            discussion_prompt: None,
            created_at_ms: now_ms,
            updated_at_ms: now_ms,
        }
    }
}

// ─── Recall points ───────────────────────────────────────────────────────────

/// One graded attempt in a point's append-only recall history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecallAttempt {
    pub timestamp_ms: i64,
    pub success: bool,
    pub latency_ms: u64,
}

/// One fact under spaced repetition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecallPoint {
    pub id: String,
    pub set_id: String,
    /// The fact itself.
    pub content: String,
    /// Background the tutor can draw on without revealing the fact.
    #[serde(default)]
    pub context: String,
    pub fsrs: FsrsState,
    #[serde(default)]
    pub history: Vec<RecallAttempt>,
    pub created_at_ms: i64,
}

impl RecallPoint {
    pub fn new(
        set_id: impl Into<String>,
        content: impl Into<String>,
        context: impl Into<String>,
        fsrs: FsrsState,
        now_ms: i64,
    ) -> Self {
        Self {
            id: new_id(),
            set_id: set_id.into(),
            content: content.into(),
            context: context.into(),
            fsrs,
            history: Vec::new(),
            created_at_ms: now_ms,
        }
    }
}

// ─── Sessions ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    InProgress,
    Paused,
    Completed,
    Abandoned,
}

/// One study encounter over a subset of a set's due points.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub set_id: String,
    pub status: SessionStatus,
    /// Ordered probe sequence chosen at session start.
    pub target_point_ids: Vec<String>,
    /// Persisted checklist progress; always a subset of the targets.
    #[serde(default)]
    pub recalled_point_ids: Vec<String>,
    pub started_at_ms: i64,
    #[serde(default)]
    pub resumed_at_ms: Option<i64>,
    #[serde(default)]
    pub ended_at_ms: Option<i64>,
}

impl Session {
    pub fn new(set_id: impl Into<String>, target_point_ids: Vec<String>, now_ms: i64) -> Self {
        Self {
            id: new_id(),
            set_id: set_id.into(),
            status: SessionStatus::InProgress,
            target_point_ids,
            recalled_point_ids: Vec::new(),
            started_at_ms: now_ms,
            resumed_at_ms: None,
            ended_at_ms: None,
        }
    }
}

// ─── Session messages ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
    System,
}

/// One persisted turn of the main dialog. Immutable after insert.
/// Rabbit-hole sub-dialog turns are NOT stored here; they live in the
/// event's `conversation` array.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionMessage {
    pub id: String,
    pub session_id: String,
    pub role: MessageRole,
    pub content: String,
    pub timestamp_ms: i64,
    #[serde(default)]
    pub token_count: Option<u32>,
}

impl SessionMessage {
    pub fn new(
        session_id: impl Into<String>,
        role: MessageRole,
        content: impl Into<String>,
        timestamp_ms: i64,
    ) -> Self {
        Self {
            id: new_id(),
            session_id: session_id.into(),
            role,
            content: content.into(),
            timestamp_ms,
            token_count: None,
        }
    }
}

// ─── Rabbit-hole events ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RabbitholeStatus {
    Active,
    Returned,
    Abandoned,
}

/// One turn of a rabbit-hole sub-dialog.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub role: MessageRole,
    pub content: String,
}

/// A detected conversational tangent with its own agent conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RabbitholeEvent {
    pub id: String,
    pub session_id: String,
    pub topic: String,
    /// Index into the persisted main dialog where the tangent began.
    pub trigger_message_index: usize,
    #[serde(default)]
    pub return_message_index: Option<usize>,
    /// Tangent depth class: 1 (1–2 exchanges), 2 (3–5), 3 (6+).
    pub depth: u8,
    #[serde(default)]
    pub related_point_ids: Vec<String>,
    pub user_initiated: bool,
    pub status: RabbitholeStatus,
    #[serde(default)]
    pub conversation: Vec<ConversationTurn>,
    pub created_at_ms: i64,
}

// ─── Recall outcomes ─────────────────────────────────────────────────────────

/// Per-attempt audit row written once per recalled (or failed) point.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecallOutcome {
    pub id: String,
    pub session_id: String,
    pub recall_point_id: String,
    pub success: bool,
    pub confidence: f64,
    #[serde(default)]
    pub rating: Option<Rating>,
    #[serde(default)]
    pub reasoning: Option<String>,
    /// (first, last) indices into the persisted main dialog covering the
    /// attempt.
    pub message_index_range: (usize, usize),
    pub time_spent_ms: u64,
    pub created_at_ms: i64,
}

// ─── Session metrics ─────────────────────────────────────────────────────────

/// Aggregates computed when a session is finalized. One row per completed
/// session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionMetrics {
    pub id: String,
    pub session_id: String,
    pub started_at_ms: i64,
    pub ended_at_ms: i64,
    pub total_duration_ms: i64,
    /// Sum of inter-message gaps below the pause threshold.
    pub active_duration_ms: i64,
    pub avg_user_response_ms: i64,
    pub avg_assistant_response_ms: i64,
    pub user_messages: u32,
    pub assistant_messages: u32,
    pub total_messages: u32,
    pub recall_points_attempted: u32,
    pub recall_points_successful: u32,
    pub recall_points_failed: u32,
    pub recall_rate: f64,
    pub avg_recall_confidence: f64,
    pub rabbithole_count: u32,
    pub rabbithole_total_time_ms: i64,
    pub rabbithole_avg_depth: f64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub estimated_cost_usd: f64,
    /// Composite 0–100 score from response-time regularity, message-length
    /// variance, and recall rate.
    pub engagement_score: f64,
    /// Resumed sessions start metrics collection fresh, so their token and
    /// timing totals undercount the full session history.
    pub resumed: bool,
    pub created_at_ms: i64,
}
