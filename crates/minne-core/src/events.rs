// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use minne_fsrs::Rating;
use serde::Serialize;

/// Events emitted by the engine during session processing.
/// Consumers (CLI, dashboards) subscribe to these to drive their output.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    /// A session started (fresh or resumed from pause).
    SessionStarted { session_id: String, resumed: bool },
    /// The tutor is about to probe for this point.
    PointStarted { point_id: String },
    /// The checklist flipped this point from pending to recalled.
    PointRecalled { point_id: String },
    /// A user message was persisted to the main dialog.
    UserMessage { content: String },
    /// An assistant message was persisted to the main dialog.
    AssistantMessage { content: String, is_opening: bool },
    /// The evaluator scored a point above the recall threshold.
    PointEvaluated {
        point_id: String,
        success: bool,
        confidence: f64,
    },
    /// The point's new schedule was committed.
    PointCompleted {
        point_id: String,
        rating: Rating,
        new_due_ms: i64,
    },
    /// Every target point is recalled; the session awaits `leave_session`.
    SessionCompleteOverlay {
        session_id: String,
        recalled_count: usize,
        total_points: usize,
    },
    /// The session was finalized and its metrics row written.
    SessionCompleted { session_id: String },
    SessionPaused { session_id: String },
    /// The detector recorded a tangent; the user may opt in.
    RabbitholeDetected { topic: String, event_id: String },
    /// The user opted in; emitted before the agent's opening message.
    RabbitholeEntered { topic: String },
    RabbitholeExited {
        topic: String,
        points_recalled_during: usize,
        completion_pending: bool,
    },
}

/// A [`SessionEvent`] stamped with its emission time.
#[derive(Debug, Clone, Serialize)]
pub struct EventEnvelope {
    #[serde(flatten)]
    pub event: SessionEvent,
    pub timestamp_ms: i64,
}

/// Single-slot event listener. Emission is synchronous within the engine's
/// turn; an unbounded channel means a slow consumer cannot stall the engine,
/// and a dropped receiver is ignored rather than treated as an error.
pub type EventListener = tokio::sync::mpsc::UnboundedSender<EventEnvelope>;

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_serialize_with_type_tag() {
        let ev = EventEnvelope {
            event: SessionEvent::PointRecalled { point_id: "p1".into() },
            timestamp_ms: 42,
        };
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["type"], "point_recalled");
        assert_eq!(json["point_id"], "p1");
        assert_eq!(json["timestamp_ms"], 42);
    }

    #[test]
    fn overlay_event_carries_progress_counts() {
        let ev = SessionEvent::SessionCompleteOverlay {
            session_id: "s".into(),
            recalled_count: 3,
            total_points: 3,
        };
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["type"], "session_complete_overlay");
        assert_eq!(json["recalled_count"], 3);
    }
}
