// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! In-memory store. Backs the engine's unit and integration tests and is
//! useful for ephemeral sessions that should leave no trace on disk.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

use minne_fsrs::FsrsState;

use crate::repo::*;
use crate::types::*;

#[derive(Default)]
struct Inner {
    sets: HashMap<String, RecallSet>,
    points: HashMap<String, RecallPoint>,
    sessions: HashMap<String, Session>,
    messages: Vec<SessionMessage>,
    outcomes: Vec<RecallOutcome>,
    rabbitholes: HashMap<String, RabbitholeEvent>,
    metrics: Vec<SessionMetrics>,
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RecallSetRepo for MemoryStore {
    async fn create_set(&self, set: RecallSet) -> StoreResult<()> {
        self.inner.lock().unwrap().sets.insert(set.id.clone(), set);
        Ok(())
    }

    async fn find_set(&self, id: &str) -> StoreResult<Option<RecallSet>> {
        Ok(self.inner.lock().unwrap().sets.get(id).cloned())
    }

    async fn find_set_by_name(&self, name: &str) -> StoreResult<Option<RecallSet>> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .sets
            .values()
            .find(|s| s.name == name)
            .cloned())
    }

    async fn list_sets(&self) -> StoreResult<Vec<RecallSet>> {
        let mut sets: Vec<_> = self.inner.lock().unwrap().sets.values().cloned().collect();
        sets.sort_by(|a, b| a.created_at_ms.cmp(&b.created_at_ms));
        Ok(sets)
    }

    async fn update_set(&self, set: RecallSet) -> StoreResult<()> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.sets.contains_key(&set.id) {
            return Err(StoreError::NotFound { kind: "recall set", id: set.id });
        }
        inner.sets.insert(set.id.clone(), set);
        Ok(())
    }
}

#[async_trait]
impl RecallPointRepo for MemoryStore {
    async fn create_point(&self, point: RecallPoint) -> StoreResult<()> {
        self.inner
            .lock()
            .unwrap()
            .points
            .insert(point.id.clone(), point);
        Ok(())
    }

    async fn find_point(&self, id: &str) -> StoreResult<Option<RecallPoint>> {
        Ok(self.inner.lock().unwrap().points.get(id).cloned())
    }

    async fn find_points_by_set(&self, set_id: &str) -> StoreResult<Vec<RecallPoint>> {
        let mut points: Vec<_> = self
            .inner
            .lock()
            .unwrap()
            .points
            .values()
            .filter(|p| p.set_id == set_id)
            .cloned()
            .collect();
        points.sort_by(|a, b| a.created_at_ms.cmp(&b.created_at_ms));
        Ok(points)
    }

    async fn find_due_points(&self, set_id: &str, as_of_ms: i64) -> StoreResult<Vec<RecallPoint>> {
        let mut due: Vec<_> = self
            .inner
            .lock()
            .unwrap()
            .points
            .values()
            .filter(|p| p.set_id == set_id && p.fsrs.due_ms <= as_of_ms)
            .cloned()
            .collect();
        due.sort_by(|a, b| a.fsrs.due_ms.cmp(&b.fsrs.due_ms));
        Ok(due)
    }

    async fn update_fsrs_state(&self, point_id: &str, state: FsrsState) -> StoreResult<()> {
        let mut inner = self.inner.lock().unwrap();
        let point = inner
            .points
            .get_mut(point_id)
            .ok_or_else(|| StoreError::NotFound { kind: "recall point", id: point_id.into() })?;
        point.fsrs = state;
        Ok(())
    }

    async fn add_recall_attempt(&self, point_id: &str, attempt: RecallAttempt) -> StoreResult<()> {
        let mut inner = self.inner.lock().unwrap();
        let point = inner
            .points
            .get_mut(point_id)
            .ok_or_else(|| StoreError::NotFound { kind: "recall point", id: point_id.into() })?;
        point.history.push(attempt);
        Ok(())
    }
}

#[async_trait]
impl SessionRepo for MemoryStore {
    async fn create_session(&self, session: Session) -> StoreResult<()> {
        self.inner
            .lock()
            .unwrap()
            .sessions
            .insert(session.id.clone(), session);
        Ok(())
    }

    async fn find_session(&self, id: &str) -> StoreResult<Option<Session>> {
        Ok(self.inner.lock().unwrap().sessions.get(id).cloned())
    }

    async fn find_active_session(&self, set_id: &str) -> StoreResult<Option<Session>> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .sessions
            .values()
            .find(|s| {
                s.set_id == set_id
                    && matches!(s.status, SessionStatus::InProgress | SessionStatus::Paused)
            })
            .cloned())
    }

    async fn find_sessions_by_set(&self, set_id: &str) -> StoreResult<Vec<Session>> {
        let mut sessions: Vec<_> = self
            .inner
            .lock()
            .unwrap()
            .sessions
            .values()
            .filter(|s| s.set_id == set_id)
            .cloned()
            .collect();
        sessions.sort_by(|a, b| a.started_at_ms.cmp(&b.started_at_ms));
        Ok(sessions)
    }

    async fn list_sessions(&self) -> StoreResult<Vec<Session>> {
        let mut sessions: Vec<_> = self
            .inner
            .lock()
            .unwrap()
            .sessions
            .values()
            .cloned()
            .collect();
        sessions.sort_by(|a, b| a.started_at_ms.cmp(&b.started_at_ms));
        Ok(sessions)
    }

    async fn update_session(&self, session: Session) -> StoreResult<()> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.sessions.contains_key(&session.id) {
            return Err(StoreError::NotFound { kind: "session", id: session.id });
        }
        inner.sessions.insert(session.id.clone(), session);
        Ok(())
    }

    async fn update_recalled_point_ids(&self, id: &str, recalled: Vec<String>) -> StoreResult<()> {
        let mut inner = self.inner.lock().unwrap();
        let session = inner
            .sessions
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound { kind: "session", id: id.into() })?;
        session.recalled_point_ids = recalled;
        Ok(())
    }
}

#[async_trait]
impl SessionMessageRepo for MemoryStore {
    async fn create_message(&self, message: SessionMessage) -> StoreResult<()> {
        self.inner.lock().unwrap().messages.push(message);
        Ok(())
    }

    async fn find_messages(&self, session_id: &str) -> StoreResult<Vec<SessionMessage>> {
        let mut messages: Vec<_> = self
            .inner
            .lock()
            .unwrap()
            .messages
            .iter()
            .filter(|m| m.session_id == session_id)
            .cloned()
            .collect();
        messages.sort_by(|a, b| a.timestamp_ms.cmp(&b.timestamp_ms));
        Ok(messages)
    }
}

#[async_trait]
impl RecallOutcomeRepo for MemoryStore {
    async fn create_outcome(&self, outcome: RecallOutcome) -> StoreResult<()> {
        self.inner.lock().unwrap().outcomes.push(outcome);
        Ok(())
    }

    async fn find_outcomes(&self, session_id: &str) -> StoreResult<Vec<RecallOutcome>> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .outcomes
            .iter()
            .filter(|o| o.session_id == session_id)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl RabbitholeEventRepo for MemoryStore {
    async fn create_rabbithole(&self, event: RabbitholeEvent) -> StoreResult<()> {
        self.inner
            .lock()
            .unwrap()
            .rabbitholes
            .insert(event.id.clone(), event);
        Ok(())
    }

    async fn find_rabbithole(&self, id: &str) -> StoreResult<Option<RabbitholeEvent>> {
        Ok(self.inner.lock().unwrap().rabbitholes.get(id).cloned())
    }

    async fn find_rabbitholes(&self, session_id: &str) -> StoreResult<Vec<RabbitholeEvent>> {
        let mut events: Vec<_> = self
            .inner
            .lock()
            .unwrap()
            .rabbitholes
            .values()
            .filter(|e| e.session_id == session_id)
            .cloned()
            .collect();
        events.sort_by(|a, b| a.created_at_ms.cmp(&b.created_at_ms));
        Ok(events)
    }

    async fn update_rabbithole(&self, event: RabbitholeEvent) -> StoreResult<()> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.rabbitholes.contains_key(&event.id) {
            return Err(StoreError::NotFound { kind: "rabbithole event", id: event.id });
        }
        inner.rabbitholes.insert(event.id.clone(), event);
        Ok(())
    }

    async fn update_rabbithole_conversation(
        &self,
        id: &str,
        conversation: Vec<ConversationTurn>,
    ) -> StoreResult<()> {
        let mut inner = self.inner.lock().unwrap();
        let event = inner
            .rabbitholes
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound { kind: "rabbithole event", id: id.into() })?;
        event.conversation = conversation;
        Ok(())
    }
}

#[async_trait]
impl SessionMetricsRepo for MemoryStore {
    async fn create_metrics(&self, metrics: SessionMetrics) -> StoreResult<()> {
        self.inner.lock().unwrap().metrics.push(metrics);
        Ok(())
    }

    async fn find_metrics(&self, session_id: &str) -> StoreResult<Option<SessionMetrics>> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .metrics
            .iter()
            .find(|m| m.session_id == session_id)
            .cloned())
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
