// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! File-backed store.
//!
//! Each collection is a JSON array on disk, rewritten atomically (temp file +
//! rename) on mutation; the append-heavy collections (messages, outcomes)
//! are JSONL logs. An exclusive advisory lock on `store.lock` guards the data
//! directory against concurrent processes for the lifetime of the store.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use fs4::fs_std::FileExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use minne_fsrs::FsrsState;

use crate::repo::*;
use crate::types::*;

#[derive(Default)]
struct Inner {
    sets: Vec<RecallSet>,
    points: Vec<RecallPoint>,
    sessions: Vec<Session>,
    messages: Vec<SessionMessage>,
    outcomes: Vec<RecallOutcome>,
    rabbitholes: Vec<RabbitholeEvent>,
    metrics: Vec<SessionMetrics>,
}

pub struct JsonStore {
    dir: PathBuf,
    inner: Mutex<Inner>,
    /// Held (exclusively locked) for the lifetime of the store.
    _lock: File,
}

impl JsonStore {
    pub fn open(dir: impl Into<PathBuf>) -> StoreResult<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;

        let lock = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(dir.join("store.lock"))?;
        lock.lock_exclusive()?;

        let inner = Inner {
            sets: load_array(&dir.join("sets.json"))?,
            points: load_array(&dir.join("points.json"))?,
            sessions: load_array(&dir.join("sessions.json"))?,
            messages: load_jsonl(&dir.join("messages.jsonl"))?,
            outcomes: load_jsonl(&dir.join("outcomes.jsonl"))?,
            rabbitholes: load_array(&dir.join("rabbitholes.json"))?,
            metrics: load_array(&dir.join("metrics.json"))?,
        };
        debug!(
            dir = %dir.display(),
            sets = inner.sets.len(),
            points = inner.points.len(),
            sessions = inner.sessions.len(),
            "opened json store"
        );
        Ok(Self { dir, inner: Mutex::new(inner), _lock: lock })
    }

    fn save<T: Serialize>(&self, file: &str, rows: &[T]) -> StoreResult<()> {
        save_array(&self.dir.join(file), rows)
    }

    fn append<T: Serialize>(&self, file: &str, row: &T) -> StoreResult<()> {
        let mut f = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.dir.join(file))?;
        serde_json::to_writer(&mut f, row)?;
        f.write_all(b"\n")?;
        Ok(())
    }
}

/// Read a JSON array file, treating a missing file as an empty collection.
fn load_array<T: DeserializeOwned>(path: &Path) -> StoreResult<Vec<T>> {
    match std::fs::read_to_string(path) {
        Ok(text) if text.trim().is_empty() => Ok(Vec::new()),
        Ok(text) => Ok(serde_json::from_str(&text)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(e.into()),
    }
}

/// Write a JSON array atomically: temp file in the same directory, then rename.
fn save_array<T: Serialize>(path: &Path, rows: &[T]) -> StoreResult<()> {
    let tmp = path.with_extension("json.tmp");
    let mut f = File::create(&tmp)?;
    serde_json::to_writer_pretty(&mut f, rows)?;
    f.sync_all()?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

fn load_jsonl<T: DeserializeOwned>(path: &Path) -> StoreResult<Vec<T>> {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    let mut rows = Vec::new();
    for line in BufReader::new(file).lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        rows.push(serde_json::from_str(&line)?);
    }
    Ok(rows)
}

#[async_trait]
impl RecallSetRepo for JsonStore {
    async fn create_set(&self, set: RecallSet) -> StoreResult<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.sets.push(set);
        self.save("sets.json", &inner.sets)
    }

    async fn find_set(&self, id: &str) -> StoreResult<Option<RecallSet>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.sets.iter().find(|s| s.id == id).cloned())
    }

    async fn find_set_by_name(&self, name: &str) -> StoreResult<Option<RecallSet>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.sets.iter().find(|s| s.name == name).cloned())
    }

    async fn list_sets(&self) -> StoreResult<Vec<RecallSet>> {
        Ok(self.inner.lock().unwrap().sets.clone())
    }

    async fn update_set(&self, set: RecallSet) -> StoreResult<()> {
        let mut inner = self.inner.lock().unwrap();
        let slot = inner
            .sets
            .iter_mut()
            .find(|s| s.id == set.id)
            .ok_or_else(|| StoreError::NotFound { kind: "recall set", id: set.id.clone() })?;
        *slot = set;
        self.save("sets.json", &inner.sets)
    }
}

#[async_trait]
impl RecallPointRepo for JsonStore {
    async fn create_point(&self, point: RecallPoint) -> StoreResult<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.points.push(point);
        self.save("points.json", &inner.points)
    }

    async fn find_point(&self, id: &str) -> StoreResult<Option<RecallPoint>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.points.iter().find(|p| p.id == id).cloned())
    }

    async fn find_points_by_set(&self, set_id: &str) -> StoreResult<Vec<RecallPoint>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .points
            .iter()
            .filter(|p| p.set_id == set_id)
            .cloned()
            .collect())
    }

    async fn find_due_points(&self, set_id: &str, as_of_ms: i64) -> StoreResult<Vec<RecallPoint>> {
        let inner = self.inner.lock().unwrap();
        let mut due: Vec<_> = inner
            .points
            .iter()
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
            .iter_mut()
            .find(|p| p.id == point_id)
            .ok_or_else(|| StoreError::NotFound { kind: "recall point", id: point_id.into() })?;
        point.fsrs = state;
        self.save("points.json", &inner.points)
    }

    async fn add_recall_attempt(&self, point_id: &str, attempt: RecallAttempt) -> StoreResult<()> {
        let mut inner = self.inner.lock().unwrap();
        let point = inner
            .points
            .iter_mut()
            .find(|p| p.id == point_id)
            .ok_or_else(|| StoreError::NotFound { kind: "recall point", id: point_id.into() })?;
        point.history.push(attempt);
        self.save("points.json", &inner.points)
    }
}

#[async_trait]
impl SessionRepo for JsonStore {
    async fn create_session(&self, session: Session) -> StoreResult<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.sessions.push(session);
        self.save("sessions.json", &inner.sessions)
    }

    async fn find_session(&self, id: &str) -> StoreResult<Option<Session>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.sessions.iter().find(|s| s.id == id).cloned())
    }

    async fn find_active_session(&self, set_id: &str) -> StoreResult<Option<Session>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .sessions
            .iter()
            .find(|s| {
                s.set_id == set_id
                    && matches!(s.status, SessionStatus::InProgress | SessionStatus::Paused)
            })
            .cloned())
    }

    async fn find_sessions_by_set(&self, set_id: &str) -> StoreResult<Vec<Session>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .sessions
            .iter()
            .filter(|s| s.set_id == set_id)
            .cloned()
            .collect())
    }

    async fn list_sessions(&self) -> StoreResult<Vec<Session>> {
        Ok(self.inner.lock().unwrap().sessions.clone())
    }

    async fn update_session(&self, session: Session) -> StoreResult<()> {
        let mut inner = self.inner.lock().unwrap();
        let slot = inner
            .sessions
            .iter_mut()
            .find(|s| s.id == session.id)
            .ok_or_else(|| StoreError::NotFound { kind: "session", id: session.id.clone() })?;
        *slot = session;
        self.save("sessions.json", &inner.sessions)
    }

    async fn update_recalled_point_ids(&self, id: &str, recalled: Vec<String>) -> StoreResult<()> {
        let mut inner = self.inner.lock().unwrap();
        let session = inner
            .sessions
            .iter_mut()
            .find(|s| s.id == id)
            .ok_or_else(|| StoreError::NotFound { kind: "session", id: id.into() })?;
        session.recalled_point_ids = recalled;
        self.save("sessions.json", &inner.sessions)
    }
}

#[async_trait]
impl SessionMessageRepo for JsonStore {
    async fn create_message(&self, message: SessionMessage) -> StoreResult<()> {
        let mut inner = self.inner.lock().unwrap();
        self.append("messages.jsonl", &message)?;
        inner.messages.push(message);
        Ok(())
    }

    async fn find_messages(&self, session_id: &str) -> StoreResult<Vec<SessionMessage>> {
        let inner = self.inner.lock().unwrap();
        let mut messages: Vec<_> = inner
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
impl RecallOutcomeRepo for JsonStore {
    async fn create_outcome(&self, outcome: RecallOutcome) -> StoreResult<()> {
        let mut inner = self.inner.lock().unwrap();
        self.append("outcomes.jsonl", &outcome)?;
        inner.outcomes.push(outcome);
        Ok(())
    }

    async fn find_outcomes(&self, session_id: &str) -> StoreResult<Vec<RecallOutcome>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .outcomes
            .iter()
            .filter(|o| o.session_id == session_id)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl RabbitholeEventRepo for JsonStore {
    async fn create_rabbithole(&self, event: RabbitholeEvent) -> StoreResult<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.rabbitholes.push(event);
        self.save("rabbitholes.json", &inner.rabbitholes)
    }

    async fn find_rabbithole(&self, id: &str) -> StoreResult<Option<RabbitholeEvent>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.rabbitholes.iter().find(|e| e.id == id).cloned())
    }

    async fn find_rabbitholes(&self, session_id: &str) -> StoreResult<Vec<RabbitholeEvent>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .rabbitholes
            .iter()
            .filter(|e| e.session_id == session_id)
            .cloned()
            .collect())
    }

    async fn update_rabbithole(&self, event: RabbitholeEvent) -> StoreResult<()> {
        let mut inner = self.inner.lock().unwrap();
        let slot = inner
            .rabbitholes
            .iter_mut()
            .find(|e| e.id == event.id)
            .ok_or_else(|| StoreError::NotFound {
                kind: "rabbithole event",
                id: event.id.clone(),
            })?;
        *slot = event;
        self.save("rabbitholes.json", &inner.rabbitholes)
    }

    async fn update_rabbithole_conversation(
        &self,
        id: &str,
        conversation: Vec<ConversationTurn>,
    ) -> StoreResult<()> {
        let mut inner = self.inner.lock().unwrap();
        let event = inner
            .rabbitholes
            .iter_mut()
            .find(|e| e.id == id)
            .ok_or_else(|| StoreError::NotFound { kind: "rabbithole event", id: id.into() })?;
        event.conversation = conversation;
        self.save("rabbitholes.json", &inner.rabbitholes)
    }
}

#[async_trait]
impl SessionMetricsRepo for JsonStore {
    async fn create_metrics(&self, metrics: SessionMetrics) -> StoreResult<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.metrics.push(metrics);
        self.save("metrics.json", &inner.metrics)
    }

    async fn find_metrics(&self, session_id: &str) -> StoreResult<Option<SessionMetrics>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .metrics
            .iter()
            .find(|m| m.session_id == session_id)
            .cloned())
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use minne_fsrs::Scheduler;

    const NOW: i64 = 1_700_000_000_000;

    #[tokio::test]
    async fn round_trips_collections_across_reopen() {
        let dir = tempfile::tempdir().unwrap();

        let set = RecallSet::new("swedish", "basic vocabulary", NOW);
        let point = RecallPoint::new(
            &set.id,
            "tack means thank you",
            "",
            Scheduler::default().initial_state(NOW),
            NOW,
        );
        let session = Session::new(&set.id, vec![point.id.clone()], NOW);
        {
            let store = JsonStore::open(dir.path()).unwrap();
            store.create_set(set.clone()).await.unwrap();
            store.create_point(point.clone()).await.unwrap();
            store.create_session(session.clone()).await.unwrap();
            store
                .create_message(SessionMessage::new(
                    &session.id,
                    MessageRole::User,
                    "hello",
                    NOW,
                ))
                .await
                .unwrap();
        }

        let store = JsonStore::open(dir.path()).unwrap();
        assert_eq!(store.find_set(&set.id).await.unwrap().unwrap().name, "swedish");
        assert_eq!(
            store.find_point(&point.id).await.unwrap().unwrap().content,
            "tack means thank you"
        );
        let messages = store.find_messages(&session.id).await.unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].content, "hello");
    }

    #[tokio::test]
    async fn fsrs_update_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let scheduler = Scheduler::default();
        let point = RecallPoint::new("set", "fact", "", scheduler.initial_state(NOW), NOW);
        {
            let store = JsonStore::open(dir.path()).unwrap();
            store.create_point(point.clone()).await.unwrap();
            let next = scheduler.schedule(&point.fsrs, minne_fsrs::Rating::Good, NOW);
            store.update_fsrs_state(&point.id, next).await.unwrap();
        }
        let store = JsonStore::open(dir.path()).unwrap();
        let reloaded = store.find_point(&point.id).await.unwrap().unwrap();
        assert_eq!(reloaded.fsrs.reps, 1);
        assert!(reloaded.fsrs.due_ms > NOW);
    }

    #[tokio::test]
    async fn messages_append_as_jsonl() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonStore::open(dir.path()).unwrap();
        for i in 0..3 {
            store
                .create_message(SessionMessage::new(
                    "s",
                    MessageRole::User,
                    format!("m{i}"),
                    NOW + i,
                ))
                .await
                .unwrap();
        }
        drop(store);
        let text = std::fs::read_to_string(dir.path().join("messages.jsonl")).unwrap();
        assert_eq!(text.lines().count(), 3);
    }

    #[tokio::test]
    async fn missing_files_mean_empty_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonStore::open(dir.path()).unwrap();
        assert!(store.list_sets().await.unwrap().is_empty());
        assert!(store.list_sessions().await.unwrap().is_empty());
    }
}
