// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! End-to-end tests across the public crate APIs: engine + LLM adapters +
//! store, with scripted mock providers standing in for the models.

use std::sync::Arc;

use tokio::sync::mpsc;

use minne_config::SessionConfig;
use minne_core::{EventEnvelope, LlmEvaluator, LlmTangentDetector, SessionEngine, SessionEvent};
use minne_fsrs::Scheduler;
use minne_model::{Completion, ScriptedProvider};
use minne_store::{
    JsonStore, MemoryStore, RabbitholeEventRepo, RabbitholeStatus, RecallOutcomeRepo, RecallPoint,
    RecallPointRepo, RecallSet, RecallSetRepo, SessionMessageRepo, SessionMetricsRepo,
    SessionRepo, SessionStatus, Store,
};

const NOW: i64 = 1_700_000_000_000;

fn eval_json(success: bool, confidence: f64) -> Completion {
    Completion::text(format!(
        r#"{{"success": {success}, "confidence": {confidence}, "reasoning": "scripted"}}"#
    ))
}

fn no_tangent() -> &'static str {
    r#"{"is_rabbithole": false, "confidence": 0.1, "reasoning": "on topic"}"#
}

fn tangent(topic: &str, confidence: f64) -> Completion {
    Completion::text(format!(
        r#"{{"is_rabbithole": true, "topic": "{topic}", "depth": 1, "confidence": {confidence}, "reasoning": "drifted"}}"#
    ))
}

async fn seed_set<S: RecallSetRepo + RecallPointRepo>(store: &S) -> (RecallSet, Vec<RecallPoint>) {
    let set = RecallSet::new("norse-myths", "Gods and sagas", NOW);
    store.create_set(set.clone()).await.unwrap();
    let scheduler = Scheduler::default();
    let mut points = Vec::new();
    let facts = [
        "Odin gave an eye for wisdom",
        "Sleipnir has eight legs",
        "Fenrir is bound by Gleipnir",
    ];
    for (i, content) in facts.iter().enumerate() {
        let mut fsrs = scheduler.initial_state(NOW);
        fsrs.due_ms = NOW - 30_000 + (i as i64) * 10_000;
        let point = RecallPoint::new(&set.id, *content, "", fsrs, NOW);
        store.create_point(point.clone()).await.unwrap();
        points.push(point);
    }
    (set, points)
}

fn engine_for(
    store: Arc<dyn Store>,
    evaluator_script: Vec<Completion>,
    detector_script: Vec<Completion>,
) -> (SessionEngine, mpsc::UnboundedReceiver<EventEnvelope>) {
    let tutor = Arc::new(ScriptedProvider::always("And what else do you remember?"));
    let evaluator_provider = ScriptedProvider::new(evaluator_script);
    let detector_provider = if detector_script.is_empty() {
        ScriptedProvider::always(no_tangent())
    } else {
        ScriptedProvider::new(detector_script)
    };
    let agent_model = Arc::new(ScriptedProvider::always("What a detour this is."));

    let mut engine = SessionEngine::new(
        store,
        tutor,
        Arc::new(LlmEvaluator::new(Arc::new(evaluator_provider))),
        Arc::new(LlmTangentDetector::new(Arc::new(detector_provider))),
        agent_model,
        SessionConfig::default(),
    );
    let (tx, rx) = mpsc::unbounded_channel();
    engine.set_listener(tx);
    (engine, rx)
}

fn drain(rx: &mut mpsc::UnboundedReceiver<EventEnvelope>) -> Vec<SessionEvent> {
    let mut out = Vec::new();
    while let Ok(env) = rx.try_recv() {
        out.push(env.event);
    }
    out
}

// ── Scenario: pause and resume ────────────────────────────────────────────────

#[tokio::test]
async fn pause_preserves_progress_and_start_resumes_the_same_session() {
    let store = Arc::new(MemoryStore::new());
    let (set, points) = seed_set(store.as_ref()).await;

    // Turn 1 recalls only the first point.
    let (mut engine, mut rx) = engine_for(
        Arc::clone(&store) as Arc<dyn Store>,
        vec![eval_json(true, 0.81), eval_json(false, 0.42), eval_json(false, 0.12)],
        vec![],
    );
    let snapshot = engine.start(&set).await.unwrap();
    let outcome = engine
        .process_user_message("Odin traded an eye for wisdom at Mimir's well")
        .await
        .unwrap();
    assert_eq!(outcome.points_recalled_this_turn, 1);

    engine.pause().await.unwrap();
    assert!(!engine.has_active_session());
    let events = drain(&mut rx);
    assert!(events.iter().any(|e| matches!(e, SessionEvent::SessionPaused { .. })));

    let row = store.find_session(&snapshot.session_id).await.unwrap().unwrap();
    assert_eq!(row.status, SessionStatus::Paused);
    assert_eq!(row.recalled_point_ids, vec![points[0].id.clone()]);

    // A fresh engine resumes the same session with the checklist intact.
    let (mut engine2, mut rx2) = engine_for(Arc::clone(&store) as Arc<dyn Store>, vec![], vec![]);
    let resumed = engine2.start(&set).await.unwrap();
    assert_eq!(resumed.session_id, snapshot.session_id);
    assert_eq!(resumed.recalled_count, 1);
    assert_eq!(resumed.total_points, 3);
    assert_eq!(resumed.checklist[0], (points[0].id.clone(), true));
    assert_eq!(resumed.checklist[1], (points[1].id.clone(), false));
    assert_eq!(resumed.checklist[2], (points[2].id.clone(), false));
    assert_eq!(resumed.next_probe_point_id.as_deref(), Some(points[1].id.as_str()));

    let events = drain(&mut rx2);
    assert!(events
        .iter()
        .any(|e| matches!(e, SessionEvent::SessionStarted { resumed: true, .. })));

    // No point fell back from recalled to pending.
    let row = store.find_session(&snapshot.session_id).await.unwrap().unwrap();
    assert_eq!(row.status, SessionStatus::InProgress);
    assert!(row.resumed_at_ms.is_some());
}

// ── Scenario: abandon with an active rabbit hole ─────────────────────────────

#[tokio::test]
async fn abandon_marks_active_rabbithole_abandoned_and_emits_no_completion() {
    let store = Arc::new(MemoryStore::new());
    let (set, _points) = seed_set(store.as_ref()).await;

    let (mut engine, mut rx) = engine_for(
        Arc::clone(&store) as Arc<dyn Store>,
        // Recall-mode turn evaluates all three points; nothing recalled.
        // The tangent turn evaluates them again; still nothing.
        vec![
            eval_json(false, 0.1),
            eval_json(false, 0.1),
            eval_json(false, 0.1),
            eval_json(false, 0.1),
            eval_json(false, 0.1),
            eval_json(false, 0.1),
        ],
        vec![tangent("valkyries", 0.78)],
    );
    let snapshot = engine.start(&set).await.unwrap();
    engine
        .process_user_message("wait, what exactly do valkyries do?")
        .await
        .unwrap();

    let events = store.find_rabbitholes(&snapshot.session_id).await.unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].status, RabbitholeStatus::Active);

    engine
        .enter_rabbithole("valkyries", &events[0].id)
        .await
        .unwrap();
    engine.process_user_message("tell me everything").await.unwrap();

    engine.abandon().await.unwrap();
    assert!(!engine.has_active_session());

    let event = store.find_rabbithole(&events[0].id).await.unwrap().unwrap();
    assert_eq!(event.status, RabbitholeStatus::Abandoned);
    // Final message index: user message + assistant reply from turn 1.
    assert_eq!(event.return_message_index, Some(1));
    assert!(!event.conversation.is_empty(), "sub-dialog preserved on abandon");

    let row = store.find_session(&snapshot.session_id).await.unwrap().unwrap();
    assert_eq!(row.status, SessionStatus::Abandoned);
    assert!(row.ended_at_ms.is_some());

    let emitted = drain(&mut rx);
    assert!(
        !emitted
            .iter()
            .any(|e| matches!(e, SessionEvent::SessionCompleted { .. })),
        "abandon must not emit session_completed"
    );
    assert!(
        store
            .find_metrics(&snapshot.session_id)
            .await
            .unwrap()
            .is_none(),
        "abandon does not finalize metrics"
    );
}

// ── Round trip: a tangent with no recall changes nothing ─────────────────────

#[tokio::test]
async fn tangent_without_recall_leaves_checklist_and_fsrs_untouched() {
    let store = Arc::new(MemoryStore::new());
    let (set, points) = seed_set(store.as_ref()).await;

    let (mut engine, _rx) = engine_for(
        Arc::clone(&store) as Arc<dyn Store>,
        vec![
            eval_json(false, 0.1),
            eval_json(false, 0.1),
            eval_json(false, 0.1),
            eval_json(false, 0.1),
            eval_json(false, 0.1),
            eval_json(false, 0.1),
        ],
        vec![tangent("skalds", 0.9)],
    );
    let snapshot = engine.start(&set).await.unwrap();
    engine.process_user_message("who wrote these down?").await.unwrap();

    let event_id = store.find_rabbitholes(&snapshot.session_id).await.unwrap()[0]
        .id
        .clone();
    engine.enter_rabbithole("skalds", &event_id).await.unwrap();
    let outcome = engine.process_user_message("go on").await.unwrap();
    assert_eq!(outcome.points_recalled_this_turn, 0);
    engine.exit_rabbithole().await.unwrap();

    let after = engine.snapshot().unwrap();
    assert_eq!(after.recalled_count, 0);
    for point in &points {
        let stored = store.find_point(&point.id).await.unwrap().unwrap();
        assert_eq!(stored.fsrs.reps, 0, "no FSRS commit without a recall");
        assert!(stored.history.is_empty());
    }
    assert!(store
        .find_outcomes(&snapshot.session_id)
        .await
        .unwrap()
        .is_empty());
}

// ── JSON store: a full session survives a process restart ────────────────────

#[tokio::test]
async fn completed_session_round_trips_through_the_json_store() {
    let dir = tempfile::tempdir().unwrap();
    let session_id;
    {
        let store = Arc::new(JsonStore::open(dir.path()).unwrap());
        let (set, _points) = seed_set(store.as_ref()).await;
        let (mut engine, _rx) = engine_for(
            Arc::clone(&store) as Arc<dyn Store>,
            vec![eval_json(true, 0.92), eval_json(true, 0.92), eval_json(true, 0.92)],
            vec![],
        );
        let snapshot = engine.start(&set).await.unwrap();
        session_id = snapshot.session_id.clone();
        engine.opening_message().await.unwrap();
        engine.process_user_message("all three, easily").await.unwrap();
        engine.leave_session().await.unwrap();
    }

    let store = JsonStore::open(dir.path()).unwrap();
    let session = store.find_session(&session_id).await.unwrap().unwrap();
    assert_eq!(session.status, SessionStatus::Completed);
    assert_eq!(session.recalled_point_ids.len(), 3);

    let messages = store.find_messages(&session_id).await.unwrap();
    assert_eq!(messages.len(), 3, "opening + user + reply");

    let outcomes = store.find_outcomes(&session_id).await.unwrap();
    assert_eq!(outcomes.len(), 3);
    assert!(outcomes.iter().all(|o| o.success));

    let metrics = store.find_metrics(&session_id).await.unwrap().unwrap();
    assert_eq!(metrics.recall_points_successful, 3);
    assert!(metrics.output_tokens > 0, "token usage survives the round trip");
}
