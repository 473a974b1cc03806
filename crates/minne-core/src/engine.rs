// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! The session engine: owns one study session and drives the conversation ↔
//! evaluation ↔ scheduling loop.
//!
//! One engine instance serves one session at a time; all operations take
//! `&mut self`, so concurrent calls on the same instance are ruled out by
//! construction. Run sessions in parallel by creating one engine each;
//! there is no cross-session shared mutable state.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};

use minne_config::SessionConfig;
use minne_fsrs::Scheduler;
use minne_model::{CompletionRequest, Message, ModelProvider, Role};
use minne_store::{
    MessageRole, RabbitholeEvent, RabbitholeStatus, RecallAttempt, RecallOutcome, RecallPoint,
    RecallSet, Session, SessionMessage, SessionStatus, Store,
};

use crate::checklist::{Checklist, PointStatus};
use crate::errors::{EngineError, EngineResult};
use crate::evaluator::{near_miss_sentence, Evaluator, PointEvaluation};
use crate::events::{EventEnvelope, EventListener, SessionEvent};
use crate::metrics::MetricsCollector;
use crate::prompts::{self, EvaluationContext, INTERNAL_OBSERVATION_PREFIX};
use crate::rabbithole::{
    depth_for_exchanges, normalize_topic, RabbitholeAgent, TangentDetector,
};
use crate::scheduler::resolve_rating;

pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Conversational mode of the active session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Recall,
    Rabbithole,
}

/// Result of one processed user message.
#[derive(Debug, Clone)]
pub struct TurnOutcome {
    pub response_text: String,
    /// Always `false`: completion is signalled by the overlay event and
    /// finalized by `leave_session`.
    pub completed: bool,
    pub recalled_count: usize,
    pub total_points: usize,
    pub points_recalled_this_turn: usize,
}

/// Immutable view of the runtime state for UI consumers.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub session_id: String,
    pub set_id: String,
    pub mode: Mode,
    pub recalled_count: usize,
    pub total_points: usize,
    pub checklist: Vec<(String, bool)>,
    pub next_probe_point_id: Option<String>,
    pub completion_pending: bool,
}

struct ActiveRabbithole {
    agent: RabbitholeAgent,
    event_id: String,
    topic: String,
    points_recalled: usize,
    entered_at_ms: i64,
}

/// All per-session runtime state. Reconstructible from the store on resume.
struct ActiveSession {
    session: Session,
    set: RecallSet,
    /// Engine-local copies of the targets; FSRS state tracks commits.
    target_points: Vec<RecallPoint>,
    checklist: Checklist,
    /// Cache of the persisted main dialog.
    messages: Vec<SessionMessage>,
    mode: Mode,
    completion_pending: bool,
    completion_pending_after_rabbithole: bool,
    decline_cooldown: u8,
    /// Detected-but-not-entered event awaiting the user's decision.
    pending_rabbithole: Option<(String, String)>,
    /// Normalized topics already recorded this session.
    known_topics: HashSet<String>,
    /// Per-point evaluation attempts this session.
    eval_counts: HashMap<String, u32>,
    rabbithole: Option<ActiveRabbithole>,
    metrics: MetricsCollector,
    system_prompt: String,
}

impl ActiveSession {
    fn unchecked_points(&self) -> Vec<RecallPoint> {
        self.target_points
            .iter()
            .filter(|p| self.checklist.status_of(&p.id) == Some(PointStatus::Pending))
            .cloned()
            .collect()
    }

    fn probe_point(&self) -> Option<&RecallPoint> {
        let id = self.checklist.next_probe()?;
        self.target_points.iter().find(|p| p.id == id)
    }

    fn rebuild_system_prompt(&mut self) {
        let unchecked: Vec<&RecallPoint> = self
            .target_points
            .iter()
            .filter(|p| self.checklist.status_of(&p.id) == Some(PointStatus::Pending))
            .collect();
        let probe_id = self.checklist.next_probe().map(str::to_string);
        let probe = probe_id
            .as_deref()
            .and_then(|id| self.target_points.iter().find(|p| p.id == id));
        self.system_prompt =
            prompts::build_tutor_prompt(&self.set, &self.target_points, &unchecked, probe);
    }

    /// Main-dialog history as model messages (user/assistant only).
    fn dialog_history(&self) -> Vec<Message> {
        self.messages
            .iter()
            .filter_map(|m| match m.role {
                MessageRole::User => Some(Message::user(&m.content)),
                MessageRole::Assistant => Some(Message::assistant(&m.content)),
                MessageRole::System => None,
            })
            .collect()
    }

    /// Last `n` persisted messages, for the detector windows.
    fn recent_messages(&self, n: usize) -> &[SessionMessage] {
        let start = self.messages.len().saturating_sub(n);
        &self.messages[start..]
    }
}

/// Outcome of one evaluation sweep over the unchecked points.
struct SweepResult {
    /// Newly demonstrated points in target order.
    recalled: Vec<(String, PointEvaluation)>,
    /// Near-miss nudges for the tutor, never shown to the user verbatim.
    feedback: String,
    /// (point id, confidence) of attempted-but-failed points, for metrics.
    failures: Vec<(String, f64)>,
}

pub struct SessionEngine {
    store: Arc<dyn Store>,
    tutor: Arc<dyn ModelProvider>,
    evaluator: Arc<dyn Evaluator>,
    detector: Arc<dyn TangentDetector>,
    rabbithole_model: Arc<dyn ModelProvider>,
    scheduler: Scheduler,
    config: SessionConfig,
    listener: Option<EventListener>,
    state: Option<ActiveSession>,
}

fn emit(listener: &Option<EventListener>, event: SessionEvent) {
    if let Some(tx) = listener {
        // A dropped receiver must never abort the engine's turn.
        let _ = tx.send(EventEnvelope { event, timestamp_ms: now_ms() });
    }
}

impl SessionEngine {
    pub fn new(
        store: Arc<dyn Store>,
        tutor: Arc<dyn ModelProvider>,
        evaluator: Arc<dyn Evaluator>,
        detector: Arc<dyn TangentDetector>,
        rabbithole_model: Arc<dyn ModelProvider>,
        config: SessionConfig,
    ) -> Self {
        let scheduler = Scheduler::new(config.desired_retention, config.maximum_interval_days);
        Self {
            store,
            tutor,
            evaluator,
            detector,
            rabbithole_model,
            scheduler,
            config,
            listener: None,
            state: None,
        }
    }

    /// Install the single event listener slot.
    pub fn set_listener(&mut self, listener: EventListener) {
        self.listener = Some(listener);
    }

    pub fn clear_listener(&mut self) {
        self.listener = None;
    }

    pub fn has_active_session(&self) -> bool {
        self.state.is_some()
    }

    pub fn mode(&self) -> Option<Mode> {
        self.state.as_ref().map(|s| s.mode)
    }

    /// Immutable view of the current runtime state.
    pub fn snapshot(&self) -> Option<SessionSnapshot> {
        let state = self.state.as_ref()?;
        Some(SessionSnapshot {
            session_id: state.session.id.clone(),
            set_id: state.set.id.clone(),
            mode: state.mode,
            recalled_count: state.checklist.recalled_count(),
            total_points: state.checklist.total(),
            checklist: state
                .checklist
                .entries()
                .into_iter()
                .map(|(id, status)| (id, status == PointStatus::Recalled))
                .collect(),
            next_probe_point_id: state.checklist.next_probe().map(str::to_string),
            completion_pending: state.completion_pending,
        })
    }

    // ─── Lifecycle ───────────────────────────────────────────────────────────

    /// Start a session on `set`, resuming the set's active or paused session
    /// when one exists.
    pub async fn start(&mut self, set: &RecallSet) -> EngineResult<SessionSnapshot> {
        if let Some(existing) = self
            .store
            .find_active_session(&set.id)
            .await
            .map_err(|e| EngineError::persistence("find_active_session", e))?
        {
            return self.resume(existing, set).await;
        }

        let now = now_ms();
        let due = self
            .store
            .find_due_points(&set.id, now)
            .await
            .map_err(|e| EngineError::persistence("find_due_points", e))?;
        if due.is_empty() {
            return Err(EngineError::NoDuePoints { set_id: set.id.clone() });
        }

        let target_ids: Vec<String> = due.iter().map(|p| p.id.clone()).collect();
        let session = Session::new(&set.id, target_ids.clone(), now);
        self.store
            .create_session(session.clone())
            .await
            .map_err(|e| EngineError::persistence("create_session", e))?;

        info!(session_id = %session.id, set = %set.name, points = due.len(), "session started");

        let mut state = ActiveSession {
            metrics: MetricsCollector::new(
                session.id.clone(),
                self.tutor.model_name(),
                now,
                false,
                self.pause_threshold_ms(),
            ),
            session,
            set: set.clone(),
            target_points: due,
            checklist: Checklist::new(target_ids),
            messages: Vec::new(),
            mode: Mode::Recall,
            completion_pending: false,
            completion_pending_after_rabbithole: false,
            decline_cooldown: 0,
            pending_rabbithole: None,
            known_topics: HashSet::new(),
            eval_counts: HashMap::new(),
            rabbithole: None,
            system_prompt: String::new(),
        };
        state.rebuild_system_prompt();

        let session_id = state.session.id.clone();
        self.state = Some(state);
        emit(
            &self.listener,
            SessionEvent::SessionStarted { session_id, resumed: false },
        );
        self.snapshot()
            .ok_or_else(|| EngineError::Invariant("snapshot after start".into()))
    }

    /// Rehydrate a paused (or interrupted in-progress) session.
    pub async fn resume(
        &mut self,
        mut session: Session,
        set: &RecallSet,
    ) -> EngineResult<SessionSnapshot> {
        let now = now_ms();

        let mut target_points = Vec::with_capacity(session.target_point_ids.len());
        for id in &session.target_point_ids {
            let point = self
                .store
                .find_point(id)
                .await
                .map_err(|e| EngineError::persistence("find_point", e))?
                .ok_or_else(|| {
                    EngineError::Invariant(format!("session targets missing point {id}"))
                })?;
            target_points.push(point);
        }

        let messages = self
            .store
            .find_messages(&session.id)
            .await
            .map_err(|e| EngineError::persistence("find_messages", e))?;

        let checklist = Checklist::restore(
            session.target_point_ids.clone(),
            &session.recalled_point_ids,
        );

        let known_topics: HashSet<String> = self
            .store
            .find_rabbitholes(&session.id)
            .await
            .map_err(|e| EngineError::persistence("find_rabbitholes", e))?
            .iter()
            .map(|e| normalize_topic(&e.topic))
            .collect();

        session.status = SessionStatus::InProgress;
        session.resumed_at_ms = Some(now);
        self.store
            .update_session(session.clone())
            .await
            .map_err(|e| EngineError::persistence("update_session", e))?;

        info!(
            session_id = %session.id,
            recalled = checklist.recalled_count(),
            total = checklist.total(),
            "session resumed"
        );

        let mut state = ActiveSession {
            metrics: MetricsCollector::new(
                session.id.clone(),
                self.tutor.model_name(),
                now,
                true,
                self.pause_threshold_ms(),
            ),
            session,
            set: set.clone(),
            target_points,
            checklist,
            messages,
            mode: Mode::Recall,
            completion_pending: false,
            completion_pending_after_rabbithole: false,
            decline_cooldown: 0,
            pending_rabbithole: None,
            known_topics,
            eval_counts: HashMap::new(),
            rabbithole: None,
            system_prompt: String::new(),
        };
        state.rebuild_system_prompt();

        let session_id = state.session.id.clone();
        self.state = Some(state);
        emit(
            &self.listener,
            SessionEvent::SessionStarted { session_id, resumed: true },
        );
        self.snapshot()
            .ok_or_else(|| EngineError::Invariant("snapshot after resume".into()))
    }

    /// Produce and persist the tutor's opening message.
    pub async fn opening_message(&mut self) -> EngineResult<String> {
        let state = self.state.as_mut().ok_or(EngineError::NoActiveSession)?;

        if let Some(probe) = state.checklist.next_probe() {
            emit(
                &self.listener,
                SessionEvent::PointStarted { point_id: probe.to_string() },
            );
        }

        let mut history = state.dialog_history();
        history.push(Message::user(
            "(The learner has joined the session. Open with your first probe question.)",
        ));
        let request = CompletionRequest::new(history)
            .with_system(state.system_prompt.clone())
            .with_sampling(self.config.tutor_temperature, self.config.tutor_max_tokens);
        let completion = self
            .tutor
            .complete(request)
            .await
            .map_err(|e| EngineError::llm("opening_message", e))?;

        let now = now_ms();
        let mut message =
            SessionMessage::new(&state.session.id, MessageRole::Assistant, &completion.text, now);
        message.token_count = Some(completion.usage.output_tokens);
        self.store
            .create_message(message.clone())
            .await
            .map_err(|e| EngineError::persistence("persist_assistant_message", e))?;
        state
            .metrics
            .record_message(MessageRole::Assistant, now, completion.text.chars().count());
        state.metrics.record_usage(completion.usage);
        state.messages.push(message);

        emit(
            &self.listener,
            SessionEvent::AssistantMessage { content: completion.text.clone(), is_opening: true },
        );
        Ok(completion.text)
    }

    /// Persist the checklist, mark the session paused, and clear runtime
    /// state. All recall progress survives; a later `start` resumes. On a
    /// failed write the state stays installed so the caller can retry.
    pub async fn pause(&mut self) -> EngineResult<()> {
        let state = self.state.as_mut().ok_or(EngineError::NoActiveSession)?;

        // Snapshot the active rabbit-hole conversation so nothing is lost;
        // the event itself stays active for return detection after resume.
        if let Some(rh) = &state.rabbithole {
            if let Err(e) = self
                .store
                .update_rabbithole_conversation(&rh.event_id, rh.agent.conversation())
                .await
            {
                warn!(
                    session_id = %state.session.id,
                    op = "pause_rabbithole_conversation",
                    error = %e,
                    "failed to snapshot rabbit-hole conversation"
                );
            }
        }

        state.session.recalled_point_ids = state.checklist.recalled_ids();
        state.session.status = SessionStatus::Paused;
        self.store
            .update_session(state.session.clone())
            .await
            .map_err(|e| EngineError::persistence("pause_session", e))?;

        info!(session_id = %state.session.id, "session paused");
        let session_id = state.session.id.clone();
        self.state = None;
        emit(&self.listener, SessionEvent::SessionPaused { session_id });
        Ok(())
    }

    /// Abandon the session: no metrics row, no completion event. Any active
    /// rabbit hole is marked abandoned at the final message index.
    pub async fn abandon(&mut self) -> EngineResult<()> {
        let state = self.state.as_mut().ok_or(EngineError::NoActiveSession)?;
        let now = now_ms();

        Self::close_open_rabbitholes(&self.store, state).await?;

        state.session.recalled_point_ids = state.checklist.recalled_ids();
        state.session.status = SessionStatus::Abandoned;
        state.session.ended_at_ms = Some(now);
        self.store
            .update_session(state.session.clone())
            .await
            .map_err(|e| EngineError::persistence("abandon_session", e))?;

        info!(session_id = %state.session.id, "session abandoned");
        self.state = None;
        Ok(())
    }

    /// Finalize the session: close open rabbit holes, write the metrics row,
    /// and emit `session_completed`.
    pub async fn finalize(&mut self) -> EngineResult<()> {
        let state = self.state.as_mut().ok_or(EngineError::NoActiveSession)?;
        let now = now_ms();

        Self::close_open_rabbitholes(&self.store, state).await?;

        state.session.recalled_point_ids = state.checklist.recalled_ids();
        state.session.status = SessionStatus::Completed;
        state.session.ended_at_ms = Some(now);
        self.store
            .update_session(state.session.clone())
            .await
            .map_err(|e| EngineError::persistence("complete_session", e))?;

        let metrics = state.metrics.finalize(now);
        self.store
            .create_metrics(metrics)
            .await
            .map_err(|e| EngineError::persistence("create_metrics", e))?;

        info!(
            session_id = %state.session.id,
            recalled = state.checklist.recalled_count(),
            total = state.checklist.total(),
            "session completed"
        );
        let session_id = state.session.id.clone();
        self.state = None;
        emit(&self.listener, SessionEvent::SessionCompleted { session_id });
        Ok(())
    }

    /// Caller-facing wrapper used by the "Done" button once the completion
    /// overlay has fired.
    pub async fn leave_session(&mut self) -> EngineResult<()> {
        self.finalize().await
    }

    // ─── The hot path ────────────────────────────────────────────────────────

    /// Process one user message, routing on the current mode.
    pub async fn process_user_message(&mut self, content: &str) -> EngineResult<TurnOutcome> {
        match self.state.as_ref().map(|s| s.mode) {
            None => Err(EngineError::NoActiveSession),
            Some(Mode::Recall) => self.process_recall_message(content).await,
            Some(Mode::Rabbithole) => self.process_rabbithole_message(content).await,
        }
    }

    async fn process_recall_message(&mut self, content: &str) -> EngineResult<TurnOutcome> {
        let state = self.state.as_mut().ok_or(EngineError::NoActiveSession)?;
        let now = now_ms();

        // 1. Persist the user message.
        let message = SessionMessage::new(&state.session.id, MessageRole::User, content, now);
        self.store
            .create_message(message.clone())
            .await
            .map_err(|e| EngineError::persistence("persist_user_message", e))?;
        state
            .metrics
            .record_message(MessageRole::User, now, content.chars().count());
        state.messages.push(message);
        let user_index = state.messages.len() - 1;
        emit(
            &self.listener,
            SessionEvent::UserMessage { content: content.to_string() },
        );

        // 2. Tangent detection, unless suppressed.
        if state.decline_cooldown > 0 {
            state.decline_cooldown -= 1;
            debug!(remaining = state.decline_cooldown, "detection suppressed by decline cooldown");
        } else if state.rabbithole.is_none() && state.pending_rabbithole.is_none() {
            Self::detect_tangent(
                &self.store,
                self.detector.as_ref(),
                &self.config,
                &self.listener,
                state,
                now,
            )
            .await?;
        }

        // 3. Continuous evaluation of every unchecked point.
        let history = state.messages.clone();
        let sweep = Self::run_sweep(self.evaluator.as_ref(), &self.config, state, &history, None)
            .await;

        // 4. Commit each newly recalled point in target order.
        let mut recalled_this_turn = 0;
        for (point_id, eval) in &sweep.recalled {
            if Self::commit_recall(
                &self.store,
                &self.scheduler,
                &self.listener,
                state,
                point_id,
                eval,
                user_index,
            )
            .await?
            {
                recalled_this_turn += 1;
            }
        }
        for (_, confidence) in &sweep.failures {
            state.metrics.record_outcome(false, *confidence);
        }

        // 5. Completion gate: the overlay fires here; finalization waits for
        //    `leave_session`.
        if state.checklist.is_complete() && !state.completion_pending {
            state.completion_pending = true;
            emit(
                &self.listener,
                SessionEvent::SessionCompleteOverlay {
                    session_id: state.session.id.clone(),
                    recalled_count: state.checklist.recalled_count(),
                    total_points: state.checklist.total(),
                },
            );
        }

        // 6. Recalled points drop out of the probe candidates.
        if recalled_this_turn > 0 {
            state.rebuild_system_prompt();
        }

        // 7. Tutor reply, with the evaluator feedback as an invisible
        //    observation.
        let reply = Self::generate_tutor_reply(
            self.tutor.as_ref(),
            &self.config,
            state,
            &sweep.feedback,
        )
        .await?;
        let reply_now = now_ms();
        let mut assistant =
            SessionMessage::new(&state.session.id, MessageRole::Assistant, &reply.text, reply_now);
        assistant.token_count = Some(reply.usage.output_tokens);
        self.store
            .create_message(assistant.clone())
            .await
            .map_err(|e| EngineError::persistence("persist_assistant_message", e))?;
        state
            .metrics
            .record_message(MessageRole::Assistant, reply_now, reply.text.chars().count());
        state.metrics.record_usage(reply.usage);
        state.messages.push(assistant);
        emit(
            &self.listener,
            SessionEvent::AssistantMessage { content: reply.text.clone(), is_opening: false },
        );

        // 8. Return detection for recorded tangents the user never entered
        //    (or left without telling us).
        Self::detect_returns(&self.store, self.detector.as_ref(), &self.config, state).await;

        Ok(TurnOutcome {
            response_text: reply.text,
            completed: false,
            recalled_count: state.checklist.recalled_count(),
            total_points: state.checklist.total(),
            points_recalled_this_turn: recalled_this_turn,
        })
    }

    async fn process_rabbithole_message(&mut self, content: &str) -> EngineResult<TurnOutcome> {
        let state = self.state.as_mut().ok_or(EngineError::NoActiveSession)?;
        let topic = match &state.rabbithole {
            Some(rh) => rh.topic.clone(),
            None => return Err(EngineError::Invariant("rabbithole mode without agent".into())),
        };

        // Recall can happen mid-tangent: evaluate against the sub-dialog
        // conversation, which is where the user's words live.
        let mut history: Vec<SessionMessage> = state
            .rabbithole
            .as_ref()
            .map(|rh| {
                rh.agent
                    .conversation()
                    .into_iter()
                    .map(|turn| {
                        SessionMessage::new(&state.session.id, turn.role, turn.content, 0)
                    })
                    .collect()
            })
            .unwrap_or_default();
        history.push(SessionMessage::new(
            &state.session.id,
            MessageRole::User,
            content,
            now_ms(),
        ));

        let sweep =
            Self::run_sweep(self.evaluator.as_ref(), &self.config, state, &history, Some(&topic))
                .await;

        let main_index = state.messages.len().saturating_sub(1);
        let mut recalled_this_turn = 0;
        for (point_id, eval) in &sweep.recalled {
            if Self::commit_recall(
                &self.store,
                &self.scheduler,
                &self.listener,
                state,
                point_id,
                eval,
                main_index,
            )
            .await?
            {
                recalled_this_turn += 1;
            }
        }
        for (_, confidence) in &sweep.failures {
            state.metrics.record_outcome(false, *confidence);
        }
        if let Some(rh) = state.rabbithole.as_mut() {
            rh.points_recalled += recalled_this_turn;
        }

        // Completion inside a tangent is deferred: both flags are set, the
        // overlay waits for `exit_rabbithole`.
        if state.checklist.is_complete() && !state.completion_pending {
            state.completion_pending = true;
            state.completion_pending_after_rabbithole = true;
        }

        // The agent has its own persona; evaluator feedback is not injected.
        let rh = state
            .rabbithole
            .as_mut()
            .ok_or_else(|| EngineError::Invariant("rabbithole mode without agent".into()))?;
        let completion = rh
            .agent
            .reply(content)
            .await
            .map_err(|e| EngineError::llm("rabbithole_reply", e))?;
        state.metrics.record_usage(completion.usage);

        Ok(TurnOutcome {
            response_text: completion.text,
            completed: false,
            recalled_count: state.checklist.recalled_count(),
            total_points: state.checklist.total(),
            points_recalled_this_turn: recalled_this_turn,
        })
    }

    // ─── Rabbit-hole lifecycle ───────────────────────────────────────────────

    /// Opt in to a recorded tangent: switch modes, spin up the dedicated
    /// agent, and return its opening message. `rabbithole_entered` is
    /// emitted before the opening text is generated.
    pub async fn enter_rabbithole(
        &mut self,
        topic: &str,
        event_id: &str,
    ) -> EngineResult<String> {
        let state = self.state.as_mut().ok_or(EngineError::NoActiveSession)?;
        if state.mode == Mode::Rabbithole || state.rabbithole.is_some() {
            return Err(EngineError::NestedRabbithole);
        }

        let mut event = self
            .store
            .find_rabbithole(event_id)
            .await
            .map_err(|e| EngineError::persistence("find_rabbithole", e))?
            .ok_or_else(|| {
                EngineError::Invariant(format!("enter_rabbithole: unknown event {event_id}"))
            })?;
        event.user_initiated = true;
        self.store
            .update_rabbithole(event)
            .await
            .map_err(|e| EngineError::persistence("update_rabbithole", e))?;

        let agent = RabbitholeAgent::new(
            self.rabbithole_model.clone(),
            topic,
            &state.set.name,
            &state.set.description,
        );
        state.mode = Mode::Rabbithole;
        state.pending_rabbithole = None;
        state.rabbithole = Some(ActiveRabbithole {
            agent,
            event_id: event_id.to_string(),
            topic: topic.to_string(),
            points_recalled: 0,
            entered_at_ms: now_ms(),
        });
        info!(topic, event_id, "entered rabbit hole");
        emit(
            &self.listener,
            SessionEvent::RabbitholeEntered { topic: topic.to_string() },
        );

        let rh = state
            .rabbithole
            .as_mut()
            .ok_or_else(|| EngineError::Invariant("rabbithole agent missing after entry".into()))?;
        let opening = rh
            .agent
            .opening()
            .await
            .map_err(|e| EngineError::llm("rabbithole_opening", e))?;
        state.metrics.record_usage(opening.usage);
        Ok(opening.text)
    }

    /// Leave the tangent: persist the sub-dialog, mark the event returned,
    /// restore recall mode, and release any deferred completion overlay.
    pub async fn exit_rabbithole(&mut self) -> EngineResult<()> {
        let state = self.state.as_mut().ok_or(EngineError::NoActiveSession)?;
        if state.mode != Mode::Rabbithole {
            return Err(EngineError::NotInRabbithole);
        }
        let rh = state
            .rabbithole
            .take()
            .ok_or(EngineError::NotInRabbithole)?;
        let now = now_ms();

        let mut event = self
            .store
            .find_rabbithole(&rh.event_id)
            .await
            .map_err(|e| EngineError::persistence("find_rabbithole", e))?
            .ok_or_else(|| {
                EngineError::Invariant(format!("exit_rabbithole: unknown event {}", rh.event_id))
            })?;
        event.conversation = rh.agent.conversation();
        event.status = RabbitholeStatus::Returned;
        event.return_message_index = Some(state.messages.len().saturating_sub(1));
        event.depth = depth_for_exchanges(rh.agent.exchanges());
        let depth = event.depth;
        self.store
            .update_rabbithole(event)
            .await
            .map_err(|e| EngineError::persistence("update_rabbithole", e))?;

        state.mode = Mode::Recall;
        state
            .metrics
            .record_rabbithole(depth, now - rh.entered_at_ms);
        info!(topic = %rh.topic, points = rh.points_recalled, "exited rabbit hole");

        let completion_pending = state.completion_pending_after_rabbithole;
        emit(
            &self.listener,
            SessionEvent::RabbitholeExited {
                topic: rh.topic.clone(),
                points_recalled_during: rh.points_recalled,
                completion_pending,
            },
        );
        if completion_pending {
            state.completion_pending_after_rabbithole = false;
            emit(
                &self.listener,
                SessionEvent::SessionCompleteOverlay {
                    session_id: state.session.id.clone(),
                    recalled_count: state.checklist.recalled_count(),
                    total_points: state.checklist.total(),
                },
            );
        }
        Ok(())
    }

    /// Decline a detected tangent. The recorded event is closed out (so a
    /// later, different tangent can be detected) and detection is suppressed
    /// for the next few user messages.
    pub async fn decline_rabbithole(&mut self) -> EngineResult<()> {
        let state = self.state.as_mut().ok_or(EngineError::NoActiveSession)?;
        state.decline_cooldown = self.config.decline_cooldown_messages;

        if let Some((event_id, topic)) = state.pending_rabbithole.take() {
            let mut event = self
                .store
                .find_rabbithole(&event_id)
                .await
                .map_err(|e| EngineError::persistence("find_rabbithole", e))?
                .ok_or_else(|| {
                    EngineError::Invariant(format!("decline_rabbithole: unknown event {event_id}"))
                })?;
            event.status = RabbitholeStatus::Abandoned;
            event.return_message_index = Some(state.messages.len().saturating_sub(1));
            self.store
                .update_rabbithole(event)
                .await
                .map_err(|e| EngineError::persistence("update_rabbithole", e))?;
            debug!(topic, "declined rabbit hole");
        }
        Ok(())
    }

    // ─── Internals ───────────────────────────────────────────────────────────

    fn pause_threshold_ms(&self) -> i64 {
        self.config.pause_threshold_minutes as i64 * 60_000
    }

    /// Ask the detector about the latest window; record and announce a new
    /// tangent. Detector failures are local: logged and treated as silence.
    async fn detect_tangent(
        store: &Arc<dyn Store>,
        detector: &dyn TangentDetector,
        config: &SessionConfig,
        listener: &Option<EventListener>,
        state: &mut ActiveSession,
        now: i64,
    ) -> EngineResult<()> {
        let window = state.recent_messages(config.detector_window);
        let known: Vec<String> = state.known_topics.iter().cloned().collect();
        let detection = match detector
            .detect(window, state.probe_point(), &state.target_points, &known)
            .await
        {
            Ok(d) => d,
            Err(e) => {
                warn!(session_id = %state.session.id, error = %e, "tangent detection failed; skipping");
                return Ok(());
            }
        };

        if !detection.is_rabbithole || detection.confidence < config.detect_confidence_threshold {
            return Ok(());
        }
        let topic = match detection.topic {
            Some(t) if !t.is_empty() => t,
            _ => return Ok(()),
        };
        let key = normalize_topic(&topic);
        if state.known_topics.contains(&key) {
            debug!(topic, "tangent already recorded this session");
            return Ok(());
        }

        let target_ids: HashSet<&str> =
            state.target_points.iter().map(|p| p.id.as_str()).collect();
        let event = RabbitholeEvent {
            id: minne_store::new_id(),
            session_id: state.session.id.clone(),
            topic: topic.clone(),
            trigger_message_index: state.messages.len().saturating_sub(1),
            return_message_index: None,
            depth: detection.depth,
            related_point_ids: detection
                .related_recall_point_ids
                .into_iter()
                .filter(|id| target_ids.contains(id.as_str()))
                .collect(),
            user_initiated: false,
            status: RabbitholeStatus::Active,
            conversation: Vec::new(),
            created_at_ms: now,
        };
        let event_id = event.id.clone();
        store
            .create_rabbithole(event)
            .await
            .map_err(|e| EngineError::persistence("create_rabbithole", e))?;

        state.known_topics.insert(key);
        state.pending_rabbithole = Some((event_id.clone(), topic.clone()));
        info!(topic, event_id, confidence = detection.confidence, "rabbit hole detected");
        emit(listener, SessionEvent::RabbitholeDetected { topic, event_id });
        Ok(())
    }

    /// Evaluate every unchecked point against `history`, in parallel, and
    /// reassemble results in target order. A failed model call skips that
    /// point for this turn.
    async fn run_sweep(
        evaluator: &dyn Evaluator,
        config: &SessionConfig,
        state: &mut ActiveSession,
        history: &[SessionMessage],
        topic: Option<&str>,
    ) -> SweepResult {
        let unchecked = state.unchecked_points();
        let contexts: Vec<EvaluationContext> = unchecked
            .iter()
            .map(|p| EvaluationContext {
                attempt_number: state.eval_counts.get(&p.id).copied().unwrap_or(0) + 1,
                previous_successes: p.history.iter().filter(|a| a.success).count() as u32,
                topic: topic.map(str::to_string),
            })
            .collect();

        let futures = unchecked
            .iter()
            .zip(&contexts)
            .map(|(p, ctx)| evaluator.evaluate(p, history, ctx));
        let results = futures::future::join_all(futures).await;

        let mut sweep = SweepResult {
            recalled: Vec::new(),
            feedback: String::new(),
            failures: Vec::new(),
        };
        for (point, result) in unchecked.iter().zip(results) {
            *state.eval_counts.entry(point.id.clone()).or_insert(0) += 1;
            let eval = match result {
                Ok(e) => e,
                Err(e) => {
                    warn!(point_id = %point.id, error = %e, "evaluation failed; point skipped this turn");
                    continue;
                }
            };
            if eval.success && eval.confidence >= config.recall_confidence_threshold {
                sweep.recalled.push((point.id.clone(), eval));
            } else if eval.confidence >= config.near_miss_threshold
                && eval.confidence < config.recall_confidence_threshold
            {
                if !sweep.feedback.is_empty() {
                    sweep.feedback.push(' ');
                }
                sweep.feedback.push_str(&near_miss_sentence(point));
                sweep.failures.push((point.id.clone(), eval.confidence));
            } else if !eval.success && eval.confidence >= config.recall_confidence_threshold {
                // Confident failure: no feedback, but it counts as an attempt.
                sweep.failures.push((point.id.clone(), eval.confidence));
            }
        }
        sweep
    }

    /// Commit one recalled point: checklist flip, then FSRS reschedule,
    /// history append, and outcome row in that order, aborting on the first
    /// failed critical write. Idempotent: an already-recalled point is a
    /// no-op.
    async fn commit_recall(
        store: &Arc<dyn Store>,
        scheduler: &Scheduler,
        listener: &Option<EventListener>,
        state: &mut ActiveSession,
        point_id: &str,
        eval: &PointEvaluation,
        message_index: usize,
    ) -> EngineResult<bool> {
        if !state.checklist.mark_recalled(point_id) {
            return Ok(false);
        }
        let now = now_ms();
        emit(listener, SessionEvent::PointRecalled { point_id: point_id.to_string() });

        // Best-effort checklist-progress snapshot; a failure must not block
        // the turn.
        {
            let store = Arc::clone(store);
            let session_id = state.session.id.clone();
            let recalled = state.checklist.recalled_ids();
            state.session.recalled_point_ids = recalled.clone();
            tokio::spawn(async move {
                if let Err(e) = store.update_recalled_point_ids(&session_id, recalled).await {
                    warn!(
                        session_id = %session_id,
                        op = "update_recalled_point_ids",
                        error = %e,
                        "checklist-progress snapshot failed"
                    );
                }
            });
        }

        emit(
            listener,
            SessionEvent::PointEvaluated {
                point_id: point_id.to_string(),
                success: eval.success,
                confidence: eval.confidence,
            },
        );

        let point = state
            .target_points
            .iter_mut()
            .find(|p| p.id == point_id)
            .ok_or_else(|| {
                EngineError::Invariant(format!("recalled point {point_id} not in targets"))
            })?;
        let rating = resolve_rating(eval.suggested_rating.as_deref(), eval.success, eval.confidence);
        let new_state = scheduler.schedule(&point.fsrs, rating, now);

        store
            .update_fsrs_state(point_id, new_state.clone())
            .await
            .map_err(|e| EngineError::persistence("update_fsrs_state", e))?;
        let attempt = RecallAttempt { timestamp_ms: now, success: true, latency_ms: 0 };
        store
            .add_recall_attempt(point_id, attempt.clone())
            .await
            .map_err(|e| EngineError::persistence("add_recall_attempt", e))?;

        let user_ts = state
            .messages
            .get(message_index)
            .map(|m| m.timestamp_ms)
            .unwrap_or(now);
        let outcome = RecallOutcome {
            id: minne_store::new_id(),
            session_id: state.session.id.clone(),
            recall_point_id: point_id.to_string(),
            success: true,
            confidence: eval.confidence,
            rating: Some(rating),
            reasoning: eval.reasoning.clone(),
            message_index_range: (message_index, state.messages.len().saturating_sub(1)),
            time_spent_ms: (now - user_ts).max(0) as u64,
            created_at_ms: now,
        };
        store
            .create_outcome(outcome)
            .await
            .map_err(|e| EngineError::persistence("create_outcome", e))?;

        let new_due = new_state.due_ms;
        point.fsrs = new_state;
        point.history.push(attempt);
        state.metrics.record_outcome(true, eval.confidence);

        emit(
            listener,
            SessionEvent::PointCompleted {
                point_id: point_id.to_string(),
                rating,
                new_due_ms: new_due,
            },
        );
        debug!(point_id, rating = %rating, new_due_ms = new_due, "recall committed");
        Ok(true)
    }

    /// Build the tutor reply: the persisted dialog plus, when the evaluator
    /// produced feedback, an ephemeral leading assistant turn the model must
    /// not quote. The observation is never persisted.
    async fn generate_tutor_reply(
        tutor: &dyn ModelProvider,
        config: &SessionConfig,
        state: &ActiveSession,
        internal_observation: &str,
    ) -> EngineResult<minne_model::Completion> {
        let mut messages = Vec::new();
        if !internal_observation.is_empty() {
            messages.push(Message {
                role: Role::Assistant,
                content: format!("{INTERNAL_OBSERVATION_PREFIX}{internal_observation}"),
            });
        }
        messages.extend(state.dialog_history());

        let request = CompletionRequest::new(messages)
            .with_system(state.system_prompt.clone())
            .with_sampling(config.tutor_temperature, config.tutor_max_tokens);
        tutor
            .complete(request)
            .await
            .map_err(|e| EngineError::llm("tutor_reply", e))
    }

    /// After the assistant reply, check whether recorded-but-unentered
    /// tangents have concluded. Failures here are logged and ignored; the
    /// turn's real work is already done.
    async fn detect_returns(
        store: &Arc<dyn Store>,
        detector: &dyn TangentDetector,
        config: &SessionConfig,
        state: &mut ActiveSession,
    ) {
        let events = match store.find_rabbitholes(&state.session.id).await {
            Ok(events) => events,
            Err(e) => {
                warn!(session_id = %state.session.id, error = %e, "listing rabbit holes failed");
                return;
            }
        };
        let current = state.rabbithole.as_ref().map(|rh| rh.event_id.clone());

        for mut event in events {
            if event.status != RabbitholeStatus::Active || Some(&event.id) == current.as_ref() {
                continue;
            }
            let window = state.recent_messages(config.return_window);
            let verdict = match detector
                .detect_return(&event.topic, window, state.probe_point())
                .await
            {
                Ok(v) => v,
                Err(e) => {
                    warn!(topic = %event.topic, error = %e, "return detection failed");
                    continue;
                }
            };
            if !verdict.has_returned {
                continue;
            }
            event.status = RabbitholeStatus::Returned;
            event.return_message_index = Some(state.messages.len().saturating_sub(1));
            let event_id = event.id.clone();
            if let Err(e) = store.update_rabbithole(event).await {
                warn!(
                    session_id = %state.session.id,
                    op = "update_rabbithole",
                    error = %e,
                    "marking rabbit hole returned failed"
                );
                continue;
            }
            if state.pending_rabbithole.as_ref().map(|(id, _)| id) == Some(&event_id) {
                state.pending_rabbithole = None;
            }
            debug!(event_id, "rabbit hole returned");
        }
    }

    /// On session end, any still-active rabbit hole is marked abandoned at
    /// the final message index, with the sub-dialog preserved.
    async fn close_open_rabbitholes(
        store: &Arc<dyn Store>,
        state: &mut ActiveSession,
    ) -> EngineResult<()> {
        let final_index = state.messages.len().saturating_sub(1);
        let current = state.rabbithole.take();

        let events = store
            .find_rabbitholes(&state.session.id)
            .await
            .map_err(|e| EngineError::persistence("find_rabbitholes", e))?;
        for mut event in events {
            if event.status != RabbitholeStatus::Active {
                continue;
            }
            if let Some(rh) = current.as_ref().filter(|rh| rh.event_id == event.id) {
                event.conversation = rh.agent.conversation();
                event.depth = depth_for_exchanges(rh.agent.exchanges());
            }
            event.status = RabbitholeStatus::Abandoned;
            event.return_message_index = Some(final_index);
            store
                .update_rabbithole(event)
                .await
                .map_err(|e| EngineError::persistence("abandon_rabbithole", e))?;
        }
        state.mode = Mode::Recall;
        Ok(())
    }
}
