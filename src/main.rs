// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod cli;

use std::io::Write;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

use cli::{Cli, Commands, ExportTarget};
use minne_config::Config;
use minne_core::{
    EngineError, EventEnvelope, LlmEvaluator, LlmTangentDetector, SessionEngine, SessionEvent,
};
use minne_fsrs::MemoryStage;
use minne_store::{
    JsonStore, RabbitholeEventRepo, RecallOutcomeRepo, RecallPointRepo, RecallSetRepo,
    SessionMessageRepo, SessionMetricsRepo, SessionRepo, Store,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.log.as_deref());

    if let Commands::Completions { shell } = &cli.command {
        cli::print_completions(*shell);
        return Ok(());
    }

    let config = minne_config::load(cli.config.as_deref())?;

    if let Commands::ShowConfig = &cli.command {
        println!("{}", serde_yaml::to_string(&config)?);
        return Ok(());
    }

    let store = Arc::new(JsonStore::open(config.storage.resolved_data_dir())?);

    match cli.command {
        Commands::Study { set } => run_study(&config, store, &set).await,
        Commands::List => list_sets(store).await,
        Commands::Sessions { set } => list_sessions(store, set.as_deref()).await,
        Commands::Stats { set } => set_stats(store, &set).await,
        Commands::Replay { session } => replay_session(store, &session).await,
        Commands::Export { what } => export(store, what).await,
        Commands::Seed { file } => seed(store, &file).await,
        Commands::ShowConfig | Commands::Completions { .. } => unreachable!("handled above"),
    }
}

fn init_logging(filter_arg: Option<&str>) {
    let filter = match filter_arg {
        Some(f) => EnvFilter::new(f),
        None => EnvFilter::try_from_env("MINNE_LOG").unwrap_or_else(|_| EnvFilter::new("warn")),
    };
    let _ = tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .try_init();
}

// ── Study loop ────────────────────────────────────────────────────────────────

async fn run_study(config: &Config, store: Arc<JsonStore>, set_name: &str) -> anyhow::Result<()> {
    let set = store
        .find_set_by_name(set_name)
        .await?
        .with_context(|| format!("no recall set named {set_name:?} (see `minne list`)"))?;

    let tutor = minne_model::from_config(&config.model)?;
    let evaluator = Arc::new(LlmEvaluator::new(minne_model::from_config(
        config.evaluator_model(),
    )?));
    let detector = Arc::new(LlmTangentDetector::new(minne_model::from_config(
        config.detector_model(),
    )?));
    let agent_model = minne_model::from_config(config.rabbithole_model())?;

    let mut engine = SessionEngine::new(
        Arc::clone(&store) as Arc<dyn Store>,
        tutor,
        evaluator,
        detector,
        agent_model,
        config.session.clone(),
    );
    let (tx, mut events) = mpsc::unbounded_channel();
    engine.set_listener(tx);

    let snapshot = match engine.start(&set).await {
        Ok(s) => s,
        Err(EngineError::NoDuePoints { .. }) => {
            println!("Nothing is due in \"{}\" right now.", set.name);
            return Ok(());
        }
        Err(e) => return Err(e.into()),
    };
    println!(
        "Session on \"{}\" — {}/{} recalled.",
        set.name, snapshot.recalled_count, snapshot.total_points
    );

    match engine.opening_message().await {
        Ok(text) => println!("\ntutor: {text}"),
        Err(e) => eprintln!("! opening failed: {e}"),
    }
    let mut offered_tangent: Option<(String, String)> = None;
    render_events(&mut events, &mut offered_tangent);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("\n> ");
        std::io::stdout().flush().ok();
        let Some(line) = lines.next_line().await? else {
            // stdin closed: keep progress.
            engine.pause().await.ok();
            break;
        };
        let line = line.trim();
        match line {
            "" => continue,
            "/pause" => {
                engine.pause().await?;
                println!("Paused. `minne study {set_name:?}` resumes.");
                break;
            }
            "/quit" => {
                engine.abandon().await?;
                println!("Abandoned.");
                break;
            }
            "/done" => {
                engine.leave_session().await?;
                println!("Session complete.");
                break;
            }
            "/decline" => {
                engine.decline_rabbithole().await?;
                offered_tangent = None;
                println!("(tangent declined)");
            }
            "/enter" => match offered_tangent.clone() {
                Some((topic, event_id)) => match engine.enter_rabbithole(&topic, &event_id).await {
                    Ok(opening) => println!("\nguide: {opening}"),
                    Err(e) => eprintln!("! {e}"),
                },
                None => println!("(no tangent on offer)"),
            },
            "/back" => match engine.exit_rabbithole().await {
                Ok(()) => println!("(back to review)"),
                Err(e) => eprintln!("! {e}"),
            },
            text => match engine.process_user_message(text).await {
                Ok(outcome) => {
                    println!(
                        "\ntutor: {}\n[{}/{} recalled]",
                        outcome.response_text, outcome.recalled_count, outcome.total_points
                    );
                }
                Err(e @ EngineError::Llm { .. }) => eprintln!("! {e} (your message was kept)"),
                Err(e) => return Err(e.into()),
            },
        }
        render_events(&mut events, &mut offered_tangent);
    }
    Ok(())
}

/// Drain pending session events into terse status lines.
fn render_events(
    events: &mut mpsc::UnboundedReceiver<EventEnvelope>,
    offered_tangent: &mut Option<(String, String)>,
) {
    while let Ok(envelope) = events.try_recv() {
        match envelope.event {
            SessionEvent::PointRecalled { .. } => println!("  ✓ point recalled"),
            SessionEvent::SessionCompleteOverlay { recalled_count, total_points, .. } => {
                println!(
                    "  ★ all {recalled_count}/{total_points} points recalled — /done to finish, or keep talking"
                );
            }
            SessionEvent::RabbitholeDetected { topic, event_id } => {
                println!("  ? tangent noticed: \"{topic}\" — /enter to explore, /decline to pass");
                *offered_tangent = Some((topic, event_id));
            }
            SessionEvent::RabbitholeExited { topic, points_recalled_during, .. } => {
                println!("  ⤴ left \"{topic}\" ({points_recalled_during} recalled on the way)");
            }
            _ => {}
        }
    }
}

// ── Read-only commands ────────────────────────────────────────────────────────

async fn list_sets(store: Arc<JsonStore>) -> anyhow::Result<()> {
    let now = minne_core::now_ms();
    let sets = store.list_sets().await?;
    if sets.is_empty() {
        println!("No recall sets. Load one with `minne seed <file>`.");
        return Ok(());
    }
    for set in sets {
        let points = store.find_points_by_set(&set.id).await?;
        let due = store.find_due_points(&set.id, now).await?;
        println!(
            "{:24}  {:3} points  {:3} due  {:?}",
            set.name,
            points.len(),
            due.len(),
            set.status
        );
    }
    Ok(())
}

async fn list_sessions(store: Arc<JsonStore>, set_name: Option<&str>) -> anyhow::Result<()> {
    let sessions = match set_name {
        Some(name) => {
            let set = store
                .find_set_by_name(name)
                .await?
                .with_context(|| format!("no recall set named {name:?}"))?;
            store.find_sessions_by_set(&set.id).await?
        }
        None => store.list_sessions().await?,
    };
    for session in sessions.iter().rev() {
        println!(
            "{}  {}  {:?}  {}/{} recalled",
            &session.id[..8.min(session.id.len())],
            fmt_time(session.started_at_ms),
            session.status,
            session.recalled_point_ids.len(),
            session.target_point_ids.len(),
        );
    }
    if sessions.is_empty() {
        println!("No sessions yet.");
    }
    Ok(())
}

async fn set_stats(store: Arc<JsonStore>, set_name: &str) -> anyhow::Result<()> {
    let set = store
        .find_set_by_name(set_name)
        .await?
        .with_context(|| format!("no recall set named {set_name:?}"))?;
    let points = store.find_points_by_set(&set.id).await?;
    if points.is_empty() {
        println!("\"{}\" has no points.", set.name);
        return Ok(());
    }
    let now = minne_core::now_ms();
    let due = points.iter().filter(|p| p.fsrs.due_ms <= now).count();
    let stage = |s: MemoryStage| points.iter().filter(|p| p.fsrs.stage == s).count();
    let avg_difficulty =
        points.iter().map(|p| p.fsrs.difficulty).sum::<f64>() / points.len() as f64;
    let avg_stability = points.iter().map(|p| p.fsrs.stability).sum::<f64>() / points.len() as f64;
    let attempts: usize = points.iter().map(|p| p.history.len()).sum();
    let successes: usize = points
        .iter()
        .flat_map(|p| &p.history)
        .filter(|a| a.success)
        .count();

    println!("{} — {}", set.name, set.description);
    println!("  points:      {}", points.len());
    println!("  due now:     {due}");
    println!(
        "  stages:      new {} / learning {} / review {} / relearning {}",
        stage(MemoryStage::New),
        stage(MemoryStage::Learning),
        stage(MemoryStage::Review),
        stage(MemoryStage::Relearning),
    );
    println!("  difficulty:  {avg_difficulty:.2} avg");
    println!("  stability:   {avg_stability:.2} days avg");
    println!("  attempts:    {attempts} total, {successes} successful");
    Ok(())
}

async fn replay_session(store: Arc<JsonStore>, session_prefix: &str) -> anyhow::Result<()> {
    let sessions = store.list_sessions().await?;
    let session = sessions
        .iter()
        .find(|s| s.id.starts_with(session_prefix))
        .with_context(|| format!("no session with id prefix {session_prefix:?}"))?;
    println!(
        "session {}  {:?}  started {}",
        session.id,
        session.status,
        fmt_time(session.started_at_ms)
    );
    for message in store.find_messages(&session.id).await? {
        let role = match message.role {
            minne_store::MessageRole::User => "you",
            minne_store::MessageRole::Assistant => "tutor",
            minne_store::MessageRole::System => "system",
        };
        println!("[{}] {role}: {}", fmt_time(message.timestamp_ms), message.content);
    }
    for event in store.find_rabbitholes(&session.id).await? {
        println!(
            "— rabbit hole \"{}\" ({:?}, depth {}, {} turns)",
            event.topic,
            event.status,
            event.depth,
            event.conversation.len()
        );
    }
    Ok(())
}

async fn export(store: Arc<JsonStore>, what: ExportTarget) -> anyhow::Result<()> {
    let value = match what {
        ExportTarget::Session { id } => {
            let sessions = store.list_sessions().await?;
            let session = sessions
                .iter()
                .find(|s| s.id.starts_with(&id))
                .with_context(|| format!("no session with id prefix {id:?}"))?;
            serde_json::json!({
                "session": session,
                "messages": store.find_messages(&session.id).await?,
                "outcomes": store.find_outcomes(&session.id).await?,
                "rabbitholes": store.find_rabbitholes(&session.id).await?,
                "metrics": store.find_metrics(&session.id).await?,
            })
        }
        ExportTarget::Set { name } => {
            let set = store
                .find_set_by_name(&name)
                .await?
                .with_context(|| format!("no recall set named {name:?}"))?;
            serde_json::json!({
                "set": set,
                "points": store.find_points_by_set(&set.id).await?,
            })
        }
        ExportTarget::Analytics => {
            let mut rows = Vec::new();
            for session in store.list_sessions().await? {
                if let Some(metrics) = store.find_metrics(&session.id).await? {
                    rows.push(metrics);
                }
            }
            serde_json::json!({ "sessions": rows })
        }
    };
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}

async fn seed(store: Arc<JsonStore>, file: &std::path::Path) -> anyhow::Result<()> {
    let text = std::fs::read_to_string(file)
        .with_context(|| format!("reading {}", file.display()))?;
    let parsed = minne_store::seed::parse(&text)?;
    let report = minne_store::seed::load(store.as_ref(), parsed, minne_core::now_ms()).await?;
    println!(
        "{} set(s) created, {} skipped, {} point(s) created.",
        report.sets_created, report.sets_skipped, report.points_created
    );
    Ok(())
}

fn fmt_time(ms: i64) -> String {
    chrono::DateTime::from_timestamp_millis(ms)
        .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| ms.to_string())
}
