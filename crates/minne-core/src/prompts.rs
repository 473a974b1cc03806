// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Prompt builders for the tutor, the evaluator, the tangent detector, and
//! the rabbit-hole agent.

use minne_store::{RecallPoint, RecallSet, SessionMessage};

/// Prefix for the ephemeral evaluator observation handed to the tutor.
/// Sent to the model only; never persisted and never replayed on resume.
pub const INTERNAL_OBSERVATION_PREFIX: &str =
    "[Internal observation — do not reference or quote directly to the user]: ";

mod guidelines {
    pub fn tutor_style() -> &'static str {
        "- Reply in 1-3 sentences. Never exceed three sentences.\n\
         - No praise, no exclamation marks, no meta-commentary about the session.\n\
         - Ask questions that let the learner retrieve the idea themselves; never state a fact they are supposed to recall.\n\
         - If the learner is stuck, narrow the question rather than revealing the answer."
    }

    pub fn tutor_observations() -> &'static str {
        "You may receive internal observations about the learner's progress. \
         Fold them into your next question naturally. Never mention, quote, \
         or allude to receiving them."
    }

    pub fn json_only() -> &'static str {
        "Respond with a single JSON object and nothing else. No markdown fences, no prose."
    }
}

/// System prompt for the Socratic tutor.
///
/// Rebuilt whenever the checklist changes so recalled points drop out of the
/// probe candidates. The set's supplementary guidelines are appended
/// verbatim when present.
pub fn build_tutor_prompt(
    set: &RecallSet,
    target_points: &[RecallPoint],
    unchecked: &[&RecallPoint],
    probe: Option<&RecallPoint>,
) -> String {
    let mut out = String::with_capacity(1024);
    out.push_str(&format!(
        "You are a recall-session facilitator for the study set \"{}\".\n\
         Set description: {}\n\n\
         The learner previously studied {} facts and is here to retrieve them \
         from memory through conversation.\n\n",
        set.name,
        set.description,
        target_points.len(),
    ));

    if unchecked.is_empty() {
        out.push_str("Every fact has been recalled. Keep the conversation open until the learner leaves.\n");
    } else {
        out.push_str("Facts not yet recalled (do not reveal these):\n");
        for point in unchecked {
            out.push_str(&format!("- {}", point.content));
            if !point.context.is_empty() {
                out.push_str(&format!(" (background: {})", point.context));
            }
            out.push('\n');
        }
    }

    if let Some(probe) = probe {
        out.push_str(&format!(
            "\nSteer the conversation toward this fact next, without stating it:\n{}\n",
            probe.content
        ));
    }

    out.push_str("\nGuidelines:\n");
    out.push_str(guidelines::tutor_style());
    out.push('\n');
    out.push_str(guidelines::tutor_observations());

    if let Some(extra) = set.discussion_prompt.as_deref().filter(|s| !s.is_empty()) {
        out.push_str("\n\nSet-specific guidelines:\n");
        out.push_str(extra);
    }
    out
}

/// Context handed to the evaluator alongside the point.
#[derive(Debug, Clone, Default)]
pub struct EvaluationContext {
    pub attempt_number: u32,
    pub previous_successes: u32,
    /// Active tangent topic, when evaluating inside a rabbit hole.
    pub topic: Option<String>,
}

/// System prompt for the per-point recall evaluator.
pub fn build_evaluator_prompt() -> String {
    format!(
        "You grade whether a learner has demonstrated recall of one specific \
         fact in a study conversation. Judge only what the learner wrote, not \
         what the tutor said. Paraphrases count; the learner does not need \
         the exact wording. Mentioning the general area without the substance \
         of the fact does not count.\n\n\
         Return JSON: {{\"success\": bool, \"confidence\": number 0-1, \
         \"reasoning\": string, \"key_demonstrated_concepts\": [string], \
         \"missed_concepts\": [string], \"suggested_rating\": \
         \"forgot\"|\"hard\"|\"good\"|\"easy\" or null}}.\n{}",
        guidelines::json_only()
    )
}

/// User message for one evaluation call: the fact plus the transcript.
pub fn build_evaluation_request(
    point: &RecallPoint,
    history: &[SessionMessage],
    ctx: &EvaluationContext,
) -> String {
    let mut out = String::with_capacity(1024);
    out.push_str(&format!("Fact to check:\n{}\n", point.content));
    if !point.context.is_empty() {
        out.push_str(&format!("Background: {}\n", point.context));
    }
    out.push_str(&format!(
        "Attempt number: {}. Previous successful recalls this point: {}.\n",
        ctx.attempt_number, ctx.previous_successes
    ));
    if let Some(topic) = &ctx.topic {
        out.push_str(&format!(
            "The conversation is currently on a tangent about: {topic}\n"
        ));
    }
    out.push_str("\nConversation so far:\n");
    out.push_str(&format_transcript(history));
    out
}

/// System prompt for the tangent detector.
pub fn build_detector_prompt(known_topics: &[String]) -> String {
    let mut out = format!(
        "You watch a study conversation for rabbit holes: tangents where the \
         learner pursues a topic beside the facts under review. Genuine \
         curiosity about an adjacent topic is a rabbit hole; a clarifying \
         question about the current fact is not.\n\n\
         Return JSON: {{\"is_rabbithole\": bool, \"topic\": string or null, \
         \"depth\": 1|2|3, \"related_to_current_point\": bool, \
         \"related_recall_point_ids\": [string], \"confidence\": number 0-1, \
         \"reasoning\": string}}.\n\
         Depth reflects how long the tangent has run: 1 for 1-2 exchanges, \
         2 for 3-5, 3 for 6 or more.\n{}",
        guidelines::json_only()
    );
    if !known_topics.is_empty() {
        out.push_str(&format!(
            "\nTangents already recorded this session (do not report them again): {}",
            known_topics.join(", ")
        ));
    }
    out
}

/// User message for one detection call.
pub fn build_detection_request(
    window: &[SessionMessage],
    probe: Option<&RecallPoint>,
    target_points: &[RecallPoint],
) -> String {
    let mut out = String::with_capacity(1024);
    out.push_str("Facts under review:\n");
    for p in target_points {
        out.push_str(&format!("- [{}] {}\n", p.id, p.content));
    }
    if let Some(probe) = probe {
        out.push_str(&format!("\nCurrent probe target: {}\n", probe.content));
    }
    out.push_str("\nRecent conversation:\n");
    out.push_str(&format_transcript(window));
    out
}

/// System prompt for return detection after a recorded tangent.
pub fn build_return_prompt(topic: &str) -> String {
    format!(
        "A study conversation wandered into a tangent about \"{topic}\". \
         Decide whether the conversation has since returned to reviewing the \
         study material.\n\n\
         Return JSON: {{\"has_returned\": bool, \"confidence\": number 0-1, \
         \"reasoning\": string}}.\n{}",
        guidelines::json_only()
    )
}

/// User message for one return-detection call.
pub fn build_return_request(window: &[SessionMessage], probe: Option<&RecallPoint>) -> String {
    let mut out = String::new();
    if let Some(probe) = probe {
        out.push_str(&format!("Current probe target: {}\n\n", probe.content));
    }
    out.push_str("Recent conversation:\n");
    out.push_str(&format_transcript(window));
    out
}

/// System prompt for the dedicated rabbit-hole agent.
pub fn build_rabbithole_prompt(topic: &str, set_name: &str, set_description: &str) -> String {
    format!(
        "You are an enthusiastic guide exploring \"{topic}\" with a learner \
         who is studying \"{set_name}\" ({set_description}). Going deep on \
         the tangent is the point, but keep one thread tied back to the \
         study material so the detour reinforces it. Reply in at most one \
         short paragraph. When the learner seems ready, offer a natural exit \
         back to the review."
    )
}

fn format_transcript(messages: &[SessionMessage]) -> String {
    let mut out = String::new();
    for m in messages {
        let role = match m.role {
            minne_store::MessageRole::User => "learner",
            minne_store::MessageRole::Assistant => "tutor",
            minne_store::MessageRole::System => continue,
        };
        out.push_str(&format!("{role}: {}\n", m.content));
    }
    out
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use minne_fsrs::Scheduler;
    use minne_store::MessageRole;

    const NOW: i64 = 1_700_000_000_000;

    fn set() -> RecallSet {
        let mut s = RecallSet::new("Swedish", "Everyday vocabulary", NOW);
        s.discussion_prompt = Some("Prefer example sentences.".into());
        s
    }

    fn point(content: &str) -> RecallPoint {
        RecallPoint::new(
            "set",
            content,
            "",
            Scheduler::default().initial_state(NOW),
            NOW,
        )
    }

    #[test]
    fn tutor_prompt_lists_only_unchecked_points() {
        let s = set();
        let targets = vec![point("tack means thanks"), point("hej means hello")];
        let unchecked = vec![&targets[1]];
        let prompt = build_tutor_prompt(&s, &targets, &unchecked, Some(&targets[1]));
        assert!(prompt.contains("hej means hello"));
        assert!(!prompt.contains("- tack means thanks"));
        assert!(prompt.contains("Steer the conversation toward"));
    }

    #[test]
    fn tutor_prompt_appends_discussion_prompt_verbatim() {
        let s = set();
        let prompt = build_tutor_prompt(&s, &[], &[], None);
        assert!(prompt.contains("Prefer example sentences."));
    }

    #[test]
    fn tutor_prompt_handles_complete_checklist() {
        let mut s = set();
        s.discussion_prompt = None;
        let prompt = build_tutor_prompt(&s, &[], &[], None);
        assert!(prompt.contains("Every fact has been recalled"));
        assert!(!prompt.contains("Set-specific guidelines"));
    }

    #[test]
    fn transcript_skips_system_messages() {
        let messages = vec![
            SessionMessage::new("s", MessageRole::System, "hidden", NOW),
            SessionMessage::new("s", MessageRole::User, "visible", NOW + 1),
        ];
        let t = format_transcript(&messages);
        assert!(!t.contains("hidden"));
        assert!(t.contains("learner: visible"));
    }

    #[test]
    fn detector_prompt_mentions_known_topics() {
        let prompt = build_detector_prompt(&["etymology".into(), "runes".into()]);
        assert!(prompt.contains("etymology, runes"));
        let bare = build_detector_prompt(&[]);
        assert!(!bare.contains("already recorded"));
    }

    #[test]
    fn evaluation_request_carries_attempt_context() {
        let p = point("tack means thanks");
        let ctx = EvaluationContext { attempt_number: 3, previous_successes: 1, topic: None };
        let req = build_evaluation_request(&p, &[], &ctx);
        assert!(req.contains("Attempt number: 3"));
        assert!(req.contains("tack means thanks"));
    }
}
