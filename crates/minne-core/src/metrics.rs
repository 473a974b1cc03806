// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Per-session metrics collection and finalization.
//!
//! The collector is the only consumer of these counters; recall outcomes are
//! persisted once, by the engine's commit pipeline, and merely counted here.

use minne_model::{catalog, Usage};
use minne_store::{MessageRole, SessionMetrics};

#[derive(Debug, Clone, Copy)]
struct MessageSample {
    role: MessageRole,
    timestamp_ms: i64,
    chars: usize,
}

#[derive(Debug, Clone, Copy)]
struct RabbitholeSample {
    depth: u8,
    duration_ms: i64,
}

/// Accumulates timing, token, recall, and tangent statistics for one session
/// and condenses them into a [`SessionMetrics`] row on finalize.
pub struct MetricsCollector {
    session_id: String,
    model_id: String,
    started_at_ms: i64,
    resumed: bool,
    pause_threshold_ms: i64,
    messages: Vec<MessageSample>,
    input_tokens: u64,
    output_tokens: u64,
    outcomes: Vec<(bool, f64)>,
    rabbitholes: Vec<RabbitholeSample>,
}

impl MetricsCollector {
    /// A resumed session starts fresh: prior messages and tokens are not
    /// re-analyzed, so resumed sessions undercount. The `resumed` flag is
    /// carried into the metrics row to mark that limitation.
    pub fn new(
        session_id: impl Into<String>,
        model_id: impl Into<String>,
        started_at_ms: i64,
        resumed: bool,
        pause_threshold_ms: i64,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            model_id: model_id.into(),
            started_at_ms,
            resumed,
            pause_threshold_ms,
            messages: Vec::new(),
            input_tokens: 0,
            output_tokens: 0,
            outcomes: Vec::new(),
            rabbitholes: Vec::new(),
        }
    }

    pub fn record_message(&mut self, role: MessageRole, timestamp_ms: i64, chars: usize) {
        self.messages.push(MessageSample { role, timestamp_ms, chars });
    }

    pub fn record_usage(&mut self, usage: Usage) {
        self.input_tokens += usage.input_tokens as u64;
        self.output_tokens += usage.output_tokens as u64;
    }

    pub fn record_outcome(&mut self, success: bool, confidence: f64) {
        self.outcomes.push((success, confidence));
    }

    pub fn record_rabbithole(&mut self, depth: u8, duration_ms: i64) {
        self.rabbitholes.push(RabbitholeSample { depth, duration_ms });
    }

    pub fn finalize(&self, now_ms: i64) -> SessionMetrics {
        let user: Vec<&MessageSample> = self
            .messages
            .iter()
            .filter(|m| m.role == MessageRole::User)
            .collect();
        let assistant_count = self
            .messages
            .iter()
            .filter(|m| m.role == MessageRole::Assistant)
            .count();

        let attempted = self.outcomes.len() as u32;
        let successful = self.outcomes.iter().filter(|(s, _)| *s).count() as u32;
        let recall_rate = if attempted == 0 {
            0.0
        } else {
            successful as f64 / attempted as f64
        };
        let avg_confidence = if self.outcomes.is_empty() {
            0.0
        } else {
            self.outcomes.iter().map(|(_, c)| c).sum::<f64>() / self.outcomes.len() as f64
        };

        let user_lengths: Vec<f64> = user.iter().map(|m| m.chars as f64).collect();
        let user_gaps = self.response_gaps(MessageRole::User);
        let assistant_gaps = self.response_gaps(MessageRole::Assistant);

        let rabbithole_avg_depth = if self.rabbitholes.is_empty() {
            0.0
        } else {
            self.rabbitholes.iter().map(|r| r.depth as f64).sum::<f64>()
                / self.rabbitholes.len() as f64
        };

        SessionMetrics {
            id: minne_store::new_id(),
            session_id: self.session_id.clone(),
            started_at_ms: self.started_at_ms,
            ended_at_ms: now_ms,
            total_duration_ms: now_ms - self.started_at_ms,
            active_duration_ms: self.active_duration(),
            avg_user_response_ms: average(&user_gaps) as i64,
            avg_assistant_response_ms: average(&assistant_gaps) as i64,
            user_messages: user.len() as u32,
            assistant_messages: assistant_count as u32,
            total_messages: self.messages.len() as u32,
            recall_points_attempted: attempted,
            recall_points_successful: successful,
            recall_points_failed: attempted - successful,
            recall_rate,
            avg_recall_confidence: avg_confidence,
            rabbithole_count: self.rabbitholes.len() as u32,
            rabbithole_total_time_ms: self.rabbitholes.iter().map(|r| r.duration_ms).sum(),
            rabbithole_avg_depth,
            input_tokens: self.input_tokens,
            output_tokens: self.output_tokens,
            estimated_cost_usd: catalog::estimate_cost(
                &self.model_id,
                self.input_tokens,
                self.output_tokens,
            ),
            engagement_score: self.engagement_score(&user_gaps, &user_lengths, recall_rate),
            resumed: self.resumed,
            created_at_ms: now_ms,
        }
    }

    /// Sum of inter-message gaps below the pause threshold.
    fn active_duration(&self) -> i64 {
        self.messages
            .windows(2)
            .map(|w| w[1].timestamp_ms - w[0].timestamp_ms)
            .filter(|gap| *gap >= 0 && *gap < self.pause_threshold_ms)
            .sum()
    }

    /// Gaps between a message of `role` and the message before it (i.e. how
    /// long that party took to respond).
    fn response_gaps(&self, role: MessageRole) -> Vec<f64> {
        self.messages
            .windows(2)
            .filter(|w| w[1].role == role && w[0].role != role)
            .map(|w| (w[1].timestamp_ms - w[0].timestamp_ms) as f64)
            .filter(|gap| *gap >= 0.0)
            .collect()
    }

    /// Composite engagement 0–100: steady response times, natural variation
    /// in message length, and recall success.
    fn engagement_score(&self, user_gaps: &[f64], user_lengths: &[f64], recall_rate: f64) -> f64 {
        let regularity = 100.0 * (1.0 - coefficient_of_variation(user_gaps).clamp(0.0, 1.0));
        // A flat zero variance reads as bot-like, huge variance as
        // distraction; an in-between spread scores highest.
        let length_cv = coefficient_of_variation(user_lengths);
        let length_score = 100.0 * (1.0 - (length_cv - 0.4).abs().clamp(0.0, 1.0));
        let recall_score = 100.0 * recall_rate;

        (0.35 * regularity + 0.25 * length_score + 0.40 * recall_score).clamp(0.0, 100.0)
    }
}

fn average(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Standard deviation over mean; 0.5 (neutral) when under two samples or the
/// mean is zero.
fn coefficient_of_variation(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.5;
    }
    let mean = average(values);
    if mean == 0.0 {
        return 0.5;
    }
    let variance =
        values.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>() / values.len() as f64;
    variance.sqrt() / mean
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    const NOW: i64 = 1_700_000_000_000;
    const MINUTE: i64 = 60_000;

    fn collector() -> MetricsCollector {
        MetricsCollector::new("session", "mock-model", NOW, false, 5 * MINUTE)
    }

    #[test]
    fn counts_roles_exactly() {
        let mut c = collector();
        c.record_message(MessageRole::Assistant, NOW, 50);
        c.record_message(MessageRole::User, NOW + 1000, 20);
        c.record_message(MessageRole::Assistant, NOW + 2000, 60);
        c.record_message(MessageRole::User, NOW + 3000, 30);
        c.record_message(MessageRole::User, NOW + 4000, 10);
        let m = c.finalize(NOW + 5000);
        assert_eq!(m.user_messages, 3);
        assert_eq!(m.assistant_messages, 2);
        assert_eq!(m.total_messages, 5);
    }

    #[test]
    fn active_time_excludes_long_pauses() {
        let mut c = collector();
        c.record_message(MessageRole::Assistant, NOW, 10);
        c.record_message(MessageRole::User, NOW + MINUTE, 10);
        // 30-minute coffee break; not active time.
        c.record_message(MessageRole::Assistant, NOW + 31 * MINUTE, 10);
        c.record_message(MessageRole::User, NOW + 32 * MINUTE, 10);
        let m = c.finalize(NOW + 32 * MINUTE);
        assert_eq!(m.active_duration_ms, 2 * MINUTE);
        assert_eq!(m.total_duration_ms, 32 * MINUTE);
    }

    #[test]
    fn recall_stats_reflect_outcomes() {
        let mut c = collector();
        c.record_outcome(true, 0.9);
        c.record_outcome(true, 0.7);
        c.record_outcome(false, 0.4);
        let m = c.finalize(NOW + 1000);
        assert_eq!(m.recall_points_attempted, 3);
        assert_eq!(m.recall_points_successful, 2);
        assert_eq!(m.recall_points_failed, 1);
        assert!((m.recall_rate - 2.0 / 3.0).abs() < 1e-9);
        assert!((m.avg_recall_confidence - 2.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn token_totals_and_cost_accumulate() {
        let mut c = MetricsCollector::new("s", "claude-sonnet-4-5", NOW, false, 5 * MINUTE);
        c.record_usage(Usage { input_tokens: 1000, output_tokens: 500 });
        c.record_usage(Usage { input_tokens: 2000, output_tokens: 300 });
        let m = c.finalize(NOW);
        assert_eq!(m.input_tokens, 3000);
        assert_eq!(m.output_tokens, 800);
        // 3000 in @ $3/MTok + 800 out @ $15/MTok.
        let expected = (3000.0 * 3.0 + 800.0 * 15.0) / 1_000_000.0;
        assert!((m.estimated_cost_usd - expected).abs() < 1e-9);
    }

    #[test]
    fn rabbithole_aggregates() {
        let mut c = collector();
        c.record_rabbithole(1, 2 * MINUTE);
        c.record_rabbithole(3, 4 * MINUTE);
        let m = c.finalize(NOW);
        assert_eq!(m.rabbithole_count, 2);
        assert_eq!(m.rabbithole_total_time_ms, 6 * MINUTE);
        assert!((m.rabbithole_avg_depth - 2.0).abs() < 1e-9);
    }

    #[test]
    fn engagement_in_range_and_rewards_recall() {
        let mut steady = collector();
        for i in 0..4 {
            steady.record_message(MessageRole::Assistant, NOW + i * 2 * MINUTE, 80);
            steady.record_message(MessageRole::User, NOW + i * 2 * MINUTE + 30_000, 40 + (i as usize * 13) % 25);
        }
        steady.record_outcome(true, 0.9);
        steady.record_outcome(true, 0.85);
        let high = steady.finalize(NOW + 10 * MINUTE).engagement_score;

        let mut failing = collector();
        for i in 0..4 {
            failing.record_message(MessageRole::Assistant, NOW + i * 2 * MINUTE, 80);
            failing.record_message(MessageRole::User, NOW + i * 2 * MINUTE + 30_000, 40 + (i as usize * 13) % 25);
        }
        failing.record_outcome(false, 0.2);
        failing.record_outcome(false, 0.1);
        let low = failing.finalize(NOW + 10 * MINUTE).engagement_score;

        assert!((0.0..=100.0).contains(&high));
        assert!((0.0..=100.0).contains(&low));
        assert!(high > low, "successful recall should raise engagement");
    }

    #[test]
    fn resumed_flag_carries_through() {
        let c = MetricsCollector::new("s", "m", NOW, true, 5 * MINUTE);
        assert!(c.finalize(NOW).resumed);
    }

    #[test]
    fn empty_session_finalizes_cleanly() {
        let m = collector().finalize(NOW + 1000);
        assert_eq!(m.total_messages, 0);
        assert_eq!(m.recall_rate, 0.0);
        assert_eq!(m.avg_user_response_ms, 0);
        assert_eq!(m.estimated_cost_usd, 0.0);
    }
}
