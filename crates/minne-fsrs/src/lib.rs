// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! The FSRS scheduling kernel: maps a memory state and a review rating to a
//! new memory state with an updated due date.
//!
//! The engine treats this crate as a black box behind two entry points:
//! [`Scheduler::initial_state`] for newly authored points and
//! [`Scheduler::schedule`] after every graded recall attempt.

use serde::{Deserialize, Serialize};

mod weights;

pub use weights::DEFAULT_WEIGHTS;

const MS_PER_MINUTE: i64 = 60 * 1000;
const MS_PER_DAY: i64 = 24 * 60 * MS_PER_MINUTE;

/// Review grade for one recall attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Rating {
    Forgot,
    Hard,
    Good,
    Easy,
}

#[derive(Debug, thiserror::Error)]
#[error("unrecognized rating: {0:?}")]
pub struct UnknownRating(String);

impl Rating {
    pub fn as_str(&self) -> &'static str {
        match self {
            Rating::Forgot => "forgot",
            Rating::Hard => "hard",
            Rating::Good => "good",
            Rating::Easy => "easy",
        }
    }

    /// Numeric grade used by the scheduling formulas (1 = forgot .. 4 = easy).
    fn grade(&self) -> f64 {
        match self {
            Rating::Forgot => 1.0,
            Rating::Hard => 2.0,
            Rating::Good => 3.0,
            Rating::Easy => 4.0,
        }
    }
}

impl std::str::FromStr for Rating {
    type Err = UnknownRating;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "forgot" | "again" => Ok(Rating::Forgot),
            "hard" => Ok(Rating::Hard),
            "good" => Ok(Rating::Good),
            "easy" => Ok(Rating::Easy),
            other => Err(UnknownRating(other.to_string())),
        }
    }
}

impl std::fmt::Display for Rating {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a point sits in the learning pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemoryStage {
    New,
    Learning,
    Review,
    Relearning,
}

/// The scheduler state carried by every recall point.
///
/// All timestamps are integer milliseconds since the Unix epoch, matching the
/// persisted representation in the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FsrsState {
    pub difficulty: f64,
    pub stability: f64,
    pub due_ms: i64,
    pub last_review_ms: Option<i64>,
    pub reps: u32,
    pub lapses: u32,
    pub stage: MemoryStage,
}

/// FSRS scheduler parameterized by a weight vector and retention target.
#[derive(Debug, Clone)]
pub struct Scheduler {
    weights: [f64; 17],
    desired_retention: f64,
    maximum_interval_days: f64,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new(0.9, 365.0)
    }
}

impl Scheduler {
    pub fn new(desired_retention: f64, maximum_interval_days: f64) -> Self {
        Self {
            weights: DEFAULT_WEIGHTS,
            desired_retention: desired_retention.clamp(0.7, 0.99),
            maximum_interval_days: maximum_interval_days.max(1.0),
        }
    }

    /// State for a point that has never been reviewed: due immediately.
    pub fn initial_state(&self, now_ms: i64) -> FsrsState {
        FsrsState {
            difficulty: 5.0,
            stability: 1.0,
            due_ms: now_ms,
            last_review_ms: None,
            reps: 0,
            lapses: 0,
            stage: MemoryStage::New,
        }
    }

    /// Apply one graded review to `state` and return the successor state.
    ///
    /// `Forgot` increments the lapse counter and drops the point into
    /// relearning with a short-interval due date; every rating increments
    /// `reps` and stamps `last_review_ms = now_ms`.
    pub fn schedule(&self, state: &FsrsState, rating: Rating, now_ms: i64) -> FsrsState {
        let mut next = state.clone();
        next.reps = state.reps.saturating_add(1);
        next.last_review_ms = Some(now_ms);

        match state.stage {
            MemoryStage::New => self.schedule_first_review(&mut next, rating, now_ms),
            MemoryStage::Learning | MemoryStage::Relearning => {
                self.schedule_learning_step(state, &mut next, rating, now_ms)
            }
            MemoryStage::Review => self.schedule_review(state, &mut next, rating, now_ms),
        }
        next
    }

    fn schedule_first_review(&self, next: &mut FsrsState, rating: Rating, now_ms: i64) {
        let g = rating.grade();
        next.stability = self.initial_stability(rating);
        next.difficulty = self.initial_difficulty(g);
        match rating {
            Rating::Forgot => {
                next.lapses = next.lapses.saturating_add(1);
                next.stage = MemoryStage::Learning;
                next.due_ms = now_ms + 5 * MS_PER_MINUTE;
            }
            Rating::Hard => {
                next.stage = MemoryStage::Learning;
                next.due_ms = now_ms + 10 * MS_PER_MINUTE;
            }
            Rating::Good | Rating::Easy => {
                next.stage = MemoryStage::Review;
                next.due_ms = now_ms + self.interval_ms(next.stability);
            }
        }
    }

    fn schedule_learning_step(
        &self,
        prev: &FsrsState,
        next: &mut FsrsState,
        rating: Rating,
        now_ms: i64,
    ) {
        match rating {
            Rating::Forgot => {
                next.lapses = next.lapses.saturating_add(1);
                next.stability = (prev.stability * 0.5).max(0.1);
                next.due_ms = now_ms + 5 * MS_PER_MINUTE;
            }
            Rating::Hard => {
                next.due_ms = now_ms + 10 * MS_PER_MINUTE;
            }
            Rating::Good | Rating::Easy => {
                // Graduate. Stability was seeded at first review; an easy
                // graduation earns a small multiplier.
                if rating == Rating::Easy {
                    next.stability = prev.stability * (1.0 + self.weights[16] * 0.1);
                }
                next.stage = MemoryStage::Review;
                next.due_ms = now_ms + self.interval_ms(next.stability);
            }
        }
    }

    fn schedule_review(
        &self,
        prev: &FsrsState,
        next: &mut FsrsState,
        rating: Rating,
        now_ms: i64,
    ) {
        let elapsed_days = prev
            .last_review_ms
            .map(|last| ((now_ms - last) as f64 / MS_PER_DAY as f64).max(0.0))
            .unwrap_or(0.0);
        let retrievability = Self::forgetting_curve(elapsed_days, prev.stability);
        let g = rating.grade();

        next.difficulty = self.next_difficulty(prev.difficulty, g);
        match rating {
            Rating::Forgot => {
                next.lapses = next.lapses.saturating_add(1);
                next.stability = self.forget_stability(prev, retrievability);
                next.stage = MemoryStage::Relearning;
                next.due_ms = now_ms + 10 * MS_PER_MINUTE;
            }
            _ => {
                next.stability = self.recall_stability(prev, retrievability, rating);
                next.due_ms = now_ms + self.interval_ms(next.stability);
            }
        }
    }

    /// Probability of recall after `elapsed_days` at stability `s`.
    fn forgetting_curve(elapsed_days: f64, s: f64) -> f64 {
        let s = s.max(0.01);
        (1.0 + (19.0 / 81.0) * elapsed_days / s).powf(-0.5)
    }

    fn initial_stability(&self, rating: Rating) -> f64 {
        let idx = (rating.grade() as usize) - 1;
        self.weights[idx].max(0.1)
    }

    fn initial_difficulty(&self, g: f64) -> f64 {
        (self.weights[4] - (g - 3.0) * self.weights[5]).clamp(1.0, 10.0)
    }

    /// Mean-reverting difficulty update.
    fn next_difficulty(&self, d: f64, g: f64) -> f64 {
        let target = self.initial_difficulty(3.0);
        let shifted = d - self.weights[6] * (g - 3.0);
        (self.weights[7] * target + (1.0 - self.weights[7]) * shifted).clamp(1.0, 10.0)
    }

    fn recall_stability(&self, prev: &FsrsState, r: f64, rating: Rating) -> f64 {
        let w = &self.weights;
        let hard_penalty = if rating == Rating::Hard { w[15] } else { 1.0 };
        let easy_bonus = if rating == Rating::Easy { w[16] } else { 1.0 };
        let growth = w[8].exp()
            * (11.0 - prev.difficulty)
            * prev.stability.max(0.1).powf(-w[9])
            * ((w[10] * (1.0 - r)).exp() - 1.0)
            * hard_penalty
            * easy_bonus;
        (prev.stability * (growth + 1.0)).max(0.1)
    }

    fn forget_stability(&self, prev: &FsrsState, r: f64) -> f64 {
        let w = &self.weights;
        let s = w[11]
            * prev.difficulty.powf(-w[12])
            * ((prev.stability + 1.0).powf(w[13]) - 1.0)
            * (w[14] * (1.0 - r)).exp();
        s.clamp(0.1, prev.stability)
    }

    /// Interval (in ms) at which retrievability decays to the retention target.
    fn interval_ms(&self, stability: f64) -> i64 {
        let r = self.desired_retention;
        let days = stability * (81.0 / 19.0) * (r.powf(-2.0) - 1.0);
        let days = days.clamp(1.0, self.maximum_interval_days);
        (days * MS_PER_DAY as f64) as i64
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
