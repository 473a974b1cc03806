// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Mapping from evaluation results to FSRS ratings.
//!
//! The mapping is deterministic so the same evaluation always produces the
//! same schedule. An evaluator-suggested rating is honored only when it
//! parses as a known rating; anything else falls back to confidence bands.

use minne_fsrs::Rating;

/// Primary rating table: success and confidence to rating.
///
/// | success | confidence | rating |
/// |---------|------------|--------|
/// | true    | ≥ 0.9      | easy   |
/// | true    | 0.7 – 0.9  | good   |
/// | true    | < 0.7      | hard   |
/// | false   | ≥ 0.7      | forgot |
/// | false   | < 0.7      | hard   |
pub fn derive_rating(success: bool, confidence: f64) -> Rating {
    if success {
        if confidence >= 0.9 {
            Rating::Easy
        } else if confidence >= 0.7 {
            Rating::Good
        } else {
            Rating::Hard
        }
    } else if confidence >= 0.7 {
        Rating::Forgot
    } else {
        Rating::Hard
    }
}

/// Confidence-band fallback used when a suggested rating is unrecognized:
/// 0.85 → easy, 0.6 → good, 0.3 → hard, else forgot.
fn fallback_rating(confidence: f64) -> Rating {
    if confidence >= 0.85 {
        Rating::Easy
    } else if confidence >= 0.6 {
        Rating::Good
    } else if confidence >= 0.3 {
        Rating::Hard
    } else {
        Rating::Forgot
    }
}

/// Resolve the rating for one evaluation, honoring a recognized suggestion.
pub fn resolve_rating(suggested: Option<&str>, success: bool, confidence: f64) -> Rating {
    match suggested {
        None => derive_rating(success, confidence),
        Some(s) => s.parse().unwrap_or_else(|_| fallback_rating(confidence)),
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_bands_follow_the_table() {
        assert_eq!(derive_rating(true, 0.95), Rating::Easy);
        assert_eq!(derive_rating(true, 0.9), Rating::Easy);
        assert_eq!(derive_rating(true, 0.8), Rating::Good);
        assert_eq!(derive_rating(true, 0.7), Rating::Good);
        assert_eq!(derive_rating(true, 0.65), Rating::Hard);
    }

    #[test]
    fn failure_bands_follow_the_table() {
        assert_eq!(derive_rating(false, 0.9), Rating::Forgot);
        assert_eq!(derive_rating(false, 0.7), Rating::Forgot);
        assert_eq!(derive_rating(false, 0.5), Rating::Hard);
        assert_eq!(derive_rating(false, 0.0), Rating::Hard);
    }

    #[test]
    fn recognized_suggestion_wins() {
        assert_eq!(resolve_rating(Some("easy"), false, 0.1), Rating::Easy);
        assert_eq!(resolve_rating(Some("FORGOT"), true, 0.99), Rating::Forgot);
    }

    #[test]
    fn unrecognized_suggestion_falls_back_to_bands() {
        assert_eq!(resolve_rating(Some("stellar"), true, 0.9), Rating::Easy);
        assert_eq!(resolve_rating(Some("meh"), true, 0.7), Rating::Good);
        assert_eq!(resolve_rating(Some("??"), false, 0.4), Rating::Hard);
        assert_eq!(resolve_rating(Some(""), false, 0.1), Rating::Forgot);
    }

    #[test]
    fn no_suggestion_uses_primary_table() {
        assert_eq!(resolve_rating(None, true, 0.92), Rating::Easy);
        assert_eq!(resolve_rating(None, true, 0.81), Rating::Good);
        assert_eq!(resolve_rating(None, false, 0.42), Rating::Hard);
    }
}
