// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Tolerant extraction of JSON verdicts from model text.
//!
//! Evaluator and detector replies are requested as JSON but arrive as free
//! text: wrapped in markdown fences, prefixed with prose, or with loosely
//! typed fields. Everything here degrades toward the safe default (a
//! missing or malformed field reads as "no"), since a false positive
//! (spurious recall, spurious tangent) is worse than silence.

use serde_json::Value;
use tracing::warn;

/// Pull the first JSON object out of a model reply.
///
/// Tries, in order: the whole text, the contents of a fenced code block, and
/// the first balanced `{…}` span. Returns `None` when nothing parses; the
/// caller substitutes its safe default and keeps the raw text as reasoning.
pub fn extract_json(text: &str) -> Option<Value> {
    let trimmed = text.trim();
    if let Ok(v) = serde_json::from_str::<Value>(trimmed) {
        if v.is_object() {
            return Some(v);
        }
    }

    if let Some(inner) = fenced_block(trimmed) {
        if let Ok(v) = serde_json::from_str::<Value>(inner.trim()) {
            if v.is_object() {
                return Some(v);
            }
        }
    }

    if let Some(span) = first_balanced_object(trimmed) {
        match serde_json::from_str::<Value>(span) {
            Ok(v) if v.is_object() => return Some(v),
            _ => {}
        }
    }

    warn!(len = text.len(), "no JSON object found in model reply");
    None
}

/// Contents of the first ``` fenced block, tolerating a language tag.
fn fenced_block(text: &str) -> Option<&str> {
    let start = text.find("```")?;
    let after_fence = &text[start + 3..];
    // Skip an optional language tag up to the first newline.
    let body_start = after_fence.find('\n')? + 1;
    let body = &after_fence[body_start..];
    let end = body.find("```")?;
    Some(&body[..end])
}

/// The first balanced `{…}` span, tracking strings and escapes so braces in
/// string values don't terminate the scan early.
fn first_balanced_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let bytes = text.as_bytes();
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (i, &b) in bytes.iter().enumerate().skip(start) {
        if in_string {
            match b {
                _ if escaped => escaped = false,
                b'\\' => escaped = true,
                b'"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..=i]);
                }
            }
            _ => {}
        }
    }
    None
}

/// Read a confidence field, clamped into [0, 1]. Values in (1, 100] are
/// treated as percentages; anything non-numeric reads as 0.
pub fn confidence(value: &Value, key: &str) -> f64 {
    let raw = match &value[key] {
        Value::Number(n) => n.as_f64().unwrap_or(0.0),
        Value::String(s) => s.trim().trim_end_matches('%').parse().unwrap_or(0.0),
        _ => 0.0,
    };
    let scaled = if raw > 1.0 && raw <= 100.0 { raw / 100.0 } else { raw };
    scaled.clamp(0.0, 1.0)
}

/// Read a boolean field. Anything that is not a JSON boolean reads as
/// `false`, the safe default for both "recalled" and "is a tangent".
pub fn boolean(value: &Value, key: &str) -> bool {
    matches!(&value[key], Value::Bool(true))
}

/// Read a string-array field, dropping non-string elements.
pub fn string_array(value: &Value, key: &str) -> Vec<String> {
    match &value[key] {
        Value::Array(items) => items
            .iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect(),
        _ => Vec::new(),
    }
}

/// Read an optional non-empty string field.
pub fn optional_string(value: &Value, key: &str) -> Option<String> {
    value[key]
        .as_str()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_bare_json() {
        let v = extract_json(r#"{"success": true}"#).unwrap();
        assert!(boolean(&v, "success"));
    }

    #[test]
    fn parses_fenced_json_with_language_tag() {
        let text = "Here is my verdict:\n```json\n{\"success\": true, \"confidence\": 0.8}\n```\nDone.";
        let v = extract_json(text).unwrap();
        assert!(boolean(&v, "success"));
        assert_eq!(confidence(&v, "confidence"), 0.8);
    }

    #[test]
    fn parses_object_embedded_in_prose() {
        let text = r#"Sure! The answer is {"is_rabbithole": true, "topic": "etymology"} as requested."#;
        let v = extract_json(text).unwrap();
        assert!(boolean(&v, "is_rabbithole"));
    }

    #[test]
    fn braces_inside_strings_do_not_truncate() {
        let text = r#"{"reasoning": "the set {a, b} was mentioned", "success": true}"#;
        let v = extract_json(text).unwrap();
        assert!(boolean(&v, "success"));
        assert!(optional_string(&v, "reasoning").unwrap().contains("{a, b}"));
    }

    #[test]
    fn garbage_yields_none() {
        assert!(extract_json("I could not decide.").is_none());
        assert!(extract_json("{not json").is_none());
        // A bare array is not a verdict object.
        assert!(extract_json("[1, 2, 3]").is_none());
    }

    #[test]
    fn confidence_clamps_and_scales() {
        assert_eq!(confidence(&json!({"c": 0.5}), "c"), 0.5);
        assert_eq!(confidence(&json!({"c": 1.5}), "c"), 0.015);
        assert_eq!(confidence(&json!({"c": 85}), "c"), 0.85);
        assert_eq!(confidence(&json!({"c": 250}), "c"), 1.0);
        assert_eq!(confidence(&json!({"c": -3}), "c"), 0.0);
        assert_eq!(confidence(&json!({"c": "72%"}), "c"), 0.72);
        assert_eq!(confidence(&json!({"c": null}), "c"), 0.0);
        assert_eq!(confidence(&json!({}), "c"), 0.0);
    }

    #[test]
    fn non_boolean_booleans_read_false() {
        assert!(!boolean(&json!({"b": "true"}), "b"));
        assert!(!boolean(&json!({"b": 1}), "b"));
        assert!(!boolean(&json!({"b": null}), "b"));
        assert!(!boolean(&json!({}), "b"));
        assert!(boolean(&json!({"b": true}), "b"));
    }

    #[test]
    fn string_arrays_drop_non_strings() {
        let v = json!({"ids": ["a", 1, null, "b", {"x": 1}]});
        assert_eq!(string_array(&v, "ids"), vec!["a".to_string(), "b".to_string()]);
        assert!(string_array(&json!({"ids": "not-an-array"}), "ids").is_empty());
    }

    #[test]
    fn optional_string_rejects_empty() {
        assert_eq!(optional_string(&json!({"s": "  "}), "s"), None);
        assert_eq!(optional_string(&json!({"s": 7}), "s"), None);
        assert_eq!(
            optional_string(&json!({"s": " ok "}), "s").as_deref(),
            Some("ok")
        );
    }
}
