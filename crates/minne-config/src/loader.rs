// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::{Path, PathBuf};

use anyhow::Context;
use tracing::debug;

use crate::Config;

/// Ordered list of config file locations searched from lowest to highest
/// priority. Later files override earlier ones.
fn config_search_paths() -> Vec<PathBuf> {
    let mut paths = Vec::new();
    let mut push_pair = |dir: Option<PathBuf>, stem: &str| {
        if let Some(dir) = dir {
            paths.push(dir.join(format!("{stem}.yaml")));
            paths.push(dir.join(format!("{stem}.yml")));
        }
    };

    // 1. System-wide default
    push_pair(Some(PathBuf::from("/etc/minne")), "config");

    // 2. XDG / home
    push_pair(dirs::home_dir().map(|h| h.join(".config/minne")), "config");
    push_pair(dirs::config_dir().map(|c| c.join("minne")), "config");

    // 3. Workspace-local
    push_pair(Some(PathBuf::from(".minne")), "config");
    push_pair(Some(PathBuf::from(".")), ".minne");
    push_pair(Some(PathBuf::from(".")), "minne");

    paths
}

/// Load configuration by merging all discovered YAML files.
/// The `extra` argument may provide an explicit path (e.g. `--config` CLI flag).
pub fn load(extra: Option<&Path>) -> anyhow::Result<Config> {
    load_layers(&config_search_paths(), extra)
}

/// Merge `search` (skipping paths that don't exist) and then `extra` (which
/// must exist) into one config. With no layers at all, every field takes its
/// default.
fn load_layers(search: &[PathBuf], extra: Option<&Path>) -> anyhow::Result<Config> {
    let mut merged: Option<serde_yaml::Value> = None;

    for path in search.iter().filter(|p| p.is_file()) {
        debug!(path = %path.display(), "loading config layer");
        overlay(&mut merged, read_layer(path)?);
    }
    if let Some(path) = extra {
        debug!(path = %path.display(), "loading explicit config");
        overlay(&mut merged, read_layer(path)?);
    }

    Ok(match merged {
        None => Config::default(),
        Some(value) => serde_yaml::from_value(value).unwrap_or_default(),
    })
}

/// Parse one YAML layer from disk.
fn read_layer(path: &Path) -> anyhow::Result<serde_yaml::Value> {
    let text =
        std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}

fn overlay(merged: &mut Option<serde_yaml::Value>, layer: serde_yaml::Value) {
    match merged {
        None => *merged = Some(layer),
        Some(base) => merge_layer(base, layer),
    }
}

/// Deep-merge `top` into `base`. Mappings merge key by key; everything else
/// (scalars, sequences, or a shape mismatch) is replaced by the
/// higher-priority layer.
fn merge_layer(base: &mut serde_yaml::Value, top: serde_yaml::Value) {
    match top {
        serde_yaml::Value::Mapping(top_map) => {
            if let serde_yaml::Value::Mapping(base_map) = base {
                for (key, value) in top_map {
                    match base_map.get_mut(&key) {
                        Some(slot) => merge_layer(slot, value),
                        None => {
                            base_map.insert(key, value);
                        }
                    }
                }
            } else {
                *base = serde_yaml::Value::Mapping(top_map);
            }
        }
        other => *base = other,
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn val(s: &str) -> serde_yaml::Value {
        serde_yaml::from_str(s).unwrap()
    }

    #[test]
    fn merge_scalar_src_wins() {
        let mut dst = val("x: 1");
        merge_layer(&mut dst, val("x: 2"));
        assert_eq!(dst["x"].as_i64(), Some(2));
    }

    #[test]
    fn merge_preserves_keys_not_in_src() {
        let mut dst = val("a: 1\nb: 2");
        merge_layer(&mut dst, val("b: 99"));
        assert_eq!(dst["a"].as_i64(), Some(1));
        assert_eq!(dst["b"].as_i64(), Some(99));
    }

    #[test]
    fn merge_nested_tables() {
        let mut dst = val("model:\n  provider: anthropic\n  name: claude-sonnet-4-5");
        merge_layer(&mut dst, val("model:\n  name: claude-haiku-4-5"));
        assert_eq!(dst["model"]["provider"].as_str(), Some("anthropic"));
        assert_eq!(dst["model"]["name"].as_str(), Some("claude-haiku-4-5"));
    }

    #[test]
    fn merge_replaces_on_shape_mismatch() {
        let mut dst = val("model: just-a-string");
        merge_layer(&mut dst, val("model:\n  provider: mock"));
        assert_eq!(dst["model"]["provider"].as_str(), Some("mock"));
    }

    #[test]
    fn load_with_no_layers_returns_defaults() {
        let cfg = load_layers(&[], None).unwrap();
        assert_eq!(cfg.model.provider, "anthropic");
        assert_eq!(cfg.session.tutor_max_tokens, 512);
    }

    #[test]
    fn missing_search_paths_are_skipped() {
        let search = vec![PathBuf::from("/tmp/minne_no_such_dir_xyz/config.yaml")];
        let cfg = load_layers(&search, None).unwrap();
        assert_eq!(cfg.session.decline_cooldown_messages, 3);
    }

    #[test]
    fn load_returns_error_when_explicit_path_missing() {
        let result = load_layers(&[], Some(Path::new("/tmp/minne_nonexistent_config_xyz.yaml")));
        assert!(result.is_err());
    }

    #[test]
    fn load_explicit_file_overrides_defaults() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            f,
            "model:\n  provider: mock\n  name: mock-model\nsession:\n  tutor_max_tokens: 256"
        )
        .unwrap();
        let cfg = load_layers(&[], Some(f.path())).unwrap();
        assert_eq!(cfg.model.provider, "mock");
        assert_eq!(cfg.session.tutor_max_tokens, 256);
        // Untouched fields keep their defaults.
        assert_eq!(cfg.session.decline_cooldown_messages, 3);
    }

    #[test]
    fn later_layers_win_over_earlier_ones() {
        let mut low = tempfile::NamedTempFile::new().unwrap();
        writeln!(low, "session:\n  tutor_max_tokens: 128\n  detector_window: 4").unwrap();
        let mut high = tempfile::NamedTempFile::new().unwrap();
        writeln!(high, "session:\n  tutor_max_tokens: 640").unwrap();

        let search = vec![low.path().to_path_buf()];
        let cfg = load_layers(&search, Some(high.path())).unwrap();
        assert_eq!(cfg.session.tutor_max_tokens, 640);
        assert_eq!(cfg.session.detector_window, 4);
    }

    #[test]
    fn search_paths_cover_workspace_local_names() {
        let paths = config_search_paths();
        let names: Vec<String> = paths
            .iter()
            .map(|p| p.to_string_lossy().into_owned())
            .collect();
        assert!(names.iter().any(|n| n.ends_with(".minne/config.yaml")));
        assert!(names.iter().any(|n| n.ends_with(".minne.yaml")));
        assert!(names.iter().any(|n| n.ends_with("minne.yml")));
    }

    #[test]
    fn session_defaults_match_documented_values() {
        let s = crate::SessionConfig::default();
        assert_eq!(s.tutor_temperature, 0.7);
        assert_eq!(s.tutor_max_tokens, 512);
        assert_eq!(s.recall_confidence_threshold, 0.6);
        assert_eq!(s.near_miss_threshold, 0.3);
        assert_eq!(s.detect_confidence_threshold, 0.6);
        assert_eq!(s.pause_threshold_minutes, 5);
    }

    #[test]
    fn evaluator_model_falls_back_to_tutor_model() {
        let cfg = Config::default();
        assert_eq!(cfg.evaluator_model().provider, cfg.model.provider);
        assert_eq!(cfg.detector_model().name, cfg.model.name);
    }
}
