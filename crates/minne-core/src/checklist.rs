// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::HashMap;

/// Per-session recall progress for one point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PointStatus {
    Pending,
    Recalled,
}

/// Target-ordered checklist driving session progress.
///
/// The probe index is a hint for the tutor: it names the next point to
/// solicit, but the evaluator may mark any point recalled regardless.
#[derive(Debug, Clone)]
pub struct Checklist {
    order: Vec<String>,
    status: HashMap<String, PointStatus>,
    probe_index: usize,
}

impl Checklist {
    pub fn new(target_ids: Vec<String>) -> Self {
        let status = target_ids
            .iter()
            .map(|id| (id.clone(), PointStatus::Pending))
            .collect();
        Self { order: target_ids, status, probe_index: 0 }
    }

    /// Rebuild from persisted progress. Ids in `recalled` that are not
    /// targets are ignored; the probe lands on the first pending point.
    pub fn restore(target_ids: Vec<String>, recalled: &[String]) -> Self {
        let mut checklist = Self::new(target_ids);
        for id in recalled {
            if let Some(slot) = checklist.status.get_mut(id) {
                *slot = PointStatus::Recalled;
            }
        }
        checklist.probe_index = checklist
            .order
            .iter()
            .position(|id| checklist.status[id] == PointStatus::Pending)
            .unwrap_or(0);
        checklist
    }

    pub fn total(&self) -> usize {
        self.order.len()
    }

    pub fn recalled_count(&self) -> usize {
        self.order
            .iter()
            .filter(|id| self.status[*id] == PointStatus::Recalled)
            .count()
    }

    pub fn is_complete(&self) -> bool {
        self.recalled_count() == self.total()
    }

    pub fn status_of(&self, id: &str) -> Option<PointStatus> {
        self.status.get(id).copied()
    }

    /// Ids still pending, in target order.
    pub fn unchecked_ids(&self) -> Vec<String> {
        self.order
            .iter()
            .filter(|id| self.status[*id] == PointStatus::Pending)
            .cloned()
            .collect()
    }

    /// Ids recalled so far, in target order (the persisted representation).
    pub fn recalled_ids(&self) -> Vec<String> {
        self.order
            .iter()
            .filter(|id| self.status[*id] == PointStatus::Recalled)
            .cloned()
            .collect()
    }

    /// The next pending point by circular scan from the probe index.
    pub fn next_probe(&self) -> Option<&str> {
        if self.order.is_empty() {
            return None;
        }
        (0..self.order.len())
            .map(|offset| (self.probe_index + offset) % self.order.len())
            .map(|i| &self.order[i])
            .find(|id| self.status[*id] == PointStatus::Pending)
            .map(|id| id.as_str())
    }

    /// Flip a point to recalled. Returns `true` only on the first transition
    /// (idempotent thereafter; unknown ids are a no-op). Advances the probe
    /// when the recalled point was the current probe target.
    pub fn mark_recalled(&mut self, id: &str) -> bool {
        let was_probe = self.next_probe() == Some(id);
        match self.status.get_mut(id) {
            Some(slot @ PointStatus::Pending) => {
                *slot = PointStatus::Recalled;
                if was_probe {
                    if let Some(pos) = self.order.iter().position(|x| x == id) {
                        self.probe_index = (pos + 1) % self.order.len().max(1);
                    }
                }
                true
            }
            _ => false,
        }
    }

    /// Snapshot of (id, status) pairs in target order.
    pub fn entries(&self) -> Vec<(String, PointStatus)> {
        self.order
            .iter()
            .map(|id| (id.clone(), self.status[id]))
            .collect()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn fresh_checklist_is_all_pending() {
        let c = Checklist::new(ids(&["a", "b", "c"]));
        assert_eq!(c.total(), 3);
        assert_eq!(c.recalled_count(), 0);
        assert!(!c.is_complete());
        assert_eq!(c.unchecked_ids(), ids(&["a", "b", "c"]));
        assert_eq!(c.next_probe(), Some("a"));
    }

    #[test]
    fn mark_recalled_is_idempotent() {
        let mut c = Checklist::new(ids(&["a", "b"]));
        assert!(c.mark_recalled("a"));
        assert!(!c.mark_recalled("a"), "second mark must be a no-op");
        assert_eq!(c.recalled_count(), 1);
    }

    #[test]
    fn unknown_id_is_a_no_op() {
        let mut c = Checklist::new(ids(&["a"]));
        assert!(!c.mark_recalled("zz"));
        assert_eq!(c.recalled_count(), 0);
    }

    #[test]
    fn probe_advances_past_recalled_probe_target() {
        let mut c = Checklist::new(ids(&["a", "b", "c"]));
        assert!(c.mark_recalled("a"));
        assert_eq!(c.next_probe(), Some("b"));
    }

    #[test]
    fn probe_skips_out_of_order_recalls() {
        let mut c = Checklist::new(ids(&["a", "b", "c"]));
        // The evaluator may recall any point; the probe stays on "a".
        assert!(c.mark_recalled("b"));
        assert_eq!(c.next_probe(), Some("a"));
        assert!(c.mark_recalled("a"));
        assert_eq!(c.next_probe(), Some("c"));
    }

    #[test]
    fn probe_scan_wraps_circularly() {
        let mut c = Checklist::new(ids(&["a", "b", "c"]));
        assert!(c.mark_recalled("b"));
        assert!(c.mark_recalled("c"));
        assert_eq!(c.next_probe(), Some("a"));
    }

    #[test]
    fn complete_when_all_recalled() {
        let mut c = Checklist::new(ids(&["a", "b"]));
        c.mark_recalled("a");
        c.mark_recalled("b");
        assert!(c.is_complete());
        assert_eq!(c.next_probe(), None);
        assert_eq!(c.unchecked_ids(), Vec::<String>::new());
    }

    #[test]
    fn restore_reproduces_progress() {
        let c = Checklist::restore(ids(&["a", "b", "c"]), &ids(&["a"]));
        assert_eq!(c.recalled_count(), 1);
        assert_eq!(c.status_of("a"), Some(PointStatus::Recalled));
        assert_eq!(c.next_probe(), Some("b"));
        // Unknown recalled ids are dropped silently.
        let c = Checklist::restore(ids(&["a"]), &ids(&["zz"]));
        assert_eq!(c.recalled_count(), 0);
    }

    #[test]
    fn recalled_ids_keep_target_order() {
        let mut c = Checklist::new(ids(&["a", "b", "c"]));
        c.mark_recalled("c");
        c.mark_recalled("a");
        assert_eq!(c.recalled_ids(), ids(&["a", "c"]));
    }

    #[test]
    fn empty_checklist_is_trivially_complete() {
        let c = Checklist::new(vec![]);
        assert!(c.is_complete());
        assert_eq!(c.next_probe(), None);
    }
}
