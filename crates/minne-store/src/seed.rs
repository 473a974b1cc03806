// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! YAML seed loader: authors recall sets and their points in bulk.
//!
//! ```yaml
//! sets:
//!   - name: Swedish basics
//!     description: Everyday vocabulary
//!     discussion_prompt: Prefer everyday example sentences.
//!     points:
//!       - content: '"tack" means thank you'
//!         context: Politeness basics
//! ```

use serde::Deserialize;
use tracing::info;

use minne_fsrs::Scheduler;

use crate::repo::{RecallPointRepo, RecallSetRepo, StoreResult};
use crate::types::{RecallPoint, RecallSet};

#[derive(Debug, Deserialize)]
pub struct SeedFile {
    pub sets: Vec<SeedSet>,
}

#[derive(Debug, Deserialize)]
pub struct SeedSet {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub discussion_prompt: Option<String>,
    pub points: Vec<SeedPoint>,
}

#[derive(Debug, Deserialize)]
pub struct SeedPoint {
    pub content: String,
    #[serde(default)]
    pub context: String,
}

/// Outcome summary for one seed run.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct SeedReport {
    pub sets_created: usize,
    pub sets_skipped: usize,
    pub points_created: usize,
}

pub fn parse(yaml: &str) -> anyhow::Result<SeedFile> {
    Ok(serde_yaml::from_str(yaml)?)
}

/// Load a parsed seed file into the store. Sets whose name already exists
/// are skipped wholesale so re-running a seed is harmless.
pub async fn load<S>(store: &S, seed: SeedFile, now_ms: i64) -> StoreResult<SeedReport>
where
    S: RecallSetRepo + RecallPointRepo + ?Sized,
{
    let scheduler = Scheduler::default();
    let mut report = SeedReport::default();

    for seed_set in seed.sets {
        if store.find_set_by_name(&seed_set.name).await?.is_some() {
            info!(set = %seed_set.name, "seed: set already exists, skipping");
            report.sets_skipped += 1;
            continue;
        }
        let mut set = RecallSet::new(&seed_set.name, &seed_set.description, now_ms);
        set.discussion_prompt = seed_set.discussion_prompt.clone();
        store.create_set(set.clone()).await?;
        report.sets_created += 1;

        for seed_point in &seed_set.points {
            let point = RecallPoint::new(
                &set.id,
                &seed_point.content,
                &seed_point.context,
                scheduler.initial_state(now_ms),
                now_ms,
            );
            store.create_point(point).await?;
            report.points_created += 1;
        }
        info!(set = %seed_set.name, points = seed_set.points.len(), "seed: created set");
    }
    Ok(report)
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
