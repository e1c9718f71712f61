//! Shared coordination record per spec set:
//! `<root>/.specflow/shared/<spec-set-id>.json`.
//!
//! Holds completed spec ids, patterns merged across specs and aggregated run
//! metrics. Only the coordinating task writes it, after a window settles.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;

use crate::checkpoint::store::sanitize_thread_id;
use crate::config::Config;
use crate::core::spec::SpecId;
use crate::util::{blocking, read_json, write_json_atomic};
use crate::{sflog_debug, Result};

/// A reusable observation, merged by name across specs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SharedPattern {
    pub name: String,
    #[serde(default)]
    pub guidance: String,
    #[serde(default = "one")]
    pub occurrences: u32,
}

fn one() -> u32 {
    1
}

impl SharedPattern {
    pub fn new(name: &str, guidance: &str) -> Self {
        Self {
            name: name.to_string(),
            guidance: guidance.to_string(),
            occurrences: 1,
        }
    }
}

/// Counters for one spec, or summed over a spec set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpecMetrics {
    #[serde(default)]
    pub tokens_used: u64,
    #[serde(default)]
    pub duration_ms: u64,
    #[serde(default)]
    pub engine_runs: u32,
    #[serde(default)]
    pub retries: u32,
    #[serde(default)]
    pub fix_tasks: u32,
    #[serde(default)]
    pub stalls: u32,
}

impl SpecMetrics {
    pub fn add(&mut self, other: &SpecMetrics) {
        self.tokens_used += other.tokens_used;
        self.duration_ms += other.duration_ms;
        self.engine_runs += other.engine_runs;
        self.retries += other.retries;
        self.fix_tasks += other.fix_tasks;
        self.stalls += other.stalls;
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregatedMetrics {
    #[serde(default)]
    pub totals: SpecMetrics,
    #[serde(default)]
    pub per_spec: BTreeMap<String, SpecMetrics>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SharedCoordinationRecord {
    pub spec_set_id: String,
    #[serde(default)]
    pub completed_specs: Vec<SpecId>,
    #[serde(default)]
    pub patterns: Vec<SharedPattern>,
    #[serde(default)]
    pub metrics: AggregatedMetrics,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl SharedCoordinationRecord {
    pub fn new(spec_set_id: &str) -> Self {
        Self {
            spec_set_id: spec_set_id.to_string(),
            ..Default::default()
        }
    }

    pub fn mark_completed(&mut self, spec_id: &SpecId) {
        if !self.completed_specs.contains(spec_id) {
            self.completed_specs.push(spec_id.clone());
        }
    }

    pub fn is_completed(&self, spec_id: &SpecId) -> bool {
        self.completed_specs.contains(spec_id)
    }

    /// Merge by name: occurrences add up, newer non-empty guidance wins.
    pub fn merge_patterns(&mut self, patterns: &[SharedPattern]) {
        for incoming in patterns {
            match self.patterns.iter_mut().find(|p| p.name == incoming.name) {
                Some(existing) => {
                    existing.occurrences += incoming.occurrences;
                    if !incoming.guidance.is_empty() {
                        existing.guidance = incoming.guidance.clone();
                    }
                }
                None => self.patterns.push(incoming.clone()),
            }
        }
    }

    /// Add one run's metrics under `spec_id` and into the totals.
    pub fn record_metrics(&mut self, spec_id: &SpecId, metrics: &SpecMetrics) {
        self.metrics
            .per_spec
            .entry(spec_id.to_string())
            .or_default()
            .add(metrics);
        self.metrics.totals.add(metrics);
    }

    /// The `limit` most frequent patterns, ties by name.
    pub fn top_patterns(&self, limit: usize) -> Vec<SharedPattern> {
        let mut patterns = self.patterns.clone();
        patterns.sort_by(|a, b| b.occurrences.cmp(&a.occurrences).then(a.name.cmp(&b.name)));
        patterns.truncate(limit);
        patterns
    }
}

pub struct SharedStateStore {
    dir: PathBuf,
    io: Mutex<()>,
}

impl SharedStateStore {
    pub fn new(dir: PathBuf) -> Self {
        Self {
            dir,
            io: Mutex::new(()),
        }
    }

    pub fn open(root: &Path) -> Self {
        Self::new(Config::state_dir(root).join("shared"))
    }

    fn path_for(&self, spec_set_id: &str) -> Result<PathBuf> {
        Ok(self
            .dir
            .join(format!("{}.json", sanitize_thread_id(spec_set_id)?)))
    }

    pub async fn load(&self, spec_set_id: &str) -> Result<SharedCoordinationRecord> {
        let path = self.path_for(spec_set_id)?;
        let id = spec_set_id.to_string();
        let _guard = self.io.lock().await;
        blocking(move || {
            Ok(read_json(&path)?.unwrap_or_else(|| SharedCoordinationRecord::new(&id)))
        })
        .await
    }

    /// Read-merge-write the record for `spec_set_id`.
    pub async fn update<F>(&self, spec_set_id: &str, f: F) -> Result<SharedCoordinationRecord>
    where
        F: FnOnce(&mut SharedCoordinationRecord) + Send + 'static,
    {
        let path = self.path_for(spec_set_id)?;
        let id = spec_set_id.to_string();
        let _guard = self.io.lock().await;
        let record = blocking(move || {
            let mut record: SharedCoordinationRecord =
                read_json(&path)?.unwrap_or_else(|| SharedCoordinationRecord::new(&id));
            f(&mut record);
            record.updated_at = Some(Utc::now());
            write_json_atomic(&path, &record)?;
            Ok(record)
        })
        .await?;
        sflog_debug!(
            "shared record {}: {} completed, {} patterns",
            record.spec_set_id,
            record.completed_specs.len(),
            record.patterns.len()
        );
        Ok(record)
    }
}
