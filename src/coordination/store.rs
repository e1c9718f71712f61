//! Coordination Store: durable spec lifecycle record plus cross-spec shared
//! values, persisted as `<root>/.specflow/coordination.json`.
//!
//! Every write is read-merge-write against the backing file so unrelated
//! top-level keys written by other tools survive. Concurrent spec runs inside
//! one level each hold a [`SpecStateHandle`] that can only patch their own
//! entry; the claim registry rejects a second writer for the same spec.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::config::Config;
use crate::core::spec::{Spec, SpecId};
use crate::util::{blocking, read_json, write_json_atomic};
use crate::{sflog_debug, sflog_warn, Error, Result};

const RECORD_VERSION: u32 = 1;

/// Lifecycle status of a spec.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpecStatus {
    #[default]
    Pending,
    Running,
    Complete,
    Blocked,
    Failed,
}

impl SpecStatus {
    /// Forward-only lifecycle, except pending and blocked may swap.
    pub fn can_transition_to(&self, next: SpecStatus) -> bool {
        use SpecStatus::*;
        matches!(
            (self, next),
            (Pending, Running) | (Pending, Blocked) | (Blocked, Pending) | (Running, Complete)
                | (Running, Failed)
        )
    }

    /// Complete and failed end a spec's lifecycle for this invocation.
    pub fn is_terminal(&self) -> bool {
        matches!(self, SpecStatus::Complete | SpecStatus::Failed)
    }
}

impl std::fmt::Display for SpecStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SpecStatus::Pending => write!(f, "pending"),
            SpecStatus::Running => write!(f, "running"),
            SpecStatus::Complete => write!(f, "complete"),
            SpecStatus::Blocked => write!(f, "blocked"),
            SpecStatus::Failed => write!(f, "failed"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpecState {
    pub spec_id: SpecId,
    #[serde(default)]
    pub status: SpecStatus,
    #[serde(default)]
    pub current_phase: Option<String>,
    #[serde(default)]
    pub completed_phases: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_error: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl SpecState {
    pub fn new(spec_id: SpecId) -> Self {
        let now = Utc::now();
        Self {
            spec_id,
            status: SpecStatus::Pending,
            current_phase: None,
            completed_phases: Vec::new(),
            created_at: now,
            updated_at: now,
            started_at: None,
            finished_at: None,
            last_error: None,
            extra: serde_json::Map::new(),
        }
    }

    fn apply(&mut self, patch: SpecStatePatch) -> Result<()> {
        if let Some(next) = patch.status {
            if next != self.status {
                if !self.status.can_transition_to(next) {
                    return Err(Error::InvalidStatusTransition {
                        from: self.status.to_string(),
                        to: next.to_string(),
                    });
                }
                let now = Utc::now();
                match next {
                    SpecStatus::Running => {
                        self.started_at = Some(now);
                        self.finished_at = None;
                    }
                    SpecStatus::Complete | SpecStatus::Failed => self.finished_at = Some(now),
                    _ => {}
                }
                self.status = next;
            }
        }
        if let Some(phase) = patch.current_phase {
            self.current_phase = phase;
        }
        if let Some(phases) = patch.completed_phases {
            self.completed_phases = phases;
        }
        if let Some(error) = patch.last_error {
            self.last_error = error;
        }
        self.updated_at = Utc::now();
        Ok(())
    }
}

/// Merge patch for a [`SpecState`]. `None` fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SpecStatePatch {
    pub status: Option<SpecStatus>,
    pub current_phase: Option<Option<String>>,
    pub completed_phases: Option<Vec<String>>,
    pub last_error: Option<Option<String>>,
}

impl SpecStatePatch {
    pub fn status(status: SpecStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            status: Some(SpecStatus::Failed),
            last_error: Some(Some(error.into())),
            ..Default::default()
        }
    }

    pub fn blocked(reason: impl Into<String>) -> Self {
        Self {
            status: Some(SpecStatus::Blocked),
            last_error: Some(Some(reason.into())),
            ..Default::default()
        }
    }

    pub fn with_phases(mut self, current: Option<String>, completed: Vec<String>) -> Self {
        self.current_phase = Some(current);
        self.completed_phases = Some(completed);
        self
    }
}

/// On-disk shape of `coordination.json`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CoordinationRecord {
    #[serde(default)]
    pub version: u32,
    #[serde(default)]
    pub active_spec_set_id: Option<String>,
    #[serde(default)]
    pub specs: BTreeMap<String, SpecState>,
    /// Per-spec namespaces of shared values.
    #[serde(default)]
    pub shared: BTreeMap<String, serde_json::Map<String, serde_json::Value>>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Polling parameters for [`CoordinationStore::wait_for_dependencies`].
#[derive(Debug, Clone, Copy)]
pub struct WaitOptions {
    pub timeout: Duration,
    pub poll_interval: Duration,
}

impl WaitOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            timeout: config.dependency_wait_timeout(),
            poll_interval: config.dependency_poll_interval(),
        }
    }
}

impl Default for WaitOptions {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

pub struct CoordinationStore {
    path: PathBuf,
    io: Mutex<()>,
    claims: StdMutex<HashSet<SpecId>>,
}

impl CoordinationStore {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            io: Mutex::new(()),
            claims: StdMutex::new(HashSet::new()),
        }
    }

    /// Store rooted at `<root>/.specflow/coordination.json`.
    pub fn open(root: &Path) -> Self {
        Self::new(Config::state_dir(root).join("coordination.json"))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Snapshot of the whole record.
    pub async fn load(&self) -> Result<CoordinationRecord> {
        let _guard = self.io.lock().await;
        let path = self.path.clone();
        blocking(move || Ok(read_json(&path)?.unwrap_or_default())).await
    }

    /// Read-merge-write under the store's I/O lock.
    async fn mutate<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&mut CoordinationRecord) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let _guard = self.io.lock().await;
        let path = self.path.clone();
        blocking(move || {
            let mut record: CoordinationRecord = read_json(&path)?.unwrap_or_default();
            let out = f(&mut record)?;
            record.version = RECORD_VERSION;
            write_json_atomic(&path, &record)?;
            Ok(out)
        })
        .await
    }

    /// Create pending entries for specs not yet known. Existing entries are
    /// left untouched. Returns the ids that were added.
    pub async fn record_spec_set(&self, specs: &[Spec]) -> Result<Vec<SpecId>> {
        let ids: Vec<SpecId> = specs.iter().map(|s| s.id.clone()).collect();
        let added = self
            .mutate(move |record| {
                let mut added = Vec::new();
                for id in ids {
                    if !record.specs.contains_key(id.as_str()) {
                        record
                            .specs
                            .insert(id.to_string(), SpecState::new(id.clone()));
                        added.push(id);
                    }
                }
                Ok(added)
            })
            .await?;
        sflog_debug!("record_spec_set: {} new entries", added.len());
        Ok(added)
    }

    pub async fn get_spec_state(&self, spec_id: &SpecId) -> Result<Option<SpecState>> {
        Ok(self.load().await?.specs.get(spec_id.as_str()).cloned())
    }

    /// Merge `patch` into the spec's entry, enforcing the lifecycle guard.
    pub async fn update_spec_state(
        &self,
        spec_id: &SpecId,
        patch: SpecStatePatch,
    ) -> Result<SpecState> {
        let id = spec_id.clone();
        let state = self
            .mutate(move |record| {
                let state = record
                    .specs
                    .get_mut(id.as_str())
                    .ok_or_else(|| Error::SpecNotFound(id.to_string()))?;
                state.apply(patch)?;
                Ok(state.clone())
            })
            .await?;
        sflog_debug!("spec {} -> {}", spec_id, state.status);
        Ok(state)
    }

    /// Reset entries left failed, blocked or running by an earlier invocation
    /// back to pending. Complete entries are kept. Returns the reset ids.
    pub async fn reopen_for_invocation(&self, spec_ids: &[SpecId]) -> Result<Vec<SpecId>> {
        let ids = spec_ids.to_vec();
        self.mutate(move |record| {
            let mut reopened = Vec::new();
            for id in ids {
                if let Some(state) = record.specs.get_mut(id.as_str()) {
                    if matches!(
                        state.status,
                        SpecStatus::Failed | SpecStatus::Blocked | SpecStatus::Running
                    ) {
                        if state.status == SpecStatus::Running {
                            sflog_warn!("spec {} was left running by a previous run", id);
                        }
                        state.status = SpecStatus::Pending;
                        state.updated_at = Utc::now();
                        reopened.push(id);
                    }
                }
            }
            Ok(reopened)
        })
        .await
    }

    /// Poll until every wait-for-completion dependency of `spec` is complete.
    ///
    /// Fails immediately when a dependency is failed or blocked, and with
    /// `DependencyTimeout` once `opts.timeout` elapses.
    pub async fn wait_for_dependencies(&self, spec: &Spec, opts: WaitOptions) -> Result<()> {
        let deps: Vec<&SpecId> = spec.blocking_dependencies().collect();
        if deps.is_empty() {
            return Ok(());
        }

        let started = Instant::now();
        loop {
            let record = self.load().await?;
            let mut pending = Vec::new();
            for dep in &deps {
                let status = record
                    .specs
                    .get(dep.as_str())
                    .map(|s| s.status)
                    .unwrap_or_default();
                match status {
                    SpecStatus::Complete => {}
                    SpecStatus::Failed | SpecStatus::Blocked => {
                        return Err(Error::DependencyFailed {
                            spec: spec.id.to_string(),
                            dependency: dep.to_string(),
                            status: status.to_string(),
                        });
                    }
                    SpecStatus::Pending | SpecStatus::Running => pending.push(dep.to_string()),
                }
            }

            if pending.is_empty() {
                return Ok(());
            }

            let waited = started.elapsed();
            if waited >= opts.timeout {
                return Err(Error::DependencyTimeout {
                    spec: spec.id.to_string(),
                    pending,
                    waited,
                });
            }
            sflog_debug!("spec {} waiting on {:?}", spec.id, pending);
            tokio::time::sleep(opts.poll_interval.min(opts.timeout - waited)).await;
        }
    }

    /// Copy the named values from one spec namespace into another.
    /// Returns how many keys were copied.
    pub async fn share_state(
        &self,
        source: &SpecId,
        target: &SpecId,
        keys: &[&str],
    ) -> Result<usize> {
        let source = source.to_string();
        let target = target.to_string();
        let keys: Vec<String> = keys.iter().map(|k| k.to_string()).collect();
        self.mutate(move |record| {
            let values: Vec<(String, serde_json::Value)> = match record.shared.get(&source) {
                Some(ns) => keys
                    .iter()
                    .filter_map(|k| ns.get(k).map(|v| (k.clone(), v.clone())))
                    .collect(),
                None => Vec::new(),
            };
            let copied = values.len();
            let dest = record.shared.entry(target).or_default();
            for (key, value) in values {
                dest.insert(key, value);
            }
            Ok(copied)
        })
        .await
    }

    pub async fn set_shared_value(
        &self,
        spec_id: &SpecId,
        key: &str,
        value: serde_json::Value,
    ) -> Result<()> {
        let id = spec_id.to_string();
        let key = key.to_string();
        self.mutate(move |record| {
            record.shared.entry(id).or_default().insert(key, value);
            Ok(())
        })
        .await
    }

    pub async fn get_shared_value(
        &self,
        spec_id: &SpecId,
        key: &str,
    ) -> Result<Option<serde_json::Value>> {
        let record = self.load().await?;
        Ok(record
            .shared
            .get(spec_id.as_str())
            .and_then(|ns| ns.get(key))
            .cloned())
    }

    pub async fn set_active_spec_set_id(&self, id: Option<&str>) -> Result<()> {
        let id = id.map(str::to_string);
        self.mutate(move |record| {
            record.active_spec_set_id = id;
            Ok(())
        })
        .await
    }

    pub async fn get_active_spec_set_id(&self) -> Result<Option<String>> {
        Ok(self.load().await?.active_spec_set_id)
    }

    /// Claim exclusive write access to one spec's entry.
    pub fn claim(self: &Arc<Self>, spec_id: &SpecId) -> Result<SpecStateHandle> {
        let mut claims = self
            .claims
            .lock()
            .map_err(|_| Error::SpecClaimed(spec_id.to_string()))?;
        if !claims.insert(spec_id.clone()) {
            return Err(Error::SpecClaimed(spec_id.to_string()));
        }
        Ok(SpecStateHandle {
            store: Arc::clone(self),
            spec_id: spec_id.clone(),
        })
    }

    fn release(&self, spec_id: &SpecId) {
        if let Ok(mut claims) = self.claims.lock() {
            claims.remove(spec_id);
        }
    }
}

/// Write access to exactly one spec's entry and shared namespace.
///
/// Released when dropped.
pub struct SpecStateHandle {
    store: Arc<CoordinationStore>,
    spec_id: SpecId,
}

impl SpecStateHandle {
    pub fn spec_id(&self) -> &SpecId {
        &self.spec_id
    }

    pub async fn get(&self) -> Result<Option<SpecState>> {
        self.store.get_spec_state(&self.spec_id).await
    }

    pub async fn update(&self, patch: SpecStatePatch) -> Result<SpecState> {
        self.store.update_spec_state(&self.spec_id, patch).await
    }

    pub async fn set_shared(&self, key: &str, value: serde_json::Value) -> Result<()> {
        self.store.set_shared_value(&self.spec_id, key, value).await
    }

    /// Read-only access to the whole store.
    pub fn store(&self) -> &CoordinationStore {
        &self.store
    }
}

impl Drop for SpecStateHandle {
    fn drop(&mut self) {
        self.store.release(&self.spec_id);
    }
}
