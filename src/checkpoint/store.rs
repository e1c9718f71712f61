//! Checkpoint Store: thread-id namespaced snapshots of workflow state.
//!
//! Layout: `<root>/.specflow/checkpoints/<thread-id>/<seq:08>.json`. Each
//! checkpoint is written once and superseded by the next sequence number;
//! only the newest `retention` files per thread are kept.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::config::Config;
use crate::util::{blocking, read_json, write_json_atomic};
use crate::{sflog_debug, Error, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub id: Uuid,
    pub thread_id: String,
    pub seq: u64,
    /// Node the engine will run next when resuming from this snapshot.
    pub node: String,
    /// True when the snapshot is of a finished run.
    #[serde(default)]
    pub terminal: bool,
    pub created_at: DateTime<Utc>,
    pub state: serde_json::Value,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Checkpoint {
    /// Deserialize the stored state snapshot.
    pub fn state_as<S: DeserializeOwned>(&self) -> Result<S> {
        serde_json::from_value(self.state.clone()).map_err(|e| {
            Error::Checkpoint(format!(
                "checkpoint {}#{} has unreadable state: {}",
                self.thread_id, self.seq, e
            ))
        })
    }
}

pub struct CheckpointStore {
    dir: PathBuf,
    retention: usize,
    io: Mutex<()>,
}

impl CheckpointStore {
    pub fn new(dir: PathBuf, retention: usize) -> Self {
        Self {
            dir,
            retention: retention.max(1),
            io: Mutex::new(()),
        }
    }

    pub fn open(root: &Path, retention: usize) -> Self {
        Self::new(Config::state_dir(root).join("checkpoints"), retention)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn retention(&self) -> usize {
        self.retention
    }

    fn thread_dir(&self, thread_id: &str) -> Result<PathBuf> {
        Ok(self.dir.join(sanitize_thread_id(thread_id)?))
    }

    /// Persist a new snapshot for `thread_id` and apply retention.
    pub async fn save<S: Serialize>(
        &self,
        thread_id: &str,
        node: &str,
        terminal: bool,
        state: &S,
    ) -> Result<Checkpoint> {
        let state = serde_json::to_value(state)?;
        let dir = self.thread_dir(thread_id)?;
        let thread_id = thread_id.to_string();
        let node = node.to_string();
        let retention = self.retention;

        let _guard = self.io.lock().await;
        let checkpoint = blocking(move || {
            let seq = list_seqs(&dir)?.last().map(|s| s + 1).unwrap_or(1);
            let path = dir.join(file_name(seq));
            if path.exists() {
                return Err(Error::Checkpoint(format!(
                    "refusing to overwrite {}",
                    path.display()
                )));
            }
            let checkpoint = Checkpoint {
                id: Uuid::new_v4(),
                thread_id,
                seq,
                node,
                terminal,
                created_at: Utc::now(),
                state,
                extra: serde_json::Map::new(),
            };
            write_json_atomic(&path, &checkpoint)?;
            prune_dir(&dir, retention)?;
            Ok(checkpoint)
        })
        .await?;

        sflog_debug!(
            "checkpoint {}#{} at {}{}",
            checkpoint.thread_id,
            checkpoint.seq,
            checkpoint.node,
            if checkpoint.terminal { " (terminal)" } else { "" }
        );
        Ok(checkpoint)
    }

    /// Most recent snapshot for `thread_id`, if any.
    pub async fn load_latest(&self, thread_id: &str) -> Result<Option<Checkpoint>> {
        let dir = self.thread_dir(thread_id)?;
        let _guard = self.io.lock().await;
        blocking(move || match list_seqs(&dir)?.last() {
            Some(seq) => read_json(&dir.join(file_name(*seq))),
            None => Ok(None),
        })
        .await
    }

    /// Every retained snapshot for `thread_id`, oldest first.
    pub async fn list(&self, thread_id: &str) -> Result<Vec<Checkpoint>> {
        let dir = self.thread_dir(thread_id)?;
        let _guard = self.io.lock().await;
        blocking(move || {
            let mut out = Vec::new();
            for seq in list_seqs(&dir)? {
                if let Some(cp) = read_json(&dir.join(file_name(seq)))? {
                    out.push(cp);
                }
            }
            Ok(out)
        })
        .await
    }

    /// Drop snapshots beyond the retention limit. Returns how many were removed.
    pub async fn prune(&self, thread_id: &str) -> Result<usize> {
        let dir = self.thread_dir(thread_id)?;
        let retention = self.retention;
        let _guard = self.io.lock().await;
        blocking(move || prune_dir(&dir, retention)).await
    }

    /// Thread ids that have checkpoint directories.
    pub async fn threads(&self) -> Result<Vec<String>> {
        let dir = self.dir.clone();
        blocking(move || {
            if !dir.exists() {
                return Ok(Vec::new());
            }
            let mut threads = Vec::new();
            for entry in std::fs::read_dir(&dir)? {
                let entry = entry?;
                if entry.file_type()?.is_dir() {
                    threads.push(entry.file_name().to_string_lossy().into_owned());
                }
            }
            threads.sort();
            Ok(threads)
        })
        .await
    }
}

/// Thread ids become directory names; anything outside `[A-Za-z0-9._-]` is
/// replaced so an id can never escape the checkpoint directory. A changed id
/// gets a suffix derived from the original, so `a/b` and `a_b` stay apart.
pub fn sanitize_thread_id(thread_id: &str) -> Result<String> {
    let trimmed = thread_id.trim();
    if trimmed.is_empty() || trimmed.chars().all(|c| c == '.') {
        return Err(Error::Checkpoint(format!("invalid thread id '{}'", thread_id)));
    }
    let cleaned: String = trimmed
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned == thread_id {
        return Ok(cleaned);
    }
    let digest = Uuid::new_v5(&Uuid::NAMESPACE_OID, thread_id.as_bytes()).simple().to_string();
    Ok(format!("{}-{}", cleaned, &digest[..8]))
}

fn file_name(seq: u64) -> String {
    format!("{:08}.json", seq)
}

/// Sequence numbers present in `dir`, ascending.
fn list_seqs(dir: &Path) -> Result<Vec<u64>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut seqs = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        if let Some(seq) = path
            .file_stem()
            .and_then(|s| s.to_str())
            .and_then(|s| s.parse::<u64>().ok())
        {
            seqs.push(seq);
        }
    }
    seqs.sort_unstable();
    Ok(seqs)
}

fn prune_dir(dir: &Path, retention: usize) -> Result<usize> {
    let seqs = list_seqs(dir)?;
    if seqs.len() <= retention {
        return Ok(0);
    }
    let excess = seqs.len() - retention;
    for seq in &seqs[..excess] {
        std::fs::remove_file(dir.join(file_name(*seq)))?;
    }
    Ok(excess)
}
