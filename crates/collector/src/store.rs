// Copyright (C) 2025-present The StreamAvg Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//    http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or
// implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Durable storage of snapshots and of the checkpoint.
//!
//! Each committed tick with changed windows produces one snapshot artifact
//! named after its batch id. The checkpoint records the last committed batch
//! id, the ids of every consumed input record and the engine state. All files
//! are written to a hidden temporary name first and renamed into place, so a
//! reader either sees the previous complete file or the new complete file.
//!
//! Commit order is snapshot first, checkpoint second. A snapshot whose batch
//! id is above the checkpointed one was never committed: it is ignored by
//! readers and overwritten when the batch is retried.

use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeSet,
    path::{Path, PathBuf},
};
use streamavg_analytics::{aggregation::EngineState, state::WindowAverage};
use tokio::{fs, io::AsyncWriteExt};
use tracing::{debug, info, warn};

const SNAPSHOT_PREFIX: &str = "snapshot-";
const SNAPSHOT_SUFFIX: &str = ".json";
const CHECKPOINT_FILE: &str = "checkpoint.json";
/// Max attempts at reading the latest snapshot while compaction races with it
const MAX_READ_ATTEMPTS: usize = 3;

#[derive(Debug, strum_macros::Display)]
pub enum StoreError {
    #[strum(to_string = "IO error while {context}: {source}")]
    IoError {
        context: String,
        source: std::io::Error,
    },

    #[strum(to_string = "JSON error while {context}: {source}")]
    JsonError {
        context: String,
        source: serde_json::Error,
    },
}

impl std::error::Error for StoreError {}

fn io_error(context: impl Into<String>) -> impl FnOnce(std::io::Error) -> StoreError {
    move |source| StoreError::IoError {
        context: context.into(),
        source,
    }
}

fn json_error(context: impl Into<String>) -> impl FnOnce(serde_json::Error) -> StoreError {
    move |source| StoreError::JsonError {
        context: context.into(),
        source,
    }
}

/// Cursor over the committed input plus the state derived from it
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Last committed batch, `0` when nothing was committed yet
    pub batch_id: u64,
    /// Ids of the input records folded into `engine`
    pub committed: BTreeSet<String>,
    pub engine: EngineState,
}

/// Only the batch id, so readers don't have to materialize the whole state
#[derive(Debug, Deserialize)]
struct CheckpointBatch {
    batch_id: u64,
}

pub fn snapshot_name(batch_id: u64) -> String {
    format!("{SNAPSHOT_PREFIX}{batch_id:020}{SNAPSHOT_SUFFIX}")
}

fn parse_snapshot_name(name: &str) -> Option<u64> {
    name.strip_prefix(SNAPSHOT_PREFIX)?
        .strip_suffix(SNAPSHOT_SUFFIX)?
        .parse()
        .ok()
}

/// Serialize averages as one JSON object per line
pub fn encode_snapshot(averages: &[WindowAverage]) -> Result<String, serde_json::Error> {
    let mut content = String::new();
    for average in averages {
        content.push_str(&serde_json::to_string(average)?);
        content.push('\n');
    }
    Ok(content)
}

/// Write `content` to `path` through a temporary file in the same directory
async fn write_atomic(path: &Path, content: &[u8]) -> Result<(), StoreError> {
    let name = path
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_default();
    let tmp_path = path.with_file_name(format!(".{name}.tmp"));
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .await
            .map_err(io_error(format!("creating directory '{}'", parent.display())))?;
    }
    let mut file = fs::File::create(&tmp_path)
        .await
        .map_err(io_error(format!("creating '{}'", tmp_path.display())))?;
    file.write_all(content)
        .await
        .map_err(io_error(format!("writing '{}'", tmp_path.display())))?;
    file.sync_all()
        .await
        .map_err(io_error(format!("syncing '{}'", tmp_path.display())))?;
    drop(file);
    fs::rename(&tmp_path, path)
        .await
        .map_err(io_error(format!("renaming '{}'", tmp_path.display())))
}

#[derive(Debug, Clone)]
pub struct SnapshotStore {
    snapshot_directory: PathBuf,
    checkpoint_directory: PathBuf,
    retention: usize,
}

impl SnapshotStore {
    pub fn new(snapshot_directory: PathBuf, checkpoint_directory: PathBuf, retention: usize) -> Self {
        Self {
            snapshot_directory,
            checkpoint_directory,
            retention: retention.max(1),
        }
    }

    pub fn snapshot_directory(&self) -> &Path {
        &self.snapshot_directory
    }

    pub fn checkpoint_path(&self) -> PathBuf {
        self.checkpoint_directory.join(CHECKPOINT_FILE)
    }

    pub async fn create(&self) -> Result<(), StoreError> {
        for dir in [&self.snapshot_directory, &self.checkpoint_directory] {
            fs::create_dir_all(dir)
                .await
                .map_err(io_error(format!("creating directory '{}'", dir.display())))?;
        }
        Ok(())
    }

    async fn read_checkpoint_file(&self) -> Result<Option<String>, StoreError> {
        let path = self.checkpoint_path();
        match fs::read_to_string(&path).await {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(io_error(format!("reading '{}'", path.display()))(e)),
        }
    }

    /// Load the last durable checkpoint, `None` on a fresh start.
    ///
    /// A corrupt checkpoint is an error: silently starting over would fold
    /// already committed records a second time.
    pub async fn load_checkpoint(&self) -> Result<Option<Checkpoint>, StoreError> {
        match self.read_checkpoint_file().await? {
            None => Ok(None),
            Some(content) => serde_json::from_str(&content)
                .map(Some)
                .map_err(json_error(format!(
                    "decoding '{}'",
                    self.checkpoint_path().display()
                ))),
        }
    }

    /// Batch id of the last durable checkpoint, `0` when there is none
    pub async fn committed_batch_id(&self) -> Result<u64, StoreError> {
        match self.read_checkpoint_file().await? {
            None => Ok(0),
            Some(content) => serde_json::from_str::<CheckpointBatch>(&content)
                .map(|x| x.batch_id)
                .map_err(json_error(format!(
                    "decoding '{}'",
                    self.checkpoint_path().display()
                ))),
        }
    }

    pub async fn write_snapshot(
        &self,
        batch_id: u64,
        averages: &[WindowAverage],
    ) -> Result<PathBuf, StoreError> {
        let path = self.snapshot_directory.join(snapshot_name(batch_id));
        let content = encode_snapshot(averages).map_err(json_error("encoding snapshot"))?;
        write_atomic(&path, content.as_bytes()).await?;
        debug!("Snapshot for batch {batch_id} written to {:?}", path);
        Ok(path)
    }

    pub async fn write_checkpoint(&self, checkpoint: &Checkpoint) -> Result<(), StoreError> {
        let content = serde_json::to_vec(checkpoint).map_err(json_error("encoding checkpoint"))?;
        write_atomic(&self.checkpoint_path(), &content).await?;
        debug!("Checkpoint for batch {} written", checkpoint.batch_id);
        Ok(())
    }

    /// Durably commit a batch: its snapshot, if there is anything to emit,
    /// then the checkpoint. The batch is committed iff this returns `Ok`.
    ///
    /// A batch without averages removes any snapshot left under its id by an
    /// earlier failed attempt, so the checkpoint never commits it.
    pub async fn commit(
        &self,
        checkpoint: &Checkpoint,
        averages: &[WindowAverage],
    ) -> Result<Option<PathBuf>, StoreError> {
        let snapshot = if averages.is_empty() {
            self.remove_snapshot(checkpoint.batch_id).await?;
            None
        } else {
            Some(self.write_snapshot(checkpoint.batch_id, averages).await?)
        };
        self.write_checkpoint(checkpoint).await?;
        Ok(snapshot)
    }

    async fn remove_snapshot(&self, batch_id: u64) -> Result<(), StoreError> {
        let path = self.snapshot_directory.join(snapshot_name(batch_id));
        match fs::remove_file(&path).await {
            Ok(()) => {
                debug!("Removed uncommitted snapshot {:?}", path);
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_error(format!("removing '{}'", path.display()))(e)),
        }
    }

    /// Batch ids of the snapshot artifacts on disk, sorted
    async fn list_snapshots(&self) -> Result<Vec<u64>, StoreError> {
        let context = format!("listing '{}'", self.snapshot_directory.display());
        let mut entries = match fs::read_dir(&self.snapshot_directory).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(io_error(context)(e)),
        };
        let mut ids = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(io_error(context.clone()))? {
            if let Some(id) = entry.file_name().to_str().and_then(parse_snapshot_name) {
                ids.push(id);
            }
        }
        ids.sort_unstable();
        Ok(ids)
    }

    /// Content of the most recently committed snapshot
    pub async fn latest_snapshot(&self) -> Result<Option<String>, StoreError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let committed = self.committed_batch_id().await?;
            let latest = self
                .list_snapshots()
                .await?
                .into_iter()
                .rev()
                .find(|id| *id <= committed);
            let Some(batch_id) = latest else {
                return Ok(None);
            };
            let path = self.snapshot_directory.join(snapshot_name(batch_id));
            match fs::read_to_string(&path).await {
                Ok(content) => return Ok(Some(content)),
                // Compacted between listing and reading, a newer one exists
                Err(e) if e.kind() == std::io::ErrorKind::NotFound && attempt < MAX_READ_ATTEMPTS => {
                    debug!("Snapshot {:?} vanished while reading it, retrying", path);
                }
                Err(e) => return Err(io_error(format!("reading '{}'", path.display()))(e)),
            }
        }
    }

    /// Delete committed snapshots beyond the retention, returns how many were
    /// deleted
    pub async fn compact(&self, committed_batch_id: u64) -> Result<usize, StoreError> {
        let committed: Vec<u64> = self
            .list_snapshots()
            .await?
            .into_iter()
            .filter(|id| *id <= committed_batch_id)
            .collect();
        let excess = committed.len().saturating_sub(self.retention);
        let mut deleted = 0;
        for batch_id in committed.into_iter().take(excess) {
            let path = self.snapshot_directory.join(snapshot_name(batch_id));
            match fs::remove_file(&path).await {
                Ok(()) => deleted += 1,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!("Failed to delete expired snapshot {:?}: {}", path, e),
            }
        }
        if deleted > 0 {
            info!("Compacted {deleted} expired snapshot(s)");
        }
        Ok(deleted)
    }
}
