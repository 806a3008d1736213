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

//! Periodic emission of window averages.
//!
//! - `EmissionScheduler` - Runs a single tick: folds the records not yet
//!   committed into a staged copy of the engine, emits the changed windows and
//!   commits the result atomically through the [`SnapshotStore`]
//! - `EmissionActor` - Drives the scheduler on a fixed interval until told to
//!   stop
//! - `EmissionActorHandle` - Handle for controlling the actor
//! - `EmissionStats` - Metrics collection for emission operations
//!
//! The live engine state is only replaced by the staged one once the
//! checkpoint is durable. A failed commit leaves the live state untouched and
//! the same records are replayed on the next tick under the same batch id.

use crate::{
    inputs::{records::RecordDirectory, RecordError},
    store::{Checkpoint, SnapshotStore, StoreError},
};
use either::Either;
use opentelemetry::{
    metrics::{Counter, Meter},
    KeyValue,
};
use std::{collections::BTreeSet, path::PathBuf, sync::Arc, time::Duration};
use streamavg_analytics::{aggregation::AggregationEngine, watermark::Watermark};
use tokio::{
    sync::mpsc,
    task::JoinHandle,
    time::{interval, MissedTickBehavior},
};
use tracing::{debug, error, info, trace, warn};

#[derive(Debug, Clone)]
pub struct EmissionStats {
    pub records_read: Counter<u64>,
    pub records_malformed: Counter<u64>,
    pub events_admitted: Counter<u64>,
    pub events_late: Counter<u64>,
    pub windows_emitted: Counter<u64>,
    pub windows_evicted: Counter<u64>,
    pub ticks_committed: Counter<u64>,
    pub ticks_failed: Counter<u64>,
    pub snapshots_compacted: Counter<u64>,
}

impl EmissionStats {
    pub fn new(meter: Meter) -> Self {
        let records_read = meter
            .u64_counter("streamavg.scheduler.records.read")
            .with_description("Number of input records read")
            .build();
        let records_malformed = meter
            .u64_counter("streamavg.scheduler.records.malformed")
            .with_description("Number of malformed input rows skipped")
            .build();
        let events_admitted = meter
            .u64_counter("streamavg.scheduler.events.admitted")
            .with_description("Number of events folded into a window")
            .build();
        let events_late = meter
            .u64_counter("streamavg.scheduler.events.late")
            .with_description("Number of events dropped behind the watermark")
            .build();
        let windows_emitted = meter
            .u64_counter("streamavg.scheduler.windows.emitted")
            .with_description("Number of window averages written to snapshots")
            .build();
        let windows_evicted = meter
            .u64_counter("streamavg.scheduler.windows.evicted")
            .with_description("Number of windows finalized and evicted from memory")
            .build();
        let ticks_committed = meter
            .u64_counter("streamavg.scheduler.ticks.committed")
            .with_description("Number of ticks durably committed")
            .build();
        let ticks_failed = meter
            .u64_counter("streamavg.scheduler.ticks.failed")
            .with_description("Number of ticks that failed and will be retried")
            .build();
        let snapshots_compacted = meter
            .u64_counter("streamavg.scheduler.snapshots.compacted")
            .with_description("Number of expired snapshots deleted")
            .build();
        Self {
            records_read,
            records_malformed,
            events_admitted,
            events_late,
            windows_emitted,
            windows_evicted,
            ticks_committed,
            ticks_failed,
            snapshots_compacted,
        }
    }
}

#[derive(Debug, strum_macros::Display)]
pub enum TickError {
    #[strum(to_string = "failed to list input records: {source}")]
    Input { source: RecordError },

    #[strum(to_string = "failed to commit batch {batch_id}: {source}")]
    Commit { batch_id: u64, source: StoreError },
}

impl std::error::Error for TickError {}

/// What a single tick did
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TickReport {
    /// Batch committed by the tick, `None` when there was nothing to consume
    pub batch_id: Option<u64>,
    pub records_read: usize,
    /// Records that could not be read, left for the next tick
    pub records_unreadable: usize,
    pub rows_malformed: usize,
    pub events_admitted: usize,
    pub events_late: usize,
    pub windows_emitted: usize,
    pub windows_evicted: usize,
    pub snapshot: Option<PathBuf>,
    pub watermark: Watermark,
}

impl TickReport {
    pub const fn is_committed(&self) -> bool {
        self.batch_id.is_some()
    }
}

#[derive(Debug)]
pub struct EmissionScheduler {
    records: RecordDirectory,
    store: Arc<SnapshotStore>,
    purge_committed: bool,
    engine: AggregationEngine,
    batch_id: u64,
    committed: BTreeSet<String>,
    stats: EmissionStats,
}

impl EmissionScheduler {
    /// New scheduler starting from an empty `engine`, call
    /// [`EmissionScheduler::resume`] to pick up from the last checkpoint.
    pub fn new(
        engine: AggregationEngine,
        records: RecordDirectory,
        store: Arc<SnapshotStore>,
        purge_committed: bool,
        stats: Either<Meter, EmissionStats>,
    ) -> Self {
        let stats = match stats {
            Either::Left(meter) => EmissionStats::new(meter),
            Either::Right(stats) => stats,
        };
        Self {
            records,
            store,
            purge_committed,
            engine,
            batch_id: 0,
            committed: BTreeSet::new(),
            stats,
        }
    }

    /// Restore the engine state, batch id and committed records from the last
    /// durable checkpoint
    pub async fn resume(mut self) -> Result<Self, StoreError> {
        match self.store.load_checkpoint().await? {
            Some(checkpoint) => {
                info!(
                    "[scheduler] Resuming from batch {} with {} committed record(s) and {} open window(s)",
                    checkpoint.batch_id,
                    checkpoint.committed.len(),
                    checkpoint.engine.windows.len()
                );
                self.engine = self.engine.with_state(checkpoint.engine);
                self.batch_id = checkpoint.batch_id;
                self.committed = checkpoint.committed;
            }
            None => info!("[scheduler] No checkpoint found, starting fresh"),
        }
        Ok(self)
    }

    pub const fn batch_id(&self) -> u64 {
        self.batch_id
    }

    pub fn committed(&self) -> &BTreeSet<String> {
        &self.committed
    }

    pub fn engine(&self) -> &AggregationEngine {
        &self.engine
    }

    /// Run a single tick.
    ///
    /// Either the whole batch is committed and becomes the live state, or
    /// nothing changes and the batch is retried by the next tick.
    pub async fn tick(&mut self) -> Result<TickReport, TickError> {
        let pending = self
            .records
            .list_pending(&self.committed)
            .await
            .map_err(|source| TickError::Input { source })?;
        let mut report = TickReport {
            watermark: self.engine.watermark(),
            ..Default::default()
        };
        if pending.is_empty() {
            trace!("[scheduler] No pending input records");
            return Ok(report);
        }

        let mut staged = self.engine.clone();
        let mut consumed = Vec::with_capacity(pending.len());
        for record in self.records.read(pending).await {
            let record = match record {
                Ok(record) => record,
                Err(err) => {
                    warn!("[scheduler] {err}, retrying on the next tick");
                    report.records_unreadable += 1;
                    continue;
                }
            };
            report.records_read += 1;
            let id = record.id().to_string();
            for row in record.into_rows() {
                match row {
                    Ok(event) => match staged.process_item(event) {
                        Either::Left(window) => {
                            trace!("[scheduler] Event at {} folded into {window}", event.event_time());
                            report.events_admitted += 1;
                        }
                        Either::Right(late) => {
                            debug!(
                                "[scheduler] Dropping late event at {} behind watermark {}",
                                late.event_time(),
                                staged.watermark()
                            );
                            report.events_late += 1;
                        }
                    },
                    Err(err) => {
                        warn!("[scheduler] Skipping malformed row: {err}");
                        self.stats
                            .records_malformed
                            .add(1, &[KeyValue::new("error.type", err.category())]);
                        report.rows_malformed += 1;
                    }
                }
            }
            consumed.push(id);
        }
        if consumed.is_empty() {
            return Ok(report);
        }

        let output = staged.emit();
        let batch_id = self.batch_id + 1;
        let mut committed = self.committed.clone();
        committed.extend(consumed);
        let checkpoint = Checkpoint {
            batch_id,
            committed,
            engine: staged.state(),
        };
        report.snapshot = match self.store.commit(&checkpoint, &output.averages).await {
            Ok(snapshot) => snapshot,
            Err(source) => {
                self.stats.ticks_failed.add(1, &[]);
                return Err(TickError::Commit { batch_id, source });
            }
        };

        self.engine = staged;
        self.batch_id = batch_id;
        self.committed = checkpoint.committed;

        report.batch_id = Some(batch_id);
        report.windows_emitted = output.averages.len();
        report.windows_evicted = output.evicted.len();
        report.watermark = output.watermark;
        self.record_stats(&report);
        debug!(
            "[scheduler] Committed batch {batch_id}: {} record(s), {} window(s) emitted, {} evicted, watermark {}",
            report.records_read, report.windows_emitted, report.windows_evicted, report.watermark
        );

        match self.store.compact(batch_id).await {
            Ok(deleted) => self.stats.snapshots_compacted.add(deleted as u64, &[]),
            Err(err) => warn!("[scheduler] Snapshot compaction failed: {err}"),
        }
        if self.purge_committed {
            self.purge().await;
        }
        Ok(report)
    }

    fn record_stats(&self, report: &TickReport) {
        self.stats.records_read.add(report.records_read as u64, &[]);
        self.stats
            .events_admitted
            .add(report.events_admitted as u64, &[]);
        self.stats.events_late.add(report.events_late as u64, &[]);
        self.stats
            .windows_emitted
            .add(report.windows_emitted as u64, &[]);
        self.stats
            .windows_evicted
            .add(report.windows_evicted as u64, &[]);
        self.stats.ticks_committed.add(1, &[]);
    }

    /// Delete committed input records. Their ids leave the committed set and
    /// drop out of the checkpoint on the next commit.
    async fn purge(&mut self) {
        let removed = self.records.purge(self.committed.clone()).await;
        if !removed.is_empty() {
            debug!("[scheduler] Purged {} committed record(s)", removed.len());
        }
        for id in removed {
            self.committed.remove(&id);
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub enum EmissionCommand {
    Shutdown,
}

#[derive(Debug)]
struct EmissionActor {
    cmd_recv: mpsc::Receiver<EmissionCommand>,
    scheduler: EmissionScheduler,
    tick_interval: Duration,
}

impl EmissionActor {
    fn new(
        cmd_recv: mpsc::Receiver<EmissionCommand>,
        scheduler: EmissionScheduler,
        tick_interval: Duration,
    ) -> Self {
        Self {
            cmd_recv,
            scheduler,
            tick_interval,
        }
    }

    async fn run(mut self) -> anyhow::Result<String> {
        info!(
            "[scheduler] Starting emission every {:?} from batch {}",
            self.tick_interval,
            self.scheduler.batch_id()
        );
        let mut ticker = interval(self.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                biased;
                cmd = self.cmd_recv.recv() => {
                    match cmd {
                        Some(EmissionCommand::Shutdown) => {
                            info!("[scheduler] Received shutdown command, shutting down EmissionActor");
                        }
                        None => {
                            info!("[scheduler] Command channel closed, shutting down EmissionActor");
                        }
                    }
                    return Ok("Emission scheduler terminated successfully".to_string());
                }
                _ = ticker.tick() => {
                    match self.scheduler.tick().await {
                        Ok(report) if report.is_committed() => {
                            if report.events_late > 0 || report.rows_malformed > 0 {
                                info!(
                                    "[scheduler] Batch {:?} dropped {} late event(s) and {} malformed row(s)",
                                    report.batch_id, report.events_late, report.rows_malformed
                                );
                            }
                        }
                        Ok(_) => {}
                        Err(err) => error!("[scheduler] Tick failed: {err}"),
                    }
                }
            }
        }
    }
}

#[derive(Debug)]
pub enum EmissionActorHandleError {
    SendError,
}

impl std::fmt::Display for EmissionActorHandleError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SendError => write!(f, "failed to send command to the emission actor"),
        }
    }
}

impl std::error::Error for EmissionActorHandleError {}

#[derive(Debug, Clone)]
pub struct EmissionActorHandle {
    cmd_send: mpsc::Sender<EmissionCommand>,
}

impl EmissionActorHandle {
    pub fn new(
        buffer_size: usize,
        scheduler: EmissionScheduler,
        tick_interval: Duration,
    ) -> (JoinHandle<anyhow::Result<String>>, Self) {
        let (cmd_send, cmd_recv) = mpsc::channel(buffer_size.max(1));
        let actor = EmissionActor::new(cmd_recv, scheduler, tick_interval);
        let join_handle = tokio::spawn(actor.run());
        (join_handle, Self { cmd_send })
    }

    pub async fn shutdown(&self) -> Result<(), EmissionActorHandleError> {
        self.cmd_send
            .send(EmissionCommand::Shutdown)
            .await
            .map_err(|_| EmissionActorHandleError::SendError)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn scheduler(dir: &TempDir) -> EmissionScheduler {
        let engine =
            AggregationEngine::new(Duration::from_secs(60), Duration::from_secs(30), 2).unwrap();
        let records = RecordDirectory::new(dir.path().join("input"), 4);
        let store = SnapshotStore::new(dir.path().join("output"), dir.path().join("checkpoint"), 10);
        EmissionScheduler::new(
            engine,
            records,
            Arc::new(store),
            false,
            Either::Left(opentelemetry::global::meter("streamavg-test")),
        )
    }

    async fn write_record(dir: &TempDir, name: &str, rows: &[&str]) {
        let input = dir.path().join("input");
        tokio::fs::create_dir_all(&input).await.unwrap();
        let mut content = String::from("event_time,value\n");
        for row in rows {
            content.push_str(row);
            content.push('\n');
        }
        tokio::fs::write(input.join(name), content).await.unwrap();
    }

    #[tokio::test]
    async fn test_idle_tick() {
        let dir = TempDir::new().unwrap();
        let mut scheduler = scheduler(&dir);
        let report = scheduler.tick().await.unwrap();
        assert!(!report.is_committed());
        assert_eq!(scheduler.batch_id(), 0);
    }

    #[tokio::test]
    async fn test_tick_commits_batch() {
        let dir = TempDir::new().unwrap();
        write_record(&dir, "event_1.csv", &["2025-01-01 00:00:05,10"]).await;
        write_record(&dir, "event_2.csv", &["2025-01-01 00:00:30,20"]).await;
        write_record(&dir, "event_3.csv", &["2025-01-01 00:00:55,30"]).await;
        write_record(&dir, "event_4.csv", &["bad,row"]).await;

        let mut scheduler = scheduler(&dir);
        let report = scheduler.tick().await.unwrap();
        assert_eq!(report.batch_id, Some(1));
        assert_eq!(report.records_read, 4);
        assert_eq!(report.events_admitted, 3);
        assert_eq!(report.rows_malformed, 1);
        assert_eq!(report.windows_emitted, 1);
        assert!(report.snapshot.is_some());
        assert_eq!(scheduler.committed().len(), 4);

        // Committed records are not read again
        let report = scheduler.tick().await.unwrap();
        assert!(!report.is_committed());
    }

    #[tokio::test]
    async fn test_actor_shutdown() {
        let dir = TempDir::new().unwrap();
        let (join, handle) =
            EmissionActorHandle::new(1, scheduler(&dir), Duration::from_millis(10));
        handle.shutdown().await.unwrap();
        let result = join.await.unwrap().unwrap();
        assert_eq!(result, "Emission scheduler terminated successfully");
    }
}
