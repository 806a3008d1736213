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

//! Full emission ticks over temporary directories.

use either::Either;
use std::{path::Path, sync::Arc, time::Duration};
use streamavg_analytics::aggregation::AggregationEngine;
use streamavg_collector::{
    inputs::{recorder::EventRecorder, records::RecordDirectory},
    query::QueryService,
    scheduler::EmissionScheduler,
    store::SnapshotStore,
};
use tempfile::TempDir;

struct Setup {
    dir: TempDir,
    retention: usize,
    purge_committed: bool,
}

impl Setup {
    fn new() -> Self {
        Self {
            dir: TempDir::new().unwrap(),
            retention: 100,
            purge_committed: false,
        }
    }

    fn input(&self) -> std::path::PathBuf {
        self.dir.path().join("input_stream")
    }

    fn store(&self) -> Arc<SnapshotStore> {
        Arc::new(SnapshotStore::new(
            self.dir.path().join("output"),
            self.dir.path().join("checkpoint"),
            self.retention,
        ))
    }

    fn recorder(&self) -> EventRecorder {
        EventRecorder::new(self.input())
    }

    async fn scheduler(&self) -> EmissionScheduler {
        let store = self.store();
        store.create().await.unwrap();
        let engine =
            AggregationEngine::new(Duration::from_secs(60), Duration::from_secs(30), 2).unwrap();
        EmissionScheduler::new(
            engine,
            RecordDirectory::new(self.input(), 4),
            store,
            self.purge_committed,
            Either::Left(opentelemetry::global::meter("streamavg-test")),
        )
        .resume()
        .await
        .unwrap()
    }

    async fn latest(&self) -> Option<String> {
        QueryService::new(self.store()).get_latest().await.unwrap()
    }
}

async fn record(recorder: &EventRecorder, events: &[(&str, &str)]) {
    for (event_time, value) in events {
        recorder.record(event_time, value).await.unwrap();
    }
}

fn count_files(dir: &Path, extension: &str) -> usize {
    std::fs::read_dir(dir)
        .unwrap()
        .filter_map(Result::ok)
        .filter(|entry| {
            entry
                .path()
                .extension()
                .is_some_and(|ext| ext.to_string_lossy() == extension)
        })
        .count()
}

const WINDOW_0: &str = r#"{"start":"2025-01-01T00:00:00Z","end":"2025-01-01T00:01:00Z"}"#;
const WINDOW_1: &str = r#"{"start":"2025-01-01T00:01:00Z","end":"2025-01-01T00:02:00Z"}"#;

#[tokio::test]
async fn test_single_window_average() {
    let setup = Setup::new();
    assert_eq!(setup.latest().await, None);

    record(
        &setup.recorder(),
        &[
            ("2025-01-01 00:00:05", "10"),
            ("2025-01-01 00:00:10", "20"),
            ("2025-01-01 00:00:50", "30"),
        ],
    )
    .await;
    let mut scheduler = setup.scheduler().await;
    let report = scheduler.tick().await.unwrap();
    assert_eq!(report.batch_id, Some(1));
    assert_eq!(report.events_admitted, 3);
    assert_eq!(
        setup.latest().await.unwrap(),
        format!("{{\"window\":{WINDOW_0},\"value\":20.0}}\n")
    );
}

#[tokio::test]
async fn test_late_event_is_dropped() {
    let setup = Setup::new();
    let recorder = setup.recorder();
    let mut scheduler = setup.scheduler().await;

    record(&recorder, &[("2025-01-01 00:01:10", "5")]).await;
    let report = scheduler.tick().await.unwrap();
    assert_eq!(report.batch_id, Some(1));

    // The watermark is at 00:00:40 now
    record(&recorder, &[("2025-01-01 00:00:30", "100")]).await;
    let report = scheduler.tick().await.unwrap();
    assert_eq!(report.batch_id, Some(2));
    assert_eq!(report.events_late, 1);
    assert_eq!(report.windows_emitted, 0);
    assert_eq!(report.snapshot, None);

    assert_eq!(
        setup.latest().await.unwrap(),
        format!("{{\"window\":{WINDOW_1},\"value\":5.0}}\n")
    );
    assert_eq!(count_files(&setup.dir.path().join("output"), "json"), 1);
}

#[tokio::test]
async fn test_malformed_rows_are_skipped() {
    let setup = Setup::new();
    let recorder = setup.recorder();
    record(
        &recorder,
        &[
            ("2025-01-01 00:00:05", "10"),
            ("2025-01-01 00:00:06", "abc"),
            ("yesterday", "1"),
        ],
    )
    .await;
    let mut scheduler = setup.scheduler().await;
    let report = scheduler.tick().await.unwrap();
    assert_eq!(report.records_read, 3);
    assert_eq!(report.rows_malformed, 2);
    assert_eq!(report.events_admitted, 1);
    assert_eq!(
        setup.latest().await.unwrap(),
        format!("{{\"window\":{WINDOW_0},\"value\":10.0}}\n")
    );
}

#[tokio::test]
async fn test_resume_after_restart() {
    let setup = Setup::new();
    let recorder = setup.recorder();
    record(
        &recorder,
        &[("2025-01-01 00:00:05", "10"), ("2025-01-01 00:00:10", "20")],
    )
    .await;
    let mut scheduler = setup.scheduler().await;
    scheduler.tick().await.unwrap();
    drop(scheduler);

    // Committed records are not folded a second time, the open window keeps
    // its count and sum
    record(&recorder, &[("2025-01-01 00:00:50", "30")]).await;
    let mut scheduler = setup.scheduler().await;
    assert_eq!(scheduler.batch_id(), 1);
    assert_eq!(scheduler.committed().len(), 2);
    let report = scheduler.tick().await.unwrap();
    assert_eq!(report.batch_id, Some(2));
    assert_eq!(report.records_read, 1);
    assert_eq!(
        setup.latest().await.unwrap(),
        format!("{{\"window\":{WINDOW_0},\"value\":20.0}}\n")
    );
}

#[tokio::test]
async fn test_failed_commit_is_retried() {
    let setup = Setup::new();
    let recorder = setup.recorder();
    record(
        &recorder,
        &[("2025-01-01 00:00:05", "10"), ("2025-01-01 00:00:10", "20")],
    )
    .await;
    let mut scheduler = setup.scheduler().await;

    // A file in place of the checkpoint directory makes the checkpoint
    // write fail after the snapshot landed
    let checkpoint_dir = setup.dir.path().join("checkpoint");
    std::fs::remove_dir_all(&checkpoint_dir).unwrap();
    std::fs::write(&checkpoint_dir, "").unwrap();
    assert!(scheduler.tick().await.is_err());
    assert_eq!(scheduler.batch_id(), 0);
    assert!(scheduler.committed().is_empty());
    assert_eq!(scheduler.engine().open_windows(), 0);

    std::fs::remove_file(&checkpoint_dir).unwrap();
    std::fs::create_dir(&checkpoint_dir).unwrap();
    let report = scheduler.tick().await.unwrap();
    assert_eq!(report.batch_id, Some(1));
    assert_eq!(report.events_admitted, 2);
    assert_eq!(
        setup.latest().await.unwrap(),
        format!("{{\"window\":{WINDOW_0},\"value\":15.0}}\n")
    );
}

#[tokio::test]
async fn test_snapshot_retention() {
    let mut setup = Setup::new();
    setup.retention = 2;
    let recorder = setup.recorder();
    let mut scheduler = setup.scheduler().await;
    for second in ["05", "10", "15", "20"] {
        let event_time = format!("2025-01-01 00:00:{second}");
        record(&recorder, &[(event_time.as_str(), "1")]).await;
        scheduler.tick().await.unwrap();
    }
    assert_eq!(scheduler.batch_id(), 4);
    assert_eq!(count_files(&setup.dir.path().join("output"), "json"), 2);
    assert!(setup.latest().await.is_some());
}

#[tokio::test]
async fn test_purge_committed_records() {
    let mut setup = Setup::new();
    setup.purge_committed = true;
    record(
        &setup.recorder(),
        &[("2025-01-01 00:00:05", "10"), ("2025-01-01 00:00:10", "20")],
    )
    .await;
    let mut scheduler = setup.scheduler().await;
    scheduler.tick().await.unwrap();
    assert_eq!(count_files(&setup.input(), "csv"), 0);
    assert!(scheduler.committed().is_empty());
    assert_eq!(
        setup.latest().await.unwrap(),
        format!("{{\"window\":{WINDOW_0},\"value\":15.0}}\n")
    );
}

#[tokio::test]
async fn test_retried_batch_without_averages_serves_nothing_stale() {
    let setup = Setup::new();
    let recorder = setup.recorder();
    let path = recorder.record("2025-01-01 00:00:05", "999").await.unwrap();
    let mut scheduler = setup.scheduler().await;

    let checkpoint_dir = setup.dir.path().join("checkpoint");
    std::fs::remove_dir_all(&checkpoint_dir).unwrap();
    std::fs::write(&checkpoint_dir, "").unwrap();
    assert!(scheduler.tick().await.is_err());
    std::fs::remove_file(&checkpoint_dir).unwrap();

    // The batch is retried over a different input set without any average
    std::fs::remove_file(path).unwrap();
    std::fs::write(setup.input().join("event_x.csv"), "event_time,value\nbad,row\n").unwrap();
    let report = scheduler.tick().await.unwrap();
    assert_eq!(report.batch_id, Some(1));
    assert_eq!(report.windows_emitted, 0);
    assert_eq!(setup.latest().await, None);
}

#[tokio::test]
async fn test_undecodable_record_is_consumed() {
    let setup = Setup::new();
    std::fs::create_dir_all(setup.input()).unwrap();
    let mut content = b"event_time,value\n2025-01-01 00:00:05,".to_vec();
    content.extend_from_slice(&[0xff, 0xfe, b'\n']);
    std::fs::write(setup.input().join("event_1.csv"), content).unwrap();

    let mut scheduler = setup.scheduler().await;
    let report = scheduler.tick().await.unwrap();
    assert_eq!(report.batch_id, Some(1));
    assert_eq!(report.records_unreadable, 0);
    assert_eq!(report.rows_malformed, 1);
    assert!(!scheduler.tick().await.unwrap().is_committed());
}

#[tokio::test]
async fn test_injected_row_is_not_folded() {
    let setup = Setup::new();
    let recorder = setup.recorder();
    assert!(recorder
        .record("2025-01-01 00:00:05", "10\n2025-01-01 00:00:06,1000\nx")
        .await
        .is_err());
    // A hand written record with extra rows is malformed as a whole
    std::fs::create_dir_all(setup.input()).unwrap();
    std::fs::write(
        setup.input().join("event_2.csv"),
        "event_time,value\n2025-01-01 00:00:05,10\n2025-01-01 00:00:06,1000\n",
    )
    .unwrap();
    let mut scheduler = setup.scheduler().await;
    let report = scheduler.tick().await.unwrap();
    assert_eq!(report.events_admitted, 0);
    assert_eq!(report.rows_malformed, 1);
    assert_eq!(setup.latest().await, None);
}
