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

//! Streaming windowed average collector.
//!
//! Events are recorded as small durable files by the ingestion endpoint (or by
//! any other producer), folded into tumbling windows by the emission
//! scheduler on a fixed interval, and the changed window averages are
//! committed as snapshots served by the query endpoint.

use crate::{
    config::CollectorConfig,
    http::{HttpState, IngestStats},
    inputs::{recorder::EventRecorder, records::RecordDirectory},
    query::QueryService,
    scheduler::{EmissionActorHandle, EmissionScheduler},
    store::SnapshotStore,
};
use futures::{stream::FuturesUnordered, StreamExt};
use std::{sync::Arc, time::Duration};
use tracing::{info, warn};

pub mod config;
pub mod http;
pub mod inputs;
pub mod query;
pub mod scheduler;
pub mod store;
pub mod telemetry;

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Run the emission scheduler and the HTTP server until a termination signal
/// or until either of them exits.
pub async fn run_collector(
    config: CollectorConfig,
    meter: opentelemetry::metrics::Meter,
) -> anyhow::Result<()> {
    let engine = config.aggregation.engine()?;
    let records = RecordDirectory::new(
        config.input.directory.clone(),
        config.scheduler.read_concurrency,
    );
    records.create().await?;
    let store = Arc::new(SnapshotStore::new(
        config.output.snapshot_directory.clone(),
        config.output.checkpoint_directory.clone(),
        config.output.snapshot_retention,
    ));
    store.create().await?;

    let scheduler = EmissionScheduler::new(
        engine,
        records,
        store.clone(),
        config.input.purge_committed,
        either::Left(meter.clone()),
    )
    .resume()
    .await?;
    let (scheduler_join, scheduler_handle) = EmissionActorHandle::new(
        config.scheduler.cmd_buffer_size,
        scheduler,
        config.scheduler.tick_interval,
    );

    let recorder = config
        .http
        .ingest
        .then(|| Arc::new(EventRecorder::new(config.input.directory.clone())));
    let state = HttpState::new(QueryService::new(store), recorder, IngestStats::new(meter));
    let router = http::router(state, config.http.request_timeout);
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
    let http_join = tokio::spawn(http::serve(config.http.address, router, async move {
        let _ = shutdown_rx.await;
    }));

    let mut join_set = FuturesUnordered::new();
    join_set.push(scheduler_join);
    join_set.push(http_join);

    let ret = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Termination signal received, gracefully shutting down");
            Ok(())
        }
        join_ret = join_set.next() => {
            warn!("Collector task exited, shutting down the collector");
            match join_ret {
                None | Some(Ok(Ok(_))) => Ok(()),
                Some(Err(err)) => Err(anyhow::anyhow!(err)),
                Some(Ok(Err(err))) => Err(err),
            }
        }
    };

    let _ = shutdown_tx.send(());
    if let Err(err) = scheduler_handle.shutdown().await {
        info!("Emission scheduler already stopped: {err}");
    }
    loop {
        match tokio::time::timeout(SHUTDOWN_TIMEOUT, join_set.next()).await {
            Ok(Some(Ok(Ok(msg)))) => info!("{msg}"),
            Ok(Some(Ok(Err(err)))) => warn!("Collector task failed: {err}"),
            Ok(Some(Err(err))) => warn!("Collector task panicked: {err}"),
            Ok(None) => break,
            Err(_) => {
                warn!("Timeout waiting for collector tasks to terminate");
                break;
            }
        }
    }
    ret
}
