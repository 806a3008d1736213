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

//! Read side of the snapshot store.

use crate::store::{SnapshotStore, StoreError};
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, strum_macros::Display)]
pub enum QueryError {
    #[strum(to_string = "{source}")]
    Store { source: StoreError },
}

impl std::error::Error for QueryError {}

impl From<StoreError> for QueryError {
    fn from(source: StoreError) -> Self {
        Self::Store { source }
    }
}

/// Serves the most recently committed snapshot.
///
/// Never observes a partially written artifact, nor one whose batch was not
/// committed by the checkpoint.
#[derive(Debug, Clone)]
pub struct QueryService {
    store: Arc<SnapshotStore>,
}

impl QueryService {
    pub fn new(store: Arc<SnapshotStore>) -> Self {
        Self { store }
    }

    /// Content of the latest committed snapshot, `None` before the first
    /// snapshot is committed
    pub async fn get_latest(&self) -> Result<Option<String>, QueryError> {
        let latest = self.store.latest_snapshot().await?;
        if latest.is_none() {
            debug!("No committed snapshot available");
        }
        Ok(latest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Checkpoint;
    use chrono::{TimeZone, Utc};
    use std::time::Duration;
    use streamavg_analytics::{state::WindowAverage, window::WindowAssigner};
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_get_latest() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(SnapshotStore::new(
            dir.path().join("output"),
            dir.path().join("checkpoint"),
            3,
        ));
        let query = QueryService::new(store.clone());
        assert_eq!(query.get_latest().await.unwrap(), None);

        store.create().await.unwrap();
        let window = WindowAssigner::new(Duration::from_secs(60))
            .unwrap()
            .assign(Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 5).unwrap());
        let checkpoint = Checkpoint {
            batch_id: 1,
            ..Default::default()
        };
        store
            .commit(&checkpoint, &[WindowAverage { window, value: 20.0 }])
            .await
            .unwrap();
        assert_eq!(
            query.get_latest().await.unwrap().as_deref(),
            Some(
                "{\"window\":{\"start\":\"2025-01-01T00:00:00Z\",\"end\":\"2025-01-01T00:01:00Z\"},\"value\":20.0}\n"
            )
        );
    }

    #[tokio::test]
    async fn test_get_latest_corrupt_checkpoint() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(SnapshotStore::new(
            dir.path().join("output"),
            dir.path().join("checkpoint"),
            3,
        ));
        store.create().await.unwrap();
        tokio::fs::write(store.checkpoint_path(), "garbage")
            .await
            .unwrap();
        let query = QueryService::new(store);
        assert!(query.get_latest().await.is_err());
    }
}
