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

//! Writing event records for the ingestion endpoint.

use crate::inputs::{RecordError, RECORD_EXTENSION, RECORD_HEADER};
use chrono::Utc;
use std::{
    path::{Path, PathBuf},
    sync::atomic::{AtomicU64, Ordering},
};
use tokio::fs;

/// Convert the URL friendly `YYYY-mm-dd_HH-mm-ss` form into the record form
/// `YYYY-mm-dd HH:mm:ss`.
///
/// Only the shape is checked here, a time that doesn't parse is recorded as is
/// and later skipped as malformed by the reader.
pub fn convert_event_time(raw: &str) -> Result<String, RecordError> {
    let converted = raw.replace('_', " ");
    let parts: Vec<&str> = converted.split(' ').collect();
    match parts.as_slice() {
        [date, time] => Ok(format!("{date} {}", time.replace('-', ":"))),
        _ => Err(RecordError::InvalidFormat {
            context: "event_time".to_string(),
            reason: format!(
                "expected a date and a time separated by '_', found {} parts in '{raw}'",
                parts.len()
            ),
        }),
    }
}

/// A field must fit in a single unquoted CSV column
pub fn check_field(name: &str, field: &str) -> Result<(), RecordError> {
    match field.find([',', '"', '\n', '\r']) {
        None => Ok(()),
        Some(position) => Err(RecordError::InvalidFormat {
            context: name.to_string(),
            reason: format!("separator, quote or line break at position {position}"),
        }),
    }
}

/// Writes one uniquely named record per submitted event
#[derive(Debug)]
pub struct EventRecorder {
    directory: PathBuf,
    /// Disambiguates records created within the same microsecond
    sequence: AtomicU64,
}

impl EventRecorder {
    pub fn new(directory: PathBuf) -> Self {
        Self {
            directory,
            sequence: AtomicU64::new(0),
        }
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    fn next_name(&self) -> String {
        let seq = self.sequence.fetch_add(1, Ordering::Relaxed);
        format!(
            "event_{}_{seq:06}.{RECORD_EXTENSION}",
            Utc::now().format("%Y%m%d%H%M%S%6f")
        )
    }

    /// Persist an event, `event_time` must already be in record form.
    ///
    /// Returns the path of the new record. Fields that would not make up
    /// exactly one data row are rejected before anything is written.
    pub async fn record(&self, event_time: &str, value: &str) -> Result<PathBuf, RecordError> {
        check_field("event_time", event_time)?;
        check_field("event_value", value)?;
        let name = self.next_name();
        let path = self.directory.join(&name);
        let tmp_path = self.directory.join(format!(".{name}.tmp"));
        let content = format!("{RECORD_HEADER}\n{event_time},{value}\n");
        let io_error = |context: String, e: std::io::Error| RecordError::IoError {
            context,
            reason: e.to_string(),
        };
        fs::create_dir_all(&self.directory).await.map_err(|e| {
            io_error(
                format!("creating directory '{}'", self.directory.display()),
                e,
            )
        })?;
        fs::write(&tmp_path, content)
            .await
            .map_err(|e| io_error(format!("writing file '{}'", tmp_path.display()), e))?;
        fs::rename(&tmp_path, &path)
            .await
            .map_err(|e| io_error(format!("renaming file '{}'", tmp_path.display()), e))?;
        Ok(path)
    }
}
