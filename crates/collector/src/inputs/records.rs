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

//! Reading event records from the monitored input directory.
//!
//! Records are immutable once renamed into place, so reading them can be done
//! concurrently. The result is always returned ordered by record id which, for
//! the timestamped names produced by the recorder, is creation order.

use crate::inputs::{RecordError, RECORD_EXTENSION, RECORD_HEADER, RECORD_TIME_FORMAT};
use chrono::NaiveDateTime;
use futures::{stream, StreamExt};
use std::{
    collections::BTreeSet,
    path::{Path, PathBuf},
};
use streamavg_analytics::Event;
use tokio::fs;
use tracing::{debug, warn};

/// A durable record and the outcome of parsing each of its data rows
#[derive(Debug, Clone, PartialEq)]
pub struct EventRecord {
    id: String,
    rows: Vec<Result<Event, RecordError>>,
}

impl EventRecord {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn rows(&self) -> &[Result<Event, RecordError>] {
        &self.rows
    }

    pub fn into_rows(self) -> Vec<Result<Event, RecordError>> {
        self.rows
    }
}

/// Parse the content of a record.
///
/// A record holds a header and exactly one data row. Any other shape yields a
/// single error.
pub fn parse_record(id: &str, content: &str) -> Vec<Result<Event, RecordError>> {
    let mut lines = content
        .lines()
        .map(|line| line.trim())
        .filter(|line| !line.is_empty());
    let row = match lines.next() {
        None => Err(RecordError::Empty {
            context: id.to_string(),
        }),
        Some(header) if header != RECORD_HEADER => Err(RecordError::MissingHeader {
            context: id.to_string(),
        }),
        Some(_) => {
            let rows: Vec<&str> = lines.collect();
            match rows.as_slice() {
                [] => Err(RecordError::Empty {
                    context: id.to_string(),
                }),
                [row] => parse_row(id, row),
                _ => Err(RecordError::InvalidFormat {
                    context: id.to_string(),
                    reason: format!("expected one data row, found {}", rows.len()),
                }),
            }
        }
    };
    vec![row]
}

fn parse_row(context: &str, line: &str) -> Result<Event, RecordError> {
    let columns: Vec<&str> = line.split(',').map(|column| column.trim()).collect();
    let [event_time, value] = columns.as_slice() else {
        return Err(RecordError::InvalidFormat {
            context: context.to_string(),
            reason: format!("expected 2 columns, found {}", columns.len()),
        });
    };
    let event_time = NaiveDateTime::parse_from_str(event_time, RECORD_TIME_FORMAT)
        .map_err(|e| RecordError::InvalidTime {
            context: context.to_string(),
            reason: format!("'{event_time}': {e}"),
        })?
        .and_utc();
    let value = value
        .parse::<f64>()
        .ok()
        .filter(|value| value.is_finite())
        .ok_or_else(|| RecordError::InvalidValue {
            context: context.to_string(),
            reason: format!("'{value}' is not a finite number"),
        })?;
    Ok(Event::new(event_time, value))
}

/// Complete record files only, temporary files start with a dot
fn is_record_name(name: &str) -> bool {
    !name.starts_with('.')
        && Path::new(name)
            .extension()
            .is_some_and(|ext| ext == RECORD_EXTENSION)
}

#[derive(Debug, Clone)]
pub struct RecordDirectory {
    path: PathBuf,
    read_concurrency: usize,
}

impl RecordDirectory {
    pub fn new(path: PathBuf, read_concurrency: usize) -> Self {
        Self {
            path,
            read_concurrency: read_concurrency.max(1),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn create(&self) -> Result<(), RecordError> {
        fs::create_dir_all(&self.path)
            .await
            .map_err(|e| RecordError::IoError {
                context: format!("creating directory '{}'", self.path.display()),
                reason: e.to_string(),
            })
    }

    /// Ids of the records present in the directory and not in `committed`,
    /// sorted
    pub async fn list_pending(
        &self,
        committed: &BTreeSet<String>,
    ) -> Result<Vec<String>, RecordError> {
        let io_error = |e: std::io::Error| RecordError::IoError {
            context: format!("listing directory '{}'", self.path.display()),
            reason: e.to_string(),
        };
        let mut entries = match fs::read_dir(&self.path).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("Input directory {:?} does not exist yet", self.path);
                return Ok(Vec::new());
            }
            Err(e) => return Err(io_error(e)),
        };
        let mut pending = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(io_error)? {
            let Some(name) = entry.file_name().to_str().map(ToString::to_string) else {
                warn!("Ignoring input file with a non UTF-8 name: {:?}", entry.path());
                continue;
            };
            if is_record_name(&name) && !committed.contains(&name) {
                pending.push(name);
            }
        }
        pending.sort();
        Ok(pending)
    }

    async fn read_one(&self, id: String) -> Result<EventRecord, RecordError> {
        let path = self.path.join(&id);
        let bytes = fs::read(&path).await.map_err(|e| RecordError::IoError {
            context: format!("reading file '{}'", path.display()),
            reason: e.to_string(),
        })?;
        // Undecodable content is malformed, the record is still consumed
        let rows = match String::from_utf8(bytes) {
            Ok(content) => parse_record(&id, &content),
            Err(e) => vec![Err(RecordError::InvalidFormat {
                context: id.clone(),
                reason: format!("not valid UTF-8: {e}"),
            })],
        };
        Ok(EventRecord { id, rows })
    }

    /// Read the given records concurrently, results keep the order of `ids`.
    ///
    /// A record that can't be read is returned as an error and must not be
    /// considered consumed.
    pub async fn read(&self, ids: Vec<String>) -> Vec<Result<EventRecord, RecordError>> {
        stream::iter(ids)
            .map(|id| self.read_one(id))
            .buffered(self.read_concurrency)
            .collect()
            .await
    }

    /// Delete the given records, returning the ids actually removed
    pub async fn purge(&self, ids: impl IntoIterator<Item = String>) -> Vec<String> {
        let mut removed = Vec::new();
        for id in ids {
            let path = self.path.join(&id);
            match fs::remove_file(&path).await {
                Ok(()) => removed.push(id),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => removed.push(id),
                Err(e) => warn!("Failed to purge committed record {:?}: {}", path, e),
            }
        }
        removed
    }
}
