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

//! Durable event records.
//!
//! Every submitted event is persisted as its own small CSV file in a monitored
//! directory, the record id being the file name. Files are written to a
//! hidden temporary name and renamed into place, so a reader listing the
//! directory only ever sees complete records.
//!
//! - [`records`] - Listing and parsing records not yet committed
//! - [`recorder`] - Writing new records on behalf of the ingestion endpoint

pub mod recorder;
pub mod records;

/// Header line of every record
pub const RECORD_HEADER: &str = "event_time,value";

/// Format of the `event_time` column
pub const RECORD_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Extension of complete record files
pub const RECORD_EXTENSION: &str = "csv";

/// Categorized errors from reading or writing event records.
#[derive(Debug, Clone, PartialEq, Eq, strum_macros::Display)]
pub enum RecordError {
    #[strum(to_string = "Empty record {context}")]
    Empty { context: String },

    #[strum(to_string = "Missing header in {context}, expected 'event_time,value'")]
    MissingHeader { context: String },

    #[strum(to_string = "Invalid format in {context}: {reason}")]
    InvalidFormat { context: String, reason: String },

    #[strum(to_string = "Invalid event time in {context}: {reason}")]
    InvalidTime { context: String, reason: String },

    #[strum(to_string = "Invalid value in {context}: {reason}")]
    InvalidValue { context: String, reason: String },

    #[strum(to_string = "IO error in {context}: {reason}")]
    IoError { context: String, reason: String },
}

impl std::error::Error for RecordError {}

impl RecordError {
    /// Returns a static category label for metrics classification.
    pub fn category(&self) -> &'static str {
        match self {
            Self::Empty { .. } => "empty",
            Self::MissingHeader { .. } => "missing_header",
            Self::InvalidFormat { .. } => "invalid_format",
            Self::InvalidTime { .. } => "invalid_time",
            Self::InvalidValue { .. } => "invalid_value",
            Self::IoError { .. } => "io_error",
        }
    }
}
