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

//! Event-time windowed aggregation with watermark based late-data handling.
//!
//! The main components are:
//! - `WatermarkTracker`: tracks the max event time seen and derives the
//!   watermark below which events are considered late
//! - `WindowAssigner`: maps an event time to its fixed-size, half-open window
//! - `AggregationStateStore`: per-window running count and sum, with a dirty
//!   set of windows mutated since the last snapshot
//! - `AggregationEngine`: the explicit state object tying the three together,
//!   advanced one item at a time and snapshotted once per tick
//!
//! None of the components perform any I/O, the caller decides when items are
//! processed and when snapshots are taken.
//!
//! Example usage:
//! ```text
//! use std::time::Duration;
//! use streamavg_analytics::{aggregation::AggregationEngine, Event};
//!
//! let mut engine = AggregationEngine::new(
//!     Duration::from_secs(60), // 1 minute windows
//!     Duration::from_secs(30), // 30 seconds lateness allowed
//!     2,                       // round averages to 2 decimal places
//! )?;
//! for event in events {
//!     engine.process_item(event);
//! }
//! let output = engine.emit();
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub mod aggregation;
pub mod state;
pub mod watermark;
pub mod window;

/// A trait for defining time-series data points that can be averaged
pub trait TimeSeriesData {
    fn get_ts(&self) -> DateTime<Utc>;
    fn get_value(&self) -> f64;
}

/// A single timestamped numeric observation
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Event {
    event_time: DateTime<Utc>,
    value: f64,
}

impl Event {
    pub const fn new(event_time: DateTime<Utc>, value: f64) -> Self {
        Self { event_time, value }
    }

    pub const fn event_time(&self) -> DateTime<Utc> {
        self.event_time
    }

    pub const fn value(&self) -> f64 {
        self.value
    }
}

impl TimeSeriesData for Event {
    fn get_ts(&self) -> DateTime<Utc> {
        self.event_time
    }

    fn get_value(&self) -> f64 {
        self.value
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DurationError {
    ZeroWindowSize,
    SubMillisecondWindowSize(Duration),
    OutOfRange(Duration),
}

impl std::fmt::Display for DurationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ZeroWindowSize => write!(f, "window size must be greater than 0"),
            Self::SubMillisecondWindowSize(size) => {
                write!(
                    f,
                    "window size {size:?} is not a whole number of milliseconds"
                )
            }
            Self::OutOfRange(duration) => write!(f, "duration {duration:?} is out of range"),
        }
    }
}

impl std::error::Error for DurationError {}
