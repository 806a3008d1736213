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

//! Tick-oriented windowed average engine.
//!
//! `AggregationEngine` owns the watermark, the window assignment and the
//! per-window state. It is an explicit value rather than ambient state: the
//! caller feeds items with [`AggregationEngine::process_item`] and closes a
//! tick with [`AggregationEngine::emit`]. Cloning the engine gives an
//! independent copy, which is how a tick can be staged and discarded if the
//! commit fails.
//!
//! The serializable [`EngineState`] captures everything needed to resume
//! after a restart with exactly the same results.

use crate::{
    state::{AggregationStateStore, ApplyOutcome, WindowAverage, WindowState},
    watermark::{Watermark, WatermarkTracker},
    window::{Window, WindowAssigner},
    DurationError, TimeSeriesData,
};
use chrono::{DateTime, Utc};
use either::Either;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Durable engine state, excluding configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineState {
    /// Max event time observed so far
    pub max_seen: Option<DateTime<Utc>>,
    /// Windows that are still open
    pub windows: Vec<WindowState>,
}

/// Result of closing a tick
#[derive(Debug, Clone, PartialEq)]
pub struct TickOutput {
    /// Averages of the windows touched during the tick, ordered by window
    /// start
    pub averages: Vec<WindowAverage>,
    /// Windows finalized by the watermark during the tick
    pub evicted: Vec<WindowState>,
    /// Watermark at the end of the tick
    pub watermark: Watermark,
}

#[derive(Debug, Clone)]
pub struct AggregationEngine {
    tracker: WatermarkTracker,
    assigner: WindowAssigner,
    store: AggregationStateStore,
}

impl AggregationEngine {
    /// Create a new `AggregationEngine` with the given window duration,
    /// lateness threshold and number of decimal places for emitted averages
    pub fn new(
        window_duration: Duration,
        lateness: Duration,
        precision: u32,
    ) -> Result<Self, DurationError> {
        Ok(Self {
            tracker: WatermarkTracker::new(lateness)?,
            assigner: WindowAssigner::new(window_duration)?,
            store: AggregationStateStore::new(precision),
        })
    }

    /// Replace the current state with a previously captured one
    pub fn with_state(mut self, state: EngineState) -> Self {
        self.tracker = self.tracker.with_max_seen(state.max_seen);
        self.store = AggregationStateStore::restore(self.store.precision(), state.windows);
        self
    }

    /// Capture the durable state. Windows mutated but not yet emitted are
    /// captured as well, callers should only do this right after `emit`.
    pub fn state(&self) -> EngineState {
        EngineState {
            max_seen: self.tracker.max_seen(),
            windows: self.store.windows().cloned().collect(),
        }
    }

    pub fn watermark(&self) -> Watermark {
        self.tracker.current()
    }

    pub fn window_size(&self) -> Duration {
        self.assigner.size()
    }

    pub fn lateness(&self) -> Duration {
        self.tracker.lateness()
    }

    pub fn open_windows(&self) -> usize {
        self.store.len()
    }

    pub fn store(&self) -> &AggregationStateStore {
        &self.store
    }

    /// Advance the watermark with the item time, then fold the item into its
    /// window.
    ///
    /// Returns the window the item was assigned to, or hands the item back
    /// when it is late.
    pub fn process_item<T: TimeSeriesData>(&mut self, item: T) -> Either<Window, T> {
        let watermark = self.tracker.advance(item.get_ts());
        let window = self.assigner.assign(item.get_ts());
        match self.store.apply(&item, window, watermark) {
            ApplyOutcome::Applied { .. } => Either::Left(window),
            ApplyOutcome::DroppedLate => Either::Right(item),
        }
    }

    /// Close the current tick: snapshot the windows that changed, then evict
    /// the windows the watermark has finalized.
    pub fn emit(&mut self) -> TickOutput {
        let averages = self.store.snapshot_dirty();
        let watermark = self.tracker.current();
        let evicted = self.store.evict_closed(watermark);
        TickOutput {
            averages,
            evicted,
            watermark,
        }
    }
}
