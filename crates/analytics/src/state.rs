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

//! Mutable per-window running aggregates.
//!
//! Each open window holds a running count and sum keyed by the window start.
//! Windows mutated since the last [`AggregationStateStore::snapshot_dirty`]
//! call are tracked so only the changed averages are emitted. Once the
//! watermark passes a window end the window is evicted, after which the store
//! holds no further history for it.

use crate::{watermark::Watermark, window::Window, TimeSeriesData};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Running aggregate of a single window
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WindowState {
    window: Window,
    count: u64,
    sum: f64,
}

impl WindowState {
    pub const fn new(window: Window) -> Self {
        Self {
            window,
            count: 0,
            sum: 0.0,
        }
    }

    pub const fn window(&self) -> Window {
        self.window
    }

    pub const fn count(&self) -> u64 {
        self.count
    }

    pub const fn sum(&self) -> f64 {
        self.sum
    }

    fn push(&mut self, value: f64) {
        self.count += 1;
        self.sum += value;
    }

    /// Arithmetic mean, undefined for an empty window or once the sum
    /// overflowed
    pub fn average(&self) -> Option<f64> {
        if self.count == 0 {
            return None;
        }
        Some(self.sum / self.count as f64).filter(|avg| avg.is_finite())
    }
}

/// Externally visible average of one window
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WindowAverage {
    pub window: Window,
    pub value: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// The item was folded into its window, `created` is set when it is the
    /// first item of that window
    Applied { created: bool },
    /// The item is below the watermark and the state was left untouched
    DroppedLate,
}

/// Round half away from zero to `precision` decimal places
pub fn round_to(value: f64, precision: u32) -> f64 {
    let factor = 10f64.powi(precision as i32);
    let scaled = value * factor;
    if !scaled.is_finite() {
        // Far beyond the fractional digits of an f64 already
        return value;
    }
    scaled.round() / factor
}

#[derive(Debug, Clone, Default)]
pub struct AggregationStateStore {
    /// Open windows keyed by window start
    active: BTreeMap<DateTime<Utc>, WindowState>,
    /// Windows mutated since the previous snapshot
    dirty: BTreeSet<DateTime<Utc>>,
    /// Decimal places of emitted averages
    precision: u32,
}

impl AggregationStateStore {
    pub fn new(precision: u32) -> Self {
        Self {
            active: BTreeMap::new(),
            dirty: BTreeSet::new(),
            precision,
        }
    }

    /// Rebuild a store from committed window states. Restored windows are
    /// clean, they were already emitted before being committed.
    pub fn restore(precision: u32, windows: impl IntoIterator<Item = WindowState>) -> Self {
        Self {
            active: windows
                .into_iter()
                .map(|state| (state.window.start(), state))
                .collect(),
            dirty: BTreeSet::new(),
            precision,
        }
    }

    pub const fn precision(&self) -> u32 {
        self.precision
    }

    pub fn len(&self) -> usize {
        self.active.len()
    }

    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }

    pub fn get(&self, window: &Window) -> Option<&WindowState> {
        self.active.get(&window.start())
    }

    /// Open windows ordered by start time
    pub fn windows(&self) -> impl Iterator<Item = &WindowState> {
        self.active.values()
    }

    pub fn dirty_count(&self) -> usize {
        self.dirty.len()
    }

    /// Fold `item` into `window`.
    ///
    /// Callers are expected to filter late items beforehand, the watermark is
    /// checked again here so a late item can never mutate state.
    pub fn apply<T: TimeSeriesData>(
        &mut self,
        item: &T,
        window: Window,
        watermark: Watermark,
    ) -> ApplyOutcome {
        if !watermark.admits(item.get_ts()) {
            return ApplyOutcome::DroppedLate;
        }
        let mut created = false;
        let state = self.active.entry(window.start()).or_insert_with(|| {
            created = true;
            WindowState::new(window)
        });
        state.push(item.get_value());
        self.dirty.insert(window.start());
        ApplyOutcome::Applied { created }
    }

    /// Returns the rounded average of every window mutated since the
    /// previous call, ordered by window start, and clears the dirty set.
    pub fn snapshot_dirty(&mut self) -> Vec<WindowAverage> {
        let dirty = std::mem::take(&mut self.dirty);
        dirty
            .into_iter()
            .filter_map(|start| self.active.get(&start))
            .filter_map(|state| {
                state.average().map(|avg| WindowAverage {
                    window: state.window,
                    value: round_to(avg, self.precision),
                })
            })
            .collect()
    }

    /// Removes windows whose end is at or below the watermark and returns
    /// them
    pub fn evict_closed(&mut self, watermark: Watermark) -> Vec<WindowState> {
        let closed: Vec<DateTime<Utc>> = self
            .active
            .values()
            .filter(|state| watermark.has_passed(state.window.end()))
            .map(|state| state.window.start())
            .collect();
        closed
            .into_iter()
            .filter_map(|start| {
                self.dirty.remove(&start);
                self.active.remove(&start)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{window::WindowAssigner, Event};
    use chrono::TimeZone;
    use rstest::rstest;
    use std::time::Duration;

    fn ts(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 1, h, m, s).unwrap()
    }

    fn minutes() -> WindowAssigner {
        WindowAssigner::new(Duration::from_secs(60)).unwrap()
    }

    #[test]
    fn test_apply_and_snapshot() {
        let assigner = minutes();
        let mut store = AggregationStateStore::new(2);
        let first = Event::new(ts(0, 0, 5), 10.0);
        let second = Event::new(ts(0, 0, 10), 20.0);
        assert_eq!(
            store.apply(&first, assigner.assign(first.event_time()), Watermark::unset()),
            ApplyOutcome::Applied { created: true }
        );
        assert_eq!(
            store.apply(&second, assigner.assign(second.event_time()), Watermark::unset()),
            ApplyOutcome::Applied { created: false }
        );
        let snapshot = store.snapshot_dirty();
        assert_eq!(
            snapshot,
            vec![WindowAverage {
                window: assigner.assign(ts(0, 0, 0)),
                value: 15.0,
            }]
        );
        // Dirty set is cleared
        assert!(store.snapshot_dirty().is_empty());
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_late_item_is_not_applied() {
        let assigner = minutes();
        let mut store = AggregationStateStore::new(2);
        let late = Event::new(ts(0, 0, 5), 10.0);
        assert_eq!(
            store.apply(&late, assigner.assign(late.event_time()), Watermark::at(ts(0, 0, 6))),
            ApplyOutcome::DroppedLate
        );
        assert!(store.is_empty());
        assert_eq!(store.dirty_count(), 0);
        assert!(store.snapshot_dirty().is_empty());
    }

    #[test]
    fn test_snapshot_only_contains_dirty_windows() {
        let assigner = minutes();
        let mut store = AggregationStateStore::new(2);
        for event in [
            Event::new(ts(0, 0, 1), 1.0),
            Event::new(ts(0, 1, 1), 2.0),
        ] {
            store.apply(&event, assigner.assign(event.event_time()), Watermark::unset());
        }
        assert_eq!(store.snapshot_dirty().len(), 2);
        let event = Event::new(ts(0, 1, 2), 4.0);
        store.apply(&event, assigner.assign(event.event_time()), Watermark::unset());
        assert_eq!(
            store.snapshot_dirty(),
            vec![WindowAverage {
                window: assigner.assign(ts(0, 1, 0)),
                value: 3.0,
            }]
        );
    }

    #[test]
    fn test_evict_closed() {
        let assigner = minutes();
        let mut store = AggregationStateStore::new(2);
        for event in [
            Event::new(ts(0, 0, 1), 1.0),
            Event::new(ts(0, 1, 1), 2.0),
            Event::new(ts(0, 2, 1), 3.0),
        ] {
            store.apply(&event, assigner.assign(event.event_time()), Watermark::unset());
        }
        // Window end equal to the watermark is closed
        let evicted = store.evict_closed(Watermark::at(ts(0, 2, 0)));
        assert_eq!(
            evicted.iter().map(|x| x.window().start()).collect::<Vec<_>>(),
            vec![ts(0, 0, 0), ts(0, 1, 0)]
        );
        assert_eq!(store.len(), 1);
        // Evicted windows are not part of a later snapshot
        assert_eq!(store.snapshot_dirty().len(), 1);
        assert!(store.evict_closed(Watermark::unset()).is_empty());
    }

    #[test]
    fn test_empty_window_has_no_average() {
        let state = WindowState::new(minutes().assign(ts(0, 0, 0)));
        assert_eq!(state.average(), None);
    }

    #[test]
    fn test_overflowing_window_is_not_emitted() {
        let assigner = minutes();
        let mut store = AggregationStateStore::new(2);
        for second in [1, 2] {
            let event = Event::new(ts(0, 0, second), f64::MAX);
            store.apply(&event, assigner.assign(event.event_time()), Watermark::unset());
        }
        assert_eq!(store.len(), 1);
        assert!(store.snapshot_dirty().is_empty());
    }

    #[test]
    fn test_restore_is_clean() {
        let assigner = minutes();
        let mut store = AggregationStateStore::new(2);
        let event = Event::new(ts(0, 0, 1), 7.0);
        store.apply(&event, assigner.assign(event.event_time()), Watermark::unset());
        let restored = AggregationStateStore::restore(2, store.windows().cloned());
        assert_eq!(restored.len(), 1);
        assert_eq!(restored.dirty_count(), 0);
        assert_eq!(
            restored.get(&assigner.assign(ts(0, 0, 30))).map(|x| x.count()),
            Some(1)
        );
    }

    #[rstest]
    #[case(20.0, 2, 20.0)]
    #[case(1.0 / 3.0, 2, 0.33)]
    #[case(2.0 / 3.0, 2, 0.67)]
    #[case(2.675, 0, 3.0)]
    #[case(-1.25, 1, -1.3)]
    #[case(1e300, 10, 1e300)]
    #[case(-1e300, 10, -1e300)]
    fn test_round_to(#[case] input: f64, #[case] precision: u32, #[case] expected: f64) {
        assert_eq!(round_to(input, precision), expected);
    }

    #[test]
    fn test_window_average_serialization() {
        let average = WindowAverage {
            window: minutes().assign(ts(0, 0, 5)),
            value: 20.0,
        };
        let json = serde_json::to_string(&average).unwrap();
        assert_eq!(
            json,
            r#"{"window":{"start":"2025-01-01T00:00:00Z","end":"2025-01-01T00:01:00Z"},"value":20.0}"#
        );
    }
}
