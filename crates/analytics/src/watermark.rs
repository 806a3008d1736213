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

//! Watermark tracking for event-time processing.
//!
//! The watermark is `max(event_time seen so far) - lateness`. It never moves
//! backwards regardless of arrival order, and items strictly older than it are
//! considered late.

use crate::DurationError;
use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Event-time watermark. `None` until the first item is observed, in which
/// case everything is admitted.
///
/// `Option` orders `None` below any `Some`, so comparing two watermarks gives
/// the expected progression.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Watermark(Option<DateTime<Utc>>);

impl Watermark {
    pub const fn unset() -> Self {
        Self(None)
    }

    pub const fn at(ts: DateTime<Utc>) -> Self {
        Self(Some(ts))
    }

    pub const fn get(&self) -> Option<DateTime<Utc>> {
        self.0
    }

    /// An item is admitted iff its event time is not below the watermark
    pub fn admits(&self, ts: DateTime<Utc>) -> bool {
        match self.0 {
            None => true,
            Some(watermark) => ts >= watermark,
        }
    }

    /// True once no admissible item can fall before `end` anymore
    pub fn has_passed(&self, end: DateTime<Utc>) -> bool {
        match self.0 {
            None => false,
            Some(watermark) => end <= watermark,
        }
    }
}

impl std::fmt::Display for Watermark {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.0 {
            None => write!(f, "unset"),
            Some(ts) => write!(f, "{}", ts.to_rfc3339()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatermarkTracker {
    /// Max event time observed so far
    max_seen: Option<DateTime<Utc>>,
    /// Allowed lateness for out-of-order events, zero disables late-data
    /// protection
    lateness: TimeDelta,
}

impl WatermarkTracker {
    pub fn new(lateness: Duration) -> Result<Self, DurationError> {
        let lateness =
            TimeDelta::from_std(lateness).map_err(|_| DurationError::OutOfRange(lateness))?;
        Ok(Self {
            max_seen: None,
            lateness,
        })
    }

    /// Restore a tracker from a previously observed max event time
    pub fn with_max_seen(mut self, max_seen: Option<DateTime<Utc>>) -> Self {
        self.max_seen = max_seen;
        self
    }

    pub const fn max_seen(&self) -> Option<DateTime<Utc>> {
        self.max_seen
    }

    pub fn lateness(&self) -> Duration {
        // Built from a std Duration, so it is never negative
        self.lateness.to_std().unwrap_or_default()
    }

    /// Record `ts` and return the resulting watermark
    pub fn advance(&mut self, ts: DateTime<Utc>) -> Watermark {
        self.max_seen = Some(self.max_seen.map_or(ts, |max_seen| max_seen.max(ts)));
        self.current()
    }

    pub fn current(&self) -> Watermark {
        if self.lateness.is_zero() {
            // No late-data protection, every item is admitted
            return Watermark::unset();
        }
        Watermark(self.max_seen.map(|max_seen| {
            max_seen
                .checked_sub_signed(self.lateness)
                .unwrap_or(DateTime::<Utc>::MIN_UTC)
        }))
    }
}
