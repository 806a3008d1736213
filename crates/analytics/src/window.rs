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

use crate::DurationError;
use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// A time window defined by a start and (noninclusive) end timestamp
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Window {
    start: DateTime<Utc>,
    end: DateTime<Utc>,
}

impl Window {
    pub const fn start(&self) -> DateTime<Utc> {
        self.start
    }

    pub const fn end(&self) -> DateTime<Utc> {
        self.end
    }

    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        self.start <= ts && ts < self.end
    }
}

impl std::fmt::Display for Window {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{} - {})", self.start.to_rfc3339(), self.end.to_rfc3339())
    }
}

/// Assigns items to fixed-size, non-overlapping windows aligned to the Unix
/// epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowAssigner {
    size: TimeDelta,
    size_millis: i64,
}

impl WindowAssigner {
    pub fn new(size: Duration) -> Result<Self, DurationError> {
        if size.is_zero() {
            return Err(DurationError::ZeroWindowSize);
        }
        if size.subsec_nanos() % 1_000_000 != 0 {
            return Err(DurationError::SubMillisecondWindowSize(size));
        }
        let size_millis =
            i64::try_from(size.as_millis()).map_err(|_| DurationError::OutOfRange(size))?;
        let size = TimeDelta::try_milliseconds(size_millis).ok_or(DurationError::OutOfRange(size))?;
        Ok(Self { size, size_millis })
    }

    pub fn size(&self) -> Duration {
        self.size.to_std().unwrap_or_default()
    }

    /// Returns the window containing `ts`.
    ///
    /// `start = floor(ts / size) * size`, so a timestamp exactly on a boundary
    /// belongs to the window starting there.
    pub fn assign(&self, ts: DateTime<Utc>) -> Window {
        let offset = TimeDelta::milliseconds(ts.timestamp_millis().rem_euclid(self.size_millis))
            + TimeDelta::nanoseconds(i64::from(ts.timestamp_subsec_nanos() % 1_000_000));
        let start = ts
            .checked_sub_signed(offset)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let end = start
            .checked_add_signed(self.size)
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        Window { start, end }
    }
}
