//! Timestamps and half-open sync windows.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// A point in time with microsecond resolution (microseconds since epoch).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct Timestamp(u64);

impl Timestamp {
    /// The epoch; the watermark of a destination that was never synced.
    pub const EPOCH: Timestamp = Timestamp(0);

    /// Create a timestamp from microseconds since epoch.
    pub fn from_micros(us: u64) -> Self {
        Self(us)
    }

    /// Create a timestamp from whole seconds since epoch.
    pub fn from_secs(secs: u64) -> Self {
        Self(secs.saturating_mul(1_000_000))
    }

    /// The current wall-clock time.
    pub fn now() -> Self {
        Self::from_system_time(SystemTime::now())
    }

    /// Convert a filesystem time. Times before the epoch clamp to the epoch.
    pub fn from_system_time(t: SystemTime) -> Self {
        match t.duration_since(UNIX_EPOCH) {
            Ok(d) => Self(u64::try_from(d.as_micros()).unwrap_or(u64::MAX)),
            Err(_) => Self::EPOCH,
        }
    }

    /// Microseconds since epoch.
    pub fn as_micros(self) -> u64 {
        self.0
    }

    /// Whole seconds since epoch (truncated).
    pub fn as_secs(self) -> u64 {
        self.0 / 1_000_000
    }

    /// Back to a [`SystemTime`].
    pub fn to_system_time(self) -> SystemTime {
        UNIX_EPOCH + Duration::from_micros(self.0)
    }

    /// RFC 3339 rendering in UTC, used in the human-readable history log.
    pub fn to_rfc3339(self) -> String {
        DateTime::<Utc>::from(self.to_system_time()).to_rfc3339_opts(SecondsFormat::Micros, true)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_rfc3339())
    }
}

/// Half-open interval `[start, end)` of modification times selected by a cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncWindow {
    /// Inclusive lower bound: the destination's watermark.
    pub start: Timestamp,
    /// Exclusive upper bound: the cycle's "now".
    pub end: Timestamp,
}

impl SyncWindow {
    /// Build a window. An `end` earlier than `start` (clock skew, a hand-edited
    /// history log) collapses to the zero-width window at `start`, so the
    /// watermark is never rewound.
    pub fn new(start: Timestamp, end: Timestamp) -> Self {
        if end < start {
            tracing::warn!(%start, %end, "window end precedes watermark; using empty window");
            return Self { start, end: start };
        }
        Self { start, end }
    }

    /// Whether `t` falls inside `[start, end)`.
    pub fn contains(&self, t: Timestamp) -> bool {
        self.start <= t && t < self.end
    }

    /// Zero-width windows select nothing.
    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    /// Width of the window.
    pub fn width(&self) -> Duration {
        Duration::from_micros(self.end.as_micros() - self.start.as_micros())
    }
}

impl fmt::Display for SyncWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}
