//! Frame/time conversion and wait deadlines

use std::time::{Duration, Instant};

/// Convert a frame count at `sample_rate` into wall time.
#[inline]
pub fn frames_to_duration(frames: u64, sample_rate: u32) -> Duration {
    if sample_rate == 0 {
        return Duration::ZERO;
    }
    Duration::from_nanos(frames.saturating_mul(1_000_000_000) / sample_rate as u64)
}

/// Convert wall time into whole frames at `sample_rate`.
#[inline]
pub fn duration_to_frames(duration: Duration, sample_rate: u32) -> u64 {
    (duration.as_nanos() * sample_rate as u128 / 1_000_000_000) as u64
}

/// How long a blocking buffer request may wait
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitTimeout {
    /// Poll once, never sleep.
    NonBlocking,
    /// Sleep until frames become available or the peer goes away.
    Forever,
    /// Sleep at most this long in total, across spurious wakeups.
    Bounded(Duration),
}

impl WaitTimeout {
    /// `0` polls, negative blocks forever, positive bounds the wait.
    pub fn from_millis(ms: i64) -> Self {
        match ms {
            0 => Self::NonBlocking,
            ms if ms < 0 => Self::Forever,
            ms => Self::Bounded(Duration::from_millis(ms as u64)),
        }
    }

    /// Absolute deadline, computed once per request.
    pub fn deadline(self, now: Instant) -> Deadline {
        match self {
            Self::NonBlocking => Deadline::Expired,
            Self::Forever => Deadline::Never,
            Self::Bounded(d) => Deadline::At(now + d),
        }
    }
}

/// Resolved form of [`WaitTimeout`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Deadline {
    Expired,
    Never,
    At(Instant),
}

impl Deadline {
    pub fn has_passed(self, now: Instant) -> bool {
        match self {
            Self::Expired => true,
            Self::Never => false,
            Self::At(at) => now >= at,
        }
    }
}

/// Frame position paired with the time it was (or will be) presented
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timestamp {
    pub position: u64,
    pub time: Instant,
}
