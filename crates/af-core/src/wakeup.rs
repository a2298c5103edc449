//! Next-wakeup planning for loops that sleep between frame-based events

use crate::frames_to_duration;
use std::time::Duration;

/// Collects upcoming events and yields how long to sleep until the nearest.
///
/// Events are expressed either in frames (converted at the stream rate) or
/// directly as durations. The result is never longer than the ceiling, so a
/// caller polls at least that often even when nothing is scheduled.
#[derive(Debug, Clone)]
pub struct WakeupPlanner {
    sample_rate: u32,
    ceiling: Duration,
    slack: Duration,
    nearest: Option<Duration>,
}

impl WakeupPlanner {
    pub fn new(sample_rate: u32, ceiling: Duration) -> Self {
        Self {
            sample_rate,
            ceiling,
            slack: Duration::ZERO,
            nearest: None,
        }
    }

    /// Added to frame-derived events so a wakeup lands after the event.
    pub fn with_slack(mut self, slack: Duration) -> Self {
        self.slack = slack;
        self
    }

    /// Event `frames` frames from now.
    pub fn event_in_frames(&mut self, frames: u64) {
        let d = frames_to_duration(frames, self.sample_rate) + self.slack;
        self.event_in(d);
    }

    pub fn event_in(&mut self, d: Duration) {
        self.nearest = Some(match self.nearest {
            Some(n) => n.min(d),
            None => d,
        });
    }

    pub fn has_event(&self) -> bool {
        self.nearest.is_some()
    }

    pub fn next(&self) -> Duration {
        self.nearest.unwrap_or(self.ceiling).min(self.ceiling)
    }
}

/// Frames from `position` to the next multiple of `period` strictly after it.
#[inline]
pub fn frames_until_next_period(position: u64, period: u64) -> Option<u64> {
    if period == 0 {
        return None;
    }
    Some(period - position % period)
}
