//! Static (whole-buffer) playback: position and loop state

use crate::CblkFlags;
use af_core::{AfError, AfResult};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};

/// Shortest loop the server accepts, in frames.
pub const MIN_LOOP_FRAMES: usize = 16;

/// Loop points of a static buffer. `count` of `-1` loops forever, `0`
/// disables looping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LoopConfig {
    pub start: usize,
    pub end: usize,
    pub count: i32,
}

impl LoopConfig {
    pub const NONE: Self = Self {
        start: 0,
        end: 0,
        count: 0,
    };

    pub fn new(start: usize, end: usize, count: i32) -> Self {
        Self { start, end, count }
    }

    #[inline]
    pub fn is_enabled(&self) -> bool {
        self.count != 0
    }

    /// Loop length in frames.
    #[inline]
    pub fn period(&self) -> usize {
        self.end.saturating_sub(self.start)
    }

    pub fn validate(&self, frame_count: usize) -> AfResult<()> {
        if self.count == 0 {
            return Ok(());
        }
        if self.count < -1 {
            return Err(AfError::invalid_argument(format!("loop count {}", self.count)));
        }
        if self.start >= self.end {
            return Err(AfError::invalid_argument(format!(
                "loop start {} not before end {}",
                self.start, self.end
            )));
        }
        if self.end > frame_count {
            return Err(AfError::invalid_argument(format!(
                "loop end {} past buffer of {frame_count} frames",
                self.end
            )));
        }
        if self.period() < MIN_LOOP_FRAMES {
            return Err(AfError::invalid_argument(format!(
                "loop of {} frames shorter than {MIN_LOOP_FRAMES}",
                self.period()
            )));
        }
        Ok(())
    }
}

/// Position and loop request posted by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StaticRequest {
    pub position: usize,
    pub looping: LoopConfig,
}

/// Latest-wins mailbox from client to server.
///
/// The client overwrites the pending request under a short lock; the
/// server only ever `try_lock`s, so the mixing thread never waits on it.
pub(crate) struct StaticShared {
    pending: Mutex<Option<StaticRequest>>,
    posted: AtomicU32,
}

impl StaticShared {
    pub(crate) fn new() -> Self {
        Self {
            pending: Mutex::new(None),
            posted: AtomicU32::new(0),
        }
    }

    pub(crate) fn post(&self, request: StaticRequest) {
        *self.pending.lock() = Some(request);
        self.posted.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn posted(&self) -> u32 {
        self.posted.load(Ordering::Acquire)
    }

    /// Take the pending request if the lock is free. A busy lock means the
    /// client is mid-post; the request is picked up next time.
    pub(crate) fn try_take(&self) -> Option<StaticRequest> {
        self.pending.try_lock().and_then(|mut slot| slot.take())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// SERVER-SIDE PLAYBACK STATE
// ═══════════════════════════════════════════════════════════════════════════════

/// Where the server is in a static buffer and how many loop passes remain.
#[derive(Debug, Clone)]
pub(crate) struct StaticPlayback {
    frame_count: usize,
    position: usize,
    looping: LoopConfig,
    remaining: i32,
    seen: u32,
}

impl StaticPlayback {
    pub(crate) fn new(frame_count: usize) -> Self {
        Self {
            frame_count,
            position: 0,
            looping: LoopConfig::NONE,
            remaining: 0,
            seen: 0,
        }
    }

    #[inline]
    pub(crate) fn position(&self) -> usize {
        self.position
    }

    #[cfg(test)]
    pub(crate) fn remaining_loops(&self) -> i32 {
        self.remaining
    }

    /// Pull a newer client request, if any.
    pub(crate) fn poll(&mut self, shared: &StaticShared) {
        let posted = shared.posted();
        if posted == self.seen {
            return;
        }
        if let Some(request) = shared.try_take() {
            self.seen = posted;
            self.apply(request);
        }
    }

    pub(crate) fn apply(&mut self, request: StaticRequest) {
        self.position = request.position.min(self.frame_count);
        if request.looping.validate(self.frame_count).is_ok() {
            self.looping = request.looping;
        } else {
            log::warn!("ignoring invalid static loop {:?}", request.looping);
            self.looping = LoopConfig::NONE;
        }
        self.remaining = self.looping.count;
    }

    /// End of the region the next grant may cover.
    fn segment_end(&self) -> usize {
        if self.remaining != 0 && self.position < self.looping.end {
            self.looping.end
        } else {
            self.frame_count
        }
    }

    pub(crate) fn frames_ready(&self) -> usize {
        self.segment_end().saturating_sub(self.position)
    }

    /// Frames until the next loop wrap, if a loop is pending.
    pub(crate) fn frames_to_loop_end(&self) -> Option<usize> {
        (self.remaining != 0 && self.position < self.looping.end)
            .then(|| self.looping.end - self.position)
    }

    /// Advance the head and report which events that crossed.
    pub(crate) fn advance(&mut self, frames: usize) -> CblkFlags {
        let mut events = CblkFlags::empty();
        self.position = (self.position + frames).min(self.frame_count);
        if self.remaining != 0 && self.position == self.looping.end {
            self.position = self.looping.start;
            if self.remaining > 0 {
                self.remaining -= 1;
                if self.remaining == 0 {
                    events |= CblkFlags::LOOP_FINAL;
                } else {
                    events |= CblkFlags::LOOP_CYCLE;
                }
            } else {
                events |= CblkFlags::LOOP_CYCLE;
            }
        }
        if self.position >= self.frame_count {
            events |= CblkFlags::BUFFER_END;
        }
        events
    }

    /// Rewind to the start and re-arm the configured loop.
    pub(crate) fn rewind(&mut self) {
        self.position = 0;
        self.remaining = self.looping.count;
    }
}
