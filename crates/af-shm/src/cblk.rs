//! Control block: cursors, flags and per-track parameters shared by both sides

use crate::CblkFlags;
use af_core::{Deadline, UNITY_GAIN_U4_12, pack_volume_lr, u4_12_to_gain, unpack_volume_lr};
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};

// ═══════════════════════════════════════════════════════════════════════════════
// WAKE SIGNAL
// ═══════════════════════════════════════════════════════════════════════════════

/// Sequence-numbered condition used for blocking waits on the ring.
///
/// A waiter samples [`sequence`](Self::sequence) before checking its
/// condition and only sleeps while the sequence is unchanged, so a wake that
/// lands between the check and the sleep is never lost.
pub struct WakeSignal {
    seq: AtomicU64,
    lock: Mutex<()>,
    cond: Condvar,
}

impl WakeSignal {
    fn new() -> Self {
        Self {
            seq: AtomicU64::new(0),
            lock: Mutex::new(()),
            cond: Condvar::new(),
        }
    }

    #[inline]
    pub fn sequence(&self) -> u64 {
        self.seq.load(Ordering::Acquire)
    }

    pub fn wake(&self) {
        let _guard = self.lock.lock();
        self.seq.fetch_add(1, Ordering::AcqRel);
        self.cond.notify_all();
    }

    /// Sleep until the sequence moves past `observed` or the deadline passes.
    /// Returns `false` on timeout.
    pub fn wait(&self, observed: u64, deadline: Deadline) -> bool {
        let mut guard = self.lock.lock();
        while self.seq.load(Ordering::Acquire) == observed {
            match deadline {
                Deadline::Expired => return false,
                Deadline::Never => self.cond.wait(&mut guard),
                Deadline::At(at) => {
                    if self.cond.wait_until(&mut guard, at).timed_out() {
                        return self.seq.load(Ordering::Acquire) != observed;
                    }
                }
            }
        }
        true
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// CONTROL BLOCK
// ═══════════════════════════════════════════════════════════════════════════════

/// Shared state of one track's ring buffer.
///
/// `front` and `rear` are absolute frame counts that never wrap in practice
/// (u64); the ring offset is `cursor % frame_count`.
pub struct ControlBlock {
    frame_count: usize,
    frame_size: usize,
    pub(crate) front: AtomicU64,
    pub(crate) rear: AtomicU64,
    flags: AtomicU32,
    volume_lr: AtomicU32,
    send_level: AtomicU32,
    sample_rate: AtomicU32,
    epoch: AtomicU64,
    pub(crate) flush_request: AtomicU32,
    underrun_frames: AtomicU64,
    underrun_events: AtomicU32,
    min_refill: AtomicUsize,
    notification_frames: AtomicU32,
    pub(crate) buffer_position: AtomicU64,
    pub(crate) wake: WakeSignal,
}

impl ControlBlock {
    pub(crate) fn new(frame_count: usize, frame_size: usize, sample_rate: u32) -> Self {
        Self {
            frame_count,
            frame_size,
            front: AtomicU64::new(0),
            rear: AtomicU64::new(0),
            flags: AtomicU32::new(0),
            volume_lr: AtomicU32::new(pack_volume_lr(1.0, 1.0)),
            send_level: AtomicU32::new(0),
            sample_rate: AtomicU32::new(sample_rate),
            epoch: AtomicU64::new(0),
            flush_request: AtomicU32::new(0),
            underrun_frames: AtomicU64::new(0),
            underrun_events: AtomicU32::new(0),
            min_refill: AtomicUsize::new((frame_count / 2).max(1)),
            notification_frames: AtomicU32::new(0),
            buffer_position: AtomicU64::new(0),
            wake: WakeSignal::new(),
        }
    }

    #[inline]
    pub fn frame_count(&self) -> usize {
        self.frame_count
    }

    #[inline]
    pub fn frame_size(&self) -> usize {
        self.frame_size
    }

    #[inline]
    pub fn front(&self) -> u64 {
        self.front.load(Ordering::Acquire)
    }

    #[inline]
    pub fn rear(&self) -> u64 {
        self.rear.load(Ordering::Acquire)
    }

    /// Frames between the cursors. May exceed `frame_count` only if a peer
    /// broke the protocol; proxies check for that.
    #[inline]
    pub fn filled(&self) -> u64 {
        let front = self.front.load(Ordering::Acquire);
        let rear = self.rear.load(Ordering::Acquire);
        rear.wrapping_sub(front)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Flags
    // ─────────────────────────────────────────────────────────────────────────

    #[inline]
    pub fn flags(&self) -> CblkFlags {
        CblkFlags::from_bits_truncate(self.flags.load(Ordering::Acquire))
    }

    /// Set bits, returning the previous word.
    #[inline]
    pub fn set_flags(&self, flags: CblkFlags) -> CblkFlags {
        CblkFlags::from_bits_truncate(self.flags.fetch_or(flags.bits(), Ordering::AcqRel))
    }

    /// Clear bits, returning the previous word.
    #[inline]
    pub fn clear_flags(&self, flags: CblkFlags) -> CblkFlags {
        CblkFlags::from_bits_truncate(self.flags.fetch_and(!flags.bits(), Ordering::AcqRel))
    }

    /// Mark the track unusable and wake anyone blocked on it.
    pub fn invalidate(&self) {
        self.set_flags(CblkFlags::INVALID);
        self.wake.wake();
    }

    /// Wake a blocked obtain; it returns `Interrupted`.
    pub fn interrupt(&self) {
        self.set_flags(CblkFlags::INTERRUPT);
        self.wake.wake();
    }

    pub fn wake(&self) {
        self.wake.wake();
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Parameters
    // ─────────────────────────────────────────────────────────────────────────

    pub fn set_volume_lr(&self, left: f32, right: f32) {
        self.volume_lr.store(pack_volume_lr(left, right), Ordering::Release);
    }

    pub fn volume_lr(&self) -> (f32, f32) {
        unpack_volume_lr(self.volume_lr.load(Ordering::Acquire))
    }

    pub fn set_send_level(&self, level: f32) {
        let packed = af_core::gain_to_u4_12(level).min(UNITY_GAIN_U4_12);
        self.send_level.store(packed as u32, Ordering::Release);
    }

    pub fn send_level(&self) -> f32 {
        u4_12_to_gain(self.send_level.load(Ordering::Acquire) as u16)
    }

    pub fn set_sample_rate(&self, rate: u32) {
        self.sample_rate.store(rate, Ordering::Release);
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate.load(Ordering::Acquire)
    }

    pub fn set_epoch(&self, epoch: u64) {
        self.epoch.store(epoch, Ordering::Release);
    }

    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }

    /// Take back `frames` the consumer skipped, so the position does not
    /// count them.
    pub fn rewind_epoch(&self, frames: u64) {
        self.epoch.fetch_sub(frames, Ordering::AcqRel);
    }

    /// Clamped to `[1, frame_count]`.
    pub fn set_min_refill(&self, frames: usize) {
        self.min_refill
            .store(frames.clamp(1, self.frame_count), Ordering::Release);
    }

    pub fn min_refill(&self) -> usize {
        self.min_refill.load(Ordering::Acquire)
    }

    pub fn set_notification_frames(&self, frames: u32) {
        self.notification_frames.store(frames, Ordering::Release);
    }

    pub fn notification_frames(&self) -> u32 {
        self.notification_frames.load(Ordering::Acquire)
    }

    /// Static playback head (frame offset inside the buffer).
    pub fn buffer_position(&self) -> u64 {
        self.buffer_position.load(Ordering::Acquire)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Underrun tally
    // ─────────────────────────────────────────────────────────────────────────

    /// Record frames the consumer wanted but could not get.
    pub fn tally_underrun(&self, frames: usize) {
        self.underrun_frames
            .fetch_add(frames as u64, Ordering::AcqRel);
        let prev = self.set_flags(CblkFlags::UNDERRUN);
        if !prev.contains(CblkFlags::UNDERRUN) {
            self.underrun_events.fetch_add(1, Ordering::AcqRel);
        }
    }

    pub fn underrun_frames(&self) -> u64 {
        self.underrun_frames.load(Ordering::Acquire)
    }

    /// Number of distinct underrun episodes.
    pub fn underrun_events(&self) -> u32 {
        self.underrun_events.load(Ordering::Acquire)
    }
}
