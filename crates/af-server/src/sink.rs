//! Output sink boundary and the in-process sinks

use af_core::{AfError, AfResult, PcmConfig, duration_to_frames, frames_to_duration};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Instant;

/// How far an offloaded sink should play out before reporting completion
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainMode {
    /// Everything written so far.
    All,
    /// Report slightly early so the next track can be queued gaplessly.
    EarlyNotify,
}

/// Audio output device as seen by a playback thread.
///
/// `write` may block for up to one period and may accept fewer frames than
/// offered; the thread keeps the rest for the next cycle.
pub trait OutputSink: Send {
    fn config(&self) -> PcmConfig;

    /// Frames per write the device expects.
    fn period_frames(&self) -> usize;

    /// Write whole frames from `bytes`; returns frames accepted.
    fn write(&mut self, bytes: &[u8]) -> AfResult<usize>;

    fn latency_ms(&self) -> u32;

    /// Frames the device has actually played since it was opened.
    fn rendered_frames(&self) -> u64;

    fn start(&mut self) -> AfResult<()> {
        Ok(())
    }

    fn standby(&mut self) -> AfResult<()> {
        Ok(())
    }

    fn pause(&mut self) -> AfResult<()> {
        Err(AfError::invalid_operation("sink cannot pause"))
    }

    fn resume(&mut self) -> AfResult<()> {
        Err(AfError::invalid_operation("sink cannot resume"))
    }

    fn flush(&mut self) -> AfResult<()> {
        Ok(())
    }

    fn drain(&mut self, _mode: DrainMode) -> AfResult<()> {
        Ok(())
    }

    /// Polled after [`drain`](Self::drain) until it reports completion.
    fn drain_complete(&mut self) -> bool {
        true
    }

    /// Hardware volume, for outputs that do not mix in software.
    fn set_volume(&mut self, _left: f32, _right: f32) -> AfResult<()> {
        Err(AfError::invalid_operation("sink has no hardware volume"))
    }

    fn set_routing(&mut self, _device: u32) -> AfResult<()> {
        Ok(())
    }

    /// Change the device sample rate. Only called with no tracks attached.
    fn set_sample_rate(&mut self, _rate: u32) -> AfResult<()> {
        Err(AfError::invalid_operation("sink sample rate is fixed"))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// NULL SINK
// ═══════════════════════════════════════════════════════════════════════════════

/// Discards audio. Optionally paced in real time so a threaded output
/// behaves like a device that blocks for one period per write.
pub struct NullSink {
    config: PcmConfig,
    period: usize,
    latency_ms: u32,
    paced: bool,
    written: u64,
    next_due: Option<Instant>,
}

impl NullSink {
    pub fn new(config: PcmConfig, period: usize) -> Self {
        Self {
            config,
            period,
            latency_ms: 0,
            paced: false,
            written: 0,
            next_due: None,
        }
    }

    pub fn with_latency_ms(mut self, ms: u32) -> Self {
        self.latency_ms = ms;
        self
    }

    pub fn paced(mut self) -> Self {
        self.paced = true;
        self
    }

    fn latency_frames(&self) -> u64 {
        self.latency_ms as u64 * self.config.sample_rate as u64 / 1000
    }
}

impl OutputSink for NullSink {
    fn config(&self) -> PcmConfig {
        self.config
    }

    fn period_frames(&self) -> usize {
        self.period
    }

    fn write(&mut self, bytes: &[u8]) -> AfResult<usize> {
        let frames = bytes.len() / self.config.shared_frame_size();
        if self.paced {
            let now = Instant::now();
            let due = self.next_due.unwrap_or(now);
            if due > now {
                std::thread::sleep(due - now);
            }
            let base = due.max(now - frames_to_duration(self.period as u64, self.config.sample_rate));
            self.next_due = Some(base + frames_to_duration(frames as u64, self.config.sample_rate));
        }
        self.written += frames as u64;
        Ok(frames)
    }

    fn latency_ms(&self) -> u32 {
        self.latency_ms
    }

    fn rendered_frames(&self) -> u64 {
        self.written.saturating_sub(self.latency_frames())
    }

    fn standby(&mut self) -> AfResult<()> {
        self.next_due = None;
        Ok(())
    }

    fn set_sample_rate(&mut self, rate: u32) -> AfResult<()> {
        self.config.sample_rate = rate;
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// MEMORY SINK
// ═══════════════════════════════════════════════════════════════════════════════

/// What a [`MemorySink`] has seen. Shared with whoever holds the probe.
#[derive(Debug, Default)]
pub struct SinkRecord {
    pub data: Vec<u8>,
    pub writes: usize,
    pub standby_count: usize,
    pub start_count: usize,
    pub paused: bool,
    pub flushes: usize,
    pub drains: Vec<DrainMode>,
    pub volume: Option<(f32, f32)>,
    pub routing: Option<u32>,
}

/// Inspection handle for a [`MemorySink`]
#[derive(Debug, Clone, Default)]
pub struct SinkProbe {
    record: Arc<Mutex<SinkRecord>>,
}

impl SinkProbe {
    pub fn with<R>(&self, f: impl FnOnce(&SinkRecord) -> R) -> R {
        f(&self.record.lock())
    }

    pub fn data(&self) -> Vec<u8> {
        self.record.lock().data.clone()
    }

    pub fn bytes_written(&self) -> usize {
        self.record.lock().data.len()
    }

    pub fn clear(&self) {
        self.record.lock().data.clear();
    }
}

/// Keeps every written byte, for loopback and tests. Can limit how much
/// each write accepts and how many polls a drain takes.
pub struct MemorySink {
    config: PcmConfig,
    period: usize,
    latency_frames: u64,
    max_frames_per_write: Option<usize>,
    drain_polls: u32,
    drain_left: Option<u32>,
    written: u64,
    probe: SinkProbe,
}

impl MemorySink {
    pub fn new(config: PcmConfig, period: usize) -> (Self, SinkProbe) {
        let probe = SinkProbe::default();
        (
            Self {
                config,
                period,
                latency_frames: 0,
                max_frames_per_write: None,
                drain_polls: 0,
                drain_left: None,
                written: 0,
                probe: probe.clone(),
            },
            probe,
        )
    }

    pub fn with_latency_frames(mut self, frames: u64) -> Self {
        self.latency_frames = frames;
        self
    }

    /// Accept at most `frames` per write, like a non-blocking device.
    pub fn with_write_limit(mut self, frames: usize) -> Self {
        self.max_frames_per_write = Some(frames.max(1));
        self
    }

    /// Report drain completion only after `polls` calls.
    pub fn with_drain_polls(mut self, polls: u32) -> Self {
        self.drain_polls = polls;
        self
    }
}

impl OutputSink for MemorySink {
    fn config(&self) -> PcmConfig {
        self.config
    }

    fn period_frames(&self) -> usize {
        self.period
    }

    fn write(&mut self, bytes: &[u8]) -> AfResult<usize> {
        let frame_size = self.config.shared_frame_size();
        let mut frames = bytes.len() / frame_size;
        if let Some(limit) = self.max_frames_per_write {
            frames = frames.min(limit);
        }
        let mut record = self.probe.record.lock();
        record.data.extend_from_slice(&bytes[..frames * frame_size]);
        record.writes += 1;
        self.written += frames as u64;
        Ok(frames)
    }

    fn latency_ms(&self) -> u32 {
        (self.latency_frames * 1000 / self.config.sample_rate.max(1) as u64) as u32
    }

    fn rendered_frames(&self) -> u64 {
        self.written.saturating_sub(self.latency_frames)
    }

    fn start(&mut self) -> AfResult<()> {
        self.probe.record.lock().start_count += 1;
        Ok(())
    }

    fn standby(&mut self) -> AfResult<()> {
        self.probe.record.lock().standby_count += 1;
        Ok(())
    }

    fn pause(&mut self) -> AfResult<()> {
        self.probe.record.lock().paused = true;
        Ok(())
    }

    fn resume(&mut self) -> AfResult<()> {
        self.probe.record.lock().paused = false;
        Ok(())
    }

    fn flush(&mut self) -> AfResult<()> {
        self.probe.record.lock().flushes += 1;
        Ok(())
    }

    fn drain(&mut self, mode: DrainMode) -> AfResult<()> {
        self.probe.record.lock().drains.push(mode);
        self.drain_left = Some(self.drain_polls);
        Ok(())
    }

    fn drain_complete(&mut self) -> bool {
        match self.drain_left {
            Some(0) | None => {
                self.drain_left = None;
                // Drained: everything written has played.
                self.latency_frames = 0;
                true
            }
            Some(n) => {
                self.drain_left = Some(n - 1);
                false
            }
        }
    }

    fn set_volume(&mut self, left: f32, right: f32) -> AfResult<()> {
        self.probe.record.lock().volume = Some((left, right));
        Ok(())
    }

    fn set_routing(&mut self, device: u32) -> AfResult<()> {
        self.probe.record.lock().routing = Some(device);
        Ok(())
    }

    fn set_sample_rate(&mut self, rate: u32) -> AfResult<()> {
        self.config.sample_rate = rate;
        Ok(())
    }
}

/// Frames of device latency at the sink's rate.
pub fn sink_latency_frames(sink: &dyn OutputSink) -> u64 {
    duration_to_frames(
        std::time::Duration::from_millis(sink.latency_ms() as u64),
        sink.config().sample_rate,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use af_core::{ChannelMask, SampleFormat};

    fn cfg() -> PcmConfig {
        PcmConfig::new(48_000, SampleFormat::Pcm16, ChannelMask::STEREO)
    }

    #[test]
    fn test_null_sink_latency() {
        let mut sink = NullSink::new(cfg(), 480).with_latency_ms(10);
        assert_eq!(sink.write(&[0u8; 480 * 4]).unwrap(), 480);
        assert_eq!(sink.rendered_frames(), 0);
        sink.write(&[0u8; 480 * 4]).unwrap();
        assert_eq!(sink.rendered_frames(), 480);
        assert_eq!(sink_latency_frames(&sink), 480);
    }

    #[test]
    fn test_memory_sink_partial_write() {
        let (sink, probe) = MemorySink::new(cfg(), 480);
        let mut sink = sink.with_write_limit(100);
        assert_eq!(sink.write(&[1u8; 480 * 4]).unwrap(), 100);
        assert_eq!(probe.bytes_written(), 400);
        assert_eq!(probe.with(|r| r.writes), 1);
    }

    #[test]
    fn test_memory_sink_drain_polls() {
        let (sink, probe) = MemorySink::new(cfg(), 480);
        let mut sink = sink.with_drain_polls(2).with_latency_frames(960);
        sink.write(&[0u8; 960 * 4]).unwrap();
        assert_eq!(sink.rendered_frames(), 0);
        sink.drain(DrainMode::All).unwrap();
        assert!(!sink.drain_complete());
        assert!(!sink.drain_complete());
        assert!(sink.drain_complete());
        assert_eq!(sink.rendered_frames(), 960);
        assert_eq!(probe.with(|r| r.drains.clone()), vec![DrainMode::All]);
    }

    #[test]
    fn test_default_pause_unsupported() {
        let mut sink = NullSink::new(cfg(), 480);
        assert!(matches!(sink.pause(), Err(AfError::InvalidOperation(_))));
    }
}
