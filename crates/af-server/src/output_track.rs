//! Duplicating outputs: one mix fanned out to several mixer outputs
//!
//! The duplicating thread mixes like any mixer output, then its sink writes
//! the result into an internal [`TrackKind::Output`] track on every
//! destination thread. A destination that cannot keep up gets its backlog
//! queued, bounded, instead of stalling the others.

use crate::sink::OutputSink;
use crate::thread::ThreadShared;
use crate::track::{Track, TrackKind, TrackSpec};
use af_core::{AfError, AfResult, PcmConfig, StreamType, TrackId, WaitTimeout, frames_to_duration};
use af_shm::{CblkFlags, ClientProxy, Direction, RegionArena, RegionParams, ServerProxy, SharedRegion, Side};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Backlog buffers kept per destination before new audio is dropped.
const MAX_OVERFLOW_BUFFERS: usize = 10;

/// Ring size of an output track, in duplicating periods.
const OUTPUT_TRACK_PERIODS: usize = 3;

/// Producer end of an internal track on a destination thread
pub struct OutputTrack {
    thread: Arc<ThreadShared>,
    id: TrackId,
    proxy: ClientProxy,
    arena: Arc<RegionArena>,
    overflow: VecDeque<Vec<u8>>,
    frame_size: usize,
    wait: Duration,
    active: bool,
}

impl OutputTrack {
    /// Create the internal track on `thread`, sized for `period` frames of
    /// the duplicating output.
    pub(crate) fn attach(
        thread: Arc<ThreadShared>,
        id: TrackId,
        arena: Arc<RegionArena>,
        period: usize,
    ) -> AfResult<Self> {
        let config = thread.sink_config();
        let region = SharedRegion::create(RegionParams {
            frame_count: period * OUTPUT_TRACK_PERIODS,
            frame_size: config.shared_frame_size(),
            sample_rate: config.sample_rate,
            direction: Direction::Playback,
            static_data: None,
        })?;
        arena.insert(id, Arc::clone(&region));
        let server = Arc::new(ServerProxy::attach(Arc::clone(&region))?);
        let proxy = ClientProxy::attach(region)?;
        let spec = TrackSpec {
            id,
            kind: TrackKind::Output,
            config,
            stream_type: StreamType::Music,
            session: 0,
        };
        if let Err(e) = thread.add_track(Track::new(spec, server)) {
            arena.relinquish(id, Side::Server);
            arena.relinquish(id, Side::Client);
            return Err(e);
        }
        let wait = frames_to_duration(thread.frame_count() as u64, config.sample_rate);
        log::debug!("{id} feeds {}", thread.id());
        Ok(Self {
            thread,
            id,
            proxy,
            arena,
            overflow: VecDeque::new(),
            frame_size: config.shared_frame_size(),
            wait,
            active: false,
        })
    }

    pub fn id(&self) -> TrackId {
        self.id
    }

    pub fn destination(&self) -> &Arc<ThreadShared> {
        &self.thread
    }

    pub fn backlog(&self) -> usize {
        self.overflow.len()
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Push `bytes` to the destination, waiting at most one destination
    /// period. What does not fit is queued.
    pub fn write(&mut self, bytes: &[u8]) -> AfResult<()> {
        // Started on first use, and again after the destination starved it
        // out of its active set.
        let disabled = self.proxy.cblk().flags().contains(CblkFlags::DISABLED);
        if !self.active || disabled {
            if disabled {
                log::debug!("{} was disabled by {}, restarting", self.id, self.thread.id());
            }
            self.thread.start_track(self.id)?;
            self.active = true;
        }
        let deadline = Instant::now() + self.wait;

        while let Some(mut pending) = self.overflow.pop_front() {
            let done = self.push(&pending, deadline)?;
            if done < pending.len() {
                pending.drain(..done);
                self.overflow.push_front(pending);
                self.queue(bytes);
                return Ok(());
            }
        }

        let done = self.push(bytes, deadline)?;
        if done < bytes.len() {
            self.queue(&bytes[done..]);
        }
        Ok(())
    }

    fn queue(&mut self, bytes: &[u8]) {
        if bytes.is_empty() {
            return;
        }
        if self.overflow.len() >= MAX_OVERFLOW_BUFFERS {
            log::warn!("{}: backlog full, dropping {} bytes", self.id, bytes.len());
            return;
        }
        self.overflow.push_back(bytes.to_vec());
    }

    /// Copy whole frames until `deadline`. Returns bytes written.
    fn push(&self, bytes: &[u8], deadline: Instant) -> AfResult<usize> {
        let mut done = 0;
        while bytes.len() - done >= self.frame_size {
            let frames = (bytes.len() - done) / self.frame_size;
            let left = deadline.saturating_duration_since(Instant::now());
            let timeout = if left.is_zero() {
                WaitTimeout::NonBlocking
            } else {
                WaitTimeout::Bounded(left)
            };
            let mut buffer = match self.proxy.obtain_buffer(frames, timeout) {
                Ok(buffer) => buffer,
                Err(AfError::WouldBlock | AfError::TimedOut) => break,
                Err(e) => return Err(e),
            };
            let n = buffer.frame_count();
            let len = n * self.frame_size;
            buffer.bytes_mut().copy_from_slice(&bytes[done..done + len]);
            self.proxy.release_buffer(buffer, n)?;
            done += len;
        }
        Ok(done)
    }

    /// Stop feeding the destination; queued audio is discarded.
    pub fn stop(&mut self) {
        self.overflow.clear();
        if std::mem::take(&mut self.active) {
            if let Err(e) = self.thread.stop_track(self.id) {
                log::debug!("{}: stop failed: {e}", self.id);
            }
        }
    }
}

impl Drop for OutputTrack {
    fn drop(&mut self) {
        self.thread.terminate_track(self.id);
        self.arena.relinquish(self.id, Side::Client);
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// DUPLICATING SINK
// ═══════════════════════════════════════════════════════════════════════════════

/// Sink of a duplicating output: writes every mixed period to all
/// destinations
pub struct DuplicatingSink {
    config: PcmConfig,
    period: usize,
    outputs: Vec<OutputTrack>,
    latency_ms: u32,
    written: u64,
}

impl DuplicatingSink {
    pub(crate) fn new(config: PcmConfig, period: usize, outputs: Vec<OutputTrack>) -> Self {
        let latency_ms = outputs
            .iter()
            .map(|o| o.thread.latency_ms())
            .max()
            .unwrap_or(0);
        Self {
            config,
            period,
            outputs,
            latency_ms,
            written: 0,
        }
    }

    pub fn output_count(&self) -> usize {
        self.outputs.len()
    }
}

impl OutputSink for DuplicatingSink {
    fn config(&self) -> PcmConfig {
        self.config
    }

    fn period_frames(&self) -> usize {
        self.period
    }

    fn write(&mut self, bytes: &[u8]) -> AfResult<usize> {
        self.outputs.retain_mut(|output| match output.write(bytes) {
            Ok(()) => true,
            Err(AfError::DeadObject) => {
                log::warn!("{} lost its destination {}", output.id, output.thread.id());
                false
            }
            Err(e) => {
                log::warn!("{}: write failed: {e}", output.id);
                true
            }
        });
        let frames = bytes.len() / self.config.shared_frame_size();
        self.written += frames as u64;
        Ok(frames)
    }

    fn latency_ms(&self) -> u32 {
        self.latency_ms
    }

    fn rendered_frames(&self) -> u64 {
        let latency = self.latency_ms as u64 * self.config.sample_rate as u64 / 1000;
        self.written.saturating_sub(latency)
    }

    fn standby(&mut self) -> AfResult<()> {
        self.outputs.iter_mut().for_each(OutputTrack::stop);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::{MemorySink, SinkProbe};
    use crate::thread::{MixerStatus, OutputKind, PlaybackThread};
    use af_core::{ChannelMask, OutputId, SampleFormat, ServerConfig};

    fn stereo() -> PcmConfig {
        PcmConfig::new(48_000, SampleFormat::Pcm16, ChannelMask::STEREO)
    }

    fn destination(n: u32, arena: &Arc<RegionArena>) -> (Arc<ThreadShared>, PlaybackThread, SinkProbe) {
        let (sink, probe) = MemorySink::new(stereo(), 16);
        let (shared, thread) = PlaybackThread::new(
            OutputId(n),
            OutputKind::Mixer,
            Box::new(sink),
            ServerConfig::default(),
            Arc::clone(arena),
        )
        .unwrap();
        (shared, thread, probe)
    }

    fn period_bytes() -> Vec<u8> {
        std::iter::repeat_n([0x00, 0x10, 0x00, 0x10], 16).flatten().collect()
    }

    #[test]
    fn test_fan_out_to_every_destination() {
        let arena = Arc::new(RegionArena::new());
        let (a, mut thread_a, probe_a) = destination(1, &arena);
        let (b, mut thread_b, probe_b) = destination(2, &arena);
        let outputs = vec![
            OutputTrack::attach(Arc::clone(&a), TrackId(10), Arc::clone(&arena), 16).unwrap(),
            OutputTrack::attach(Arc::clone(&b), TrackId(11), Arc::clone(&arena), 16).unwrap(),
        ];
        let mut sink = DuplicatingSink::new(stereo(), 16, outputs);

        for _ in 0..OUTPUT_TRACK_PERIODS {
            assert_eq!(sink.write(&period_bytes()).unwrap(), 16);
        }
        assert_eq!(a.active_tracks(), vec![TrackId(10)]);

        assert_eq!(thread_a.cycle().status, MixerStatus::TracksReady);
        assert_eq!(thread_b.cycle().status, MixerStatus::TracksReady);
        assert_eq!(probe_a.bytes_written(), 64);
        assert_eq!(probe_b.bytes_written(), 64);
    }

    #[test]
    fn test_slow_destination_queues_backlog() {
        let arena = Arc::new(RegionArena::new());
        let (a, _thread_a, _probe) = destination(1, &arena);
        let mut output = OutputTrack::attach(a, TrackId(10), Arc::clone(&arena), 16).unwrap();

        for _ in 0..OUTPUT_TRACK_PERIODS + 2 {
            output.write(&period_bytes()).unwrap();
        }
        assert_eq!(output.backlog(), 2);

        output.stop();
        assert_eq!(output.backlog(), 0);
        assert!(!output.is_active());
    }

    #[test]
    fn test_starved_destination_restarts_on_next_write() {
        let arena = Arc::new(RegionArena::new());
        let (a, mut thread_a, probe) = destination(1, &arena);
        let mut output = OutputTrack::attach(Arc::clone(&a), TrackId(10), Arc::clone(&arena), 16).unwrap();

        for _ in 0..OUTPUT_TRACK_PERIODS {
            output.write(&period_bytes()).unwrap();
        }
        // Play the ring out, then starve past the retry budget.
        for _ in 0..60 {
            thread_a.cycle();
        }
        assert!(a.active_tracks().is_empty());
        assert!(output.is_active());

        for _ in 0..6 {
            output.write(&period_bytes()).unwrap();
            thread_a.cycle();
        }
        assert_eq!(a.active_tracks(), vec![TrackId(10)]);
        assert_eq!(output.backlog(), 0);
        let data = probe.data();
        let last: Vec<i16> = data[data.len() - 64..]
            .chunks_exact(2)
            .map(|s| i16::from_ne_bytes([s[0], s[1]]))
            .collect();
        let expected = i16::from_ne_bytes([0x00, 0x10]);
        assert!(last.iter().all(|&s| (s - expected).abs() <= 1), "{last:?}");
    }

    #[test]
    fn test_drop_releases_both_sides() {
        let arena = Arc::new(RegionArena::new());
        let (a, _thread_a, _probe) = destination(1, &arena);
        let output = OutputTrack::attach(Arc::clone(&a), TrackId(10), Arc::clone(&arena), 16).unwrap();
        assert_eq!(a.track_count(), 1);
        drop(output);
        assert_eq!(a.track_count(), 0);
        assert!(arena.is_empty());
    }
}
