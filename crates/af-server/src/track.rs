//! Server-side track: lifecycle state machine, readiness, kinds

use af_core::{AfError, AfResult, PcmConfig, SessionId, StreamType, Timestamp, TrackId};
use af_shm::{Buffer, CblkFlags, ServerProxy};
use std::sync::Arc;
use std::time::Instant;

/// Lifecycle state of a server track
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackState {
    Idle,
    Flushed,
    Stopped,
    Resuming,
    Active,
    Pausing,
    Paused,
    /// Stop requested; waiting for the consumer to run dry.
    Stopping1,
    /// Consumer ran dry; waiting for the device to present everything.
    Stopping2,
}

impl TrackState {
    pub const ALL: [TrackState; 9] = [
        Self::Idle,
        Self::Flushed,
        Self::Stopped,
        Self::Resuming,
        Self::Active,
        Self::Pausing,
        Self::Paused,
        Self::Stopping1,
        Self::Stopping2,
    ];

    pub fn is_stopping(self) -> bool {
        matches!(self, Self::Stopping1 | Self::Stopping2)
    }

    /// Rest states a track leaves only through `start`.
    pub fn is_at_rest(self) -> bool {
        matches!(self, Self::Idle | Self::Flushed | Self::Stopped)
    }
}

/// Buffer filling status, tracked from start until the first full buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FillStatus {
    Filling,
    Filled,
    Active,
}

// ═══════════════════════════════════════════════════════════════════════════════
// TRACK KINDS
// ═══════════════════════════════════════════════════════════════════════════════

/// Next piece of audio a track contributes to a cycle
pub enum Chunk {
    /// Frames to mix; release them on the proxy afterwards.
    Frames(Buffer),
    /// Frames of silence the track asks for; nothing to release.
    Silence(usize),
}

/// Closed set of track variants
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackKind {
    /// Ordinary PCM track. `fast` tracks are mixed by the fast path and
    /// drain before stopping.
    Normal { fast: bool },
    /// Holds silence until the output timeline reaches `media_start`.
    Timed { media_start: Option<u64> },
    /// Compressed or pass-through stream rendered by the sink itself.
    Offload,
    /// Internal track fed by a duplicating output.
    Output,
}

impl TrackKind {
    pub fn is_fast(self) -> bool {
        matches!(self, Self::Normal { fast: true })
    }

    /// Fast and offloaded tracks keep rendering after `stop` until drained.
    pub fn defers_drain(self) -> bool {
        matches!(self, Self::Normal { fast: true } | Self::Offload)
    }

    /// Pull up to `frames` frames. `timeline` is the output frame the
    /// chunk will be presented at.
    pub fn next_chunk(self, proxy: &ServerProxy, frames: usize, timeline: u64) -> AfResult<Chunk> {
        if let Self::Timed { media_start } = self {
            match media_start {
                None => return Ok(Chunk::Silence(frames)),
                Some(start) if timeline < start => {
                    let gap = (start - timeline).min(frames as u64) as usize;
                    return Ok(Chunk::Silence(gap));
                }
                Some(_) => {}
            }
        }
        proxy.obtain_buffer(frames).map(Chunk::Frames)
    }

    /// Record that the track could not supply `frames` frames this cycle.
    pub fn report_underrun(self, proxy: &ServerProxy, frames: usize) {
        match self {
            // The duplicating output pads its own gaps.
            Self::Output => {}
            Self::Timed { media_start } if media_start.is_none() => {}
            _ => proxy.tally_underrun(frames),
        }
    }

    /// State a `stop` lands in while the track is still being consumed.
    pub fn request_stop(self) -> TrackState {
        if self.defers_drain() {
            TrackState::Stopping1
        } else {
            TrackState::Stopped
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// TRACK
// ═══════════════════════════════════════════════════════════════════════════════

/// Parameters fixed at creation
#[derive(Debug, Clone)]
pub struct TrackSpec {
    pub id: TrackId,
    pub kind: TrackKind,
    pub config: PcmConfig,
    pub stream_type: StreamType,
    pub session: SessionId,
}

/// Snapshot of what the output device has consumed, taken after a write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RenderLatch {
    /// Frames handed to the sink but not yet rendered.
    pub unpresented: u64,
    pub time: Instant,
}

/// One stream owned by a playback thread.
///
/// All methods run under the owning thread's lock. Operations that touch
/// the ring (reset) are deferred to the thread while the track is in the
/// active set, because the mix step reads the ring without the lock.
pub struct Track {
    spec: TrackSpec,
    proxy: Arc<ServerProxy>,
    state: TrackState,
    fill: FillStatus,
    pub(crate) retry_count: u32,
    resume_to_stopping: bool,
    presentation_complete_frames: Option<u64>,
    reset_done: bool,
    /// Producer cursor at a stop the thread has not applied yet.
    stop_mark: Option<u64>,
    ramp_pending: bool,
    terminated: bool,
}

impl Track {
    pub fn new(spec: TrackSpec, proxy: Arc<ServerProxy>) -> Self {
        if proxy.region().is_static() {
            proxy.cblk().set_flags(CblkFlags::FORCE_READY);
        }
        Self {
            spec,
            proxy,
            state: TrackState::Idle,
            fill: FillStatus::Filling,
            retry_count: 0,
            resume_to_stopping: false,
            presentation_complete_frames: None,
            reset_done: true,
            stop_mark: None,
            ramp_pending: false,
            terminated: false,
        }
    }

    pub fn id(&self) -> TrackId {
        self.spec.id
    }

    pub fn kind(&self) -> TrackKind {
        self.spec.kind
    }

    pub fn config(&self) -> &PcmConfig {
        &self.spec.config
    }

    pub fn stream_type(&self) -> StreamType {
        self.spec.stream_type
    }

    pub fn session(&self) -> SessionId {
        self.spec.session
    }

    pub fn state(&self) -> TrackState {
        self.state
    }

    pub fn fill_status(&self) -> FillStatus {
        self.fill
    }

    pub fn proxy(&self) -> &Arc<ServerProxy> {
        &self.proxy
    }

    pub fn frame_count(&self) -> usize {
        self.proxy.frame_count()
    }

    pub fn is_static(&self) -> bool {
        self.proxy.region().is_static()
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated
    }

    pub(crate) fn set_state(&mut self, state: TrackState) {
        log::trace!("{}: {:?} -> {:?}", self.spec.id, self.state, state);
        self.state = state;
    }

    pub(crate) fn set_fill(&mut self, fill: FillStatus) {
        self.fill = fill;
    }

    /// The client released its handle. The thread drops the track at its
    /// next cycle.
    pub(crate) fn terminate(&mut self) {
        self.terminated = true;
    }

    /// Consume the pending start ramp, if any.
    pub(crate) fn take_ramp(&mut self) -> bool {
        std::mem::take(&mut self.ramp_pending)
    }

    pub(crate) fn set_media_start(&mut self, frame: u64) -> AfResult<()> {
        match &mut self.spec.kind {
            TrackKind::Timed { media_start } => {
                *media_start = Some(frame);
                Ok(())
            }
            _ => Err(AfError::invalid_operation("not a timed track")),
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // CONTROL OPERATIONS
    // ═══════════════════════════════════════════════════════════════════════

    /// Returns true when the caller must add the track to the active set.
    pub(crate) fn start(&mut self, in_active: bool, startup_retries: u32) -> AfResult<bool> {
        let next = match self.state {
            TrackState::Active | TrackState::Resuming if in_active => {
                return Err(AfError::invalid_operation(format!(
                    "{} already active",
                    self.spec.id
                )));
            }
            TrackState::Paused | TrackState::Pausing => {
                if std::mem::take(&mut self.resume_to_stopping) {
                    TrackState::Stopping1
                } else {
                    TrackState::Resuming
                }
            }
            TrackState::Idle | TrackState::Flushed | TrackState::Stopped => {
                self.fill = FillStatus::Filling;
                TrackState::Active
            }
            // Removed from the active set (disabled or played out), or a
            // stop that has not committed yet.
            TrackState::Active
            | TrackState::Resuming
            | TrackState::Stopping1
            | TrackState::Stopping2 => TrackState::Active,
        };

        self.set_state(next);
        self.proxy.set_draining(next == TrackState::Stopping1);
        self.proxy
            .cblk()
            .clear_flags(CblkFlags::DISABLED | CblkFlags::UNDERRUN | CblkFlags::STREAM_END_DONE);
        self.retry_count = startup_retries;
        self.presentation_complete_frames = None;
        self.reset_done = false;
        self.ramp_pending = true;
        if !in_active {
            // Not being mixed, so touching the consumer cursor is safe.
            self.proxy.ack_flush_if_pending();
        }
        Ok(!in_active)
    }

    pub(crate) fn stop(&mut self, in_active: bool) -> AfResult<()> {
        match self.state {
            TrackState::Active | TrackState::Resuming | TrackState::Pausing | TrackState::Paused => {}
            state => {
                return Err(AfError::invalid_operation(format!(
                    "stop of {} from {state:?}",
                    self.spec.id
                )));
            }
        }
        self.resume_to_stopping = false;
        if !in_active {
            self.reset();
            self.set_state(TrackState::Stopped);
            return Ok(());
        }
        let next = self.spec.kind.request_stop();
        self.set_state(next);
        if next == TrackState::Stopping1 {
            self.proxy.set_draining(true);
        } else {
            self.stop_mark = Some(self.proxy.cblk().rear());
        }
        Ok(())
    }

    /// Returns true when the state changed.
    pub(crate) fn pause(&mut self, in_active: bool) -> bool {
        match self.state {
            TrackState::Active | TrackState::Resuming => {}
            TrackState::Stopping1 | TrackState::Stopping2 if self.spec.kind.defers_drain() => {
                self.resume_to_stopping = true;
            }
            _ => return false,
        }
        if in_active {
            self.set_state(TrackState::Pausing);
        } else {
            self.set_state(TrackState::Paused);
        }
        true
    }

    pub(crate) fn flush(&mut self, in_active: bool) -> AfResult<()> {
        if matches!(self.state, TrackState::Active | TrackState::Resuming) {
            return Err(AfError::invalid_operation(format!(
                "flush of {} while active",
                self.spec.id
            )));
        }
        self.resume_to_stopping = false;
        self.set_state(TrackState::Flushed);
        // An active-set track is reset by the thread when it removes it.
        if !in_active {
            self.reset_done = false;
            self.reset();
        }
        Ok(())
    }

    /// Discard buffered frames (rewind a static buffer) and restart the
    /// filling phase. Runs at most once per start.
    pub(crate) fn reset(&mut self) {
        self.stop_mark = None;
        if self.reset_done {
            return;
        }
        self.proxy.reset();
        self.proxy.set_draining(false);
        if !self.is_static() {
            self.proxy.cblk().clear_flags(CblkFlags::FORCE_READY);
        }
        self.fill = FillStatus::Filling;
        self.presentation_complete_frames = None;
        self.reset_done = true;
    }

    /// Apply a stop that a start overtook before the thread could reset
    /// the track: what was queued before the stop is skipped (a static
    /// buffer rewinds). Thread-side only.
    pub(crate) fn apply_stop_mark(&mut self) {
        if matches!(
            self.state,
            TrackState::Stopped | TrackState::Flushed | TrackState::Idle
        ) {
            return;
        }
        let Some(mark) = self.stop_mark.take() else {
            return;
        };
        if self.is_static() {
            self.reset_done = false;
            self.reset();
            // The reset owed to the latest start is still to come.
            self.reset_done = false;
            return;
        }
        let skipped = self.proxy.discard_to(mark);
        if skipped > 0 {
            log::debug!("{}: skipped {skipped} frames queued before the stop", self.spec.id);
        }
    }

    /// Mark the track dead for its client.
    pub fn invalidate(&self) {
        log::debug!("{} invalidated", self.spec.id);
        self.proxy.cblk().invalidate();
    }

    // ═══════════════════════════════════════════════════════════════════════
    // THREAD-SIDE QUERIES
    // ═══════════════════════════════════════════════════════════════════════

    /// Whether the filling phase is over. Stopping and pausing tracks are
    /// always ready so their tail plays out.
    pub(crate) fn is_ready(&mut self, frames_ready: usize) -> bool {
        if self.fill != FillStatus::Filling
            || self.state.is_stopping()
            || self.state == TrackState::Pausing
        {
            return true;
        }
        let cblk = self.proxy.cblk();
        let ready = if self.is_static() {
            frames_ready > 0
        } else {
            frames_ready >= self.frame_count() || cblk.flags().contains(CblkFlags::FORCE_READY)
        };
        if ready {
            self.fill = FillStatus::Filled;
            if !self.is_static() {
                cblk.clear_flags(CblkFlags::FORCE_READY);
            }
        }
        ready
    }

    /// True once the output has written everything this track contributed
    /// plus the device latency. The target is latched on the first call.
    pub(crate) fn presentation_complete(&mut self, frames_written: u64, latency_frames: u64) -> bool {
        let target = *self
            .presentation_complete_frames
            .get_or_insert(frames_written + latency_frames);
        if frames_written >= target || self.spec.kind == TrackKind::Offload {
            self.proxy.set_stream_end_done();
            return true;
        }
        false
    }

    /// Frames consumed by the server, corrected by what the device still
    /// holds. Relative to this track's ring; the client adds its epoch.
    pub fn timestamp(&self, latch: Option<RenderLatch>) -> AfResult<Timestamp> {
        if !matches!(self.state, TrackState::Active | TrackState::Paused) {
            return Err(AfError::invalid_operation(format!(
                "timestamp of {} while {:?}",
                self.spec.id, self.state
            )));
        }
        let latch = latch.ok_or(AfError::WouldBlock)?;
        let released = self.proxy.position();
        if released < latch.unpresented {
            return Err(AfError::WouldBlock);
        }
        Ok(Timestamp {
            position: released - latch.unpresented,
            time: latch.time,
        })
    }
}

impl std::fmt::Debug for Track {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Track")
            .field("id", &self.spec.id)
            .field("kind", &self.spec.kind)
            .field("state", &self.state)
            .field("fill", &self.fill)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use af_core::{ChannelMask, SampleFormat};
    use af_shm::{ClientProxy, Direction, RegionParams, SharedRegion};
    use af_core::WaitTimeout;

    fn make(kind: TrackKind, frame_count: usize) -> (Track, ClientProxy) {
        let region = SharedRegion::create(RegionParams {
            frame_count,
            frame_size: 4,
            sample_rate: 48_000,
            direction: Direction::Playback,
            static_data: None,
        })
        .unwrap();
        let client = ClientProxy::attach(Arc::clone(&region)).unwrap();
        let proxy = Arc::new(ServerProxy::attach(region).unwrap());
        let spec = TrackSpec {
            id: TrackId(7),
            kind,
            config: PcmConfig::new(48_000, SampleFormat::Pcm16, ChannelMask::STEREO),
            stream_type: StreamType::Music,
            session: 1,
        };
        (Track::new(spec, proxy), client)
    }

    fn fill(client: &ClientProxy, frames: usize) {
        let buf = client.obtain_buffer(frames, WaitTimeout::NonBlocking).unwrap();
        let n = buf.frame_count();
        client.release_buffer(buf, n).unwrap();
    }

    #[test]
    fn test_start_twice_fails() {
        let (mut track, _client) = make(TrackKind::Normal { fast: false }, 64);
        assert!(track.start(false, 50).unwrap());
        assert_eq!(track.state(), TrackState::Active);
        assert!(matches!(track.start(true, 50), Err(AfError::InvalidOperation(_))));
    }

    #[test]
    fn test_fast_stop_defers() {
        let (mut track, _client) = make(TrackKind::Normal { fast: true }, 64);
        track.start(false, 50).unwrap();
        track.stop(true).unwrap();
        assert_eq!(track.state(), TrackState::Stopping1);
        assert!(track.proxy().is_draining());
    }

    #[test]
    fn test_offload_pause_while_draining_resumes_to_stopping() {
        let (mut track, _client) = make(TrackKind::Offload, 64);
        track.start(false, 50).unwrap();
        track.stop(true).unwrap();
        assert!(track.pause(true));
        assert_eq!(track.state(), TrackState::Pausing);
        track.start(true, 50).unwrap();
        assert_eq!(track.state(), TrackState::Stopping1);
    }

    #[test]
    fn test_fill_needs_full_buffer() {
        let (mut track, client) = make(TrackKind::Normal { fast: false }, 64);
        track.start(false, 50).unwrap();
        fill(&client, 32);
        assert!(!track.is_ready(32));
        fill(&client, 32);
        assert!(track.is_ready(64));
        assert_eq!(track.fill_status(), FillStatus::Filled);
    }

    #[test]
    fn test_force_ready_skips_filling() {
        let (mut track, client) = make(TrackKind::Normal { fast: false }, 64);
        track.start(false, 50).unwrap();
        fill(&client, 8);
        client.cblk().set_flags(CblkFlags::FORCE_READY);
        assert!(track.is_ready(8));
        assert!(!client.cblk().flags().contains(CblkFlags::FORCE_READY));
    }

    #[test]
    fn test_flush_discards_when_idle() {
        let (mut track, client) = make(TrackKind::Normal { fast: false }, 64);
        fill(&client, 40);
        track.flush(false).unwrap();
        assert_eq!(track.state(), TrackState::Flushed);
        assert_eq!(client.frames_filled(), 0);
    }

    #[test]
    fn test_presentation_complete_latches_target() {
        let (mut track, client) = make(TrackKind::Normal { fast: false }, 64);
        assert!(!track.presentation_complete(1000, 480));
        assert!(!track.presentation_complete(1400, 0));
        assert!(track.presentation_complete(1480, 0));
        assert!(client.cblk().flags().contains(CblkFlags::STREAM_END_DONE));
    }

    #[test]
    fn test_timed_track_pads_until_media_start() {
        let (track, client) = make(TrackKind::Timed { media_start: Some(100) }, 64);
        fill(&client, 64);
        match track.kind().next_chunk(track.proxy(), 64, 90).unwrap() {
            Chunk::Silence(n) => assert_eq!(n, 10),
            Chunk::Frames(_) => panic!("expected silence"),
        }
        match track.kind().next_chunk(track.proxy(), 64, 100).unwrap() {
            Chunk::Frames(buf) => assert_eq!(buf.frame_count(), 64),
            Chunk::Silence(_) => panic!("expected frames"),
        }
    }

    #[test]
    fn test_timestamp_requires_active_or_paused() {
        let (track, _client) = make(TrackKind::Normal { fast: false }, 64);
        let latch = RenderLatch {
            unpresented: 0,
            time: Instant::now(),
        };
        assert!(matches!(track.timestamp(Some(latch)), Err(AfError::InvalidOperation(_))));
    }

    #[derive(Debug, Clone, Copy)]
    enum Op {
        Start,
        Stop,
        Pause,
        Flush,
    }

    /// Expected state after `op` on an ordinary track in the active set,
    /// or `None` for `InvalidOperation`.
    fn expected(state: TrackState, op: Op) -> Option<TrackState> {
        use TrackState::*;
        match (op, state) {
            (Op::Start, Active | Resuming) => None,
            (Op::Start, Paused | Pausing) => Some(Resuming),
            (Op::Start, _) => Some(Active),
            (Op::Stop, Active | Resuming | Pausing | Paused) => Some(Stopped),
            (Op::Stop, _) => None,
            (Op::Pause, Active | Resuming) => Some(Pausing),
            (Op::Pause, s) => Some(s),
            (Op::Flush, Active | Resuming) => None,
            (Op::Flush, _) => Some(Flushed),
        }
    }

    #[test]
    fn test_every_state_operation_pair() {
        for state in TrackState::ALL {
            for op in [Op::Start, Op::Stop, Op::Pause, Op::Flush] {
                let (mut track, _client) = make(TrackKind::Normal { fast: false }, 64);
                track.set_state(state);
                let result = match op {
                    Op::Start => track.start(true, 50).map(|_| ()),
                    Op::Stop => track.stop(true),
                    Op::Pause => {
                        track.pause(true);
                        Ok(())
                    }
                    Op::Flush => track.flush(true),
                };
                match expected(state, op) {
                    Some(next) => {
                        assert!(result.is_ok(), "{op:?} from {state:?}: {result:?}");
                        assert_eq!(track.state(), next, "{op:?} from {state:?}");
                    }
                    None => {
                        assert!(
                            matches!(result, Err(AfError::InvalidOperation(_))),
                            "{op:?} from {state:?}: {result:?}"
                        );
                        assert_eq!(track.state(), state, "{op:?} from {state:?} moved");
                    }
                }
            }
        }
    }
}
