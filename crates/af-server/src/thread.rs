//! Playback threads: the prepare / mix / write loop of one output
//!
//! Each cycle:
//! 1. apply queued config events
//! 2. under the thread lock, walk the active set, advance track states and
//!    pick the tracks that are ready
//! 3. without the lock, pull frames from the ready tracks and mix or copy
//!    them
//! 4. write to the sink, tolerating partial writes
//! 5. decide how long to sleep before the next cycle
//!
//! Control-plane calls only touch [`ThreadShared`] under its lock; the loop
//! state in [`PlaybackThread`] belongs to the thread alone.

use crate::fast_path::FastPath;
use crate::mixer::{AudioMixer, apply_gain_in_place};
use crate::sink::{DrainMode, OutputSink, sink_latency_frames};
use crate::thread_priority::{ThreadPriority, set_thread_priority};
use crate::track::{Chunk, FillStatus, RenderLatch, Track, TrackKind, TrackState};
use af_core::{
    AfError, AfResult, MAX_SAMPLE_RATE, MIN_SAMPLE_RATE, OutputId, PcmConfig, ServerConfig,
    StreamType, Timestamp, TrackId, WakeupPlanner, frames_to_duration, frames_until_next_period,
};
use af_shm::{CblkFlags, RegionArena, ServerProxy, Side};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use parking_lot::{Condvar, Mutex};
use rtrb::{Consumer, Producer, RingBuffer};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

const CONFIG_QUEUE_SIZE: usize = 16;

/// Output flavour, fixed when the output is opened
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OutputKind {
    /// Software mix of any number of PCM tracks.
    Mixer,
    /// One track copied straight to the sink.
    Direct,
    /// One track rendered by the sink, which also drains and pauses.
    Offload,
    /// Mix fanned out to several mixer outputs.
    Duplicating,
}

impl OutputKind {
    fn single_track(self) -> bool {
        matches!(self, Self::Direct | Self::Offload)
    }
}

/// Result of the preparation step of one cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum MixerStatus {
    /// Nothing enabled.
    Idle,
    /// Tracks enabled but none ready.
    TracksEnabled,
    TracksReady,
    /// Ask the sink to drain the current track, notifying early.
    DrainTrack,
    /// Ask the sink to drain everything.
    DrainAll,
}

/// What a cycle did, and how long the caller should wait before the next
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CycleOutcome {
    pub status: MixerStatus,
    /// Frames accepted by the sink this cycle.
    pub frames_written: usize,
    /// Planned sleep before the next cycle.
    pub sleep: Option<Duration>,
    /// No active tracks; the thread may block until there is work.
    pub idle: bool,
}

// ═══════════════════════════════════════════════════════════════════════════════
// CONFIG EVENTS
// ═══════════════════════════════════════════════════════════════════════════════

/// Output reconfiguration, applied between cycles
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigEvent {
    /// Only while no tracks are attached.
    SetSampleRate(u32),
    /// Only while no tracks are attached.
    SetFrameCount(usize),
    /// Reroute to another device; every attached track is invalidated.
    SetRouting(u32),
}

struct ConfigRequest {
    event: ConfigEvent,
    reply: Sender<AfResult<()>>,
}

/// Pending status of a queued [`ConfigEvent`]
#[derive(Debug)]
pub struct ConfigTicket {
    rx: Receiver<AfResult<()>>,
}

impl ConfigTicket {
    pub fn wait(self, timeout: Duration) -> AfResult<()> {
        match self.rx.recv_timeout(timeout) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => Err(AfError::TimedOut),
            Err(RecvTimeoutError::Disconnected) => Err(AfError::DeadObject),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// SHARED STATE
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy)]
struct StreamVolume {
    volume: f32,
    mute: bool,
}

/// Everything guarded by the thread lock
pub(crate) struct ThreadState {
    tracks: HashMap<TrackId, Track>,
    /// Insertion order is mixing order.
    active: Vec<TrackId>,
    master_volume: f32,
    master_mute: bool,
    streams: [StreamVolume; StreamType::COUNT],
    latch: Option<RenderLatch>,
    standby: bool,
    sample_rate: u32,
    frame_count: usize,
    frames_written: u64,
    flush_output: bool,
}

impl ThreadState {
    fn master_gain(&self) -> f32 {
        if self.master_mute { 0.0 } else { self.master_volume }
    }

    fn in_active(&self, id: TrackId) -> bool {
        self.active.contains(&id)
    }

    fn track_mut(&mut self, id: TrackId) -> AfResult<&mut Track> {
        self.tracks.get_mut(&id).ok_or(AfError::DeadObject)
    }
}

/// Control-plane view of a playback thread
pub struct ThreadShared {
    id: OutputId,
    kind: OutputKind,
    config: ServerConfig,
    sink_config: PcmConfig,
    latency_ms: u32,
    state: Mutex<ThreadState>,
    work: Condvar,
    config_tx: Mutex<Producer<ConfigRequest>>,
    exit: AtomicBool,
    arena: Arc<RegionArena>,
}

impl ThreadShared {
    pub fn id(&self) -> OutputId {
        self.id
    }

    pub fn kind(&self) -> OutputKind {
        self.kind
    }

    pub fn sink_config(&self) -> PcmConfig {
        let mut config = self.sink_config;
        config.sample_rate = self.state.lock().sample_rate;
        config
    }

    pub fn sample_rate(&self) -> u32 {
        self.state.lock().sample_rate
    }

    /// Frames per cycle.
    pub fn frame_count(&self) -> usize {
        self.state.lock().frame_count
    }

    pub fn latency_ms(&self) -> u32 {
        self.latency_ms
    }

    pub fn is_standby(&self) -> bool {
        self.state.lock().standby
    }

    pub fn frames_written(&self) -> u64 {
        self.state.lock().frames_written
    }

    pub fn track_count(&self) -> usize {
        self.state.lock().tracks.len()
    }

    pub fn active_tracks(&self) -> Vec<TrackId> {
        self.state.lock().active.clone()
    }

    pub fn track_state(&self, id: TrackId) -> Option<TrackState> {
        self.state.lock().tracks.get(&id).map(Track::state)
    }

    pub fn fast_track_count(&self) -> usize {
        self.state
            .lock()
            .tracks
            .values()
            .filter(|t| t.kind().is_fast())
            .count()
    }

    fn notify(&self) {
        self.work.notify_all();
    }

    pub(crate) fn add_track(&self, track: Track) -> AfResult<()> {
        let mut st = self.state.lock();
        if st.tracks.len() >= self.config.max_tracks_per_thread {
            return Err(AfError::insufficient(format!(
                "{} has no free track slot ({} in use)",
                self.id,
                st.tracks.len()
            )));
        }
        st.tracks.insert(track.id(), track);
        Ok(())
    }

    pub(crate) fn start_track(&self, id: TrackId) -> AfResult<()> {
        let mut st = self.state.lock();
        let in_active = st.in_active(id);
        if self.kind.single_track() && !in_active && !st.active.is_empty() {
            return Err(AfError::invalid_operation(format!("{} is busy", self.id)));
        }
        let startup = self.config.max_track_startup_retries;
        let add = st.track_mut(id)?.start(in_active, startup)?;
        if add {
            st.active.push(id);
        }
        self.notify();
        Ok(())
    }

    pub(crate) fn stop_track(&self, id: TrackId) -> AfResult<()> {
        let mut st = self.state.lock();
        let in_active = st.in_active(id);
        st.track_mut(id)?.stop(in_active)?;
        self.notify();
        Ok(())
    }

    pub(crate) fn pause_track(&self, id: TrackId) -> AfResult<()> {
        let mut st = self.state.lock();
        let in_active = st.in_active(id);
        if st.track_mut(id)?.pause(in_active) {
            self.notify();
        }
        Ok(())
    }

    pub(crate) fn flush_track(&self, id: TrackId) -> AfResult<()> {
        let mut st = self.state.lock();
        let in_active = st.in_active(id);
        st.track_mut(id)?.flush(in_active)?;
        if self.kind.single_track() {
            st.flush_output = true;
        }
        self.notify();
        Ok(())
    }

    pub(crate) fn set_media_start(&self, id: TrackId, frame: u64) -> AfResult<()> {
        self.state.lock().track_mut(id)?.set_media_start(frame)
    }

    pub(crate) fn track_timestamp(&self, id: TrackId) -> AfResult<Timestamp> {
        let st = self.state.lock();
        let track = st.tracks.get(&id).ok_or(AfError::DeadObject)?;
        track.timestamp(st.latch)
    }

    /// The client released the track. Dropped at once unless the thread
    /// is still consuming it.
    pub(crate) fn terminate_track(&self, id: TrackId) {
        let mut st = self.state.lock();
        if st.in_active(id) {
            if let Some(track) = st.tracks.get_mut(&id) {
                track.terminate();
            }
            self.notify();
        } else if st.tracks.remove(&id).is_some() {
            self.arena.relinquish(id, Side::Server);
            log::debug!("{id} released on {}", self.id);
        }
    }

    pub fn set_master_volume(&self, volume: f32) {
        self.state.lock().master_volume = volume;
    }

    pub fn set_master_mute(&self, mute: bool) {
        self.state.lock().master_mute = mute;
    }

    pub fn set_stream_volume(&self, stream: StreamType, volume: f32) {
        self.state.lock().streams[stream.index()].volume = volume;
    }

    pub fn set_stream_mute(&self, stream: StreamType, mute: bool) {
        self.state.lock().streams[stream.index()].mute = mute;
    }

    /// Invalidate every track of `stream` so their clients recreate them.
    pub fn invalidate_stream(&self, stream: StreamType) {
        let st = self.state.lock();
        st.tracks
            .values()
            .filter(|t| t.stream_type() == stream)
            .for_each(Track::invalidate);
    }

    pub fn invalidate_all(&self) {
        self.state.lock().tracks.values().for_each(Track::invalidate);
    }

    /// Queue a config event; it is applied at the start of the next cycle.
    pub fn post_config(&self, event: ConfigEvent) -> AfResult<ConfigTicket> {
        let (reply, rx) = crossbeam_channel::bounded(1);
        self.config_tx
            .lock()
            .push(ConfigRequest { event, reply })
            .map_err(|_| AfError::insufficient("config event queue full"))?;
        let _st = self.state.lock();
        self.notify();
        Ok(ConfigTicket { rx })
    }

    pub(crate) fn request_exit(&self) {
        self.exit.store(true, Ordering::Release);
        let _st = self.state.lock();
        self.notify();
    }

    /// Invalidate and drop every track, releasing the server side of each
    /// region.
    pub(crate) fn detach_all(&self) {
        let mut st = self.state.lock();
        st.active.clear();
        for (id, track) in st.tracks.drain() {
            track.invalidate();
            self.arena.relinquish(id, Side::Server);
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// CYCLE PLAN
// ═══════════════════════════════════════════════════════════════════════════════

/// A ready track, captured under the lock for the unlocked mix step
struct MixEntry {
    id: TrackId,
    kind: TrackKind,
    proxy: Arc<ServerProxy>,
    config: PcmConfig,
    gain: (f32, f32),
    from_zero: bool,
}

struct CyclePlan {
    status: MixerStatus,
    entries: Vec<MixEntry>,
    planner: WakeupPlanner,
    sink_pause: bool,
    sink_resume: bool,
    sink_flush: bool,
    hw_volume: Option<(f32, f32)>,
}

/// Pull up to `frames` frames from a track, handing each contiguous piece
/// to `consume(bytes, frame_offset) -> frames_used`. Returns frames covered.
fn pull_track(
    entry: &MixEntry,
    frames: usize,
    timeline: u64,
    mut consume: impl FnMut(&[u8], usize) -> usize,
) -> AfResult<usize> {
    let mut done = 0;
    while done < frames {
        match entry.kind.next_chunk(&entry.proxy, frames - done, timeline + done as u64)? {
            Chunk::Silence(n) => done += n,
            Chunk::Frames(buffer) => {
                if buffer.is_empty() {
                    break;
                }
                let used = consume(buffer.bytes(), done);
                entry.proxy.release_buffer(buffer, used)?;
                if used == 0 {
                    break;
                }
                done += used;
            }
        }
    }
    Ok(done)
}

// ═══════════════════════════════════════════════════════════════════════════════
// PLAYBACK THREAD
// ═══════════════════════════════════════════════════════════════════════════════

/// Loop-local state of one output
pub struct PlaybackThread {
    shared: Arc<ThreadShared>,
    sink: Box<dyn OutputSink>,
    mixer: AudioMixer,
    fast: FastPath,
    config_rx: Consumer<ConfigRequest>,
    out: Vec<u8>,
    out_offset: usize,
    status: MixerStatus,
    /// Preparation result ignoring fast tracks, from the previous cycle.
    status_ignoring_fast: MixerStatus,
    slept: bool,
    sleep_shift: u32,
    frames_written: u64,
    standby: bool,
    standby_at: Instant,
    last_warning: Option<Instant>,
    delayed_writes: u64,
    hw_paused: bool,
    draining: bool,
}

impl PlaybackThread {
    pub fn new(
        id: OutputId,
        kind: OutputKind,
        sink: Box<dyn OutputSink>,
        config: ServerConfig,
        arena: Arc<RegionArena>,
    ) -> AfResult<(Arc<ThreadShared>, Self)> {
        let sink_config = sink.config();
        sink_config.validate()?;
        if sink_config.format == af_core::SampleFormat::Pcm8 {
            return Err(AfError::invalid_argument("sink format must be 16-bit or float"));
        }
        let frame_count = sink.period_frames();
        if frame_count == 0 {
            return Err(AfError::invalid_argument("sink period must be > 0"));
        }
        let (config_tx, config_rx) = RingBuffer::new(CONFIG_QUEUE_SIZE);
        let shared = Arc::new(ThreadShared {
            id,
            kind,
            latency_ms: sink.latency_ms(),
            sink_config,
            state: Mutex::new(ThreadState {
                tracks: HashMap::new(),
                active: Vec::new(),
                master_volume: 1.0,
                master_mute: false,
                streams: [StreamVolume {
                    volume: 1.0,
                    mute: false,
                }; StreamType::COUNT],
                latch: None,
                standby: true,
                sample_rate: sink_config.sample_rate,
                frame_count,
                frames_written: 0,
                flush_output: false,
            }),
            work: Condvar::new(),
            config_tx: Mutex::new(config_tx),
            exit: AtomicBool::new(false),
            arena,
            config: config.clone(),
        });
        let thread = Self {
            shared: Arc::clone(&shared),
            sink,
            mixer: AudioMixer::new(sink_config.channel_count(), frame_count, config.volume_ramp_frames),
            fast: FastPath::new(config.max_fast_tracks),
            config_rx,
            out: Vec::new(),
            out_offset: 0,
            status: MixerStatus::Idle,
            status_ignoring_fast: MixerStatus::Idle,
            slept: false,
            sleep_shift: 0,
            frames_written: 0,
            standby: true,
            standby_at: Instant::now() + config.standby_delay(),
            last_warning: None,
            delayed_writes: 0,
            hw_paused: false,
            draining: false,
        };
        Ok((shared, thread))
    }

    pub fn shared(&self) -> &Arc<ThreadShared> {
        &self.shared
    }

    fn config(&self) -> &ServerConfig {
        &self.shared.config
    }

    fn frame_size(&self) -> usize {
        self.shared.sink_config.shared_frame_size()
    }

    fn period(&self) -> Duration {
        frames_to_duration(self.mixer.frame_count() as u64, self.sink.config().sample_rate)
    }

    fn max_retries(&self) -> u32 {
        match self.shared.kind {
            OutputKind::Mixer | OutputKind::Duplicating => self.config().max_track_retries,
            OutputKind::Direct => self.config().max_track_retries_direct,
            OutputKind::Offload => self.config().max_track_retries_offload,
        }
    }

    /// Run one cycle without sleeping. Manual outputs are driven by calling
    /// this directly.
    pub fn cycle(&mut self) -> CycleOutcome {
        self.process_config_events();
        if self.draining && self.sink.drain_complete() {
            log::debug!("{}: drain complete", self.shared.id);
            self.draining = false;
        }

        // Finish a partial write before mixing anything new.
        if self.out_offset < self.out.len() && !self.hw_paused {
            let frames = self.write_out();
            self.publish(Vec::new());
            return CycleOutcome {
                status: self.status,
                frames_written: frames,
                sleep: None,
                idle: false,
            };
        }

        let now = Instant::now();
        let shared = Arc::clone(&self.shared);
        let plan = {
            let mut st = shared.state.lock();
            if st.flush_output {
                st.flush_output = false;
                self.flush_sink();
            }
            if st.active.is_empty() {
                if !self.standby && now >= self.standby_at {
                    self.enter_standby(&mut st);
                }
                self.fast.clear();
                self.status = MixerStatus::Idle;
                self.slept = false;
                let sleep = (!self.standby).then(|| self.standby_at.saturating_duration_since(now));
                return CycleOutcome {
                    status: MixerStatus::Idle,
                    frames_written: 0,
                    sleep,
                    idle: true,
                };
            }
            match self.shared.kind {
                OutputKind::Mixer | OutputKind::Duplicating => self.prepare_mixer(&mut st),
                OutputKind::Direct | OutputKind::Offload => self.prepare_single(&mut st),
            }
        };
        self.status = plan.status;
        self.apply_sink_actions(&plan);

        let mut failed = Vec::new();
        let write = match plan.status {
            MixerStatus::TracksReady => {
                failed = self.render(&plan);
                if !self.slept && self.sleep_shift > 0 {
                    self.sleep_shift -= 1;
                }
                self.slept = false;
                true
            }
            MixerStatus::DrainTrack | MixerStatus::DrainAll => {
                let mode = if plan.status == MixerStatus::DrainTrack {
                    DrainMode::EarlyNotify
                } else {
                    DrainMode::All
                };
                self.start_drain(mode);
                false
            }
            MixerStatus::Idle | MixerStatus::TracksEnabled => match self.plan_sleep(&plan) {
                Some(sleep) => {
                    self.publish(failed);
                    return CycleOutcome {
                        status: plan.status,
                        frames_written: 0,
                        sleep: Some(sleep),
                        idle: false,
                    };
                }
                None => {
                    self.render_silence();
                    true
                }
            },
        };

        let frames = if write { self.write_out() } else { 0 };
        self.publish(failed);
        CycleOutcome {
            status: plan.status,
            frames_written: frames,
            sleep: None,
            idle: false,
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // PREPARATION (under the thread lock)
    // ═══════════════════════════════════════════════════════════════════════

    fn planner(&self, st: &ThreadState) -> WakeupPlanner {
        let mut planner = WakeupPlanner::new(st.sample_rate, self.config().poll_ceiling());
        for track in st.active.iter().filter_map(|id| st.tracks.get(id)) {
            let proxy = track.proxy();
            let period = proxy.cblk().notification_frames() as u64;
            if let Some(frames) = frames_until_next_period(proxy.position(), period) {
                planner.event_in_frames(frames);
            }
            if let Some(frames) = proxy.frames_to_loop_end() {
                planner.event_in_frames(frames as u64);
            }
        }
        planner
    }

    fn empty_plan(&self, st: &ThreadState) -> CyclePlan {
        CyclePlan {
            status: MixerStatus::Idle,
            entries: Vec::new(),
            planner: self.planner(st),
            sink_pause: false,
            sink_resume: false,
            sink_flush: false,
            hw_volume: None,
        }
    }

    fn prepare_mixer(&mut self, st: &mut ThreadState) -> CyclePlan {
        let mut plan = self.empty_plan(st);
        let master = st.master_gain();
        let frame_count = st.frame_count;
        let latency = sink_latency_frames(self.sink.as_ref());
        let max_retries = self.max_retries();
        let prev_ready = self.status_ignoring_fast == MixerStatus::TracksReady;
        let mut status = MixerStatus::Idle;
        let mut fast_tracks = 0usize;
        let mut removed = Vec::new();

        for id in st.active.clone() {
            let Some(track) = st.tracks.get_mut(&id) else {
                removed.push(id);
                continue;
            };
            if track.is_terminated() {
                removed.push(id);
                continue;
            }
            track.apply_stop_mark();
            let stream = st.streams[track.stream_type().index()];
            let gain = if stream.mute { 0.0 } else { master * stream.volume };

            if track.kind().is_fast() {
                if self.prepare_fast(track, gain, latency, max_retries) {
                    fast_tracks += 1;
                } else {
                    removed.push(id);
                }
                continue;
            }

            let state = track.state();
            match state {
                TrackState::Paused => {
                    removed.push(id);
                    continue;
                }
                TrackState::Stopped | TrackState::Flushed | TrackState::Idle => {
                    track.reset();
                    removed.push(id);
                    continue;
                }
                _ => {}
            }

            let proxy = Arc::clone(track.proxy());
            // A flush posted after the last reset; this thread is the only
            // consumer, so it is applied here.
            proxy.ack_flush_if_pending();
            let frames_ready = proxy.frames_ready();
            let min_frames = if !track.is_static() && state != TrackState::Pausing && prev_ready {
                frame_count
            } else {
                1
            };

            if frames_ready >= min_frames && track.is_ready(frames_ready) {
                let mut from_zero = track.take_ramp();
                if track.fill_status() == FillStatus::Filled {
                    track.set_fill(FillStatus::Active);
                    from_zero = true;
                }
                if state == TrackState::Resuming {
                    track.set_state(TrackState::Active);
                    from_zero = true;
                }
                let gain = if state == TrackState::Pausing {
                    // Ramp down over this last cycle.
                    track.set_state(TrackState::Paused);
                    (0.0, 0.0)
                } else {
                    let (l, r) = proxy.volume_lr();
                    (gain * l, gain * r)
                };
                track.retry_count = max_retries;
                plan.entries.push(MixEntry {
                    id,
                    kind: track.kind(),
                    proxy,
                    config: *track.config(),
                    gain,
                    from_zero,
                });
                status = MixerStatus::TracksReady;
                continue;
            }

            if frames_ready < frame_count && state != TrackState::Pausing {
                track.kind().report_underrun(&proxy, frame_count - frames_ready);
            }
            if state == TrackState::Pausing {
                track.set_state(TrackState::Paused);
                removed.push(id);
            } else if track.is_static() {
                // Played to the end of the buffer.
                if self.standby || track.presentation_complete(self.frames_written, latency) {
                    removed.push(id);
                }
            } else {
                track.retry_count = track.retry_count.saturating_sub(1);
                if track.retry_count == 0 {
                    log::info!("{id}: buffer timeout on {}, disabled", self.shared.id);
                    proxy.cblk().set_flags(CblkFlags::DISABLED);
                    removed.push(id);
                } else if status != MixerStatus::TracksReady {
                    status = MixerStatus::TracksEnabled;
                }
            }
        }

        self.status_ignoring_fast = status;
        if fast_tracks > 0 {
            status = MixerStatus::TracksReady;
        }
        plan.status = status;
        self.remove_tracks(st, &removed);
        plan
    }

    /// Advance a fast track from the fast path's counters. Returns false
    /// when the track leaves the active set.
    fn prepare_fast(&mut self, track: &mut Track, gain: f32, latency: u64, max_retries: u32) -> bool {
        let id = track.id();
        let recent = self.fast.poll(id);
        let mut active = true;
        match track.state() {
            TrackState::Stopping1 => {
                if recent.underruns() > 0 || track.is_terminated() {
                    track.set_state(TrackState::Stopping2);
                }
            }
            TrackState::Pausing => {
                track.set_state(TrackState::Paused);
                active = false;
            }
            TrackState::Resuming => track.set_state(TrackState::Active),
            TrackState::Active => {
                if recent.full > 0 || recent.partial > 0 {
                    track.retry_count = max_retries;
                }
                if recent.empty > 0 {
                    if track.is_static() {
                        active = !(self.standby
                            || track.presentation_complete(self.frames_written, latency));
                    } else {
                        track.retry_count = track.retry_count.saturating_sub(1);
                        if track.retry_count == 0 {
                            log::info!("{id}: fast track starved, disabled");
                            track.proxy().cblk().set_flags(CblkFlags::DISABLED);
                            active = false;
                        }
                    }
                }
            }
            TrackState::Stopping2
            | TrackState::Paused
            | TrackState::Stopped
            | TrackState::Flushed
            | TrackState::Idle => {
                if self.standby || track.presentation_complete(self.frames_written, latency) {
                    if track.state() == TrackState::Stopping2 {
                        track.set_state(TrackState::Stopped);
                    }
                    if matches!(track.state(), TrackState::Stopped | TrackState::Flushed) {
                        track.reset();
                    }
                    active = false;
                }
            }
        }
        if active {
            let (l, r) = track.proxy().volume_lr();
            self.fast.enable(id, track.proxy(), *track.config(), (gain * l, gain * r));
        } else {
            self.fast.disable(id);
        }
        active
    }

    fn prepare_single(&mut self, st: &mut ThreadState) -> CyclePlan {
        let mut plan = self.empty_plan(st);
        let master = st.master_gain();
        let latency = sink_latency_frames(self.sink.as_ref());
        let max_retries = self.max_retries();
        let offload = self.shared.kind == OutputKind::Offload;
        let write_pending = self.out_offset < self.out.len();
        let mut status = MixerStatus::Idle;
        let mut removed = Vec::new();

        for id in st.active.clone() {
            let Some(track) = st.tracks.get_mut(&id) else {
                removed.push(id);
                continue;
            };
            if track.is_terminated() {
                removed.push(id);
                continue;
            }
            track.apply_stop_mark();
            let stream = st.streams[track.stream_type().index()];
            let gain = if stream.mute { 0.0 } else { master * stream.volume };
            let proxy = Arc::clone(track.proxy());
            let state = track.state();

            match state {
                TrackState::Pausing => {
                    track.set_state(TrackState::Paused);
                    if offload && !self.hw_paused {
                        plan.sink_pause = true;
                    }
                    removed.push(id);
                    continue;
                }
                TrackState::Paused => {
                    removed.push(id);
                    continue;
                }
                TrackState::Stopped | TrackState::Flushed | TrackState::Idle => {
                    track.reset();
                    removed.push(id);
                    continue;
                }
                _ => {}
            }

            proxy.ack_flush_if_pending();
            let frames_ready = proxy.frames_ready();
            if frames_ready > 0 && state != TrackState::Stopping2 && track.is_ready(frames_ready) {
                if track.fill_status() == FillStatus::Filled {
                    track.set_fill(FillStatus::Active);
                }
                if state == TrackState::Resuming {
                    track.set_state(TrackState::Active);
                    if self.hw_paused {
                        plan.sink_resume = true;
                    }
                }
                track.take_ramp();
                track.retry_count = max_retries;
                let (l, r) = proxy.volume_lr();
                let gain = (gain * l, gain * r);
                if offload {
                    plan.hw_volume = Some(gain);
                }
                plan.entries.push(MixEntry {
                    id,
                    kind: track.kind(),
                    proxy,
                    config: *track.config(),
                    gain: if offload { (1.0, 1.0) } else { gain },
                    from_zero: false,
                });
                status = MixerStatus::TracksReady;
                continue;
            }

            match state {
                TrackState::Stopping1 => {
                    // Drain only once everything mixed has reached the sink.
                    if !write_pending {
                        track.set_state(TrackState::Stopping2);
                        if offload && !self.standby && !self.draining {
                            status = MixerStatus::DrainTrack;
                        }
                        if self.hw_paused {
                            plan.sink_resume = true;
                        }
                    }
                }
                TrackState::Stopping2 => {
                    if !self.draining || self.standby {
                        track.set_state(TrackState::Stopped);
                        track.presentation_complete(self.frames_written, latency);
                        track.reset();
                        removed.push(id);
                    }
                }
                _ => {
                    track.kind().report_underrun(&proxy, st.frame_count.saturating_sub(frames_ready));
                    track.retry_count = track.retry_count.saturating_sub(1);
                    if track.retry_count == 0 {
                        log::info!("{id}: buffer timeout on {}, disabled", self.shared.id);
                        proxy.cblk().set_flags(CblkFlags::DISABLED);
                        removed.push(id);
                    } else if status == MixerStatus::Idle {
                        status = MixerStatus::TracksEnabled;
                    }
                }
            }
        }

        self.status_ignoring_fast = status;
        plan.status = status;
        self.remove_tracks(st, &removed);
        plan
    }

    fn remove_tracks(&mut self, st: &mut ThreadState, removed: &[TrackId]) {
        if removed.is_empty() {
            return;
        }
        st.active.retain(|id| !removed.contains(id));
        for &id in removed {
            self.mixer.remove(id);
            self.fast.disable(id);
            if st.tracks.get(&id).is_some_and(Track::is_terminated) {
                st.tracks.remove(&id);
                self.shared.arena.relinquish(id, Side::Server);
                log::debug!("{id} released on {}", self.shared.id);
            }
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // MIX AND WRITE (without the lock)
    // ═══════════════════════════════════════════════════════════════════════

    /// Fill `out` from the ready tracks. Returns tracks whose rings failed.
    fn render(&mut self, plan: &CyclePlan) -> Vec<TrackId> {
        let frames = self.mixer.frame_count();
        let timeline = self.frames_written;
        let mut failed = Vec::new();
        self.out_offset = 0;

        match self.shared.kind {
            OutputKind::Mixer | OutputKind::Duplicating => {
                self.mixer.begin();
                for entry in &plan.entries {
                    if entry.from_zero {
                        self.mixer.ramp_from_zero(entry.id);
                    }
                    self.mixer.set_volume(entry.id, entry.gain.0, entry.gain.1, true);
                    let mixer = &mut self.mixer;
                    let pulled = pull_track(entry, frames, timeline, |bytes, at| {
                        mixer.accumulate(entry.id, bytes, &entry.config, at)
                    });
                    if let Err(e) = pulled {
                        log::warn!("{}: mixing failed: {e}", entry.id);
                        failed.push(entry.id);
                    }
                }
                self.fast.mix(&mut self.mixer, frames);
                if let Err(e) = self.mixer.render(self.shared.sink_config.format, &mut self.out) {
                    log::error!("{}: render failed: {e}", self.shared.id);
                    self.out.clear();
                }
            }
            OutputKind::Direct | OutputKind::Offload => {
                let frame_size = self.frame_size();
                let offload = self.shared.kind == OutputKind::Offload;
                self.out.clear();
                self.out.resize(frames * frame_size, 0);
                let mut covered = 0;
                if let Some(entry) = plan.entries.first() {
                    let out = &mut self.out;
                    match pull_track(entry, frames, timeline, |bytes, at| {
                        let n = bytes.len() / frame_size;
                        out[at * frame_size..(at + n) * frame_size].copy_from_slice(&bytes[..n * frame_size]);
                        n
                    }) {
                        Ok(done) => covered = done,
                        Err(e) => {
                            log::warn!("{}: copy failed: {e}", entry.id);
                            failed.push(entry.id);
                        }
                    }
                    apply_gain_in_place(
                        &mut self.out[..covered * frame_size],
                        entry.config.format,
                        entry.config.channel_count(),
                        entry.gain.0,
                        entry.gain.1,
                    );
                }
                // Compressed data is never padded.
                if offload {
                    self.out.truncate(covered * frame_size);
                }
            }
        }
        failed
    }

    fn render_silence(&mut self) {
        self.out.clear();
        self.out.resize(self.mixer.frame_count() * self.frame_size(), 0);
        self.out_offset = 0;
    }

    /// Sleep planning when no track is ready. Returns `None` when the
    /// cycle should write silence instead.
    fn plan_sleep(&mut self, plan: &CyclePlan) -> Option<Duration> {
        let period = self.period();
        let idle_sleep = period / 2;
        if self.shared.kind == OutputKind::Offload {
            return Some(if plan.status == MixerStatus::TracksEnabled { period } else { idle_sleep }.min(plan.planner.next()));
        }
        if !self.slept {
            let sleep = match (self.shared.kind, plan.status) {
                (OutputKind::Mixer | OutputKind::Duplicating, MixerStatus::TracksEnabled) => {
                    let shifted = period / (1u32 << self.sleep_shift);
                    if self.sleep_shift < self.config().max_thread_sleep_shift {
                        self.sleep_shift += 1;
                    }
                    shifted.max(self.config().min_thread_sleep())
                }
                (_, MixerStatus::TracksEnabled) => period,
                _ => idle_sleep,
            };
            self.slept = true;
            return Some(sleep.min(plan.planner.next()));
        }
        if self.frames_written != 0 || plan.status == MixerStatus::TracksEnabled {
            // Slept once already; keep the sink fed.
            self.slept = false;
            return None;
        }
        Some(idle_sleep)
    }

    fn apply_sink_actions(&mut self, plan: &CyclePlan) {
        let id = self.shared.id;
        if plan.sink_pause && !self.standby {
            match self.sink.pause() {
                Ok(()) => self.hw_paused = true,
                Err(e) => log::warn!("{id}: sink pause failed: {e}"),
            }
        }
        if let Some((l, r)) = plan.hw_volume {
            if let Err(e) = self.sink.set_volume(l, r) {
                log::debug!("{id}: hardware volume unavailable: {e}");
            }
        }
        if plan.sink_flush {
            self.flush_sink();
        }
        if plan.sink_resume && self.hw_paused {
            match self.sink.resume() {
                Ok(()) => self.hw_paused = false,
                Err(e) => log::warn!("{id}: sink resume failed: {e}"),
            }
        }
    }

    fn flush_sink(&mut self) {
        self.out.clear();
        self.out_offset = 0;
        self.draining = false;
        if let Err(e) = self.sink.flush() {
            log::warn!("{}: sink flush failed: {e}", self.shared.id);
        }
    }

    fn start_drain(&mut self, mode: DrainMode) {
        match self.sink.drain(mode) {
            Ok(()) => {
                log::debug!("{}: draining ({mode:?})", self.shared.id);
                self.draining = true;
            }
            Err(e) => log::warn!("{}: drain failed: {e}", self.shared.id),
        }
        self.standby_at = Instant::now() + self.config().standby_delay();
    }

    fn write_out(&mut self) -> usize {
        if self.standby {
            if let Err(e) = self.sink.start() {
                log::warn!("{}: sink start failed: {e}", self.shared.id);
            }
            log::info!("{} leaving standby", self.shared.id);
            self.standby = false;
        }
        let frame_size = self.frame_size();
        let started = Instant::now();
        let frames = match self.sink.write(&self.out[self.out_offset..]) {
            Ok(frames) => frames,
            Err(e) => {
                log::warn!("{}: write failed: {e}", self.shared.id);
                self.out_offset = self.out.len();
                return 0;
            }
        };
        self.out_offset = (self.out_offset + frames * frame_size).min(self.out.len());
        self.frames_written += frames as u64;

        let now = Instant::now();
        let elapsed = now - started;
        if elapsed > self.period() * 2 {
            self.delayed_writes += 1;
            let throttle = Duration::from_millis(self.config().write_blocked_warn_ms);
            if self.last_warning.is_none_or(|at| now - at > throttle) {
                log::warn!(
                    "{}: write blocked for {} ms, {} delayed writes",
                    self.shared.id,
                    elapsed.as_millis(),
                    self.delayed_writes
                );
                self.last_warning = Some(now);
            }
        }
        self.standby_at = now + self.config().standby_delay();
        frames
    }

    fn enter_standby(&mut self, st: &mut ThreadState) {
        if let Err(e) = self.sink.standby() {
            log::warn!("{}: standby failed: {e}", self.shared.id);
        }
        self.standby = true;
        self.hw_paused = false;
        st.standby = true;
        log::info!("{} entering standby", self.shared.id);
    }

    /// Post-write bookkeeping under the lock: render latch and failed tracks.
    fn publish(&mut self, failed: Vec<TrackId>) {
        let shared = Arc::clone(&self.shared);
        let mut st = shared.state.lock();
        st.frames_written = self.frames_written;
        st.standby = self.standby;
        if self.frames_written > 0 {
            let rendered = self.sink.rendered_frames();
            st.latch = Some(RenderLatch {
                unpresented: self.frames_written.saturating_sub(rendered),
                time: Instant::now(),
            });
        }
        if !failed.is_empty() {
            for id in &failed {
                if let Some(track) = st.tracks.get(id) {
                    track.invalidate();
                }
            }
            self.remove_tracks(&mut st, &failed);
        }
    }

    fn process_config_events(&mut self) {
        while let Ok(request) = self.config_rx.pop() {
            let result = self.apply_config(request.event);
            match &result {
                Ok(()) => log::info!("{}: applied {:?}", self.shared.id, request.event),
                Err(e) => log::warn!("{}: {:?} rejected: {e}", self.shared.id, request.event),
            }
            // The caller may have stopped waiting.
            let _ = request.reply.send(result);
        }
    }

    fn apply_config(&mut self, event: ConfigEvent) -> AfResult<()> {
        let shared = Arc::clone(&self.shared);
        let mut st = shared.state.lock();
        match event {
            ConfigEvent::SetSampleRate(rate) => {
                if !st.tracks.is_empty() {
                    return Err(AfError::invalid_operation("tracks attached"));
                }
                if !(MIN_SAMPLE_RATE..=MAX_SAMPLE_RATE).contains(&rate) {
                    return Err(AfError::invalid_argument(format!("sample rate {rate}")));
                }
                self.sink.set_sample_rate(rate)?;
                st.sample_rate = rate;
            }
            ConfigEvent::SetFrameCount(frames) => {
                if frames == 0 {
                    return Err(AfError::invalid_argument("frame count must be > 0"));
                }
                if !st.tracks.is_empty() {
                    return Err(AfError::invalid_operation("tracks attached"));
                }
                self.mixer.resize(frames);
                st.frame_count = frames;
            }
            ConfigEvent::SetRouting(device) => {
                self.sink.set_routing(device)?;
                st.tracks.values().for_each(Track::invalidate);
            }
        }
        Ok(())
    }

    /// Threaded runner: cycle until asked to exit.
    pub(crate) fn run(mut self) {
        let priority = set_thread_priority(ThreadPriority::Mixer);
        log::info!("{} thread running ({priority:?})", self.shared.id);
        let shared = Arc::clone(&self.shared);
        while !shared.exit.load(Ordering::Acquire) {
            let outcome = self.cycle();
            if outcome.idle {
                let mut st = shared.state.lock();
                if shared.exit.load(Ordering::Acquire) {
                    break;
                }
                if st.active.is_empty() && self.config_rx.is_empty() && !st.flush_output {
                    match outcome.sleep {
                        Some(timeout) => {
                            shared.work.wait_for(&mut st, timeout);
                        }
                        None => shared.work.wait(&mut st),
                    }
                }
            } else if let Some(sleep) = outcome.sleep {
                std::thread::sleep(sleep);
            }
        }
        self.shutdown();
    }

    /// Leave the sink quiet: offload outputs drain unless paused or
    /// flushed, everything else goes to standby.
    pub fn shutdown(&mut self) {
        let flush_pending = self.shared.state.lock().flush_output;
        if self.shared.kind == OutputKind::Offload {
            if flush_pending || self.hw_paused {
                self.flush_sink();
            } else if !self.standby {
                self.status = MixerStatus::DrainAll;
                self.start_drain(DrainMode::All);
            }
        }
        if !self.standby {
            let shared = Arc::clone(&self.shared);
            let mut st = shared.state.lock();
            self.enter_standby(&mut st);
        }
        log::info!("{} thread exiting", self.shared.id);
    }
}
