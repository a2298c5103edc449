//! Audio Server - context object owning every output
//!
//! Provides:
//! - Output lifecycle (open, duplicate, close), threaded or manually cycled
//! - Track creation RPC with format checks and frame count negotiation
//! - Master and per-stream volume fan-out
//! - Simulated server death with `PeerLost` delivery to subscribers

use crate::output_track::{DuplicatingSink, OutputTrack};
use crate::sink::{NullSink, OutputSink};
use crate::thread::{ConfigEvent, ConfigTicket, CycleOutcome, OutputKind, PlaybackThread, ThreadShared};
use crate::track::{Track, TrackKind, TrackSpec};
use af_core::{
    AfError, AfResult, ChannelMask, OutputId, PcmConfig, SESSION_ALLOCATE, SampleFormat, ServerConfig,
    SessionId, StreamType, Timestamp, TrackId,
};
use af_shm::{Direction, RegionArena, RegionParams, ServerProxy, SharedRegion, Side};
use crossbeam_channel::{Receiver, Sender, TrySendError};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::thread::JoinHandle;

// ═══════════════════════════════════════════════════════════════════════════════
// RPC TYPES
// ═══════════════════════════════════════════════════════════════════════════════

bitflags::bitflags! {
    /// Track creation flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct TrackFlags: u32 {
        /// Low-latency path; demoted to a normal track if unavailable.
        const FAST = 1 << 0;
        /// Rendered by an offload output.
        const OFFLOAD = 1 << 1;
        /// Starts at a media time set with `set_media_start`.
        const TIMED = 1 << 2;
    }
}

/// How an output's cycles are driven
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    /// A dedicated OS thread loops over cycles.
    Threaded,
    /// The caller drives each cycle with [`AudioServer::cycle`].
    Manual,
}

/// Notifications delivered to subscribed clients
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerEvent {
    /// The server went away; every handle of `generation` is dead.
    PeerLost { generation: u64 },
}

#[derive(Debug, Clone)]
pub struct CreateTrackRequest {
    pub output: OutputId,
    /// Format as stored in shared memory (8-bit PCM is expanded by the client).
    pub config: PcmConfig,
    /// Requested ring size; raised to the output minimum. 0 picks the minimum.
    pub frame_count: usize,
    pub flags: TrackFlags,
    pub session: SessionId,
    pub stream_type: StreamType,
    /// Whole-buffer content for static playback.
    pub shared_buffer: Option<Arc<[u8]>>,
    pub notification_frames: u32,
}

#[derive(Debug)]
pub struct CreateTrackResponse {
    pub handle: TrackHandle,
    pub region: Arc<SharedRegion>,
    /// Granted ring size.
    pub frame_count: usize,
    pub session: SessionId,
    pub latency_ms: u32,
    pub sample_rate: u32,
    /// False when a FAST request was demoted.
    pub fast: bool,
}

// ═══════════════════════════════════════════════════════════════════════════════
// SERVER
// ═══════════════════════════════════════════════════════════════════════════════

enum Runner {
    Threaded(JoinHandle<()>),
    Manual(Mutex<PlaybackThread>),
}

struct OutputEntry {
    shared: Arc<ThreadShared>,
    runner: Runner,
}

#[derive(Debug, Clone, Copy)]
struct Volumes {
    master: f32,
    master_mute: bool,
    streams: [(f32, bool); StreamType::COUNT],
}

struct ServerInner {
    config: ServerConfig,
    arena: Arc<RegionArena>,
    outputs: RwLock<HashMap<OutputId, OutputEntry>>,
    volumes: Mutex<Volumes>,
    subscribers: Mutex<Vec<Sender<ServerEvent>>>,
    next_output: AtomicU32,
    next_track: AtomicU32,
    next_session: AtomicU32,
    alive: AtomicBool,
    generation: AtomicU64,
}

impl ServerInner {
    fn check_alive(&self) -> AfResult<()> {
        if self.alive.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(AfError::DeadObject)
        }
    }

    fn output(&self, id: OutputId) -> AfResult<Arc<ThreadShared>> {
        self.outputs
            .read()
            .get(&id)
            .map(|e| Arc::clone(&e.shared))
            .ok_or_else(|| AfError::invalid_argument(format!("{id} unavailable")))
    }

    fn stop_output(entry: OutputEntry) {
        entry.shared.request_exit();
        match entry.runner {
            Runner::Threaded(handle) => {
                if handle.join().is_err() {
                    log::error!("{} thread panicked", entry.shared.id());
                }
            }
            Runner::Manual(thread) => thread.into_inner().shutdown(),
        }
        entry.shared.detach_all();
    }
}

impl Drop for ServerInner {
    fn drop(&mut self) {
        for (_, entry) in self.outputs.get_mut().drain() {
            Self::stop_output(entry);
        }
    }
}

/// The server context. Cheap to clone; all clones share the same outputs.
#[derive(Clone)]
pub struct AudioServer {
    inner: Arc<ServerInner>,
}

impl AudioServer {
    pub fn new(config: ServerConfig) -> AfResult<Self> {
        config.validate()?;
        log::info!("audio server starting ({} Hz, {} frame periods)", config.sample_rate, config.mix_frame_count);
        Ok(Self {
            inner: Arc::new(ServerInner {
                config,
                arena: Arc::new(RegionArena::new()),
                outputs: RwLock::new(HashMap::new()),
                volumes: Mutex::new(Volumes {
                    master: 1.0,
                    master_mute: false,
                    streams: [(1.0, false); StreamType::COUNT],
                }),
                subscribers: Mutex::new(Vec::new()),
                next_output: AtomicU32::new(1),
                next_track: AtomicU32::new(1),
                next_session: AtomicU32::new(1),
                alive: AtomicBool::new(true),
                generation: AtomicU64::new(0),
            }),
        })
    }

    pub fn config(&self) -> &ServerConfig {
        &self.inner.config
    }

    pub fn arena(&self) -> &Arc<RegionArena> {
        &self.inner.arena
    }

    pub fn is_alive(&self) -> bool {
        self.inner.alive.load(Ordering::Acquire)
    }

    pub fn generation(&self) -> u64 {
        self.inner.generation.load(Ordering::Acquire)
    }

    pub fn outputs(&self) -> Vec<OutputId> {
        let mut ids: Vec<_> = self.inner.outputs.read().keys().copied().collect();
        ids.sort();
        ids
    }

    /// Control-plane view of an output.
    pub fn output(&self, id: OutputId) -> AfResult<Arc<ThreadShared>> {
        self.inner.output(id)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // OUTPUTS
    // ═══════════════════════════════════════════════════════════════════════

    pub fn open_output(&self, kind: OutputKind, sink: Box<dyn OutputSink>, mode: OutputMode) -> AfResult<OutputId> {
        if kind == OutputKind::Duplicating {
            return Err(AfError::invalid_argument("use open_duplicate_output"));
        }
        self.install(kind, sink, mode)
    }

    /// Open an output mirroring its mix to every mixer output in
    /// `destinations`.
    pub fn open_duplicate_output(&self, destinations: &[OutputId], mode: OutputMode) -> AfResult<OutputId> {
        let first = destinations
            .first()
            .ok_or_else(|| AfError::invalid_argument("duplicating output needs a destination"))?;
        let first = self.inner.output(*first)?;
        let config = first.sink_config();
        let period = first.frame_count();

        let mut outputs = Vec::with_capacity(destinations.len());
        for &dest in destinations {
            let thread = self.inner.output(dest)?;
            if thread.kind() != OutputKind::Mixer {
                return Err(AfError::invalid_argument(format!("{dest} is not a mixer output")));
            }
            if thread.sink_config() != config {
                return Err(AfError::invalid_argument(format!("{dest} format differs")));
            }
            let id = TrackId(self.inner.next_track.fetch_add(1, Ordering::Relaxed));
            outputs.push(OutputTrack::attach(thread, id, Arc::clone(&self.inner.arena), period)?);
        }
        let sink = DuplicatingSink::new(config, period, outputs);
        self.install(OutputKind::Duplicating, Box::new(sink), mode)
    }

    fn install(&self, kind: OutputKind, sink: Box<dyn OutputSink>, mode: OutputMode) -> AfResult<OutputId> {
        let id = OutputId(self.inner.next_output.fetch_add(1, Ordering::Relaxed));
        let (shared, thread) = PlaybackThread::new(
            id,
            kind,
            sink,
            self.inner.config.clone(),
            Arc::clone(&self.inner.arena),
        )?;

        let volumes = *self.inner.volumes.lock();
        shared.set_master_volume(volumes.master);
        shared.set_master_mute(volumes.master_mute);
        for stream in StreamType::ALL {
            let (volume, mute) = volumes.streams[stream.index()];
            shared.set_stream_volume(stream, volume);
            shared.set_stream_mute(stream, mute);
        }

        let runner = match mode {
            OutputMode::Threaded => {
                let handle = std::thread::Builder::new()
                    .name(format!("af-{kind:?}-{}", id.0).to_lowercase())
                    .spawn(move || thread.run())
                    .map_err(|e| AfError::insufficient(format!("spawn {id} thread: {e}")))?;
                Runner::Threaded(handle)
            }
            OutputMode::Manual => Runner::Manual(Mutex::new(thread)),
        };
        let config = shared.sink_config();
        let frames = shared.frame_count();
        self.inner.outputs.write().insert(id, OutputEntry { shared, runner });
        log::info!(
            "{id} opened: {kind:?}, {} Hz, {:?}, {frames} frames/cycle",
            config.sample_rate,
            config.format
        );
        Ok(id)
    }

    /// Open a mixer output on a real-time paced null device at the
    /// configured rate and period.
    pub fn open_default_output(&self, mode: OutputMode) -> AfResult<OutputId> {
        let config = PcmConfig::new(
            self.inner.config.sample_rate,
            SampleFormat::Pcm16,
            ChannelMask::STEREO,
        );
        let sink = NullSink::new(config, self.inner.config.mix_frame_count).paced();
        self.install(OutputKind::Mixer, Box::new(sink), mode)
    }

    pub fn close_output(&self, id: OutputId) -> AfResult<()> {
        let entry = self
            .inner
            .outputs
            .write()
            .remove(&id)
            .ok_or_else(|| AfError::invalid_argument(format!("{id} unavailable")))?;
        ServerInner::stop_output(entry);
        log::info!("{id} closed");
        Ok(())
    }

    /// Run one cycle of a manual output.
    pub fn cycle(&self, id: OutputId) -> AfResult<CycleOutcome> {
        let outputs = self.inner.outputs.read();
        let entry = outputs
            .get(&id)
            .ok_or_else(|| AfError::invalid_argument(format!("{id} unavailable")))?;
        match &entry.runner {
            Runner::Manual(thread) => Ok(thread.lock().cycle()),
            Runner::Threaded(_) => Err(AfError::invalid_operation(format!("{id} runs its own thread"))),
        }
    }

    /// Queue a config event and wait for the thread to apply it.
    pub fn set_parameters(&self, id: OutputId, event: ConfigEvent) -> AfResult<()> {
        self.set_parameters_async(id, event)?
            .wait(self.inner.config.set_parameters_timeout())
    }

    /// Queue a config event without waiting. Manual outputs apply it on the
    /// next [`cycle`](Self::cycle).
    pub fn set_parameters_async(&self, id: OutputId, event: ConfigEvent) -> AfResult<ConfigTicket> {
        self.inner.output(id)?.post_config(event)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // TRACK CREATION
    // ═══════════════════════════════════════════════════════════════════════

    pub fn create_track(&self, req: CreateTrackRequest) -> AfResult<CreateTrackResponse> {
        self.inner.check_alive()?;
        req.config.validate()?;
        if req.config.format == SampleFormat::Pcm8 {
            return Err(AfError::invalid_argument("8-bit PCM must be expanded before sharing"));
        }
        let thread = self.inner.output(req.output)?;
        let out = thread.sink_config();
        let period = thread.frame_count();
        let latency_ms = output_latency_ms(&thread);

        let kind = self.negotiate_kind(&thread, &req)?;
        let min_frames = if kind.is_fast() { period } else { 2 * period };
        let frame_size = req.config.shared_frame_size();

        let frame_count = match &req.shared_buffer {
            Some(data) => {
                if data.is_empty() || data.len() % frame_size != 0 {
                    return Err(AfError::invalid_argument(format!(
                        "static buffer of {} bytes is not whole frames",
                        data.len()
                    )));
                }
                data.len() / frame_size
            }
            None => req.frame_count.max(min_frames),
        };

        let region = SharedRegion::create(RegionParams {
            frame_count,
            frame_size,
            sample_rate: req.config.sample_rate,
            direction: Direction::Playback,
            static_data: req.shared_buffer.as_deref(),
        })?;
        if req.notification_frames > 0 {
            region.cblk().set_notification_frames(req.notification_frames);
        }

        let session = if req.session == SESSION_ALLOCATE {
            self.inner.next_session.fetch_add(1, Ordering::Relaxed)
        } else {
            req.session
        };
        let id = TrackId(self.inner.next_track.fetch_add(1, Ordering::Relaxed));
        let proxy = Arc::new(ServerProxy::attach(Arc::clone(&region))?);
        self.inner.arena.insert(id, Arc::clone(&region));

        let spec = TrackSpec {
            id,
            kind,
            config: req.config,
            stream_type: req.stream_type,
            session,
        };
        if let Err(e) = thread.add_track(Track::new(spec, proxy)) {
            self.inner.arena.relinquish(id, Side::Server);
            self.inner.arena.relinquish(id, Side::Client);
            return Err(e);
        }
        log::info!(
            "{id} created on {}: {kind:?}, {} frames, {} Hz {:?}",
            req.output,
            frame_count,
            req.config.sample_rate,
            req.config.channel_mask
        );

        Ok(CreateTrackResponse {
            handle: TrackHandle {
                server: Arc::clone(&self.inner),
                thread,
                id,
                generation: self.generation(),
            },
            region,
            frame_count,
            session,
            latency_ms,
            sample_rate: out.sample_rate,
            fast: kind.is_fast(),
        })
    }

    fn negotiate_kind(&self, thread: &ThreadShared, req: &CreateTrackRequest) -> AfResult<TrackKind> {
        let out = thread.sink_config();
        let flags = req.flags;
        let output = thread.id();
        match thread.kind() {
            OutputKind::Offload => {
                if !flags.contains(TrackFlags::OFFLOAD) {
                    return Err(AfError::invalid_argument(format!("{output} only takes offloaded tracks")));
                }
                return Ok(TrackKind::Offload);
            }
            _ if flags.contains(TrackFlags::OFFLOAD) => {
                return Err(AfError::invalid_argument(format!("{output} cannot offload")));
            }
            OutputKind::Direct => {
                if req.config != out {
                    return Err(AfError::invalid_argument(format!(
                        "{output} needs {} Hz {:?} {:?}",
                        out.sample_rate, out.format, out.channel_mask
                    )));
                }
                if flags.contains(TrackFlags::TIMED) {
                    return Err(AfError::invalid_argument(format!("{output} cannot play timed tracks")));
                }
                return Ok(TrackKind::Normal { fast: false });
            }
            OutputKind::Mixer | OutputKind::Duplicating => {}
        }

        if req.config.sample_rate != out.sample_rate {
            return Err(AfError::invalid_argument(format!(
                "track rate {} differs from {output} rate {}",
                req.config.sample_rate, out.sample_rate
            )));
        }
        if req.config.channel_count() > 2 {
            return Err(AfError::invalid_argument("mixer tracks are mono or stereo"));
        }
        if flags.contains(TrackFlags::TIMED) {
            return Ok(TrackKind::Timed { media_start: None });
        }
        if flags.contains(TrackFlags::FAST) {
            let available = thread.kind() == OutputKind::Mixer
                && req.shared_buffer.is_none()
                && thread.fast_track_count() < self.inner.config.max_fast_tracks;
            if available {
                return Ok(TrackKind::Normal { fast: true });
            }
            log::info!("fast track on {output} denied, using the normal mixer");
        }
        Ok(TrackKind::Normal { fast: false })
    }

    pub fn latency_ms(&self, id: OutputId) -> AfResult<u32> {
        Ok(output_latency_ms(&*self.inner.output(id)?))
    }

    // ═══════════════════════════════════════════════════════════════════════
    // VOLUME
    // ═══════════════════════════════════════════════════════════════════════

    fn check_gain(value: f32) -> AfResult<()> {
        if (0.0..=1.0).contains(&value) {
            Ok(())
        } else {
            Err(AfError::invalid_argument(format!("volume {value} outside [0, 1]")))
        }
    }

    fn each_output(&self, f: impl Fn(&ThreadShared)) {
        self.inner.outputs.read().values().for_each(|e| f(&e.shared));
    }

    pub fn set_master_volume(&self, volume: f32) -> AfResult<()> {
        Self::check_gain(volume)?;
        self.inner.volumes.lock().master = volume;
        self.each_output(|t| t.set_master_volume(volume));
        Ok(())
    }

    pub fn set_master_mute(&self, mute: bool) {
        self.inner.volumes.lock().master_mute = mute;
        self.each_output(|t| t.set_master_mute(mute));
    }

    pub fn set_stream_volume(&self, stream: StreamType, volume: f32) -> AfResult<()> {
        Self::check_gain(volume)?;
        self.inner.volumes.lock().streams[stream.index()].0 = volume;
        self.each_output(|t| t.set_stream_volume(stream, volume));
        Ok(())
    }

    pub fn set_stream_mute(&self, stream: StreamType, mute: bool) {
        self.inner.volumes.lock().streams[stream.index()].1 = mute;
        self.each_output(|t| t.set_stream_mute(stream, mute));
    }

    /// Invalidate every track of `stream` on every output, forcing their
    /// clients to recreate them.
    pub fn invalidate_stream(&self, stream: StreamType) {
        log::info!("invalidating {stream:?} tracks");
        self.each_output(|t| t.invalidate_stream(stream));
    }

    // ═══════════════════════════════════════════════════════════════════════
    // DEATH AND RESTART
    // ═══════════════════════════════════════════════════════════════════════

    /// Receive server events on a channel holding at most `capacity` of them.
    pub fn subscribe(&self, capacity: usize) -> Receiver<ServerEvent> {
        let (tx, rx) = crossbeam_channel::bounded(capacity.max(1));
        self.inner.subscribers.lock().push(tx);
        rx
    }

    /// Simulate the server process dying: every track is dropped, every
    /// handle goes dead and subscribers get `PeerLost`.
    pub fn kill(&self) {
        if !self.inner.alive.swap(false, Ordering::AcqRel) {
            return;
        }
        let generation = self.inner.generation.fetch_add(1, Ordering::AcqRel);
        log::warn!("audio server died (generation {generation})");
        self.each_output(ThreadShared::detach_all);

        let event = ServerEvent::PeerLost { generation };
        self.inner.subscribers.lock().retain(|tx| match tx.try_send(event) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                log::debug!("subscriber backlog full, PeerLost already pending");
                true
            }
            Err(TrySendError::Disconnected(_)) => false,
        });
    }

    /// Bring a killed server back. Old handles stay dead.
    pub fn restart(&self) {
        if !self.inner.alive.swap(true, Ordering::AcqRel) {
            log::info!("audio server restarted (generation {})", self.generation());
        }
    }
}

impl std::fmt::Debug for AudioServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioServer")
            .field("outputs", &self.outputs())
            .field("alive", &self.is_alive())
            .field("generation", &self.generation())
            .finish()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// TRACK HANDLE
// ═══════════════════════════════════════════════════════════════════════════════

/// Client's reference to a server-side track.
///
/// Every call fails with `DeadObject` once the server died or restarted.
/// Dropping the handle relinquishes the client side of the region.
pub struct TrackHandle {
    server: Arc<ServerInner>,
    thread: Arc<ThreadShared>,
    id: TrackId,
    generation: u64,
}

impl TrackHandle {
    pub fn id(&self) -> TrackId {
        self.id
    }

    pub fn output(&self) -> OutputId {
        self.thread.id()
    }

    pub fn is_alive(&self) -> bool {
        self.check().is_ok()
    }

    fn check(&self) -> AfResult<()> {
        self.server.check_alive()?;
        if self.server.generation.load(Ordering::Acquire) != self.generation {
            return Err(AfError::DeadObject);
        }
        Ok(())
    }

    pub fn start(&self) -> AfResult<()> {
        self.check()?;
        self.thread.start_track(self.id)
    }

    pub fn stop(&self) -> AfResult<()> {
        self.check()?;
        self.thread.stop_track(self.id)
    }

    pub fn pause(&self) -> AfResult<()> {
        self.check()?;
        self.thread.pause_track(self.id)
    }

    pub fn flush(&self) -> AfResult<()> {
        self.check()?;
        self.thread.flush_track(self.id)
    }

    /// Output frame at which a timed track starts playing.
    pub fn set_media_start(&self, frame: u64) -> AfResult<()> {
        self.check()?;
        self.thread.set_media_start(self.id, frame)
    }

    /// Presented position relative to this track's ring.
    pub fn timestamp(&self) -> AfResult<Timestamp> {
        self.check()?;
        self.thread.track_timestamp(self.id)
    }
}

impl Drop for TrackHandle {
    fn drop(&mut self) {
        self.thread.terminate_track(self.id);
        self.server.arena.relinquish(self.id, Side::Client);
    }
}

impl std::fmt::Debug for TrackHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrackHandle")
            .field("id", &self.id)
            .field("output", &self.thread.id())
            .field("generation", &self.generation)
            .finish()
    }
}

/// Device latency plus one mixer period.
fn output_latency_ms(thread: &ThreadShared) -> u32 {
    let period_ms = thread.frame_count() as u64 * 1000 / thread.sample_rate().max(1) as u64;
    thread.latency_ms() + period_ms as u32
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::{MemorySink, SinkProbe};

    fn stereo() -> PcmConfig {
        PcmConfig::new(48_000, SampleFormat::Pcm16, ChannelMask::STEREO)
    }

    fn server_with_mixer() -> (AudioServer, OutputId, SinkProbe) {
        let server = AudioServer::new(ServerConfig::default()).unwrap();
        let (sink, probe) = MemorySink::new(stereo(), 240);
        let out = server.open_output(OutputKind::Mixer, Box::new(sink), OutputMode::Manual).unwrap();
        (server, out, probe)
    }

    fn request(output: OutputId) -> CreateTrackRequest {
        CreateTrackRequest {
            output,
            config: stereo(),
            frame_count: 0,
            flags: TrackFlags::empty(),
            session: SESSION_ALLOCATE,
            stream_type: StreamType::Music,
            shared_buffer: None,
            notification_frames: 0,
        }
    }

    #[test]
    fn test_frame_count_raised_to_minimum() {
        let (server, out, _probe) = server_with_mixer();
        let resp = server.create_track(CreateTrackRequest { frame_count: 100, ..request(out) }).unwrap();
        assert_eq!(resp.frame_count, 480);
        assert_ne!(resp.session, SESSION_ALLOCATE);

        let fast = server
            .create_track(CreateTrackRequest { flags: TrackFlags::FAST, ..request(out) })
            .unwrap();
        assert!(fast.fast);
        assert_eq!(fast.frame_count, 240);
    }

    #[test]
    fn test_create_reports_output_latency() {
        let (server, out, _probe) = server_with_mixer();
        let resp = server.create_track(request(out)).unwrap();
        assert_eq!(resp.latency_ms, server.latency_ms(out).unwrap());
        assert!(resp.latency_ms >= 5);
    }

    #[test]
    fn test_create_rejects_bad_requests() {
        let (server, out, _probe) = server_with_mixer();
        let wrong_rate = PcmConfig::new(44_100, SampleFormat::Pcm16, ChannelMask::STEREO);
        assert!(matches!(
            server.create_track(CreateTrackRequest { config: wrong_rate, ..request(out) }),
            Err(AfError::InvalidArgument(_))
        ));
        assert!(matches!(
            server.create_track(CreateTrackRequest { flags: TrackFlags::OFFLOAD, ..request(out) }),
            Err(AfError::InvalidArgument(_))
        ));
        assert!(matches!(
            server.create_track(request(OutputId(99))),
            Err(AfError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_track_slots_are_bounded() {
        let config = ServerConfig {
            max_tracks_per_thread: 2,
            ..ServerConfig::default()
        };
        let server = AudioServer::new(config).unwrap();
        let (sink, _probe) = MemorySink::new(stereo(), 240);
        let out = server.open_output(OutputKind::Mixer, Box::new(sink), OutputMode::Manual).unwrap();
        let _a = server.create_track(request(out)).unwrap();
        let _b = server.create_track(request(out)).unwrap();
        assert!(matches!(
            server.create_track(request(out)),
            Err(AfError::InsufficientResources(_))
        ));
        assert_eq!(server.arena().len(), 2);
    }

    #[test]
    fn test_dropping_handle_releases_region() {
        let (server, out, _probe) = server_with_mixer();
        let resp = server.create_track(request(out)).unwrap();
        assert_eq!(server.arena().len(), 1);
        drop(resp.handle);
        assert_eq!(server.output(out).unwrap().track_count(), 0);
        assert!(server.arena().is_empty());
    }

    #[test]
    fn test_kill_kills_handles() {
        let (server, out, _probe) = server_with_mixer();
        let events = server.subscribe(1);
        let resp = server.create_track(request(out)).unwrap();

        server.kill();
        assert_eq!(events.try_recv(), Ok(ServerEvent::PeerLost { generation: 0 }));
        assert!(matches!(resp.handle.start(), Err(AfError::DeadObject)));
        assert!(matches!(server.create_track(request(out)), Err(AfError::DeadObject)));

        server.restart();
        assert!(!resp.handle.is_alive());
        assert!(server.create_track(request(out)).is_ok());
    }
}
