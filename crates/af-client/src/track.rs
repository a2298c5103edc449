//! Client track handle: builder, state machine, data transfer

use crate::callback::{CallbackState, CallbackThread, TrackCallback, TrackEvent};
use crate::death::DeathWatcher;
use crate::restore::{Binding, open_binding};
use af_core::{
    AfError, AfResult, ChannelMask, ClientConfig, OutputId, PcmConfig, SESSION_ALLOCATE,
    SampleFormat, SessionId, StreamType, Timestamp, TrackId, WaitTimeout, check_unit_gain,
    expand_u8_to_i16,
};
use af_server::{AudioServer, TrackFlags};
use af_shm::{Buffer, CblkFlags, LoopConfig};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

// ═══════════════════════════════════════════════════════════════════════════════
// MODES AND STATES
// ═══════════════════════════════════════════════════════════════════════════════

/// Who moves audio into the ring
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransferMode {
    /// `Shared` with a static buffer, `Callback` with a callback, else `Sync`.
    #[default]
    Default,
    /// Blocking [`AudioTrack::write`].
    Sync,
    /// The callback thread asks for data with [`TrackEvent::MoreData`].
    Callback,
    /// Manual [`AudioTrack::obtain_buffer`] / [`AudioTrack::release_buffer`].
    Obtain,
    /// Whole static buffer handed over at creation.
    Shared,
}

/// Application-visible track state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Active,
    Stopped,
    Paused,
    /// Paused while an offloaded stop was still draining.
    PausedStopping,
    /// Offloaded stop waiting for the stream end.
    Stopping,
    Flushed,
}

// ═══════════════════════════════════════════════════════════════════════════════
// SHARED TRACK STATE
// ═══════════════════════════════════════════════════════════════════════════════

/// What the track was created with. Reused verbatim on recreation.
#[derive(Debug, Clone)]
pub(crate) struct TrackParams {
    pub(crate) output: OutputId,
    pub(crate) stream_type: StreamType,
    /// Format the application writes.
    pub(crate) config: PcmConfig,
    pub(crate) flags: TrackFlags,
    pub(crate) transfer: TransferMode,
    pub(crate) shared_buffer: Option<Arc<[u8]>>,
    pub(crate) notification_frames: u32,
}

impl TrackParams {
    /// Format stored in shared memory.
    pub(crate) fn shared_config(&self) -> PcmConfig {
        PcmConfig {
            format: self.config.format.shared_format(),
            ..self.config
        }
    }

    pub(crate) fn is_offload(&self) -> bool {
        self.flags.contains(TrackFlags::OFFLOAD)
    }
}

pub(crate) struct TrackInner {
    pub(crate) state: ClientState,
    pub(crate) binding: Binding,
    /// Bumped on every recreation.
    pub(crate) sequence: u32,
    /// Largest frame count ever negotiated.
    pub(crate) frame_count: usize,
    pub(crate) session: SessionId,
    pub(crate) volume: (f32, f32),
    pub(crate) send_level: f32,
    pub(crate) looping: LoopConfig,
    pub(crate) marker: Option<u64>,
    pub(crate) marker_reached: bool,
    pub(crate) update_period: u64,
    pub(crate) next_position: u64,
    /// An `Underrun` event was delivered and no frames were released since.
    pub(crate) in_underrun: bool,
}

pub(crate) struct TrackShared {
    pub(crate) server: AudioServer,
    pub(crate) params: TrackParams,
    pub(crate) config: ClientConfig,
    pub(crate) inner: Mutex<TrackInner>,
    pub(crate) callback: Mutex<Option<CallbackState>>,
}

impl TrackShared {
    /// Obtain ring space, recreating the server track when it died.
    pub(crate) fn obtain(&self, frames: usize, timeout: WaitTimeout) -> AfResult<TrackBuffer> {
        let mut tries = self.config.max_recreate_tries.max(1);
        loop {
            let (proxy, sequence, state) = {
                let inner = self.inner.lock();
                (Arc::clone(&inner.binding.proxy), inner.sequence, inner.state)
            };
            let timeout = match state {
                ClientState::Active => timeout,
                ClientState::Stopping => return Err(AfError::Interrupted),
                _ => {
                    // Nothing waits while stopped; the stop's interrupt is stale.
                    proxy.cblk().clear_flags(CblkFlags::INTERRUPT);
                    WaitTimeout::NonBlocking
                }
            };

            match proxy.obtain_buffer(frames, timeout) {
                Ok(buffer) => return Ok(TrackBuffer { buffer, sequence }),
                Err(AfError::DeadObject) => {
                    tries -= 1;
                    if tries == 0 {
                        log::warn!(
                            "track recreation gave up after {} tries",
                            self.config.max_recreate_tries
                        );
                        return Err(AfError::DeadObject);
                    }
                    let mut inner = self.inner.lock();
                    // Another thread may have recreated it meanwhile.
                    if inner.sequence == sequence {
                        self.restore_track(&mut inner)?;
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    pub(crate) fn release(&self, buffer: TrackBuffer, frames: usize) -> AfResult<()> {
        let TrackBuffer { buffer, sequence } = buffer;
        let frames = frames.min(buffer.frame_count());

        let mut inner = self.inner.lock();
        if inner.sequence != sequence {
            log::debug!("release of {frames} frames on a replaced track dropped");
            return Ok(());
        }
        match inner.binding.proxy.release_buffer(buffer, frames) {
            Ok(()) => {}
            // The next obtain recreates the track.
            Err(AfError::DeadObject) => return Ok(()),
            Err(e) => return Err(e),
        }
        if frames > 0 {
            inner.in_underrun = false;
        }

        let binding = &inner.binding;
        if inner.state == ClientState::Active
            && binding.proxy.cblk().flags().contains(CblkFlags::DISABLED)
        {
            log::warn!("{} was disabled by the server, restarting", binding.handle.id());
            match binding.handle.start() {
                Ok(()) | Err(AfError::DeadObject) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    fn app_frame_size(&self) -> usize {
        self.params.config.app_frame_size()
    }
}

/// Copy application frames into shared memory, expanding 8-bit PCM.
pub(crate) fn copy_frames(config: &PcmConfig, src: &[u8], dst: &mut [u8], scratch: &mut Vec<i16>) {
    if config.format == SampleFormat::Pcm8 {
        scratch.resize(src.len(), 0);
        expand_u8_to_i16(src, scratch);
        for (d, s) in dst.chunks_exact_mut(2).zip(scratch.iter()) {
            d.copy_from_slice(&s.to_ne_bytes());
        }
    } else {
        dst[..src.len()].copy_from_slice(src);
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// BUFFER
// ═══════════════════════════════════════════════════════════════════════════════

/// A grant of ring space in `Obtain` mode. Hand it back with
/// [`AudioTrack::release_buffer`].
#[derive(Debug)]
pub struct TrackBuffer {
    buffer: Buffer,
    sequence: u32,
}

impl TrackBuffer {
    pub fn frame_count(&self) -> usize {
        self.buffer.frame_count()
    }

    pub fn bytes(&self) -> &[u8] {
        self.buffer.bytes()
    }

    pub fn bytes_mut(&mut self) -> &mut [u8] {
        self.buffer.bytes_mut()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// BUILDER
// ═══════════════════════════════════════════════════════════════════════════════

pub struct AudioTrackBuilder {
    server: AudioServer,
    output: OutputId,
    stream_type: StreamType,
    config: PcmConfig,
    frame_count: usize,
    notification_frames: u32,
    flags: TrackFlags,
    session: SessionId,
    transfer: TransferMode,
    callback: Option<TrackCallback>,
    shared_buffer: Option<Arc<[u8]>>,
    client_config: ClientConfig,
    callback_thread: bool,
}

impl AudioTrackBuilder {
    pub fn new(server: &AudioServer, output: OutputId) -> Self {
        Self {
            server: server.clone(),
            output,
            stream_type: StreamType::default(),
            config: PcmConfig::default(),
            frame_count: 0,
            notification_frames: 0,
            flags: TrackFlags::empty(),
            session: SESSION_ALLOCATE,
            transfer: TransferMode::Default,
            callback: None,
            shared_buffer: None,
            client_config: ClientConfig::default(),
            callback_thread: true,
        }
    }

    pub fn stream_type(mut self, stream_type: StreamType) -> Self {
        self.stream_type = stream_type;
        self
    }

    pub fn config(mut self, config: PcmConfig) -> Self {
        self.config = config;
        self
    }

    pub fn sample_rate(mut self, rate: u32) -> Self {
        self.config.sample_rate = rate;
        self
    }

    pub fn format(mut self, format: SampleFormat) -> Self {
        self.config.format = format;
        self
    }

    pub fn channel_mask(mut self, mask: ChannelMask) -> Self {
        self.config.channel_mask = mask;
        self
    }

    /// Requested ring size; 0 takes the output minimum.
    pub fn frame_count(mut self, frames: usize) -> Self {
        self.frame_count = frames;
        self
    }

    pub fn notification_frames(mut self, frames: u32) -> Self {
        self.notification_frames = frames;
        self
    }

    pub fn flags(mut self, flags: TrackFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn session(mut self, session: SessionId) -> Self {
        self.session = session;
        self
    }

    pub fn transfer_mode(mut self, mode: TransferMode) -> Self {
        self.transfer = mode;
        self
    }

    pub fn callback<F>(mut self, callback: F) -> Self
    where
        F: FnMut(TrackEvent<'_>) -> usize + Send + 'static,
    {
        self.callback = Some(Box::new(callback));
        self
    }

    /// Static content; the track plays it without further writes.
    pub fn shared_buffer(mut self, data: Arc<[u8]>) -> Self {
        self.shared_buffer = Some(data);
        self
    }

    pub fn client_config(mut self, config: ClientConfig) -> Self {
        self.client_config = config;
        self
    }

    /// With `false` no callback thread is spawned and the owner drives
    /// [`AudioTrack::process_callback`] itself.
    pub fn callback_thread(mut self, spawn: bool) -> Self {
        self.callback_thread = spawn;
        self
    }

    fn resolve_transfer(&self) -> AfResult<TransferMode> {
        let mode = match self.transfer {
            TransferMode::Default if self.shared_buffer.is_some() => TransferMode::Shared,
            TransferMode::Default if self.callback.is_some() => TransferMode::Callback,
            TransferMode::Default => TransferMode::Sync,
            mode => mode,
        };
        match mode {
            TransferMode::Callback if self.callback.is_none() => {
                Err(AfError::invalid_argument("callback transfer without a callback"))
            }
            TransferMode::Shared if self.shared_buffer.is_none() => {
                Err(AfError::invalid_argument("shared transfer without a static buffer"))
            }
            TransferMode::Shared | TransferMode::Obtain
                if self.config.format == SampleFormat::Pcm8 =>
            {
                Err(AfError::invalid_argument(format!(
                    "8-bit PCM needs write or callback transfer, not {mode:?}"
                )))
            }
            _ if mode != TransferMode::Shared && self.shared_buffer.is_some() => Err(
                AfError::invalid_argument(format!("static buffer with {mode:?} transfer")),
            ),
            _ => Ok(mode),
        }
    }

    pub fn build(self) -> AfResult<AudioTrack> {
        self.config.validate()?;
        let transfer = self.resolve_transfer()?;

        let params = TrackParams {
            output: self.output,
            stream_type: self.stream_type,
            config: self.config,
            flags: self.flags,
            transfer,
            shared_buffer: self.shared_buffer,
            notification_frames: self.notification_frames,
        };
        let opened = open_binding(&self.server, &params, self.frame_count, self.session)?;
        log::info!(
            "{} bound for {:?} transfer: {} frames, session {}",
            opened.binding.handle.id(),
            transfer,
            opened.frame_count,
            opened.session
        );

        let has_callback = self.callback.is_some();
        let shared = Arc::new(TrackShared {
            server: self.server,
            params,
            config: self.client_config,
            inner: Mutex::new(TrackInner {
                state: ClientState::Stopped,
                binding: opened.binding,
                sequence: 0,
                frame_count: opened.frame_count,
                session: opened.session,
                volume: (1.0, 1.0),
                send_level: 0.0,
                looping: LoopConfig::NONE,
                marker: None,
                marker_reached: false,
                update_period: 0,
                next_position: 0,
                in_underrun: false,
            }),
            callback: Mutex::new(self.callback.map(CallbackState::new)),
        });

        let worker = if has_callback && self.callback_thread {
            Some(CallbackThread::spawn(Arc::clone(&shared))?)
        } else {
            None
        };
        let watcher = DeathWatcher::spawn(&shared)?;

        Ok(AudioTrack {
            worker,
            _watcher: watcher,
            shared,
        })
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// AUDIO TRACK
// ═══════════════════════════════════════════════════════════════════════════════

/// Application handle to a playback stream.
///
/// Every call is safe from any thread. A dead server-side track is replaced
/// transparently on the next data transfer or `start`; the application sees
/// a [`TrackEvent::NewTrackHandle`] and a position that never goes back.
pub struct AudioTrack {
    // Dropped first: the callback thread must exit before the track goes.
    worker: Option<CallbackThread>,
    _watcher: DeathWatcher,
    shared: Arc<TrackShared>,
}

impl AudioTrack {
    pub fn builder(server: &AudioServer, output: OutputId) -> AudioTrackBuilder {
        AudioTrackBuilder::new(server, output)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Accessors
    // ─────────────────────────────────────────────────────────────────────────

    pub fn state(&self) -> ClientState {
        self.shared.inner.lock().state
    }

    /// Number of times the server-side track was recreated.
    pub fn sequence(&self) -> u32 {
        self.shared.inner.lock().sequence
    }

    pub fn frame_count(&self) -> usize {
        self.shared.inner.lock().frame_count
    }

    pub fn config(&self) -> PcmConfig {
        self.shared.params.config
    }

    pub fn sample_rate(&self) -> u32 {
        self.shared.params.config.sample_rate
    }

    pub fn transfer_mode(&self) -> TransferMode {
        self.shared.params.transfer
    }

    pub fn session(&self) -> SessionId {
        self.shared.inner.lock().session
    }

    pub fn output(&self) -> OutputId {
        self.shared.params.output
    }

    /// Server-side id of the current track.
    pub fn track_id(&self) -> TrackId {
        self.shared.inner.lock().binding.handle.id()
    }

    pub fn latency_ms(&self) -> u32 {
        self.shared.inner.lock().binding.latency_ms
    }

    /// False when a FAST request was demoted.
    pub fn is_fast(&self) -> bool {
        self.shared.inner.lock().binding.fast
    }

    /// Frames the server wanted but could not get, on the current track.
    pub fn underrun_frames(&self) -> u64 {
        self.shared.inner.lock().binding.proxy.cblk().underrun_frames()
    }

    #[cfg(test)]
    pub(crate) fn shared(&self) -> &TrackShared {
        &self.shared
    }

    fn wake_worker(&self) {
        if let Some(worker) = &self.worker {
            worker.wake();
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Transport
    // ─────────────────────────────────────────────────────────────────────────

    pub fn start(&self) -> AfResult<()> {
        let result = self.start_locked();
        self.wake_worker();
        result
    }

    fn start_locked(&self) -> AfResult<()> {
        let mut inner = self.shared.inner.lock();
        let previous = inner.state;
        if previous == ClientState::Active {
            return Err(AfError::invalid_operation("track already active"));
        }

        if matches!(previous, ClientState::Stopped | ClientState::Flushed) {
            // Position reads from 0 again.
            let proxy = &inner.binding.proxy;
            proxy.set_epoch(proxy.epoch().wrapping_sub(proxy.position()));
            inner.marker_reached = false;
            inner.next_position = inner.update_period;
            inner.in_underrun = false;
        }
        inner.state = if previous == ClientState::PausedStopping {
            ClientState::Stopping
        } else {
            ClientState::Active
        };

        let proxy = Arc::clone(&inner.binding.proxy);
        proxy.cblk().clear_flags(CblkFlags::DISABLED | CblkFlags::INTERRUPT);
        let started = if proxy.is_dead() {
            Err(AfError::DeadObject)
        } else {
            inner.binding.handle.start()
        };

        match started {
            Ok(()) => Ok(()),
            // Recreation restarts the new track, or leaves us Stopped.
            Err(AfError::DeadObject) => self.shared.restore_track(&mut inner),
            Err(e) => {
                inner.state = previous;
                Err(e)
            }
        }
    }

    /// Stop playback. Offloaded tracks keep playing what was written
    /// until the stream end; others drop it.
    pub fn stop(&self) -> AfResult<()> {
        self.stop_inner(true)
    }

    fn stop_inner(&self, interrupt: bool) -> AfResult<()> {
        let mut inner = self.shared.inner.lock();
        if !matches!(inner.state, ClientState::Active | ClientState::Paused) {
            return Ok(());
        }
        inner.state = if self.shared.params.is_offload() {
            ClientState::Stopping
        } else {
            ClientState::Stopped
        };
        inner.marker_reached = false;

        let binding = &inner.binding;
        if interrupt {
            binding.proxy.interrupt();
        }
        if let Err(e) = binding.handle.stop() {
            log::debug!("server stop of {}: {e}", binding.handle.id());
        }
        Ok(())
    }

    pub fn pause(&self) -> AfResult<()> {
        let mut inner = self.shared.inner.lock();
        inner.state = match inner.state {
            ClientState::Active => ClientState::Paused,
            ClientState::Stopping => ClientState::PausedStopping,
            _ => return Ok(()),
        };
        match inner.binding.handle.pause() {
            Ok(()) | Err(AfError::DeadObject) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Discard buffered frames. Not allowed while playing.
    pub fn flush(&self) -> AfResult<()> {
        let mut inner = self.shared.inner.lock();
        match inner.state {
            ClientState::Active => {
                return Err(AfError::invalid_operation("flush of an active track"));
            }
            ClientState::Flushed => return Ok(()),
            _ => {}
        }
        if self.shared.params.transfer == TransferMode::Shared {
            return Ok(());
        }

        inner.marker = None;
        inner.marker_reached = false;
        inner.update_period = 0;
        inner.next_position = 0;
        inner.state = ClientState::Flushed;

        let binding = &inner.binding;
        binding.proxy.flush();
        match binding.handle.flush() {
            Ok(()) | Err(AfError::DeadObject) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Play out what was written, then stop.
    ///
    /// Offloaded and fast tracks wait for the server's stream-end report,
    /// others until the ring is empty. Both wait at most
    /// `stream_end_timeout_ms`.
    pub fn drain(&self) -> AfResult<()> {
        let (proxy, deferred) = {
            let inner = self.shared.inner.lock();
            if inner.state != ClientState::Active {
                return Err(AfError::invalid_operation(format!(
                    "drain while {:?}",
                    inner.state
                )));
            }
            (
                Arc::clone(&inner.binding.proxy),
                inner.binding.fast || self.shared.params.is_offload(),
            )
        };
        let timeout = WaitTimeout::Bounded(self.shared.config.stream_end_timeout());

        if deferred {
            self.stop_inner(false)?;
            proxy.wait_stream_end_done(timeout)?;
            let mut inner = self.shared.inner.lock();
            if inner.state == ClientState::Stopping {
                inner.state = ClientState::Stopped;
            }
            Ok(())
        } else {
            let drained = proxy.wait_drained(timeout);
            self.stop()?;
            drained
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Parameters
    // ─────────────────────────────────────────────────────────────────────────

    pub fn set_volume(&self, left: f32, right: f32) -> AfResult<()> {
        check_unit_gain("left volume", left)?;
        check_unit_gain("right volume", right)?;
        let mut inner = self.shared.inner.lock();
        inner.volume = (left, right);
        inner.binding.proxy.set_volume_lr(left, right);
        Ok(())
    }

    pub fn volume(&self) -> (f32, f32) {
        self.shared.inner.lock().volume
    }

    pub fn set_send_level(&self, level: f32) -> AfResult<()> {
        check_unit_gain("send level", level)?;
        let mut inner = self.shared.inner.lock();
        inner.send_level = level;
        inner.binding.proxy.set_send_level(level);
        Ok(())
    }

    fn require_static(&self, what: &str) -> AfResult<()> {
        if self.shared.params.transfer != TransferMode::Shared {
            return Err(AfError::invalid_operation(format!("{what} needs a static buffer")));
        }
        Ok(())
    }

    /// Loop `[start, end)` `count` times (`-1` forever, `0` clears).
    pub fn set_loop(&self, start: usize, end: usize, count: i32) -> AfResult<()> {
        self.require_static("loop")?;
        let mut inner = self.shared.inner.lock();
        if inner.state == ClientState::Active {
            return Err(AfError::invalid_operation("loop change while active"));
        }
        let looping = if count == 0 {
            LoopConfig::NONE
        } else {
            LoopConfig::new(start, end, count)
        };
        looping.validate(inner.frame_count)?;
        let proxy = &inner.binding.proxy;
        proxy.set_static(proxy.buffer_position(), looping)?;
        inner.looping = looping;
        Ok(())
    }

    pub fn loop_config(&self) -> LoopConfig {
        self.shared.inner.lock().looping
    }

    /// Move the static playback head.
    pub fn set_position(&self, frame: usize) -> AfResult<()> {
        self.require_static("set_position")?;
        let inner = self.shared.inner.lock();
        if inner.state == ClientState::Active {
            return Err(AfError::invalid_operation("set_position while active"));
        }
        if frame > inner.frame_count {
            return Err(AfError::invalid_argument(format!(
                "position {frame} past {} frames",
                inner.frame_count
            )));
        }
        inner.binding.proxy.set_static(frame, inner.looping)
    }

    /// Static playback head inside the buffer.
    pub fn buffer_position(&self) -> usize {
        self.shared.inner.lock().binding.proxy.buffer_position()
    }

    /// Frames played since the last start from Stopped or Flushed.
    pub fn position(&self) -> u64 {
        let inner = self.shared.inner.lock();
        if matches!(inner.state, ClientState::Stopped | ClientState::Flushed)
            && !self.shared.params.is_offload()
        {
            return 0;
        }
        inner.binding.proxy.position()
    }

    /// Presented frame and when it was presented.
    pub fn timestamp(&self) -> AfResult<Timestamp> {
        let inner = self.shared.inner.lock();
        if !matches!(inner.state, ClientState::Active | ClientState::Paused) {
            return Err(AfError::invalid_operation(format!(
                "timestamp while {:?}",
                inner.state
            )));
        }
        let ts = inner.binding.handle.timestamp()?;
        let proxy = &inner.binding.proxy;
        let position = proxy.epoch().wrapping_add(ts.position);
        // Presented before the last re-anchor.
        if position > proxy.position() {
            return Err(AfError::WouldBlock);
        }
        Ok(Timestamp {
            position,
            time: ts.time,
        })
    }

    /// Deliver [`TrackEvent::Marker`] once playback reaches `frame`.
    pub fn set_marker_position(&self, frame: Option<u64>) {
        {
            let mut inner = self.shared.inner.lock();
            inner.marker = frame;
            inner.marker_reached = false;
        }
        self.wake_worker();
    }

    pub fn marker_position(&self) -> Option<u64> {
        self.shared.inner.lock().marker
    }

    /// Deliver [`TrackEvent::NewPos`] every `frames` frames; 0 turns it off.
    pub fn set_position_update_period(&self, frames: u64) {
        {
            let mut inner = self.shared.inner.lock();
            let position = inner.binding.proxy.position();
            inner.update_period = frames;
            inner.next_position = position + frames;
        }
        self.wake_worker();
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Data
    // ─────────────────────────────────────────────────────────────────────────

    /// Copy `data` into the ring. Blocks for space while active when
    /// `blocking`; otherwise writes what fits.
    ///
    /// Returns the bytes written. A failure after some bytes went through
    /// is reported as the partial count.
    pub fn write(&self, data: &[u8], blocking: bool) -> AfResult<usize> {
        if self.shared.params.transfer != TransferMode::Sync {
            return Err(AfError::invalid_operation(format!(
                "write with {:?} transfer",
                self.shared.params.transfer
            )));
        }
        let frame_size = self.shared.app_frame_size();
        let timeout = if blocking {
            WaitTimeout::Forever
        } else {
            WaitTimeout::NonBlocking
        };
        let mut scratch = Vec::new();
        let mut written = 0;

        while data.len() - written >= frame_size {
            let frames = (data.len() - written) / frame_size;
            let mut buffer = match self.shared.obtain(frames, timeout) {
                Ok(b) => b,
                Err(e) if written > 0 => {
                    log::trace!("write stopped after {written} bytes: {e}");
                    break;
                }
                Err(e) => return Err(e),
            };
            let n = buffer.frame_count();
            let src = &data[written..written + n * frame_size];
            copy_frames(&self.shared.params.config, src, buffer.bytes_mut(), &mut scratch);
            self.shared.release(buffer, n)?;
            written += n * frame_size;
        }
        Ok(written)
    }

    /// Borrow ring space directly (`Obtain` mode).
    pub fn obtain_buffer(&self, frames: usize, timeout: WaitTimeout) -> AfResult<TrackBuffer> {
        if self.shared.params.transfer != TransferMode::Obtain {
            return Err(AfError::invalid_operation(format!(
                "obtain with {:?} transfer",
                self.shared.params.transfer
            )));
        }
        self.shared.obtain(frames, timeout)
    }

    /// Publish the first `frames` frames of `buffer`.
    pub fn release_buffer(&self, buffer: TrackBuffer, frames: usize) -> AfResult<()> {
        self.shared.release(buffer, frames)
    }

    /// Run one pass of event delivery and data requests. Returns how long
    /// to wait before the next pass.
    ///
    /// The callback thread calls this in a loop; tracks built with
    /// `callback_thread(false)` call it themselves.
    pub fn process_callback(&self) -> Duration {
        self.shared.process_callback()
    }
}

impl std::fmt::Debug for AudioTrack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.shared.inner.lock();
        f.debug_struct("AudioTrack")
            .field("track", &inner.binding.handle.id())
            .field("state", &inner.state)
            .field("sequence", &inner.sequence)
            .field("transfer", &self.shared.params.transfer)
            .finish()
    }
}
