//! Callback transfer mode: event delivery and the callback thread

use crate::track::{ClientState, TransferMode, TrackShared, copy_frames};
use af_core::{AfError, AfResult, SampleFormat, WaitTimeout, WakeupPlanner};
use af_server::{ThreadPriority, set_thread_priority};
use af_shm::CblkFlags;
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

/// Something the application is told about.
#[derive(Debug)]
pub enum TrackEvent<'a> {
    /// Fill the slice (application format) and return the bytes written.
    MoreData(&'a mut [u8]),
    /// The server ran out of data. Sent once per episode.
    Underrun,
    /// A static loop wrapped; `final_pass` on the last requested pass.
    LoopEnd { final_pass: bool },
    /// Playback reached the marker frame.
    Marker(u64),
    /// Periodic position report.
    NewPos(u64),
    /// Static playback reached the end of the buffer.
    BufferEnd,
    /// The server-side track was recreated.
    NewTrackHandle,
    /// An offloaded stop finished presenting.
    StreamEnd,
}

/// Boxed application callback. The return value is the number of bytes
/// written for [`TrackEvent::MoreData`] and ignored otherwise.
pub type TrackCallback = Box<dyn FnMut(TrackEvent<'_>) -> usize + Send>;

pub(crate) struct CallbackState {
    callback: TrackCallback,
    observed_sequence: u32,
    /// Application-format staging for 8-bit tracks.
    staging: Vec<u8>,
    expanded: Vec<i16>,
}

impl CallbackState {
    pub(crate) fn new(callback: TrackCallback) -> Self {
        Self {
            callback,
            observed_sequence: 0,
            staging: Vec::new(),
            expanded: Vec::new(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// EVENT PROCESSING
// ═══════════════════════════════════════════════════════════════════════════════

impl TrackShared {
    /// One pass: collect events under the lock, deliver them without it,
    /// then ask for data while the ring has room.
    pub(crate) fn process_callback(&self) -> Duration {
        let ceiling = self.config.callback_poll_ceiling();
        let mut guard = self.callback.lock();
        let Some(cb) = guard.as_mut() else {
            return ceiling;
        };
        let mut planner = WakeupPlanner::new(self.params.config.sample_rate, ceiling)
            .with_slack(self.config.wakeup_slack());
        let mut events: Vec<TrackEvent<'static>> = Vec::new();

        let (state, frame_count) = {
            let mut inner = self.inner.lock();
            if inner.sequence != cb.observed_sequence {
                cb.observed_sequence = inner.sequence;
                events.push(TrackEvent::NewTrackHandle);
            }

            let proxy = Arc::clone(&inner.binding.proxy);
            let cblk = proxy.cblk();
            let flags = cblk.clear_flags(CblkFlags::CLIENT_EVENTS);
            if cblk.flags().contains(CblkFlags::UNDERRUN)
                && !inner.in_underrun
                && inner.state == ClientState::Active
            {
                inner.in_underrun = true;
                events.push(TrackEvent::Underrun);
            }
            if flags.contains(CblkFlags::LOOP_CYCLE) {
                events.push(TrackEvent::LoopEnd { final_pass: false });
            }
            if flags.contains(CblkFlags::LOOP_FINAL) {
                events.push(TrackEvent::LoopEnd { final_pass: true });
            }
            if flags.contains(CblkFlags::BUFFER_END) {
                events.push(TrackEvent::BufferEnd);
            }
            // Left set for a concurrent drain; the next server start clears it.
            if inner.state == ClientState::Stopping
                && cblk.flags().contains(CblkFlags::STREAM_END_DONE)
            {
                inner.state = ClientState::Stopped;
                events.push(TrackEvent::StreamEnd);
            }

            let position = proxy.position();
            if let Some(marker) = inner.marker {
                if !inner.marker_reached {
                    if position >= marker {
                        inner.marker_reached = true;
                        events.push(TrackEvent::Marker(marker));
                    } else {
                        planner.event_in_frames(marker - position);
                    }
                }
            }
            if inner.update_period > 0 {
                while position >= inner.next_position {
                    events.push(TrackEvent::NewPos(inner.next_position));
                    inner.next_position += inner.update_period;
                }
                planner.event_in_frames(inner.next_position - position);
            }
            if inner.looping.is_enabled() {
                planner.event_in_frames(inner.looping.period() as u64);
            }
            (inner.state, inner.frame_count)
        };

        for event in events {
            (cb.callback)(event);
        }

        if state == ClientState::Active && self.params.transfer == TransferMode::Callback {
            let wait = self.request_data(cb, frame_count, &mut planner);
            if let Some(wait) = wait {
                planner.event_in(wait);
            }
        }
        planner.next()
    }

    /// Hand ring space to the callback until it is full or the callback
    /// runs dry. Returns an extra wait when it should be retried soon.
    fn request_data(
        &self,
        cb: &mut CallbackState,
        frame_count: usize,
        planner: &mut WakeupPlanner,
    ) -> Option<Duration> {
        let wait_period = self.config.wait_period();
        let frame_size = self.params.config.app_frame_size();
        let notification = match self.params.notification_frames {
            0 => frame_count / 2,
            n => n as usize,
        }
        .max(1);

        loop {
            let mut buffer = match self.obtain(frame_count, WaitTimeout::NonBlocking) {
                Ok(b) => b,
                Err(AfError::WouldBlock) => {
                    planner.event_in_frames(notification as u64);
                    return None;
                }
                Err(e) => {
                    log::debug!("callback obtain failed: {e}");
                    return Some(wait_period);
                }
            };
            let frames = buffer.frame_count();
            let bytes = frames * frame_size;

            let written = if self.params.config.format == SampleFormat::Pcm8 {
                let CallbackState {
                    callback,
                    staging,
                    expanded,
                    ..
                } = &mut *cb;
                staging.resize(bytes, 0x80);
                let n = callback(TrackEvent::MoreData(&mut staging[..])).min(bytes);
                let n = n - n % frame_size;
                copy_frames(
                    &self.params.config,
                    &staging[..n],
                    buffer.bytes_mut(),
                    expanded,
                );
                n
            } else {
                let n = (cb.callback)(TrackEvent::MoreData(buffer.bytes_mut())).min(bytes);
                n - n % frame_size
            };

            let done = written / frame_size;
            if let Err(e) = self.release(buffer, done) {
                log::debug!("callback release failed: {e}");
                return Some(wait_period);
            }
            if done == 0 {
                return Some(wait_period);
            }
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// CALLBACK THREAD
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Default)]
struct Control {
    wake: bool,
    exit: bool,
}

#[derive(Default)]
struct CallbackControl {
    state: Mutex<Control>,
    cond: Condvar,
}

/// Thread that runs [`TrackShared::process_callback`] at the planned
/// wakeups. Joined on drop.
pub(crate) struct CallbackThread {
    control: Arc<CallbackControl>,
    handle: Option<JoinHandle<()>>,
}

impl CallbackThread {
    pub(crate) fn spawn(track: Arc<TrackShared>) -> AfResult<Self> {
        let control = Arc::new(CallbackControl::default());
        let thread_control = Arc::clone(&control);
        let handle = std::thread::Builder::new()
            .name("af-callback".into())
            .spawn(move || run(track, thread_control))
            .map_err(|e| AfError::insufficient(format!("callback thread: {e}")))?;
        Ok(Self {
            control,
            handle: Some(handle),
        })
    }

    /// Run a pass now instead of at the planned wakeup.
    pub(crate) fn wake(&self) {
        let mut c = self.control.state.lock();
        c.wake = true;
        self.control.cond.notify_one();
    }
}

impl Drop for CallbackThread {
    fn drop(&mut self) {
        {
            let mut c = self.control.state.lock();
            c.exit = true;
            self.control.cond.notify_one();
        }
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                log::error!("callback thread panicked");
            }
        }
    }
}

fn run(track: Arc<TrackShared>, control: Arc<CallbackControl>) {
    set_thread_priority(ThreadPriority::Callback);
    loop {
        let sleep = track.process_callback();
        let mut c = control.state.lock();
        if !c.exit && !c.wake {
            control.cond.wait_for(&mut c, sleep);
        }
        if c.exit {
            break;
        }
        c.wake = false;
    }
    log::debug!("callback thread exiting");
}
