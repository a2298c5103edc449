//! Binding to a server-side track and its replacement after death

use crate::track::{ClientState, TrackInner, TrackParams, TrackShared};
use af_core::{AfError, AfResult, SessionId};
use af_server::{AudioServer, CreateTrackRequest, TrackHandle};
use af_shm::{ClientProxy, LoopConfig};
use std::sync::Arc;

/// The server-side track a client currently talks to.
pub(crate) struct Binding {
    pub(crate) handle: TrackHandle,
    pub(crate) proxy: Arc<ClientProxy>,
    pub(crate) latency_ms: u32,
    pub(crate) fast: bool,
    /// Server generation the track was created in.
    pub(crate) generation: u64,
}

pub(crate) struct Opened {
    pub(crate) binding: Binding,
    pub(crate) frame_count: usize,
    pub(crate) session: SessionId,
}

/// Ask the server for a track and attach to its region.
pub(crate) fn open_binding(
    server: &AudioServer,
    params: &TrackParams,
    frame_count: usize,
    session: SessionId,
) -> AfResult<Opened> {
    let generation = server.generation();
    let resp = server.create_track(CreateTrackRequest {
        output: params.output,
        config: params.shared_config(),
        frame_count,
        flags: params.flags,
        session,
        stream_type: params.stream_type,
        shared_buffer: params.shared_buffer.clone(),
        notification_frames: params.notification_frames,
    })?;
    let proxy = Arc::new(ClientProxy::attach(Arc::clone(&resp.region))?);
    Ok(Opened {
        binding: Binding {
            handle: resp.handle,
            proxy,
            latency_ms: resp.latency_ms,
            fast: resp.fast,
            generation,
        },
        frame_count: resp.frame_count,
        session: resp.session,
    })
}

impl TrackShared {
    /// Replace a dead server-side track with a new one that continues where
    /// the old one left off.
    ///
    /// Frames still sitting in the old ring are counted as played so the
    /// position never goes back. Loop points are not carried over. On
    /// failure the track ends up Stopped and `DeadObject` is returned.
    pub(crate) fn restore_track(&self, inner: &mut TrackInner) -> AfResult<()> {
        inner.sequence = inner.sequence.wrapping_add(1);
        let old = &inner.binding.proxy;
        let position = old.position().wrapping_add(old.frames_filled() as u64);
        let buffer_position = old.buffer_position();
        log::warn!(
            "{} lost, recreating (sequence {}, position {position})",
            inner.binding.handle.id(),
            inner.sequence
        );

        inner.looping = LoopConfig::NONE;
        let opened = match open_binding(&self.server, &self.params, inner.frame_count, inner.session) {
            Ok(opened) => opened,
            Err(e) => {
                log::error!("track recreation failed: {e}");
                inner.state = ClientState::Stopped;
                return Err(AfError::DeadObject);
            }
        };

        let proxy = &opened.binding.proxy;
        proxy.set_epoch(position);
        proxy.set_volume_lr(inner.volume.0, inner.volume.1);
        proxy.set_send_level(inner.send_level);
        if self.params.shared_buffer.is_some() {
            proxy.set_static(buffer_position, LoopConfig::NONE)?;
        }

        inner.frame_count = inner.frame_count.max(opened.frame_count);
        inner.session = opened.session;
        inner.in_underrun = false;
        inner.binding = opened.binding;
        // Whatever was left to drain went down with the old track.
        if matches!(inner.state, ClientState::Stopping | ClientState::PausedStopping) {
            inner.state = ClientState::Stopped;
        }

        if inner.state == ClientState::Active {
            if let Err(e) = inner.binding.handle.start() {
                log::error!("restart of recreated {} failed: {e}", inner.binding.handle.id());
                inner.state = ClientState::Stopped;
                return Err(AfError::DeadObject);
            }
        }
        log::info!(
            "{} replaces the lost track (sequence {})",
            inner.binding.handle.id(),
            inner.sequence
        );
        Ok(())
    }

    /// The server died. Invalidate the current region unless it already
    /// belongs to a newer server.
    pub(crate) fn peer_lost(&self, generation: u64) {
        let inner = self.inner.lock();
        if inner.binding.generation > generation {
            return;
        }
        log::warn!("server generation {generation} lost, {} invalidated", inner.binding.handle.id());
        inner.binding.proxy.cblk().invalidate();
    }
}
