//! Server death notification

use crate::track::TrackShared;
use af_core::{AfError, AfResult};
use af_server::ServerEvent;
use crossbeam_channel::{Receiver, Sender};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;

/// Listens for `PeerLost` on behalf of one track and invalidates its
/// region, so the next obtain or start recreates it.
///
/// Dropping the watcher closes its cancel channel and joins the thread.
pub(crate) struct DeathWatcher {
    cancel: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl DeathWatcher {
    pub(crate) fn spawn(track: &Arc<TrackShared>) -> AfResult<Self> {
        let events = track.server.subscribe(track.config.event_queue_depth);
        let (cancel_tx, cancel_rx) = crossbeam_channel::bounded(0);
        let weak = Arc::downgrade(track);
        let handle = std::thread::Builder::new()
            .name("af-death-watch".into())
            .spawn(move || watch(weak, events, cancel_rx))
            .map_err(|e| AfError::insufficient(format!("death watcher: {e}")))?;
        Ok(Self {
            cancel: Some(cancel_tx),
            handle: Some(handle),
        })
    }
}

impl Drop for DeathWatcher {
    fn drop(&mut self) {
        drop(self.cancel.take());
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                log::error!("death watcher panicked");
            }
        }
    }
}

fn watch(track: Weak<TrackShared>, events: Receiver<ServerEvent>, cancel: Receiver<()>) {
    loop {
        crossbeam_channel::select! {
            recv(events) -> event => match event {
                Ok(ServerEvent::PeerLost { generation }) => {
                    let Some(track) = track.upgrade() else {
                        break;
                    };
                    track.peer_lost(generation);
                }
                // Server context dropped.
                Err(_) => break,
            },
            recv(cancel) -> _ => break,
        }
    }
}
