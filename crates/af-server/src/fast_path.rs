//! Fast path: low-overhead second mixing pass for fast tracks
//!
//! Fast tracks skip readiness checks and volume ramps. The pass keeps its
//! own underrun counters per track; the normal preparation step polls them
//! to drive the fast tracks' state machine.

use crate::mixer::AudioMixer;
use af_core::{PcmConfig, TrackId};
use af_shm::ServerProxy;
use std::collections::HashMap;
use std::sync::Arc;

/// Cumulative outcome counters of a fast track's reads
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FastUnderruns {
    /// Cycles fully served.
    pub full: u32,
    /// Cycles served only in part.
    pub partial: u32,
    /// Cycles with nothing to read.
    pub empty: u32,
}

impl FastUnderruns {
    /// Counts since `observed`.
    pub fn since(&self, observed: &FastUnderruns) -> FastUnderruns {
        FastUnderruns {
            full: self.full.wrapping_sub(observed.full),
            partial: self.partial.wrapping_sub(observed.partial),
            empty: self.empty.wrapping_sub(observed.empty),
        }
    }

    pub fn underruns(&self) -> u32 {
        self.partial + self.empty
    }
}

struct FastSlot {
    proxy: Arc<ServerProxy>,
    config: PcmConfig,
    gain: (f32, f32),
    counters: FastUnderruns,
    observed: FastUnderruns,
}

/// Fast tracks currently enabled on a mixer thread
pub struct FastPath {
    slots: HashMap<TrackId, FastSlot>,
    capacity: usize,
}

impl FastPath {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: HashMap::new(),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn contains(&self, id: TrackId) -> bool {
        self.slots.contains_key(&id)
    }

    /// Enable a track or update its gain.
    pub fn enable(&mut self, id: TrackId, proxy: &Arc<ServerProxy>, config: PcmConfig, gain: (f32, f32)) {
        self.slots
            .entry(id)
            .and_modify(|slot| slot.gain = gain)
            .or_insert_with(|| FastSlot {
                proxy: Arc::clone(proxy),
                config,
                gain,
                counters: FastUnderruns::default(),
                observed: FastUnderruns::default(),
            });
    }

    pub fn disable(&mut self, id: TrackId) {
        self.slots.remove(&id);
    }

    pub fn clear(&mut self) {
        self.slots.clear();
    }

    /// Counters accumulated since the previous poll for this track.
    pub fn poll(&mut self, id: TrackId) -> FastUnderruns {
        match self.slots.get_mut(&id) {
            Some(slot) => {
                let recent = slot.counters.since(&slot.observed);
                slot.observed = slot.counters;
                recent
            }
            None => FastUnderruns::default(),
        }
    }

    /// Mix every enabled fast track into `mixer` for a cycle of `frames`.
    pub fn mix(&mut self, mixer: &mut AudioMixer, frames: usize) {
        for (&id, slot) in self.slots.iter_mut() {
            mixer.set_volume(id, slot.gain.0, slot.gain.1, false);
            let mut done = 0;
            while done < frames {
                let buffer = match slot.proxy.obtain_buffer(frames - done) {
                    Ok(buffer) => buffer,
                    Err(e) => {
                        log::warn!("fast {id}: obtain failed: {e}");
                        break;
                    }
                };
                if buffer.is_empty() {
                    break;
                }
                let n = mixer.accumulate(id, buffer.bytes(), &slot.config, done);
                if let Err(e) = slot.proxy.release_buffer(buffer, n) {
                    log::warn!("fast {id}: release failed: {e}");
                    break;
                }
                done += n;
                if n == 0 {
                    break;
                }
            }
            match done {
                0 => slot.counters.empty = slot.counters.empty.wrapping_add(1),
                d if d < frames => slot.counters.partial = slot.counters.partial.wrapping_add(1),
                _ => slot.counters.full = slot.counters.full.wrapping_add(1),
            }
        }
    }
}
