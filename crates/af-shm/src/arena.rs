//! Region ownership keyed by track id

use crate::{SharedRegion, Side};
use af_core::TrackId;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// Owner of every live region.
///
/// A region enters the arena when its track is created and leaves it only
/// after both the client and the server have relinquished their side.
#[derive(Default)]
pub struct RegionArena {
    regions: Mutex<HashMap<TrackId, Arc<SharedRegion>>>,
}

impl RegionArena {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, id: TrackId, region: Arc<SharedRegion>) {
        if self.regions.lock().insert(id, region).is_some() {
            log::warn!("{id} region replaced while still registered");
        }
    }

    pub fn get(&self, id: TrackId) -> Option<Arc<SharedRegion>> {
        self.regions.lock().get(&id).cloned()
    }

    /// Detach `side` from the region of `id`. Returns `true` if that freed
    /// the entry.
    pub fn relinquish(&self, id: TrackId, side: Side) -> bool {
        let mut regions = self.regions.lock();
        let Some(region) = regions.get(&id) else {
            return false;
        };
        region.relinquish(side);
        if region.is_attached(Side::Client) || region.is_attached(Side::Server) {
            return false;
        }
        regions.remove(&id);
        log::debug!("{id} region released by both sides");
        true
    }

    pub fn len(&self) -> usize {
        self.regions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, id: TrackId) -> bool {
        self.regions.lock().contains_key(&id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{CblkFlags, Direction, RegionParams};

    fn region() -> Arc<SharedRegion> {
        SharedRegion::create(RegionParams {
            frame_count: 32,
            frame_size: 4,
            sample_rate: 48_000,
            direction: Direction::Playback,
            static_data: None,
        })
        .unwrap()
    }

    #[test]
    fn test_freed_only_after_both_sides() {
        let arena = RegionArena::new();
        let id = TrackId(7);
        arena.insert(id, region());

        assert!(!arena.relinquish(id, Side::Server));
        assert!(arena.contains(id));
        assert!(
            arena
                .get(id)
                .unwrap()
                .cblk()
                .flags()
                .contains(CblkFlags::INVALID)
        );
        // Repeating a side does not count twice.
        assert!(!arena.relinquish(id, Side::Server));
        assert!(arena.relinquish(id, Side::Client));
        assert!(arena.is_empty());
        assert!(!arena.relinquish(id, Side::Client));
    }

    #[test]
    fn test_client_first() {
        let arena = RegionArena::new();
        arena.insert(TrackId(1), region());
        arena.insert(TrackId(2), region());
        assert!(!arena.relinquish(TrackId(1), Side::Client));
        assert!(arena.relinquish(TrackId(1), Side::Server));
        assert_eq!(arena.len(), 1);
    }
}
