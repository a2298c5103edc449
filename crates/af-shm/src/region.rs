//! Shared region: control block plus the mapped frame memory

use crate::{ControlBlock, StaticShared};
use af_core::{AfError, AfResult};
use memmap2::MmapMut;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Which way frames flow through the ring
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Client produces, server consumes.
    Playback,
    /// Server produces, client consumes.
    Capture,
}

/// One of the two parties attached to a region
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Client,
    Server,
}

impl Side {
    #[inline]
    fn index(self) -> usize {
        match self {
            Self::Client => 0,
            Self::Server => 1,
        }
    }

    #[inline]
    pub fn peer(self) -> Self {
        match self {
            Self::Client => Self::Server,
            Self::Server => Self::Client,
        }
    }
}

/// Parameters for allocating a region
#[derive(Debug, Clone)]
pub struct RegionParams<'a> {
    pub frame_count: usize,
    /// Bytes per frame in shared memory.
    pub frame_size: usize,
    pub sample_rate: u32,
    pub direction: Direction,
    /// Whole-buffer content for static (shared-buffer) playback.
    pub static_data: Option<&'a [u8]>,
}

/// Control block and frame memory of one track.
///
/// The frame memory is an anonymous mapping. Access goes through
/// [`Buffer`](crate::Buffer) grants handed out by the proxies; the cursor
/// protocol keeps producer and consumer ranges disjoint.
pub struct SharedRegion {
    cblk: ControlBlock,
    direction: Direction,
    data: *mut u8,
    len: usize,
    _map: MmapMut,
    attached: [AtomicBool; 2],
    proxy_taken: [AtomicBool; 2],
    static_shared: Option<StaticShared>,
}

// SAFETY: `data` points into `_map`, which lives as long as the region.
// Concurrent access is limited to disjoint frame ranges by the cursor
// protocol, and each side may hold at most one proxy (see `claim_proxy`).
unsafe impl Send for SharedRegion {}
unsafe impl Sync for SharedRegion {}

impl SharedRegion {
    pub fn create(params: RegionParams<'_>) -> AfResult<Arc<Self>> {
        if params.frame_count == 0 {
            return Err(AfError::invalid_argument("frame count must be > 0"));
        }
        if params.frame_size == 0 {
            return Err(AfError::invalid_argument("frame size must be > 0"));
        }
        let len = params
            .frame_count
            .checked_mul(params.frame_size)
            .ok_or_else(|| AfError::invalid_argument("region size overflows"))?;

        let mut map = MmapMut::map_anon(len)
            .map_err(|e| AfError::insufficient(format!("map {len} bytes: {e}")))?;

        let static_shared = match params.static_data {
            Some(bytes) => {
                if params.direction != Direction::Playback {
                    return Err(AfError::invalid_argument("static buffer on a capture track"));
                }
                if bytes.len() > len {
                    return Err(AfError::invalid_argument(format!(
                        "static buffer of {} bytes exceeds {len}",
                        bytes.len()
                    )));
                }
                map[..bytes.len()].copy_from_slice(bytes);
                Some(StaticShared::new())
            }
            None => None,
        };

        let data = map.as_mut_ptr();
        Ok(Arc::new(Self {
            cblk: ControlBlock::new(params.frame_count, params.frame_size, params.sample_rate),
            direction: params.direction,
            data,
            len,
            _map: map,
            attached: [AtomicBool::new(true), AtomicBool::new(true)],
            proxy_taken: [AtomicBool::new(false), AtomicBool::new(false)],
            static_shared,
        }))
    }

    #[inline]
    pub fn cblk(&self) -> &ControlBlock {
        &self.cblk
    }

    #[inline]
    pub fn direction(&self) -> Direction {
        self.direction
    }

    #[inline]
    pub fn frame_count(&self) -> usize {
        self.cblk.frame_count()
    }

    #[inline]
    pub fn frame_size(&self) -> usize {
        self.cblk.frame_size()
    }

    #[inline]
    pub fn is_static(&self) -> bool {
        self.static_shared.is_some()
    }

    #[inline]
    pub(crate) fn static_shared(&self) -> Option<&StaticShared> {
        self.static_shared.as_ref()
    }

    #[inline]
    pub fn size_bytes(&self) -> usize {
        self.len
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Two-party lifetime
    // ─────────────────────────────────────────────────────────────────────────

    pub fn is_attached(&self, side: Side) -> bool {
        self.attached[side.index()].load(Ordering::Acquire)
    }

    /// Detach one side. Returns `true` when this call left both sides
    /// detached. A server detaching also invalidates the track.
    pub fn relinquish(&self, side: Side) -> bool {
        let was = self.attached[side.index()].swap(false, Ordering::AcqRel);
        if was && side == Side::Server {
            self.cblk.invalidate();
        } else if was {
            self.cblk.wake();
        }
        was && !self.is_attached(side.peer())
    }

    /// Each side may build exactly one proxy over a region.
    pub(crate) fn claim_proxy(&self, side: Side) -> AfResult<()> {
        if self.proxy_taken[side.index()].swap(true, Ordering::AcqRel) {
            return Err(AfError::invalid_operation(format!(
                "{side:?} proxy already attached"
            )));
        }
        Ok(())
    }

    /// # Safety
    /// No one may write frames `[offset, offset + frames)` while the slice
    /// lives.
    #[inline]
    pub(crate) unsafe fn frames(&self, offset: usize, frames: usize) -> &[u8] {
        let size = self.frame_size();
        debug_assert!((offset + frames) * size <= self.len);
        // SAFETY: bounds checked above; the caller guarantees no writer.
        unsafe { std::slice::from_raw_parts(self.data.add(offset * size), frames * size) }
    }

    /// # Safety
    /// The caller must own frames `[offset, offset + frames)` under the
    /// cursor protocol for as long as the slice lives.
    #[inline]
    pub(crate) unsafe fn frames_mut(&self, offset: usize, frames: usize) -> &mut [u8] {
        let size = self.frame_size();
        debug_assert!((offset + frames) * size <= self.len);
        // SAFETY: bounds checked above; exclusivity is the caller's contract.
        unsafe { std::slice::from_raw_parts_mut(self.data.add(offset * size), frames * size) }
    }
}

impl std::fmt::Debug for SharedRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedRegion")
            .field("frame_count", &self.frame_count())
            .field("frame_size", &self.frame_size())
            .field("direction", &self.direction)
            .field("static", &self.is_static())
            .field("flags", &self.cblk.flags())
            .finish()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// BUFFER GRANT
// ═══════════════════════════════════════════════════════════════════════════════

/// Contiguous run of frames granted by `obtain_buffer`.
///
/// Holds the region alive. Hand it back to the proxy's `release_buffer`,
/// which consumes it; dropping a grant without releasing it keeps the
/// proxy's grant outstanding.
pub struct Buffer {
    region: Arc<SharedRegion>,
    side: Side,
    offset: usize,
    /// Frames of the grant as handed out; `frame_count` may shrink.
    granted: usize,
    frame_count: usize,
    non_contig: usize,
}

impl Buffer {
    pub(crate) fn new(
        region: Arc<SharedRegion>,
        side: Side,
        offset: usize,
        frame_count: usize,
        non_contig: usize,
    ) -> Self {
        Self {
            region,
            side,
            offset,
            granted: frame_count,
            frame_count,
            non_contig,
        }
    }

    pub(crate) fn empty(region: Arc<SharedRegion>, side: Side) -> Self {
        Self::new(region, side, 0, 0, 0)
    }

    /// Granted by `side`'s proxy over `region`.
    pub(crate) fn belongs_to(&self, region: &Arc<SharedRegion>, side: Side) -> bool {
        self.side == side && Arc::ptr_eq(&self.region, region)
    }

    #[inline]
    pub fn frame_count(&self) -> usize {
        self.frame_count
    }

    #[inline]
    pub(crate) fn granted(&self) -> usize {
        self.granted
    }

    /// Further frames that were requested and are available, but only after
    /// the wrap point. A follow-up request of this size returns exactly it.
    #[inline]
    pub fn non_contig(&self) -> usize {
        self.non_contig
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.frame_count == 0
    }

    #[inline]
    pub fn frame_size(&self) -> usize {
        self.region.frame_size()
    }

    #[inline]
    pub fn byte_len(&self) -> usize {
        self.frame_count * self.frame_size()
    }

    /// Ring offset (in frames) of the first granted frame.
    #[inline]
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Shrink the grant so a later release covers only `frames`.
    pub fn truncate(&mut self, frames: usize) {
        self.frame_count = self.frame_count.min(frames);
    }

    pub fn region(&self) -> &Arc<SharedRegion> {
        &self.region
    }

    pub fn bytes(&self) -> &[u8] {
        // SAFETY: the proxy granted these frames exclusively to this buffer,
        // and releasing the grant consumes it.
        unsafe { self.region.frames(self.offset, self.frame_count) }
    }

    pub fn bytes_mut(&mut self) -> &mut [u8] {
        // SAFETY: as above; `&mut self` prevents aliasing through this grant.
        unsafe { self.region.frames_mut(self.offset, self.frame_count) }
    }
}

impl std::fmt::Debug for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Buffer")
            .field("side", &self.side)
            .field("offset", &self.offset)
            .field("frame_count", &self.frame_count)
            .field("non_contig", &self.non_contig)
            .finish()
    }
}
