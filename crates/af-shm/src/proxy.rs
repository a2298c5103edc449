//! Client and server proxies over a shared region

use crate::{Buffer, CblkFlags, ControlBlock, Direction, LoopConfig, SharedRegion, Side};
use crate::{StaticPlayback, StaticRequest};
use af_core::{AfError, AfResult, Deadline, WaitTimeout};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::time::Instant;

/// Which cursor a proxy advances
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Advances `rear` after writing frames.
    Producer,
    /// Advances `front` after reading frames.
    Consumer,
}

impl Role {
    fn of(direction: Direction, side: Side) -> Self {
        match (direction, side) {
            (Direction::Playback, Side::Client) | (Direction::Capture, Side::Server) => {
                Self::Producer
            }
            _ => Self::Consumer,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// SHARED CURSOR MATH
// ═══════════════════════════════════════════════════════════════════════════════

/// Frames this role may touch now, and the cursor it starts from.
fn ring_available(cblk: &ControlBlock, role: Role) -> AfResult<(usize, u64)> {
    let front = cblk.front.load(Ordering::Acquire);
    let rear = cblk.rear.load(Ordering::Acquire);
    let filled = rear.wrapping_sub(front);
    let capacity = cblk.frame_count() as u64;
    if filled > capacity {
        log::warn!(
            "ring cursors corrupt: front={front} rear={rear} frame_count={capacity}, shutting proxy down"
        );
        return Err(AfError::DeadObject);
    }
    Ok(match role {
        Role::Producer => ((capacity - filled) as usize, rear),
        Role::Consumer => (filled as usize, front),
    })
}

/// Split a request at the wrap point: (ring offset, contiguous frames,
/// requested frames left over past the wrap).
#[inline]
fn carve(frame_count: usize, cursor: u64, available: usize, requested: usize) -> (usize, usize, usize) {
    let offset = (cursor % frame_count as u64) as usize;
    let wanted = requested.min(available);
    let contiguous = wanted.min(frame_count - offset);
    (offset, contiguous, wanted - contiguous)
}

#[inline]
fn advance(cblk: &ControlBlock, role: Role, frames: usize) {
    let cursor = match role {
        Role::Producer => &cblk.rear,
        Role::Consumer => &cblk.front,
    };
    // Only this side stores this cursor.
    let at = cursor.load(Ordering::Relaxed);
    cursor.store(at.wrapping_add(frames as u64), Ordering::Release);
}


/// At most one outstanding grant per proxy.
struct GrantState {
    in_flight: AtomicBool,
    granted: AtomicUsize,
}

impl GrantState {
    fn new() -> Self {
        Self {
            in_flight: AtomicBool::new(false),
            granted: AtomicUsize::new(0),
        }
    }

    fn begin(&self) -> AfResult<()> {
        self.in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(|_| AfError::invalid_operation("previous buffer not released"))
    }

    fn commit(&self, frames: usize) {
        if frames == 0 {
            self.in_flight.store(false, Ordering::Release);
        } else {
            self.granted.store(frames, Ordering::Release);
        }
    }

    fn abort(&self) {
        self.in_flight.store(false, Ordering::Release);
    }

    /// Close the grant `buffer` came from. Only buffers of `side`'s proxy
    /// over `region` are taken; an empty grant never opened one.
    fn take_back(
        &self,
        buffer: Buffer,
        region: &Arc<SharedRegion>,
        side: Side,
        frames: usize,
    ) -> AfResult<()> {
        if !buffer.belongs_to(region, side) {
            return Err(AfError::invalid_argument("buffer was not granted by this proxy"));
        }
        let opened = buffer.granted() > 0;
        let limit = buffer.frame_count();
        drop(buffer);
        if opened {
            // The buffer is gone either way.
            self.granted.store(0, Ordering::Release);
            self.in_flight.store(false, Ordering::Release);
        }
        if frames > limit {
            return Err(AfError::invalid_argument(format!(
                "release of {frames} frames exceeds grant of {limit}"
            )));
        }
        Ok(())
    }

    fn outstanding(&self) -> usize {
        if self.in_flight.load(Ordering::Acquire) {
            self.granted.load(Ordering::Acquire)
        } else {
            0
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// CLIENT PROXY
// ═══════════════════════════════════════════════════════════════════════════════

/// Application-side endpoint. Obtains may block with a timeout.
pub struct ClientProxy {
    region: Arc<SharedRegion>,
    role: Role,
    grant: GrantState,
    shutdown: AtomicBool,
}

impl ClientProxy {
    pub fn attach(region: Arc<SharedRegion>) -> AfResult<Self> {
        region.claim_proxy(Side::Client)?;
        let role = Role::of(region.direction(), Side::Client);
        Ok(Self {
            region,
            role,
            grant: GrantState::new(),
            shutdown: AtomicBool::new(false),
        })
    }

    #[inline]
    pub fn region(&self) -> &Arc<SharedRegion> {
        &self.region
    }

    #[inline]
    pub fn cblk(&self) -> &ControlBlock {
        self.region.cblk()
    }

    #[inline]
    pub fn role(&self) -> Role {
        self.role
    }

    #[inline]
    pub fn frame_count(&self) -> usize {
        self.region.frame_count()
    }

    /// The server side is gone, the track was invalidated, or this proxy
    /// saw corrupt cursors.
    pub fn is_dead(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
            || !self.region.is_attached(Side::Server)
            || self.cblk().flags().contains(CblkFlags::INVALID)
    }

    /// Frames still granted and not yet released.
    pub fn outstanding(&self) -> usize {
        self.grant.outstanding()
    }

    /// Wait for up to `frames` frames of space (producer) or data
    /// (consumer). The grant never spans the wrap point.
    pub fn obtain_buffer(&self, frames: usize, timeout: WaitTimeout) -> AfResult<Buffer> {
        if frames == 0 {
            return Err(AfError::invalid_argument("obtain of 0 frames"));
        }
        if self.region.is_static() {
            return Err(AfError::invalid_operation("static track has no streaming ring"));
        }
        self.grant.begin()?;
        let deadline = timeout.deadline(Instant::now());
        match self.obtain_inner(frames, deadline) {
            Ok(buffer) => {
                self.grant.commit(buffer.frame_count());
                Ok(buffer)
            }
            Err(e) => {
                self.grant.abort();
                Err(e)
            }
        }
    }

    fn obtain_inner(&self, frames: usize, deadline: Deadline) -> AfResult<Buffer> {
        let cblk = self.cblk();
        loop {
            let seq = cblk.wake.sequence();
            if self.is_dead() {
                return Err(AfError::DeadObject);
            }
            if cblk.flags().contains(CblkFlags::INTERRUPT) {
                cblk.clear_flags(CblkFlags::INTERRUPT);
                return Err(AfError::Interrupted);
            }
            let (available, cursor) = ring_available(cblk, self.role).inspect_err(|_| {
                self.shutdown.store(true, Ordering::Release);
            })?;
            if available > 0 {
                let (offset, granted, rest) = carve(cblk.frame_count(), cursor, available, frames);
                let region = Arc::clone(&self.region);
                return Ok(Buffer::new(region, Side::Client, offset, granted, rest));
            }
            if deadline.has_passed(Instant::now()) {
                return Err(match deadline {
                    Deadline::Expired => AfError::WouldBlock,
                    _ => AfError::TimedOut,
                });
            }
            cblk.wake.wait(seq, deadline);
        }
    }

    /// Hand back the outstanding grant, publishing its first `frames`.
    ///
    /// The buffer is consumed, so released frames can no longer be touched:
    ///
    /// ```compile_fail
    /// use af_core::WaitTimeout;
    /// use af_shm::{ClientProxy, Direction, RegionParams, SharedRegion};
    ///
    /// let region = SharedRegion::create(RegionParams {
    ///     frame_count: 16,
    ///     frame_size: 4,
    ///     sample_rate: 48_000,
    ///     direction: Direction::Playback,
    ///     static_data: None,
    /// })
    /// .unwrap();
    /// let client = ClientProxy::attach(region).unwrap();
    /// let mut buffer = client.obtain_buffer(8, WaitTimeout::NonBlocking).unwrap();
    /// client.release_buffer(buffer, 8).unwrap();
    /// buffer.bytes_mut()[0] = 0xab;
    /// ```
    pub fn release_buffer(&self, buffer: Buffer, frames: usize) -> AfResult<()> {
        self.grant.take_back(buffer, &self.region, Side::Client, frames)?;
        if frames == 0 {
            return Ok(());
        }
        if self.is_dead() {
            return Err(AfError::DeadObject);
        }
        let cblk = self.cblk();
        advance(cblk, self.role, frames);
        if self.role == Role::Producer
            && cblk.flags().contains(CblkFlags::UNDERRUN)
            && cblk.filled() >= cblk.min_refill() as u64
        {
            cblk.clear_flags(CblkFlags::UNDERRUN);
            log::trace!("refill reached {} frames, underrun cleared", cblk.min_refill());
        }
        Ok(())
    }

    /// Wake a blocked obtain on this proxy.
    pub fn interrupt(&self) {
        self.cblk().interrupt();
    }

    /// Absolute stream position: epoch plus frames consumed.
    pub fn position(&self) -> u64 {
        self.cblk().epoch().wrapping_add(self.cblk().front())
    }

    /// Frames written but not yet consumed.
    pub fn frames_filled(&self) -> usize {
        if self.region.is_static() {
            return 0;
        }
        (self.cblk().filled() as usize).min(self.frame_count())
    }

    pub fn epoch(&self) -> u64 {
        self.cblk().epoch()
    }

    pub fn set_epoch(&self, epoch: u64) {
        self.cblk().set_epoch(epoch);
    }

    /// Ask the server to drop everything buffered. Applied at its next obtain.
    pub fn flush(&self) {
        self.cblk().flush_request.fetch_add(1, Ordering::AcqRel);
        self.cblk().wake();
    }

    pub fn set_volume_lr(&self, left: f32, right: f32) {
        self.cblk().set_volume_lr(left, right);
    }

    pub fn set_send_level(&self, level: f32) {
        self.cblk().set_send_level(level);
    }

    /// Post a new head position and loop for a static track.
    pub fn set_static(&self, position: usize, looping: LoopConfig) -> AfResult<()> {
        let shared = self
            .region
            .static_shared()
            .ok_or_else(|| AfError::invalid_operation("not a static track"))?;
        if position > self.frame_count() {
            return Err(AfError::invalid_argument(format!(
                "position {position} past buffer of {} frames",
                self.frame_count()
            )));
        }
        looping.validate(self.frame_count())?;
        shared.post(StaticRequest { position, looping });
        self.cblk()
            .buffer_position
            .store(position as u64, Ordering::Release);
        Ok(())
    }

    /// Static playback head inside the buffer.
    pub fn buffer_position(&self) -> usize {
        self.cblk().buffer_position() as usize
    }

    /// Block until the server reports the stream end presented.
    pub fn wait_stream_end_done(&self, timeout: WaitTimeout) -> AfResult<()> {
        let cblk = self.cblk();
        let deadline = timeout.deadline(Instant::now());
        loop {
            let seq = cblk.wake.sequence();
            if cblk.clear_flags(CblkFlags::STREAM_END_DONE).contains(CblkFlags::STREAM_END_DONE) {
                return Ok(());
            }
            if self.is_dead() {
                return Err(AfError::DeadObject);
            }
            if cblk.flags().contains(CblkFlags::INTERRUPT) {
                cblk.clear_flags(CblkFlags::INTERRUPT);
                return Err(AfError::Interrupted);
            }
            if deadline.has_passed(Instant::now()) {
                return Err(AfError::TimedOut);
            }
            cblk.wake.wait(seq, deadline);
        }
    }

    /// Block until the server has consumed everything written.
    pub fn wait_drained(&self, timeout: WaitTimeout) -> AfResult<()> {
        let cblk = self.cblk();
        let deadline = timeout.deadline(Instant::now());
        loop {
            let seq = cblk.wake.sequence();
            if self.frames_filled() == 0 {
                return Ok(());
            }
            if self.is_dead() {
                return Err(AfError::DeadObject);
            }
            if deadline.has_passed(Instant::now()) {
                return Err(AfError::TimedOut);
            }
            cblk.wake.wait(seq, deadline);
        }
    }
}

impl std::fmt::Debug for ClientProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientProxy")
            .field("role", &self.role)
            .field("region", &self.region)
            .finish()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// SERVER PROXY
// ═══════════════════════════════════════════════════════════════════════════════

/// Mixing-thread endpoint. Never blocks: an empty grant means "nothing now".
pub struct ServerProxy {
    region: Arc<SharedRegion>,
    role: Role,
    grant: GrantState,
    acked_flush: AtomicU32,
    draining: AtomicBool,
    static_pb: Option<Mutex<StaticPlayback>>,
}

impl ServerProxy {
    pub fn attach(region: Arc<SharedRegion>) -> AfResult<Self> {
        region.claim_proxy(Side::Server)?;
        let role = Role::of(region.direction(), Side::Server);
        let static_pb = region
            .is_static()
            .then(|| Mutex::new(StaticPlayback::new(region.frame_count())));
        Ok(Self {
            region,
            role,
            grant: GrantState::new(),
            acked_flush: AtomicU32::new(0),
            draining: AtomicBool::new(false),
            static_pb,
        })
    }

    #[inline]
    pub fn region(&self) -> &Arc<SharedRegion> {
        &self.region
    }

    #[inline]
    pub fn cblk(&self) -> &ControlBlock {
        self.region.cblk()
    }

    #[inline]
    pub fn role(&self) -> Role {
        self.role
    }

    #[inline]
    pub fn frame_count(&self) -> usize {
        self.region.frame_count()
    }

    pub fn is_client_attached(&self) -> bool {
        self.region.is_attached(Side::Client)
    }

    pub fn outstanding(&self) -> usize {
        self.grant.outstanding()
    }

    /// While draining, the refill threshold no longer gates consumption so
    /// the tail of a stream can play out.
    pub fn set_draining(&self, draining: bool) {
        self.draining.store(draining, Ordering::Release);
    }

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::Acquire)
    }

    /// Underrun latch still waiting for the refill threshold.
    fn gated(&self, filled: usize) -> bool {
        let cblk = self.cblk();
        self.role == Role::Consumer
            && !self.is_draining()
            && cblk.flags().contains(CblkFlags::UNDERRUN)
            && filled < cblk.min_refill()
    }

    /// Grant up to `frames` frames without blocking. Returns an empty buffer
    /// when nothing is available; an empty playback grant records an
    /// underrun.
    pub fn obtain_buffer(&self, frames: usize) -> AfResult<Buffer> {
        if frames == 0 {
            return Ok(Buffer::empty(Arc::clone(&self.region), Side::Server));
        }
        self.grant.begin()?;
        match self.obtain_inner(frames) {
            Ok(buffer) => {
                self.grant.commit(buffer.frame_count());
                Ok(buffer)
            }
            Err(e) => {
                self.grant.abort();
                Err(e)
            }
        }
    }

    fn obtain_inner(&self, frames: usize) -> AfResult<Buffer> {
        let cblk = self.cblk();
        if let Some(pb) = &self.static_pb {
            let mut pb = pb.lock();
            if let Some(shared) = self.region.static_shared() {
                pb.poll(shared);
            }
            let granted = frames.min(pb.frames_ready());
            return Ok(Buffer::new(
                Arc::clone(&self.region),
                Side::Server,
                pb.position(),
                granted,
                0,
            ));
        }

        if self.role == Role::Consumer {
            self.ack_flush_if_pending();
        }
        let (available, cursor) = ring_available(cblk, self.role)?;
        let available = if self.gated(available) { 0 } else { available };
        if available == 0 {
            match self.role {
                Role::Consumer => cblk.tally_underrun(frames),
                Role::Producer => {
                    cblk.set_flags(CblkFlags::OVERRUN);
                }
            }
            return Ok(Buffer::empty(Arc::clone(&self.region), Side::Server));
        }
        let (offset, granted, rest) = carve(cblk.frame_count(), cursor, available, frames);
        Ok(Buffer::new(Arc::clone(&self.region), Side::Server, offset, granted, rest))
    }

    pub fn release_buffer(&self, buffer: Buffer, frames: usize) -> AfResult<()> {
        self.grant.take_back(buffer, &self.region, Side::Server, frames)?;
        if frames == 0 {
            return Ok(());
        }
        let cblk = self.cblk();
        if let Some(pb) = &self.static_pb {
            let mut pb = pb.lock();
            let events = pb.advance(frames);
            advance(cblk, Role::Consumer, frames);
            cblk.buffer_position
                .store(pb.position() as u64, Ordering::Release);
            if !events.is_empty() {
                cblk.set_flags(events);
            }
        } else {
            advance(cblk, self.role, frames);
        }
        cblk.wake();
        Ok(())
    }

    /// Frames the consumer could take right now.
    pub fn frames_ready(&self) -> usize {
        if let Some(pb) = &self.static_pb {
            let mut pb = pb.lock();
            if let Some(shared) = self.region.static_shared() {
                pb.poll(shared);
            }
            return pb.frames_ready();
        }
        if self.flush_pending() {
            return 0;
        }
        match ring_available(self.cblk(), Role::Consumer) {
            Ok((filled, _)) if !self.gated(filled) => filled,
            _ => 0,
        }
    }

    /// Frames until a static loop wraps, if one is armed.
    pub fn frames_to_loop_end(&self) -> Option<usize> {
        self.static_pb.as_ref()?.lock().frames_to_loop_end()
    }

    pub fn flush_pending(&self) -> bool {
        self.cblk().flush_request.load(Ordering::Acquire) != self.acked_flush.load(Ordering::Acquire)
    }

    /// Apply a client flush: everything buffered is skipped.
    pub fn ack_flush_if_pending(&self) {
        let request = self.cblk().flush_request.load(Ordering::Acquire);
        if request != self.acked_flush.load(Ordering::Acquire) {
            self.acked_flush.store(request, Ordering::Release);
            self.discard();
        }
    }

    fn discard(&self) {
        let cblk = self.cblk();
        if self.role == Role::Consumer {
            let rear = cblk.rear.load(Ordering::Acquire);
            cblk.front.store(rear, Ordering::Release);
        }
        cblk.clear_flags(CblkFlags::UNDERRUN | CblkFlags::OVERRUN);
        cblk.wake();
    }

    /// Skip buffered frames up to the producer cursor value `mark`, leaving
    /// anything written after it. Skipped frames do not count as played.
    /// Returns the frames skipped.
    pub fn discard_to(&self, mark: u64) -> usize {
        if self.role != Role::Consumer || self.region.is_static() {
            return 0;
        }
        let cblk = self.cblk();
        let front = cblk.front.load(Ordering::Acquire);
        let skip = mark.wrapping_sub(front);
        // Already consumed past the mark.
        if skip == 0 || skip > cblk.frame_count() as u64 {
            return 0;
        }
        cblk.front.store(mark, Ordering::Release);
        cblk.rewind_epoch(skip);
        cblk.wake();
        skip as usize
    }

    /// Drop buffered frames (streaming) or rewind to the start (static).
    pub fn reset(&self) {
        if let Some(pb) = &self.static_pb {
            pb.lock().rewind();
            self.cblk().buffer_position.store(0, Ordering::Release);
            self.cblk()
                .clear_flags(CblkFlags::LOOP_CYCLE | CblkFlags::LOOP_FINAL | CblkFlags::BUFFER_END);
            return;
        }
        self.acked_flush.store(
            self.cblk().flush_request.load(Ordering::Acquire),
            Ordering::Release,
        );
        self.discard();
    }

    pub fn tally_underrun(&self, frames: usize) {
        if self.role == Role::Consumer && !self.region.is_static() {
            self.cblk().tally_underrun(frames);
        }
    }

    /// Frames consumed since creation.
    pub fn position(&self) -> u64 {
        self.cblk().front()
    }

    pub fn epoch(&self) -> u64 {
        self.cblk().epoch()
    }

    pub fn volume_lr(&self) -> (f32, f32) {
        self.cblk().volume_lr()
    }

    pub fn send_level(&self) -> f32 {
        self.cblk().send_level()
    }

    pub fn set_stream_end_done(&self) {
        self.cblk().set_flags(CblkFlags::STREAM_END_DONE);
        self.cblk().wake();
    }
}

impl std::fmt::Debug for ServerProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerProxy")
            .field("role", &self.role)
            .field("region", &self.region)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::RegionParams;
    use std::time::Duration;

    fn playback(frame_count: usize) -> (ClientProxy, ServerProxy) {
        let region = SharedRegion::create(RegionParams {
            frame_count,
            frame_size: 2,
            sample_rate: 48_000,
            direction: Direction::Playback,
            static_data: None,
        })
        .unwrap();
        let client = ClientProxy::attach(Arc::clone(&region)).unwrap();
        let server = ServerProxy::attach(region).unwrap();
        (client, server)
    }

    fn write_frames(client: &ClientProxy, frames: usize) {
        let mut left = frames;
        while left > 0 {
            let buf = client.obtain_buffer(left, WaitTimeout::NonBlocking).unwrap();
            let n = buf.frame_count();
            client.release_buffer(buf, n).unwrap();
            left -= n;
        }
    }

    #[test]
    fn test_roles_follow_direction() {
        let (client, server) = playback(8);
        assert_eq!(client.role(), Role::Producer);
        assert_eq!(server.role(), Role::Consumer);
    }

    #[test]
    fn test_carve_splits_at_wrap() {
        assert_eq!(carve(8, 6, 8, 5), (6, 2, 3));
        assert_eq!(carve(8, 6, 1, 5), (6, 1, 0));
        assert_eq!(carve(8, 0, 8, 5), (0, 5, 0));
        assert_eq!(carve(8, 16, 3, 5), (0, 3, 0));
    }

    #[test]
    fn test_oversized_release_rejected() {
        let (client, _server) = playback(16);
        let buf = client.obtain_buffer(10, WaitTimeout::NonBlocking).unwrap();
        assert_eq!(buf.frame_count(), 10);
        assert!(matches!(
            client.release_buffer(buf, 11),
            Err(AfError::InvalidArgument(_))
        ));
        // Nothing published, but the grant is closed.
        assert_eq!(client.cblk().rear(), 0);
        assert_eq!(client.outstanding(), 0);

        let buf = client.obtain_buffer(10, WaitTimeout::NonBlocking).unwrap();
        client.release_buffer(buf, 10).unwrap();
        assert_eq!(client.cblk().rear(), 10);
    }

    #[test]
    fn test_second_obtain_needs_release() {
        let (client, _server) = playback(16);
        let buf = client.obtain_buffer(4, WaitTimeout::NonBlocking).unwrap();
        assert!(matches!(
            client.obtain_buffer(4, WaitTimeout::NonBlocking),
            Err(AfError::InvalidOperation(_))
        ));
        client.release_buffer(buf, 0).unwrap();
        assert_eq!(client.outstanding(), 0);
        assert!(client.obtain_buffer(4, WaitTimeout::NonBlocking).is_ok());
    }

    #[test]
    fn test_release_takes_only_own_grants() {
        let (client, server) = playback(16);
        write_frames(&client, 8);
        let own = client.obtain_buffer(4, WaitTimeout::NonBlocking).unwrap();
        let foreign = server.obtain_buffer(4).unwrap();
        assert!(matches!(
            client.release_buffer(foreign, 4),
            Err(AfError::InvalidArgument(_))
        ));
        // The client's own grant is untouched.
        assert_eq!(client.outstanding(), 4);
        client.release_buffer(own, 4).unwrap();
        assert_eq!(client.cblk().rear(), 12);
    }

    #[test]
    fn test_empty_grant_release_keeps_open_grant() {
        let (client, server) = playback(16);
        let empty = server.obtain_buffer(4).unwrap();
        assert!(empty.is_empty());
        write_frames(&client, 16);
        // Underrun gate is lifted by a full ring.
        let held = server.obtain_buffer(4).unwrap();
        assert_eq!(held.frame_count(), 4);
        server.release_buffer(empty, 0).unwrap();
        assert_eq!(server.outstanding(), 4);
        assert!(matches!(
            server.obtain_buffer(4),
            Err(AfError::InvalidOperation(_))
        ));
        server.release_buffer(held, 4).unwrap();
        assert_eq!(server.position(), 4);
    }

    #[test]
    fn test_full_ring_would_block_then_times_out() {
        let (client, _server) = playback(8);
        write_frames(&client, 8);
        assert_eq!(
            client.obtain_buffer(1, WaitTimeout::NonBlocking).unwrap_err(),
            AfError::WouldBlock
        );
        let start = Instant::now();
        assert_eq!(
            client
                .obtain_buffer(1, WaitTimeout::Bounded(Duration::from_millis(15)))
                .unwrap_err(),
            AfError::TimedOut
        );
        assert!(start.elapsed() >= Duration::from_millis(15));
    }

    #[test]
    fn test_blocked_obtain_wakes_on_release() {
        let (client, server) = playback(8);
        write_frames(&client, 8);
        let client = Arc::new(client);
        let waiter = {
            let client = Arc::clone(&client);
            std::thread::spawn(move || client.obtain_buffer(4, WaitTimeout::Forever).map(|b| b.frame_count()))
        };
        std::thread::sleep(Duration::from_millis(10));
        let buf = server.obtain_buffer(3).unwrap();
        let n = buf.frame_count();
        server.release_buffer(buf, n).unwrap();
        assert_eq!(waiter.join().unwrap().unwrap(), 3);
    }

    #[test]
    fn test_invalidate_unblocks_with_dead_object() {
        let (client, server) = playback(8);
        write_frames(&client, 8);
        let client = Arc::new(client);
        let waiter = {
            let client = Arc::clone(&client);
            std::thread::spawn(move || client.obtain_buffer(4, WaitTimeout::Forever).map(|_| ()))
        };
        std::thread::sleep(Duration::from_millis(10));
        server.cblk().invalidate();
        assert_eq!(waiter.join().unwrap().unwrap_err(), AfError::DeadObject);
        assert_eq!(client.outstanding(), 0);
    }

    #[test]
    fn test_server_relinquish_is_dead_object() {
        let (client, server) = playback(8);
        server.region().relinquish(Side::Server);
        assert_eq!(
            client.obtain_buffer(1, WaitTimeout::Forever).unwrap_err(),
            AfError::DeadObject
        );
    }

    #[test]
    fn test_interrupt() {
        let (client, _server) = playback(8);
        write_frames(&client, 8);
        client.interrupt();
        assert_eq!(
            client.obtain_buffer(1, WaitTimeout::Forever).unwrap_err(),
            AfError::Interrupted
        );
        assert!(!client.cblk().flags().contains(CblkFlags::INTERRUPT));
    }

    #[test]
    fn test_corrupt_cursors_become_dead_object() {
        let (client, _server) = playback(8);
        client.cblk().rear.store(100, Ordering::Release);
        assert_eq!(
            client.obtain_buffer(1, WaitTimeout::NonBlocking).unwrap_err(),
            AfError::DeadObject
        );
        assert!(client.is_dead());
    }

    #[test]
    fn test_flush_acked_on_server_obtain() {
        let (client, server) = playback(16);
        write_frames(&client, 12);
        client.flush();
        assert_eq!(server.frames_ready(), 0);
        let buf = server.obtain_buffer(4).unwrap();
        assert!(buf.is_empty());
        assert_eq!(client.frames_filled(), 0);
        assert_eq!(server.position(), 12);
    }

    #[test]
    fn test_reset_discards() {
        let (client, server) = playback(16);
        write_frames(&client, 5);
        server.reset();
        assert_eq!(server.frames_ready(), 0);
        assert_eq!(client.position(), 5);
    }

    #[test]
    fn test_draining_bypasses_refill_gate() {
        let (client, server) = playback(16);
        let empty = server.obtain_buffer(4).unwrap();
        assert!(empty.is_empty());
        assert!(server.cblk().flags().contains(CblkFlags::UNDERRUN));
        write_frames(&client, 3);
        assert_eq!(server.frames_ready(), 0);
        server.set_draining(true);
        assert_eq!(server.frames_ready(), 3);
    }

    #[test]
    fn test_position_adds_epoch() {
        let (client, server) = playback(16);
        client.set_epoch(1_000);
        write_frames(&client, 6);
        let buf = server.obtain_buffer(6).unwrap();
        server.release_buffer(buf, 6).unwrap();
        assert_eq!(client.position(), 1_006);
        assert_eq!(server.epoch(), 1_000);
    }

    #[test]
    fn test_stream_end_wait() {
        let (client, server) = playback(16);
        assert_eq!(
            client
                .wait_stream_end_done(WaitTimeout::Bounded(Duration::from_millis(5)))
                .unwrap_err(),
            AfError::TimedOut
        );
        server.set_stream_end_done();
        client.wait_stream_end_done(WaitTimeout::NonBlocking).unwrap();
        assert!(!client.cblk().flags().contains(CblkFlags::STREAM_END_DONE));
    }
}
