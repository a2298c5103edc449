//! Ring buffer protocol tests
//!
//! Tests for:
//! - Cursor invariant under randomized producer/consumer interleavings
//! - Wrap-around grants and the non-contiguous remainder
//! - Underrun latch and refill threshold
//! - Static buffer loops
//! - Capture direction

use af_core::{AfError, WaitTimeout};
use af_shm::{
    CblkFlags, ClientProxy, Direction, LoopConfig, RegionParams, ServerProxy, SharedRegion,
};
use rand::prelude::*;
use rand_chacha::ChaCha8Rng;
use std::sync::Arc;
use std::time::Duration;

// ═══════════════════════════════════════════════════════════════════════════════
// HELPERS
// ═══════════════════════════════════════════════════════════════════════════════

const FRAME_SIZE: usize = 2;

fn region(frame_count: usize, direction: Direction) -> Arc<SharedRegion> {
    SharedRegion::create(RegionParams {
        frame_count,
        frame_size: FRAME_SIZE,
        sample_rate: 48_000,
        direction,
        static_data: None,
    })
    .unwrap()
}

fn playback(frame_count: usize) -> (ClientProxy, ServerProxy) {
    let region = region(frame_count, Direction::Playback);
    (
        ClientProxy::attach(Arc::clone(&region)).unwrap(),
        ServerProxy::attach(region).unwrap(),
    )
}

/// Stamp consecutive frames with a running counter.
fn stamp(bytes: &mut [u8], first: u16) {
    for (i, frame) in bytes.chunks_exact_mut(FRAME_SIZE).enumerate() {
        frame.copy_from_slice(&first.wrapping_add(i as u16).to_le_bytes());
    }
}

fn read_stamps(bytes: &[u8]) -> Vec<u16> {
    bytes
        .chunks_exact(FRAME_SIZE)
        .map(|f| u16::from_le_bytes([f[0], f[1]]))
        .collect()
}

/// Write `frames` stamped frames, blocking as needed.
fn produce(client: &ClientProxy, frames: usize, first: u16) {
    let mut done = 0;
    while done < frames {
        let mut buf = client
            .obtain_buffer(frames - done, WaitTimeout::Forever)
            .unwrap();
        let n = buf.frame_count();
        stamp(buf.bytes_mut(), first.wrapping_add(done as u16));
        client.release_buffer(buf, n).unwrap();
        done += n;
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// CURSOR INVARIANT
// ═══════════════════════════════════════════════════════════════════════════════

#[test]
fn test_random_interleavings_keep_invariant_and_fifo() {
    for seed in 0..32u64 {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let frame_count = rng.random_range(1..=64usize);
        let (client, server) = playback(frame_count);
        let mut next_write = 0u16;
        let mut next_read = 0u16;

        for _ in 0..2_000 {
            if rng.random_bool(0.5) {
                let want = rng.random_range(1..=frame_count * 2);
                match client.obtain_buffer(want, WaitTimeout::NonBlocking) {
                    Ok(mut buf) => {
                        let n = buf.frame_count();
                        assert!(n >= 1 && n <= want);
                        let release = rng.random_range(0..=n);
                        buf.truncate(release);
                        stamp(buf.bytes_mut(), next_write);
                        client.release_buffer(buf, release).unwrap();
                        next_write = next_write.wrapping_add(release as u16);
                    }
                    Err(AfError::WouldBlock) => {
                        assert_eq!(client.frames_filled(), frame_count);
                    }
                    Err(e) => panic!("seed {seed}: unexpected {e}"),
                }
            } else {
                let want = rng.random_range(1..=frame_count * 2);
                let mut buf = server.obtain_buffer(want).unwrap();
                let n = buf.frame_count();
                assert!(n <= want);
                let release = rng.random_range(0..=n);
                buf.truncate(release);
                for stamp in read_stamps(buf.bytes()) {
                    assert_eq!(stamp, next_read, "seed {seed}: frames out of order");
                    next_read = next_read.wrapping_add(1);
                }
                server.release_buffer(buf, release).unwrap();
            }

            let cblk = client.cblk();
            let filled = cblk.rear() - cblk.front();
            assert!(filled <= frame_count as u64, "seed {seed}: filled {filled}");
            assert_eq!(client.outstanding(), 0);
            assert_eq!(server.outstanding(), 0);
        }
    }
}

#[test]
fn test_threaded_producer_consumer() {
    const TOTAL: usize = 50_000;
    let (client, server) = playback(257);
    let client = Arc::new(client);

    let producer = {
        let client = Arc::clone(&client);
        std::thread::spawn(move || {
            let mut rng = ChaCha8Rng::seed_from_u64(11);
            let mut written = 0usize;
            while written < TOTAL {
                let want = rng.random_range(1..=300).min(TOTAL - written);
                let mut buf = client
                    .obtain_buffer(want, WaitTimeout::Bounded(Duration::from_secs(5)))
                    .unwrap();
                let n = buf.frame_count();
                stamp(buf.bytes_mut(), written as u16);
                client.release_buffer(buf, n).unwrap();
                let cblk = client.cblk();
                assert!(cblk.rear() - cblk.front() <= 257);
                written += n;
            }
        })
    };

    let mut rng = ChaCha8Rng::seed_from_u64(12);
    let mut read = 0usize;
    server.cblk().set_min_refill(1);
    while read < TOTAL {
        let buf = server.obtain_buffer(rng.random_range(1..=200)).unwrap();
        if buf.is_empty() {
            std::thread::yield_now();
            continue;
        }
        let n = buf.frame_count();
        for (i, s) in read_stamps(buf.bytes()).into_iter().enumerate() {
            assert_eq!(s, (read + i) as u16);
        }
        server.release_buffer(buf, n).unwrap();
        read += n;
    }
    producer.join().unwrap();
    assert_eq!(client.position(), TOTAL as u64);
}

// ═══════════════════════════════════════════════════════════════════════════════
// WRAP
// ═══════════════════════════════════════════════════════════════════════════════

#[test]
fn test_wrap_returns_prefix_then_remainder() {
    let (client, server) = playback(8);
    produce(&client, 6, 0);
    let buf = server.obtain_buffer(6).unwrap();
    assert_eq!(buf.frame_count(), 6);
    server.release_buffer(buf, 6).unwrap();

    // Producer request straddles the end of the ring.
    let mut first = client.obtain_buffer(5, WaitTimeout::NonBlocking).unwrap();
    assert_eq!(first.offset(), 6);
    assert_eq!(first.frame_count(), 2);
    assert_eq!(first.non_contig(), 3);
    stamp(first.bytes_mut(), 6);
    let rest = first.non_contig();
    client.release_buffer(first, 2).unwrap();

    let mut second = client
        .obtain_buffer(rest, WaitTimeout::NonBlocking)
        .unwrap();
    assert_eq!(second.offset(), 0);
    assert_eq!(second.frame_count(), 3);
    stamp(second.bytes_mut(), 8);
    client.release_buffer(second, 3).unwrap();

    // Consumer sees the same split.
    let a = server.obtain_buffer(5).unwrap();
    assert_eq!((a.frame_count(), a.non_contig()), (2, 3));
    let mut seen = read_stamps(a.bytes());
    let rest = a.non_contig();
    server.release_buffer(a, 2).unwrap();
    let b = server.obtain_buffer(rest).unwrap();
    assert_eq!(b.frame_count(), 3);
    seen.extend(read_stamps(b.bytes()));
    server.release_buffer(b, 3).unwrap();

    let reference: Vec<u16> = (6..11).collect();
    assert_eq!(seen, reference);
}

// ═══════════════════════════════════════════════════════════════════════════════
// SCENARIOS
// ═══════════════════════════════════════════════════════════════════════════════

#[test]
fn test_full_buffer_drains_in_two_grants() {
    let (client, server) = playback(4096);
    produce(&client, 4096, 0);

    let mut total = 0;
    for _ in 0..2 {
        let buf = server.obtain_buffer(2048).unwrap();
        assert_eq!(buf.frame_count(), 2048);
        total += buf.frame_count();
        server.release_buffer(buf, 2048).unwrap();
    }
    assert_eq!(total, 4096);
    assert!(server.obtain_buffer(2048).unwrap().is_empty());
    assert!(server.obtain_buffer(2048).unwrap().is_empty());

    produce(&client, 100, 0);
    assert_eq!(client.frames_filled(), 100);
}

#[test]
fn test_underrun_waits_for_refill_threshold() {
    let (client, server) = playback(1024);
    server.cblk().set_min_refill(512);

    produce(&client, 256, 0);
    let buf = server.obtain_buffer(1024).unwrap();
    assert_eq!(buf.frame_count(), 256);
    server.release_buffer(buf, 256).unwrap();

    // Consumer outpaces the producer.
    assert!(server.obtain_buffer(256).unwrap().is_empty());
    assert!(server.cblk().flags().contains(CblkFlags::UNDERRUN));
    let events = server.cblk().underrun_events();

    for chunk in [100, 300] {
        produce(&client, chunk, 0);
        assert!(server.cblk().flags().contains(CblkFlags::UNDERRUN));
        assert_eq!(server.frames_ready(), 0);
        assert!(server.obtain_buffer(256).unwrap().is_empty());
    }

    produce(&client, 112, 0);
    assert!(!server.cblk().flags().contains(CblkFlags::UNDERRUN));
    assert_eq!(server.frames_ready(), 512);
    let buf = server.obtain_buffer(1024).unwrap();
    assert_eq!(buf.frame_count(), 512);
    server.release_buffer(buf, 512).unwrap();
    assert_eq!(server.cblk().underrun_events(), events);
}

#[test]
fn test_static_loop_final_flag_once() {
    let frames = 4000;
    let data = vec![0u8; frames * FRAME_SIZE];
    let region = SharedRegion::create(RegionParams {
        frame_count: frames,
        frame_size: FRAME_SIZE,
        sample_rate: 48_000,
        direction: Direction::Playback,
        static_data: Some(&data),
    })
    .unwrap();
    let client = ClientProxy::attach(Arc::clone(&region)).unwrap();
    let server = ServerProxy::attach(region).unwrap();

    client
        .set_static(0, LoopConfig::new(1000, 2000, 3))
        .unwrap();
    assert!(matches!(
        client.obtain_buffer(1, WaitTimeout::NonBlocking),
        Err(AfError::InvalidOperation(_))
    ));

    let (mut finals, mut cycles, mut ends) = (0, 0, 0);
    loop {
        let buf = server.obtain_buffer(256).unwrap();
        if buf.is_empty() {
            break;
        }
        let n = buf.frame_count();
        server.release_buffer(buf, n).unwrap();
        let seen = client.cblk().clear_flags(CblkFlags::CLIENT_EVENTS);
        finals += seen.contains(CblkFlags::LOOP_FINAL) as u32;
        cycles += seen.contains(CblkFlags::LOOP_CYCLE) as u32;
        ends += seen.contains(CblkFlags::BUFFER_END) as u32;
    }
    assert_eq!(finals, 1);
    assert_eq!(cycles, 2);
    assert_eq!(ends, 1);
    assert_eq!(client.buffer_position(), frames);
    assert_eq!(client.position(), 7000);
}

#[test]
fn test_static_rejects_bad_loop() {
    let data = vec![0u8; 100 * FRAME_SIZE];
    let region = SharedRegion::create(RegionParams {
        frame_count: 100,
        frame_size: FRAME_SIZE,
        sample_rate: 48_000,
        direction: Direction::Playback,
        static_data: Some(&data),
    })
    .unwrap();
    let client = ClientProxy::attach(region).unwrap();
    assert!(client.set_static(0, LoopConfig::new(50, 40, 1)).is_err());
    assert!(client.set_static(101, LoopConfig::NONE).is_err());
    assert!(client.set_static(10, LoopConfig::NONE).is_ok());
    assert_eq!(client.buffer_position(), 10);
}

// ═══════════════════════════════════════════════════════════════════════════════
// CAPTURE
// ═══════════════════════════════════════════════════════════════════════════════

#[test]
fn test_capture_direction_client_consumes() {
    let region = region(16, Direction::Capture);
    let client = ClientProxy::attach(Arc::clone(&region)).unwrap();
    let server = ServerProxy::attach(region).unwrap();

    assert_eq!(
        client.obtain_buffer(4, WaitTimeout::NonBlocking).unwrap_err(),
        AfError::WouldBlock
    );

    let mut buf = server.obtain_buffer(10).unwrap();
    assert_eq!(buf.frame_count(), 10);
    stamp(buf.bytes_mut(), 100);
    server.release_buffer(buf, 10).unwrap();

    let buf = client.obtain_buffer(16, WaitTimeout::NonBlocking).unwrap();
    assert_eq!(read_stamps(buf.bytes()), (100..110).collect::<Vec<u16>>());
    client.release_buffer(buf, 10).unwrap();

    // Server producer fills the ring in two wrapped grants, then overruns.
    let first = server.obtain_buffer(16).unwrap();
    assert_eq!((first.frame_count(), first.non_contig()), (6, 10));
    server.release_buffer(first, 6).unwrap();
    let second = server.obtain_buffer(16).unwrap();
    assert_eq!(second.frame_count(), 10);
    server.release_buffer(second, 10).unwrap();
    assert!(server.obtain_buffer(1).unwrap().is_empty());
    assert!(server.cblk().flags().contains(CblkFlags::OVERRUN));
}
