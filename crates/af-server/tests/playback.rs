//! Playback thread integration tests
//!
//! Tests for:
//! - Mixer output: mixing, timestamps, retries, standby, timed tracks
//! - Direct and offload outputs: gain, pause, drain on stop
//! - Duplicating output fan-out
//! - Config events and server death

use af_core::{
    AfError, ChannelMask, OutputId, PcmConfig, SESSION_ALLOCATE, SampleFormat, ServerConfig,
    StreamType, WaitTimeout,
};
use af_server::{
    AudioServer, ConfigEvent, CreateTrackRequest, CreateTrackResponse, DrainMode, MemorySink,
    MixerStatus, OutputKind, OutputMode, ServerEvent, SinkProbe, TrackFlags, TrackState,
};
use af_shm::{CblkFlags, ClientProxy};
use std::time::{Duration, Instant};

// ═══════════════════════════════════════════════════════════════════════════════
// HELPERS
// ═══════════════════════════════════════════════════════════════════════════════

const PERIOD: usize = 240;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn stereo() -> PcmConfig {
    PcmConfig::new(48_000, SampleFormat::Pcm16, ChannelMask::STEREO)
}

fn server(config: ServerConfig) -> AudioServer {
    init_logging();
    AudioServer::new(config).unwrap()
}

fn open(server: &AudioServer, kind: OutputKind, sink: MemorySink) -> OutputId {
    server.open_output(kind, Box::new(sink), OutputMode::Manual).unwrap()
}

fn mixer(server: &AudioServer) -> (OutputId, SinkProbe) {
    let (sink, probe) = MemorySink::new(stereo(), PERIOD);
    (open(server, OutputKind::Mixer, sink), probe)
}

fn request(output: OutputId) -> CreateTrackRequest {
    CreateTrackRequest {
        output,
        config: stereo(),
        frame_count: 2 * PERIOD,
        flags: TrackFlags::empty(),
        session: SESSION_ALLOCATE,
        stream_type: StreamType::Music,
        shared_buffer: None,
        notification_frames: 0,
    }
}

fn create(server: &AudioServer, req: CreateTrackRequest) -> (CreateTrackResponse, ClientProxy) {
    let resp = server.create_track(req).unwrap();
    let client = ClientProxy::attach(resp.region.clone()).unwrap();
    (resp, client)
}

/// Write `frames` stereo frames of a constant sample.
fn write_constant(client: &ClientProxy, frames: usize, sample: i16) {
    let mut left = frames;
    while left > 0 {
        let mut buf = client.obtain_buffer(left, WaitTimeout::NonBlocking).unwrap();
        for s in buf.bytes_mut().chunks_exact_mut(2) {
            s.copy_from_slice(&sample.to_ne_bytes());
        }
        let n = buf.frame_count();
        client.release_buffer(buf, n).unwrap();
        left -= n;
    }
}

fn samples(bytes: &[u8]) -> Vec<i16> {
    bytes
        .chunks_exact(2)
        .map(|s| i16::from_ne_bytes([s[0], s[1]]))
        .collect()
}

// ═══════════════════════════════════════════════════════════════════════════════
// MIXER OUTPUT
// ═══════════════════════════════════════════════════════════════════════════════

#[test]
fn test_mixer_plays_track_and_reports_timestamp() {
    let server = server(ServerConfig::default());
    let (out, probe) = mixer(&server);
    let (resp, client) = create(&server, request(out));
    assert!(matches!(resp.handle.timestamp(), Err(AfError::InvalidOperation(_))));

    write_constant(&client, 2 * PERIOD, 1000);
    resp.handle.start().unwrap();

    for _ in 0..2 {
        let outcome = server.cycle(out).unwrap();
        assert_eq!(outcome.status, MixerStatus::TracksReady);
        assert_eq!(outcome.frames_written, PERIOD);
    }
    assert_eq!(client.frames_filled(), 0);
    assert_eq!(probe.bytes_written(), 2 * PERIOD * 4);

    let ts = resp.handle.timestamp().unwrap();
    assert_eq!(ts.position, 2 * PERIOD as u64);
}

#[test]
fn test_two_tracks_are_summed() {
    let server = server(ServerConfig::default());
    let (out, probe) = mixer(&server);
    let (a, client_a) = create(&server, request(out));
    let (b, client_b) = create(&server, request(out));
    write_constant(&client_a, 2 * PERIOD, 1000);
    write_constant(&client_b, 2 * PERIOD, 1000);
    a.handle.start().unwrap();
    b.handle.start().unwrap();

    server.cycle(out).unwrap();
    server.cycle(out).unwrap();

    let data = samples(&probe.data());
    // First samples ramp up from silence; the second period is at full gain.
    assert!(data[0].abs() < 100);
    for &s in &data[2 * PERIOD..] {
        assert!((s - 2000).abs() <= 1, "sample {s}");
    }
}

#[test]
fn test_stream_mute_silences_track() {
    let server = server(ServerConfig::default());
    let (out, probe) = mixer(&server);
    let (resp, client) = create(&server, request(out));
    write_constant(&client, 2 * PERIOD, 1000);
    server.set_stream_mute(StreamType::Music, true);
    resp.handle.start().unwrap();

    server.cycle(out).unwrap();
    assert!(samples(&probe.data()).iter().all(|&s| s == 0));
    assert!(server.set_master_volume(1.5).is_err());
}

#[test]
fn test_starved_track_is_disabled() {
    let server = server(ServerConfig {
        max_track_startup_retries: 3,
        ..ServerConfig::default()
    });
    let (out, _probe) = mixer(&server);
    let (resp, client) = create(&server, request(out));
    resp.handle.start().unwrap();
    let thread = server.output(out).unwrap();

    for _ in 0..3 {
        server.cycle(out).unwrap();
    }
    assert!(client.cblk().flags().contains(CblkFlags::DISABLED));
    assert!(thread.active_tracks().is_empty());
    assert_eq!(thread.track_state(resp.handle.id()), Some(TrackState::Active));

    // Restarting clears the flag and re-enters the active set.
    resp.handle.start().unwrap();
    assert!(!client.cblk().flags().contains(CblkFlags::DISABLED));
    assert_eq!(thread.active_tracks(), vec![resp.handle.id()]);
}

#[test]
fn test_stop_discards_buffered_frames() {
    let server = server(ServerConfig::default());
    let (out, _probe) = mixer(&server);
    let (resp, client) = create(&server, request(out));
    write_constant(&client, 2 * PERIOD, 1000);
    resp.handle.start().unwrap();
    server.cycle(out).unwrap();

    resp.handle.stop().unwrap();
    server.cycle(out).unwrap();
    let thread = server.output(out).unwrap();
    assert_eq!(thread.track_state(resp.handle.id()), Some(TrackState::Stopped));
    assert!(thread.active_tracks().is_empty());
    assert_eq!(client.frames_filled(), 0);
}

#[test]
fn test_standby_after_idle_delay() {
    let server = server(ServerConfig {
        standby_delay_ms: 0,
        ..ServerConfig::default()
    });
    let (out, probe) = mixer(&server);
    let (resp, client) = create(&server, request(out));
    write_constant(&client, 2 * PERIOD, 1000);
    resp.handle.start().unwrap();
    server.cycle(out).unwrap();
    let thread = server.output(out).unwrap();
    assert!(!thread.is_standby());
    assert_eq!(probe.with(|r| r.start_count), 1);

    resp.handle.stop().unwrap();
    for _ in 0..3 {
        server.cycle(out).unwrap();
    }
    assert!(thread.is_standby());
    assert_eq!(probe.with(|r| r.standby_count), 1);
    assert!(server.cycle(out).unwrap().idle);
}

#[test]
fn test_timed_track_waits_for_media_start() {
    let server = server(ServerConfig::default());
    let (out, _probe) = mixer(&server);
    let (resp, client) = create(
        &server,
        CreateTrackRequest {
            flags: TrackFlags::TIMED,
            ..request(out)
        },
    );
    write_constant(&client, 2 * PERIOD, 1000);
    resp.handle.set_media_start(2 * PERIOD as u64).unwrap();
    resp.handle.start().unwrap();

    server.cycle(out).unwrap();
    server.cycle(out).unwrap();
    assert_eq!(client.frames_filled(), 2 * PERIOD);

    server.cycle(out).unwrap();
    assert_eq!(client.frames_filled(), PERIOD);
}

// ═══════════════════════════════════════════════════════════════════════════════
// DIRECT AND OFFLOAD OUTPUTS
// ═══════════════════════════════════════════════════════════════════════════════

#[test]
fn test_direct_output_copies_with_gain() {
    let server = server(ServerConfig::default());
    let (sink, probe) = MemorySink::new(stereo(), PERIOD);
    let out = open(&server, OutputKind::Direct, sink);
    let (resp, client) = create(&server, request(out));
    client.set_volume_lr(0.5, 0.5);
    write_constant(&client, 2 * PERIOD, 1000);
    resp.handle.start().unwrap();

    let outcome = server.cycle(out).unwrap();
    assert_eq!(outcome.frames_written, PERIOD);
    assert!(samples(&probe.data()).iter().all(|&s| s == 500));
}

#[test]
fn test_direct_output_rejects_mismatched_format() {
    let server = server(ServerConfig::default());
    let (sink, _probe) = MemorySink::new(stereo(), PERIOD);
    let out = open(&server, OutputKind::Direct, sink);
    let mono = PcmConfig::new(48_000, SampleFormat::Pcm16, ChannelMask::MONO);
    assert!(matches!(
        server.create_track(CreateTrackRequest {
            config: mono,
            ..request(out)
        }),
        Err(AfError::InvalidArgument(_))
    ));
}

fn offload(server: &AudioServer, drain_polls: u32) -> (OutputId, SinkProbe) {
    let (sink, probe) = MemorySink::new(stereo(), PERIOD);
    let out = open(server, OutputKind::Offload, sink.with_drain_polls(drain_polls));
    (out, probe)
}

#[test]
fn test_offload_stop_drains_before_stopping() {
    let server = server(ServerConfig::default());
    let (out, probe) = offload(&server, 2);
    let (resp, client) = create(
        &server,
        CreateTrackRequest {
            flags: TrackFlags::OFFLOAD,
            ..request(out)
        },
    );
    write_constant(&client, 2 * PERIOD, 1000);
    resp.handle.start().unwrap();
    server.cycle(out).unwrap();

    resp.handle.stop().unwrap();
    let thread = server.output(out).unwrap();
    assert_eq!(thread.track_state(resp.handle.id()), Some(TrackState::Stopping1));

    // The tail still plays.
    assert_eq!(server.cycle(out).unwrap().frames_written, PERIOD);
    assert_eq!(server.cycle(out).unwrap().status, MixerStatus::DrainTrack);
    assert_eq!(thread.track_state(resp.handle.id()), Some(TrackState::Stopping2));

    let mut cycles = 0;
    while thread.track_state(resp.handle.id()) != Some(TrackState::Stopped) {
        server.cycle(out).unwrap();
        cycles += 1;
        assert!(cycles < 10, "drain never completed");
    }
    assert_eq!(probe.with(|r| r.drains.clone()), vec![DrainMode::EarlyNotify]);
    assert!(client.cblk().flags().contains(CblkFlags::STREAM_END_DONE));
    assert_eq!(probe.bytes_written(), 2 * PERIOD * 4);
}

#[test]
fn test_offload_pause_and_resume_drive_the_sink() {
    let server = server(ServerConfig::default());
    let (out, probe) = offload(&server, 0);
    let (resp, client) = create(
        &server,
        CreateTrackRequest {
            flags: TrackFlags::OFFLOAD,
            ..request(out)
        },
    );
    write_constant(&client, 2 * PERIOD, 1000);
    resp.handle.start().unwrap();
    server.cycle(out).unwrap();
    assert_eq!(probe.with(|r| r.volume), Some((1.0, 1.0)));

    resp.handle.pause().unwrap();
    server.cycle(out).unwrap();
    assert!(probe.with(|r| r.paused));
    let thread = server.output(out).unwrap();
    assert_eq!(thread.track_state(resp.handle.id()), Some(TrackState::Paused));

    resp.handle.start().unwrap();
    server.cycle(out).unwrap();
    assert!(!probe.with(|r| r.paused));
    assert_eq!(thread.track_state(resp.handle.id()), Some(TrackState::Active));
}

#[test]
fn test_offload_output_only_takes_offload_tracks() {
    let server = server(ServerConfig::default());
    let (out, _probe) = offload(&server, 0);
    assert!(matches!(
        server.create_track(request(out)),
        Err(AfError::InvalidArgument(_))
    ));
}

// ═══════════════════════════════════════════════════════════════════════════════
// DUPLICATING OUTPUT
// ═══════════════════════════════════════════════════════════════════════════════

#[test]
fn test_duplicating_output_mirrors_to_destinations() {
    let server = server(ServerConfig::default());
    let (a, probe_a) = mixer(&server);
    let (b, probe_b) = mixer(&server);
    let dup = server.open_duplicate_output(&[a, b], OutputMode::Manual).unwrap();
    let (resp, client) = create(
        &server,
        CreateTrackRequest {
            frame_count: 4 * PERIOD,
            ..request(dup)
        },
    );
    write_constant(&client, 4 * PERIOD, 1000);
    resp.handle.start().unwrap();

    for _ in 0..3 {
        assert_eq!(server.cycle(dup).unwrap().status, MixerStatus::TracksReady);
    }
    assert_eq!(server.cycle(a).unwrap().frames_written, PERIOD);
    assert_eq!(server.cycle(b).unwrap().frames_written, PERIOD);
    assert_eq!(probe_a.bytes_written(), PERIOD * 4);
    assert_eq!(probe_b.bytes_written(), PERIOD * 4);
}

#[test]
fn test_duplicating_needs_mixer_destinations() {
    let server = server(ServerConfig::default());
    let (direct, _probe) = {
        let (sink, probe) = MemorySink::new(stereo(), PERIOD);
        (open(&server, OutputKind::Direct, sink), probe)
    };
    assert!(server.open_duplicate_output(&[direct], OutputMode::Manual).is_err());
    assert!(server.open_duplicate_output(&[], OutputMode::Manual).is_err());
}

// ═══════════════════════════════════════════════════════════════════════════════
// CONFIG EVENTS AND DEATH
// ═══════════════════════════════════════════════════════════════════════════════

#[test]
fn test_routing_change_invalidates_tracks() {
    let server = server(ServerConfig::default());
    let (out, probe) = mixer(&server);
    let (_resp, client) = create(&server, request(out));

    let ticket = server
        .set_parameters_async(out, ConfigEvent::SetRouting(3))
        .unwrap();
    server.cycle(out).unwrap();
    ticket.wait(Duration::from_secs(1)).unwrap();
    assert_eq!(probe.with(|r| r.routing), Some(3));
    assert!(client.is_dead());
}

#[test]
fn test_threaded_output_consumes_and_closes() {
    let server = server(ServerConfig::default());
    let (sink, probe) = MemorySink::new(stereo(), PERIOD);
    let out = server
        .open_output(OutputKind::Mixer, Box::new(sink), OutputMode::Threaded)
        .unwrap();
    assert!(server.cycle(out).is_err());

    server.set_parameters(out, ConfigEvent::SetFrameCount(PERIOD)).unwrap();
    let (resp, client) = create(&server, request(out));
    write_constant(&client, 2 * PERIOD, 1000);
    resp.handle.start().unwrap();

    let deadline = Instant::now() + Duration::from_secs(5);
    while client.frames_filled() > 0 {
        assert!(Instant::now() < deadline, "thread never consumed the track");
        std::thread::sleep(Duration::from_millis(2));
    }
    assert!(probe.bytes_written() >= 2 * PERIOD * 4);

    server.close_output(out).unwrap();
    assert!(client.is_dead());
    drop(resp);
    assert!(server.arena().is_empty());
}

#[test]
fn test_kill_notifies_and_restart_accepts_new_tracks() {
    let server = server(ServerConfig::default());
    let (out, _probe) = mixer(&server);
    let events = server.subscribe(2);
    let (resp, client) = create(&server, request(out));

    server.kill();
    assert_eq!(
        events.recv_timeout(Duration::from_secs(1)),
        Ok(ServerEvent::PeerLost { generation: 0 })
    );
    assert!(client.is_dead());
    assert!(matches!(resp.handle.start(), Err(AfError::DeadObject)));

    server.restart();
    let (fresh, _client) = create(&server, request(out));
    fresh.handle.start().unwrap();
    assert_ne!(fresh.handle.id(), resp.handle.id());
}
