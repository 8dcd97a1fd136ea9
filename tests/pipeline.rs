//! End-to-end pipeline tests against the in-memory fake launcher
//!
//! Exercises the full capture → hub → sink paths without ffmpeg: the fake
//! launcher hands each pipeline duplex pipes, so tests inject capture
//! bytes on one side and observe transcoder input on the other.
//!
//! Run: `cargo test --test pipeline`

mod common;

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::timeout;

use common::{FakeLauncher, FakeProcessCtl};
use yagura::hub::Subscription;
use yagura::webrtc::ForwarderManager;
use yagura::{
    CameraConfig, CaptureRegistry, Capturer, HlsConfig, HlsOutputManager, RtmpManager,
    SpawnSpec, StreamError, WebRtcConfig,
};

const FRAME_A: &[u8] = &[0xFF, 0xD8, b'A', 0xFF, 0xD9];
const FRAME_B: &[u8] = &[0xFF, 0xD8, b'B', 0xFF, 0xD9];
const AUDIO_BLOCK: usize = 1920;

// ── Shared helpers ───────────────────────────────────────────────────

fn camera(audio: bool) -> CameraConfig {
    let mut config = CameraConfig::usb("cam1", "Front door", 0);
    config.audio.enabled = audio;
    config
}

/// Registry with one started capturer; returns the capture process ctl.
async fn start_capture(
    audio: bool,
) -> (Arc<CaptureRegistry>, FakeLauncher, Capturer, FakeProcessCtl) {
    common::init_tracing();
    let launcher = FakeLauncher::new();
    let registry = Arc::new(CaptureRegistry::new(Arc::new(launcher.clone())));
    let capturer = registry.add(camera(audio)).await.expect("register camera");
    capturer.start().await.expect("start capture");
    let ctl = launcher.pop();
    assert_eq!(ctl.spec.label, "capture");
    (registry, launcher, capturer, ctl)
}

async fn recv_buf(sub: &mut Subscription) -> Bytes {
    timeout(Duration::from_secs(5), sub.recv())
        .await
        .expect("recv timed out")
        .expect("subscription closed")
}

fn rtp_port(spec: &SpawnSpec) -> u16 {
    let url = spec.args.last().expect("encoder url arg");
    let rest = url
        .strip_prefix("rtp://127.0.0.1:")
        .expect("loopback rtp url");
    rest.split('?').next().expect("port").parse().expect("port number")
}

fn rtp_packet(seq: u16) -> Vec<u8> {
    let mut buf = vec![0u8; 24];
    buf[0] = 0x80;
    buf[1] = 96;
    buf[2..4].copy_from_slice(&seq.to_be_bytes());
    buf[4..8].copy_from_slice(&1234u32.to_be_bytes());
    buf[8..12].copy_from_slice(&0xDEADBEEFu32.to_be_bytes());
    buf
}

// ── Capture demux ────────────────────────────────────────────────────

#[tokio::test]
async fn demux_yields_exact_frames_in_order() {
    let (_registry, _launcher, capturer, mut ctl) = start_capture(false).await;
    let mut sub = capturer.subscribe_frames("test").await;

    let mut video = ctl.take_pipe_peer(0);
    let mut stream = Vec::new();
    stream.extend_from_slice(FRAME_A);
    stream.extend_from_slice(FRAME_B);
    video.write_all(&stream).await.unwrap();

    assert_eq!(recv_buf(&mut sub).await, Bytes::from_static(FRAME_A));
    assert_eq!(recv_buf(&mut sub).await, Bytes::from_static(FRAME_B));

    capturer.stop().await;
}

#[tokio::test]
async fn audio_demux_emits_fixed_blocks_and_discards_partials() {
    let (_registry, _launcher, capturer, mut ctl) = start_capture(true).await;
    let mut sub = capturer.subscribe_audio("test").await;

    let mut audio = ctl.take_pipe_peer(1);
    // Two full blocks plus a partial that must be discarded
    let bytes = vec![0x5Au8; AUDIO_BLOCK * 2 + 100];
    audio.write_all(&bytes).await.unwrap();
    drop(audio); // end of stream

    assert_eq!(recv_buf(&mut sub).await.len(), AUDIO_BLOCK);
    assert_eq!(recv_buf(&mut sub).await.len(), AUDIO_BLOCK);

    capturer.stop().await;
    // Partial tail never arrives; after stop the queue just closes
    assert!(sub.recv().await.is_none());
}

#[tokio::test]
async fn capturer_start_is_idempotent() {
    let (_registry, launcher, capturer, _ctl) = start_capture(false).await;

    capturer.start().await.expect("second start");
    capturer.start().await.expect("third start");

    assert_eq!(launcher.spawn_count(), 1);
    assert!(capturer.is_running().await);

    capturer.stop().await;
}

#[tokio::test]
async fn get_frame_returns_cached_last_frame() {
    let (_registry, _launcher, capturer, mut ctl) = start_capture(false).await;

    let mut video = ctl.take_pipe_peer(0);
    video.write_all(FRAME_A).await.unwrap();

    // The cache fills asynchronously behind the demux task
    let mut frame = None;
    for _ in 0..200 {
        match capturer.get_frame().await {
            Ok(f) => {
                frame = Some(f);
                break;
            }
            Err(_) => tokio::time::sleep(Duration::from_millis(10)).await,
        }
    }
    assert_eq!(frame.expect("frame cached"), Bytes::from_static(FRAME_A));

    capturer.stop().await;
}

#[tokio::test(start_paused = true)]
async fn get_frame_times_out_when_nothing_arrives() {
    let (_registry, _launcher, capturer, _ctl) = start_capture(false).await;

    let result = capturer.get_frame().await;
    assert!(matches!(result, Err(StreamError::Timeout)));

    // The temporary snapshot subscription was removed either way
    assert_eq!(capturer.frame_subscriber_count().await, 0);

    capturer.stop().await;
}

#[tokio::test]
async fn get_frame_on_stopped_capturer_is_not_active() {
    let launcher = FakeLauncher::new();
    let capturer = Capturer::new(camera(false), None, Arc::new(launcher));
    assert!(matches!(
        capturer.get_frame().await,
        Err(StreamError::NotActive(_))
    ));
}

// ── Capturer lifecycle ───────────────────────────────────────────────

#[tokio::test]
async fn stop_closes_queues_and_is_idempotent() {
    let (_registry, launcher, capturer, ctl) = start_capture(false).await;
    let mut sub = capturer.subscribe_frames("viewer").await;

    capturer.stop().await;

    assert!(!capturer.is_running().await);
    assert!(ctl.terminated.load(std::sync::atomic::Ordering::SeqCst));
    assert!(sub.recv().await.is_none());
    assert_eq!(capturer.frame_subscriber_count().await, 0);
    assert_eq!(launcher.alive_count(), 0);

    // Second stop is a no-op
    capturer.stop().await;
}

#[tokio::test(start_paused = true)]
async fn stop_with_stalled_reader_forces_kill_within_grace() {
    let launcher = FakeLauncher::new();
    launcher.ignore_terminate(true);
    let registry = Arc::new(CaptureRegistry::new(Arc::new(launcher.clone())));
    let capturer = registry.add(camera(false)).await.expect("register");
    capturer.start().await.expect("start");
    let ctl = launcher.pop();

    // Nothing ever arrives on the video pipe: the demux read pends
    // forever and the process ignores terminate.
    capturer.stop().await;

    assert!(ctl.terminated.load(std::sync::atomic::Ordering::SeqCst));
    assert!(
        ctl.killed.load(std::sync::atomic::Ordering::SeqCst),
        "forced termination did not fire"
    );
    assert!(!capturer.is_running().await);
}

#[tokio::test]
async fn capture_process_exit_marks_capturer_not_running() {
    let (_registry, _launcher, capturer, ctl) = start_capture(false).await;

    ctl.exit.send(Some(1)).expect("exit watch open");

    let mut stopped = false;
    for _ in 0..200 {
        if !capturer.is_running().await {
            stopped = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(stopped, "exit watcher never marked the capturer stopped");

    capturer.stop().await;
}

#[tokio::test]
async fn spawn_failure_surfaces_from_start() {
    let launcher = FakeLauncher::new();
    launcher.fail_spawns(true);
    let capturer = Capturer::new(camera(false), None, Arc::new(launcher.clone()));

    assert!(matches!(
        capturer.start().await,
        Err(StreamError::SpawnFailed(_))
    ));
    assert!(!capturer.is_running().await);
    assert_eq!(launcher.spawn_count(), 0);
}

// ── Registry ─────────────────────────────────────────────────────────

#[tokio::test]
async fn registry_rejects_duplicate_ids() {
    let launcher = FakeLauncher::new();
    let registry = CaptureRegistry::new(Arc::new(launcher));

    registry.add(camera(false)).await.expect("first add");
    assert!(matches!(
        registry.add(camera(false)).await,
        Err(StreamError::AlreadyExists(_))
    ));
    assert_eq!(registry.get_all().await.len(), 1);
}

#[tokio::test]
async fn registry_bulk_start_and_stop() {
    let launcher = FakeLauncher::new();
    let registry = CaptureRegistry::new(Arc::new(launcher.clone()));

    let mut cam2 = camera(false);
    cam2.id = "cam2".into();
    registry.add(camera(false)).await.expect("add cam1");
    registry.add(cam2).await.expect("add cam2");

    registry.start_all().await.expect("start all");
    assert_eq!(launcher.spawn_count(), 2);
    assert_eq!(launcher.alive_count(), 2);

    registry.stop_all().await;
    assert_eq!(launcher.alive_count(), 0);
    for capturer in registry.get_all().await {
        assert!(!capturer.is_running().await);
    }
}

// ── RTMP push sink ───────────────────────────────────────────────────

#[tokio::test]
async fn rtmp_start_unknown_camera_spawns_nothing() {
    let launcher = FakeLauncher::new();
    let registry = Arc::new(CaptureRegistry::new(Arc::new(launcher.clone())));
    let manager = RtmpManager::new(registry, Arc::new(launcher.clone()));

    let result = manager.start_stream("ghost", "rtmp://x/y").await;
    assert!(matches!(result, Err(StreamError::NotFound(_))));
    assert_eq!(launcher.spawn_count(), 0);
}

#[tokio::test]
async fn rtmp_start_requires_running_capturer() {
    let launcher = FakeLauncher::new();
    let registry = Arc::new(CaptureRegistry::new(Arc::new(launcher.clone())));
    registry.add(camera(false)).await.expect("register");
    let manager = RtmpManager::new(registry, Arc::new(launcher.clone()));

    let result = manager.start_stream("cam1", "rtmp://x/y").await;
    assert!(matches!(result, Err(StreamError::NotActive(_))));
    assert_eq!(launcher.spawn_count(), 0);
}

#[tokio::test]
async fn rtmp_feeds_frames_into_push_process() {
    let (registry, launcher, _capturer, mut capture_ctl) = start_capture(false).await;
    let manager = RtmpManager::new(Arc::clone(&registry), Arc::new(launcher.clone()));

    manager
        .start_stream("cam1", "rtmp://live.example/app/key")
        .await
        .expect("start push");
    let mut rtmp_ctl = launcher.pop();
    assert_eq!(rtmp_ctl.spec.label, "rtmp");

    let status = manager.status("cam1").await;
    assert!(status.running);
    assert_eq!(
        status.endpoint.as_deref(),
        Some("rtmp://live.example/app/key")
    );

    // Frame flows capture pipe -> demux -> hub -> feeder -> push process
    let mut video_in = capture_ctl.take_pipe_peer(0);
    video_in.write_all(FRAME_A).await.unwrap();

    let mut push_input = rtmp_ctl.take_pipe_peer(0);
    let mut fed = vec![0u8; FRAME_A.len()];
    timeout(Duration::from_secs(5), push_input.read_exact(&mut fed))
        .await
        .expect("push feed timed out")
        .expect("push pipe closed");
    assert_eq!(fed, FRAME_A);

    manager.stop_all().await;
}

#[tokio::test]
async fn second_rtmp_start_is_rejected_with_one_process_alive() {
    let (registry, launcher, _capturer, capture_ctl) = start_capture(false).await;
    let manager = RtmpManager::new(Arc::clone(&registry), Arc::new(launcher.clone()));

    manager
        .start_stream("cam1", "rtmp://x/y")
        .await
        .expect("first start");
    let rtmp_ctl = launcher.pop();

    let result = manager.start_stream("cam1", "rtmp://x/other").await;
    assert!(matches!(result, Err(StreamError::AlreadyActive(_))));

    // Exactly one push process was ever spawned and it is still alive
    assert_eq!(launcher.spawn_count(), 2); // capture + one push
    assert!(capture_ctl.is_alive());
    assert!(rtmp_ctl.is_alive());

    manager.stop_all().await;
    assert!(!rtmp_ctl.is_alive());
}

#[tokio::test]
async fn rtmp_exit_watcher_marks_sink_stopped_and_allows_restart() {
    let (registry, launcher, _capturer, _capture_ctl) = start_capture(false).await;
    let manager = RtmpManager::new(Arc::clone(&registry), Arc::new(launcher.clone()));

    manager
        .start_stream("cam1", "rtmp://x/y")
        .await
        .expect("start push");
    let rtmp_ctl = launcher.pop();

    // Target unreachable shows up only as the process exiting
    rtmp_ctl.exit.send(Some(1)).expect("exit watch open");

    let mut stopped = false;
    for _ in 0..200 {
        if !manager.status("cam1").await.running {
            stopped = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(stopped, "exit watcher never marked the sink stopped");

    // A fresh start replaces the dead entry
    manager
        .start_stream("cam1", "rtmp://x/y")
        .await
        .expect("restart push");
    assert!(manager.status("cam1").await.running);

    manager.stop_all().await;
}

#[tokio::test]
async fn rtmp_stop_is_idempotent() {
    let (registry, launcher, _capturer, _capture_ctl) = start_capture(false).await;
    let manager = RtmpManager::new(Arc::clone(&registry), Arc::new(launcher.clone()));

    manager
        .start_stream("cam1", "rtmp://x/y")
        .await
        .expect("start push");
    let rtmp_ctl = launcher.pop();

    manager.stop_stream("cam1").await;
    assert!(!rtmp_ctl.is_alive());
    assert!(!manager.status("cam1").await.running);
    assert!(manager.get_all().await.is_empty());

    manager.stop_stream("cam1").await; // no-op
}

// ── HLS sink ─────────────────────────────────────────────────────────

#[tokio::test]
async fn hls_creates_output_dir_and_feeds_video() {
    let (registry, launcher, _capturer, mut capture_ctl) = start_capture(false).await;
    let temp = tempfile::tempdir().expect("tempdir");
    let hls = HlsConfig {
        temp_path: temp.path().to_path_buf(),
        ..HlsConfig::default()
    };
    let manager = HlsOutputManager::new(Arc::clone(&registry), Arc::new(launcher.clone()), hls);

    manager.start_output("cam1").await.expect("start hls");
    let mut hls_ctl = launcher.pop();
    assert_eq!(hls_ctl.spec.label, "hls");

    assert!(temp.path().join("hls").join("cam1").is_dir());
    let status = manager.status("cam1").await;
    assert!(status.running);
    assert_eq!(status.endpoint.as_deref(), Some("/hls/cam1/index.m3u8"));

    let mut video_in = capture_ctl.take_pipe_peer(0);
    video_in.write_all(FRAME_B).await.unwrap();

    let mut seg_input = hls_ctl.take_pipe_peer(0);
    let mut fed = vec![0u8; FRAME_B.len()];
    timeout(Duration::from_secs(5), seg_input.read_exact(&mut fed))
        .await
        .expect("hls feed timed out")
        .expect("hls pipe closed");
    assert_eq!(fed, FRAME_B);

    let result = manager.start_output("cam1").await;
    assert!(matches!(result, Err(StreamError::AlreadyActive(_))));

    manager.stop_output("cam1").await;
    assert!(!hls_ctl.is_alive());
    assert!(!manager.status("cam1").await.running);
}

// ── WebRTC bridge ────────────────────────────────────────────────────

#[tokio::test]
async fn bridge_forwards_rtp_onto_shared_tracks() {
    let (registry, launcher, _capturer, mut capture_ctl) = start_capture(false).await;
    let manager = ForwarderManager::new(
        Arc::clone(&registry),
        Arc::new(launcher.clone()),
        WebRtcConfig::default(),
    );

    let forwarder = manager.acquire("cam1").await.expect("acquire bridge");
    assert_eq!(forwarder.subscriber_count(), 1);
    let mut vp8_ctl = launcher.pop();
    assert_eq!(vp8_ctl.spec.label, "vp8");

    // Frames reach the encoder stdin, validated as JPEG
    let mut video_in = capture_ctl.take_pipe_peer(0);
    video_in.write_all(FRAME_A).await.unwrap();
    let mut encoder_in = vp8_ctl.take_stdin_peer();
    let mut fed = vec![0u8; FRAME_A.len()];
    timeout(Duration::from_secs(5), encoder_in.read_exact(&mut fed))
        .await
        .expect("encoder feed timed out")
        .expect("encoder stdin closed");
    assert_eq!(fed, FRAME_A);

    // Encoder output: RTP datagrams to the bridge's loopback port end up
    // on the shared video track, malformed ones are dropped silently
    let port = rtp_port(&vp8_ctl.spec);
    let mut viewer = forwarder.video_track().subscribe();
    let sender = tokio::net::UdpSocket::bind("127.0.0.1:0").await.expect("bind");
    let target = format!("127.0.0.1:{}", port);

    sender.send_to(&[0x40, 0, 1], &target).await.expect("send garbage");
    let valid = rtp_packet(7);
    sender.send_to(&valid, &target).await.expect("send rtp");

    let forwarded = timeout(Duration::from_secs(5), viewer.recv())
        .await
        .expect("track recv timed out")
        .expect("track closed");
    assert_eq!(&forwarded[..], &valid[..]);

    manager.stop_all().await;
    assert!(!vp8_ctl.is_alive());
}

#[tokio::test]
async fn bridge_with_audio_runs_two_encoders() {
    let (registry, launcher, _capturer, _capture_ctl) = start_capture(true).await;
    let manager = ForwarderManager::new(
        Arc::clone(&registry),
        Arc::new(launcher.clone()),
        WebRtcConfig::default(),
    );

    let forwarder = manager.acquire("cam1").await.expect("acquire bridge");
    assert!(forwarder.has_audio());

    let vp8_ctl = launcher.pop();
    let opus_ctl = launcher.pop();
    assert_eq!(vp8_ctl.spec.label, "vp8");
    assert_eq!(opus_ctl.spec.label, "opus");
    assert_ne!(rtp_port(&vp8_ctl.spec), rtp_port(&opus_ctl.spec));

    manager.stop_all().await;
    assert!(!vp8_ctl.is_alive());
    assert!(!opus_ctl.is_alive());
}

#[tokio::test]
async fn bridge_refcount_reuses_one_instance_and_tears_down_on_last_release() {
    let (registry, launcher, _capturer, _capture_ctl) = start_capture(false).await;
    let manager = ForwarderManager::new(
        Arc::clone(&registry),
        Arc::new(launcher.clone()),
        WebRtcConfig::default(),
    );

    let first = manager.acquire("cam1").await.expect("first viewer");
    assert_eq!(first.subscriber_count(), 1);
    let second = manager.acquire("cam1").await.expect("second viewer");
    assert_eq!(second.subscriber_count(), 2);

    // One bridge, one encoder process for both viewers
    assert_eq!(launcher.spawn_count(), 2); // capture + vp8

    assert_eq!(manager.release("cam1").await, 1);
    assert!(first.is_running().await);

    assert_eq!(manager.release("cam1").await, 0);
    assert!(!first.is_running().await);
    assert!(manager.get("cam1").await.is_none());

    // Releasing with no forwarder left stays at zero
    assert_eq!(manager.release("cam1").await, 0);
}

#[tokio::test]
async fn bridge_acquire_checks_camera_and_capturer_state() {
    let launcher = FakeLauncher::new();
    let registry = Arc::new(CaptureRegistry::new(Arc::new(launcher.clone())));
    let manager = ForwarderManager::new(
        Arc::clone(&registry),
        Arc::new(launcher.clone()),
        WebRtcConfig::default(),
    );

    assert!(matches!(
        manager.acquire("ghost").await,
        Err(StreamError::NotFound(_))
    ));

    registry.add(camera(false)).await.expect("register");
    assert!(matches!(
        manager.acquire("cam1").await,
        Err(StreamError::NotActive(_))
    ));
    assert_eq!(launcher.spawn_count(), 0);
}
