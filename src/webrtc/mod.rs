//! Real-time-peer RTP bridge
//!
//! Upstream media is single-image JPEG frames and raw PCM, so WebRTC
//! delivery needs a real codec in front of it. The bridge spawns two
//! independent encoder processes per camera: one turns fed frames into
//! VP8 RTP, the other turns fed PCM into Opus RTP, each delivered to a
//! loopback UDP port. The bridge listens on both ports, validates each
//! datagram as RTP, and forwards it unmodified onto the camera's shared
//! [`LocalRtpTrack`]s, which every peer connection for that camera reuses.
//!
//! The two encoders run on independent clocks; no timestamp alignment is
//! attempted here. WebRTC receivers resynchronize on their side.

pub mod track;

pub use track::{LocalRtpTrack, RtpHeader, TrackCodec};

use bytes::Bytes;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::capture::{CaptureRegistry, Capturer};
use crate::config::{CameraConfig, WebRtcConfig};
use crate::error::StreamError;
use crate::process::{ProcessHandle, ProcessLauncher, SpawnSpec};
use crate::sink::{spawn_feeder, Feed};

/// Grace for bridge tasks to wind down after cancellation
const BRIDGE_STOP_GRACE: Duration = Duration::from_secs(5);
/// Largest datagram the encoders are asked to emit (pkt_size=1200 plus
/// headroom)
const RTP_RECV_BUFFER: usize = 1500;

struct BridgeLifecycle {
    cancel: CancellationToken,
    tasks: TaskTracker,
    feeds: Vec<Feed>,
    capturer: Capturer,
}

struct ForwarderInner {
    config: CameraConfig,
    launcher: Arc<dyn ProcessLauncher>,
    running: RwLock<bool>,
    processes: Mutex<Vec<Box<dyn ProcessHandle>>>,
    lifecycle: Mutex<Option<BridgeLifecycle>>,
    video_track: Arc<LocalRtpTrack>,
    audio_track: Arc<LocalRtpTrack>,
    /// Viewers currently watching through this bridge; the owning manager
    /// uses the count to decide teardown timing.
    subscribers: AtomicUsize,
}

/// RTP bridge for one camera, shared by all of its concurrent viewers.
#[derive(Clone)]
pub struct RtpForwarder {
    inner: Arc<ForwarderInner>,
}

impl RtpForwarder {
    pub fn new(config: CameraConfig, launcher: Arc<dyn ProcessLauncher>) -> Self {
        let video_track = Arc::new(LocalRtpTrack::new(
            TrackCodec::vp8(),
            format!("video-{}", config.id),
            format!("stream-{}", config.id),
        ));
        let audio_track = Arc::new(LocalRtpTrack::new(
            TrackCodec::opus(),
            format!("audio-{}", config.id),
            format!("stream-{}", config.id),
        ));
        Self {
            inner: Arc::new(ForwarderInner {
                config,
                launcher,
                running: RwLock::new(false),
                processes: Mutex::new(Vec::new()),
                lifecycle: Mutex::new(None),
                video_track,
                audio_track,
                subscribers: AtomicUsize::new(0),
            }),
        }
    }

    pub fn camera_id(&self) -> &str {
        &self.inner.config.id
    }

    pub fn video_track(&self) -> Arc<LocalRtpTrack> {
        Arc::clone(&self.inner.video_track)
    }

    pub fn audio_track(&self) -> Arc<LocalRtpTrack> {
        Arc::clone(&self.inner.audio_track)
    }

    pub fn has_audio(&self) -> bool {
        self.inner.config.audio.enabled
    }

    pub async fn is_running(&self) -> bool {
        *self.inner.running.read().await
    }

    /// Register one more viewer; returns the post-update count.
    pub fn add_subscriber(&self) -> usize {
        self.inner.subscribers.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Remove one viewer; saturates at zero and returns the post-update
    /// count.
    pub fn remove_subscriber(&self) -> usize {
        self.inner
            .subscribers
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                Some(n.saturating_sub(1))
            })
            .map(|prev| prev.saturating_sub(1))
            .unwrap_or(0)
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.load(Ordering::SeqCst)
    }

    /// Spawn both encoders (audio only when the source has it), open the
    /// RTP listeners, and start the feeder and receiver tasks. No-op when
    /// already running.
    pub async fn start(&self, capturer: &Capturer) -> Result<(), StreamError> {
        let mut running = self.inner.running.write().await;
        if *running {
            return Ok(());
        }

        let camera = self.inner.config.id.clone();

        // Acquire every fallible resource before wiring any tasks, so a
        // late failure can kill the partial set cleanly.
        let video_leg = setup_encoder_leg(&self.inner.launcher, |port| {
            build_video_encoder_spec(&self.inner.config, port)
        })
        .await?;
        let audio_leg = if self.has_audio() {
            match setup_encoder_leg(&self.inner.launcher, build_audio_encoder_spec).await {
                Ok(leg) => Some(leg),
                Err(e) => {
                    video_leg.handle.kill();
                    return Err(e);
                }
            }
        } else {
            None
        };

        let cancel = CancellationToken::new();
        let tasks = TaskTracker::new();
        let mut feeds = Vec::new();
        let mut processes: Vec<Box<dyn ProcessHandle>> = Vec::new();

        // Video leg: frames -> VP8 encoder -> loopback RTP -> video track
        let video_port = video_leg.port;
        let video_id = format!("webrtc_video_{}", camera);
        let sub = capturer.subscribe_frames(video_id.clone()).await;
        spawn_feeder(
            &tasks,
            cancel.clone(),
            camera.clone(),
            "webrtc video",
            sub,
            video_leg.stdin,
            true,
        );
        feeds.push(Feed::Frames(video_id));
        spawn_rtp_receiver(
            &tasks,
            cancel.clone(),
            camera.clone(),
            "video",
            video_leg.socket,
            self.video_track(),
            300,
        );
        spawn_encoder_exit_log(
            &tasks,
            cancel.clone(),
            camera.clone(),
            "vp8",
            video_leg.handle.exit_watch(),
        );
        processes.push(video_leg.handle);

        // Audio leg: PCM -> Opus encoder -> loopback RTP -> audio track
        let mut audio_port = None;
        if let Some(leg) = audio_leg {
            let audio_id = format!("webrtc_audio_{}", camera);
            let sub = capturer.subscribe_audio(audio_id.clone()).await;
            spawn_feeder(
                &tasks,
                cancel.clone(),
                camera.clone(),
                "webrtc audio",
                sub,
                leg.stdin,
                false,
            );
            feeds.push(Feed::Audio(audio_id));
            spawn_rtp_receiver(
                &tasks,
                cancel.clone(),
                camera.clone(),
                "audio",
                leg.socket,
                self.audio_track(),
                500,
            );
            spawn_encoder_exit_log(
                &tasks,
                cancel.clone(),
                camera.clone(),
                "opus",
                leg.handle.exit_watch(),
            );
            processes.push(leg.handle);
            audio_port = Some(leg.port);
        }

        *self.inner.processes.lock().await = processes;
        *self.inner.lifecycle.lock().await = Some(BridgeLifecycle {
            cancel,
            tasks,
            feeds,
            capturer: capturer.clone(),
        });
        *running = true;

        info!(
            camera = %camera,
            video_port,
            audio_port,
            "rtp forwarder started"
        );
        Ok(())
    }

    /// Cancel all tasks (unblocking the socket receivers), close the
    /// encoder inputs, and force-kill both encoder processes. Idempotent.
    pub async fn stop(&self) {
        let was_running = {
            let mut running = self.inner.running.write().await;
            std::mem::replace(&mut *running, false)
        };
        let lifecycle = self.inner.lifecycle.lock().await.take();
        let processes = std::mem::take(&mut *self.inner.processes.lock().await);

        if !was_running && lifecycle.is_none() && processes.is_empty() {
            return;
        }

        if let Some(lifecycle) = &lifecycle {
            lifecycle.cancel.cancel();
            for feed in &lifecycle.feeds {
                match feed {
                    Feed::Frames(id) => lifecycle.capturer.unsubscribe_frames(id).await,
                    Feed::Audio(id) => lifecycle.capturer.unsubscribe_audio(id).await,
                }
            }
        }

        // Let feeders close the encoder stdins before the force-kill
        if let Some(lifecycle) = lifecycle {
            lifecycle.tasks.close();
            if timeout(BRIDGE_STOP_GRACE, lifecycle.tasks.wait()).await.is_err() {
                warn!(
                    camera = %self.inner.config.id,
                    "bridge tasks still blocked after grace period"
                );
            }
        }

        for handle in &processes {
            handle.kill();
        }

        info!(camera = %self.inner.config.id, "rtp forwarder stopped");
    }
}

/// One encoder leg's resources: the RTP listener, the encoder process,
/// and its stdin.
struct EncoderLeg {
    socket: UdpSocket,
    port: u16,
    handle: Box<dyn ProcessHandle>,
    stdin: crate::process::PipeWriter,
}

async fn setup_encoder_leg(
    launcher: &Arc<dyn ProcessLauncher>,
    build_spec: impl FnOnce(u16) -> SpawnSpec,
) -> Result<EncoderLeg, StreamError> {
    let socket = bind_rtp_listener().await?;
    let port = local_port(&socket)?;
    let spec = build_spec(port);
    let mut handle = launcher.launch(&spec)?;
    let stdin = match handle.take_stdin() {
        Some(stdin) => stdin,
        None => {
            handle.kill();
            return Err(StreamError::SpawnFailed(format!(
                "{} encoder has no stdin",
                spec.label
            )));
        }
    };
    Ok(EncoderLeg {
        socket,
        port,
        handle,
        stdin,
    })
}

async fn bind_rtp_listener() -> Result<UdpSocket, StreamError> {
    UdpSocket::bind("127.0.0.1:0")
        .await
        .map_err(|e| StreamError::SpawnFailed(format!("bind rtp listener: {}", e)))
}

fn local_port(socket: &UdpSocket) -> Result<u16, StreamError> {
    socket
        .local_addr()
        .map(|addr| addr.port())
        .map_err(|e| StreamError::SpawnFailed(format!("rtp listener addr: {}", e)))
}

/// Receive loop for one media type: datagram in, RTP validation, shared
/// track out. Malformed datagrams are dropped without disturbing the loop.
fn spawn_rtp_receiver(
    tasks: &TaskTracker,
    cancel: CancellationToken,
    camera: String,
    stream: &'static str,
    socket: UdpSocket,
    track: Arc<LocalRtpTrack>,
    log_every: u64,
) {
    tasks.spawn(async move {
        let mut buf = vec![0u8; RTP_RECV_BUFFER];
        let mut packets: u64 = 0;

        loop {
            let n = tokio::select! {
                _ = cancel.cancelled() => break,
                res = socket.recv_from(&mut buf) => match res {
                    Ok((n, _)) => n,
                    Err(e) => {
                        if cancel.is_cancelled() {
                            break;
                        }
                        debug!(camera = %camera, stream, error = %e, "rtp receive failed");
                        continue;
                    }
                },
            };

            let Some(header) = RtpHeader::parse(&buf[..n]) else {
                continue;
            };

            packets += 1;
            if packets == 1 || packets % log_every == 0 {
                debug!(
                    camera = %camera,
                    stream,
                    packets,
                    seq = header.sequence_number,
                    ts = header.timestamp,
                    "forwarding rtp"
                );
            }

            track.write_rtp(Bytes::copy_from_slice(&buf[..n]));
        }
    });
}

/// Encoder exits are logged but never restarted from here.
fn spawn_encoder_exit_log(
    tasks: &TaskTracker,
    cancel: CancellationToken,
    camera: String,
    encoder: &'static str,
    mut exit: watch::Receiver<Option<i32>>,
) {
    tasks.spawn(async move {
        tokio::select! {
            _ = cancel.cancelled() => {}
            res = exit.wait_for(|code| code.is_some()) => {
                let code = res.ok().and_then(|guard| *guard).unwrap_or(-1);
                warn!(camera = %camera, encoder, code, "rtp encoder exited");
            }
        }
    });
}

/// ffmpeg contract for the video leg: MJPEG on stdin, VP8 RTP out to the
/// bridge's loopback port.
fn build_video_encoder_spec(config: &CameraConfig, port: u16) -> SpawnSpec {
    let mut spec = SpawnSpec::new("vp8", "ffmpeg");
    spec.stdin = true;
    spec.args = vec![
        "-hide_banner".into(),
        "-loglevel".into(),
        "warning".into(),
        "-f".into(),
        "mjpeg".into(),
        "-framerate".into(),
        config.fps.to_string(),
        "-i".into(),
        "pipe:0".into(),
        "-c:v".into(),
        "libvpx".into(),
        "-b:v".into(),
        "1M".into(),
        "-keyint_min".into(),
        "30".into(),
        "-g".into(),
        "30".into(),
        "-deadline".into(),
        "realtime".into(),
        "-cpu-used".into(),
        "8".into(),
        "-an".into(),
        "-f".into(),
        "rtp".into(),
        format!("rtp://127.0.0.1:{}?pkt_size=1200", port),
    ];
    spec
}

/// ffmpeg contract for the audio leg: PCM s16le 48kHz mono on stdin, Opus
/// RTP out to the bridge's loopback port.
fn build_audio_encoder_spec(port: u16) -> SpawnSpec {
    let mut spec = SpawnSpec::new("opus", "ffmpeg");
    spec.stdin = true;
    spec.args = vec![
        "-hide_banner".into(),
        "-loglevel".into(),
        "warning".into(),
        "-f".into(),
        "s16le".into(),
        "-ar".into(),
        "48000".into(),
        "-ac".into(),
        "1".into(),
        "-i".into(),
        "pipe:0".into(),
        "-c:a".into(),
        "libopus".into(),
        "-b:a".into(),
        "48k".into(),
        "-application".into(),
        "lowdelay".into(),
        "-vn".into(),
        "-f".into(),
        "rtp".into(),
        format!("rtp://127.0.0.1:{}?pkt_size=1200", port),
    ];
    spec
}

/// Per-camera registry of RTP forwarders.
///
/// Viewers acquire a shared forwarder on connect and release it on
/// disconnect; the manager tears a forwarder down once the last viewer is
/// gone. The STUN server list rides along for the signaling collaborator.
pub struct ForwarderManager {
    registry: Arc<CaptureRegistry>,
    launcher: Arc<dyn ProcessLauncher>,
    config: WebRtcConfig,
    forwarders: RwLock<HashMap<String, RtpForwarder>>,
}

impl ForwarderManager {
    pub fn new(
        registry: Arc<CaptureRegistry>,
        launcher: Arc<dyn ProcessLauncher>,
        config: WebRtcConfig,
    ) -> Self {
        Self {
            registry,
            launcher,
            config,
            forwarders: RwLock::new(HashMap::new()),
        }
    }

    /// Fixed STUN server list, passed through verbatim from configuration.
    pub fn stun_servers(&self) -> &[String] {
        &self.config.stun_servers
    }

    /// Get the camera's shared forwarder, starting one when absent, and
    /// count the caller as a viewer.
    pub async fn acquire(&self, camera_id: &str) -> Result<RtpForwarder, StreamError> {
        let mut forwarders = self.forwarders.write().await;

        if let Some(existing) = forwarders.get(camera_id) {
            if existing.is_running().await {
                existing.add_subscriber();
                return Ok(existing.clone());
            }
            existing.stop().await;
            forwarders.remove(camera_id);
        }

        let capturer = self
            .registry
            .get(camera_id)
            .await
            .ok_or_else(|| StreamError::NotFound(camera_id.into()))?;
        if !capturer.is_running().await {
            return Err(StreamError::NotActive(camera_id.into()));
        }

        let forwarder = RtpForwarder::new(capturer.config().clone(), Arc::clone(&self.launcher));
        forwarder.start(&capturer).await?;
        forwarder.add_subscriber();
        forwarders.insert(camera_id.to_string(), forwarder.clone());
        Ok(forwarder)
    }

    /// Drop one viewer. The forwarder is torn down and removed after the
    /// last viewer disconnects. Returns the remaining viewer count.
    pub async fn release(&self, camera_id: &str) -> usize {
        let mut forwarders = self.forwarders.write().await;
        let Some(forwarder) = forwarders.get(camera_id) else {
            return 0;
        };
        let remaining = forwarder.remove_subscriber();
        if remaining == 0 {
            let forwarder = forwarders.remove(camera_id);
            if let Some(forwarder) = forwarder {
                forwarder.stop().await;
            }
        }
        remaining
    }

    pub async fn get(&self, camera_id: &str) -> Option<RtpForwarder> {
        self.forwarders.read().await.get(camera_id).cloned()
    }

    /// Ids of cameras with a running forwarder.
    pub async fn get_all(&self) -> Vec<String> {
        let forwarders = self.forwarders.read().await;
        let mut running = Vec::new();
        for (id, forwarder) in forwarders.iter() {
            if forwarder.is_running().await {
                running.push(id.clone());
            }
        }
        running
    }

    pub async fn stop_all(&self) {
        let drained: Vec<_> = self.forwarders.write().await.drain().collect();
        for (_, forwarder) in drained {
            forwarder.stop().await;
        }
    }
}
