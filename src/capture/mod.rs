//! Camera capture: one external process per source
//!
//! Each [`Capturer`] owns a single ffmpeg process that emits an MJPEG
//! preview stream and, when audio is enabled, a raw PCM stream on separate
//! pipes. Both streams are demuxed into discrete buffers and fanned out
//! through per-media [`BroadcastHub`]s. A recording policy adds a
//! segmented-file branch to the same process; those files belong to the
//! storage collaborator and are never read here.

pub mod demux;

use bytes::Bytes;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::sync::{Mutex, RwLock};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::config::{CameraConfig, RecordingPolicy, SourceKind};
use crate::error::StreamError;
use crate::hub::{BroadcastHub, Subscription};
use crate::process::{PipeDirection, PipeReader, ProcessHandle, ProcessLauncher, SpawnSpec};
use demux::FrameScanner;

/// Queue depth for frame subscribers (~1s at 30fps)
const FRAME_QUEUE_CAPACITY: usize = 30;
/// Queue depth for audio subscribers (100 blocks of 20ms, ~2s)
const AUDIO_QUEUE_CAPACITY: usize = 100;
/// One PCM block: 960 samples * 2 bytes * 1 channel = 20ms at 48kHz mono
pub const AUDIO_BLOCK_BYTES: usize = 1920;
/// Wait window for an on-demand snapshot
const SNAPSHOT_TIMEOUT: Duration = Duration::from_secs(3);
/// Grace for the capture process to exit after a terminate request
const TERMINATE_GRACE: Duration = Duration::from_secs(1);
/// Grace for demux tasks to wind down after cancellation
const TASK_STOP_GRACE: Duration = Duration::from_secs(5);
/// Working-buffer ceiling for the MJPEG demux
const MAX_DEMUX_BUFFER: usize = 2 * 1024 * 1024;
/// Tail kept when the ceiling is crossed
const DEMUX_KEEP_TAIL: usize = 1024 * 1024;
const READ_CHUNK: usize = 64 * 1024;

/// Extra pipe index carrying the MJPEG preview stream (child fd 3)
const VIDEO_PIPE: usize = 0;
/// Extra pipe index carrying PCM audio (child fd 4)
const AUDIO_PIPE: usize = 1;

struct Lifecycle {
    cancel: CancellationToken,
    tasks: TaskTracker,
}

struct CapturerInner {
    config: CameraConfig,
    recording: Option<RecordingPolicy>,
    launcher: Arc<dyn ProcessLauncher>,
    running: RwLock<bool>,
    /// Guarded separately from `running` so a slow kill never blocks
    /// status queries.
    process: Mutex<Option<Box<dyn ProcessHandle>>>,
    frames: BroadcastHub,
    audio: BroadcastHub,
    /// Guarded separately from the subscriber tables so snapshot reads
    /// never contend with broadcast.
    last_frame: RwLock<Option<Bytes>>,
    lifecycle: Mutex<Option<Lifecycle>>,
    snapshot_seq: AtomicU64,
}

/// Runtime unit owning one external capture process and its fan-out.
///
/// Cheap to clone; all clones share the same capture state.
#[derive(Clone)]
pub struct Capturer {
    inner: Arc<CapturerInner>,
}

impl Capturer {
    pub fn new(
        config: CameraConfig,
        recording: Option<RecordingPolicy>,
        launcher: Arc<dyn ProcessLauncher>,
    ) -> Self {
        Self {
            inner: Arc::new(CapturerInner {
                config,
                recording,
                launcher,
                running: RwLock::new(false),
                process: Mutex::new(None),
                frames: BroadcastHub::new("frames", FRAME_QUEUE_CAPACITY),
                audio: BroadcastHub::new("audio", AUDIO_QUEUE_CAPACITY),
                last_frame: RwLock::new(None),
                lifecycle: Mutex::new(None),
                snapshot_seq: AtomicU64::new(0),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.config.id
    }

    pub fn name(&self) -> &str {
        &self.inner.config.name
    }

    pub fn config(&self) -> &CameraConfig {
        &self.inner.config
    }

    pub fn has_audio(&self) -> bool {
        self.inner.config.audio.enabled
    }

    pub async fn is_running(&self) -> bool {
        *self.inner.running.read().await
    }

    /// Start the capture process. No-op when already running.
    pub async fn start(&self) -> Result<(), StreamError> {
        let mut running = self.inner.running.write().await;
        if *running {
            return Ok(());
        }

        if let Some(recording) = &self.inner.recording {
            let dir = recording.output_path.join(&self.inner.config.id);
            if let Err(e) = tokio::fs::create_dir_all(&dir).await {
                warn!(camera = %self.inner.config.id, error = %e, "failed to create recording directory");
            }
        }

        let spec = build_capture_spec(&self.inner.config, self.inner.recording.as_ref());
        let mut handle = self.inner.launcher.launch(&spec)?;

        let video = match handle.take_reader(VIDEO_PIPE) {
            Some(video) => video,
            None => {
                handle.kill();
                return Err(StreamError::SpawnFailed(
                    "capture process has no video pipe".into(),
                ));
            }
        };
        let audio = if self.has_audio() {
            handle.take_reader(AUDIO_PIPE)
        } else {
            None
        };

        let cancel = CancellationToken::new();
        let tasks = TaskTracker::new();

        tasks.spawn(run_video_demux(
            Arc::clone(&self.inner),
            video,
            cancel.clone(),
        ));
        if let Some(audio) = audio {
            tasks.spawn(run_audio_demux(
                Arc::clone(&self.inner),
                audio,
                cancel.clone(),
            ));
        }
        tasks.spawn(watch_capture_exit(
            Arc::clone(&self.inner),
            handle.exit_watch(),
            cancel.clone(),
        ));

        *self.inner.process.lock().await = Some(handle);
        *self.inner.lifecycle.lock().await = Some(Lifecycle { cancel, tasks });
        *running = true;

        info!(
            camera = %self.inner.config.id,
            name = %self.inner.config.name,
            audio = self.has_audio(),
            recording = self.inner.recording.is_some(),
            "capturer started"
        );
        Ok(())
    }

    /// Stop the capture process and close every subscriber queue.
    ///
    /// Idempotent. Completes within a bounded grace period even when a
    /// demux loop is stalled on a read that never returns.
    pub async fn stop(&self) {
        let was_running = {
            let mut running = self.inner.running.write().await;
            std::mem::replace(&mut *running, false)
        };
        let lifecycle = self.inner.lifecycle.lock().await.take();
        let handle = self.inner.process.lock().await.take();

        if !was_running && lifecycle.is_none() && handle.is_none() {
            return;
        }

        if let Some(lifecycle) = &lifecycle {
            lifecycle.cancel.cancel();
        }

        if let Some(handle) = handle {
            handle.terminate();
            let mut exit = handle.exit_watch();
            if timeout(TERMINATE_GRACE, exit.wait_for(|code| code.is_some()))
                .await
                .is_err()
            {
                warn!(camera = %self.inner.config.id, "capture process ignored terminate, killing");
                handle.kill();
            }
        }

        if let Some(lifecycle) = lifecycle {
            lifecycle.tasks.close();
            if timeout(TASK_STOP_GRACE, lifecycle.tasks.wait()).await.is_err() {
                warn!(camera = %self.inner.config.id, "demux tasks still blocked after grace period");
            }
        }

        self.inner.frames.close_all().await;
        self.inner.audio.close_all().await;

        info!(camera = %self.inner.config.id, "capturer stopped");
    }

    /// Current frame: the cached last frame when present, otherwise the
    /// next broadcast frame within a bounded wait.
    pub async fn get_frame(&self) -> Result<Bytes, StreamError> {
        if !self.is_running().await {
            return Err(StreamError::NotActive(self.inner.config.id.clone()));
        }

        if let Some(frame) = self.inner.last_frame.read().await.clone() {
            return Ok(frame);
        }

        let sub_id = format!(
            "snapshot_{}",
            self.inner.snapshot_seq.fetch_add(1, Ordering::Relaxed)
        );
        let mut sub = self.inner.frames.subscribe(sub_id.clone()).await;
        let result = timeout(SNAPSHOT_TIMEOUT, sub.recv()).await;
        self.inner.frames.unsubscribe(&sub_id).await;

        match result {
            Ok(Some(frame)) => Ok(frame),
            Ok(None) => Err(StreamError::Closed),
            Err(_) => Err(StreamError::Timeout),
        }
    }

    pub async fn subscribe_frames(&self, id: impl Into<String>) -> Subscription {
        self.inner.frames.subscribe(id).await
    }

    pub async fn unsubscribe_frames(&self, id: &str) {
        self.inner.frames.unsubscribe(id).await;
    }

    pub async fn subscribe_audio(&self, id: impl Into<String>) -> Subscription {
        self.inner.audio.subscribe(id).await
    }

    pub async fn unsubscribe_audio(&self, id: &str) {
        self.inner.audio.unsubscribe(id).await;
    }

    pub async fn frame_subscriber_count(&self) -> usize {
        self.inner.frames.subscriber_count().await
    }

    pub async fn audio_subscriber_count(&self) -> usize {
        self.inner.audio.subscriber_count().await
    }
}

async fn run_video_demux(
    inner: Arc<CapturerInner>,
    mut reader: PipeReader,
    cancel: CancellationToken,
) {
    let mut scanner = FrameScanner::new(MAX_DEMUX_BUFFER, DEMUX_KEEP_TAIL);
    let mut chunk = vec![0u8; READ_CHUNK];
    let mut frame_count: u64 = 0;

    loop {
        let n = tokio::select! {
            _ = cancel.cancelled() => break,
            res = reader.read(&mut chunk) => match res {
                Ok(0) => {
                    debug!(camera = %inner.config.id, "video stream ended");
                    break;
                }
                Ok(n) => n,
                Err(e) => {
                    if !cancel.is_cancelled() {
                        warn!(camera = %inner.config.id, error = %e, "video stream read failed");
                    }
                    break;
                }
            },
        };

        for frame in scanner.push(&chunk[..n]) {
            *inner.last_frame.write().await = Some(frame.clone());
            inner.frames.publish(frame).await;

            frame_count += 1;
            if frame_count == 1 || frame_count % 300 == 0 {
                debug!(camera = %inner.config.id, frames = frame_count, "video demux progress");
            }
        }
    }
}

async fn run_audio_demux(
    inner: Arc<CapturerInner>,
    mut reader: PipeReader,
    cancel: CancellationToken,
) {
    let mut block = vec![0u8; AUDIO_BLOCK_BYTES];
    let mut block_count: u64 = 0;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            res = reader.read_exact(&mut block) => match res {
                Ok(_) => {
                    inner.audio.publish(Bytes::copy_from_slice(&block)).await;
                    block_count += 1;
                    if block_count == 1 || block_count % 500 == 0 {
                        debug!(camera = %inner.config.id, blocks = block_count, "audio demux progress");
                    }
                }
                // A short final read is discarded along with the stream
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                    debug!(camera = %inner.config.id, "audio stream ended");
                    break;
                }
                Err(e) => {
                    if !cancel.is_cancelled() {
                        warn!(camera = %inner.config.id, error = %e, "audio stream read failed");
                    }
                    break;
                }
            },
        }
    }
}

async fn watch_capture_exit(
    inner: Arc<CapturerInner>,
    mut exit: tokio::sync::watch::Receiver<Option<i32>>,
    cancel: CancellationToken,
) {
    let code = tokio::select! {
        _ = cancel.cancelled() => return,
        res = exit.wait_for(|code| code.is_some()) => {
            res.ok().and_then(|guard| *guard).unwrap_or(-1)
        }
    };
    warn!(camera = %inner.config.id, code, "capture process exited");
    *inner.running.write().await = false;
}

/// Build the spawn spec for one capture process: input per source kind,
/// MJPEG preview on fd 3, PCM on fd 4 when audio is enabled, plus the
/// segmented recording branch when a policy is supplied.
fn build_capture_spec(config: &CameraConfig, recording: Option<&RecordingPolicy>) -> SpawnSpec {
    let mut spec = SpawnSpec::new("capture", "ffmpeg");
    let mut args: Vec<String> = vec!["-hide_banner".into(), "-loglevel".into(), "warning".into()];

    match &config.source {
        SourceKind::Rtsp { url } => {
            args.extend([
                "-rtsp_transport".into(),
                "tcp".into(),
                "-i".into(),
                url.clone(),
            ]);
        }
        SourceKind::Hls { url } => {
            args.extend([
                "-reconnect".into(),
                "1".into(),
                "-reconnect_streamed".into(),
                "1".into(),
                "-reconnect_delay_max".into(),
                "5".into(),
                "-i".into(),
                url.clone(),
            ]);
        }
        SourceKind::Usb { device_index } => {
            args.extend(device_input_args(config, *device_index));
        }
    }

    // Output 1: MJPEG preview stream on fd 3
    args.extend([
        "-map".into(),
        "0:v".into(),
        "-an".into(),
        "-f".into(),
        "mjpeg".into(),
        "-q:v".into(),
        "5".into(),
        "-r".into(),
        config.fps.to_string(),
        "-s".into(),
        format!("{}x{}", config.width, config.height),
        "pipe:3".into(),
    ]);
    spec.pipes.push(PipeDirection::Output);

    // Output 2: PCM s16le 48kHz mono on fd 4
    if config.audio.enabled {
        args.extend([
            "-map".into(),
            "0:a".into(),
            "-vn".into(),
            "-f".into(),
            "s16le".into(),
            "-acodec".into(),
            "pcm_s16le".into(),
            "-ar".into(),
            "48000".into(),
            "-ac".into(),
            "1".into(),
            "pipe:4".into(),
        ]);
        spec.pipes.push(PipeDirection::Output);
    }

    // Output 3: segmented recording branch
    if let Some(recording) = recording {
        let pattern = recording
            .output_path
            .join(&config.id)
            .join(format!("{}_%Y%m%d_%H%M%S.{}", config.id, recording.format));

        args.extend(["-map".into(), "0:v".into()]);
        if config.audio.enabled {
            args.extend(["-map".into(), "0:a".into()]);
        }
        args.extend([
            "-c:v".into(),
            "libx264".into(),
            "-pix_fmt".into(),
            "yuv420p".into(),
            "-preset".into(),
            "ultrafast".into(),
            "-crf".into(),
            "23".into(),
            "-g".into(),
            "60".into(),
        ]);
        if config.audio.enabled {
            args.extend(["-c:a".into(), "aac".into(), "-b:a".into(), "128k".into()]);
        } else {
            args.push("-an".into());
        }
        args.extend([
            "-f".into(),
            "segment".into(),
            "-segment_time".into(),
            recording.segment_duration_secs().to_string(),
            "-segment_format".into(),
            recording.format.clone(),
            // Fragmented MP4 keeps already-written segments playable after
            // an unclean shutdown
            "-segment_format_options".into(),
            "movflags=frag_keyframe+empty_moov+default_base_moof".into(),
            "-reset_timestamps".into(),
            "1".into(),
            "-strftime".into(),
            "1".into(),
            pattern.to_string_lossy().into_owned(),
        ]);
    }

    spec.args = args;
    spec
}

/// Local device input arguments per platform.
fn device_input_args(config: &CameraConfig, device_index: u32) -> Vec<String> {
    match std::env::consts::OS {
        "macos" => {
            let input = if config.audio.enabled {
                format!("{}:{}", device_index, config.audio.device_index)
            } else {
                format!("{}:none", device_index)
            };
            vec![
                "-f".into(),
                "avfoundation".into(),
                "-framerate".into(),
                config.fps.to_string(),
                "-video_size".into(),
                format!("{}x{}", config.width, config.height),
                "-i".into(),
                input,
            ]
        }
        "linux" => {
            let mut args = vec![
                "-f".into(),
                "v4l2".into(),
                "-framerate".into(),
                config.fps.to_string(),
                "-video_size".into(),
                format!("{}x{}", config.width, config.height),
                "-i".into(),
                format!("/dev/video{}", device_index),
            ];
            if config.audio.enabled {
                if config.audio.backend == "pulse" {
                    args.extend(["-f".into(), "pulse".into(), "-i".into(), "default".into()]);
                } else {
                    args.extend([
                        "-f".into(),
                        "alsa".into(),
                        "-i".into(),
                        format!("hw:{}", config.audio.device_index),
                    ]);
                }
            }
            args
        }
        _ => vec![
            "-f".into(),
            "v4l2".into(),
            "-i".into(),
            format!("/dev/video{}", device_index),
        ],
    }
}

/// Keyed collection of capturers with bulk lifecycle operations.
pub struct CaptureRegistry {
    launcher: Arc<dyn ProcessLauncher>,
    capturers: RwLock<HashMap<String, Capturer>>,
}

impl CaptureRegistry {
    pub fn new(launcher: Arc<dyn ProcessLauncher>) -> Self {
        Self {
            launcher,
            capturers: RwLock::new(HashMap::new()),
        }
    }

    /// Register a capturer for `config`. Fails if the id is taken.
    pub async fn add(&self, config: CameraConfig) -> Result<Capturer, StreamError> {
        self.add_with_recording(config, None).await
    }

    /// Register a capturer whose process also writes a recording branch.
    pub async fn add_with_recording(
        &self,
        config: CameraConfig,
        recording: Option<RecordingPolicy>,
    ) -> Result<Capturer, StreamError> {
        let mut capturers = self.capturers.write().await;
        if capturers.contains_key(&config.id) {
            return Err(StreamError::AlreadyExists(config.id));
        }
        let id = config.id.clone();
        let name = config.name.clone();
        let capturer = Capturer::new(config, recording, Arc::clone(&self.launcher));
        capturers.insert(id.clone(), capturer.clone());
        info!(camera = %id, name = %name, "capturer registered");
        Ok(capturer)
    }

    pub async fn get(&self, id: &str) -> Option<Capturer> {
        self.capturers.read().await.get(id).cloned()
    }

    pub async fn get_all(&self) -> Vec<Capturer> {
        self.capturers.read().await.values().cloned().collect()
    }

    /// Start every registered capturer, failing fast on the first error.
    pub async fn start_all(&self) -> Result<(), StreamError> {
        for capturer in self.get_all().await {
            capturer.start().await?;
        }
        Ok(())
    }

    /// Stop every registered capturer, best-effort across all entries.
    pub async fn stop_all(&self) {
        for capturer in self.get_all().await {
            capturer.stop().await;
        }
    }
}
