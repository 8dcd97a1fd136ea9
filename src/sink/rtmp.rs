//! RTMP push streaming
//!
//! One ffmpeg process per camera muxes the MJPEG frame broadcast and the
//! PCM audio broadcast into H.264 + AAC FLV and pushes it to a remote RTMP
//! URL. An unreachable or failing target surfaces only as the process
//! exiting, which the exit watcher turns into a stopped sink.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::info;

use super::{spawn_exit_watcher, spawn_feeder, Feed, SinkLifecycle, SinkRuntime, SinkStatus};
use crate::capture::{CaptureRegistry, Capturer};
use crate::config::CameraConfig;
use crate::error::StreamError;
use crate::process::{PipeDirection, ProcessLauncher, SpawnSpec};

/// Push-stream sink for one camera.
#[derive(Clone)]
pub struct RtmpStreamer {
    runtime: Arc<SinkRuntime>,
    config: CameraConfig,
    url: String,
    launcher: Arc<dyn ProcessLauncher>,
}

impl RtmpStreamer {
    pub fn new(config: CameraConfig, url: String, launcher: Arc<dyn ProcessLauncher>) -> Self {
        Self {
            runtime: Arc::new(SinkRuntime::new(config.id.clone(), "rtmp")),
            config,
            url,
            launcher,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn camera_id(&self) -> &str {
        self.runtime.camera_id()
    }

    pub async fn is_running(&self) -> bool {
        self.runtime.is_running().await
    }

    pub async fn status(&self) -> SinkStatus {
        if self.runtime.is_running().await {
            SinkStatus {
                running: true,
                endpoint: Some(self.url.clone()),
            }
        } else {
            SinkStatus::stopped()
        }
    }

    /// Spawn the push process and start feeding it. No-op when already
    /// running. Returns as soon as the spawn succeeds; reachability of the
    /// push target is not awaited.
    pub async fn start(&self, capturer: &Capturer) -> Result<(), StreamError> {
        if self.runtime.is_running().await {
            return Ok(());
        }

        let has_audio = capturer.has_audio();
        let spec = build_push_spec(&self.config, &self.url, has_audio);
        let mut handle = self.launcher.launch(&spec)?;

        let video_writer = match handle.take_writer(0) {
            Some(writer) => writer,
            None => {
                handle.kill();
                return Err(StreamError::SpawnFailed(
                    "push process has no video pipe".into(),
                ));
            }
        };

        let audio_writer = if has_audio {
            match handle.take_writer(1) {
                Some(writer) => Some(writer),
                None => {
                    handle.kill();
                    return Err(StreamError::SpawnFailed(
                        "push process has no audio pipe".into(),
                    ));
                }
            }
        } else {
            None
        };

        let cancel = CancellationToken::new();
        let tasks = TaskTracker::new();
        let mut feeds = Vec::new();

        let video_id = format!("rtmp_video_{}", self.config.id);
        let sub = capturer.subscribe_frames(video_id.clone()).await;
        spawn_feeder(
            &tasks,
            cancel.clone(),
            self.config.id.clone(),
            "rtmp video",
            sub,
            video_writer,
            false,
        );
        feeds.push(Feed::Frames(video_id));

        if let Some(audio_writer) = audio_writer {
            let audio_id = format!("rtmp_audio_{}", self.config.id);
            let sub = capturer.subscribe_audio(audio_id.clone()).await;
            spawn_feeder(
                &tasks,
                cancel.clone(),
                self.config.id.clone(),
                "rtmp audio",
                sub,
                audio_writer,
                false,
            );
            feeds.push(Feed::Audio(audio_id));
        }

        spawn_exit_watcher(&self.runtime, &tasks, handle.exit_watch(), cancel.clone());

        self.runtime
            .activate(
                handle,
                SinkLifecycle {
                    cancel,
                    tasks,
                    feeds,
                    capturer: capturer.clone(),
                },
            )
            .await;

        info!(camera = %self.config.id, url = %self.url, audio = has_audio, "rtmp push started");
        Ok(())
    }

    /// Idempotent teardown of feeders and the push process.
    pub async fn stop(&self) {
        self.runtime.shutdown().await;
    }
}

/// ffmpeg contract for the push muxer: MJPEG on fd 3, PCM on fd 4 (when
/// the source has audio), H.264 + AAC out to the RTMP URL as FLV.
fn build_push_spec(config: &CameraConfig, url: &str, has_audio: bool) -> SpawnSpec {
    let mut spec = SpawnSpec::new("rtmp", "ffmpeg");
    let mut args: Vec<String> = vec!["-hide_banner".into(), "-loglevel".into(), "warning".into()];

    args.extend([
        "-f".into(),
        "mjpeg".into(),
        "-framerate".into(),
        config.fps.to_string(),
        "-i".into(),
        "pipe:3".into(),
    ]);
    spec.pipes.push(PipeDirection::Input);

    if has_audio {
        args.extend([
            "-f".into(),
            "s16le".into(),
            "-ar".into(),
            "48000".into(),
            "-ac".into(),
            "1".into(),
            "-i".into(),
            "pipe:4".into(),
        ]);
        spec.pipes.push(PipeDirection::Input);
    }

    args.extend([
        "-c:v".into(),
        "libx264".into(),
        "-preset".into(),
        "ultrafast".into(),
        "-tune".into(),
        "zerolatency".into(),
        "-profile:v".into(),
        "baseline".into(),
        "-level".into(),
        "3.1".into(),
        "-b:v".into(),
        "2000k".into(),
        "-maxrate".into(),
        "2500k".into(),
        "-bufsize".into(),
        "4000k".into(),
        "-g".into(),
        (config.fps * 2).to_string(),
        "-keyint_min".into(),
        config.fps.to_string(),
        "-sc_threshold".into(),
        "0".into(),
        "-pix_fmt".into(),
        "yuv420p".into(),
    ]);

    if has_audio {
        args.extend([
            "-c:a".into(),
            "aac".into(),
            "-b:a".into(),
            "128k".into(),
            "-ar".into(),
            "44100".into(),
        ]);
    } else {
        args.push("-an".into());
    }

    args.extend([
        "-f".into(),
        "flv".into(),
        "-flvflags".into(),
        "no_duration_filesize".into(),
        url.to_string(),
    ]);

    spec.args = args;
    spec
}

/// Per-camera registry of push streamers: at most one active push per
/// camera; a second start while active is rejected.
pub struct RtmpManager {
    registry: Arc<CaptureRegistry>,
    launcher: Arc<dyn ProcessLauncher>,
    streamers: RwLock<HashMap<String, RtmpStreamer>>,
}

impl RtmpManager {
    pub fn new(registry: Arc<CaptureRegistry>, launcher: Arc<dyn ProcessLauncher>) -> Self {
        Self {
            registry,
            launcher,
            streamers: RwLock::new(HashMap::new()),
        }
    }

    /// Start pushing `camera_id` to `rtmp_url`.
    pub async fn start_stream(
        &self,
        camera_id: &str,
        rtmp_url: impl Into<String>,
    ) -> Result<(), StreamError> {
        let mut streamers = self.streamers.write().await;

        if let Some(existing) = streamers.get(camera_id) {
            if existing.is_running().await {
                return Err(StreamError::AlreadyActive(camera_id.into()));
            }
            // The process died on its own; clear the stale entry
            existing.stop().await;
            streamers.remove(camera_id);
        }

        let capturer = self
            .registry
            .get(camera_id)
            .await
            .ok_or_else(|| StreamError::NotFound(camera_id.into()))?;
        if !capturer.is_running().await {
            return Err(StreamError::NotActive(camera_id.into()));
        }

        let streamer = RtmpStreamer::new(
            capturer.config().clone(),
            rtmp_url.into(),
            Arc::clone(&self.launcher),
        );
        streamer.start(&capturer).await?;
        streamers.insert(camera_id.to_string(), streamer);
        Ok(())
    }

    /// Stop the push for `camera_id` and remove it. Idempotent.
    pub async fn stop_stream(&self, camera_id: &str) {
        let removed = self.streamers.write().await.remove(camera_id);
        if let Some(streamer) = removed {
            streamer.stop().await;
        }
    }

    pub async fn status(&self, camera_id: &str) -> SinkStatus {
        match self.streamers.read().await.get(camera_id) {
            Some(streamer) => streamer.status().await,
            None => SinkStatus::stopped(),
        }
    }

    /// Running pushes as camera id to push URL.
    pub async fn get_all(&self) -> HashMap<String, String> {
        let streamers = self.streamers.read().await;
        let mut all = HashMap::new();
        for (id, streamer) in streamers.iter() {
            if streamer.is_running().await {
                all.insert(id.clone(), streamer.url().to_string());
            }
        }
        all
    }

    pub async fn stop_all(&self) {
        let drained: Vec<_> = self.streamers.write().await.drain().collect();
        for (_, streamer) in drained {
            streamer.stop().await;
        }
    }
}
