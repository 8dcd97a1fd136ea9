//! HLS segmented output
//!
//! One ffmpeg process per camera turns the MJPEG/PCM broadcast into an
//! H.264 + AAC HLS stream: a rolling window of transport-stream segments
//! plus a fixed playlist path under a deterministic per-camera directory.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{info, warn};

use super::{spawn_exit_watcher, spawn_feeder, Feed, SinkLifecycle, SinkRuntime, SinkStatus};
use crate::capture::{CaptureRegistry, Capturer};
use crate::config::{CameraConfig, HlsConfig};
use crate::error::StreamError;
use crate::process::{PipeDirection, ProcessLauncher, SpawnSpec};

/// Segmented-file sink for one camera.
#[derive(Clone)]
pub struct HlsOutput {
    runtime: Arc<SinkRuntime>,
    config: CameraConfig,
    hls: HlsConfig,
    launcher: Arc<dyn ProcessLauncher>,
}

impl HlsOutput {
    pub fn new(config: CameraConfig, hls: HlsConfig, launcher: Arc<dyn ProcessLauncher>) -> Self {
        Self {
            runtime: Arc::new(SinkRuntime::new(config.id.clone(), "hls")),
            config,
            hls,
            launcher,
        }
    }

    pub fn camera_id(&self) -> &str {
        self.runtime.camera_id()
    }

    /// Directory holding this camera's playlist and segments
    pub fn output_dir(&self) -> PathBuf {
        self.hls.temp_path.join("hls").join(&self.config.id)
    }

    /// Absolute playlist path on disk
    pub fn playlist_path(&self) -> PathBuf {
        self.output_dir().join("index.m3u8")
    }

    /// Playlist locator as served to players
    pub fn playlist_url(&self) -> String {
        format!("/hls/{}/index.m3u8", self.config.id)
    }

    pub async fn is_running(&self) -> bool {
        self.runtime.is_running().await
    }

    pub async fn status(&self) -> SinkStatus {
        if self.runtime.is_running().await {
            SinkStatus {
                running: true,
                endpoint: Some(self.playlist_url()),
            }
        } else {
            SinkStatus::stopped()
        }
    }

    /// Spawn the segmenter and start feeding it. No-op when already
    /// running.
    pub async fn start(&self, capturer: &Capturer) -> Result<(), StreamError> {
        if self.runtime.is_running().await {
            return Ok(());
        }

        let dir = self.output_dir();
        if let Err(e) = tokio::fs::create_dir_all(&dir).await {
            warn!(camera = %self.config.id, error = %e, "failed to create hls directory");
            return Err(StreamError::SpawnFailed(format!(
                "hls output directory: {}",
                e
            )));
        }

        let has_audio = capturer.has_audio();
        let spec = build_hls_spec(&self.config, &self.hls, &dir, has_audio);
        let mut handle = self.launcher.launch(&spec)?;

        let video_writer = match handle.take_writer(0) {
            Some(writer) => writer,
            None => {
                handle.kill();
                return Err(StreamError::SpawnFailed(
                    "hls process has no video pipe".into(),
                ));
            }
        };
        let audio_writer = if has_audio {
            match handle.take_writer(1) {
                Some(writer) => Some(writer),
                None => {
                    handle.kill();
                    return Err(StreamError::SpawnFailed(
                        "hls process has no audio pipe".into(),
                    ));
                }
            }
        } else {
            None
        };

        let cancel = CancellationToken::new();
        let tasks = TaskTracker::new();
        let mut feeds = Vec::new();

        let video_id = format!("hls_video_{}", self.config.id);
        let sub = capturer.subscribe_frames(video_id.clone()).await;
        spawn_feeder(
            &tasks,
            cancel.clone(),
            self.config.id.clone(),
            "hls video",
            sub,
            video_writer,
            false,
        );
        feeds.push(Feed::Frames(video_id));

        if let Some(audio_writer) = audio_writer {
            let audio_id = format!("hls_audio_{}", self.config.id);
            let sub = capturer.subscribe_audio(audio_id.clone()).await;
            spawn_feeder(
                &tasks,
                cancel.clone(),
                self.config.id.clone(),
                "hls audio",
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

        info!(
            camera = %self.config.id,
            playlist = %self.playlist_url(),
            audio = has_audio,
            "hls output started"
        );
        Ok(())
    }

    /// Idempotent teardown of feeders and the segmenter process.
    pub async fn stop(&self) {
        self.runtime.shutdown().await;
    }
}

/// ffmpeg contract for the segmenter: MJPEG on fd 3, PCM on fd 4 (when
/// audio is enabled), H.264 + AAC out as a rolling HLS window.
fn build_hls_spec(
    config: &CameraConfig,
    hls: &HlsConfig,
    dir: &std::path::Path,
    has_audio: bool,
) -> SpawnSpec {
    let segment_duration = if hls.segment_duration > 0 {
        hls.segment_duration
    } else {
        2
    };
    let playlist_length = if hls.playlist_length > 0 {
        hls.playlist_length
    } else {
        5
    };

    let mut spec = SpawnSpec::new("hls", "ffmpeg");
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
        "1500k".into(),
        "-maxrate".into(),
        "2000k".into(),
        "-bufsize".into(),
        "3000k".into(),
        "-g".into(),
        (config.fps * 2).to_string(),
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
        "hls".into(),
        "-hls_time".into(),
        segment_duration.to_string(),
        "-hls_list_size".into(),
        playlist_length.to_string(),
        "-hls_flags".into(),
        "delete_segments+append_list".into(),
        "-hls_segment_filename".into(),
        dir.join("segment_%03d.ts").to_string_lossy().into_owned(),
        dir.join("index.m3u8").to_string_lossy().into_owned(),
    ]);

    spec.args = args;
    spec
}

/// Per-camera registry of HLS outputs: at most one active segmenter per
/// camera; a second start while active is rejected.
pub struct HlsOutputManager {
    registry: Arc<CaptureRegistry>,
    launcher: Arc<dyn ProcessLauncher>,
    hls: HlsConfig,
    outputs: RwLock<HashMap<String, HlsOutput>>,
}

impl HlsOutputManager {
    pub fn new(
        registry: Arc<CaptureRegistry>,
        launcher: Arc<dyn ProcessLauncher>,
        hls: HlsConfig,
    ) -> Self {
        Self {
            registry,
            launcher,
            hls,
            outputs: RwLock::new(HashMap::new()),
        }
    }

    /// Root under which all per-camera playlists live
    pub fn output_path(&self) -> PathBuf {
        self.hls.temp_path.join("hls")
    }

    pub async fn start_output(&self, camera_id: &str) -> Result<(), StreamError> {
        let mut outputs = self.outputs.write().await;

        if let Some(existing) = outputs.get(camera_id) {
            if existing.is_running().await {
                return Err(StreamError::AlreadyActive(camera_id.into()));
            }
            existing.stop().await;
            outputs.remove(camera_id);
        }

        let capturer = self
            .registry
            .get(camera_id)
            .await
            .ok_or_else(|| StreamError::NotFound(camera_id.into()))?;
        if !capturer.is_running().await {
            return Err(StreamError::NotActive(camera_id.into()));
        }

        let output = HlsOutput::new(
            capturer.config().clone(),
            self.hls.clone(),
            Arc::clone(&self.launcher),
        );
        output.start(&capturer).await?;
        outputs.insert(camera_id.to_string(), output);
        Ok(())
    }

    /// Stop the segmenter for `camera_id` and remove it. Idempotent.
    pub async fn stop_output(&self, camera_id: &str) {
        let removed = self.outputs.write().await.remove(camera_id);
        if let Some(output) = removed {
            output.stop().await;
        }
    }

    pub async fn status(&self, camera_id: &str) -> SinkStatus {
        match self.outputs.read().await.get(camera_id) {
            Some(output) => output.status().await,
            None => SinkStatus::stopped(),
        }
    }

    /// Running outputs as camera id to playlist locator.
    pub async fn get_all(&self) -> HashMap<String, String> {
        let outputs = self.outputs.read().await;
        let mut all = HashMap::new();
        for (id, output) in outputs.iter() {
            if output.is_running().await {
                all.insert(id.clone(), output.playlist_url());
            }
        }
        all
    }

    pub async fn stop_all(&self) {
        let drained: Vec<_> = self.outputs.write().await.drain().collect();
        for (_, output) in drained {
            output.stop().await;
        }
    }
}
