//! Yagura - Multi-protocol camera capture and streaming engine
//!
//! This crate provides the capture-and-broadcast core of a camera server:
//! - Capture: one external ffmpeg process per camera, demuxed into MJPEG
//!   frames and PCM audio blocks
//! - Hub: bounded drop-oldest fan-out to any number of subscribers
//! - Sinks: RTMP push and HLS segmented output, one transcoder each
//! - WebRTC: per-camera RTP bridge feeding shared VP8/Opus media tracks
//!
//! # Architecture
//!
//! ```text
//! capture process ─► Capturer demux ─► BroadcastHub ─┬─► preview consumers
//!                                                    ├─► RtmpStreamer ─► push target
//!                                                    ├─► HlsOutput    ─► segment files
//!                                                    └─► RtpForwarder ─► media tracks
//! ```
//!
//! Configuration loading, HTTP routing, recording retention, and WebRTC
//! signaling are collaborator concerns; this crate exposes the interfaces
//! they drive ([`Capturer`], [`CaptureRegistry`], the sink managers) and
//! nothing else.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use yagura::{CameraConfig, CaptureRegistry, FfmpegLauncher, RtmpManager};
//!
//! let launcher = Arc::new(FfmpegLauncher);
//! let registry = Arc::new(CaptureRegistry::new(launcher.clone()));
//! registry.add(CameraConfig::rtsp("cam1", "Front door", "rtsp://...")).await?;
//! registry.start_all().await?;
//!
//! let rtmp = RtmpManager::new(registry.clone(), launcher);
//! rtmp.start_stream("cam1", "rtmp://live.example/app/key").await?;
//! ```

// Configuration and error types
pub mod config;
pub mod error;

// Fan-out primitive
pub mod hub;

// Subprocess and pipe seam
pub mod process;

// Capture engine
pub mod capture;

// Protocol sinks
pub mod sink;

// Real-time-peer bridge
pub mod webrtc;

// ============================================================================
// Re-exports for convenience
// ============================================================================

pub use config::{
    AudioSource, CameraConfig, HlsConfig, RecordingPolicy, SourceKind, WebRtcConfig,
};
pub use error::StreamError;

pub use hub::{BroadcastHub, MediaQueue, Subscription};

pub use process::{
    FfmpegLauncher, PipeDirection, PipeReader, PipeWriter, ProcessHandle, ProcessLauncher,
    SpawnSpec,
};

pub use capture::{CaptureRegistry, Capturer, AUDIO_BLOCK_BYTES};

pub use sink::{HlsOutput, HlsOutputManager, RtmpManager, RtmpStreamer, SinkStatus};

pub use webrtc::{ForwarderManager, LocalRtpTrack, RtpForwarder, RtpHeader, TrackCodec};
