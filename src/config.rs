//! Configuration types for cameras, recording, and output protocols
//!
//! These are plain data supplied once at startup by the embedding binary
//! (which owns file/env loading). Every struct derives `Deserialize` and
//! carries sensible defaults so partial configs work.

use serde::Deserialize;
use std::path::PathBuf;

/// Where a camera's media comes from
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SourceKind {
    /// Local capture device (v4l2/avfoundation/dshow), by device index
    Usb { device_index: u32 },
    /// RTSP network camera
    Rtsp { url: String },
    /// HLS/m3u8 network stream
    Hls { url: String },
}

impl Default for SourceKind {
    fn default() -> Self {
        SourceKind::Usb { device_index: 0 }
    }
}

/// Audio input settings for a camera
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AudioSource {
    pub enabled: bool,
    /// Input backend: "alsa" or "pulse" (Linux); ignored elsewhere
    pub backend: String,
    pub device_index: u32,
    pub sample_rate: u32,
    pub channels: u8,
}

impl Default for AudioSource {
    fn default() -> Self {
        Self {
            enabled: false,
            backend: "alsa".into(),
            device_index: 0,
            sample_rate: 44100,
            channels: 2,
        }
    }
}

/// One camera: identity, input locator, and geometry
#[derive(Debug, Clone, Deserialize)]
pub struct CameraConfig {
    pub id: String,
    pub name: String,
    #[serde(flatten)]
    pub source: SourceKind,
    #[serde(default = "default_width")]
    pub width: u32,
    #[serde(default = "default_height")]
    pub height: u32,
    #[serde(default = "default_fps")]
    pub fps: u32,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub audio: AudioSource,
}

fn default_width() -> u32 {
    1280
}
fn default_height() -> u32 {
    720
}
fn default_fps() -> u32 {
    30
}
fn default_enabled() -> bool {
    true
}

impl CameraConfig {
    /// Convenience constructor for a local device camera
    pub fn usb(id: impl Into<String>, name: impl Into<String>, device_index: u32) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            source: SourceKind::Usb { device_index },
            width: default_width(),
            height: default_height(),
            fps: default_fps(),
            enabled: true,
            audio: AudioSource::default(),
        }
    }

    /// Convenience constructor for an RTSP camera
    pub fn rtsp(id: impl Into<String>, name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            source: SourceKind::Rtsp { url: url.into() },
            width: default_width(),
            height: default_height(),
            fps: default_fps(),
            enabled: true,
            audio: AudioSource::default(),
        }
    }

    /// Enable audio capture on this camera
    pub fn with_audio(mut self) -> Self {
        self.audio.enabled = true;
        self
    }
}

/// Recording branch settings for a capture process
///
/// When supplied, the same capture process additionally writes segmented
/// recording files under `output_path/<camera_id>/`. Enumeration and
/// retention of those files is a collaborator concern.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RecordingPolicy {
    pub output_path: PathBuf,
    /// Segment length, flexible syntax: "300", "5m", "1h30m", "1d"
    pub segment_duration: String,
    /// Container format for segments
    pub format: String,
}

impl Default for RecordingPolicy {
    fn default() -> Self {
        Self {
            output_path: PathBuf::from("./recordings"),
            segment_duration: "5m".into(),
            format: "mp4".into(),
        }
    }
}

impl RecordingPolicy {
    /// Segment duration in seconds, falling back to 5 minutes on bad input
    pub fn segment_duration_secs(&self) -> u64 {
        match parse_duration(&self.segment_duration) {
            Ok(secs) if secs > 0 => secs,
            _ => 300,
        }
    }
}

/// HLS segmenter settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HlsConfig {
    /// Target segment length in seconds
    pub segment_duration: u32,
    /// Number of segments kept in the rolling playlist
    pub playlist_length: u32,
    /// Root for generated playlists and segments
    pub temp_path: PathBuf,
}

impl Default for HlsConfig {
    fn default() -> Self {
        Self {
            segment_duration: 2,
            playlist_length: 5,
            temp_path: PathBuf::from("./temp"),
        }
    }
}

/// WebRTC preview settings
///
/// The STUN server list is passed through verbatim to the signaling
/// collaborator; this crate performs no NAT traversal itself.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WebRtcConfig {
    pub enabled: bool,
    pub stun_servers: Vec<String>,
}

impl Default for WebRtcConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            stun_servers: vec![
                "stun:stun.l.google.com:19302".into(),
                "stun:stun1.l.google.com:19302".into(),
            ],
        }
    }
}

/// Parse a duration string into seconds.
///
/// Accepts a bare number of seconds ("300"), day suffix ("7d"), or
/// hour/minute/second compounds ("5m", "1h30m", "90s").
pub fn parse_duration(s: &str) -> Result<u64, String> {
    let s = s.trim();
    if s.is_empty() {
        return Ok(0);
    }
    if let Ok(secs) = s.parse::<u64>() {
        return Ok(secs);
    }
    if let Some(days) = s.strip_suffix('d') {
        if let Ok(days) = days.parse::<u64>() {
            return Ok(days * 86_400);
        }
    }

    // Compound form: sequence of <number><h|m|s> groups
    let mut total: u64 = 0;
    let mut digits = String::new();
    let mut matched = false;
    for ch in s.chars() {
        if ch.is_ascii_digit() {
            digits.push(ch);
            continue;
        }
        let value: u64 = digits
            .parse()
            .map_err(|_| format!("invalid duration: {}", s))?;
        digits.clear();
        total += match ch {
            'h' => value * 3600,
            'm' => value * 60,
            's' => value,
            _ => return Err(format!("invalid duration: {}", s)),
        };
        matched = true;
    }
    if !digits.is_empty() || !matched {
        return Err(format!("invalid duration: {}", s));
    }
    Ok(total)
}
