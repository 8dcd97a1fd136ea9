//! Shared RTP media tracks
//!
//! A [`LocalRtpTrack`] is the long-lived handoff point between the RTP
//! bridge and the peer-connection collaborator: the bridge writes raw RTP
//! datagrams in, the signaling layer subscribes one receiver per viewer.
//! Fan-out uses a broadcast channel, so a lagging viewer loses oldest
//! packets without affecting anyone else.

use bytes::Bytes;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::broadcast;

/// Minimum RTP header length (no CSRCs, no extension)
pub const RTP_HEADER_LEN: usize = 12;

/// Packets buffered per track before a slow viewer starts losing them
const TRACK_BUFFER: usize = 512;

/// Parsed RTP fixed header, used to validate datagrams before forwarding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RtpHeader {
    pub version: u8,
    pub padding: bool,
    pub marker: bool,
    pub payload_type: u8,
    pub sequence_number: u16,
    pub timestamp: u32,
    pub ssrc: u32,
}

impl RtpHeader {
    /// Parse and validate the fixed header of an RTP datagram.
    ///
    /// Returns None for anything that is not a plausible RTP v2 packet:
    /// short datagrams, wrong version, or a length that cannot hold the
    /// declared CSRC list.
    pub fn parse(buf: &[u8]) -> Option<Self> {
        if buf.len() < RTP_HEADER_LEN {
            return None;
        }
        let version = buf[0] >> 6;
        if version != 2 {
            return None;
        }
        let csrc_count = (buf[0] & 0x0F) as usize;
        if buf.len() < RTP_HEADER_LEN + csrc_count * 4 {
            return None;
        }
        Some(Self {
            version,
            padding: buf[0] & 0x20 != 0,
            marker: buf[1] & 0x80 != 0,
            payload_type: buf[1] & 0x7F,
            sequence_number: u16::from_be_bytes([buf[2], buf[3]]),
            timestamp: u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]),
            ssrc: u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]),
        })
    }
}

/// Codec capability advertised for a track.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackCodec {
    pub mime_type: String,
    pub clock_rate: u32,
}

impl TrackCodec {
    pub fn vp8() -> Self {
        Self {
            mime_type: "video/VP8".into(),
            clock_rate: 90_000,
        }
    }

    pub fn opus() -> Self {
        Self {
            mime_type: "audio/opus".into(),
            clock_rate: 48_000,
        }
    }
}

/// A shared forwarding track carrying raw RTP datagrams.
pub struct LocalRtpTrack {
    id: String,
    stream_id: String,
    codec: TrackCodec,
    tx: broadcast::Sender<Bytes>,
    packets: AtomicU64,
}

impl LocalRtpTrack {
    pub fn new(codec: TrackCodec, id: impl Into<String>, stream_id: impl Into<String>) -> Self {
        let (tx, _) = broadcast::channel(TRACK_BUFFER);
        Self {
            id: id.into(),
            stream_id: stream_id.into(),
            codec,
            tx,
            packets: AtomicU64::new(0),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    pub fn codec(&self) -> &TrackCodec {
        &self.codec
    }

    /// Forward one RTP datagram, unmodified, to every attached viewer.
    /// Never blocks; with no viewers attached the packet is dropped.
    pub fn write_rtp(&self, packet: Bytes) {
        self.packets.fetch_add(1, Ordering::Relaxed);
        let _ = self.tx.send(packet);
    }

    /// Attach a viewer. Each receiver observes packets independently.
    pub fn subscribe(&self) -> broadcast::Receiver<Bytes> {
        self.tx.subscribe()
    }

    /// Packets written since creation
    pub fn packet_count(&self) -> u64 {
        self.packets.load(Ordering::Relaxed)
    }

    /// Viewers currently attached
    pub fn viewer_count(&self) -> usize {
        self.tx.receiver_count()
    }
}
