//! MJPEG stream demultiplexing
//!
//! The capture process emits a continuous MJPEG byte stream; frames are
//! delimited by the JPEG SOI/EOI markers. The scanner keeps a growable
//! working buffer and bounds it against malformed streams by truncating to
//! a recent tail once a ceiling is crossed.

use bytes::{Bytes, BytesMut};

/// JPEG start-of-image marker
pub const FRAME_START: [u8; 2] = [0xFF, 0xD8];
/// JPEG end-of-image marker
pub const FRAME_END: [u8; 2] = [0xFF, 0xD9];

/// Incremental scanner extracting complete JPEG frames from a byte stream.
pub struct FrameScanner {
    buffer: BytesMut,
    max_buffer: usize,
    keep_tail: usize,
}

impl FrameScanner {
    /// `max_buffer` is the working-buffer ceiling; when crossed without a
    /// complete frame the buffer is cut down to its most recent
    /// `keep_tail` bytes.
    pub fn new(max_buffer: usize, keep_tail: usize) -> Self {
        Self {
            buffer: BytesMut::new(),
            max_buffer,
            keep_tail: keep_tail.min(max_buffer),
        }
    }

    /// Append a chunk and extract every complete frame now available.
    ///
    /// Each returned frame is byte-identical to the wire data, inclusive
    /// of both markers.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Bytes> {
        self.buffer.extend_from_slice(chunk);

        let mut frames = Vec::new();
        loop {
            let Some(start) = find_marker(&self.buffer, FRAME_START, 0) else {
                break;
            };
            let Some(end) = find_marker(&self.buffer, FRAME_END, start + 2) else {
                break;
            };

            // Discard anything before the frame, then split the frame off
            let _ = self.buffer.split_to(start);
            let frame_len = end - start + 2;
            frames.push(self.buffer.split_to(frame_len).freeze());
        }

        if self.buffer.len() > self.max_buffer {
            let excess = self.buffer.len() - self.keep_tail;
            let _ = self.buffer.split_to(excess);
        }

        frames
    }

    /// Bytes currently held in the working buffer
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }
}

fn find_marker(haystack: &[u8], marker: [u8; 2], from: usize) -> Option<usize> {
    if haystack.len() < from + 2 {
        return None;
    }
    haystack[from..]
        .windows(2)
        .position(|w| w == marker)
        .map(|pos| pos + from)
}
