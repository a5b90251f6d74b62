use std::time::{Duration, Instant};

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Default maximum segment size for a single data-channel send.
pub const DEFAULT_MAX_SEGMENT_BYTES: usize = 16 * 1024;
/// Upper bound on a reassembled message.
pub const DEFAULT_MAX_MESSAGE_BYTES: usize = 64 * 1024 * 1024;
pub const MIN_SEGMENT_BYTES: usize = 2;

const FLAG_CONTINUATION: u8 = 0;
const FLAG_FINAL: u8 = 1;
const HEADER_LEN: usize = 1;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("empty datagram")]
    Empty,
    #[error("unknown frame flag {0:#04x}")]
    UnknownFlag(u8),
    #[error("frame too large: {0} bytes")]
    TooLarge(usize),
    #[error("message exceeds max size: {0} bytes")]
    MessageTooLarge(usize),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub is_final: bool,
    pub payload: Bytes,
}

impl Frame {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_LEN + self.payload.len());
        buf.put_u8(if self.is_final { FLAG_FINAL } else { FLAG_CONTINUATION });
        buf.extend_from_slice(&self.payload);
        buf.freeze()
    }

    pub fn decode(datagram: &[u8]) -> Result<Self, FrameError> {
        let (&flag, payload) = datagram.split_first().ok_or(FrameError::Empty)?;
        let is_final = match flag {
            FLAG_CONTINUATION => false,
            FLAG_FINAL => true,
            other => return Err(FrameError::UnknownFlag(other)),
        };
        Ok(Frame {
            is_final,
            payload: Bytes::copy_from_slice(payload),
        })
    }
}

/// Lazy frame sequence produced by [`chunk`]. Consumed once.
#[derive(Debug)]
pub struct Chunks {
    message: Bytes,
    capacity: usize,
    offset: usize,
    done: bool,
}

impl Chunks {
    pub fn total(&self) -> usize {
        frame_count(self.message.len(), self.capacity)
    }
}

impl Iterator for Chunks {
    type Item = Frame;

    fn next(&mut self) -> Option<Frame> {
        if self.done {
            return None;
        }
        let end = (self.offset + self.capacity).min(self.message.len());
        let payload = self.message.slice(self.offset..end);
        self.offset = end;
        let is_final = end == self.message.len();
        self.done = is_final;
        Some(Frame { is_final, payload })
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        if self.done {
            return (0, Some(0));
        }
        let remaining = frame_count(self.message.len() - self.offset, self.capacity);
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for Chunks {}

/// Splits `message` into frames of at most `max_segment_size - 1` payload
/// bytes. An empty message yields one empty final frame.
pub fn chunk(message: impl Into<Bytes>, max_segment_size: usize) -> Chunks {
    Chunks {
        message: message.into(),
        capacity: payload_capacity(max_segment_size),
        offset: 0,
        done: false,
    }
}

fn payload_capacity(max_segment_size: usize) -> usize {
    max_segment_size.saturating_sub(HEADER_LEN).max(1)
}

fn frame_count(len: usize, capacity: usize) -> usize {
    len.div_ceil(capacity).max(1)
}

/// Reassembles one stream of frames into messages.
///
/// A message abandoned part way (oversize or malformed frame) is skipped up to
/// and including its final frame, so its tail is never delivered as a message
/// of its own.
#[derive(Debug)]
pub struct MessageAssembler {
    accumulator: BytesMut,
    max_segment_size: usize,
    max_message_bytes: usize,
    started_at: Option<Instant>,
    discarding: bool,
}

impl MessageAssembler {
    pub fn new(max_segment_size: usize) -> Self {
        Self {
            accumulator: BytesMut::new(),
            max_segment_size: max_segment_size.max(MIN_SEGMENT_BYTES),
            max_message_bytes: DEFAULT_MAX_MESSAGE_BYTES,
            started_at: None,
            discarding: false,
        }
    }

    pub fn with_max_message_bytes(mut self, max_message_bytes: usize) -> Self {
        self.max_message_bytes = max_message_bytes;
        self
    }

    pub fn max_segment_size(&self) -> usize {
        self.max_segment_size
    }

    pub fn chunk(&self, message: impl Into<Bytes>) -> Chunks {
        chunk(message, self.max_segment_size)
    }

    /// Bytes buffered for the message currently being assembled.
    pub fn pending_len(&self) -> usize {
        self.accumulator.len()
    }

    /// Whether frames are being skipped until the end of an abandoned message.
    pub fn is_discarding(&self) -> bool {
        self.discarding
    }

    pub fn feed(&mut self, frame: Frame) -> Option<Bytes> {
        if self.discarding {
            if frame.is_final {
                self.discarding = false;
                self.started_at = None;
            }
            return None;
        }
        if self.started_at.is_none() && !frame.is_final {
            self.started_at = Some(Instant::now());
        }
        self.accumulator.extend_from_slice(&frame.payload);
        if !frame.is_final {
            return None;
        }
        self.started_at = None;
        Some(self.accumulator.split().freeze())
    }

    /// Decodes a raw datagram and feeds it. An oversize or malformed frame
    /// abandons the current message.
    pub fn feed_datagram(&mut self, datagram: &[u8]) -> Result<Option<Bytes>, FrameError> {
        if datagram.len() > self.max_segment_size {
            // the flag byte still says whether the sender has more to come
            self.abandon(datagram.first() == Some(&FLAG_FINAL));
            return Err(FrameError::TooLarge(datagram.len()));
        }
        let frame = match Frame::decode(datagram) {
            Ok(frame) => frame,
            Err(err) => {
                if self.started_at.is_some() || self.discarding {
                    self.abandon(false);
                }
                return Err(err);
            }
        };
        if self.discarding {
            return Ok(self.feed(frame));
        }
        let total = self.accumulator.len() + frame.payload.len();
        if total > self.max_message_bytes {
            self.abandon(frame.is_final);
            return Err(FrameError::MessageTooLarge(total));
        }
        Ok(self.feed(frame))
    }

    fn abandon(&mut self, at_final: bool) {
        let started = self.started_at;
        self.reset();
        if !at_final {
            self.discarding = true;
            self.started_at = Some(started.unwrap_or_else(Instant::now));
        }
    }

    /// Drops a partial message whose first frame is older than `idle`, and
    /// stops skipping an abandoned one. Returns the number of bytes discarded.
    pub fn discard_stale(&mut self, now: Instant, idle: Duration) -> Option<usize> {
        let started = self.started_at?;
        if now.saturating_duration_since(started) <= idle {
            return None;
        }
        let dropped = self.accumulator.len();
        self.reset();
        Some(dropped)
    }

    pub fn reset(&mut self) {
        self.accumulator.clear();
        self.started_at = None;
        self.discarding = false;
    }
}
