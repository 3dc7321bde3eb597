//! Frame buffer for accumulating partial reads.
//!
//! Uses `bytes::BytesMut` so consumed frames are split off without copying.
//! Decoding never fails: a stream that lost sync is recovered by skipping one
//! byte at a time until a frame marker with a plausible length shows up.
//!
//! # Example
//!
//! ```
//! use callwire::protocol::{encode_message, Decoded, FrameBuffer, Message};
//!
//! let frame = encode_message(&Message::request("echo", None)).unwrap();
//!
//! let mut buffer = FrameBuffer::new();
//! buffer.extend(&frame[..4]);
//! assert!(matches!(buffer.decode(), Decoded::NeedMoreData));
//! buffer.extend(&frame[4..]);
//! assert!(matches!(buffer.decode(), Decoded::Message(m) if m.method == "echo"));
//! ```

use bytes::{Buf, BytesMut};

use super::message::Message;
use super::wire_format::{FrameHeader, DEFAULT_MAX_MESSAGE_SIZE, FRAME_HEADER_SIZE};
use crate::codec::MsgPackCodec;

/// Result of one decode attempt.
#[derive(Debug)]
pub enum Decoded {
    /// A complete message was extracted.
    Message(Message),
    /// The buffer holds no complete frame yet. Retry after more bytes arrive.
    NeedMoreData,
}

/// Buffer for accumulating incoming bytes and extracting messages.
pub struct FrameBuffer {
    /// Accumulated bytes from reads.
    buffer: BytesMut,
    /// Maximum accepted envelope length.
    max_message_size: usize,
    /// Bytes of an oversized frame still to be dropped as they arrive.
    discard: usize,
    /// Total bytes dropped while resynchronizing or discarding.
    skipped: u64,
}

impl FrameBuffer {
    /// Create a new frame buffer with the default max message size (32 MB).
    pub fn new() -> Self {
        Self::with_max_message_size(DEFAULT_MAX_MESSAGE_SIZE)
    }

    /// Create a new frame buffer with a custom max message size.
    pub fn with_max_message_size(max_message_size: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(64 * 1024),
            max_message_size,
            discard: 0,
            skipped: 0,
        }
    }

    /// Append data to the buffer without decoding.
    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Push data into the buffer and extract all complete messages.
    pub fn push(&mut self, data: &[u8]) -> Vec<Message> {
        self.extend(data);

        let mut messages = Vec::new();
        while let Decoded::Message(msg) = self.decode() {
            messages.push(msg);
        }
        messages
    }

    /// Try to decode the next message.
    ///
    /// Bytes of a truncated but well-formed frame are left in place.
    pub fn decode(&mut self) -> Decoded {
        loop {
            if self.discard > 0 {
                let n = self.discard.min(self.buffer.len());
                self.skip(n);
                self.discard -= n;
                if self.discard > 0 {
                    return Decoded::NeedMoreData;
                }
            }

            let header = match FrameHeader::decode(&self.buffer) {
                Some(header) => header,
                None => return Decoded::NeedMoreData,
            };

            if !header.has_magic() || header.length < 0 {
                self.skip(1);
                continue;
            }

            let length = header.length as usize;
            if length > self.max_message_size {
                tracing::warn!(
                    "Dropping frame of {} bytes (max {})",
                    length,
                    self.max_message_size
                );
                self.discard = FRAME_HEADER_SIZE + length;
                continue;
            }

            if self.buffer.len() < FRAME_HEADER_SIZE + length {
                return Decoded::NeedMoreData;
            }

            self.buffer.advance(FRAME_HEADER_SIZE);
            let envelope = self.buffer.split_to(length);

            match MsgPackCodec::decode::<Message>(&envelope) {
                Ok(msg) => return Decoded::Message(msg),
                Err(e) => {
                    tracing::warn!("Dropping undecodable envelope: {}", e);
                    self.skipped += (FRAME_HEADER_SIZE + length) as u64;
                }
            }
        }
    }

    fn skip(&mut self, n: usize) {
        self.buffer.advance(n);
        self.skipped += n as u64;
    }

    /// Get the number of buffered bytes.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// Check if the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Total bytes dropped so far (garbage, oversized and undecodable frames).
    pub fn skipped_bytes(&self) -> u64 {
        self.skipped
    }

    /// Clear the buffer and reset state.
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.discard = 0;
    }
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::new()
    }
}
