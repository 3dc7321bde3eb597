//! Wire format encoding and decoding.
//!
//! Every message travels in a frame with a 6-byte header:
//! ```text
//! ┌──────────┬──────────┬──────────────────┐
//! │ Magic    │ Length   │ Envelope         │
//! │ 2 bytes  │ 4 bytes  │ N bytes          │
//! │ 0xFEFE   │ int32 BE │ MsgPack          │
//! └──────────┴──────────┴──────────────────┘
//! ```
//!
//! All multi-byte integers are Big Endian.

/// Frame marker.
pub const MAGIC: u16 = 0xFEFE;

/// Frame header size in bytes (magic + length).
pub const FRAME_HEADER_SIZE: usize = 6;

/// Offset of the length field inside the frame header.
pub(crate) const LENGTH_OFFSET: usize = 2;

/// Default maximum envelope size (32 MB).
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 32 * 1024 * 1024;

/// Length of a correlation id.
pub const MESSAGE_ID_LEN: usize = 32;

/// Decoded frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Frame marker, [`MAGIC`] for a valid frame.
    pub magic: u16,
    /// Declared envelope length. Negative values are corrupt.
    pub length: i32,
}

impl FrameHeader {
    /// Create a valid header for an envelope of `length` bytes.
    pub fn new(length: i32) -> Self {
        Self {
            magic: MAGIC,
            length,
        }
    }

    /// Encode header to bytes (Big Endian).
    ///
    /// # Example
    ///
    /// ```
    /// use callwire::protocol::FrameHeader;
    ///
    /// let bytes = FrameHeader::new(100).encode();
    /// assert_eq!(bytes, [0xFE, 0xFE, 0, 0, 0, 100]);
    /// ```
    pub fn encode(&self) -> [u8; FRAME_HEADER_SIZE] {
        let mut buf = [0u8; FRAME_HEADER_SIZE];
        buf[0..2].copy_from_slice(&self.magic.to_be_bytes());
        buf[2..6].copy_from_slice(&self.length.to_be_bytes());
        buf
    }

    /// Decode header from bytes (Big Endian).
    ///
    /// Returns `None` if buffer is too short.
    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < FRAME_HEADER_SIZE {
            return None;
        }
        Some(Self {
            magic: u16::from_be_bytes([buf[0], buf[1]]),
            length: i32::from_be_bytes([buf[2], buf[3], buf[4], buf[5]]),
        })
    }

    /// Check the frame marker.
    #[inline]
    pub fn has_magic(&self) -> bool {
        self.magic == MAGIC
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_big_endian_byte_order() {
        let bytes = FrameHeader::new(0x01020304).encode();
        assert_eq!(bytes, [0xFE, 0xFE, 0x01, 0x02, 0x03, 0x04]);
    }

    #[test]
    fn test_decode_too_short_buffer() {
        assert!(FrameHeader::decode(&[0xFE, 0xFE, 0, 0, 0]).is_none());
    }

    #[test]
    fn test_negative_length_decodes() {
        let mut bytes = FrameHeader::new(0).encode();
        bytes[LENGTH_OFFSET] = 0x80;
        let header = FrameHeader::decode(&bytes).unwrap();
        assert!(header.has_magic());
        assert!(header.length < 0);
    }

    #[test]
    fn test_bad_magic() {
        let header = FrameHeader::decode(&[0xFE, 0xFF, 0, 0, 0, 1]).unwrap();
        assert!(!header.has_magic());
    }
}
