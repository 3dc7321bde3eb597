//! Protocol module - wire format, message envelope and framing.
//!
//! This module implements the wire codec:
//! - 6-byte frame header (magic + envelope length)
//! - [`Message`] envelope serialized with MsgPack
//! - [`FrameBuffer`] for accumulating partial reads and resynchronizing

mod frame_buffer;
mod message;
mod wire_format;

pub use frame_buffer::{Decoded, FrameBuffer};
pub use message::{encode_message, new_message_id, Headers, Message, MessageKind};
pub use wire_format::{
    FrameHeader, DEFAULT_MAX_MESSAGE_SIZE, FRAME_HEADER_SIZE, MAGIC, MESSAGE_ID_LEN,
};
