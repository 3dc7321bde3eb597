//! Codec module - payload serialization.
//!
//! - [`MsgPackCodec`] - MessagePack using `rmp-serde`, used for the message
//!   envelope and for every payload.
//! - [`Value`] - a type-erased payload value carried by the execution context
//!   between decode, middleware, handler and encode.
//!
//! # Example
//!
//! ```
//! use callwire::codec::MsgPackCodec;
//!
//! let encoded = MsgPackCodec::encode(&"hello").unwrap();
//! let decoded: String = MsgPackCodec::decode(&encoded).unwrap();
//! assert_eq!(decoded, "hello");
//! ```

mod msgpack;
mod value;

pub use msgpack::MsgPackCodec;
pub use value::{decode_reply, decode_value, DecodeFn, ReplyDecodeFn, Value};
