//! The message envelope.
//!
//! A [`Message`] is the logical unit exchanged by peers: either a request
//! naming a method, or a response carrying the same id as its request.

use std::collections::HashMap;

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use super::wire_format::{FrameHeader, FRAME_HEADER_SIZE, MESSAGE_ID_LEN};
use crate::codec::MsgPackCodec;
use crate::error::{Result, RpcError};

/// Message headers (string to string, order irrelevant).
pub type Headers = HashMap<String, String>;

/// Request or response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Request,
    Response,
}

/// Wire envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Correlation id, [`MESSAGE_ID_LEN`] characters.
    pub id: String,
    /// Method name. Responses echo the request's method.
    pub method: String,
    #[serde(default)]
    pub headers: Option<Headers>,
    pub kind: MessageKind,
    /// Error string, responses only.
    #[serde(default)]
    pub error: Option<String>,
    /// Encoded request parameter or response value.
    #[serde(default, with = "serde_bytes")]
    pub payload: Option<Vec<u8>>,
}

impl Message {
    /// Create a request with a fresh id.
    pub fn request(method: impl Into<String>, headers: Option<Headers>) -> Self {
        Self {
            id: new_message_id(),
            method: method.into(),
            headers,
            kind: MessageKind::Request,
            error: None,
            payload: None,
        }
    }

    /// Create an empty response to `request`.
    pub fn response_to(request: &Message) -> Self {
        Self {
            id: request.id.clone(),
            method: request.method.clone(),
            headers: None,
            kind: MessageKind::Response,
            error: None,
            payload: None,
        }
    }

    #[inline]
    pub fn is_request(&self) -> bool {
        self.kind == MessageKind::Request
    }

    #[inline]
    pub fn is_response(&self) -> bool {
        self.kind == MessageKind::Response
    }

    /// Payload bytes, empty if absent.
    #[inline]
    pub fn payload(&self) -> &[u8] {
        self.payload.as_deref().unwrap_or_default()
    }

    /// True if the message carries a non-empty payload.
    #[inline]
    pub fn has_payload(&self) -> bool {
        !self.payload().is_empty()
    }

    /// The error carried by a response, mapped back to its kind.
    pub fn to_error(&self) -> Option<RpcError> {
        self.error.clone().map(RpcError::from_wire)
    }

    pub fn set_error(&mut self, err: &RpcError) {
        self.error = Some(err.to_string());
    }

    /// Encode `value` into the payload.
    pub fn set_data<T: serde::Serialize + ?Sized>(&mut self, value: &T) -> Result<()> {
        self.payload = Some(MsgPackCodec::encode(value)?);
        Ok(())
    }

    /// Decode the payload into `T`.
    pub fn bind_data<T: serde::de::DeserializeOwned>(&self) -> Result<T> {
        MsgPackCodec::decode(self.payload())
    }
}

/// Generate a random correlation id of [`MESSAGE_ID_LEN`] hex characters.
pub fn new_message_id() -> String {
    format!("{:032x}", rand::random::<u128>())
}

/// Serialize a message into a complete frame (header + envelope).
///
/// # Errors
///
/// Returns a protocol error if the id is not [`MESSAGE_ID_LEN`] bytes long or
/// the envelope does not fit the length field.
pub fn encode_message(msg: &Message) -> Result<Bytes> {
    if msg.id.len() != MESSAGE_ID_LEN {
        return Err(RpcError::Protocol(format!(
            "message id must be {} bytes, got {}",
            MESSAGE_ID_LEN,
            msg.id.len()
        )));
    }

    let envelope = MsgPackCodec::encode(msg)?;
    let length = i32::try_from(envelope.len()).map_err(|_| {
        RpcError::Protocol(format!("envelope of {} bytes is too large", envelope.len()))
    })?;

    let mut frame = BytesMut::with_capacity(FRAME_HEADER_SIZE + envelope.len());
    frame.put_slice(&FrameHeader::new(length).encode());
    frame.put_slice(&envelope);
    Ok(frame.freeze())
}
