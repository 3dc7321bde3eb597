//! Type-erased payload values.
//!
//! Request and response values travel through middleware as `Box<dyn Value>`
//! so that a single context type serves every registered function. The
//! concrete type is recovered with [`Value::into_any`] or `downcast_ref`.

use std::any::Any;

use serde::de::DeserializeOwned;
use serde::Serialize;

use super::MsgPackCodec;
use crate::error::Result;

/// A payload value that can encode itself.
pub trait Value: Any + Send + Sync {
    /// Encode the value with the payload codec.
    fn encode(&self) -> Result<Vec<u8>>;

    /// Borrow as `Any` for downcasting.
    fn as_any(&self) -> &dyn Any;

    /// Convert into `Any` for downcasting by value.
    fn into_any(self: Box<Self>) -> Box<dyn Any + Send + Sync>;
}

impl<T> Value for T
where
    T: Serialize + Send + Sync + 'static,
{
    fn encode(&self) -> Result<Vec<u8>> {
        MsgPackCodec::encode(self)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any + Send + Sync> {
        self
    }
}

impl dyn Value {
    /// Returns a reference to the inner value if it is of type `T`.
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.as_any().downcast_ref::<T>()
    }

    /// Returns true if the inner value is of type `T`.
    pub fn is<T: Any>(&self) -> bool {
        self.as_any().is::<T>()
    }
}

/// A decoder for one concrete payload type, see [`decode_value`].
pub type DecodeFn = fn(&[u8]) -> Result<Box<dyn Value>>;

/// Decode payload bytes into a boxed value of type `T`.
///
/// Used as a plain `fn` pointer where the concrete type is only known at
/// registration (or call) time.
pub fn decode_value<T>(bytes: &[u8]) -> Result<Box<dyn Value>>
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    let value: T = MsgPackCodec::decode(bytes)?;
    Ok(Box::new(value))
}

/// A decoder for a receive-only payload type, see [`decode_reply`].
pub type ReplyDecodeFn = fn(&[u8]) -> Result<Box<dyn Any + Send + Sync>>;

/// Decode payload bytes into a boxed `T` that never needs to be encoded again.
pub fn decode_reply<T>(bytes: &[u8]) -> Result<Box<dyn Any + Send + Sync>>
where
    T: DeserializeOwned + Send + Sync + 'static,
{
    let value: T = MsgPackCodec::decode(bytes)?;
    Ok(Box::new(value))
}
