//! Registrable handler functions.
//!
//! A handler is an async function taking a [`RequestContext`] and, optionally,
//! one request value, and returning either `Result<()>` or `Result<R>`. Each
//! of the four shapes has its own constructor; anything else does not
//! type-check:
//!
//! ```compile_fail
//! use callwire::handler::{Function, RequestContext};
//!
//! // Does not return a `Result`.
//! async fn count(_ctx: RequestContext) -> u32 {
//!     1
//! }
//!
//! let _ = Function::with_output(count);
//! ```
//!
//! ```compile_fail
//! use callwire::handler::Function;
//!
//! // No context parameter.
//! async fn shout(s: String) -> callwire::Result<String> {
//!     Ok(s.to_uppercase())
//! }
//!
//! let _ = Function::with_input_output(shout);
//! ```

use std::any::Any;
use std::future::Future;

use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde::Serialize;

use super::desc::{self, FuncDesc};
use super::RequestContext;
use crate::codec::{decode_value, DecodeFn, Value};
use crate::error::{Result, RpcError};

type CallFuture = BoxFuture<'static, Result<Option<Box<dyn Value>>>>;

type ErasedCall = Box<dyn Fn(RequestContext, Option<Box<dyn Value>>) -> CallFuture + Send + Sync>;

/// The signature of a handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerShape {
    /// `async fn(RequestContext) -> Result<()>`
    NoInNoOut,
    /// `async fn(RequestContext, T) -> Result<()>`
    InNoOut,
    /// `async fn(RequestContext) -> Result<R>`
    NoInOut,
    /// `async fn(RequestContext, T) -> Result<R>`
    InOut,
}

impl HandlerShape {
    pub fn has_input(self) -> bool {
        matches!(self, HandlerShape::InNoOut | HandlerShape::InOut)
    }

    pub fn has_output(self) -> bool {
        matches!(self, HandlerShape::NoInOut | HandlerShape::InOut)
    }

    /// Descriptor bits for this shape.
    pub fn desc(self) -> FuncDesc {
        let mut bits = 0;
        if self.has_input() {
            bits |= desc::REQUEST_DATA;
        }
        if self.has_output() {
            bits |= desc::RESPONSE_DATA;
        }
        bits
    }
}

/// A type-erased handler, ready for registration.
pub struct Function {
    name: Option<String>,
    shape: HandlerShape,
    decode: Option<DecodeFn>,
    call: ErasedCall,
}

impl Function {
    /// Handler without request value or response value.
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: Fn(RequestContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        Self {
            name: infer_name::<F>(),
            shape: HandlerShape::NoInNoOut,
            decode: None,
            call: Box::new(move |ctx: RequestContext, _: Option<Box<dyn Value>>| -> CallFuture {
                let fut = f(ctx);
                Box::pin(async move { fut.await.map(|()| None) })
            }),
        }
    }

    /// Handler taking a request value of type `T`.
    pub fn with_input<F, T, Fut>(f: F) -> Self
    where
        F: Fn(RequestContext, T) -> Fut + Send + Sync + 'static,
        T: Serialize + DeserializeOwned + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        Self {
            name: infer_name::<F>(),
            shape: HandlerShape::InNoOut,
            decode: Some(decode_value::<T>),
            call: Box::new(move |ctx: RequestContext, value: Option<Box<dyn Value>>| -> CallFuture {
                let input = match downcast_input::<T>(value) {
                    Ok(input) => input,
                    Err(e) => return Box::pin(futures::future::ready(Err(e))),
                };
                let fut = f(ctx, input);
                Box::pin(async move { fut.await.map(|()| None) })
            }),
        }
    }

    /// Handler producing a response value of type `R`.
    pub fn with_output<F, R, Fut>(f: F) -> Self
    where
        F: Fn(RequestContext) -> Fut + Send + Sync + 'static,
        R: Serialize + Send + Sync + 'static,
        Fut: Future<Output = Result<R>> + Send + 'static,
    {
        Self {
            name: infer_name::<F>(),
            shape: HandlerShape::NoInOut,
            decode: None,
            call: Box::new(move |ctx: RequestContext, _: Option<Box<dyn Value>>| -> CallFuture {
                let fut = f(ctx);
                Box::pin(async move { Ok(Some(Box::new(fut.await?) as Box<dyn Value>)) })
            }),
        }
    }

    /// Handler taking a `T` and producing an `R`.
    pub fn with_input_output<F, T, R, Fut>(f: F) -> Self
    where
        F: Fn(RequestContext, T) -> Fut + Send + Sync + 'static,
        T: Serialize + DeserializeOwned + Send + Sync + 'static,
        R: Serialize + Send + Sync + 'static,
        Fut: Future<Output = Result<R>> + Send + 'static,
    {
        Self {
            name: infer_name::<F>(),
            shape: HandlerShape::InOut,
            decode: Some(decode_value::<T>),
            call: Box::new(move |ctx: RequestContext, value: Option<Box<dyn Value>>| -> CallFuture {
                let input = match downcast_input::<T>(value) {
                    Ok(input) => input,
                    Err(e) => return Box::pin(futures::future::ready(Err(e))),
                };
                let fut = f(ctx, input);
                Box::pin(async move { Ok(Some(Box::new(fut.await?) as Box<dyn Value>)) })
            }),
        }
    }

    /// Name derived from the handler's type, `None` for closures.
    pub fn inferred_name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    #[inline]
    pub fn shape(&self) -> HandlerShape {
        self.shape
    }

    #[inline]
    pub fn desc(&self) -> FuncDesc {
        self.shape.desc()
    }

    /// Decode a request payload into the handler's input type.
    ///
    /// Returns `Ok(None)` without looking at the bytes when the handler takes
    /// no input, and when the payload is empty.
    pub fn decode_request(&self, payload: &[u8]) -> Result<Option<Box<dyn Value>>> {
        match self.decode {
            Some(decode) if !payload.is_empty() => decode(payload).map(Some),
            _ => Ok(None),
        }
    }

    pub(crate) fn call(
        &self,
        ctx: RequestContext,
        input: Option<Box<dyn Value>>,
    ) -> CallFuture {
        (self.call)(ctx, input)
    }
}

fn downcast_input<T: Any>(value: Option<Box<dyn Value>>) -> Result<T> {
    let value = value.ok_or(RpcError::MissingInputParameter)?;
    value
        .into_any()
        .downcast::<T>()
        .map(|input| *input)
        .map_err(|_| RpcError::Protocol("request value has the wrong type".into()))
}

fn infer_name<F>() -> Option<String> {
    let full = std::any::type_name::<F>();
    let path = full.split('<').next().unwrap_or(full);
    let name = path.rsplit("::").next().unwrap_or(path);
    if name.is_empty() || name.contains('{') {
        None
    } else {
        Some(name.to_string())
    }
}

/// Best-effort text of a panic payload.
pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
