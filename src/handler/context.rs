//! Per-request execution state.
//!
//! A [`Context`] is threaded through the middleware chain and the invoker for
//! one inbound request or one outbound call. It is pooled: after processing,
//! [`Context::reset`] runs the deferred actions (last registered first) and
//! clears every field.
//!
//! Handlers do not see the `Context` itself. They get a [`RequestContext`],
//! an owned snapshot of what a handler needs: id, method, headers and the
//! connection the request arrived on.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use serde::Serialize;

use super::desc::FuncDesc;
use crate::callable::Callable;
use crate::codec::Value;
use crate::error::{Result, RpcError};
use crate::protocol::{Headers, Message, MessageKind};
use crate::writer::Writer;

type Deferred = Box<dyn FnOnce() + Send>;

/// Mutable state of one request as it goes through dispatch.
#[derive(Default)]
pub struct Context {
    callable: Option<Callable>,
    request: Option<Message>,
    response: Option<Message>,
    request_value: Option<Box<dyn Value>>,
    response_value: Option<Box<dyn Value>>,
    reply: Option<Box<dyn Any + Send + Sync>>,
    error: Option<RpcError>,
    writer: Option<Arc<dyn Writer>>,
    deferred: Vec<Deferred>,
    desc: FuncDesc,
}

impl Context {
    /// Bind the context to a connection and the message being processed.
    ///
    /// The output writer starts out as the connection's own writer.
    pub(crate) fn init(&mut self, callable: Option<Callable>, request: Message) {
        self.writer = callable.as_ref().map(Callable::writer);
        self.callable = callable;
        self.request = Some(request);
    }

    /// Run deferred actions in reverse registration order, then clear all state.
    pub(crate) fn reset(&mut self) {
        while let Some(action) = self.deferred.pop() {
            action();
        }
        self.callable = None;
        self.request = None;
        self.response = None;
        self.request_value = None;
        self.response_value = None;
        self.reply = None;
        self.error = None;
        self.writer = None;
        self.desc = 0;
    }

    /// The connection this context belongs to.
    pub fn callable(&self) -> Option<&Callable> {
        self.callable.as_ref()
    }

    /// Correlation id of the request.
    pub fn id(&self) -> &str {
        self.request.as_ref().map(|m| m.id.as_str()).unwrap_or_default()
    }

    pub fn method(&self) -> &str {
        self.request
            .as_ref()
            .map(|m| m.method.as_str())
            .unwrap_or_default()
    }

    pub fn set_method(&mut self, method: impl Into<String>) {
        if let Some(request) = self.request.as_mut() {
            request.method = method.into();
        }
    }

    pub fn request_header(&self) -> Option<&Headers> {
        self.request.as_ref().and_then(|m| m.headers.as_ref())
    }

    pub fn set_request_header(&mut self, headers: Headers) {
        if let Some(request) = self.request.as_mut() {
            request.headers = Some(headers);
        }
    }

    pub fn response_header(&self) -> Option<&Headers> {
        self.response.as_ref().and_then(|m| m.headers.as_ref())
    }

    /// Set headers of the response. The response skeleton is created on demand.
    pub fn set_response_header(&mut self, headers: Headers) {
        self.response_mut().headers = Some(headers);
    }

    /// The decoded request value.
    pub fn request(&self) -> Option<&dyn Value> {
        self.request_value.as_deref()
    }

    /// Replace the request value.
    ///
    /// The value is encoded into the request message right away, so for an
    /// outbound call the frame on the wire always matches it.
    pub fn set_request<T>(&mut self, value: T) -> Result<()>
    where
        T: Serialize + Send + Sync + 'static,
    {
        self.set_request_value(Box::new(value))
    }

    pub(crate) fn set_request_value(&mut self, value: Box<dyn Value>) -> Result<()> {
        if let Some(request) = self.request.as_mut() {
            request.payload = Some(value.encode()?);
        }
        self.request_value = Some(value);
        Ok(())
    }

    /// Store a value decoded from the request payload without re-encoding it.
    pub(crate) fn put_request_value(&mut self, value: Box<dyn Value>) {
        self.request_value = Some(value);
    }

    pub(crate) fn take_request_value(&mut self) -> Option<Box<dyn Value>> {
        self.request_value.take()
    }

    /// The response value produced by the handler.
    pub fn response(&self) -> Option<&dyn Value> {
        self.response_value.as_deref()
    }

    pub fn set_response<T>(&mut self, value: T)
    where
        T: Serialize + Send + Sync + 'static,
    {
        self.response_value = Some(Box::new(value));
    }

    pub(crate) fn set_response_value(&mut self, value: Box<dyn Value>) {
        self.response_value = Some(value);
    }

    /// The decoded response of an outbound call, once it arrived.
    pub fn reply(&self) -> Option<&(dyn Any + Send + Sync)> {
        self.reply.as_deref()
    }

    pub(crate) fn set_reply(&mut self, value: Box<dyn Any + Send + Sync>) {
        self.reply = Some(value);
    }

    pub(crate) fn take_reply(&mut self) -> Option<Box<dyn Any + Send + Sync>> {
        self.reply.take()
    }

    pub fn error(&self) -> Option<&RpcError> {
        self.error.as_ref()
    }

    pub fn set_error(&mut self, err: RpcError) {
        self.error = Some(err);
    }

    pub fn clear_error(&mut self) {
        self.error = None;
    }

    pub fn take_error(&mut self) -> Option<RpcError> {
        self.error.take()
    }

    /// Add an error, keeping the one already present.
    pub fn append_error(&mut self, err: RpcError) {
        self.error = Some(match self.error.take() {
            Some(existing) => existing.combine(err),
            None => err,
        });
    }

    /// Where the encoded response goes. `None` drops it.
    pub fn writer(&self) -> Option<Arc<dyn Writer>> {
        self.writer.clone()
    }

    /// Redirect output, returning the previous writer.
    pub fn set_writer(&mut self, writer: Option<Arc<dyn Writer>>) -> Option<Arc<dyn Writer>> {
        std::mem::replace(&mut self.writer, writer)
    }

    /// Register an action to run when the context is reset.
    pub fn defer<F>(&mut self, action: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.deferred.push(Box::new(action));
    }

    /// Which of request and response carry data for the current function.
    pub fn func_desc(&self) -> FuncDesc {
        self.desc
    }

    pub(crate) fn set_func_desc(&mut self, desc: FuncDesc) {
        self.desc = desc;
    }

    pub fn request_message(&self) -> Option<&Message> {
        self.request.as_ref()
    }

    pub fn response_message(&self) -> Option<&Message> {
        self.response.as_ref()
    }

    pub(crate) fn set_response_message(&mut self, response: Message) {
        self.response = Some(response);
    }

    fn response_mut(&mut self) -> &mut Message {
        let request = &self.request;
        self.response.get_or_insert_with(|| match request {
            Some(request) => Message::response_to(request),
            None => Message {
                id: String::new(),
                method: String::new(),
                headers: None,
                kind: MessageKind::Response,
                error: None,
                payload: None,
            },
        })
    }

    /// Build the response message from the context's outcome.
    ///
    /// An error wins over the response value. A response value that fails to
    /// encode turns into an error on the message.
    pub fn build_outbound(&mut self) -> Result<Message> {
        if self.request.is_none() {
            return Err(RpcError::Protocol("no request to respond to".into()));
        }

        let error = self.error.as_ref().map(ToString::to_string);
        let encoded = match (&error, &self.response_value) {
            (None, Some(value)) => Some(value.encode()),
            _ => None,
        };

        let out = self.response_mut();
        out.error = error;
        out.payload = None;
        match encoded {
            Some(Ok(bytes)) => out.payload = Some(bytes),
            Some(Err(e)) => out.set_error(&e),
            None => {}
        }
        Ok(out.clone())
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("id", &self.id())
            .field("method", &self.method())
            .field("error", &self.error)
            .field("desc", &self.desc)
            .field("deferred", &self.deferred.len())
            .finish()
    }
}

/// What a handler gets to see of the request.
///
/// Cheap to clone; carries the connection so handlers may call back to the
/// peer that called them.
#[derive(Clone, Debug)]
pub struct RequestContext {
    id: String,
    method: String,
    headers: Headers,
    callable: Option<Callable>,
}

impl RequestContext {
    /// Create a request context (for testing without a connection).
    pub fn new(id: impl Into<String>, method: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            method: method.into(),
            headers: Headers::new(),
            callable: None,
        }
    }

    pub(crate) fn from_context(ctx: &Context) -> Self {
        Self {
            id: ctx.id().to_string(),
            method: ctx.method().to_string(),
            headers: ctx.request_header().cloned().unwrap_or_default(),
            callable: ctx.callable().cloned(),
        }
    }

    /// Correlation id of the request.
    #[inline]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[inline]
    pub fn method(&self) -> &str {
        &self.method
    }

    /// Request headers (empty if none were sent).
    #[inline]
    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(key).map(String::as_str)
    }

    /// The connection the request arrived on.
    pub fn callable(&self) -> Option<&Callable> {
        self.callable.as_ref()
    }
}
