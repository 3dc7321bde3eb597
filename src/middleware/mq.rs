//! Requests relayed through a message queue.
//!
//! A request carrying the [`MQ_PROTOCOL`] header came from a broker rather
//! than from the connection it arrived on. [`Mq::middleware`] sends its
//! response to the broker through a send callback, addressed with the
//! request's target and reply topics. Frames received from the broker enter
//! the core through [`Mq::on_receive`].

use std::sync::Arc;

use bytes::Bytes;
use futures::future::BoxFuture;

use super::{handle_fn, middleware_fn, HandleFunc, Middleware};
use crate::callable::Callable;
use crate::error::{Result, RpcError};
use crate::protocol::Headers;
use crate::runtime::Core;
use crate::writer::{Writer, WriterCloser};

/// Marks a request as relayed by a message queue.
pub const MQ_PROTOCOL: &str = "MQ_PROTOCOL";
/// Topic the request was published to.
pub const MQ_TARGET_TOPIC: &str = "MQ_TARGET_TOPIC";
/// Topic the caller listens on for the response.
pub const MQ_REPLY_TOPIC: &str = "MQ_REPLY_TOPIC";

/// Error set on relayed requests without a target topic.
pub const MQ_NO_TARGET: &str = "MQ MSG WITHOUT TARGET TOPIC";

/// Publishes a response frame: `(target_topic, reply_topic, frame)`.
pub type MqSendFn = Arc<dyn Fn(&str, &str, Bytes) + Send + Sync>;

/// Headers marking a request as relayed between `target` and `reply`.
pub fn mq_headers(target: &str, reply: &str) -> Headers {
    Headers::from([
        (MQ_PROTOCOL.to_string(), "1".to_string()),
        (MQ_TARGET_TOPIC.to_string(), target.to_string()),
        (MQ_REPLY_TOPIC.to_string(), reply.to_string()),
    ])
}

/// Bridge between a core and a message queue.
pub struct Mq {
    callable: Callable,
    send: MqSendFn,
}

impl Mq {
    /// Create the bridge. Its virtual callable is started right away.
    pub fn new<F>(core: &Core, send: F) -> Self
    where
        F: Fn(&str, &str, Bytes) + Send + Sync + 'static,
    {
        let callable = Callable::new_virtual(core, DiscardWriter);
        callable.start();
        Self {
            callable,
            send: Arc::new(send),
        }
    }

    /// Feed bytes received from the broker into the core.
    pub async fn on_receive(&self, data: impl Into<Bytes>) -> Result<()> {
        self.callable.mock_read_data(data).await
    }

    /// The callable relayed requests are dispatched on.
    pub fn callable(&self) -> &Callable {
        &self.callable
    }

    pub fn close(&self) -> Result<()> {
        self.callable.close()
    }

    /// Redirect responses of relayed requests to the send callback.
    /// Other requests pass through untouched.
    pub fn middleware(&self) -> Middleware {
        let send = self.send.clone();
        middleware_fn(move |next: HandleFunc| {
            let send = send.clone();
            handle_fn(move |ctx| {
                let next = next.clone();
                let send = send.clone();
                Box::pin(async move {
                    let route = ctx
                        .request_header()
                        .filter(|headers| headers.contains_key(MQ_PROTOCOL))
                        .map(|headers| {
                            (
                                headers.get(MQ_TARGET_TOPIC).cloned(),
                                headers.get(MQ_REPLY_TOPIC).cloned().unwrap_or_default(),
                            )
                        });

                    let Some((target, reply)) = route else {
                        next(ctx).await;
                        return;
                    };
                    let Some(target) = target else {
                        ctx.set_error(RpcError::custom(MQ_NO_TARGET));
                        return;
                    };

                    ctx.set_writer(Some(Arc::new(MqWriter {
                        send,
                        target,
                        reply,
                    })));
                    next(ctx).await;
                })
            })
        })
    }
}

/// Hands the response frame to the send callback.
struct MqWriter {
    send: MqSendFn,
    target: String,
    reply: String,
}

impl Writer for MqWriter {
    fn write(&self, data: Bytes, _immediate: bool) -> BoxFuture<'_, Result<()>> {
        (self.send)(&self.target, &self.reply, data);
        Box::pin(futures::future::ready(Ok(())))
    }
}

/// Output of the relay callable. Only responses that could not be routed
/// end up here.
struct DiscardWriter;

impl Writer for DiscardWriter {
    fn write(&self, data: Bytes, _immediate: bool) -> BoxFuture<'_, Result<()>> {
        tracing::debug!("Dropping {} unroutable bytes", data.len());
        Box::pin(futures::future::ready(Ok(())))
    }
}

impl WriterCloser for DiscardWriter {
    fn close(&self) -> Result<()> {
        Ok(())
    }
}
