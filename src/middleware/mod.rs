//! Onion-style request interceptors.
//!
//! A [`Middleware`] turns the next [`HandleFunc`] into a replacement handler.
//! [`MiddlewareChain::build`] wraps a terminal handler so that the first
//! registered middleware runs outermost: it sees the request first and the
//! outcome last.
//!
//! # Example
//!
//! ```
//! use callwire::middleware::{handle_fn, middleware_fn, HandleFunc, Middleware};
//!
//! fn trace_method() -> Middleware {
//!     middleware_fn(|next: HandleFunc| {
//!         handle_fn(move |ctx| {
//!             let next = next.clone();
//!             Box::pin(async move {
//!                 tracing::debug!("-> {}", ctx.method());
//!                 next(&mut *ctx).await;
//!                 tracing::debug!("<- {} error={:?}", ctx.method(), ctx.error());
//!             })
//!         })
//!     })
//! }
//! # let _ = trace_method();
//! ```

mod dump;
mod error_log;
mod mq;
mod recover;
mod request_not_nil;

use std::sync::Arc;

use futures::future::BoxFuture;

use crate::handler::Context;

pub use dump::dump;
pub use error_log::error_log;
pub use mq::{
    mq_headers, Mq, MqSendFn, MQ_NO_TARGET, MQ_PROTOCOL, MQ_REPLY_TOPIC, MQ_TARGET_TOPIC,
};
pub use recover::recover;
pub use request_not_nil::{request_not_nil, REQUEST_NIL};

/// A step of request processing over the execution context.
pub type HandleFunc = Arc<dyn for<'a> Fn(&'a mut Context) -> BoxFuture<'a, ()> + Send + Sync>;

/// Wraps the next handler into a new one.
pub type Middleware = Arc<dyn Fn(HandleFunc) -> HandleFunc + Send + Sync>;

/// Box a closure as a [`HandleFunc`].
pub fn handle_fn<F>(f: F) -> HandleFunc
where
    F: for<'a> Fn(&'a mut Context) -> BoxFuture<'a, ()> + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Box a closure as a [`Middleware`].
pub fn middleware_fn<F>(f: F) -> Middleware
where
    F: Fn(HandleFunc) -> HandleFunc + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Wrap `handler` with `middlewares`, first one outermost.
pub fn build_chain(middlewares: &[Middleware], handler: HandleFunc) -> HandleFunc {
    middlewares
        .iter()
        .rev()
        .fold(handler, |next, middleware| middleware(next))
}

/// Ordered list of middlewares.
#[derive(Clone, Default)]
pub struct MiddlewareChain {
    middlewares: Vec<Middleware>,
}

impl MiddlewareChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append middlewares after the ones already registered.
    pub fn use_middleware<I>(&mut self, middlewares: I)
    where
        I: IntoIterator<Item = Middleware>,
    {
        self.middlewares.extend(middlewares);
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.middlewares.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.middlewares.is_empty()
    }

    /// Compose the chain around `handler`. An empty chain returns it unchanged.
    pub fn build(&self, handler: HandleFunc) -> HandleFunc {
        build_chain(&self.middlewares, handler)
    }
}

impl From<Vec<Middleware>> for MiddlewareChain {
    fn from(middlewares: Vec<Middleware>) -> Self {
        Self { middlewares }
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    type Trace = Arc<Mutex<Vec<String>>>;

    fn tracing_middleware(name: &'static str, trace: Trace) -> Middleware {
        middleware_fn(move |next: HandleFunc| {
            let trace = trace.clone();
            handle_fn(move |ctx| {
                let next = next.clone();
                let trace = trace.clone();
                Box::pin(async move {
                    trace.lock().unwrap().push(format!("{name}-before"));
                    next(&mut *ctx).await;
                    trace.lock().unwrap().push(format!("{name}-after"));
                })
            })
        })
    }

    fn terminal(trace: Trace) -> HandleFunc {
        handle_fn(move |_ctx| {
            let trace = trace.clone();
            Box::pin(async move {
                trace.lock().unwrap().push("H".to_string());
            })
        })
    }

    #[tokio::test]
    async fn test_first_registered_runs_outermost() {
        let trace: Trace = Arc::default();
        let mut chain = MiddlewareChain::new();
        chain.use_middleware([
            tracing_middleware("A", trace.clone()),
            tracing_middleware("B", trace.clone()),
        ]);

        let handler = chain.build(terminal(trace.clone()));
        let mut ctx = Context::default();
        handler(&mut ctx).await;

        assert_eq!(
            *trace.lock().unwrap(),
            ["A-before", "B-before", "H", "B-after", "A-after"]
        );
    }

    #[tokio::test]
    async fn test_empty_chain_returns_handler_unchanged() {
        let trace: Trace = Arc::default();
        let handler = terminal(trace.clone());

        let built = MiddlewareChain::new().build(handler.clone());
        assert!(Arc::ptr_eq(&handler, &built));

        built(&mut Context::default()).await;
        assert_eq!(*trace.lock().unwrap(), ["H"]);
    }

    #[tokio::test]
    async fn test_middleware_can_short_circuit() {
        let trace: Trace = Arc::default();
        let stop = middleware_fn(|_next: HandleFunc| {
            handle_fn(|ctx| {
                Box::pin(async move {
                    ctx.set_error(crate::RpcError::custom("denied"));
                })
            })
        });

        let handler = build_chain(&[stop], terminal(trace.clone()));
        let mut ctx = Context::default();
        handler(&mut ctx).await;

        assert!(trace.lock().unwrap().is_empty());
        assert_eq!(ctx.error().map(|e| e.to_string()).as_deref(), Some("denied"));
    }
}
