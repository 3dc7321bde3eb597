//! The runtime: registry, middleware chains, pending calls and the loop.
//!
//! A [`Core`] owns everything shared by its connections. Its loop task
//! receives the bytes read from every callable, decodes them in arrival
//! order, spawns one task per inbound request and resolves pending calls for
//! inbound responses. Requests therefore never wait for each other, and a
//! call awaiting its response never blocks the loop that delivers it.
//!
//! Register functions and middlewares before traffic starts: the chains are
//! read on every request and changing them mid-flight gives no ordering
//! guarantees.
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//! use callwire::{Callable, Core, Function, RequestContext};
//!
//! async fn echo(_ctx: RequestContext, s: String) -> callwire::Result<String> {
//!     Ok(s)
//! }
//!
//! # async fn demo() -> callwire::Result<()> {
//! let core = Core::builder().build();
//! core.register(Function::with_input_output(echo), &[])?;
//! core.start();
//!
//! let callable = Callable::connect(&core, "127.0.0.1:9000").await?;
//! callable.start();
//!
//! let mut out = String::new();
//! callable
//!     .call_in_out(Duration::from_secs(1), "echo", "hello".to_string(), &mut out)
//!     .await?;
//! # Ok(())
//! # }
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use bytes::Bytes;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::callable::Callable;
use crate::error::{Result, RpcError};
use crate::handler::{
    Context, ContextPool, Function, FunctionRegistry, RegisteredFunction,
    DEFAULT_CONTEXT_POOL_CAPACITY,
};
use crate::middleware::{handle_fn, HandleFunc, Middleware, MiddlewareChain};
use crate::promise::PromiseGroup;
use crate::protocol::{encode_message, Message, DEFAULT_MAX_MESSAGE_SIZE};
use crate::writer::WriterConfig;

/// Default capacity of the loop's event queue.
pub const DEFAULT_EVENT_QUEUE_CAPACITY: usize = 1024;

/// Default size of a connection's read buffer.
pub const DEFAULT_READ_BUFFER_SIZE: usize = 64 * 1024;

/// Runtime configuration.
#[derive(Debug, Clone)]
pub struct CoreConfig {
    /// Frames announcing a larger envelope are discarded.
    pub max_message_size: usize,
    /// Abort the process on a handler panic instead of answering
    /// "invocation failed".
    pub debug: bool,
    /// Idle execution contexts kept for reuse.
    pub context_pool_capacity: usize,
    /// Events (reads, closes) queued for the loop before readers wait.
    pub event_queue_capacity: usize,
    /// Bytes read from a connection at once.
    pub read_buffer_size: usize,
    /// Writer task settings for stream connections.
    pub writer: WriterConfig,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            debug: false,
            context_pool_capacity: DEFAULT_CONTEXT_POOL_CAPACITY,
            event_queue_capacity: DEFAULT_EVENT_QUEUE_CAPACITY,
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            writer: WriterConfig::default(),
        }
    }
}

/// Builder for a [`Core`].
#[derive(Debug, Default)]
pub struct CoreBuilder {
    config: CoreConfig,
}

impl CoreBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Largest accepted envelope. Default: 32 MB
    pub fn max_message_size(mut self, size: usize) -> Self {
        self.config.max_message_size = size;
        self
    }

    /// Abort on handler panics. Default: false
    pub fn debug(mut self, debug: bool) -> Self {
        self.config.debug = debug;
        self
    }

    /// Default: 64
    pub fn context_pool_capacity(mut self, capacity: usize) -> Self {
        self.config.context_pool_capacity = capacity;
        self
    }

    /// Default: 1024
    pub fn event_queue_capacity(mut self, capacity: usize) -> Self {
        self.config.event_queue_capacity = capacity;
        self
    }

    /// Default: 64 KB
    pub fn read_buffer_size(mut self, size: usize) -> Self {
        self.config.read_buffer_size = size;
        self
    }

    /// Writer settings for stream connections.
    pub fn writer_config(mut self, writer: WriterConfig) -> Self {
        self.config.writer = writer;
        self
    }

    pub fn build(self) -> Core {
        Core::with_config(self.config)
    }
}

/// Work for the loop task.
pub(crate) enum Event {
    /// Bytes read from a callable.
    Readable { callable: Callable, data: Bytes },
    /// A callable's connection ended.
    Closed {
        callable: Callable,
        error: Option<RpcError>,
    },
    /// Arbitrary work to run on the loop.
    RunInLoop(Box<dyn FnOnce() + Send>),
}

struct CoreInner {
    config: CoreConfig,
    registry: FunctionRegistry,
    middleware: RwLock<MiddlewareChain>,
    pre_use: RwLock<MiddlewareChain>,
    promises: PromiseGroup,
    contexts: ContextPool,
    events: mpsc::Sender<Event>,
    receiver: Mutex<Option<mpsc::Receiver<Event>>>,
    started: AtomicBool,
    shutdown: watch::Sender<bool>,
}

/// Handle to a runtime. Cheap to clone.
#[derive(Clone)]
pub struct Core {
    inner: Arc<CoreInner>,
}

impl Core {
    /// Create a runtime with the default configuration.
    pub fn new() -> Self {
        Self::with_config(CoreConfig::default())
    }

    pub fn builder() -> CoreBuilder {
        CoreBuilder::new()
    }

    pub fn with_config(config: CoreConfig) -> Self {
        let (events, receiver) = mpsc::channel(config.event_queue_capacity.max(1));
        let (shutdown, _) = watch::channel(false);
        Self {
            inner: Arc::new(CoreInner {
                registry: FunctionRegistry::new(config.debug),
                middleware: RwLock::new(MiddlewareChain::new()),
                pre_use: RwLock::new(MiddlewareChain::new()),
                promises: PromiseGroup::new(),
                contexts: ContextPool::new(config.context_pool_capacity),
                events,
                receiver: Mutex::new(Some(receiver)),
                started: AtomicBool::new(false),
                shutdown,
                config,
            }),
        }
    }

    pub fn config(&self) -> &CoreConfig {
        &self.inner.config
    }

    /// Register a function under its own name. See [`FunctionRegistry::register`].
    pub fn register(&self, function: Function, middlewares: &[Middleware]) -> Result<()> {
        self.inner.registry.register(function, middlewares)
    }

    /// Register a function under `name`, replacing any function of that name.
    pub fn register_with_name(
        &self,
        name: impl Into<String>,
        function: Function,
        middlewares: &[Middleware],
    ) -> Result<()> {
        self.inner
            .registry
            .register_with_name(name, function, middlewares)
    }

    pub fn registry(&self) -> &FunctionRegistry {
        &self.inner.registry
    }

    /// Append to the chain wrapping every matched function (and outbound
    /// calls that have no chain of their own).
    pub fn use_middleware<I>(&self, middlewares: I)
    where
        I: IntoIterator<Item = Middleware>,
    {
        self.inner
            .middleware
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .use_middleware(middlewares);
    }

    /// Append to the chain wrapping the whole request pipeline, unknown
    /// methods included.
    pub fn pre_use<I>(&self, middlewares: I)
    where
        I: IntoIterator<Item = Middleware>,
    {
        self.inner
            .pre_use
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .use_middleware(middlewares);
    }

    /// Wrap `handler` with the core's chain.
    pub fn build_chain(&self, handler: HandleFunc) -> HandleFunc {
        self.inner
            .middleware
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .build(handler)
    }

    /// Wrap `handler` with the pre-use chain.
    pub fn build_pre_used_chain(&self, handler: HandleFunc) -> HandleFunc {
        self.inner
            .pre_use
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .build(handler)
    }

    pub fn promises(&self) -> &PromiseGroup {
        &self.inner.promises
    }

    pub fn context_pool(&self) -> &ContextPool {
        &self.inner.contexts
    }

    /// Drive the loop until [`close`](Self::close). Only the first call runs
    /// the loop; later calls return immediately.
    pub async fn run(&self) {
        if self
            .inner
            .started
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        let receiver = self
            .inner
            .receiver
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(mut receiver) = receiver else {
            return;
        };

        let mut shutdown = self.inner.shutdown.subscribe();
        loop {
            tokio::select! {
                biased;
                _ = shutdown.wait_for(|closed| *closed) => break,
                event = receiver.recv() => match event {
                    Some(event) => self.handle_event(event),
                    None => break,
                },
            }
        }
        tracing::debug!("Core loop stopped");
    }

    /// Spawn [`run`](Self::run) on the current runtime.
    pub fn start(&self) -> JoinHandle<()> {
        let core = self.clone();
        tokio::spawn(async move { core.run().await })
    }

    /// Break the loop. Pending events are dropped.
    pub fn close(&self) {
        self.inner.shutdown.send_replace(true);
    }

    pub fn is_closed(&self) -> bool {
        *self.inner.shutdown.borrow()
    }

    /// Run `f` on the loop, after the events already queued.
    pub async fn run_in_loop<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.post(Event::RunInLoop(Box::new(f))).await
    }

    pub(crate) async fn post(&self, event: Event) -> Result<()> {
        self.send_event(event)
            .await
            .map_err(|_| RpcError::ConnectionClosed)
    }

    /// Queue an event, handing it back if the loop is gone.
    pub(crate) async fn send_event(&self, event: Event) -> std::result::Result<(), Event> {
        if self.is_closed() {
            return Err(event);
        }
        self.inner.events.send(event).await.map_err(|e| e.0)
    }

    fn handle_event(&self, event: Event) {
        match event {
            Event::Readable { callable, data } => self.notify_callable_read(&callable, &data),
            Event::Closed { callable, error } => {
                let _ = callable.close_with(error);
            }
            Event::RunInLoop(f) => f(),
        }
    }

    /// Decode what `callable` delivered and dispatch every complete message.
    ///
    /// Requests are handled on their own tasks; responses resolve their
    /// pending call here, in arrival order.
    pub fn notify_callable_read(&self, callable: &Callable, data: &[u8]) {
        for msg in callable.push_read_data(data) {
            callable.notify_time_wheel();
            if msg.is_request() {
                let core = self.clone();
                let callable = callable.clone();
                tokio::spawn(async move { core.handle_request(callable, msg).await });
            } else {
                let id = msg.id.clone();
                if !self.inner.promises.fulfill(&id, Ok(msg)) {
                    tracing::trace!("Dropping response {} without a pending call", id);
                }
            }
        }
    }

    async fn handle_request(&self, callable: Callable, request: Message) {
        let id = request.id.clone();
        let mut ctx = self.inner.contexts.get();
        ctx.init(Some(callable), request);

        // Resolved before the pre-use chain so it sees the descriptor and
        // the decoded request value.
        let resolved = self.resolve(&mut ctx);

        let core = self.clone();
        let dispatch = handle_fn(move |ctx| {
            let core = core.clone();
            let resolved = resolved.clone();
            Box::pin(async move { core.exec_with_middleware(ctx, resolved).await })
        });
        let handler = self.build_pre_used_chain(dispatch);
        handler(&mut *ctx).await;

        let out = match ctx.build_outbound() {
            Ok(out) => out,
            Err(e) => {
                tracing::error!("Request {}: cannot build response: {}", id, e);
                return;
            }
        };
        let frame = match encode_message(&out) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::error!("Request {}: cannot encode response: {}", id, e);
                return;
            }
        };

        if let Some(writer) = ctx.writer() {
            if let Err(e) = writer.write(frame, false).await {
                tracing::warn!("Request {}: cannot write response: {}", id, e);
            }
        }
    }

    /// Look up the context's method, set its descriptor and decode the
    /// request value. A decode failure is left on the context.
    fn resolve(&self, ctx: &mut Context) -> Option<Arc<RegisteredFunction>> {
        let function = self.inner.registry.get(ctx.method())?;

        ctx.take_request_value();
        ctx.set_func_desc(function.desc());
        let payload = ctx.request_message().map(Message::payload).unwrap_or_default();
        match function.decode_request(payload) {
            Ok(Some(value)) => ctx.put_request_value(value),
            Ok(None) => {}
            Err(e) => ctx.set_error(e),
        }
        Some(function)
    }

    async fn exec_with_middleware(
        &self,
        ctx: &mut Context,
        resolved: Option<Arc<RegisteredFunction>>,
    ) {
        // Pre-use middleware may have rewritten the method.
        let function = match resolved {
            Some(function) if function.name() == ctx.method() => function,
            _ => match self.resolve(ctx) {
                Some(function) => function,
                None => {
                    ctx.set_error(RpcError::FunctionNotFound);
                    return;
                }
            },
        };
        if ctx.error().is_some() {
            return;
        }

        let handler = self.build_chain(function.handle().clone());
        handler(ctx).await;
    }
}

impl Default for Core {
    fn default() -> Self {
        Self::new()
    }
}
