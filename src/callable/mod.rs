//! Connection binding.
//!
//! A [`Callable`] ties one connection to a [`Core`]: bytes read from the
//! connection are handed to the core's loop for dispatch, and the callable
//! offers the call API for sending requests to the peer.
//!
//! Two kinds exist:
//! - stream callables over any `AsyncRead + AsyncWrite` ([`Callable::from_stream`]),
//!   with a reader task and a dedicated writer task
//! - virtual callables ([`Callable::new_virtual`]) with no socket: inbound
//!   bytes are injected with [`Callable::mock_read_data`], outbound frames go
//!   to a user supplied [`WriterCloser`]
//!
//! Closing a callable fails all of its outstanding calls right away with
//! [`RpcError::ConnectionClosed`] instead of letting them run into their
//! timeout. Calls made after the close fail the same way.

mod signal;

use std::fmt;
use std::sync::atomic::{AtomicI32, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak};
use std::time::Duration;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::sync::watch;

use crate::codec::{decode_reply, ReplyDecodeFn};
use crate::error::{Result, RpcError};
use crate::handler::desc;
use crate::handler::Context;
use crate::middleware::{build_chain, handle_fn, HandleFunc, Middleware, MiddlewareChain};
use crate::protocol::{encode_message, FrameBuffer, Headers, Message};
use crate::runtime::{Core, Event};
use crate::time_wheel::{TimeWheel, TimeWheelEntry};
use crate::writer::{spawn_writer_task, Writer, WriterCloser};

pub use signal::SignalCallable;

/// Lifecycle callback, fired at most once.
pub type CallableCallback = Box<dyn FnOnce(&Callable, Option<&RpcError>) + Send>;

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;

static NEXT_CALLABLE_ID: AtomicU64 = AtomicU64::new(1);

const CREATED: u8 = 0;
const STARTED: u8 = 1;
const CLOSED: u8 = 2;

/// Lifecycle state of a callable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallableState {
    Created,
    Started,
    Closed,
}

struct CallableInner {
    id: u64,
    core: Core,
    writer: Arc<dyn Writer>,
    closer: Arc<dyn WriterCloser>,
    middleware: RwLock<MiddlewareChain>,
    on_ready: Mutex<Option<CallableCallback>>,
    on_close: Mutex<Option<CallableCallback>>,
    state: AtomicU8,
    time_wheel: Mutex<Option<TimeWheel>>,
    wheel_refs: AtomicI32,
    shutdown: watch::Sender<bool>,
    reader: Mutex<Option<BoxedReader>>,
    frames: Mutex<FrameBuffer>,
}

/// Handle to a connection bound to a [`Core`]. Cheap to clone.
#[derive(Clone)]
pub struct Callable {
    inner: Arc<CallableInner>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Callable {
    fn with_parts<W>(core: &Core, writer: Arc<W>, reader: Option<BoxedReader>) -> Self
    where
        W: WriterCloser + 'static,
    {
        let (shutdown, _) = watch::channel(false);
        Self {
            inner: Arc::new(CallableInner {
                id: NEXT_CALLABLE_ID.fetch_add(1, Ordering::Relaxed),
                core: core.clone(),
                writer: writer.clone(),
                closer: writer,
                middleware: RwLock::new(MiddlewareChain::new()),
                on_ready: Mutex::new(None),
                on_close: Mutex::new(None),
                state: AtomicU8::new(CREATED),
                time_wheel: Mutex::new(None),
                wheel_refs: AtomicI32::new(0),
                shutdown,
                reader: Mutex::new(reader),
                frames: Mutex::new(FrameBuffer::with_max_message_size(
                    core.config().max_message_size,
                )),
            }),
        }
    }

    /// Bind a byte stream to `core`.
    ///
    /// Spawns the writer task immediately, so this must run inside a tokio
    /// runtime. Reading starts with [`start`](Self::start).
    pub fn from_stream<S>(core: &Core, stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let (writer, task) = spawn_writer_task(write_half, core.config().writer.clone());

        let callable = Self::with_parts(core, Arc::new(writer), Some(Box::new(read_half)));

        let weak = Arc::downgrade(&callable.inner);
        tokio::spawn(async move {
            if let Ok(Err(e)) = task.await {
                tracing::warn!("Writer task failed: {}", e);
                if let Some(callable) = upgrade(&weak) {
                    let _ = callable.close_with(Some(e));
                }
            }
        });
        callable
    }

    /// Connect over TCP and bind the connection to `core`.
    pub async fn connect(core: &Core, addr: impl tokio::net::ToSocketAddrs) -> Result<Self> {
        crate::transport::connect_tcp(core, addr).await
    }

    /// Create a callable without a socket.
    ///
    /// Everything the callable sends goes to `writer`; bytes "received" are
    /// injected with [`mock_read_data`](Self::mock_read_data).
    pub fn new_virtual<W>(core: &Core, writer: W) -> Self
    where
        W: WriterCloser + 'static,
    {
        Self::with_parts(core, Arc::new(writer), None)
    }

    /// Unique id of this callable within the process.
    #[inline]
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn core(&self) -> &Core {
        &self.inner.core
    }

    pub fn state(&self) -> CallableState {
        match self.inner.state.load(Ordering::Acquire) {
            CREATED => CallableState::Created,
            STARTED => CallableState::Started,
            _ => CallableState::Closed,
        }
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.inner.state.load(Ordering::Acquire) == CLOSED
    }

    /// The connection's writer.
    pub fn writer(&self) -> Arc<dyn Writer> {
        self.inner.writer.clone()
    }

    /// Set the callback fired when the callable is started.
    pub fn on_ready<F>(&self, f: F)
    where
        F: FnOnce(&Callable, Option<&RpcError>) + Send + 'static,
    {
        *lock(&self.inner.on_ready) = Some(Box::new(f));
    }

    /// Set the callback fired when the callable is closed.
    pub fn on_close<F>(&self, f: F)
    where
        F: FnOnce(&Callable, Option<&RpcError>) + Send + 'static,
    {
        *lock(&self.inner.on_close) = Some(Box::new(f));
    }

    /// Append middlewares used for outbound calls made without their own list.
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

    /// Attach an idle timer. Unbound callables never expire.
    pub fn bind_time_wheel(&self, wheel: TimeWheel) {
        *lock(&self.inner.time_wheel) = Some(wheel);
    }

    /// Tell the bound time wheel (if any) the connection is alive.
    pub fn notify_time_wheel(&self) {
        let wheel = lock(&self.inner.time_wheel).clone();
        if let Some(wheel) = wheel {
            wheel.notify(Arc::new(self.clone()));
        }
    }

    /// Start reading. Fires the ready callback. Calling it again is a no-op.
    pub fn start(&self) {
        if self
            .inner
            .state
            .compare_exchange(CREATED, STARTED, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        if let Some(reader) = lock(&self.inner.reader).take() {
            tokio::spawn(read_loop(
                self.clone(),
                reader,
                self.inner.shutdown.subscribe(),
                self.inner.core.config().read_buffer_size,
            ));
        }

        self.notify_time_wheel();
        let ready = lock(&self.inner.on_ready).take();
        if let Some(cb) = ready {
            cb(self, None);
        }
    }

    /// Close the connection. Closing twice is a no-op.
    pub fn close(&self) -> Result<()> {
        self.close_with(None)
    }

    pub(crate) fn close_with(&self, err: Option<RpcError>) -> Result<()> {
        if self.inner.state.swap(CLOSED, Ordering::AcqRel) == CLOSED {
            return Ok(());
        }

        self.inner.shutdown.send_replace(true);
        let result = self.inner.closer.close();

        let failed = self.inner.core.promises().fail_owner(self.id());
        if failed > 0 {
            tracing::debug!("Callable {} closed with {} calls in flight", self.id(), failed);
        }

        let on_close = lock(&self.inner.on_close).take();
        if let Some(cb) = on_close {
            cb(self, err.as_ref());
        }
        result
    }

    /// Feed bytes as if they had been read from the connection.
    ///
    /// The bytes are decoded on the core's loop, in injection order.
    pub async fn mock_read_data(&self, data: impl Into<Bytes>) -> Result<()> {
        if self.is_closed() {
            return Err(RpcError::ConnectionClosed);
        }
        self.inner
            .core
            .post(Event::Readable {
                callable: self.clone(),
                data: data.into(),
            })
            .await
    }

    /// Decode buffered bytes into messages. Called on the core's loop only.
    pub(crate) fn push_read_data(&self, data: &[u8]) -> Vec<Message> {
        lock(&self.inner.frames).push(data)
    }

    /// Call `method` without input or output.
    pub async fn call(&self, timeout: Duration, method: &str) -> Result<()> {
        self.call_full::<(), ()>(timeout, method, None, None, None, &[])
            .await
            .map(drop)
    }

    /// Call `method` with request headers, returning the response headers.
    pub async fn call_with_headers(
        &self,
        timeout: Duration,
        method: &str,
        headers: Headers,
    ) -> Result<Headers> {
        self.call_full::<(), ()>(timeout, method, Some(headers), None, None, &[])
            .await
    }

    /// Call `method` with a request value.
    pub async fn call_in<I>(&self, timeout: Duration, method: &str, input: I) -> Result<()>
    where
        I: Serialize + Send + Sync + 'static,
    {
        self.call_full::<I, ()>(timeout, method, None, Some(input), None, &[])
            .await
            .map(drop)
    }

    /// Call `method` and decode its response into `out`.
    pub async fn call_out<O>(&self, timeout: Duration, method: &str, out: &mut O) -> Result<()>
    where
        O: DeserializeOwned + Send + Sync + 'static,
    {
        self.call_full::<(), O>(timeout, method, None, None, Some(out), &[])
            .await
            .map(drop)
    }

    /// Call `method` with a request value and decode its response into `out`.
    pub async fn call_in_out<I, O>(
        &self,
        timeout: Duration,
        method: &str,
        input: I,
        out: &mut O,
    ) -> Result<()>
    where
        I: Serialize + Send + Sync + 'static,
        O: DeserializeOwned + Send + Sync + 'static,
    {
        self.call_full(timeout, method, None, Some(input), Some(out), &[])
            .await
            .map(drop)
    }

    /// Like [`call_in_out`](Self::call_in_out) with optional parts and a
    /// middleware list replacing the callable's own chain for this call.
    pub async fn call_with<I, O>(
        &self,
        timeout: Duration,
        method: &str,
        input: Option<I>,
        out: Option<&mut O>,
        middlewares: &[Middleware],
    ) -> Result<()>
    where
        I: Serialize + Send + Sync + 'static,
        O: DeserializeOwned + Send + Sync + 'static,
    {
        self.call_full(timeout, method, None, input, out, middlewares)
            .await
            .map(drop)
    }

    /// The call every other variant reduces to.
    ///
    /// Middleware selection: `middlewares` if non-empty, else the callable's
    /// own chain if non-empty, else the core's chain; the core's pre-use
    /// chain always runs outermost.
    ///
    /// If the peer answers without data although `out` was given, `out` is
    /// left untouched and a warning is logged. A response that fails to
    /// decode adds its error to whatever error the call already had.
    ///
    /// Returns the response headers (empty if there were none).
    pub async fn call_full<I, O>(
        &self,
        timeout: Duration,
        method: &str,
        headers: Option<Headers>,
        input: Option<I>,
        out: Option<&mut O>,
        middlewares: &[Middleware],
    ) -> Result<Headers>
    where
        I: Serialize + Send + Sync + 'static,
        O: DeserializeOwned + Send + Sync + 'static,
    {
        if self.is_closed() {
            return Err(RpcError::ConnectionClosed);
        }

        let core = &self.inner.core;
        let mut ctx = core.context_pool().get();
        ctx.init(Some(self.clone()), Message::request(method, headers));

        let mut bits = 0;
        if let Some(input) = input {
            bits |= desc::REQUEST_DATA;
            ctx.set_request(input)?;
        }
        let decode: Option<ReplyDecodeFn> = if out.is_some() {
            bits |= desc::RESPONSE_DATA;
            Some(decode_reply::<O>)
        } else {
            None
        };
        ctx.set_func_desc(bits);

        let handler = {
            let terminal = self.invoke_handle(timeout, decode);
            let own = self
                .inner
                .middleware
                .read()
                .unwrap_or_else(PoisonError::into_inner);
            let chained = if !middlewares.is_empty() {
                build_chain(middlewares, terminal)
            } else if !own.is_empty() {
                own.build(terminal)
            } else {
                core.build_chain(terminal)
            };
            core.build_pre_used_chain(chained)
        };
        handler(&mut *ctx).await;

        if let Some(out) = out {
            if let Some(value) = ctx.take_reply() {
                match value.downcast::<O>() {
                    Ok(value) => *out = *value,
                    Err(_) => ctx.append_error(RpcError::Protocol(
                        "response value has the wrong type".into(),
                    )),
                }
            }
        }

        let headers = ctx.response_header().cloned().unwrap_or_default();
        match ctx.take_error() {
            Some(e) => Err(e),
            None => Ok(headers),
        }
    }

    fn invoke_handle(&self, timeout: Duration, decode: Option<ReplyDecodeFn>) -> HandleFunc {
        let callable = self.clone();
        handle_fn(move |ctx| {
            let callable = callable.clone();
            Box::pin(async move {
                callable.perform(timeout, ctx).await;
                if let Some(decode) = decode {
                    decode_response(ctx, decode);
                }
            })
        })
    }

    /// Send the context's request and wait for the response.
    ///
    /// The response message and its error end up on the context. Nothing is
    /// sent if the context already carries an error.
    pub async fn perform(&self, timeout: Duration, ctx: &mut Context) {
        if ctx.error().is_some() {
            return;
        }

        let frame = match ctx.request_message().map(encode_message) {
            Some(Ok(frame)) => frame,
            Some(Err(e)) => {
                ctx.set_error(e);
                return;
            }
            None => {
                ctx.set_error(RpcError::Protocol("no request to send".into()));
                return;
            }
        };

        let pending = self.inner.core.promises().add(ctx.id(), self.id());
        if self.is_closed() {
            ctx.set_error(RpcError::ConnectionClosed);
            return;
        }

        let Some(writer) = ctx.writer() else {
            ctx.set_error(RpcError::Protocol("no writer to send the request".into()));
            return;
        };
        if let Err(e) = writer.write(frame, false).await {
            ctx.set_error(e);
            return;
        }

        match pending.wait(timeout).await {
            Ok(ack) => {
                if let Some(e) = ack.to_error() {
                    ctx.set_error(e);
                }
                ctx.set_response_message(ack);
            }
            Err(e) => ctx.set_error(e),
        }
    }
}

fn decode_response(ctx: &mut Context, decode: ReplyDecodeFn) {
    let decoded = match ctx.response_message() {
        Some(ack) if ack.has_payload() => decode(ack.payload()),
        Some(ack) => {
            if ack.error.is_none() {
                tracing::warn!(
                    "call [{}]: response carries no data, output left unchanged",
                    ctx.method()
                );
            }
            return;
        }
        None => return,
    };

    match decoded {
        Ok(value) => ctx.set_reply(value),
        Err(e) => {
            tracing::warn!("call [{}]: cannot decode response: {}", ctx.method(), e);
            ctx.append_error(e);
        }
    }
}

fn upgrade(weak: &Weak<CallableInner>) -> Option<Callable> {
    weak.upgrade().map(|inner| Callable { inner })
}

async fn read_loop(
    callable: Callable,
    mut reader: BoxedReader,
    mut shutdown: watch::Receiver<bool>,
    buffer_size: usize,
) {
    let core = callable.core().clone();
    let mut buf = vec![0u8; buffer_size.max(1)];

    let error = loop {
        let n = tokio::select! {
            _ = shutdown.wait_for(|closed| *closed) => return,
            read = reader.read(&mut buf) => match read {
                Ok(0) => break None,
                Ok(n) => n,
                Err(e) => break Some(RpcError::Io(e)),
            },
        };

        let event = Event::Readable {
            callable: callable.clone(),
            data: Bytes::copy_from_slice(&buf[..n]),
        };
        if core.send_event(event).await.is_err() {
            break Some(RpcError::ConnectionClosed);
        }
    };

    if let Some(e) = &error {
        tracing::debug!("Callable {} read loop ended: {}", callable.id(), e);
    }

    // Close on the loop so frames read before EOF are dispatched first.
    let event = Event::Closed {
        callable: callable.clone(),
        error,
    };
    if let Err(Event::Closed { error, .. }) = core.send_event(event).await {
        let _ = callable.close_with(error);
    }
}

impl TimeWheelEntry for Callable {
    fn ref_counter(&self) -> &AtomicI32 {
        &self.inner.wheel_refs
    }

    fn on_expired(&self) {
        tracing::debug!("Callable {} idle, closing", self.id());
        let _ = self.close();
    }
}

impl fmt::Debug for Callable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Callable")
            .field("id", &self.id())
            .field("state", &self.state())
            .finish()
    }
}

impl PartialEq for Callable {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Callable {}
