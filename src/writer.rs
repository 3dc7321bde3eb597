//! Output side of a connection.
//!
//! [`Writer`] is what the dispatch engine writes encoded frames into. Stream
//! connections use a dedicated writer task fed through an mpsc channel, so
//! concurrent handlers never contend on a lock around the socket:
//!
//! ```text
//! Handler 1 ─┐
//! Handler 2 ─┼─► mpsc::Sender<Bytes> ─► Writer Task ─► Socket
//! Caller  N ─┘
//! ```
//!
//! The task batches whatever frames are ready and flushes once per batch.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures::future::BoxFuture;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;

use crate::error::{Result, RpcError};

/// Default maximum pending frames before backpressure kicks in.
pub const DEFAULT_MAX_PENDING_FRAMES: usize = 1024;

/// Default channel capacity.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// Default backpressure timeout.
pub const DEFAULT_BACKPRESSURE_TIMEOUT: Duration = Duration::from_secs(5);

/// Maximum frames to batch before a flush.
const MAX_BATCH_SIZE: usize = 64;

/// Sink for encoded frames.
///
/// `immediate` asks for the frame to be queued without waiting: a full queue
/// is reported as [`RpcError::BackpressureTimeout`] instead of blocking.
pub trait Writer: Send + Sync {
    fn write(&self, data: Bytes, immediate: bool) -> BoxFuture<'_, Result<()>>;
}

/// A [`Writer`] that owns the connection and can tear it down.
pub trait WriterCloser: Writer {
    /// Close the output. Frames already queued are still written.
    fn close(&self) -> Result<()>;
}

/// Configuration for the writer task.
#[derive(Debug, Clone)]
pub struct WriterConfig {
    /// Maximum pending frames before backpressure kicks in.
    pub max_pending_frames: usize,
    /// Channel capacity for frame queue.
    pub channel_capacity: usize,
    /// Timeout when waiting for backpressure to clear.
    pub backpressure_timeout: Duration,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            max_pending_frames: DEFAULT_MAX_PENDING_FRAMES,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            backpressure_timeout: DEFAULT_BACKPRESSURE_TIMEOUT,
        }
    }
}

/// Handle for sending frames to the writer task.
///
/// Cheaply cloneable; every clone feeds the same task.
#[derive(Clone)]
pub struct WriterHandle {
    tx: mpsc::Sender<Bytes>,
    pending: Arc<AtomicUsize>,
    closed: Arc<AtomicBool>,
    shutdown: Arc<Notify>,
    max_pending: usize,
    timeout: Duration,
}

impl WriterHandle {
    /// Queue a frame, waiting while backpressure is active.
    pub async fn send(&self, frame: Bytes) -> Result<()> {
        self.check_open()?;
        if self.is_backpressure_active() {
            self.wait_for_backpressure().await?;
        }

        self.pending.fetch_add(1, Ordering::AcqRel);
        self.tx.send(frame).await.map_err(|_| {
            self.pending.fetch_sub(1, Ordering::Release);
            RpcError::ConnectionClosed
        })
    }

    /// Queue a frame without waiting.
    pub fn try_send(&self, frame: Bytes) -> Result<()> {
        self.check_open()?;
        if self.is_backpressure_active() {
            return Err(RpcError::BackpressureTimeout);
        }

        self.pending.fetch_add(1, Ordering::AcqRel);
        self.tx.try_send(frame).map_err(|e| {
            self.pending.fetch_sub(1, Ordering::Release);
            match e {
                mpsc::error::TrySendError::Full(_) => RpcError::BackpressureTimeout,
                mpsc::error::TrySendError::Closed(_) => RpcError::ConnectionClosed,
            }
        })
    }

    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            Err(RpcError::ConnectionClosed)
        } else {
            Ok(())
        }
    }

    async fn wait_for_backpressure(&self) -> Result<()> {
        let start = Instant::now();
        let check_interval = Duration::from_micros(100);

        while self.is_backpressure_active() {
            if start.elapsed() > self.timeout {
                return Err(RpcError::BackpressureTimeout);
            }
            tokio::time::sleep(check_interval).await;
        }
        Ok(())
    }

    /// Check if backpressure is currently active.
    #[inline]
    pub fn is_backpressure_active(&self) -> bool {
        self.pending.load(Ordering::Acquire) >= self.max_pending
    }

    /// Frames queued but not yet written.
    #[inline]
    pub fn pending_count(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl Writer for WriterHandle {
    fn write(&self, data: Bytes, immediate: bool) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            if immediate {
                self.try_send(data)
            } else {
                self.send(data).await
            }
        })
    }
}

impl WriterCloser for WriterHandle {
    fn close(&self) -> Result<()> {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.shutdown.notify_one();
        }
        Ok(())
    }
}

/// Spawn the writer task and return a handle for sending frames.
///
/// The task ends when the handle is closed or every clone of it is dropped;
/// it then flushes and shuts down the write half.
pub fn spawn_writer_task<W>(writer: W, config: WriterConfig) -> (WriterHandle, JoinHandle<Result<()>>)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::channel(config.channel_capacity);
    let pending = Arc::new(AtomicUsize::new(0));
    let shutdown = Arc::new(Notify::new());

    let handle = WriterHandle {
        tx,
        pending: pending.clone(),
        closed: Arc::new(AtomicBool::new(false)),
        shutdown: shutdown.clone(),
        max_pending: config.max_pending_frames,
        timeout: config.backpressure_timeout,
    };

    let task = tokio::spawn(writer_loop(rx, writer, pending, shutdown));
    (handle, task)
}

async fn writer_loop<W>(
    mut rx: mpsc::Receiver<Bytes>,
    mut writer: W,
    pending: Arc<AtomicUsize>,
    shutdown: Arc<Notify>,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut batch = Vec::with_capacity(MAX_BATCH_SIZE);

    loop {
        let first = tokio::select! {
            biased;
            frame = rx.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
            _ = shutdown.notified() => {
                // Drain what was queued before the close.
                while let Ok(frame) = rx.try_recv() {
                    batch.push(frame);
                }
                let n = batch.len();
                write_batch(&mut writer, &mut batch).await?;
                pending.fetch_sub(n, Ordering::Release);
                break;
            }
        };

        batch.push(first);
        while batch.len() < MAX_BATCH_SIZE {
            match rx.try_recv() {
                Ok(frame) => batch.push(frame),
                Err(_) => break,
            }
        }

        let n = batch.len();
        write_batch(&mut writer, &mut batch).await?;
        pending.fetch_sub(n, Ordering::Release);
    }

    writer.shutdown().await?;
    Ok(())
}

async fn write_batch<W>(writer: &mut W, batch: &mut Vec<Bytes>) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    if batch.is_empty() {
        return Ok(());
    }
    for frame in batch.drain(..) {
        writer.write_all(&frame).await?;
    }
    writer.flush().await?;
    Ok(())
}

/// A [`Writer`] that hands every frame to an unbounded channel.
///
/// Used to back virtual callables: whatever the callable writes shows up on
/// the receiver, where it can be forwarded to another peer.
#[derive(Clone)]
pub struct ChannelWriter {
    tx: mpsc::UnboundedSender<Bytes>,
    closed: Arc<AtomicBool>,
}

impl ChannelWriter {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Bytes>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let writer = Self {
            tx,
            closed: Arc::new(AtomicBool::new(false)),
        };
        (writer, rx)
    }
}

impl Writer for ChannelWriter {
    fn write(&self, data: Bytes, _immediate: bool) -> BoxFuture<'_, Result<()>> {
        let result = if self.closed.load(Ordering::Acquire) {
            Err(RpcError::ConnectionClosed)
        } else {
            self.tx.send(data).map_err(|_| RpcError::ConnectionClosed)
        };
        Box::pin(futures::future::ready(result))
    }
}

impl WriterCloser for ChannelWriter {
    fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}
