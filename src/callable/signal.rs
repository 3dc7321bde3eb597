use std::ops::Deref;

use tokio::sync::watch;

use super::Callable;
use crate::error::{Result, RpcError};

/// Outcome of a lifecycle event: `None` until it happens.
type Signal = Option<std::result::Result<(), String>>;

/// A [`Callable`] whose ready and close events can be awaited.
///
/// Installs its own `on_ready`/`on_close` callbacks, replacing any set before.
///
/// ```no_run
/// # async fn demo(core: callwire::Core) -> callwire::Result<()> {
/// use callwire::{Callable, SignalCallable};
///
/// let callable = SignalCallable::new(Callable::connect(&core, "127.0.0.1:9000").await?);
/// callable.start();
/// callable.ready().await?;
/// callable.closed().await?;
/// # Ok(())
/// # }
/// ```
pub struct SignalCallable {
    callable: Callable,
    ready: watch::Sender<Signal>,
    closed: watch::Sender<Signal>,
}

fn to_signal(err: Option<&RpcError>) -> Signal {
    Some(match err {
        Some(e) => Err(e.to_string()),
        None => Ok(()),
    })
}

fn send_once(tx: &watch::Sender<Signal>, signal: Signal) {
    tx.send_if_modified(|current| {
        if current.is_some() {
            return false;
        }
        *current = signal;
        true
    });
}

impl SignalCallable {
    pub fn new(callable: Callable) -> Self {
        let (ready, _) = watch::channel(None);
        let (closed, _) = watch::channel(None);

        let tx = ready.clone();
        callable.on_ready(move |_, err| send_once(&tx, to_signal(err)));

        let ready_tx = ready.clone();
        let closed_tx = closed.clone();
        callable.on_close(move |_, err| {
            // Waiters for "ready" must not hang on a connection that died first.
            send_once(&ready_tx, Some(Ok(())));
            send_once(&closed_tx, to_signal(err));
        });

        Self {
            callable,
            ready,
            closed,
        }
    }

    /// Resolves once the callable is started (or closed before that).
    pub async fn ready(&self) -> Result<()> {
        wait(&self.ready).await
    }

    /// Resolves once the callable is closed, with the error that closed it.
    pub async fn closed(&self) -> Result<()> {
        wait(&self.closed).await
    }

    /// The wrapped callable.
    pub fn inner(&self) -> &Callable {
        &self.callable
    }
}

async fn wait(tx: &watch::Sender<Signal>) -> Result<()> {
    let mut rx = tx.subscribe();
    let signal = rx
        .wait_for(Option::is_some)
        .await
        .map_err(|_| RpcError::ConnectionClosed)?
        .clone();
    match signal {
        Some(Err(msg)) => Err(RpcError::Custom(msg)),
        _ => Ok(()),
    }
}

impl Deref for SignalCallable {
    type Target = Callable;

    fn deref(&self) -> &Callable {
        &self.callable
    }
}
