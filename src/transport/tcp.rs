use std::net::SocketAddr;

use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};

use crate::callable::Callable;
use crate::error::Result;
use crate::runtime::Core;

/// Connect to `addr` and bind the stream to `core`.
///
/// The returned callable is not started yet.
pub async fn connect_tcp(core: &Core, addr: impl ToSocketAddrs) -> Result<Callable> {
    let stream = TcpStream::connect(addr).await?;
    stream.set_nodelay(true)?;
    tracing::debug!("Connected to {}", stream.peer_addr()?);
    Ok(Callable::from_stream(core, stream))
}

/// TCP listener producing callables bound to one core.
pub struct TcpAcceptor {
    core: Core,
    listener: TcpListener,
}

impl TcpAcceptor {
    pub async fn bind(core: &Core, addr: impl ToSocketAddrs) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            core: core.clone(),
            listener,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept one connection. The callable is not started yet.
    pub async fn accept(&self) -> Result<Callable> {
        let (stream, peer) = self.listener.accept().await?;
        stream.set_nodelay(true)?;
        tracing::debug!("Accepted {}", peer);
        Ok(Callable::from_stream(&self.core, stream))
    }
}
