//! Unix Domain Socket transport.
//!
//! # Example
//!
//! ```no_run
//! use callwire::transport::{connect_ipc, generate_ipc_path, IpcListener};
//! use callwire::Core;
//!
//! # async fn demo() -> callwire::Result<()> {
//! let core = Core::new();
//! let path = generate_ipc_path();
//! let listener = IpcListener::bind(&core, &path)?;
//! let callable = listener.accept().await?;
//! callable.start();
//! # let _ = connect_ipc(&core, &path).await?;
//! # Ok(())
//! # }
//! ```

use std::path::Path;

use tokio::net::{UnixListener, UnixStream};

use crate::callable::Callable;
use crate::error::Result;
use crate::runtime::Core;

/// Generate a unique socket path for this process.
///
/// Format: `{tmp}/callwire-{pid}-{random}.sock`
pub fn generate_ipc_path() -> String {
    let dir = std::env::temp_dir();
    let name = format!(
        "callwire-{}-{:x}.sock",
        std::process::id(),
        rand::random::<u64>()
    );
    dir.join(name).to_string_lossy().into_owned()
}

/// Unix Domain Socket listener producing callables bound to one core.
pub struct IpcListener {
    core: Core,
    listener: UnixListener,
    path: String,
}

impl IpcListener {
    /// Bind to a Unix socket path.
    ///
    /// Removes any existing socket file at the path before binding.
    pub fn bind(core: &Core, path: &str) -> Result<Self> {
        if Path::new(path).exists() {
            std::fs::remove_file(path)?;
        }

        let listener = UnixListener::bind(path)?;
        Ok(Self {
            core: core.clone(),
            listener,
            path: path.to_string(),
        })
    }

    /// Accept one connection. The callable is not started yet.
    pub async fn accept(&self) -> Result<Callable> {
        let (stream, _addr) = self.listener.accept().await?;
        Ok(Callable::from_stream(&self.core, stream))
    }

    pub fn path(&self) -> &str {
        &self.path
    }
}

impl Drop for IpcListener {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// Connect to the socket at `path` and bind it to `core`.
pub async fn connect_ipc(core: &Core, path: &str) -> Result<Callable> {
    let stream = UnixStream::connect(path).await?;
    Ok(Callable::from_stream(core, stream))
}

/// Two callables joined by an anonymous socket pair, one per core.
pub fn ipc_pair(a: &Core, b: &Core) -> Result<(Callable, Callable)> {
    let (left, right) = UnixStream::pair()?;
    Ok((Callable::from_stream(a, left), Callable::from_stream(b, right)))
}
