//! Transport module - sockets that become callables.
//!
//! - TCP on every platform
//! - Unix Domain Sockets (Linux/macOS) for local peers

#[cfg(unix)]
mod ipc;
mod tcp;

#[cfg(unix)]
pub use ipc::{connect_ipc, generate_ipc_path, ipc_pair, IpcListener};
pub use tcp::{connect_tcp, TcpAcceptor};
