//! # callwire
//!
//! Bidirectional request/response RPC over framed byte streams.
//!
//! Both ends of a connection are symmetric: each side registers functions on
//! its [`Core`] and each side can call the other through a [`Callable`].
//!
//! ## Architecture
//!
//! - **Wire codec** ([`protocol`]): 6-byte frame header (magic + length) and
//!   a MsgPack [`Message`] envelope
//! - **Middleware** ([`middleware`]): onion chains around requests and calls
//! - **Functions** ([`handler`]): typed async handlers, erased for dispatch
//! - **Pending calls** ([`promise`]): responses matched to callers by id
//! - **Callables** ([`Callable`]): a connection bound to a core
//! - **Runtime** ([`Core`]): the loop decoding reads and dispatching messages
//!
//! ## Example
//!
//! ```no_run
//! use std::time::Duration;
//! use callwire::{Core, Function, RequestContext, TcpAcceptor};
//!
//! async fn upper(_ctx: RequestContext, s: String) -> callwire::Result<String> {
//!     Ok(s.to_uppercase())
//! }
//!
//! #[tokio::main]
//! async fn main() -> callwire::Result<()> {
//!     let core = Core::new();
//!     core.register(Function::with_input_output(upper), &[])?;
//!     core.start();
//!
//!     let acceptor = TcpAcceptor::bind(&core, "127.0.0.1:9000").await?;
//!     loop {
//!         let callable = acceptor.accept().await?;
//!         callable.start();
//!     }
//! }
//! ```

pub mod callable;
pub mod codec;
pub mod error;
pub mod handler;
pub mod middleware;
pub mod promise;
pub mod protocol;
pub mod runtime;
pub mod time_wheel;
pub mod transport;
pub mod writer;

pub use callable::{Callable, CallableState, SignalCallable};
pub use error::{Result, RpcError};
pub use handler::{Context, Function, RequestContext};
pub use middleware::{HandleFunc, Middleware};
pub use protocol::{Headers, Message};
pub use runtime::{Core, CoreBuilder, CoreConfig};
pub use time_wheel::TimeWheel;
pub use transport::{connect_tcp, TcpAcceptor};
pub use writer::{ChannelWriter, Writer, WriterCloser};
