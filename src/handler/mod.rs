//! Handler module - function registration, invocation and request state.
//!
//! Provides:
//! - [`Function`] - a typed async handler, erased for registration
//! - [`FunctionRegistry`] - maps method names to registered functions
//! - [`Context`] - per-request state threaded through middleware
//! - [`RequestContext`] - what a handler sees of its request
//! - [`ContextPool`] - reuse of contexts across requests
//!
//! # Example
//!
//! ```
//! use callwire::handler::{Function, FunctionRegistry, RequestContext};
//!
//! async fn echo(_ctx: RequestContext, s: String) -> callwire::Result<String> {
//!     Ok(s)
//! }
//!
//! let registry = FunctionRegistry::new(false);
//! registry.register(Function::with_input_output(echo), &[]).unwrap();
//! assert!(registry.get("echo").is_some());
//! ```

mod context;
mod function;
mod pool;
mod registry;

pub use context::{Context, RequestContext};
pub use function::{Function, HandlerShape};
pub use futures::future::BoxFuture;
pub use pool::{ContextPool, PooledContext, DEFAULT_CONTEXT_POOL_CAPACITY};
pub use registry::{FunctionRegistry, RegisteredFunction};

pub(crate) use function::panic_message;

/// Function descriptor bits.
pub mod desc {
    /// Bitmask of [`REQUEST_DATA`] and [`RESPONSE_DATA`].
    pub type FuncDesc = u8;

    /// The request carries a value.
    pub const REQUEST_DATA: FuncDesc = 0x01;
    /// The response carries a value.
    pub const RESPONSE_DATA: FuncDesc = 0x02;
}
