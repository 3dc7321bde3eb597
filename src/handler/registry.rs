//! Function registry and invoker.
//!
//! Registering the same name twice replaces the earlier function. Avoiding
//! collisions is up to the caller; the replacement is only logged at `debug`.

use std::backtrace::Backtrace;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, PoisonError, RwLock};

use futures::FutureExt;

use super::desc::{self, FuncDesc};
use super::{panic_message, Context, Function, RequestContext};
use crate::codec::Value;
use crate::error::{Result, RpcError};
use crate::middleware::{build_chain, handle_fn, HandleFunc, Middleware};

/// A function together with its own middleware chain, composed once.
pub struct RegisteredFunction {
    name: String,
    function: Arc<Function>,
    handle: HandleFunc,
}

impl RegisteredFunction {
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn desc(&self) -> FuncDesc {
        self.function.desc()
    }

    #[inline]
    pub fn function(&self) -> &Function {
        &self.function
    }

    /// Function middlewares wrapped around the invoker.
    #[inline]
    pub fn handle(&self) -> &HandleFunc {
        &self.handle
    }

    /// See [`Function::decode_request`].
    pub fn decode_request(&self, payload: &[u8]) -> Result<Option<Box<dyn Value>>> {
        self.function.decode_request(payload)
    }
}

/// Name to function map, read on every request.
pub struct FunctionRegistry {
    functions: RwLock<HashMap<String, Arc<RegisteredFunction>>>,
    debug: bool,
}

impl FunctionRegistry {
    /// Create an empty registry. With `debug` set, handler panics are
    /// re-raised instead of being turned into errors.
    pub fn new(debug: bool) -> Self {
        Self {
            functions: RwLock::new(HashMap::new()),
            debug,
        }
    }

    /// Register under the name of the handler function itself.
    ///
    /// # Errors
    ///
    /// Closures have no usable name and are rejected; use
    /// [`register_with_name`](Self::register_with_name) for them.
    pub fn register(&self, function: Function, middlewares: &[Middleware]) -> Result<()> {
        let name = function
            .inferred_name()
            .map(str::to_string)
            .ok_or_else(|| {
                RpcError::Registration("cannot infer a name, register it with a name".into())
            })?;
        self.register_with_name(name, function, middlewares)
    }

    /// Register under an explicit name.
    pub fn register_with_name(
        &self,
        name: impl Into<String>,
        function: Function,
        middlewares: &[Middleware],
    ) -> Result<()> {
        let name = name.into();
        if name.is_empty() {
            return Err(RpcError::Registration("function name is empty".into()));
        }

        let function = Arc::new(function);
        let handle = build_chain(middlewares, invoke_handle(function.clone(), self.debug));
        let entry = Arc::new(RegisteredFunction {
            name: name.clone(),
            function,
            handle,
        });

        let mut functions = self.functions.write().unwrap_or_else(PoisonError::into_inner);
        if functions.insert(name.clone(), entry).is_some() {
            tracing::debug!("Function {} registered again, replacing it", name);
        }
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<RegisteredFunction>> {
        self.functions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.functions.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self
            .functions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }
}

fn invoke_handle(function: Arc<Function>, debug: bool) -> HandleFunc {
    handle_fn(move |ctx| {
        let function = function.clone();
        Box::pin(async move { invoke(&function, ctx, debug).await })
    })
}

/// Run `function` against the context.
///
/// Does nothing if the context already carries an error. A panic inside the
/// handler becomes [`RpcError::InvocationFailed`]; its message is logged,
/// not sent. With `debug` the process is aborted after logging.
pub(crate) async fn invoke(function: &Function, ctx: &mut Context, debug: bool) {
    if ctx.error().is_some() {
        return;
    }

    let input = if function.desc() & desc::REQUEST_DATA != 0 {
        match ctx.take_request_value() {
            Some(value) => Some(value),
            None => {
                ctx.set_error(RpcError::MissingInputParameter);
                return;
            }
        }
    } else {
        None
    };

    let request = RequestContext::from_context(ctx);
    let result = AssertUnwindSafe(async { function.call(request, input).await })
        .catch_unwind()
        .await;

    match result {
        Ok(Ok(Some(value))) => {
            if function.desc() & desc::RESPONSE_DATA != 0 {
                ctx.set_response_value(value);
            }
        }
        Ok(Ok(None)) => {}
        Ok(Err(e)) => ctx.set_error(e),
        Err(panic) => {
            tracing::error!(
                "call [{}] panicked: {}\n{}",
                ctx.method(),
                panic_message(panic.as_ref()),
                Backtrace::capture()
            );
            if debug {
                // Request tasks are spawned, so unwinding would only end the task.
                std::process::abort();
            }
            ctx.set_error(RpcError::InvocationFailed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::middleware::middleware_fn;
    use crate::protocol::Message;
    use std::sync::atomic::{AtomicUsize, Ordering};

    async fn add_one(_ctx: RequestContext, n: i64) -> Result<i64> {
        Ok(n + 1)
    }

    async fn explode(_ctx: RequestContext) -> Result<()> {
        panic!("handler exploded");
    }

    fn context_for(method: &str) -> Context {
        let mut ctx = Context::default();
        ctx.init(None, Message::request(method, None));
        ctx
    }

    #[test]
    fn test_register_by_inferred_name() {
        let registry = FunctionRegistry::new(false);
        registry.register(Function::with_input_output(add_one), &[]).unwrap();

        let entry = registry.get("add_one").unwrap();
        assert_eq!(entry.name(), "add_one");
        assert_eq!(entry.desc(), desc::REQUEST_DATA | desc::RESPONSE_DATA);
        assert_eq!(registry.names(), ["add_one"]);
    }

    #[test]
    fn test_closure_needs_explicit_name() {
        let registry = FunctionRegistry::new(false);
        let result = registry.register(Function::new(|_ctx| async { Ok(()) }), &[]);
        assert!(matches!(result, Err(RpcError::Registration(_))));

        registry
            .register_with_name("noop", Function::new(|_ctx| async { Ok(()) }), &[])
            .unwrap();
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_empty_name_rejected() {
        let registry = FunctionRegistry::new(false);
        let result = registry.register_with_name("", Function::with_input_output(add_one), &[]);
        assert!(matches!(result, Err(RpcError::Registration(_))));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_reregistering_replaces() {
        let registry = FunctionRegistry::new(false);
        registry
            .register_with_name("f", Function::with_input_output(add_one), &[])
            .unwrap();
        registry.register_with_name("f", Function::new(explode), &[]).unwrap();

        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get("f").unwrap().desc(), 0);
    }

    #[tokio::test]
    async fn test_invoke_sets_response() {
        let registry = FunctionRegistry::new(false);
        registry.register(Function::with_input_output(add_one), &[]).unwrap();
        let entry = registry.get("add_one").unwrap();

        let mut ctx = context_for("add_one");
        ctx.put_request_value(Box::new(41i64));
        (entry.handle())(&mut ctx).await;

        assert!(ctx.error().is_none());
        assert_eq!(ctx.response().unwrap().downcast_ref::<i64>(), Some(&42));
    }

    #[tokio::test]
    async fn test_invoke_without_request_value() {
        let registry = FunctionRegistry::new(false);
        registry.register(Function::with_input_output(add_one), &[]).unwrap();

        let mut ctx = context_for("add_one");
        (registry.get("add_one").unwrap().handle())(&mut ctx).await;

        assert!(matches!(ctx.error(), Some(RpcError::MissingInputParameter)));
    }

    #[tokio::test]
    async fn test_invoke_skipped_when_error_present() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let function = Function::new(move |_ctx| {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Ok(()) }
        });

        let mut ctx = context_for("count");
        ctx.set_error(RpcError::custom("earlier"));
        invoke(&function, &mut ctx, false).await;

        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(ctx.error().unwrap().to_string(), "earlier");
    }

    #[tokio::test]
    async fn test_panic_becomes_invocation_failed() {
        let mut ctx = context_for("explode");
        invoke(&Function::new(explode), &mut ctx, false).await;

        assert!(matches!(ctx.error(), Some(RpcError::InvocationFailed)));
    }

    const ABORT_CHILD_ENV: &str = "CALLWIRE_DEBUG_ABORT_CHILD";

    #[test]
    fn test_panic_aborts_process_in_debug() {
        if std::env::var_os(ABORT_CHILD_ENV).is_some() {
            let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
            rt.block_on(async {
                let mut ctx = context_for("explode");
                invoke(&Function::new(explode), &mut ctx, true).await;
            });
            // Reaching this point means the process survived.
            return;
        }

        // Run this very test in a child process, which must die.
        let output = std::process::Command::new(std::env::current_exe().unwrap())
            .args([
                "--exact",
                "handler::registry::tests::test_panic_aborts_process_in_debug",
                "--nocapture",
                "--test-threads=1",
            ])
            .env(ABORT_CHILD_ENV, "1")
            .output()
            .unwrap();

        assert!(!output.status.success());
        let stdout = String::from_utf8_lossy(&output.stdout);
        assert!(!stdout.contains("test result: ok"), "child survived: {}", stdout);
    }

    #[tokio::test]
    async fn test_handler_error_is_set() {
        let function = Function::new(|_ctx| async { Err(RpcError::custom("nope")) });
        let mut ctx = context_for("fail");
        invoke(&function, &mut ctx, false).await;

        assert_eq!(ctx.error().unwrap().to_string(), "nope");
    }

    #[tokio::test]
    async fn test_function_middleware_wraps_invoke() {
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        let mw = middleware_fn(move |next: HandleFunc| {
            let counter = counter.clone();
            handle_fn(move |ctx| {
                let next = next.clone();
                let counter = counter.clone();
                Box::pin(async move {
                    next(&mut *ctx).await;
                    if ctx.response().is_some() {
                        counter.fetch_add(1, Ordering::SeqCst);
                    }
                })
            })
        });

        let registry = FunctionRegistry::new(false);
        registry
            .register(Function::with_input_output(add_one), &[mw])
            .unwrap();

        let mut ctx = context_for("add_one");
        ctx.put_request_value(Box::new(1i64));
        (registry.get("add_one").unwrap().handle())(&mut ctx).await;

        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }
}
