use std::panic::AssertUnwindSafe;

use futures::FutureExt;

use super::{handle_fn, middleware_fn, HandleFunc, Middleware};
use crate::error::RpcError;
use crate::handler::panic_message;

/// Catch panics of the inner chain and turn them into a `PANIC: ...` error
/// on the context.
///
/// Unlike the invoker's own isolation, the panic message is kept in the
/// error and therefore reaches the caller.
pub fn recover() -> Middleware {
    middleware_fn(|next: HandleFunc| {
        handle_fn(move |ctx| {
            let next = next.clone();
            Box::pin(async move {
                let result = AssertUnwindSafe(async { next(&mut *ctx).await })
                    .catch_unwind()
                    .await;
                if let Err(panic) = result {
                    let msg = panic_message(panic.as_ref());
                    tracing::error!(
                        "PANIC RECOVERED, method={}, panic={}, backtrace={}",
                        ctx.method(),
                        msg,
                        std::backtrace::Backtrace::capture()
                    );
                    ctx.set_error(RpcError::custom(format!("PANIC: {}", msg)));
                }
            })
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::middleware::testing::context_for;

    #[tokio::test]
    async fn test_panic_becomes_error() {
        let handler = recover()(handle_fn(|_ctx| {
            Box::pin(async {
                if true {
                    panic!("boom");
                }
            })
        }));

        let mut ctx = context_for("explode");
        handler(&mut ctx).await;

        assert_eq!(
            ctx.error().map(ToString::to_string).as_deref(),
            Some("PANIC: boom")
        );
    }

    #[tokio::test]
    async fn test_outcome_passes_through() {
        let handler = recover()(handle_fn(|ctx| {
            Box::pin(async move {
                ctx.set_response(5u8);
            })
        }));

        let mut ctx = context_for("ok");
        handler(&mut ctx).await;

        assert!(ctx.error().is_none());
        assert_eq!(ctx.response().and_then(|v| v.downcast_ref::<u8>()), Some(&5));
    }
}
