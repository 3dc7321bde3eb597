use super::{handle_fn, middleware_fn, HandleFunc, Middleware};
use crate::error::RpcError;
use crate::handler::desc;

/// Error message set by [`request_not_nil`].
pub const REQUEST_NIL: &str = "request must not be nil";

/// Reject requests that carry no request value although the function
/// declares one. The inner chain is not run.
///
/// Works at every level, `pre_use` included: the method is resolved and the
/// request decoded before any middleware runs.
pub fn request_not_nil() -> Middleware {
    middleware_fn(|next: HandleFunc| {
        handle_fn(move |ctx| {
            let next = next.clone();
            Box::pin(async move {
                let expects_request = ctx.func_desc() & desc::REQUEST_DATA != 0;
                if expects_request && ctx.request().is_none() {
                    ctx.set_error(RpcError::custom(REQUEST_NIL));
                    return;
                }
                next(ctx).await;
            })
        })
    })
}
