use std::time::Instant;

use super::{handle_fn, middleware_fn, HandleFunc, Middleware};

/// Log every request and its outcome at `info` level, with the time spent
/// in the inner chain.
pub fn dump() -> Middleware {
    middleware_fn(|next: HandleFunc| {
        handle_fn(move |ctx| {
            let next = next.clone();
            Box::pin(async move {
                let start = Instant::now();
                tracing::info!(
                    "REQ id={} method={} error={:?} has_request={}",
                    ctx.id(),
                    ctx.method(),
                    ctx.error(),
                    ctx.request().is_some()
                );

                next(&mut *ctx).await;

                tracing::info!(
                    "ACK id={} method={} cost={:?} error={:?} has_response={}",
                    ctx.id(),
                    ctx.method(),
                    start.elapsed(),
                    ctx.error(),
                    ctx.response().is_some()
                );
            })
        })
    })
}
