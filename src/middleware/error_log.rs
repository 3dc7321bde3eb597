use super::{handle_fn, middleware_fn, HandleFunc, Middleware};

/// Log errors produced by the inner chain at `error` level.
///
/// An error already present when the request enters is logged once on the
/// way in and not again on the way out, unless the inner chain replaced it.
pub fn error_log() -> Middleware {
    middleware_fn(|next: HandleFunc| {
        handle_fn(move |ctx| {
            let next = next.clone();
            Box::pin(async move {
                let before = ctx.error().map(|e| e.to_string());
                if let Some(err) = &before {
                    tracing::error!("Method={}, Error={}", ctx.method(), err);
                }

                next(&mut *ctx).await;

                let after = ctx.error().map(|e| e.to_string());
                if let Some(err) = after.filter(|e| before.as_ref() != Some(e)) {
                    tracing::error!("Method={}, Error={}", ctx.method(), err);
                }
            })
        })
    })
}
