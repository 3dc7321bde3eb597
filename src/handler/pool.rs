//! Reuse of execution contexts.
//!
//! [`ContextPool::get`] hands out a [`PooledContext`] guard. Dropping the
//! guard resets the context (running its deferred actions) and puts it back,
//! so a context is returned on every exit path, unwinding included.

use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex, PoisonError};

use super::Context;

/// Default number of idle contexts kept for reuse.
pub const DEFAULT_CONTEXT_POOL_CAPACITY: usize = 64;

/// Bounded free list of contexts.
#[derive(Clone)]
pub struct ContextPool {
    free: Arc<Mutex<Vec<Context>>>,
    capacity: usize,
}

impl ContextPool {
    /// Create a pool keeping at most `capacity` idle contexts.
    pub fn new(capacity: usize) -> Self {
        Self {
            free: Arc::new(Mutex::new(Vec::with_capacity(capacity))),
            capacity,
        }
    }

    /// Check out a context, reusing an idle one if there is one.
    pub fn get(&self) -> PooledContext {
        let ctx = self
            .free
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop()
            .unwrap_or_default();
        PooledContext {
            ctx: Some(ctx),
            pool: self.clone(),
        }
    }

    /// Number of idle contexts.
    pub fn available(&self) -> usize {
        self.free.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    fn put(&self, ctx: Context) {
        let mut free = self.free.lock().unwrap_or_else(PoisonError::into_inner);
        if free.len() < self.capacity {
            free.push(ctx);
        }
    }
}

impl Default for ContextPool {
    fn default() -> Self {
        Self::new(DEFAULT_CONTEXT_POOL_CAPACITY)
    }
}

/// A checked-out context. Must not outlive the request it serves.
pub struct PooledContext {
    ctx: Option<Context>,
    pool: ContextPool,
}

impl Deref for PooledContext {
    type Target = Context;

    fn deref(&self) -> &Context {
        // Only `drop` takes the context out.
        self.ctx.as_ref().unwrap_or_else(|| unreachable!())
    }
}

impl DerefMut for PooledContext {
    fn deref_mut(&mut self) -> &mut Context {
        self.ctx.as_mut().unwrap_or_else(|| unreachable!())
    }
}

impl Drop for PooledContext {
    fn drop(&mut self) {
        if let Some(mut ctx) = self.ctx.take() {
            ctx.reset();
            self.pool.put(ctx);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RpcError;
    use crate::protocol::Message;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn test_context_returned_and_reset_on_drop() {
        let pool = ContextPool::new(4);
        let cleaned = Arc::new(AtomicBool::new(false));

        {
            let mut ctx = pool.get();
            ctx.init(None, Message::request("m", None));
            ctx.set_error(RpcError::Timeout);
            let cleaned = cleaned.clone();
            ctx.defer(move || cleaned.store(true, Ordering::SeqCst));
            assert_eq!(pool.available(), 0);
        }

        assert!(cleaned.load(Ordering::SeqCst));
        assert_eq!(pool.available(), 1);

        let ctx = pool.get();
        assert!(ctx.error().is_none());
        assert_eq!(ctx.method(), "");
    }

    #[test]
    fn test_capacity_bounds_idle_contexts() {
        let pool = ContextPool::new(1);
        let a = pool.get();
        let b = pool.get();
        drop(a);
        drop(b);
        assert_eq!(pool.available(), 1);
    }

    #[test]
    fn test_returned_on_panic() {
        let pool = ContextPool::new(2);
        let inner = pool.clone();

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(move || {
            let _ctx = inner.get();
            panic!("handler blew up");
        }));

        assert!(result.is_err());
        assert_eq!(pool.available(), 1);
    }
}
