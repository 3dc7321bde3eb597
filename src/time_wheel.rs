//! Idle-connection detection.
//!
//! A [`TimeWheel`] keeps `slots` buckets and advances one bucket per tick.
//! [`TimeWheel::notify`] drops a reference to the entry into the newest
//! bucket; when the oldest bucket falls off the wheel, each entry in it loses
//! a reference. An entry whose last reference falls off has not been notified
//! for `slots` ticks and is expired.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use tokio::task::JoinHandle;

/// Something a [`TimeWheel`] can expire.
pub trait TimeWheelEntry: Send + Sync {
    /// Number of buckets currently holding this entry.
    fn ref_counter(&self) -> &AtomicI32;

    /// Called once the entry has gone a full turn without a notify.
    fn on_expired(&self);
}

type Bucket = Vec<Arc<dyn TimeWheelEntry>>;

struct Wheel {
    buckets: Mutex<VecDeque<Bucket>>,
    interval: Duration,
}

/// Cheap clonable handle to a time wheel.
#[derive(Clone)]
pub struct TimeWheel {
    wheel: Arc<Wheel>,
}

impl TimeWheel {
    /// Create a wheel expiring entries after `slots` ticks of `interval`.
    /// Call [`start`](Self::start) to make it tick.
    pub fn new(interval: Duration, slots: usize) -> Self {
        let slots = slots.max(1);
        Self {
            wheel: Arc::new(Wheel {
                buckets: Mutex::new((0..slots).map(|_| Vec::new()).collect()),
                interval,
            }),
        }
    }

    fn buckets(&self) -> MutexGuard<'_, VecDeque<Bucket>> {
        self.wheel.buckets.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Refresh the liveness of `entry`.
    pub fn notify(&self, entry: Arc<dyn TimeWheelEntry>) {
        entry.ref_counter().fetch_add(1, Ordering::AcqRel);
        if let Some(newest) = self.buckets().back_mut() {
            newest.push(entry);
        }
    }

    /// Advance the wheel by one bucket, expiring what falls off.
    pub fn tick(&self) {
        let expired = {
            let mut buckets = self.buckets();
            let oldest = buckets.pop_front().unwrap_or_default();
            buckets.push_back(Vec::new());
            oldest
        };

        for entry in expired {
            if entry.ref_counter().fetch_sub(1, Ordering::AcqRel) == 1 {
                entry.on_expired();
            }
        }
    }

    /// Spawn the ticking task. It stops once every handle to the wheel is
    /// dropped.
    pub fn start(&self) -> JoinHandle<()> {
        let wheel: Weak<Wheel> = Arc::downgrade(&self.wheel);
        let interval = self.wheel.interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match wheel.upgrade() {
                    Some(wheel) => TimeWheel { wheel }.tick(),
                    None => break,
                }
            }
        })
    }
}
