//! Bounded-attempt spinning adapter

use crate::queue::backoff::ExponentialBackoff;
use crate::queue::MpmcQueue;

/// Wraps a queue with bounded spinning retries; never parks.
pub struct SpinQueue<Q: MpmcQueue> {
    inner: Q,
}

impl<Q: MpmcQueue> SpinQueue<Q> {
    pub fn new(inner: Q) -> Self {
        Self { inner }
    }

    pub fn try_push(&self, value: Q::Item) -> Result<(), Q::Item> {
        self.inner.try_push(value)
    }

    pub fn try_pop(&self) -> Option<Q::Item> {
        self.inner.try_pop()
    }

    /// Retry a push up to `attempts` times with exponential backoff between
    /// attempts. Returns the value back on exhaustion.
    pub fn spin_push(&self, value: Q::Item, attempts: u32) -> Result<(), Q::Item> {
        let mut value = match self.inner.try_push(value) {
            Ok(()) => return Ok(()),
            Err(v) => v,
        };
        let mut bk = ExponentialBackoff::default();
        for _ in 0..attempts {
            bk.spin();
            match self.inner.try_push(value) {
                Ok(()) => return Ok(()),
                Err(v) => value = v,
            }
        }
        Err(value)
    }

    /// Retry a pop up to `attempts` times with exponential backoff.
    pub fn spin_pop(&self, attempts: u32) -> Option<Q::Item> {
        if let Some(v) = self.inner.try_pop() {
            return Some(v);
        }
        let mut bk = ExponentialBackoff::default();
        for _ in 0..attempts {
            bk.spin();
            if let Some(v) = self.inner.try_pop() {
                return Some(v);
            }
        }
        None
    }

    pub fn inner(&self) -> &Q {
        &self.inner
    }
}
