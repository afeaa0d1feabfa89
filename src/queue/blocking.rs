//! Spin-then-park blocking adapter
//!
//! Layers cooperative spinning and condvar parking over any [`MpmcQueue`].
//! The fast path is a direct try-operation; the middle path spins with
//! exponential backoff; the slow path parks on a condvar and re-tries the
//! operation on every wake. Every successful operation notifies the opposite
//! condition. The not-full condition is only signalled for bounded queues
//! (an unbounded push never fails, so nobody ever waits on it).
//!
//! Waiter counts gate the notifications: a parker registers itself under the
//! mutex before re-checking the queue, and a notifier that observes a waiter
//! takes the mutex before signalling, so a wakeup cannot fall between a
//! parker's last check and its wait.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::constants::SPIN_ATTEMPTS_BEFORE_BLOCK;
use crate::queue::backoff::ExponentialBackoff;
use crate::queue::MpmcQueue;

pub struct BlockingQueue<Q: MpmcQueue> {
    inner: Q,
    spin_attempts: u32,
    mutex: Mutex<()>,
    not_empty: Condvar,
    not_full: Condvar,
    not_empty_waiters: AtomicUsize,
    not_full_waiters: AtomicUsize,
}

impl<Q: MpmcQueue> BlockingQueue<Q> {
    pub fn new(inner: Q) -> Self {
        Self::with_spin_attempts(inner, SPIN_ATTEMPTS_BEFORE_BLOCK)
    }

    pub fn with_spin_attempts(inner: Q, spin_attempts: u32) -> Self {
        Self {
            inner,
            spin_attempts,
            mutex: Mutex::new(()),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            not_empty_waiters: AtomicUsize::new(0),
            not_full_waiters: AtomicUsize::new(0),
        }
    }

    /// Non-blocking push, exposed for callers that manage their own waiting.
    pub fn try_push(&self, value: Q::Item) -> Result<(), Q::Item> {
        match self.inner.try_push(value) {
            Ok(()) => {
                self.notify_not_empty();
                Ok(())
            }
            Err(v) => Err(v),
        }
    }

    /// Non-blocking pop.
    pub fn try_pop(&self) -> Option<Q::Item> {
        let v = self.inner.try_pop();
        if v.is_some() {
            self.notify_not_full();
        }
        v
    }

    /// Push, blocking indefinitely if the queue stays full.
    pub fn push(&self, value: Q::Item) -> bool {
        let mut value = match self.inner.try_push(value) {
            Ok(()) => {
                self.notify_not_empty();
                return true;
            }
            Err(v) => v,
        };

        let mut bk = ExponentialBackoff::default();
        for _ in 0..self.spin_attempts {
            bk.spin();
            match self.inner.try_push(value) {
                Ok(()) => {
                    self.notify_not_empty();
                    return true;
                }
                Err(v) => value = v,
            }
        }

        let mut guard = self.mutex.lock();
        self.not_full_waiters.fetch_add(1, Ordering::SeqCst);
        loop {
            match self.inner.try_push(value) {
                Ok(()) => break,
                Err(v) => {
                    value = v;
                    self.not_full.wait(&mut guard);
                }
            }
        }
        self.not_full_waiters.fetch_sub(1, Ordering::SeqCst);
        drop(guard);
        self.notify_not_empty();
        true
    }

    /// Push with a deadline; false once the deadline passes in any phase.
    pub fn push_until(&self, value: Q::Item, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut value = match self.inner.try_push(value) {
            Ok(()) => {
                self.notify_not_empty();
                return true;
            }
            Err(v) => v,
        };

        let mut bk = ExponentialBackoff::default();
        for _ in 0..self.spin_attempts {
            bk.spin();
            match self.inner.try_push(value) {
                Ok(()) => {
                    self.notify_not_empty();
                    return true;
                }
                Err(v) => value = v,
            }
            if Instant::now() >= deadline {
                return false;
            }
        }

        let mut guard = self.mutex.lock();
        self.not_full_waiters.fetch_add(1, Ordering::SeqCst);
        let pushed = loop {
            match self.inner.try_push(value) {
                Ok(()) => break true,
                Err(v) => {
                    value = v;
                    if self.not_full.wait_until(&mut guard, deadline).timed_out() {
                        break false;
                    }
                }
            }
        };
        self.not_full_waiters.fetch_sub(1, Ordering::SeqCst);
        drop(guard);
        if pushed {
            self.notify_not_empty();
        }
        pushed
    }

    /// Pop, blocking indefinitely while the queue stays empty.
    pub fn pop(&self) -> Q::Item {
        if let Some(v) = self.inner.try_pop() {
            self.notify_not_full();
            return v;
        }

        let mut bk = ExponentialBackoff::default();
        for _ in 0..self.spin_attempts {
            bk.spin();
            if let Some(v) = self.inner.try_pop() {
                self.notify_not_full();
                return v;
            }
        }

        let mut guard = self.mutex.lock();
        self.not_empty_waiters.fetch_add(1, Ordering::SeqCst);
        let value = loop {
            match self.inner.try_pop() {
                Some(v) => break v,
                None => self.not_empty.wait(&mut guard),
            }
        };
        self.not_empty_waiters.fetch_sub(1, Ordering::SeqCst);
        drop(guard);
        self.notify_not_full();
        value
    }

    /// Pop with a deadline; `None` once the deadline passes in any phase.
    pub fn pop_until(&self, timeout: Duration) -> Option<Q::Item> {
        let deadline = Instant::now() + timeout;
        if let Some(v) = self.inner.try_pop() {
            self.notify_not_full();
            return Some(v);
        }

        let mut bk = ExponentialBackoff::default();
        for _ in 0..self.spin_attempts {
            bk.spin();
            if let Some(v) = self.inner.try_pop() {
                self.notify_not_full();
                return Some(v);
            }
            if Instant::now() >= deadline {
                return None;
            }
        }

        let mut guard = self.mutex.lock();
        self.not_empty_waiters.fetch_add(1, Ordering::SeqCst);
        let value = loop {
            match self.inner.try_pop() {
                Some(v) => break Some(v),
                None => {
                    if self.not_empty.wait_until(&mut guard, deadline).timed_out() {
                        break None;
                    }
                }
            }
        };
        self.not_empty_waiters.fetch_sub(1, Ordering::SeqCst);
        drop(guard);
        if value.is_some() {
            self.notify_not_full();
        }
        value
    }

    pub fn inner(&self) -> &Q {
        &self.inner
    }

    fn notify_not_empty(&self) {
        if self.not_empty_waiters.load(Ordering::SeqCst) > 0 {
            let _guard = self.mutex.lock();
            self.not_empty.notify_one();
        }
    }

    fn notify_not_full(&self) {
        if Q::BOUNDED && self.not_full_waiters.load(Ordering::SeqCst) > 0 {
            let _guard = self.mutex.lock();
            self.not_full.notify_one();
        }
    }
}
