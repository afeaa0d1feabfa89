//! Adaptive spin/park blocking adapter
//!
//! Wraps a queue and chooses between spinning and condvar parking based on
//! observed contention. Two signals feed the decision: an exponential moving
//! average of the per-thread failure rate, and the last sampled fullness of
//! the wrapped queue (bounded queues only). Separate entry and exit
//! thresholds plus a minimum dwell after leaving Block mode prevent
//! flapping.
//!
//! Failure-rate samples are blended into a small fixed set of cache-padded
//! shards to keep CAS contention off a single accumulator; each thread hashes
//! to one shard. Ratios are stored as scaled integers so they can live in
//! plain atomics.

use std::cell::Cell;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use crossbeam::utils::CachePadded;
use parking_lot::{Condvar, Mutex};

use crate::constants::{EMA_SHARDS, RATIO_SCALE};
use crate::queue::backoff::ExponentialBackoff;
use crate::queue::MpmcQueue;

/// Thresholds and budgets for the adaptive policy.
#[derive(Debug, Clone)]
pub struct AdaptiveConfig {
    /// Enter Block when fullness reaches this ratio.
    pub full_high: f32,
    /// Exit Block only once fullness is back at or below this ratio.
    pub full_low: f32,
    /// Enter Block when the failure-rate EMA reaches this ratio.
    pub fail_high: f32,
    /// Exit Block only once the failure-rate EMA is at or below this ratio.
    pub fail_low: f32,
    /// Spin attempts under light contention.
    pub base_spin: u32,
    /// Spin attempts under heavy contention.
    pub min_spin: u32,
    /// Upper bound on the computed spin budget.
    pub max_spin: u32,
    /// Minimum dwell after leaving Block before Block can be re-entered
    /// cheaply (hysteresis time floor).
    pub block_grace: Duration,
    /// EMA smoothing factor.
    pub ema_alpha: f32,
    /// Local attempts between publications into the shared EMA.
    pub local_publish_period: u32,
}

impl Default for AdaptiveConfig {
    fn default() -> Self {
        Self {
            full_high: 0.90,
            full_low: 0.70,
            fail_high: 0.60,
            fail_low: 0.30,
            base_spin: 64,
            min_spin: 4,
            max_spin: 256,
            block_grace: Duration::from_micros(50),
            ema_alpha: 0.05,
            local_publish_period: 64,
        }
    }
}

impl AdaptiveConfig {
    pub fn with_spin_budget(mut self, base: u32, min: u32, max: u32) -> Self {
        self.base_spin = base;
        self.min_spin = min;
        self.max_spin = max;
        self
    }

    pub fn with_block_grace(mut self, grace: Duration) -> Self {
        self.block_grace = grace;
        self
    }
}

/// Observable operating mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdaptiveMode {
    Spin,
    Block,
}

const MODE_SPIN: u8 = 0;
const MODE_BLOCK: u8 = 1;

fn scale_ratio(v: f32) -> u32 {
    (v * RATIO_SCALE) as u32
}

fn unscale_ratio(v: u32) -> f32 {
    v as f32 / RATIO_SCALE
}

thread_local! {
    static LOCAL_FAILURES: Cell<u32> = const { Cell::new(0) };
    static LOCAL_ATTEMPTS: Cell<u32> = const { Cell::new(0) };
    static PUBLISH_COUNTER: Cell<u32> = const { Cell::new(0) };
    static SHARD_INDEX: Cell<usize> = const { Cell::new(usize::MAX) };
}

/// Shard this thread publishes into; computed once per thread.
fn shard_index() -> usize {
    SHARD_INDEX.with(|cached| {
        let v = cached.get();
        if v != usize::MAX {
            return v;
        }
        let mut hasher = DefaultHasher::new();
        std::thread::current().id().hash(&mut hasher);
        let idx = (hasher.finish() as usize) & (EMA_SHARDS - 1);
        cached.set(idx);
        idx
    })
}

pub struct AdaptiveBlockingQueue<Q: MpmcQueue> {
    inner: Q,
    cfg: AdaptiveConfig,
    mode: AtomicU8,
    /// Global snapshot of the failure-rate EMA (scaled).
    fail_ema: AtomicU32,
    /// Last sampled fullness (scaled); stays zero for unbounded queues.
    fullness_last: AtomicU32,
    /// Nanoseconds since `origin` of the last transition out of Block.
    last_block_exit_ns: AtomicU64,
    origin: Instant,
    shards: Box<[CachePadded<AtomicU32>]>,
    mutex: Mutex<()>,
    not_empty: Condvar,
    not_full: Condvar,
    not_empty_waiters: AtomicUsize,
    not_full_waiters: AtomicUsize,
}

impl<Q: MpmcQueue> AdaptiveBlockingQueue<Q> {
    pub fn new(inner: Q) -> Self {
        Self::with_config(inner, AdaptiveConfig::default())
    }

    pub fn with_config(inner: Q, cfg: AdaptiveConfig) -> Self {
        let shards = (0..EMA_SHARDS)
            .map(|_| CachePadded::new(AtomicU32::new(0)))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            inner,
            cfg,
            mode: AtomicU8::new(MODE_SPIN),
            fail_ema: AtomicU32::new(0),
            fullness_last: AtomicU32::new(0),
            last_block_exit_ns: AtomicU64::new(0),
            origin: Instant::now(),
            shards,
            mutex: Mutex::new(()),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            not_empty_waiters: AtomicUsize::new(0),
            not_full_waiters: AtomicUsize::new(0),
        }
    }

    /// Push under the adaptive policy. Without a deadline this fails as soon
    /// as one spin budget is exhausted in Spin mode; in Block mode it parks.
    pub fn push(&self, value: Q::Item) -> bool {
        self.push_impl(value, None)
    }

    /// Push with a deadline.
    pub fn push_until(&self, value: Q::Item, timeout: Duration) -> bool {
        self.push_impl(value, Some(Instant::now() + timeout))
    }

    /// Pop under the adaptive policy; `None` on budget exhaustion in Spin
    /// mode or deadline expiry.
    pub fn pop(&self) -> Option<Q::Item> {
        self.pop_impl(None)
    }

    /// Pop with a deadline.
    pub fn pop_until(&self, timeout: Duration) -> Option<Q::Item> {
        self.pop_impl(Some(Instant::now() + timeout))
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn inner(&self) -> &Q {
        &self.inner
    }

    pub fn mode(&self) -> AdaptiveMode {
        if self.mode.load(Ordering::Relaxed) == MODE_BLOCK {
            AdaptiveMode::Block
        } else {
            AdaptiveMode::Spin
        }
    }

    /// Current global failure-rate EMA snapshot.
    pub fn failure_rate_ema(&self) -> f32 {
        unscale_ratio(self.fail_ema.load(Ordering::Relaxed))
    }

    /// Last sampled fullness ratio.
    pub fn fullness_last(&self) -> f32 {
        unscale_ratio(self.fullness_last.load(Ordering::Relaxed))
    }

    /// Average of all EMA shards; slower than [`failure_rate_ema`] but not
    /// subject to the lazy snapshot cadence.
    ///
    /// [`failure_rate_ema`]: Self::failure_rate_ema
    pub fn aggregated_failure_ema(&self) -> f32 {
        let sum: u64 = self
            .shards
            .iter()
            .map(|s| s.load(Ordering::Relaxed) as u64)
            .sum();
        unscale_ratio((sum / EMA_SHARDS as u64) as u32)
    }

    fn push_impl(&self, value: Q::Item, deadline: Option<Instant>) -> bool {
        let value = match self.inner.try_push(value) {
            Ok(()) => {
                self.on_success();
                self.notify_not_empty();
                return true;
            }
            Err(v) => v,
        };
        self.adaptive_push(value, deadline)
    }

    fn pop_impl(&self, deadline: Option<Instant>) -> Option<Q::Item> {
        if let Some(v) = self.inner.try_pop() {
            self.on_success();
            self.notify_not_full();
            return Some(v);
        }
        self.adaptive_pop(deadline)
    }

    fn adaptive_push(&self, mut value: Q::Item, deadline: Option<Instant>) -> bool {
        loop {
            if self.mode() == AdaptiveMode::Block && !self.should_exit_block() {
                return self.block_push(value, deadline);
            }
            let budget = self.spin_budget();
            let mut bk = ExponentialBackoff::default();
            for _ in 0..budget {
                match self.inner.try_push(value) {
                    Ok(()) => {
                        self.on_success();
                        self.notify_not_empty();
                        return true;
                    }
                    Err(v) => value = v,
                }
                bk.spin();
            }
            self.on_failure();
            if self.should_enter_block() {
                self.switch_to_block();
                return self.block_push(value, deadline);
            }
            match deadline {
                None => return false,
                Some(d) if Instant::now() >= d => return false,
                Some(_) => {}
            }
        }
    }

    fn adaptive_pop(&self, deadline: Option<Instant>) -> Option<Q::Item> {
        loop {
            if self.mode() == AdaptiveMode::Block && !self.should_exit_block() {
                return self.block_pop(deadline);
            }
            let budget = self.spin_budget();
            let mut bk = ExponentialBackoff::default();
            for _ in 0..budget {
                if let Some(v) = self.inner.try_pop() {
                    self.on_success();
                    self.notify_not_full();
                    return Some(v);
                }
                bk.spin();
            }
            self.on_failure();
            if self.should_enter_block() {
                self.switch_to_block();
                return self.block_pop(deadline);
            }
            match deadline {
                None => return None,
                Some(d) if Instant::now() >= d => return None,
                Some(_) => {}
            }
        }
    }

    fn block_push(&self, mut value: Q::Item, deadline: Option<Instant>) -> bool {
        let mut guard = self.mutex.lock();
        self.not_full_waiters.fetch_add(1, Ordering::SeqCst);
        let pushed = loop {
            match self.inner.try_push(value) {
                Ok(()) => break true,
                Err(v) => {
                    value = v;
                    match deadline {
                        Some(d) => {
                            if self.not_full.wait_until(&mut guard, d).timed_out() {
                                break false;
                            }
                        }
                        None => self.not_full.wait(&mut guard),
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

    fn block_pop(&self, deadline: Option<Instant>) -> Option<Q::Item> {
        let mut guard = self.mutex.lock();
        self.not_empty_waiters.fetch_add(1, Ordering::SeqCst);
        let value = loop {
            match self.inner.try_pop() {
                Some(v) => break Some(v),
                None => match deadline {
                    Some(d) => {
                        if self.not_empty.wait_until(&mut guard, d).timed_out() {
                            break None;
                        }
                    }
                    None => self.not_empty.wait(&mut guard),
                },
            }
        };
        self.not_empty_waiters.fetch_sub(1, Ordering::SeqCst);
        drop(guard);
        if value.is_some() {
            self.notify_not_full();
        }
        value
    }

    fn on_success(&self) {
        LOCAL_FAILURES.with(|f| f.set(0));
        self.publish_local_stats();
    }

    fn on_failure(&self) {
        LOCAL_FAILURES.with(|f| f.set(f.get() + 1));
        let attempts = LOCAL_ATTEMPTS.with(|a| {
            a.set(a.get() + 1);
            a.get()
        });
        if attempts >= self.cfg.local_publish_period {
            self.publish_local_stats();
        }
    }

    /// Blend the local sample into this thread's shard, lazily refresh the
    /// global snapshot, and resample fullness.
    fn publish_local_stats(&self) {
        let failures = LOCAL_FAILURES.with(|f| f.get());
        let attempts = LOCAL_ATTEMPTS.with(|a| a.get());
        let sample = if attempts > 0 {
            failures as f32 / attempts as f32
        } else {
            0.0
        };

        let shard = &self.shards[shard_index()];
        let mut old = shard.load(Ordering::Relaxed);
        loop {
            let blended =
                unscale_ratio(old) * (1.0 - self.cfg.ema_alpha) + sample * self.cfg.ema_alpha;
            match shard.compare_exchange_weak(
                old,
                scale_ratio(blended),
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(current) => old = current,
            }
        }

        LOCAL_FAILURES.with(|f| f.set(0));
        LOCAL_ATTEMPTS.with(|a| a.set(0));

        // Copying one shard into the snapshot every 64th publication avoids
        // an O(shards) sweep on the hot path.
        let counter = PUBLISH_COUNTER.with(|c| {
            c.set(c.get().wrapping_add(1));
            c.get()
        });
        if counter & 0x3F == 0 {
            self.fail_ema
                .store(shard.load(Ordering::Relaxed), Ordering::Relaxed);
        }

        if let Some(capacity) = self.inner.capacity() {
            let fullness = self.inner.len() as f32 / capacity as f32;
            self.fullness_last
                .store(scale_ratio(fullness), Ordering::Relaxed);
        }
    }

    fn should_enter_block(&self) -> bool {
        self.failure_rate_ema() >= self.cfg.fail_high
            || self.fullness_last() >= self.cfg.full_high
    }

    fn should_exit_block(&self) -> bool {
        let now_ns = self.origin.elapsed().as_nanos() as u64;
        let last_exit = self.last_block_exit_ns.load(Ordering::Relaxed);
        let grace_ok = now_ns.saturating_sub(last_exit) > self.cfg.block_grace.as_nanos() as u64;
        self.failure_rate_ema() <= self.cfg.fail_low
            && self.fullness_last() <= self.cfg.full_low
            && grace_ok
    }

    fn switch_to_block(&self) {
        self.mode.store(MODE_BLOCK, Ordering::Release);
    }

    fn switch_to_spin(&self) {
        self.last_block_exit_ns
            .store(self.origin.elapsed().as_nanos() as u64, Ordering::Relaxed);
        self.mode.store(MODE_SPIN, Ordering::Release);
    }

    /// Linear penalty on the spin budget: the hotter the queue, the fewer
    /// spins before giving up (or parking).
    fn spin_budget(&self) -> u32 {
        if self.mode.load(Ordering::Relaxed) == MODE_BLOCK {
            if self.should_exit_block() {
                self.switch_to_spin();
            } else {
                return self.cfg.min_spin;
            }
        }
        let fr = self.failure_rate_ema();
        let penalty = if Q::BOUNDED {
            (fr + self.fullness_last()) * 0.5
        } else {
            fr
        };
        let span = (self.cfg.base_spin - self.cfg.min_spin) as f32;
        let dynamic = self.cfg.base_spin.saturating_sub((span * penalty) as u32);
        dynamic.clamp(self.cfg.min_spin, self.cfg.max_spin)
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
