//! Hybrid work-stealing thread pool
//!
//! Two lock-free backlogs (pinned, flexible) feed two kinds of workers.
//! Pinned workers are bound to configured cores and prefer the pinned
//! backlog, stealing from the flexible one when idle. Flexible workers help
//! the pinned backlog only when it is badly backed up, so pinned work keeps
//! its cache locality under normal load.

pub mod task;

pub use task::{Task, TaskClass};

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use tracing::warn;

use crate::constants::{
    DEFAULT_QUEUE_CAPACITY, DEFAULT_STEAL_BIAS, DEFAULT_STEAL_RATIO, SUBMIT_PUSH_ATTEMPTS,
};
use crate::error::Result;
use crate::queue::ArrayMpmcQueue;
use crate::utils::affinity::pin_current_thread;

/// Pool sizing and placement configuration.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub pinned_workers: usize,
    pub flexible_workers: usize,
    pub pinned_queue_capacity: usize,
    pub flexible_queue_capacity: usize,
    /// Pinned worker `i` binds to `pinned_cores[i % len]`; empty disables
    /// binding.
    pub pinned_cores: Vec<usize>,
    /// Flexible workers steal pinned work only when
    /// `pinned.len() > steal_ratio * flex.len() + steal_bias`.
    pub steal_ratio: usize,
    pub steal_bias: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            pinned_workers: 0,
            flexible_workers: num_cpus::get().max(1),
            pinned_queue_capacity: DEFAULT_QUEUE_CAPACITY,
            flexible_queue_capacity: DEFAULT_QUEUE_CAPACITY,
            pinned_cores: Vec::new(),
            steal_ratio: DEFAULT_STEAL_RATIO,
            steal_bias: DEFAULT_STEAL_BIAS,
        }
    }
}

impl PoolConfig {
    pub fn with_workers(mut self, pinned: usize, flexible: usize) -> Self {
        self.pinned_workers = pinned;
        self.flexible_workers = flexible;
        self
    }

    pub fn with_pinned_cores(mut self, cores: Vec<usize>) -> Self {
        self.pinned_cores = cores;
        self
    }

    pub fn with_queue_capacities(mut self, pinned: usize, flexible: usize) -> Self {
        self.pinned_queue_capacity = pinned;
        self.flexible_queue_capacity = flexible;
        self
    }

    pub fn with_steal_heuristic(mut self, ratio: usize, bias: usize) -> Self {
        self.steal_ratio = ratio;
        self.steal_bias = bias;
        self
    }
}

#[derive(Debug, Default)]
struct Counters {
    submitted_pinned: AtomicU64,
    submitted_flexible: AtomicU64,
    executed_pinned: AtomicU64,
    executed_flexible: AtomicU64,
    drained_pinned: AtomicU64,
    drained_flexible: AtomicU64,
}

/// Point-in-time pool counters. For each backlog,
/// `submitted == executed + drained` holds once the pool has shut down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub submitted_pinned: u64,
    pub submitted_flexible: u64,
    pub executed_pinned: u64,
    pub executed_flexible: u64,
    pub drained_pinned: u64,
    pub drained_flexible: u64,
}

struct PoolShared {
    pinned_queue: ArrayMpmcQueue<Task>,
    flex_queue: ArrayMpmcQueue<Task>,
    stop: AtomicBool,
    counters: Counters,
    steal_ratio: usize,
    steal_bias: usize,
}

impl PoolShared {
    fn record_executed(&self, from_pinned: bool) {
        let counter = if from_pinned {
            &self.counters.executed_pinned
        } else {
            &self.counters.executed_flexible
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Help condition: the pinned backlog is far larger than the flexible
    /// one.
    fn should_help_pinned(&self) -> bool {
        self.pinned_queue.len() > self.steal_ratio * self.flex_queue.len() + self.steal_bias
    }
}

/// Thread pool with pinned and flexible workers over two MPMC backlogs.
pub struct HybridThreadPool {
    shared: Arc<PoolShared>,
    workers: Vec<JoinHandle<()>>,
    pinned_count: usize,
    flexible_count: usize,
}

impl HybridThreadPool {
    pub fn new(config: PoolConfig) -> Result<Self> {
        let shared = Arc::new(PoolShared {
            pinned_queue: ArrayMpmcQueue::new(config.pinned_queue_capacity),
            flex_queue: ArrayMpmcQueue::new(config.flexible_queue_capacity),
            stop: AtomicBool::new(false),
            counters: Counters::default(),
            steal_ratio: config.steal_ratio,
            steal_bias: config.steal_bias,
        });

        let mut workers = Vec::with_capacity(config.pinned_workers + config.flexible_workers);
        for i in 0..config.pinned_workers {
            let shared = shared.clone();
            let core = if config.pinned_cores.is_empty() {
                None
            } else {
                Some(config.pinned_cores[i % config.pinned_cores.len()])
            };
            workers.push(
                thread::Builder::new()
                    .name(format!("pool-pinned-{i}"))
                    .spawn(move || {
                        if let Some(core) = core {
                            if let Err(e) = pin_current_thread(core) {
                                warn!(core, error = %e, "pinned worker falls back to unpinned");
                            }
                        }
                        worker_loop(&shared, true);
                    })?,
            );
        }
        for i in 0..config.flexible_workers {
            let shared = shared.clone();
            workers.push(
                thread::Builder::new()
                    .name(format!("pool-flex-{i}"))
                    .spawn(move || worker_loop(&shared, false))?,
            );
        }

        Ok(Self {
            shared,
            workers,
            pinned_count: config.pinned_workers,
            flexible_count: config.flexible_workers,
        })
    }

    /// Submit a task under a placement class.
    ///
    /// Returns false when the pool is stopping or the chosen backlog stayed
    /// full for the whole attempt budget; retry versus drop is the caller's
    /// policy.
    pub fn submit(&self, task: Task, class: TaskClass) -> bool {
        if self.shared.stop.load(Ordering::Relaxed) {
            return false;
        }
        let use_pinned = match class {
            TaskClass::PinnedOnly => self.pinned_count > 0,
            TaskClass::PreferPinned => {
                self.pinned_count > 0
                    && self.shared.pinned_queue.len() <= 2 * self.shared.flex_queue.len()
            }
            TaskClass::Flexible => false,
        };
        let queue = if use_pinned {
            &self.shared.pinned_queue
        } else {
            &self.shared.flex_queue
        };

        let mut task = Some(task);
        let mut pushed = false;
        for _ in 0..SUBMIT_PUSH_ATTEMPTS {
            match queue.try_push(task.take().unwrap()) {
                Ok(()) => {
                    pushed = true;
                    break;
                }
                Err(t) => task = Some(t),
            }
        }
        if !pushed {
            pushed = queue.try_push(task.take().unwrap()).is_ok();
        }
        if pushed {
            let counter = if use_pinned {
                &self.shared.counters.submitted_pinned
            } else {
                &self.shared.counters.submitted_flexible
            };
            counter.fetch_add(1, Ordering::Relaxed);
        }
        pushed
    }

    pub fn submit_pinned(&self, task: Task) -> bool {
        self.submit(task, TaskClass::PinnedOnly)
    }

    pub fn submit_flexible(&self, task: Task) -> bool {
        self.submit(task, TaskClass::Flexible)
    }

    /// Stop workers, join them, then execute whatever is still queued.
    pub fn shutdown(&mut self) {
        if self.shared.stop.swap(true, Ordering::SeqCst) {
            return;
        }
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
        while let Some(task) = self.shared.pinned_queue.try_pop() {
            self.shared
                .counters
                .drained_pinned
                .fetch_add(1, Ordering::Relaxed);
            task();
        }
        while let Some(task) = self.shared.flex_queue.try_pop() {
            self.shared
                .counters
                .drained_flexible
                .fetch_add(1, Ordering::Relaxed);
            task();
        }
    }

    pub fn stats(&self) -> PoolStats {
        let c = &self.shared.counters;
        PoolStats {
            submitted_pinned: c.submitted_pinned.load(Ordering::Relaxed),
            submitted_flexible: c.submitted_flexible.load(Ordering::Relaxed),
            executed_pinned: c.executed_pinned.load(Ordering::Relaxed),
            executed_flexible: c.executed_flexible.load(Ordering::Relaxed),
            drained_pinned: c.drained_pinned.load(Ordering::Relaxed),
            drained_flexible: c.drained_flexible.load(Ordering::Relaxed),
        }
    }

    pub fn pinned_worker_count(&self) -> usize {
        self.pinned_count
    }

    pub fn flexible_worker_count(&self) -> usize {
        self.flexible_count
    }
}

impl Drop for HybridThreadPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(shared: &PoolShared, pinned: bool) {
    let (primary, secondary) = if pinned {
        (&shared.pinned_queue, &shared.flex_queue)
    } else {
        (&shared.flex_queue, &shared.pinned_queue)
    };

    while !shared.stop.load(Ordering::Relaxed) {
        if let Some(task) = primary.try_pop() {
            shared.record_executed(pinned);
            task();
        } else if pinned {
            // Pinned workers may always fall back to flexible work.
            if let Some(task) = secondary.try_pop() {
                shared.record_executed(false);
                task();
            } else {
                thread::yield_now();
            }
        } else if shared.should_help_pinned() {
            if let Some(task) = secondary.try_pop() {
                shared.record_executed(true);
                task();
            } else {
                thread::yield_now();
            }
        } else {
            thread::yield_now();
        }
    }

    // Finish what is already queued for this role before exiting.
    while let Some(task) = primary.try_pop() {
        shared.record_executed(pinned);
        task();
    }
}
