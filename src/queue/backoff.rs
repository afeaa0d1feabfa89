//! Contention backoff primitives
//!
//! Shared by the queue adapters and the thread pool. Both strategies are
//! per-call-frame state; neither owns anything beyond its counters.

use std::thread;
use std::time::Duration;

/// Emit one CPU pause hint, falling back to a scheduler yield on platforms
/// without one.
#[inline]
pub fn cpu_relax() {
    #[cfg(any(target_arch = "x86_64", target_arch = "aarch64"))]
    std::hint::spin_loop();

    #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
    thread::yield_now();
}

/// Exponential backoff: pause `spins` times per invocation, doubling up to a
/// ceiling.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    spins: u32,
    ceiling: u32,
}

impl ExponentialBackoff {
    /// Create a backoff with the given spin ceiling.
    pub fn new(ceiling: u32) -> Self {
        Self { spins: 1, ceiling }
    }

    /// Restart the progression at one pause per invocation.
    pub fn reset(&mut self) {
        self.spins = 1;
    }

    /// Emit the current pause burst and double the next one.
    pub fn spin(&mut self) {
        for _ in 0..self.spins {
            cpu_relax();
        }
        if self.spins < self.ceiling {
            self.spins <<= 1;
        }
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::new(64)
    }
}

/// Three-phase backoff: pause, then yield, then sleep.
///
/// The sleep phase resets the counter back to the yield phase so the
/// progression never escalates beyond ~50 microsecond naps.
#[derive(Debug, Clone)]
pub struct HybridBackoff {
    count: u32,
    spin_ceiling: u32,
    yield_threshold: u32,
}

impl HybridBackoff {
    pub fn new(spin_ceiling: u32, yield_threshold: u32) -> Self {
        Self {
            count: 0,
            spin_ceiling,
            yield_threshold,
        }
    }

    pub fn reset(&mut self) {
        self.count = 0;
    }

    pub fn spin(&mut self) {
        if self.count < self.spin_ceiling {
            cpu_relax();
        } else if self.count < self.spin_ceiling + self.yield_threshold {
            thread::yield_now();
        } else {
            thread::sleep(Duration::from_micros(50));
            self.count = self.yield_threshold;
        }
        self.count += 1;
    }
}

impl Default for HybridBackoff {
    fn default() -> Self {
        Self::new(128, 32)
    }
}
