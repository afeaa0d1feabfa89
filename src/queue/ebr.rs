//! Epoch-based memory reclamation
//!
//! Deferred destruction for lock-free structures. Readers wrap their critical
//! sections in an [`EpochGuard`]; writers hand removed nodes to
//! [`EpochDomain::retire`], which destroys them once no active reader can
//! still hold a reference.
//!
//! The domain keeps a coarse global epoch and a fixed slab of per-thread
//! records. A retired object with retire-epoch `e` is destroyed only when
//! `e + 2 <= min(local epoch of all active threads)`. Epoch advancement is
//! gated by a flag so at most one thread advances at a time.
//!
//! Per-thread retired lists are single-writer: only the owning thread touches
//! its list during normal operation, and `drain_all` runs only at teardown
//! when no other thread can be inside the domain.

use std::cell::{Cell, RefCell, UnsafeCell};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use crossbeam::utils::CachePadded;

use crate::constants::{
    EBR_MAX_THREADS, EBR_OP_CHECK_INTERVAL, EBR_RETIRE_THRESHOLD, EBR_SHUTDOWN_SCAN_ROUNDS,
};

/// Destructor invoked on a retired pointer once it is provably unreachable.
pub type Deleter = unsafe fn(*mut ());

struct Retired {
    ptr: *mut (),
    epoch: u64,
    deleter: Deleter,
}

struct RecordLocal {
    retired: Vec<Retired>,
    op_count: u64,
}

struct ThreadRecord {
    active: AtomicBool,
    local_epoch: AtomicU64,
    local: UnsafeCell<RecordLocal>,
}

impl ThreadRecord {
    fn new() -> Self {
        Self {
            active: AtomicBool::new(false),
            local_epoch: AtomicU64::new(0),
            local: UnsafeCell::new(RecordLocal {
                retired: Vec::new(),
                op_count: 0,
            }),
        }
    }
}

/// Reclamation counters, updated with relaxed atomics.
#[derive(Debug, Default)]
pub struct EbrStats {
    advance_attempts: AtomicU64,
    advance_success: AtomicU64,
    retired: AtomicU64,
    reclaimed: AtomicU64,
}

/// Point-in-time copy of a domain's [`EbrStats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EbrStatsSnapshot {
    pub advance_attempts: u64,
    pub advance_success: u64,
    pub retired: u64,
    pub reclaimed: u64,
}

thread_local! {
    // (domain address, slot) bindings for every domain this thread has used,
    // with a one-entry cache in front so repeat lookups are O(1).
    static EBR_BINDINGS: RefCell<Vec<(usize, usize)>> = const { RefCell::new(Vec::new()) };
    static EBR_LAST_DOMAIN: Cell<usize> = const { Cell::new(0) };
    static EBR_LAST_SLOT: Cell<usize> = const { Cell::new(usize::MAX) };
}

/// A reclamation domain.
///
/// Owned by the structure whose nodes it protects; created at construction
/// and drained at teardown. Slots are assigned monotonically on a thread's
/// first use and never recycled.
pub struct EpochDomain {
    global_epoch: CachePadded<AtomicU64>,
    registered: AtomicUsize,
    threads: Box<[CachePadded<ThreadRecord>]>,
    advancing: AtomicBool,
    stats: EbrStats,
}

// The UnsafeCell parts are single-writer (owning thread), multi-reader only
// through the atomics; see module docs.
unsafe impl Send for EpochDomain {}
unsafe impl Sync for EpochDomain {}

impl EpochDomain {
    pub fn new() -> Self {
        let threads = (0..EBR_MAX_THREADS)
            .map(|_| CachePadded::new(ThreadRecord::new()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            global_epoch: CachePadded::new(AtomicU64::new(0)),
            registered: AtomicUsize::new(0),
            threads,
            advancing: AtomicBool::new(false),
            stats: EbrStats::default(),
        }
    }

    /// Slot index of the calling thread, registering it on first use.
    pub fn thread_slot(&self) -> usize {
        let key = self as *const Self as usize;
        if EBR_LAST_DOMAIN.with(|d| d.get()) == key {
            return EBR_LAST_SLOT.with(|s| s.get());
        }
        self.slow_get_or_register(key)
    }

    #[cold]
    fn slow_get_or_register(&self, key: usize) -> usize {
        let slot = EBR_BINDINGS.with(|bindings| {
            let mut bindings = bindings.borrow_mut();
            if let Some(&(_, slot)) = bindings.iter().find(|&&(d, _)| d == key) {
                return slot;
            }
            let slot = self.register_thread();
            bindings.push((key, slot));
            slot
        });
        EBR_LAST_DOMAIN.with(|d| d.set(key));
        EBR_LAST_SLOT.with(|s| s.set(slot));
        slot
    }

    fn register_thread(&self) -> usize {
        let slot = self.registered.fetch_add(1, Ordering::Relaxed);
        assert!(
            slot < EBR_MAX_THREADS,
            "EpochDomain: thread slots exhausted ({EBR_MAX_THREADS})"
        );
        self.threads[slot]
            .local_epoch
            .store(self.global_epoch.load(Ordering::Relaxed), Ordering::Relaxed);
        slot
    }

    pub(crate) fn enter(&self, slot: usize) {
        let rec = &self.threads[slot];
        rec.active.store(true, Ordering::Release);
        rec.local_epoch
            .store(self.global_epoch.load(Ordering::Acquire), Ordering::Release);
    }

    pub(crate) fn leave(&self, slot: usize) {
        self.threads[slot].active.store(false, Ordering::Release);
    }

    /// Hand a removed node to the domain for deferred destruction.
    ///
    /// # Safety
    ///
    /// `ptr` must be exclusively owned by the caller (already unlinked), and
    /// `deleter` must be the matching destructor for its real type.
    pub unsafe fn retire(&self, ptr: *mut (), deleter: Deleter) {
        if ptr.is_null() {
            return;
        }
        let slot = self.thread_slot();
        let epoch = self.global_epoch.load(Ordering::Acquire);

        // Single-writer access: this is the calling thread's own record.
        let local = unsafe { &mut *self.threads[slot].local.get() };
        local.retired.push(Retired { ptr, epoch, deleter });
        self.stats.retired.fetch_add(1, Ordering::Relaxed);

        if local.retired.len() >= EBR_RETIRE_THRESHOLD {
            self.try_advance_epoch();
            self.scan_slot(local, false);
        }

        local.op_count += 1;
        if local.op_count % EBR_OP_CHECK_INTERVAL == 0 {
            self.try_advance_epoch();
        }
    }

    fn try_advance_epoch(&self) {
        self.stats.advance_attempts.fetch_add(1, Ordering::Relaxed);
        if self
            .advancing
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            return;
        }

        let global = self.global_epoch.load(Ordering::Relaxed);
        let registered = self.registered.load(Ordering::Acquire);
        for rec in &self.threads[..registered.min(EBR_MAX_THREADS)] {
            if rec.active.load(Ordering::Acquire)
                && rec.local_epoch.load(Ordering::Acquire) < global
            {
                self.advancing.store(false, Ordering::Release);
                return;
            }
        }

        if self
            .global_epoch
            .compare_exchange(global, global + 1, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
        {
            self.stats.advance_success.fetch_add(1, Ordering::Relaxed);
        }
        self.advancing.store(false, Ordering::Release);
    }

    fn safe_epoch(&self) -> u64 {
        let mut safe = self.global_epoch.load(Ordering::Acquire);
        let registered = self.registered.load(Ordering::Acquire);
        for rec in &self.threads[..registered.min(EBR_MAX_THREADS)] {
            if rec.active.load(Ordering::Acquire) {
                let local = rec.local_epoch.load(Ordering::Acquire);
                if local < safe {
                    safe = local;
                }
            }
        }
        safe
    }

    fn scan_slot(&self, local: &mut RecordLocal, force: bool) {
        if local.retired.is_empty() {
            return;
        }
        let safe = self.safe_epoch();
        let stats = &self.stats;
        local.retired.retain(|r| {
            if force || r.epoch + 2 <= safe {
                unsafe { (r.deleter)(r.ptr) };
                stats.reclaimed.fetch_add(1, Ordering::Relaxed);
                false
            } else {
                true
            }
        });
    }

    /// Reclaim everything at teardown: a bounded number of ordinary scan
    /// rounds, then force-free whatever is left.
    ///
    /// Callers must guarantee quiescence (no thread is inside a guard and
    /// none will retire again); the owning structure's destructor provides
    /// that.
    pub(crate) fn drain_all(&self) {
        let registered = self.registered.load(Ordering::Acquire).min(EBR_MAX_THREADS);
        for _ in 0..EBR_SHUTDOWN_SCAN_ROUNDS {
            for rec in &self.threads[..registered] {
                let local = unsafe { &mut *rec.local.get() };
                self.scan_slot(local, false);
            }
        }
        for rec in &self.threads[..registered] {
            let local = unsafe { &mut *rec.local.get() };
            self.scan_slot(local, true);
        }
    }

    pub fn stats(&self) -> EbrStatsSnapshot {
        EbrStatsSnapshot {
            advance_attempts: self.stats.advance_attempts.load(Ordering::Relaxed),
            advance_success: self.stats.advance_success.load(Ordering::Relaxed),
            retired: self.stats.retired.load(Ordering::Relaxed),
            reclaimed: self.stats.reclaimed.load(Ordering::Relaxed),
        }
    }
}

impl Default for EpochDomain {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for EpochDomain {
    fn drop(&mut self) {
        self.drain_all();
    }
}

/// RAII critical-section marker: entering synchronizes the thread's local
/// epoch with the global epoch, leaving clears the active flag.
pub struct EpochGuard<'a> {
    domain: &'a EpochDomain,
    slot: usize,
}

impl<'a> EpochGuard<'a> {
    pub fn new(domain: &'a EpochDomain) -> Self {
        let slot = domain.thread_slot();
        domain.enter(slot);
        Self { domain, slot }
    }
}

impl Drop for EpochGuard<'_> {
    fn drop(&mut self) {
        self.domain.leave(self.slot);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    unsafe fn delete_box_u64(p: *mut ()) {
        drop(unsafe { Box::from_raw(p as *mut u64) });
    }

    #[test]
    fn test_thread_slot_is_stable() {
        let domain = EpochDomain::new();
        let a = domain.thread_slot();
        let b = domain.thread_slot();
        assert_eq!(a, b);
    }

    #[test]
    fn test_retire_eventually_reclaims() {
        let domain = EpochDomain::new();
        // Enough retirements to cross the threshold several times with no
        // reader active, so scans are free to reclaim.
        for i in 0..(EBR_RETIRE_THRESHOLD as u64 * 4) {
            let p = Box::into_raw(Box::new(i)) as *mut ();
            unsafe { domain.retire(p, delete_box_u64) };
        }
        domain.drain_all();
        let stats = domain.stats();
        assert_eq!(stats.retired, EBR_RETIRE_THRESHOLD as u64 * 4);
        assert_eq!(stats.reclaimed, stats.retired);
    }

    #[test]
    fn test_active_reader_defers_reclamation() {
        let domain = EpochDomain::new();
        let guard = EpochGuard::new(&domain);
        for i in 0..(EBR_RETIRE_THRESHOLD as u64 * 2) {
            let p = Box::into_raw(Box::new(i)) as *mut ();
            unsafe { domain.retire(p, delete_box_u64) };
        }
        // The guard pins the local epoch at the current global epoch, so
        // nothing retired at or after it may be destroyed yet.
        assert_eq!(domain.stats().reclaimed, 0);
        drop(guard);
        domain.drain_all();
        let stats = domain.stats();
        assert_eq!(stats.reclaimed, stats.retired);
    }

    #[test]
    fn test_concurrent_retire_accounts_for_every_node() {
        let domain = Arc::new(EpochDomain::new());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let domain = domain.clone();
            handles.push(std::thread::spawn(move || {
                for i in 0..500u64 {
                    let _guard = EpochGuard::new(&domain);
                    let p = Box::into_raw(Box::new(i)) as *mut ();
                    unsafe { domain.retire(p, delete_box_u64) };
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        domain.drain_all();
        let stats = domain.stats();
        assert_eq!(stats.retired, 8 * 500);
        assert_eq!(stats.reclaimed, stats.retired);
    }
}
