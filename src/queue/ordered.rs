//! Per-connection ordered callback buffer
//!
//! Completions may finish on the pool in any order; this window releases
//! their callbacks strictly in producer-assigned sequence order. Producers
//! (worker threads) insert with `push(seq, cb)`; exactly one consumer (the
//! connection's reactor) calls `drain`.
//!
//! A slot moves empty -> pending -> ready: the pending step claims the slot
//! before the callback is written, so a concurrent drain can never observe a
//! ready slot with an unwritten callback.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};

use crate::constants::DEFAULT_ORDERED_WINDOW;

/// Completion callback released by the buffer.
pub type Callback = Box<dyn FnOnce() + Send>;

const SLOT_EMPTY: u8 = 0;
const SLOT_PENDING: u8 = 1;
const SLOT_READY: u8 = 2;

struct Slot {
    state: AtomicU8,
    cb: UnsafeCell<Option<Callback>>,
}

/// Sequence-ordered release window.
///
/// Retention is bounded by the window size: a sequence more than `window`
/// ahead of the release point is rejected rather than buffered.
pub struct OrderedCallbackBuffer {
    window: u64,
    mask: u64,
    slots: Box<[Slot]>,
    /// Next sequence to release.
    base: AtomicU64,
    /// Exclusive upper bound on assigned sequences.
    next_expected: AtomicU64,
}

// Producers touch only the claim/write path of distinct slots; the single
// consumer owns the take/clear path.
unsafe impl Send for OrderedCallbackBuffer {}
unsafe impl Sync for OrderedCallbackBuffer {}

impl OrderedCallbackBuffer {
    /// Create a buffer with at least `window` slots, rounded up to a power
    /// of two.
    pub fn new(window: usize) -> Self {
        let window = window.max(1).next_power_of_two();
        let slots = (0..window)
            .map(|_| Slot {
                state: AtomicU8::new(SLOT_EMPTY),
                cb: UnsafeCell::new(None),
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            window: window as u64,
            mask: (window - 1) as u64,
            slots,
            base: AtomicU64::new(0),
            next_expected: AtomicU64::new(0),
        }
    }

    /// Insert a callback for `seq`.
    ///
    /// Returns false when the sequence was already released (`seq < base`),
    /// falls outside the window (`seq >= base + window`), or collides with an
    /// occupied slot (duplicate sequence or a window sized too small).
    pub fn push(&self, seq: u64, cb: Callback) -> bool {
        let base = self.base.load(Ordering::Acquire);
        if seq < base {
            return false;
        }
        if seq >= base + self.window {
            return false;
        }
        let slot = &self.slots[(seq & self.mask) as usize];
        if slot
            .state
            .compare_exchange(SLOT_EMPTY, SLOT_PENDING, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            return false;
        }
        unsafe { *slot.cb.get() = Some(cb) };
        slot.state.store(SLOT_READY, Ordering::Release);
        true
    }

    /// Release in-order callbacks to `consume`, up to `limit` (0 = no
    /// limit). Stops at the first gap. Returns the number released.
    pub fn drain<F: FnMut(Callback)>(&self, mut consume: F, limit: usize) -> usize {
        let mut processed = 0;
        loop {
            if limit != 0 && processed >= limit {
                break;
            }
            let seq = self.base.load(Ordering::Relaxed);
            if seq >= self.next_expected.load(Ordering::Acquire) {
                break;
            }
            let slot = &self.slots[(seq & self.mask) as usize];
            if slot.state.load(Ordering::Acquire) != SLOT_READY {
                break;
            }
            let cb = unsafe { (*slot.cb.get()).take() };
            slot.state.store(SLOT_EMPTY, Ordering::Release);
            self.base.store(seq + 1, Ordering::Release);
            if let Some(cb) = cb {
                consume(cb);
            }
            processed += 1;
        }
        processed
    }

    /// Raise the exclusive upper bound of assigned sequences.
    pub fn expect_until(&self, next_seq_exclusive: u64) {
        self.next_expected.store(next_seq_exclusive, Ordering::Release);
    }

    /// Next sequence to be released.
    pub fn base(&self) -> u64 {
        self.base.load(Ordering::Acquire)
    }
}

impl Default for OrderedCallbackBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_ORDERED_WINDOW)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;

    fn recorder(log: &Arc<Mutex<Vec<u64>>>, v: u64) -> Callback {
        let log = log.clone();
        Box::new(move || log.lock().push(v))
    }

    #[test]
    fn test_out_of_order_release() {
        let buf = OrderedCallbackBuffer::new(8);
        let log = Arc::new(Mutex::new(Vec::new()));
        buf.expect_until(3);

        assert!(buf.push(2, recorder(&log, 2)));
        assert!(buf.push(0, recorder(&log, 0)));
        assert!(buf.push(1, recorder(&log, 1)));

        let released = buf.drain(|cb| cb(), 0);
        assert_eq!(released, 3);
        assert_eq!(*log.lock(), vec![0, 1, 2]);
        assert_eq!(buf.base(), 3);
    }

    #[test]
    fn test_gap_stops_release() {
        let buf = OrderedCallbackBuffer::new(8);
        let log = Arc::new(Mutex::new(Vec::new()));
        buf.expect_until(3);

        assert!(buf.push(0, recorder(&log, 0)));
        assert!(buf.push(2, recorder(&log, 2)));
        assert_eq!(buf.drain(|cb| cb(), 0), 1);
        assert_eq!(*log.lock(), vec![0]);

        assert!(buf.push(1, recorder(&log, 1)));
        assert_eq!(buf.drain(|cb| cb(), 0), 2);
        assert_eq!(*log.lock(), vec![0, 1, 2]);
    }

    #[test]
    fn test_window_boundaries() {
        let buf = OrderedCallbackBuffer::new(8);
        let log = Arc::new(Mutex::new(Vec::new()));
        buf.expect_until(3);
        for s in 0..3 {
            assert!(buf.push(s, recorder(&log, s)));
        }
        assert_eq!(buf.drain(|cb| cb(), 0), 3);

        // base is now 3: stale sequences and anything at or past base + 8
        // are rejected; base + 7 is the last admissible slot.
        assert!(!buf.push(2, recorder(&log, 2)));
        assert!(!buf.push(11, recorder(&log, 11)));
        assert!(buf.push(10, recorder(&log, 10)));
    }

    #[test]
    fn test_duplicate_sequence_rejected() {
        let buf = OrderedCallbackBuffer::new(8);
        let log = Arc::new(Mutex::new(Vec::new()));
        buf.expect_until(2);
        assert!(buf.push(1, recorder(&log, 1)));
        assert!(!buf.push(1, recorder(&log, 100)));
    }

    #[test]
    fn test_drain_limit() {
        let buf = OrderedCallbackBuffer::new(8);
        let log = Arc::new(Mutex::new(Vec::new()));
        buf.expect_until(4);
        for s in 0..4 {
            assert!(buf.push(s, recorder(&log, s)));
        }
        assert_eq!(buf.drain(|cb| cb(), 2), 2);
        assert_eq!(*log.lock(), vec![0, 1]);
        assert_eq!(buf.drain(|cb| cb(), 0), 2);
        assert_eq!(*log.lock(), vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_released_exactly_once_across_threads() {
        use std::sync::atomic::{AtomicU64, Ordering};
        let buf = Arc::new(OrderedCallbackBuffer::new(64));
        let hits = Arc::new(AtomicU64::new(0));
        const TOTAL: u64 = 64;
        buf.expect_until(TOTAL);

        let mut handles = Vec::new();
        for t in 0..4u64 {
            let buf = buf.clone();
            let hits = hits.clone();
            handles.push(std::thread::spawn(move || {
                // Each thread owns an interleaved quarter of the sequences.
                for seq in (t..TOTAL).step_by(4) {
                    let hits = hits.clone();
                    assert!(buf.push(seq, Box::new(move || {
                        hits.fetch_add(1, Ordering::Relaxed);
                    })));
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(buf.drain(|cb| cb(), 0), TOTAL as usize);
        assert_eq!(hits.load(Ordering::Relaxed), TOTAL);
        assert_eq!(buf.base(), TOTAL);
    }
}
