//! Bounded MPMC ring queue
//!
//! Fixed-capacity multi-producer multi-consumer queue built on per-cell
//! sequence counters. Producers claim a cell by CAS-advancing the tail ticket
//! once the cell's sequence matches the ticket; consumers read once the
//! sequence is one past their ticket. The cell sequence is the only
//! publication edge between producer and consumer, so the tickets themselves
//! only need relaxed ordering.
//!
//! For a ring of capacity `C` (always a power of two), the cell at index
//! `i & (C - 1)` carries sequence values `i, i + 1, i + C, i + C + 1, ...`:
//! `seq == ticket` means free for the producer holding `ticket`,
//! `seq == ticket + 1` means occupied for the consumer holding `ticket`.

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam::utils::CachePadded;

use crate::queue::MpmcQueue;

struct Cell<T> {
    seq: AtomicU64,
    value: UnsafeCell<MaybeUninit<T>>,
}

/// Bounded lock-free MPMC ring.
///
/// `try_push` and `try_pop` never block and never allocate; they fail only on
/// fullness and emptiness respectively.
pub struct ArrayMpmcQueue<T> {
    buffer: Box<[CachePadded<Cell<T>>]>,
    mask: u64,
    capacity: usize,
    head: CachePadded<AtomicU64>,
    tail: CachePadded<AtomicU64>,
}

unsafe impl<T: Send> Send for ArrayMpmcQueue<T> {}
unsafe impl<T: Send> Sync for ArrayMpmcQueue<T> {}

impl<T> ArrayMpmcQueue<T> {
    /// Create a ring with at least `capacity` slots, rounded up to the next
    /// power of two (minimum 1).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1).next_power_of_two();
        let buffer = (0..capacity)
            .map(|i| {
                CachePadded::new(Cell {
                    seq: AtomicU64::new(i as u64),
                    value: UnsafeCell::new(MaybeUninit::uninit()),
                })
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();

        Self {
            buffer,
            mask: (capacity - 1) as u64,
            capacity,
            head: CachePadded::new(AtomicU64::new(0)),
            tail: CachePadded::new(AtomicU64::new(0)),
        }
    }

    /// Attempt to enqueue without blocking. Returns the value back when the
    /// ring is full.
    pub fn try_push(&self, value: T) -> Result<(), T> {
        let mut ticket = self.tail.load(Ordering::Relaxed);
        loop {
            let cell = &self.buffer[(ticket & self.mask) as usize];
            let seq = cell.seq.load(Ordering::Acquire);

            if seq == ticket {
                // Cell is free for this ticket; reserve it.
                match self.tail.compare_exchange_weak(
                    ticket,
                    ticket + 1,
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        unsafe { (*cell.value.get()).write(value) };
                        cell.seq.store(ticket + 1, Ordering::Release);
                        return Ok(());
                    }
                    Err(current) => ticket = current,
                }
            } else if seq < ticket {
                // The consumer for this cell has not caught up: full.
                return Err(value);
            } else {
                // Another producer got ahead; chase the new tail.
                ticket = self.tail.load(Ordering::Relaxed);
            }
        }
    }

    /// Attempt to dequeue without blocking. Returns `None` when empty.
    pub fn try_pop(&self) -> Option<T> {
        let mut ticket = self.head.load(Ordering::Relaxed);
        loop {
            let cell = &self.buffer[(ticket & self.mask) as usize];
            let seq = cell.seq.load(Ordering::Acquire);

            if seq == ticket + 1 {
                match self.head.compare_exchange_weak(
                    ticket,
                    ticket + 1,
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        let value = unsafe { (*cell.value.get()).assume_init_read() };
                        // Free the cell for the producer one lap ahead.
                        cell.seq
                            .store(ticket + self.capacity as u64, Ordering::Release);
                        return Some(value);
                    }
                    Err(current) => ticket = current,
                }
            } else if seq == ticket {
                return None;
            } else {
                ticket = self.head.load(Ordering::Relaxed);
            }
        }
    }

    /// Number of slots in the ring.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Approximate number of queued items. Exact only when quiescent.
    pub fn len(&self) -> usize {
        let head = self.head.load(Ordering::Acquire);
        let tail = self.tail.load(Ordering::Acquire);
        tail.saturating_sub(head) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_full(&self) -> bool {
        self.len() >= self.capacity
    }
}

impl<T> Drop for ArrayMpmcQueue<T> {
    fn drop(&mut self) {
        // Remaining values must run their destructors; the cells themselves
        // are plain storage.
        while self.try_pop().is_some() {}
    }
}

impl<T: Send> MpmcQueue for ArrayMpmcQueue<T> {
    type Item = T;
    const BOUNDED: bool = true;

    fn try_push(&self, value: T) -> Result<(), T> {
        ArrayMpmcQueue::try_push(self, value)
    }

    fn try_pop(&self) -> Option<T> {
        ArrayMpmcQueue::try_pop(self)
    }

    fn len(&self) -> usize {
        ArrayMpmcQueue::len(self)
    }

    fn capacity(&self) -> Option<usize> {
        Some(self.capacity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicU64;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_capacity_rounds_up() {
        let q = ArrayMpmcQueue::<u32>::new(3);
        assert_eq!(q.capacity(), 4);
        let q = ArrayMpmcQueue::<u32>::new(0);
        assert_eq!(q.capacity(), 1);
        let q = ArrayMpmcQueue::<u32>::new(1024);
        assert_eq!(q.capacity(), 1024);
    }

    #[test]
    fn test_ring_sanity() {
        let q = ArrayMpmcQueue::new(3);
        for v in 1..=4 {
            assert!(q.try_push(v).is_ok());
        }
        assert_eq!(q.try_push(5), Err(5));
        for v in 1..=4 {
            assert_eq!(q.try_pop(), Some(v));
        }
        assert_eq!(q.try_pop(), None);
    }

    #[test]
    fn test_len_tracks_occupancy() {
        let q = ArrayMpmcQueue::new(8);
        assert!(q.is_empty());
        q.try_push(1u64).unwrap();
        q.try_push(2).unwrap();
        assert_eq!(q.len(), 2);
        q.try_pop().unwrap();
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn test_drop_runs_remaining_destructors() {
        let counter = Arc::new(AtomicU64::new(0));
        struct Tracked(Arc<AtomicU64>);
        impl Drop for Tracked {
            fn drop(&mut self) {
                self.0.fetch_add(1, Ordering::Relaxed);
            }
        }

        {
            let q = ArrayMpmcQueue::new(8);
            for _ in 0..5 {
                q.try_push(Tracked(counter.clone())).ok().unwrap();
            }
        }
        assert_eq!(counter.load(Ordering::Relaxed), 5);
    }

    #[test]
    fn test_mpmc_multiset_conservation() {
        const PRODUCERS: usize = 4;
        const CONSUMERS: usize = 4;
        const PER_PRODUCER: u64 = 2000;

        let q = Arc::new(ArrayMpmcQueue::new(64));
        let popped_sum = Arc::new(AtomicU64::new(0));
        let popped_count = Arc::new(AtomicU64::new(0));

        let mut producers = Vec::new();
        for p in 0..PRODUCERS as u64 {
            let q = q.clone();
            producers.push(thread::spawn(move || {
                for i in 0..PER_PRODUCER {
                    let mut v = p * PER_PRODUCER + i;
                    loop {
                        match q.try_push(v) {
                            Ok(()) => break,
                            Err(back) => {
                                v = back;
                                std::hint::spin_loop();
                            }
                        }
                    }
                }
            }));
        }

        let total = PRODUCERS as u64 * PER_PRODUCER;
        let mut consumers = Vec::new();
        for _ in 0..CONSUMERS {
            let q = q.clone();
            let popped_sum = popped_sum.clone();
            let popped_count = popped_count.clone();
            consumers.push(thread::spawn(move || {
                while popped_count.load(Ordering::Relaxed) < total {
                    if let Some(v) = q.try_pop() {
                        popped_sum.fetch_add(v, Ordering::Relaxed);
                        popped_count.fetch_add(1, Ordering::Relaxed);
                    } else {
                        std::hint::spin_loop();
                    }
                }
            }));
        }

        for h in producers {
            h.join().unwrap();
        }
        for h in consumers {
            h.join().unwrap();
        }

        assert_eq!(popped_count.load(Ordering::Relaxed), total);
        assert_eq!(popped_sum.load(Ordering::Relaxed), total * (total - 1) / 2);
        assert!(q.try_pop().is_none());
    }

    proptest::proptest! {
        // Sequential model check against a deque bounded at the rounded-up
        // capacity: every push/pop outcome must match.
        #[test]
        fn prop_matches_deque_model(ops in proptest::collection::vec((proptest::bool::ANY, 0u8..255), 1..200)) {
            let q = ArrayMpmcQueue::new(4);
            let mut model: VecDeque<u8> = VecDeque::new();
            for (is_push, v) in ops {
                if is_push {
                    let ok = q.try_push(v).is_ok();
                    let model_ok = model.len() < q.capacity();
                    if model_ok {
                        model.push_back(v);
                    }
                    proptest::prop_assert_eq!(ok, model_ok);
                } else {
                    proptest::prop_assert_eq!(q.try_pop(), model.pop_front());
                }
            }
        }
    }
}
