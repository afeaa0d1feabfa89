//! Unbounded linked MPMC queue
//!
//! Michael-Scott style two-pointer queue with a dummy head node. Memory is
//! managed by an owned [`EpochDomain`]: a popped head is retired rather than
//! freed, so concurrent readers holding stale snapshots never touch freed
//! memory. Both operations run inside an epoch critical section because both
//! dereference nodes that a concurrent pop may retire.
//!
//! The head-tail graph is cyclic only transiently between the `next` link CAS
//! and the tail swing; every node has exactly one owner at a time (producer,
//! then the queue, then the retire list).

use std::cell::UnsafeCell;
use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

use crossbeam::utils::CachePadded;

use crate::queue::ebr::{EbrStatsSnapshot, EpochDomain, EpochGuard};
use crate::queue::MpmcQueue;

struct Node<T> {
    next: AtomicPtr<Node<T>>,
    value: UnsafeCell<Option<T>>,
}

impl<T> Node<T> {
    fn dummy() -> *mut Self {
        Box::into_raw(Box::new(Self {
            next: AtomicPtr::new(ptr::null_mut()),
            value: UnsafeCell::new(None),
        }))
    }

    fn with_value(value: T) -> *mut Self {
        Box::into_raw(Box::new(Self {
            next: AtomicPtr::new(ptr::null_mut()),
            value: UnsafeCell::new(Some(value)),
        }))
    }
}

unsafe fn drop_node<T>(p: *mut ()) {
    drop(unsafe { Box::from_raw(p.cast::<Node<T>>()) });
}

/// Unbounded lock-free MPMC queue.
///
/// `try_push` fails only on allocation failure (which aborts in Rust), so it
/// effectively always succeeds; `try_pop` fails only when the queue is empty.
/// Neither operation blocks.
pub struct ListMpmcQueue<T> {
    head: CachePadded<AtomicPtr<Node<T>>>,
    tail: CachePadded<AtomicPtr<Node<T>>>,
    count: CachePadded<AtomicUsize>,
    domain: EpochDomain,
}

unsafe impl<T: Send> Send for ListMpmcQueue<T> {}
unsafe impl<T: Send> Sync for ListMpmcQueue<T> {}

impl<T> ListMpmcQueue<T> {
    pub fn new() -> Self {
        let dummy = Node::<T>::dummy();
        Self {
            head: CachePadded::new(AtomicPtr::new(dummy)),
            tail: CachePadded::new(AtomicPtr::new(dummy)),
            count: CachePadded::new(AtomicUsize::new(0)),
            domain: EpochDomain::new(),
        }
    }

    pub fn try_push(&self, value: T) -> Result<(), T> {
        let new_node = Node::with_value(value);
        let _guard = EpochGuard::new(&self.domain);
        loop {
            let tail = self.tail.load(Ordering::Acquire);
            let next = unsafe { (*tail).next.load(Ordering::Acquire) };
            // Stale snapshot check: tail moved under us, start over.
            if tail != self.tail.load(Ordering::Acquire) {
                continue;
            }
            if next.is_null() {
                if unsafe {
                    (*tail)
                        .next
                        .compare_exchange_weak(
                            ptr::null_mut(),
                            new_node,
                            Ordering::Release,
                            Ordering::Relaxed,
                        )
                        .is_ok()
                } {
                    // Best-effort swing; a failure means someone assisted.
                    let _ = self.tail.compare_exchange_weak(
                        tail,
                        new_node,
                        Ordering::Release,
                        Ordering::Relaxed,
                    );
                    self.count.fetch_add(1, Ordering::Relaxed);
                    return Ok(());
                }
            } else {
                // Assist the lagging tail.
                let _ = self.tail.compare_exchange_weak(
                    tail,
                    next,
                    Ordering::Release,
                    Ordering::Relaxed,
                );
            }
        }
    }

    pub fn try_pop(&self) -> Option<T> {
        let _guard = EpochGuard::new(&self.domain);
        loop {
            let head = self.head.load(Ordering::Acquire);
            let tail = self.tail.load(Ordering::Acquire);
            let next = unsafe { (*head).next.load(Ordering::Acquire) };
            if head != self.head.load(Ordering::Acquire) {
                continue;
            }
            if head == tail {
                if next.is_null() {
                    return None;
                }
                // Push linked but tail not yet swung; assist.
                let _ = self.tail.compare_exchange_weak(
                    tail,
                    next,
                    Ordering::Release,
                    Ordering::Relaxed,
                );
            } else if self
                .head
                .compare_exchange_weak(head, next, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                // `next` is now the new dummy; move its value out and retire
                // the old dummy.
                let value = unsafe { (*(*next).value.get()).take() };
                debug_assert!(value.is_some());
                unsafe { self.domain.retire(head.cast(), drop_node::<T>) };
                self.count.fetch_sub(1, Ordering::Relaxed);
                return value;
            }
        }
    }

    /// Approximate number of queued items.
    pub fn len(&self) -> usize {
        self.count.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.head.load(Ordering::Acquire) == self.tail.load(Ordering::Acquire)
    }

    /// Reclamation counters of the owned domain.
    pub fn reclaimer_stats(&self) -> EbrStatsSnapshot {
        self.domain.stats()
    }
}

impl<T> Default for ListMpmcQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Drop for ListMpmcQueue<T> {
    fn drop(&mut self) {
        // Retired nodes first, then whatever is still linked (the dummy plus
        // any unpopped values).
        self.domain.drain_all();
        let mut node = self.head.load(Ordering::Relaxed);
        while !node.is_null() {
            let next = unsafe { (*node).next.load(Ordering::Relaxed) };
            drop(unsafe { Box::from_raw(node) });
            node = next;
        }
    }
}

impl<T: Send> MpmcQueue for ListMpmcQueue<T> {
    type Item = T;
    const BOUNDED: bool = false;

    fn try_push(&self, value: T) -> Result<(), T> {
        ListMpmcQueue::try_push(self, value)
    }

    fn try_pop(&self) -> Option<T> {
        ListMpmcQueue::try_pop(self)
    }

    fn len(&self) -> usize {
        ListMpmcQueue::len(self)
    }

    fn capacity(&self) -> Option<usize> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU64;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_fifo_single_thread() {
        let q = ListMpmcQueue::new();
        assert!(q.is_empty());
        for v in 0..100u32 {
            q.try_push(v).unwrap();
        }
        for v in 0..100u32 {
            assert_eq!(q.try_pop(), Some(v));
        }
        assert_eq!(q.try_pop(), None);
        assert!(q.is_empty());
    }

    #[test]
    fn test_interleaved_push_pop() {
        let q = ListMpmcQueue::new();
        q.try_push(1u8).unwrap();
        q.try_push(2).unwrap();
        assert_eq!(q.try_pop(), Some(1));
        q.try_push(3).unwrap();
        assert_eq!(q.try_pop(), Some(2));
        assert_eq!(q.try_pop(), Some(3));
        assert_eq!(q.try_pop(), None);
    }

    #[test]
    fn test_values_dropped_exactly_once() {
        let drops = Arc::new(AtomicU64::new(0));
        struct Tracked(Arc<AtomicU64>);
        impl Drop for Tracked {
            fn drop(&mut self) {
                self.0.fetch_add(1, Ordering::Relaxed);
            }
        }

        {
            let q = ListMpmcQueue::new();
            for _ in 0..100 {
                q.try_push(Tracked(drops.clone())).ok().unwrap();
            }
            for _ in 0..40 {
                drop(q.try_pop().unwrap());
            }
            // 40 dropped by us, 60 still queued and dropped with the queue.
            assert_eq!(drops.load(Ordering::Relaxed), 40);
        }
        assert_eq!(drops.load(Ordering::Relaxed), 100);
    }

    #[test]
    fn test_mpmc_popped_multiset_matches() {
        const THREADS: u64 = 4;
        const PER_THREAD: u64 = 1000;

        let q = Arc::new(ListMpmcQueue::new());
        let sum = Arc::new(AtomicU64::new(0));
        let count = Arc::new(AtomicU64::new(0));
        let total = THREADS * PER_THREAD;

        let mut handles = Vec::new();
        for t in 0..THREADS {
            let q = q.clone();
            handles.push(thread::spawn(move || {
                for i in 0..PER_THREAD {
                    q.try_push(t * PER_THREAD + i).unwrap();
                }
            }));
        }
        for _ in 0..THREADS {
            let q = q.clone();
            let sum = sum.clone();
            let count = count.clone();
            handles.push(thread::spawn(move || {
                while count.load(Ordering::Relaxed) < total {
                    if let Some(v) = q.try_pop() {
                        sum.fetch_add(v, Ordering::Relaxed);
                        count.fetch_add(1, Ordering::Relaxed);
                    } else {
                        std::hint::spin_loop();
                    }
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(count.load(Ordering::Relaxed), total);
        assert_eq!(sum.load(Ordering::Relaxed), total * (total - 1) / 2);
        let stats = q.reclaimer_stats();
        assert_eq!(stats.retired, total);
    }
}
