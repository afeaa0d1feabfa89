//! Cross-thread response queue with eventfd wakeup
//!
//! Worker threads finish a task and submit `(fd, payload)` here; the owning
//! reactor is woken through the eventfd and writes the replies from its own
//! thread. Every successful enqueue writes exactly one unit to the eventfd,
//! and a drain pops at most as many entries as the counter value it read, so
//! wakeup units and queue entries stay balanced.

use std::io;
use std::os::unix::io::RawFd;

use tracing::{error, warn};

use crate::constants::RESPONSE_PUSH_ATTEMPTS;
use crate::error::{MaelstromError, Result};
use crate::queue::ArrayMpmcQueue;

/// One reply bound for a connection. The payload is opaque bytes; framing is
/// the handler's concern.
#[derive(Debug)]
pub struct Reply {
    pub fd: RawFd,
    pub payload: Vec<u8>,
}

/// Owned eventfd: a kernel 64-bit counter. Writes add, reads drain and
/// return the accumulated value.
pub(crate) struct WakeupFd {
    fd: RawFd,
}

impl WakeupFd {
    pub(crate) fn new() -> Result<Self> {
        let fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if fd < 0 {
            return Err(MaelstromError::system_resource(format!(
                "eventfd create failed: {}",
                io::Error::last_os_error()
            )));
        }
        Ok(Self { fd })
    }

    pub(crate) fn fd(&self) -> RawFd {
        self.fd
    }

    /// Add one unit to the counter. `EAGAIN` means the counter is saturated,
    /// which already implies a pending wakeup.
    pub(crate) fn signal(&self) -> io::Result<()> {
        let value: u64 = 1;
        let n = unsafe {
            libc::write(
                self.fd,
                &value as *const u64 as *const libc::c_void,
                std::mem::size_of::<u64>(),
            )
        };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock {
                return Ok(());
            }
            return Err(err);
        }
        Ok(())
    }

    /// Read and zero the counter; 0 when nothing is pending.
    pub(crate) fn drain(&self) -> u64 {
        let mut value: u64 = 0;
        let n = unsafe {
            libc::read(
                self.fd,
                &mut value as *mut u64 as *mut libc::c_void,
                std::mem::size_of::<u64>(),
            )
        };
        if n < 0 {
            return 0;
        }
        value
    }
}

impl Drop for WakeupFd {
    fn drop(&mut self) {
        if self.fd >= 0 {
            unsafe { libc::close(self.fd) };
        }
    }
}

/// Bounded MPMC reply ring plus its wakeup descriptor.
pub struct ResponseQueue {
    queue: ArrayMpmcQueue<Reply>,
    wakeup: WakeupFd,
}

impl ResponseQueue {
    pub fn new(capacity: usize) -> Result<Self> {
        Ok(Self {
            queue: ArrayMpmcQueue::new(capacity),
            wakeup: WakeupFd::new()?,
        })
    }

    /// Read side of the wakeup descriptor, for poller registration.
    pub fn wakeup_fd(&self) -> RawFd {
        self.wakeup.fd()
    }

    /// Enqueue a reply and signal the owning reactor.
    ///
    /// False when the ring stayed full for all attempts (the caller decides
    /// whether to retry, drop, or write on a slow path) or the wakeup write
    /// failed.
    pub fn submit(&self, fd: RawFd, payload: Vec<u8>) -> bool {
        let mut reply = Reply { fd, payload };
        let mut pushed = false;
        for _ in 0..RESPONSE_PUSH_ATTEMPTS {
            match self.queue.try_push(reply) {
                Ok(()) => {
                    pushed = true;
                    break;
                }
                Err(back) => reply = back,
            }
        }
        if !pushed {
            warn!(fd, "response queue full, dropping reply");
            return false;
        }
        if let Err(e) = self.wakeup.signal() {
            error!(fd, error = %e, "wakeup write failed");
            return false;
        }
        true
    }

    /// Read the wakeup counter once and deliver up to that many entries.
    /// Returns the number delivered.
    pub fn drain<F: FnMut(Reply)>(&self, mut deliver: F) -> usize {
        let pending = self.wakeup.drain();
        let mut delivered = 0;
        for _ in 0..pending {
            match self.pop() {
                Some(reply) => {
                    deliver(reply);
                    delivered += 1;
                }
                None => break,
            }
        }
        delivered
    }

    /// Signal without an entry; used to interrupt a parked poll at shutdown.
    /// A drain tolerates the unmatched unit by stopping at the first empty
    /// pop.
    pub(crate) fn wake(&self) {
        let _ = self.wakeup.signal();
    }

    fn pop(&self) -> Option<Reply> {
        for _ in 0..RESPONSE_PUSH_ATTEMPTS {
            if let Some(reply) = self.queue.try_pop() {
                return Some(reply);
            }
        }
        None
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_submit_signals_wakeup() {
        let q = ResponseQueue::new(8).unwrap();
        assert!(q.submit(1, b"hello".to_vec()));
        assert!(q.submit(2, b"world".to_vec()));

        let mut seen = Vec::new();
        let n = q.drain(|reply| seen.push((reply.fd, reply.payload)));
        assert_eq!(n, 2);
        assert_eq!(seen[0], (1, b"hello".to_vec()));
        assert_eq!(seen[1], (2, b"world".to_vec()));

        // Counter is zeroed; nothing further to deliver.
        assert_eq!(q.drain(|_| panic!("no entries expected")), 0);
    }

    #[test]
    fn test_submit_fails_when_full() {
        let q = ResponseQueue::new(2).unwrap();
        assert!(q.submit(1, vec![1]));
        assert!(q.submit(1, vec![2]));
        assert!(!q.submit(1, vec![3]));
        // The failed submit must not have produced a wakeup unit.
        let mut count = 0;
        q.drain(|_| count += 1);
        assert_eq!(count, 2);
    }

    #[test]
    fn test_wakeup_balance_across_threads() {
        use std::sync::Arc;
        let q = Arc::new(ResponseQueue::new(1024).unwrap());
        let mut handles = Vec::new();
        for t in 0..4 {
            let q = q.clone();
            handles.push(std::thread::spawn(move || {
                let mut accepted = 0u64;
                for i in 0..200u64 {
                    if q.submit(t, i.to_le_bytes().to_vec()) {
                        accepted += 1;
                    }
                }
                accepted
            }));
        }
        let submitted: u64 = handles.into_iter().map(|h| h.join().unwrap()).sum();

        let mut drained = 0u64;
        loop {
            let n = q.drain(|_| drained += 1);
            if n == 0 {
                break;
            }
        }
        assert_eq!(drained, submitted);
        assert!(q.is_empty());
    }
}
