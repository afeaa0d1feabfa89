//! Readiness poller over epoll
//!
//! Thin safe wrapper around `epoll_create1`/`epoll_ctl`/`epoll_wait`.
//! Connection sockets register edge-triggered so partial reads cannot cause
//! readiness busy-loops. Interruption (`EINTR`) surfaces as an
//! `io::ErrorKind::Interrupted` error, distinguishable from real failures and
//! always retryable.

use std::io;
use std::os::unix::io::RawFd;

use crate::constants::POLL_EVENT_BATCH;
use crate::error::Result;

/// Readable event bit.
pub const EV_READ: u32 = libc::EPOLLIN as u32;
/// Writable event bit.
pub const EV_WRITE: u32 = libc::EPOLLOUT as u32;
/// Error condition bit.
pub const EV_ERROR: u32 = libc::EPOLLERR as u32;
/// Peer hangup bit.
pub const EV_HANGUP: u32 = libc::EPOLLHUP as u32;
/// Edge-triggered delivery flag.
pub const EV_EDGE: u32 = libc::EPOLLET as u32;

/// One ready descriptor with its event mask.
#[derive(Debug, Clone, Copy)]
pub struct PollEvent {
    pub fd: RawFd,
    pub events: u32,
}

impl PollEvent {
    pub fn readable(&self) -> bool {
        self.events & EV_READ != 0
    }

    pub fn writable(&self) -> bool {
        self.events & EV_WRITE != 0
    }

    pub fn is_error(&self) -> bool {
        self.events & (EV_ERROR | EV_HANGUP) != 0
    }
}

pub struct EpollPoller {
    epfd: RawFd,
}

impl EpollPoller {
    pub fn new() -> Result<Self> {
        let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epfd < 0 {
            return Err(io::Error::last_os_error().into());
        }
        Ok(Self { epfd })
    }

    pub fn add(&self, fd: RawFd, events: u32) -> Result<()> {
        self.ctl(libc::EPOLL_CTL_ADD, fd, events)
    }

    pub fn modify(&self, fd: RawFd, events: u32) -> Result<()> {
        self.ctl(libc::EPOLL_CTL_MOD, fd, events)
    }

    pub fn remove(&self, fd: RawFd) -> Result<()> {
        let rc = unsafe { libc::epoll_ctl(self.epfd, libc::EPOLL_CTL_DEL, fd, std::ptr::null_mut()) };
        if rc < 0 {
            return Err(io::Error::last_os_error().into());
        }
        Ok(())
    }

    fn ctl(&self, op: libc::c_int, fd: RawFd, events: u32) -> Result<()> {
        let mut event = libc::epoll_event {
            events,
            u64: fd as u64,
        };
        let rc = unsafe { libc::epoll_ctl(self.epfd, op, fd, &mut event) };
        if rc < 0 {
            return Err(io::Error::last_os_error().into());
        }
        Ok(())
    }

    /// Wait up to `timeout_ms` for readiness. Returns an empty batch on
    /// timeout and at most [`POLL_EVENT_BATCH`] events otherwise.
    pub fn poll(&self, timeout_ms: i32) -> Result<Vec<PollEvent>> {
        let mut raw: Vec<libc::epoll_event> = Vec::with_capacity(POLL_EVENT_BATCH);
        let n = unsafe {
            libc::epoll_wait(
                self.epfd,
                raw.as_mut_ptr(),
                POLL_EVENT_BATCH as libc::c_int,
                timeout_ms,
            )
        };
        if n < 0 {
            return Err(io::Error::last_os_error().into());
        }
        unsafe { raw.set_len(n as usize) };
        Ok(raw
            .iter()
            .map(|e| PollEvent {
                fd: e.u64 as RawFd,
                events: e.events,
            })
            .collect())
    }
}

impl Drop for EpollPoller {
    fn drop(&mut self) {
        if self.epfd >= 0 {
            unsafe { libc::close(self.epfd) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_eventfd() -> RawFd {
        let fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        assert!(fd >= 0);
        fd
    }

    #[test]
    fn test_poll_times_out_empty() {
        let poller = EpollPoller::new().unwrap();
        let events = poller.poll(10).unwrap();
        assert!(events.is_empty());
    }

    #[test]
    fn test_registered_fd_reports_readable() {
        let poller = EpollPoller::new().unwrap();
        let fd = test_eventfd();
        poller.add(fd, EV_READ).unwrap();

        let value: u64 = 1;
        let n = unsafe {
            libc::write(
                fd,
                &value as *const u64 as *const libc::c_void,
                std::mem::size_of::<u64>(),
            )
        };
        assert_eq!(n, 8);

        let events = poller.poll(1000).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].fd, fd);
        assert!(events[0].readable());

        poller.remove(fd).unwrap();
        unsafe { libc::close(fd) };
    }

    #[test]
    fn test_remove_unregistered_fails() {
        let poller = EpollPoller::new().unwrap();
        let fd = test_eventfd();
        assert!(poller.remove(fd).is_err());
        unsafe { libc::close(fd) };
    }
}
