//! Accept reactor
//!
//! Owns the listening socket and the I/O reactors. A single thread polls the
//! listener edge-triggered, accepts until the socket would block, and deals
//! each new descriptor to an I/O reactor by round-robin.

use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use tracing::{error, info, warn};

use crate::constants::{DEFAULT_POLL_TIMEOUT_MS, DEFAULT_RESPONSE_QUEUE_CAPACITY};
use crate::error::{MaelstromError, Result};
use crate::net::io_reactor::{HandlerFactory, IoReactor, IoReactorHandle};
use crate::net::listener::Listener;
use crate::net::poller::{EpollPoller, EV_EDGE, EV_READ};
use crate::net::response_queue::WakeupFd;
use crate::utils::affinity::pin_current_thread;

/// Reactor topology configuration.
#[derive(Debug, Clone)]
pub struct ReactorConfig {
    /// Number of I/O reactors.
    pub io_reactors: usize,
    /// I/O reactor `i` pins to `io_cores[i % len]`; empty disables pinning.
    pub io_cores: Vec<usize>,
    /// Optional core for the accept thread.
    pub accept_core: Option<usize>,
    /// Capacity of each reactor's response queue.
    pub response_queue_capacity: usize,
}

impl Default for ReactorConfig {
    fn default() -> Self {
        Self {
            io_reactors: (num_cpus::get() / 2).max(1),
            io_cores: Vec::new(),
            accept_core: None,
            response_queue_capacity: DEFAULT_RESPONSE_QUEUE_CAPACITY,
        }
    }
}

impl ReactorConfig {
    pub fn with_io_reactors(mut self, count: usize) -> Self {
        self.io_reactors = count;
        self
    }

    pub fn with_io_cores(mut self, cores: Vec<usize>) -> Self {
        self.io_cores = cores;
        self
    }
}

struct AcceptShared {
    listener: Listener,
    poller: EpollPoller,
    handles: Vec<IoReactorHandle>,
    rr: AtomicU64,
    stop: AtomicBool,
    wake: WakeupFd,
}

/// The accepting reactor plus the I/O reactors it feeds.
pub struct AcceptReactor {
    shared: Arc<AcceptShared>,
    io_reactors: Vec<IoReactor>,
    thread: Option<JoinHandle<()>>,
}

impl AcceptReactor {
    /// Bind `addr`, start the I/O reactors and the accept thread.
    pub fn bind(addr: &str, config: ReactorConfig, factory: Arc<HandlerFactory>) -> Result<Self> {
        let listener = Listener::bind(addr)?;

        let mut io_reactors = Vec::new();
        for i in 0..config.io_reactors.max(1) {
            let core = if config.io_cores.is_empty() {
                None
            } else {
                Some(config.io_cores[i % config.io_cores.len()])
            };
            io_reactors.push(IoReactor::new(
                i,
                core,
                config.response_queue_capacity,
                factory.clone(),
            )?);
        }
        let handles: Vec<IoReactorHandle> = io_reactors.iter().map(IoReactor::handle).collect();

        let poller = EpollPoller::new()?;
        poller.add(listener.fd(), EV_READ | EV_EDGE)?;
        let wake = WakeupFd::new()?;
        poller.add(wake.fd(), EV_READ)?;

        let shared = Arc::new(AcceptShared {
            listener,
            poller,
            handles,
            rr: AtomicU64::new(0),
            stop: AtomicBool::new(false),
            wake,
        });

        let accept_core = config.accept_core;
        let thread = thread::Builder::new().name("accept-reactor".into()).spawn({
            let shared = shared.clone();
            move || {
                if let Some(core) = accept_core {
                    if let Err(e) = pin_current_thread(core) {
                        warn!(core, error = %e, "accept reactor runs unpinned");
                    }
                }
                accept_loop(&shared);
            }
        })?;

        Ok(Self {
            shared,
            io_reactors,
            thread: Some(thread),
        })
    }

    /// Actual bound port (useful with ephemeral binds).
    pub fn local_port(&self) -> Result<u16> {
        self.shared.listener.local_port()
    }

    pub fn io_handles(&self) -> Vec<IoReactorHandle> {
        self.shared.handles.clone()
    }

    /// Handle of the reactor currently owning `fd`, if any.
    pub fn owner_of(&self, fd: RawFd) -> Option<IoReactorHandle> {
        self.shared.handles.iter().find(|h| h.owns(fd)).cloned()
    }

    /// Stop accepting, then stop every I/O reactor.
    pub fn stop(&mut self) {
        if !self.shared.stop.swap(true, Ordering::AcqRel) {
            let _ = self.shared.wake.signal();
        }
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
        for reactor in &mut self.io_reactors {
            reactor.stop();
        }
    }
}

impl Drop for AcceptReactor {
    fn drop(&mut self) {
        self.stop();
    }
}

fn accept_loop(shared: &Arc<AcceptShared>) {
    info!("accept reactor started");
    let listen_fd = shared.listener.fd();
    let wake_fd = shared.wake.fd();

    while !shared.stop.load(Ordering::Acquire) {
        let events = match shared.poller.poll(DEFAULT_POLL_TIMEOUT_MS) {
            Ok(events) => events,
            Err(MaelstromError::Io(ref e)) if e.kind() == std::io::ErrorKind::Interrupted => {
                warn!("accept poll interrupted, retrying");
                continue;
            }
            Err(e) => {
                error!(error = %e, "accept poll failed, reactor exiting");
                break;
            }
        };

        for ev in events {
            if ev.fd == wake_fd {
                shared.wake.drain();
                continue;
            }
            if ev.fd != listen_fd {
                warn!(fd = ev.fd, "unexpected descriptor on accept reactor");
                continue;
            }
            // Edge-triggered: accept everything pending.
            loop {
                match shared.listener.accept() {
                    Ok(Some(stream)) => {
                        let n = shared.handles.len() as u64;
                        let idx = (shared.rr.fetch_add(1, Ordering::Relaxed) % n) as usize;
                        if let Err(e) = shared.handles[idx].register(stream) {
                            // The stream is dropped (and closed) on failure;
                            // one lost connection never stops the acceptor.
                            error!(reactor = idx, error = %e, "connection registration failed");
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        error!(error = %e, "accept failed");
                        break;
                    }
                }
            }
        }
    }
    info!("accept reactor stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::connection::{ConnectionContext, EventHandler};
    use std::io::Read;
    use std::net::TcpStream;
    use std::time::Duration;

    struct Quiet;
    impl EventHandler for Quiet {
        fn on_readable(&mut self, _ctx: &mut ConnectionContext) {}
    }

    #[test]
    fn test_round_robin_assignment() {
        let factory: Arc<HandlerFactory> = Arc::new(|_sender, _fd| Box::new(Quiet));
        let mut acceptor = AcceptReactor::bind(
            "127.0.0.1:0",
            ReactorConfig::default().with_io_reactors(2),
            factory,
        )
        .unwrap();
        let port = acceptor.local_port().unwrap();

        // Round-robin is by accept order, so any arrival interleaving still
        // deals two connections to each reactor.
        let clients: Vec<TcpStream> = (0..4)
            .map(|_| TcpStream::connect(("127.0.0.1", port)).unwrap())
            .collect();

        let handles = acceptor.io_handles();
        for _ in 0..500 {
            let total: usize = handles.iter().map(|h| h.connection_count()).sum();
            if total == 4 {
                break;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        assert_eq!(handles[0].connection_count(), 2);
        assert_eq!(handles[1].connection_count(), 2);

        drop(clients);
        acceptor.stop();
    }

    #[test]
    fn test_stop_is_idempotent_and_fast() {
        let factory: Arc<HandlerFactory> = Arc::new(|_sender, _fd| Box::new(Quiet));
        let mut acceptor = AcceptReactor::bind(
            "127.0.0.1:0",
            ReactorConfig::default().with_io_reactors(2),
            factory,
        )
        .unwrap();
        let start = std::time::Instant::now();
        acceptor.stop();
        acceptor.stop();
        // Wakeup descriptors make shutdown prompt, not poll-timeout bound.
        assert!(start.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn test_replies_route_to_owning_reactor() {
        let factory: Arc<HandlerFactory> = Arc::new(|_sender, _fd| Box::new(Quiet));
        let mut acceptor = AcceptReactor::bind(
            "127.0.0.1:0",
            ReactorConfig::default().with_io_reactors(2),
            factory,
        )
        .unwrap();
        let port = acceptor.local_port().unwrap();

        let mut client = TcpStream::connect(("127.0.0.1", port)).unwrap();
        let handles = acceptor.io_handles();
        let mut server_fd = None;
        'outer: for _ in 0..500 {
            for h in &handles {
                if let Some(&fd) = h.connection_fds().first() {
                    server_fd = Some(fd);
                    break 'outer;
                }
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        let fd = server_fd.expect("connection never registered");

        let owner = acceptor.owner_of(fd).expect("no owner for registered fd");
        assert!(owner.submit_reply(fd, b"hi".to_vec()));

        client
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        let mut buf = [0u8; 2];
        client.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"hi");

        acceptor.stop();
    }
}
