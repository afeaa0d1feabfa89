//! I/O reactor
//!
//! One dedicated thread multiplexing its connections' events plus the wakeup
//! descriptor of its response queue. Each connection is owned by exactly one
//! reactor; other threads influence it only by submitting replies through the
//! response queue, which the reactor writes out from its own thread, so bytes
//! for one connection go out in submission order.

use std::collections::HashMap;
use std::io::{self, Write};
use std::net::TcpStream;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};

use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::constants::DEFAULT_POLL_TIMEOUT_MS;
use crate::error::{MaelstromError, Result};
use crate::net::connection::{Connection, EventHandler};
use crate::net::poller::{EpollPoller, PollEvent, EV_EDGE, EV_READ};
use crate::net::response_queue::ResponseQueue;
use crate::utils::affinity::pin_current_thread;

/// Cheap cloneable path from a worker back to the reactor that owns a
/// descriptor: enqueue the reply and wake the reactor.
#[derive(Clone)]
pub struct ReplySender {
    shared: Weak<IoShared>,
}

impl ReplySender {
    /// Submit a reply for `fd`. False when the reactor is gone or its
    /// response queue is full.
    pub fn send(&self, fd: RawFd, payload: Vec<u8>) -> bool {
        match self.shared.upgrade() {
            Some(shared) => shared.responses.submit(fd, payload),
            None => false,
        }
    }
}

/// Builds a handler for each newly registered descriptor. The sender posts
/// replies to the reactor owning that descriptor.
pub type HandlerFactory = dyn Fn(ReplySender, RawFd) -> Box<dyn EventHandler> + Send + Sync;

struct IoShared {
    id: usize,
    poller: EpollPoller,
    connections: Mutex<HashMap<RawFd, Connection>>,
    responses: ResponseQueue,
    factory: Arc<HandlerFactory>,
    stop: AtomicBool,
}

impl IoShared {
    fn register_stream(self: &Arc<Self>, stream: TcpStream) -> Result<()> {
        stream.set_nonblocking(true)?;
        let fd = stream.as_raw_fd();
        let sender = ReplySender {
            shared: Arc::downgrade(self),
        };
        let handler = (self.factory)(sender, fd);
        self.connections
            .lock()
            .insert(fd, Connection::new(stream, handler));
        if let Err(e) = self.poller.add(fd, EV_READ | EV_EDGE) {
            self.connections.lock().remove(&fd);
            return Err(e);
        }
        debug!(reactor = self.id, fd, "connection registered");
        Ok(())
    }

    fn dispatch(&self, ev: PollEvent) {
        let close = {
            let mut connections = self.connections.lock();
            let Some(conn) = connections.get_mut(&ev.fd) else {
                return;
            };
            if ev.is_error() {
                let err =
                    io::Error::new(io::ErrorKind::ConnectionReset, "connection error or hangup");
                conn.handler.on_error(&mut conn.ctx, err);
                // Deregistration is not optional on error events.
                conn.ctx.request_close();
            } else {
                if ev.readable() {
                    conn.handler.on_readable(&mut conn.ctx);
                }
                if ev.writable() && !conn.ctx.close_requested() {
                    conn.handler.on_writable(&mut conn.ctx);
                }
            }
            conn.ctx.close_requested()
        };
        if close {
            self.remove_connection(ev.fd);
        }
    }

    fn deliver_responses(&self) {
        let mut dead = Vec::new();
        self.responses.drain(|reply| {
            let mut connections = self.connections.lock();
            match connections.get_mut(&reply.fd) {
                Some(conn) => {
                    if let Err(e) = write_fully(&mut conn.ctx.stream, &reply.payload) {
                        warn!(reactor = self.id, fd = reply.fd, error = %e, "reply write failed");
                        dead.push(reply.fd);
                    }
                }
                None => {
                    debug!(reactor = self.id, fd = reply.fd, "reply for unknown descriptor dropped");
                }
            }
        });
        for fd in dead {
            self.remove_connection(fd);
        }
    }

    fn remove_connection(&self, fd: RawFd) {
        let conn = self.connections.lock().remove(&fd);
        if conn.is_some() {
            // Deregister while the descriptor is still open; dropping the
            // connection closes it.
            if let Err(e) = self.poller.remove(fd) {
                debug!(reactor = self.id, fd, error = %e, "poller deregistration failed");
            }
            debug!(reactor = self.id, fd, "connection closed");
        }
    }
}

/// Full payload write on a non-blocking stream, yielding on short writes.
fn write_fully(stream: &mut TcpStream, mut buf: &[u8]) -> io::Result<()> {
    while !buf.is_empty() {
        match stream.write(buf) {
            Ok(0) => {
                return Err(io::Error::new(
                    io::ErrorKind::WriteZero,
                    "connection closed mid-reply",
                ))
            }
            Ok(n) => buf = &buf[n..],
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => thread::yield_now(),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

fn run_loop(shared: &Arc<IoShared>) {
    info!(id = shared.id, "io reactor started");
    let wake_fd = shared.responses.wakeup_fd();
    while !shared.stop.load(Ordering::Acquire) {
        let events = match shared.poller.poll(DEFAULT_POLL_TIMEOUT_MS) {
            Ok(events) => events,
            Err(MaelstromError::Io(ref e)) if e.kind() == io::ErrorKind::Interrupted => {
                warn!(id = shared.id, "poll interrupted, retrying");
                continue;
            }
            Err(e) => {
                error!(id = shared.id, error = %e, "poll failed, reactor exiting");
                break;
            }
        };
        for ev in events {
            if ev.fd == wake_fd {
                shared.deliver_responses();
            } else {
                shared.dispatch(ev);
            }
        }
    }
    // Connection states die with the reactor.
    shared.connections.lock().clear();
    info!(id = shared.id, "io reactor stopped");
}

/// Owning handle for one reactor thread.
pub struct IoReactor {
    shared: Arc<IoShared>,
    thread: Option<JoinHandle<()>>,
}

impl IoReactor {
    /// Create the reactor and start its thread, optionally pinned to `core`.
    pub fn new(
        id: usize,
        core: Option<usize>,
        response_capacity: usize,
        factory: Arc<HandlerFactory>,
    ) -> Result<Self> {
        let poller = EpollPoller::new()?;
        let responses = ResponseQueue::new(response_capacity)?;
        poller.add(responses.wakeup_fd(), EV_READ)?;

        let shared = Arc::new(IoShared {
            id,
            poller,
            connections: Mutex::new(HashMap::new()),
            responses,
            factory,
            stop: AtomicBool::new(false),
        });

        let thread = thread::Builder::new()
            .name(format!("io-reactor-{id}"))
            .spawn({
                let shared = shared.clone();
                move || {
                    if let Some(core) = core {
                        if let Err(e) = pin_current_thread(core) {
                            warn!(id, core, error = %e, "reactor runs unpinned");
                        }
                    }
                    run_loop(&shared);
                }
            })?;

        Ok(Self {
            shared,
            thread: Some(thread),
        })
    }

    pub fn id(&self) -> usize {
        self.shared.id
    }

    pub fn handle(&self) -> IoReactorHandle {
        IoReactorHandle {
            shared: self.shared.clone(),
        }
    }

    /// Signal the loop to exit, wake it, and join the thread.
    pub fn stop(&mut self) {
        if !self.shared.stop.swap(true, Ordering::AcqRel) {
            self.shared.responses.wake();
        }
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for IoReactor {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Shared handle to a running reactor, used by the acceptor and by tests.
#[derive(Clone)]
pub struct IoReactorHandle {
    shared: Arc<IoShared>,
}

impl IoReactorHandle {
    pub fn id(&self) -> usize {
        self.shared.id
    }

    /// Register a connected stream with this reactor.
    pub fn register(&self, stream: TcpStream) -> Result<()> {
        self.shared.register_stream(stream)
    }

    /// Submit a reply for a descriptor this reactor owns.
    pub fn submit_reply(&self, fd: RawFd, payload: Vec<u8>) -> bool {
        self.shared.responses.submit(fd, payload)
    }

    pub fn connection_count(&self) -> usize {
        self.shared.connections.lock().len()
    }

    pub fn owns(&self, fd: RawFd) -> bool {
        self.shared.connections.lock().contains_key(&fd)
    }

    pub fn connection_fds(&self) -> Vec<RawFd> {
        self.shared.connections.lock().keys().copied().collect()
    }
}
