//! Connection state and the handler capability trait

use std::io;
use std::net::TcpStream;
use std::os::unix::io::{AsRawFd, RawFd};

/// Per-connection state owned exclusively by one I/O reactor.
pub struct ConnectionContext {
    fd: RawFd,
    pub stream: TcpStream,
    /// Raw-bytes streaming phase: while set, the framing handler passes bytes
    /// through instead of decoding frames (used for bulk transfers).
    pub streaming: bool,
    close_requested: bool,
}

impl ConnectionContext {
    pub(crate) fn new(stream: TcpStream) -> Self {
        let fd = stream.as_raw_fd();
        Self {
            fd,
            stream,
            streaming: false,
            close_requested: false,
        }
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    /// Ask the owning reactor to deregister and drop this connection after
    /// the current dispatch.
    pub fn request_close(&mut self) {
        self.close_requested = true;
    }

    pub fn close_requested(&self) -> bool {
        self.close_requested
    }
}

/// Callbacks a connection exposes to its owning reactor.
///
/// Handlers must not block the reactor thread on non-trivial work: parse,
/// hand the work to the thread pool, and post the reply through the owning
/// reactor's response queue.
pub trait EventHandler: Send {
    fn on_readable(&mut self, ctx: &mut ConnectionContext);

    fn on_writable(&mut self, ctx: &mut ConnectionContext) {
        let _ = ctx;
    }

    /// Error or hangup on the descriptor. The default requests close; the
    /// reactor deregisters afterwards either way.
    fn on_error(&mut self, ctx: &mut ConnectionContext, err: io::Error) {
        let _ = err;
        ctx.request_close();
    }
}

pub(crate) struct Connection {
    pub(crate) ctx: ConnectionContext,
    pub(crate) handler: Box<dyn EventHandler>,
}

impl Connection {
    pub(crate) fn new(stream: TcpStream, handler: Box<dyn EventHandler>) -> Self {
        Self {
            ctx: ConnectionContext::new(stream),
            handler,
        }
    }
}
