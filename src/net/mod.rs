//! Reactor networking layer
//!
//! One accept reactor deals connections round-robin to N I/O reactors. Each
//! I/O reactor owns its epoll set, its connections and one response queue;
//! workers reach it only through that queue's wakeup descriptor.

pub mod acceptor;
pub mod connection;
pub mod io_reactor;
pub mod listener;
pub mod poller;
pub mod response_queue;

pub use acceptor::{AcceptReactor, ReactorConfig};
pub use connection::{ConnectionContext, EventHandler};
pub use io_reactor::{HandlerFactory, IoReactor, IoReactorHandle, ReplySender};
pub use listener::Listener;
pub use poller::{EpollPoller, PollEvent, EV_EDGE, EV_ERROR, EV_HANGUP, EV_READ, EV_WRITE};
pub use response_queue::{Reply, ResponseQueue};
