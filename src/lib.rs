//! Maelstrom - concurrency core for multi-user network file services
//!
//! A substrate of lock-free queues, a hybrid pinned/flexible worker pool, a
//! multi-reactor epoll event loop with per-reactor response queues, and an
//! in-order per-connection callback buffer. Protocol codecs, authentication
//! and storage live elsewhere and submit their work through these primitives.

pub mod constants;
pub mod error;
pub mod net;
pub mod pool;
pub mod queue;
pub mod utils;

pub use error::{MaelstromError, Result};
pub use net::{AcceptReactor, EventHandler, IoReactor, ReactorConfig, ReplySender, ResponseQueue};
pub use pool::{HybridThreadPool, PoolConfig, Task, TaskClass};
pub use queue::{
    AdaptiveBlockingQueue, AdaptiveConfig, ArrayMpmcQueue, BlockingQueue, ListMpmcQueue,
    MpmcQueue, OrderedCallbackBuffer,
};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
