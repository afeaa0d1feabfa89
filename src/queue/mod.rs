//! Lock-free queues and their adapters
//!
//! Two base queues, a bounded sequence ring ([`ArrayMpmcQueue`]) and an
//! unbounded linked queue over epoch reclamation ([`ListMpmcQueue`]), plus
//! layered adapters that add bounded spinning ([`SpinQueue`]), parking
//! ([`BlockingQueue`]) and an adaptive spin/park policy
//! ([`AdaptiveBlockingQueue`]). The [`OrderedCallbackBuffer`] reorders
//! completion callbacks into sequence order.

pub mod adaptive;
pub mod array_mpmc;
pub mod backoff;
pub mod blocking;
pub mod ebr;
pub mod list_mpmc;
pub mod ordered;
pub mod spin;

pub use adaptive::{AdaptiveBlockingQueue, AdaptiveConfig, AdaptiveMode};
pub use array_mpmc::ArrayMpmcQueue;
pub use backoff::{cpu_relax, ExponentialBackoff, HybridBackoff};
pub use blocking::BlockingQueue;
pub use ebr::{EbrStatsSnapshot, EpochDomain, EpochGuard};
pub use list_mpmc::ListMpmcQueue;
pub use ordered::OrderedCallbackBuffer;
pub use spin::SpinQueue;

/// Capability seam shared by both base queues.
///
/// `try_push` hands the value back on failure so callers can retry without
/// cloning; `try_pop` returns `None` on empty. `BOUNDED` lets adapters decide
/// at compile time whether a not-full condition is meaningful.
pub trait MpmcQueue: Send + Sync {
    type Item: Send;

    /// Whether the queue has a fixed capacity.
    const BOUNDED: bool;

    fn try_push(&self, value: Self::Item) -> Result<(), Self::Item>;
    fn try_pop(&self) -> Option<Self::Item>;

    /// Approximate occupancy.
    fn len(&self) -> usize;

    /// Fixed capacity, if any.
    fn capacity(&self) -> Option<usize>;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
