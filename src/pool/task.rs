//! Pool task types

/// An opaque unit of work with no return channel.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Placement class attached to a submitted task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskClass {
    /// May run on any worker (default).
    Flexible,
    /// Prefer pinned workers for cache locality, fall back under imbalance.
    PreferPinned,
    /// Must target the pinned backlog; falls back to flexible only when the
    /// pool has no pinned workers at all.
    PinnedOnly,
}
