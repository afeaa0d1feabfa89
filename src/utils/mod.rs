//! Small platform utilities

pub mod affinity;

pub use affinity::{current_cpu, pin_current_thread};
