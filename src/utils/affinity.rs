//! CPU affinity helpers
//!
//! Binding is best-effort everywhere it is used: a failure is reported to the
//! caller, which logs and continues unpinned.

use nix::sched::{sched_setaffinity, CpuSet};
use nix::unistd::Pid;

use crate::error::Result;

/// Restrict the calling thread to a single CPU core.
pub fn pin_current_thread(core: usize) -> Result<()> {
    let mut set = CpuSet::new();
    set.set(core)?;
    sched_setaffinity(Pid::from_raw(0), &set)?;
    Ok(())
}

/// Core the calling thread is currently running on, if the platform reports
/// it.
pub fn current_cpu() -> Option<usize> {
    let cpu = unsafe { libc::sched_getcpu() };
    if cpu >= 0 {
        Some(cpu as usize)
    } else {
        None
    }
}
