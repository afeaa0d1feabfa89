//! Tuning constants and configuration defaults
//!
//! This module contains the tuning constants used throughout the crate.
//! Values that interact (power-of-two requirements, threshold ordering) are
//! checked both at compile time and by `validate_constants`.

use static_assertions::const_assert;

/// Cache line size for alignment decisions (64 bytes on most modern CPUs)
pub const CACHE_LINE_SIZE: usize = 64;

/// Default capacity for bounded work/reply rings
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

/// Default capacity of a reactor's response queue
pub const DEFAULT_RESPONSE_QUEUE_CAPACITY: usize = 1024;

/// Non-blocking push attempts for a response-queue submission
pub const RESPONSE_PUSH_ATTEMPTS: usize = 3;

/// Maximum ready events returned by a single poll call
pub const POLL_EVENT_BATCH: usize = 1024;

/// Default poll timeout for reactor loops, in milliseconds
pub const DEFAULT_POLL_TIMEOUT_MS: i32 = 1000;

/// Maximum threads that may ever touch one reclamation domain
pub const EBR_MAX_THREADS: usize = 128;

/// Retired-object count that triggers an epoch advance and scan
pub const EBR_RETIRE_THRESHOLD: usize = 64;

/// Operation interval between opportunistic epoch-advance attempts
pub const EBR_OP_CHECK_INTERVAL: u64 = 1024;

/// Scan rounds attempted before a domain force-frees at shutdown
pub const EBR_SHUTDOWN_SCAN_ROUNDS: usize = 8;

/// Spin attempts before a blocking adapter parks on its condvar
pub const SPIN_ATTEMPTS_BEFORE_BLOCK: u32 = 128;

/// Shard count for the adaptive adapter's failure-rate EMA aggregator
pub const EMA_SHARDS: usize = 16;

/// Fixed-point scale for EMA / fullness ratios stored in atomics
pub const RATIO_SCALE: f32 = 100_000.0;

/// Push attempts before `HybridThreadPool::submit` reports failure
pub const SUBMIT_PUSH_ATTEMPTS: usize = 64;

/// Default steal-heuristic ratio: flexible workers help the pinned backlog
/// only when it exceeds `ratio * flexible_backlog + bias`
pub const DEFAULT_STEAL_RATIO: usize = 2;

/// Default steal-heuristic bias (see [`DEFAULT_STEAL_RATIO`])
pub const DEFAULT_STEAL_BIAS: usize = 8;

/// Default window size for an ordered callback buffer
pub const DEFAULT_ORDERED_WINDOW: usize = 256;

const_assert!(EMA_SHARDS.is_power_of_two());
const_assert!(DEFAULT_ORDERED_WINDOW.is_power_of_two());
const_assert!(CACHE_LINE_SIZE.is_power_of_two());

/// Validate that all constants are consistently configured
pub fn validate_constants() -> Result<(), &'static str> {
    if !DEFAULT_QUEUE_CAPACITY.is_power_of_two() {
        return Err("DEFAULT_QUEUE_CAPACITY must be a power of 2");
    }
    if !DEFAULT_RESPONSE_QUEUE_CAPACITY.is_power_of_two() {
        return Err("DEFAULT_RESPONSE_QUEUE_CAPACITY must be a power of 2");
    }
    if EBR_RETIRE_THRESHOLD == 0 || EBR_MAX_THREADS == 0 {
        return Err("EBR policy values must be greater than 0");
    }
    if POLL_EVENT_BATCH == 0 {
        return Err("POLL_EVENT_BATCH must be greater than 0");
    }
    if RESPONSE_PUSH_ATTEMPTS == 0 || SUBMIT_PUSH_ATTEMPTS == 0 {
        return Err("push attempt budgets must be greater than 0");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constants_validation() {
        assert!(validate_constants().is_ok());
    }

    #[test]
    fn test_ring_defaults_are_powers_of_two() {
        assert!(DEFAULT_QUEUE_CAPACITY.is_power_of_two());
        assert!(DEFAULT_RESPONSE_QUEUE_CAPACITY.is_power_of_two());
        assert!(DEFAULT_ORDERED_WINDOW.is_power_of_two());
    }

    #[test]
    fn test_ebr_policy_is_reasonable() {
        assert!(EBR_RETIRE_THRESHOLD > 0);
        assert!(EBR_OP_CHECK_INTERVAL > EBR_RETIRE_THRESHOLD as u64);
        assert!(EBR_MAX_THREADS >= 2);
    }
}
