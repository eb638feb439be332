//! Time source and bounded hardware polling.
//!
//! The controllers never spin on a register without a deadline. Every wait
//! for a hardware bit goes through [`poll_until`], which checks the
//! condition, busy-waits one microsecond between checks, and gives up with
//! [`UsbError::Timeout`] once the monotonic clock passes the deadline.
//!
//! # Usage
//!
//! ```ignore
//! poll_until(&clock, 10_000, "core soft reset", || {
//!     regs.read32(DCTL) & DCTL_CSFTRST == 0
//! })?;
//! ```

use crate::error::{UsbError, UsbResult};

/// Monotonic time source with busy-wait and sleep primitives.
pub trait Clock: Send + Sync {
    /// Monotonic time in microseconds
    fn now_us(&self) -> u64;

    /// Busy-wait for `us` microseconds
    fn delay_us(&self, us: u32);

    /// Sleep for `ms` milliseconds. Thread context only.
    fn sleep_ms(&self, ms: u32) {
        self.delay_us(ms.saturating_mul(1000));
    }
}

/// Wait until `cond` holds, bounded by `timeout_us`.
pub fn poll_until<C, F>(clock: &C, timeout_us: u64, operation: &'static str, mut cond: F) -> UsbResult<()>
where
    C: Clock + ?Sized,
    F: FnMut() -> bool,
{
    let start = clock.now_us();
    loop {
        if cond() {
            return Ok(());
        }
        let elapsed = clock.now_us().saturating_sub(start);
        if elapsed >= timeout_us {
            // Last look in case the bit flipped while we were preempted
            if cond() {
                return Ok(());
            }
            log::error!("[TIMER] {} timed out after {} us", operation, elapsed);
            return Err(UsbError::Timeout {
                operation,
                duration_us: timeout_us,
            });
        }
        clock.delay_us(1);
    }
}

#[cfg(test)]
mod tests {
    use core::cell::Cell;

    use super::*;
    use crate::sim::SimClock;

    #[test]
    fn test_poll_until_succeeds_after_some_checks() {
        let clock = SimClock::new();
        let checks = Cell::new(0);
        let ret = poll_until(&clock, 100, "test", || {
            checks.set(checks.get() + 1);
            checks.get() == 5
        });
        assert!(ret.is_ok());
        assert_eq!(checks.get(), 5);
        assert_eq!(clock.now_us(), 4);
    }

    #[test]
    fn test_poll_until_times_out() {
        let clock = SimClock::new();
        let ret = poll_until(&clock, 50, "never", || false);
        assert_eq!(
            ret,
            Err(UsbError::Timeout {
                operation: "never",
                duration_us: 50
            })
        );
        assert!(clock.now_us() >= 50);
    }
}
