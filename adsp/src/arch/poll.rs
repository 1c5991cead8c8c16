//! Bounded hardware polling.
//!
//! Every wait on hardware in the platform core goes through one of two bounds:
//! a [`Retry`] budget (fixed count, fixed delay between attempts) or a
//! [`Deadline`] on the cycle counter. Neither can be cancelled; the caller blocks
//! until the condition holds or the bound expires and gets a [`Timeout`] back.

use thiserror_no_std::Error;

use super::CycleTimer;

/// A bounded wait expired before its condition held.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("hardware poll timed out")]
pub struct Timeout;

/// Result of a bounded poll.
pub type PollResult<T = ()> = Result<T, Timeout>;

/// Fixed number of attempts with a fixed delay between them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Retry {
    /// Attempts after the first check
    pub tries: u32,
    /// Cycles to wait between attempts
    pub delay_cycles: u64,
}

impl Retry {
    /// Budget of `tries` further checks spaced `delay_cycles` apart.
    pub const fn new(tries: u32, delay_cycles: u64) -> Self {
        Self { tries, delay_cycles }
    }

    /// Poll `condition` until it returns true or the budget runs out.
    pub fn wait_until<T, F>(&self, timer: &T, mut condition: F) -> PollResult
    where
        T: CycleTimer + ?Sized,
        F: FnMut() -> bool,
    {
        if condition() {
            return Ok(());
        }
        for _ in 0..self.tries {
            timer.delay_cycles(self.delay_cycles);
            if condition() {
                return Ok(());
            }
        }
        Err(Timeout)
    }
}

/// Absolute point on the cycle counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deadline {
    expires_at: u64,
}

impl Deadline {
    /// Deadline `us` microseconds from now.
    pub fn after_us<T: CycleTimer + ?Sized>(timer: &T, us: u64) -> Self {
        Self::after_cycles(timer, us.saturating_mul(timer.cycles_per_us()))
    }

    /// Deadline `ms` milliseconds from now.
    pub fn after_ms<T: CycleTimer + ?Sized>(timer: &T, ms: u64) -> Self {
        Self::after_us(timer, ms.saturating_mul(1000))
    }

    /// Deadline `cycles` ticks from now.
    pub fn after_cycles<T: CycleTimer + ?Sized>(timer: &T, cycles: u64) -> Self {
        Self {
            expires_at: timer.cycles().saturating_add(cycles),
        }
    }

    /// Whether the counter has passed the deadline.
    pub fn expired<T: CycleTimer + ?Sized>(&self, timer: &T) -> bool {
        timer.cycles() >= self.expires_at
    }

    /// Poll `condition` every `interval_cycles` until it holds or the deadline
    /// passes. The condition is checked once more after expiry.
    pub fn wait_until<T, F>(&self, timer: &T, interval_cycles: u64, mut condition: F) -> PollResult
    where
        T: CycleTimer + ?Sized,
        F: FnMut() -> bool,
    {
        while !self.expired(timer) {
            if condition() {
                return Ok(());
            }
            timer.delay_cycles(interval_cycles);
        }
        if condition() { Ok(()) } else { Err(Timeout) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::mock::MockHal;
    use core::cell::Cell;

    #[test]
    fn test_retry_succeeds_midway() {
        let hal = MockHal::new();
        let checks = Cell::new(0);
        let result = Retry::new(32, 256).wait_until(&hal, || {
            checks.set(checks.get() + 1);
            checks.get() == 4
        });
        assert_eq!(result, Ok(()));
        assert_eq!(checks.get(), 4);
    }

    #[test]
    fn test_retry_budget_is_bounded() {
        let hal = MockHal::new();
        let checks = Cell::new(0u32);
        let result = Retry::new(32, 256).wait_until(&hal, || {
            checks.set(checks.get() + 1);
            false
        });
        assert_eq!(result, Err(Timeout));
        assert_eq!(checks.get(), 33);
    }

    #[test]
    fn test_deadline_expires() {
        let hal = MockHal::new();
        let deadline = Deadline::after_us(&hal, 2000);
        assert_eq!(deadline.wait_until(&hal, 12, || false), Err(Timeout));
        assert!(deadline.expired(&hal));
    }

    #[test]
    fn test_deadline_condition_already_true() {
        let hal = MockHal::new();
        let deadline = Deadline::after_us(&hal, 10);
        assert_eq!(deadline.wait_until(&hal, 12, || true), Ok(()));
    }
}
