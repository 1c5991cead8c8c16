//! Lock-free secondary core boot handshake.
//!
//! A core that is not yet running has no lock runtime, so bring-up is
//! synchronised with two flags only:
//!
//! ```text
//! primary                              secondary
//! -------                              ---------
//! reset()
//! start_core(...)          ─────────▶ entry routine begins
//!                                      acknowledge()      (ready = 1, Release)
//! wait_acknowledged()  ◀── Acquire ──
//! release()                (start = 1, Release)
//!                          ── Acquire ▶ wait_released()
//!                                      core-local bootstrap continues
//! ```
//!
//! The acknowledge strictly precedes the release: the primary never sets the
//! start flag before it has observed the ready flag.

use core::sync::atomic::{AtomicBool, Ordering};

use super::CycleTimer;
use super::poll::{Deadline, PollResult};

/// The two-flag boot handshake.
#[derive(Debug)]
pub struct BootHandshake {
    /// Set by the secondary core once its entry routine is running.
    ready: AtomicBool,
    /// Set by the primary core to let the secondary continue.
    start: AtomicBool,
}

impl BootHandshake {
    /// Both flags clear.
    pub const fn new() -> Self {
        Self {
            ready: AtomicBool::new(false),
            start: AtomicBool::new(false),
        }
    }

    /// Clear both flags before a new bring-up. Primary core only.
    pub fn reset(&self) {
        self.start.store(false, Ordering::Relaxed);
        self.ready.store(false, Ordering::Release);
    }

    /// Secondary side: report that the entry routine is running.
    pub fn acknowledge(&self) {
        self.ready.store(true, Ordering::Release);
    }

    /// Whether the secondary has acknowledged.
    pub fn is_acknowledged(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    /// Primary side: poll for the acknowledge until `deadline`.
    pub fn wait_acknowledged<T: CycleTimer + ?Sized>(
        &self,
        timer: &T,
        deadline: Deadline,
        interval_cycles: u64,
    ) -> PollResult {
        deadline.wait_until(timer, interval_cycles, || self.is_acknowledged())
    }

    /// Primary side: let the secondary continue. Only valid after the
    /// acknowledge was observed.
    pub fn release(&self) {
        debug_assert!(self.is_acknowledged(), "release before acknowledge");
        self.start.store(true, Ordering::Release);
    }

    /// Whether the primary has released the secondary.
    pub fn is_released(&self) -> bool {
        self.start.load(Ordering::Acquire)
    }

    /// Secondary side: spin until released. Runs before the core has a timer
    /// or any runtime, so it is unbounded.
    pub fn wait_released(&self) {
        while !self.is_released() {
            core::hint::spin_loop();
        }
    }
}

impl Default for BootHandshake {
    fn default() -> Self {
        Self::new()
    }
}
