//! Architecture Abstraction Layer
//!
//! This module defines the narrow hardware interface consumed by the platform
//! core. Everything that touches silicon directly (register access, cache
//! maintenance, the cycle counter, interrupt masking, core start/halt and the
//! terminal power-down routine) is reached through the traits below, so the
//! heap, power and core-lifecycle logic stays target-agnostic and can be driven
//! by a test double on the host.
//!
//! # Design Principles
//! - Minimal abstraction overhead (all traits are statically dispatched)
//! - Each primitive is a single hardware operation with no policy attached
//! - Bounded polling, locking and handshakes are built on top in submodules

#![deny(missing_docs)]
#![warn(clippy::undocumented_unsafe_blocks)]

use thiserror_no_std::Error;

use crate::cpu::CoreId;
use crate::macros::LogSink;

pub mod cache;
pub mod handshake;
pub mod poll;
pub mod sync;

#[cfg(test)]
pub(crate) mod mock;

pub use handshake::BootHandshake;

/// Architecture-specific error types
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ArchError {
    /// The core did not respond to a halt request
    #[error("core halt failed")]
    HaltFailed,
}

/// Result type for architecture operations
pub type ArchResult<T> = Result<T, ArchError>;

/// Memory-mapped register access.
pub trait RegisterIo {
    /// Read a 32-bit register.
    fn read32(&self, addr: usize) -> u32;
    /// Write a 32-bit register.
    fn write32(&self, addr: usize, value: u32);
    /// Read a 16-bit register.
    fn read16(&self, addr: usize) -> u16;
    /// Write a 16-bit register.
    fn write16(&self, addr: usize, value: u16);

    /// Read-modify-write: clear `clear`, then set `set`. Returns the written value.
    fn update32(&self, addr: usize, clear: u32, set: u32) -> u32 {
        let value = (self.read32(addr) & !clear) | set;
        self.write32(addr, value);
        value
    }

    /// 16-bit read-modify-write.
    fn update16(&self, addr: usize, clear: u16, set: u16) -> u16 {
        let value = (self.read16(addr) & !clear) | set;
        self.write16(addr, value);
        value
    }
}

/// Data cache maintenance by address range.
pub trait CacheMaintenance {
    /// Discard cached lines overlapping `[addr, addr + len)`.
    fn dcache_invalidate(&self, addr: usize, len: usize);
    /// Write dirty lines overlapping `[addr, addr + len)` back to memory.
    fn dcache_writeback(&self, addr: usize, len: usize);
}

/// Monotonic cycle counter and busy delay.
pub trait CycleTimer {
    /// Current value of the free-running cycle counter.
    fn cycles(&self) -> u64;

    /// Counter ticks per microsecond.
    fn cycles_per_us(&self) -> u64;

    /// Spin for at least `cycles` ticks.
    fn delay_cycles(&self, cycles: u64) {
        let start = self.cycles();
        while self.cycles().wrapping_sub(start) < cycles {
            core::hint::spin_loop();
        }
    }

    /// Spin for at least `us` microseconds.
    fn delay_us(&self, us: u64) {
        self.delay_cycles(us.saturating_mul(self.cycles_per_us()));
    }
}

/// Interrupt masking on the calling core only.
pub trait LocalIrq {
    /// Mask local interrupts, returning the previous state.
    fn irq_local_disable(&self) -> u32;
    /// Restore the state returned by [`LocalIrq::irq_local_disable`].
    fn irq_local_restore(&self, state: u32);
}

/// Private stack handed to a secondary core at start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StackRegion {
    /// Lowest address of the stack area
    pub base: usize,
    /// Size of the stack area in bytes
    pub size: usize,
}

/// Physical core start, halt and activity queries.
pub trait CoreControl {
    /// Core executing the caller.
    fn current_core(&self) -> CoreId;

    /// Live hardware activity of `core`.
    fn is_core_active(&self, core: CoreId) -> bool;

    /// Start `core` on `stack`.
    ///
    /// The platform arranges for [`crate::cpu::secondary_entry`] to run on the
    /// new core with `handshake`. Returns once the start request is issued;
    /// the core reports progress through the handshake.
    fn start_core(&self, core: CoreId, stack: StackRegion, handshake: &'static BootHandshake);

    /// Ask the core's power management to enter the soft-off state. Returns
    /// `false` if the request was refused.
    fn request_soft_off(&self, core: CoreId) -> bool;

    /// Halt a secondary core that has reached idle.
    fn halt_core(&self, core: CoreId) -> ArchResult<()>;
}

/// Terminal power-down primitive.
pub trait PowerDown {
    /// Lock the routine into cache, gate LP-SRAM when `disable_lpsram` and every
    /// HP-SRAM bank flagged in `hpsram_masks` (one word per segment). Never returns.
    fn power_down(&self, disable_lpsram: bool, hpsram_masks: &[u32]) -> !;
}

/// Complete hardware interface required by the platform core.
pub trait Hal:
    RegisterIo + CacheMaintenance + CycleTimer + LocalIrq + CoreControl + PowerDown + LogSink + Sync
{
}

impl<T> Hal for T where
    T: RegisterIo + CacheMaintenance + CycleTimer + LocalIrq + CoreControl + PowerDown + LogSink + Sync
{
}
