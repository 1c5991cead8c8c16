//! Platform power sequencing: boot power policy, idle decisions and the
//! terminal power-off.

use super::PlatformConfig;
use crate::arch::{Hal, cache};
use crate::cpu::CoreId;
use crate::memory::PAGE_SIZE;
use crate::power::{PowerContext, PowerRuntime};
use crate::{log_info, log_warn};

/// Magic the boot ROM expects at the start of the IMR layout page
pub const IMR_MAGIC: u32 = 0x0246_8ace;

// IMR layout header: magic, version, size, state, image size, restore vector.
const IMR_MAGIC_OFFSET: usize = 0x00;
const IMR_RESTORE_VECTOR_OFFSET: usize = 0x14;

/// What a core should do when it runs out of work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdleAction {
    /// Release the core's private memory, then wait for an interrupt.
    ReleaseCoreMemory,
    /// Plain wait for interrupt.
    WaitForInterrupt,
    /// Enter the low-power wait; the DSP may be power gated meanwhile.
    LowPowerWait,
}

/// Drives platform-wide power transitions through the governor.
pub struct PlatformPowerSequencer<'a, H: Hal + ?Sized> {
    hal: &'a H,
    config: &'a PlatformConfig,
    power: PowerRuntime<'a, H>,
}

impl<'a, H: Hal + ?Sized> PlatformPowerSequencer<'a, H> {
    /// Sequencer issuing requests through `power`.
    pub fn new(hal: &'a H, config: &'a PlatformConfig, power: PowerRuntime<'a, H>) -> Self {
        Self { hal, config, power }
    }

    /// Power state right after boot: secondary core memory off, DSP held in
    /// D0 until the host allows power gating.
    pub fn boot_policy(&self) {
        let memory = &self.config.memory;
        for core in 0..memory.core_count {
            if core != memory.primary_core.index() {
                self.power.put(PowerContext::CoreMemory, core as u32);
            }
        }
        self.power.enable(PowerContext::DspCoreGate);
        log_info!(self.hal, "boot power policy applied", memory.core_count);
    }

    /// Idle decision for `core`.
    pub fn idle_action(&self, core: CoreId) -> IdleAction {
        if core != self.config.memory.primary_core {
            if self.power.prepare_d0ix_is_requested(core) {
                IdleAction::ReleaseCoreMemory
            } else {
                IdleAction::WaitForInterrupt
            }
        } else if self.power.is_active(PowerContext::DspCoreGate) {
            IdleAction::WaitForInterrupt
        } else {
            IdleAction::LowPowerWait
        }
    }

    /// Decide the idle action of `core` and carry out its power part.
    pub fn prepare_idle(&self, core: CoreId) -> IdleAction {
        let action = self.idle_action(core);
        if action == IdleAction::ReleaseCoreMemory {
            self.power.put(PowerContext::CoreMemory, u32::from(core.raw()));
        }
        action
    }

    /// Leave `restore_vector` for the boot ROM so the next power-up can
    /// resume from the image kept in IMR.
    pub fn context_save(&self, restore_vector: u32) {
        let Some(layout) = self.config.memory.imr_layout else {
            log_warn!(self.hal, "context save without imr layout");
            return;
        };
        cache::invalidate_region(self.hal, layout, PAGE_SIZE);
        self.hal.write32(layout + IMR_MAGIC_OFFSET, IMR_MAGIC);
        self.hal
            .write32(layout + IMR_RESTORE_VECTOR_OFFSET, restore_vector);
        cache::writeback_region(self.hal, layout, PAGE_SIZE);
        log_info!(self.hal, "imr restore vector saved", restore_vector);
    }

    /// Terminal power-off of the whole DSP. Never returns.
    pub fn power_off(&self) -> ! {
        log_info!(self.hal, "platform power off");
        self.power.power_off()
    }
}
