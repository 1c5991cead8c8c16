//! Runtime Power Governor
//!
//! [`PowerRuntime`] arbitrates the power domains several subsystems share.
//! Each [`PowerContext`] is an independent gate:
//!
//! | context        | `get`                                   | `put`                                 |
//! |----------------|-----------------------------------------|---------------------------------------|
//! | `HostDmaL1`    | count a host DMA user                   | last user forces an L1 exit           |
//! | `SspClock`     | disable SSP clock gating                | re-enable it                          |
//! | `SspPower`     | power the SSP link, wait for ack        | unpower it, wait for ack              |
//! | `DmicClock`    | disable DMIC clock gating               | re-enable it                          |
//! | `DmicPower`    | power the DMIC link, wait for ack       | unpower it, wait for ack              |
//! | `DmaClock`     | disable GP-DMA clock gating             | re-enable it                          |
//! | `DmaOwner`     | claim GP-DMA ownership                  | release exactly those bits            |
//! | `CoreMemory`   | power on a secondary core's memory      | power it off                          |
//! | `CoreHpClock`  | withdraw the core's sleep vote          | vote; all active cores voting sleeps  |
//! | `DspCoreGate`  | hold a core powered for one client      | drop the client; last one gates       |
//!
//! `enable`/`disable` of `DspCoreGate` set and clear the flag that keeps the
//! DSP in D0. [`PowerRuntime::is_active`] reports that flag, or any pending
//! d0ix-prepare vote.
//!
//! # Locking
//!
//! All state shared between cores sits behind one [`IrqSpinLock`] in
//! [`PowerRuntimeData`]. Only bit and counter updates happen with it held;
//! hardware acknowledge polling always runs after it is released. The D0 flag
//! is only touched by the primary core and needs local interrupt masking only.
//!
//! Acknowledge timeouts are logged and never returned to the caller.

#![deny(missing_docs)]
#![warn(clippy::undocumented_unsafe_blocks)]

pub mod sram;

use core::mem::{align_of, size_of};
use core::sync::atomic::{AtomicBool, Ordering};

use bitflags::bitflags;
use thiserror_no_std::Error;

use crate::arch::Hal;
use crate::arch::poll::{Deadline, Retry};
use crate::arch::sync::IrqSpinLock;
use crate::cpu::{self, CoreId, MAX_CORE_COUNT};
use crate::memory::{AllocCaps, AllocFlags, MemoryManager, MemoryResult, MemoryZone};
use crate::platform::PlatformConfig;
use crate::{log_debug, log_error, log_info, log_warn};

/// Independently gated power domains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum PowerContext {
    /// Host DMA keeping the host link out of L1
    HostDmaL1 = 0,
    /// SSP link clock gating
    SspClock = 1,
    /// SSP link power
    SspPower = 2,
    /// DMIC link clock gating
    DmicClock = 3,
    /// DMIC link power
    DmicPower = 4,
    /// GP-DMA controller clock gating
    DmaClock = 5,
    /// GP-DMA controller ownership
    DmaOwner = 6,
    /// Private memory of a secondary core
    CoreMemory = 7,
    /// Per-core vote on the high-performance clock domain
    CoreHpClock = 8,
    /// DSP core power gating
    DspCoreGate = 9,
}

/// Raw context value with no handler.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("unsupported power context {0}")]
pub struct UnsupportedContext(pub u32);

impl TryFrom<u32> for PowerContext {
    type Error = UnsupportedContext;

    fn try_from(raw: u32) -> Result<Self, Self::Error> {
        Ok(match raw {
            0 => Self::HostDmaL1,
            1 => Self::SspClock,
            2 => Self::SspPower,
            3 => Self::DmicClock,
            4 => Self::DmicPower,
            5 => Self::DmaClock,
            6 => Self::DmaOwner,
            7 => Self::CoreMemory,
            8 => Self::CoreHpClock,
            9 => Self::DspCoreGate,
            _ => return Err(UnsupportedContext(raw)),
        })
    }
}

bitflags! {
    /// Subsystems that may hold a DSP core powered.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DspClient: u32 {
        /// Host requests
        const HOST = 1 << 31;
        /// Pipelines scheduled on the core
        const TOPOLOGY = 1 << 30;
    }
}

/// `DspCoreGate` index: a core id in the low bits and client flags in the
/// high bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DspGateIndex(u32);

impl DspGateIndex {
    /// Index for `core` on behalf of `clients`.
    pub const fn new(core: CoreId, clients: DspClient) -> Self {
        Self(core.raw() as u32 | clients.bits())
    }

    /// Reinterpret a raw index.
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    /// Raw index.
    pub const fn raw(self) -> u32 {
        self.0
    }

    /// Core part, unvalidated.
    pub const fn core(self) -> u32 {
        self.0 & !DspClient::all().bits()
    }

    /// Client part.
    pub const fn clients(self) -> DspClient {
        DspClient::from_bits_truncate(self.0)
    }
}

/// State shared between cores, guarded by the power lock.
#[derive(Debug)]
struct SharedPowerState {
    host_dma_l1_refs: u32,
    sleep_core_mask: u32,
    prepare_d0ix_core_mask: u32,
    dsp_client_bitmap: [u32; MAX_CORE_COUNT],
    hp_clock_low_power: bool,
}

impl SharedPowerState {
    const fn new() -> Self {
        Self {
            host_dma_l1_refs: 0,
            sleep_core_mask: 0,
            prepare_d0ix_core_mask: 0,
            dsp_client_bitmap: [0; MAX_CORE_COUNT],
            hp_clock_low_power: false,
        }
    }
}

/// Power bookkeeping shared by every core.
///
/// Built once at bring-up and never freed.
pub struct PowerRuntimeData {
    shared: IrqSpinLock<SharedPowerState>,
    dsp_d0: AtomicBool,
}

impl PowerRuntimeData {
    /// All counters zero, no votes, D0 not requested.
    pub const fn new() -> Self {
        Self {
            shared: IrqSpinLock::new(SharedPowerState::new()),
            dsp_d0: AtomicBool::new(false),
        }
    }

    /// Place the power data in uncached shared memory. The block is never
    /// freed.
    pub fn allocate<H: Hal + ?Sized>(memory: &MemoryManager<'_, H>) -> MemoryResult<&'static Self> {
        let block = memory.alloc_aligned(
            MemoryZone::SysShared,
            AllocFlags::COHERENT,
            AllocCaps::empty(),
            size_of::<Self>(),
            Some(align_of::<Self>()),
        )?;
        let data = block.cast::<Self>();
        // SAFETY: the block is fresh, sized and aligned for `Self`, and the
        // heap never hands it out again since it is never freed.
        unsafe {
            data.as_ptr().write(Self::new());
            Ok(&*data.as_ptr())
        }
    }
}

impl Default for PowerRuntimeData {
    fn default() -> Self {
        Self::new()
    }
}

/// The runtime power governor.
///
/// A handle over shared [`PowerRuntimeData`]; copies act on the same state.
pub struct PowerRuntime<'a, H: Hal + ?Sized> {
    hal: &'a H,
    config: &'a PlatformConfig,
    data: &'a PowerRuntimeData,
}

// Only references inside; no bound on `H`.
impl<H: Hal + ?Sized> Clone for PowerRuntime<'_, H> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<H: Hal + ?Sized> Copy for PowerRuntime<'_, H> {}

impl<'a, H: Hal + ?Sized> PowerRuntime<'a, H> {
    /// Governor over `data`.
    pub fn new(hal: &'a H, config: &'a PlatformConfig, data: &'a PowerRuntimeData) -> Self {
        Self { hal, config, data }
    }

    /// Take a reference on `context` for the unit selected by `index`.
    pub fn get(&self, context: PowerContext, index: u32) {
        match context {
            PowerContext::HostDmaL1 => self.host_dma_l1_get(),
            PowerContext::SspClock => self.ssp_clock(index, true),
            PowerContext::SspPower => self.ssp_power(index, true),
            PowerContext::DmicClock => self.dmic_clock(true),
            PowerContext::DmicPower => self.dmic_power(true),
            PowerContext::DmaClock => self.dma_clock(index, true),
            PowerContext::DmaOwner => self.dma_owner(index, true),
            PowerContext::CoreMemory => self.core_memory(index, true),
            PowerContext::CoreHpClock => self.core_hp_clock_get(index),
            PowerContext::DspCoreGate => self.dsp_core_gate_get(DspGateIndex::from_raw(index)),
        }
    }

    /// Drop a reference on `context` for the unit selected by `index`.
    pub fn put(&self, context: PowerContext, index: u32) {
        match context {
            PowerContext::HostDmaL1 => self.host_dma_l1_put(),
            PowerContext::SspClock => self.ssp_clock(index, false),
            PowerContext::SspPower => self.ssp_power(index, false),
            PowerContext::DmicClock => self.dmic_clock(false),
            PowerContext::DmicPower => self.dmic_power(false),
            PowerContext::DmaClock => self.dma_clock(index, false),
            PowerContext::DmaOwner => self.dma_owner(index, false),
            PowerContext::CoreMemory => self.core_memory(index, false),
            PowerContext::CoreHpClock => self.core_hp_clock_put(index),
            PowerContext::DspCoreGate => self.dsp_core_gate_put(DspGateIndex::from_raw(index)),
        }
    }

    /// [`PowerRuntime::get`] on a raw context value; unknown values are ignored.
    pub fn get_raw(&self, context: u32, index: u32) {
        if let Ok(context) = PowerContext::try_from(context) {
            self.get(context, index);
        }
    }

    /// [`PowerRuntime::put`] on a raw context value; unknown values are ignored.
    pub fn put_raw(&self, context: u32, index: u32) {
        if let Ok(context) = PowerContext::try_from(context) {
            self.put(context, index);
        }
    }

    /// Set the flag of a flag-style context. Primary core only.
    pub fn enable(&self, context: PowerContext) {
        if context == PowerContext::DspCoreGate {
            self.set_dsp_d0(true);
        }
    }

    /// Clear the flag of a flag-style context. Primary core only.
    pub fn disable(&self, context: PowerContext) {
        if context == PowerContext::DspCoreGate {
            self.set_dsp_d0(false);
        }
    }

    /// Whether `context` is active. Only `DspCoreGate` can be queried.
    ///
    /// # Panics
    /// On any other context.
    pub fn is_active(&self, context: PowerContext) -> bool {
        match context {
            PowerContext::DspCoreGate => {
                let pending = self.data.shared.lock(self.hal).prepare_d0ix_core_mask;
                self.data.dsp_d0.load(Ordering::Acquire) || pending != 0
            }
            other => {
                log_error!(self.hal, "is_active on unsupported context", other as u32);
                panic!("unsupported power context query");
            }
        }
    }

    /// Announce that `core` is about to enter d0ix.
    pub fn prepare_d0ix_enable(&self, core: CoreId) {
        self.data.shared.lock(self.hal).prepare_d0ix_core_mask |= core.mask();
    }

    /// Withdraw the d0ix announcement of `core`.
    pub fn prepare_d0ix_disable(&self, core: CoreId) {
        self.data.shared.lock(self.hal).prepare_d0ix_core_mask &= !core.mask();
    }

    /// Whether `core` has announced d0ix.
    pub fn prepare_d0ix_is_requested(&self, core: CoreId) -> bool {
        self.data.shared.lock(self.hal).prepare_d0ix_core_mask & core.mask() != 0
    }

    /// Clients holding `core` powered, as raw [`DspClient`] bits.
    pub fn dsp_clients(&self, core: CoreId) -> u32 {
        self.data.shared.lock(self.hal).dsp_client_bitmap[core.index()]
    }

    /// Outstanding `HostDmaL1` references.
    pub fn host_dma_l1_refs(&self) -> u32 {
        self.data.shared.lock(self.hal).host_dma_l1_refs
    }

    /// Power the whole DSP down. Never returns.
    ///
    /// Waits a bounded time for the last outgoing IPC message to be taken
    /// by the host, then gates every HP-SRAM bank and LP-SRAM.
    pub fn power_off(&self) -> ! {
        let regs = &self.config.registers;
        let timing = &self.config.timing;
        let idle = Deadline::after_us(self.hal, timing.ipc_busy_timeout_us).wait_until(
            self.hal,
            timing.default_delay_cycles,
            || self.hal.read32(regs.ipc_dipcidr) & regs.dipcidr_busy == 0,
        );
        if idle.is_err() {
            log_error!(self.hal, "ipc still busy at power off");
        }
        let masks = sram::full_masks(&self.config.memory.sram);
        self.hal.power_down(true, &masks)
    }

    fn set_dsp_d0(&self, d0: bool) {
        let state = self.hal.irq_local_disable();
        self.data.dsp_d0.store(d0, Ordering::Release);
        self.hal.irq_local_restore(state);
        log_info!(self.hal, "dsp d0 request", d0);
    }

    fn host_dma_l1_get(&self) {
        let mut shared = self.data.shared.lock(self.hal);
        shared.host_dma_l1_refs = shared.host_dma_l1_refs.saturating_add(1);
    }

    fn host_dma_l1_put(&self) {
        let last = {
            let mut shared = self.data.shared.lock(self.hal);
            if shared.host_dma_l1_refs == 0 {
                None
            } else {
                shared.host_dma_l1_refs -= 1;
                Some(shared.host_dma_l1_refs == 0)
            }
        };
        match last {
            None => log_warn!(self.hal, "host dma l1 put without get"),
            Some(true) => {
                let regs = &self.config.registers;
                self.hal.update32(regs.svcfg, 0, regs.svcfg_force_l1_exit);
                self.hal.delay_cycles(self.config.timing.force_l1_exit_cycles);
                self.hal.update32(regs.svcfg, regs.svcfg_force_l1_exit, 0);
            }
            Some(false) => {}
        }
    }

    /// Update shared control bits with the power lock held.
    fn update_locked(&self, addr: usize, clear: u32, set: u32) -> u32 {
        let _shared = self.data.shared.lock(self.hal);
        self.hal.update32(addr, clear, set)
    }

    fn ssp_clock(&self, index: u32, ungate: bool) {
        #[cfg(feature = "ssp")]
        {
            let cgd = self.config.registers.ssp_cgd(index);
            let reg = self.config.registers.i2slctl;
            if ungate {
                self.update_locked(reg, 0, cgd);
            } else {
                self.update_locked(reg, cgd, 0);
            }
        }
        #[cfg(not(feature = "ssp"))]
        let _ = (index, ungate);
    }

    fn ssp_power(&self, index: u32, on: bool) {
        #[cfg(feature = "ssp")]
        {
            let regs = &self.config.registers;
            self.set_link_power(regs.i2slctl, regs.ssp_spa(index), regs.ssp_cpa(index), on);
            log_debug!(self.hal, "ssp power", index, on);
        }
        #[cfg(not(feature = "ssp"))]
        let _ = (index, on);
    }

    fn dmic_clock(&self, ungate: bool) {
        #[cfg(feature = "dmic")]
        {
            let regs = &self.config.registers;
            if ungate {
                self.update_locked(regs.dmiclctl, 0, regs.dmic_dcgd);
            } else {
                self.update_locked(regs.dmiclctl, regs.dmic_dcgd, 0);
            }
        }
        #[cfg(not(feature = "dmic"))]
        let _ = ungate;
    }

    fn dmic_power(&self, on: bool) {
        #[cfg(feature = "dmic")]
        {
            let regs = &self.config.registers;
            self.set_link_power(regs.dmiclctl, regs.dmic_spa, regs.dmic_cpa, on);
            log_debug!(self.hal, "dmic power", on);
        }
        #[cfg(not(feature = "dmic"))]
        let _ = on;
    }

    /// Drive a link power request bit and wait for its status bit to follow.
    #[cfg(any(feature = "ssp", feature = "dmic"))]
    fn set_link_power(&self, reg: usize, spa: u32, cpa: u32, on: bool) {
        if on {
            self.update_locked(reg, 0, spa);
        } else {
            self.update_locked(reg, spa, 0);
        }
        let timing = &self.config.timing;
        let acked = Retry::new(timing.link_power_tries, timing.default_delay_cycles)
            .wait_until(self.hal, || (self.hal.read32(reg) & cpa != 0) == on);
        if acked.is_err() {
            log_error!(self.hal, "link power not acknowledged", reg, on);
        }
    }

    fn dma_clock(&self, index: u32, ungate: bool) {
        let regs = &self.config.registers;
        let reg = regs.gpdma_clkctl(index);
        let value = if ungate {
            self.update_locked(reg, 0, regs.gpdma_dgcd)
        } else {
            self.update_locked(reg, regs.gpdma_dgcd, 0)
        };
        log_debug!(self.hal, "gpdma clock gating", index, value);
    }

    fn dma_owner(&self, index: u32, claim: bool) {
        let regs = &self.config.registers;
        let reg = regs.gpdma_clkctl(index);
        let value = if claim {
            self.update_locked(reg, 0, regs.gpdma_osel)
        } else {
            self.update_locked(reg, regs.gpdma_osel, 0)
        };
        log_debug!(self.hal, "gpdma owner", index, value);
    }

    fn core_memory(&self, index: u32, on: bool) {
        let memory = &self.config.memory;
        let block = match usize::try_from(index) {
            Ok(core) if core < memory.core_count => memory.core_memory.block(core),
            _ => None,
        };
        let Some((start, len)) = block else {
            log_warn!(self.hal, "no private memory for core", index);
            return;
        };
        let regs = &self.config.registers;
        let timing = &self.config.timing;
        // Failures are logged per bank.
        let _ = if on {
            sram::power_on(self.hal, regs, &memory.sram, timing, start, len)
        } else {
            sram::power_off(self.hal, regs, &memory.sram, timing, start, len)
        };
    }

    fn hp_clock_core(&self, index: u32) -> Option<CoreId> {
        let core = u8::try_from(index).ok().and_then(CoreId::new);
        match core {
            Some(core) if core.index() < self.config.memory.core_count => Some(core),
            _ => {
                log_warn!(self.hal, "hp clock vote from unknown core", index);
                None
            }
        }
    }

    fn core_hp_clock_get(&self, index: u32) {
        let Some(core) = self.hp_clock_core(index) else {
            return;
        };
        let regs = &self.config.registers;
        let mut shared = self.data.shared.lock(self.hal);
        shared.sleep_core_mask &= !core.mask();
        if shared.hp_clock_low_power {
            self.hal.update32(regs.clkctl, regs.clkctl_hp_low_power, 0);
            shared.hp_clock_low_power = false;
        }
    }

    fn core_hp_clock_put(&self, index: u32) {
        let Some(core) = self.hp_clock_core(index) else {
            return;
        };
        // Live hardware query, kept outside the lock.
        let enabled = cpu::cores_enabled_mask(self.hal, self.config.memory.core_count);
        let regs = &self.config.registers;
        let mut shared = self.data.shared.lock(self.hal);
        shared.sleep_core_mask |= core.mask();
        if enabled & shared.sleep_core_mask == enabled && !shared.hp_clock_low_power {
            self.hal.update32(regs.clkctl, 0, regs.clkctl_hp_low_power);
            shared.hp_clock_low_power = true;
        }
    }

    fn gate_core(&self, index: DspGateIndex) -> Option<usize> {
        match usize::try_from(index.core()) {
            Ok(core) if core < self.config.memory.core_count => Some(core),
            _ => {
                log_warn!(self.hal, "dsp gate for unknown core", index.raw());
                None
            }
        }
    }

    fn dsp_core_gate_get(&self, index: DspGateIndex) {
        let Some(core) = self.gate_core(index) else {
            return;
        };
        let regs = &self.config.registers;
        let bit = regs.tcpdsppg(core);

        if core == self.config.memory.primary_core.index() {
            let _shared = self.data.shared.lock(self.hal);
            self.hal.update16(regs.pwrctl, 0, bit | regs.pwrctl_tcpctlpg);
            self.hal.update32(
                regs.lpsctl,
                regs.lpsctl_bid | regs.lpsctl_battr_0,
                regs.lpsctl_fdsprun,
            );
            return;
        }

        {
            let mut shared = self.data.shared.lock(self.hal);
            shared.dsp_client_bitmap[core] |= index.clients().bits();
            self.hal.update16(regs.pwrctl, 0, bit | regs.pwrctl_tcpctlpg);
        }

        let timing = &self.config.timing;
        let powered = Retry::new(timing.dsp_power_tries, timing.dsp_power_delay_cycles)
            .wait_until(self.hal, || self.hal.read16(regs.pwrsts) & bit == bit);
        if powered.is_err() {
            log_error!(self.hal, "failed to power up core", core);
        }
    }

    fn dsp_core_gate_put(&self, index: DspGateIndex) {
        let Some(core) = self.gate_core(index) else {
            return;
        };
        let regs = &self.config.registers;

        if core == self.config.memory.primary_core.index() {
            let _shared = self.data.shared.lock(self.hal);
            self.hal.write16(regs.pwrctl, 0);
            self.hal.update32(
                regs.lpsctl,
                regs.lpsctl_fdsprun,
                regs.lpsctl_bid | regs.lpsctl_battr_0,
            );
            return;
        }

        let mut shared = self.data.shared.lock(self.hal);
        shared.dsp_client_bitmap[core] &= !index.clients().bits();
        if shared.dsp_client_bitmap[core] == 0 {
            self.hal.update16(regs.pwrctl, regs.tcpdsppg(core), 0);
        }
    }
}
