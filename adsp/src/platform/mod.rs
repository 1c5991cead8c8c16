//! Platform Description Layer
//!
//! Everything the platform core needs to know about a concrete DSP: where the
//! heaps live, how per-core memory and boot stacks are laid out, how HP-SRAM
//! is banked, where the power-management registers sit and how long hardware
//! may take to acknowledge. A [`PlatformConfig`] is a plain `Copy` value built
//! in a `const`; [`ace::CONFIG`] is the default ACE-class description.
//!
//! # Platform Services
//!
//! - Memory map: heap regions, per-core private memory, stacks, SRAM banks
//! - Register map: shim, IPC and HP-SRAM power registers and bit layout
//! - Timing: settle delays, retry budgets, timeouts
//! - Power sequencing ([`sequencer::PlatformPowerSequencer`])

#![deny(missing_docs)]
#![warn(clippy::undocumented_unsafe_blocks)]

use crate::cpu::{CoreId, MAX_CORE_COUNT};
use crate::memory::{HeapRegion, PersistentRegion};

pub mod ace;
pub mod sequencer;

pub use sequencer::{IdleAction, PlatformPowerSequencer};

/// Complete description of a platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlatformConfig {
    /// Memory layout
    pub memory: PlatformMemoryMap,
    /// Power-management registers
    pub registers: RegisterMap,
    /// Delays, retry budgets and timeouts
    pub timing: PlatformTiming,
}

/// Physical memory layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlatformMemoryMap {
    /// System heap extent and its cached alias
    pub system_heap: HeapRegion,
    /// Long-lived memory region, if the platform has one
    pub persistent: Option<PersistentRegion>,
    /// Cached address of the IMR layout page read by the boot ROM on resume
    pub imr_layout: Option<usize>,
    /// Private memory of the secondary cores
    pub core_memory: CoreMemoryLayout,
    /// Boot stacks handed to starting cores
    pub stacks: StackLayout,
    /// HP-SRAM banking
    pub sram: SramLayout,
    /// Cores configured in this image
    pub core_count: usize,
    /// Core that boots the image
    pub primary_core: CoreId,
}

/// Private memory blocks of the secondary cores, laid out back to back
/// starting with core 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoreMemoryLayout {
    /// Block of the first secondary core (uncached alias)
    pub base: usize,
    /// Bytes per core
    pub block_size: usize,
}

impl CoreMemoryLayout {
    /// `(start, size)` of the block backing `core`, or `None` for core 0.
    pub const fn block(&self, core: usize) -> Option<(usize, usize)> {
        if core == 0 {
            return None;
        }
        Some((self.base + (core - 1) * self.block_size, self.block_size))
    }
}

/// Per-core boot stacks, laid out back to back starting with core 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StackLayout {
    /// Stack area of core 0
    pub base: usize,
    /// Bytes per core
    pub size: usize,
}

impl StackLayout {
    /// Stack area of `core`.
    pub const fn stack(&self, core: CoreId) -> crate::arch::StackRegion {
        crate::arch::StackRegion {
            base: self.base + core.index() * self.size,
            size: self.size,
        }
    }
}

/// HP-SRAM bank geometry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SramLayout {
    /// First bank (uncached alias)
    pub base: usize,
    /// Bytes per bank
    pub bank_size: usize,
    /// Banks present
    pub bank_count: usize,
    /// Banks described by one mask word
    pub banks_per_segment: usize,
}

/// Upper bound on HP-SRAM mask words.
pub const MAX_SRAM_SEGMENTS: usize = 4;

impl SramLayout {
    /// Mask words needed to describe every bank.
    pub const fn segments(&self) -> usize {
        self.bank_count.div_ceil(self.banks_per_segment)
    }

    /// Mask with one bit per bank present in `segment`.
    pub const fn segment_mask(&self, segment: usize) -> u32 {
        let first = segment * self.banks_per_segment;
        if first >= self.bank_count {
            return 0;
        }
        let mut bits = self.bank_count - first;
        if bits > self.banks_per_segment {
            bits = self.banks_per_segment;
        }
        if bits >= 32 { u32::MAX } else { (1 << bits) - 1 }
    }

    /// Banks touched by `[start, start + len)`, as `first..end` bank indices.
    pub const fn banks_touching(&self, start: usize, len: usize) -> (usize, usize) {
        if len == 0 || start < self.base {
            return (0, 0);
        }
        let first = (start - self.base) / self.bank_size;
        let end = (start - self.base + len).div_ceil(self.bank_size);
        (first, if end > self.bank_count { self.bank_count } else { end })
    }

    /// Banks lying wholly inside `[start, start + len)`.
    pub const fn banks_within(&self, start: usize, len: usize) -> (usize, usize) {
        if len == 0 || start < self.base {
            return (0, 0);
        }
        let first = (start - self.base).div_ceil(self.bank_size);
        let end = (start - self.base + len) / self.bank_size;
        let end = if end > self.bank_count { self.bank_count } else { end };
        if end < first { (first, first) } else { (first, end) }
    }
}

/// Power-management register addresses and bit layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterMap {
    /// Shim service configuration
    pub svcfg: usize,
    /// Forces the host link out of L1
    pub svcfg_force_l1_exit: u32,
    /// Core power control (16 bit)
    pub pwrctl: usize,
    /// Core power status (16 bit)
    pub pwrsts: usize,
    /// Control-logic power-gate bit in PWRCTL
    pub pwrctl_tcpctlpg: u16,
    /// Low-power sequencer control
    pub lpsctl: usize,
    /// LPSCTL: block idle
    pub lpsctl_bid: u32,
    /// LPSCTL: block attribute 0
    pub lpsctl_battr_0: u32,
    /// LPSCTL: force DSP run
    pub lpsctl_fdsprun: u32,
    /// Shim clock control
    pub clkctl: usize,
    /// CLKCTL: high-performance clock domain low-power mode
    pub clkctl_hp_low_power: u32,
    /// I2S link control (SSP power and clocking)
    pub i2slctl: usize,
    /// DMIC link control
    pub dmiclctl: usize,
    /// DMICLCTL: set power active
    pub dmic_spa: u32,
    /// DMICLCTL: current power active
    pub dmic_cpa: u32,
    /// DMICLCTL: dynamic clock gating disable
    pub dmic_dcgd: u32,
    /// Clock control of GP-DMA controller 0
    pub gpdma_clkctl_base: usize,
    /// Distance between GP-DMA controller register blocks
    pub gpdma_stride: usize,
    /// GPDMA_CLKCTL: dynamic clock gating disable
    pub gpdma_dgcd: u32,
    /// GPDMA_CLKCTL: owner select field
    pub gpdma_osel: u32,
    /// IPC: DSP initiator request
    pub ipc_dipcidr: usize,
    /// DIPCIDR: message in flight
    pub dipcidr_busy: u32,
    /// HP-SRAM bank 0 power management block
    pub hpsram_pm_base: usize,
    /// Distance between bank power management blocks
    pub hpsram_pm_stride: usize,
    /// Offset of the power-gating status inside a bank block
    pub hpsram_pgists_offset: usize,
    /// Power-gate bit, control and status alike
    pub hpsram_pg_bit: u32,
}

impl RegisterMap {
    /// PWRCTL/PWRSTS bit of `core`.
    pub const fn tcpdsppg(&self, core: usize) -> u16 {
        1 << core
    }

    /// SSP `index`: set power active.
    pub const fn ssp_spa(&self, index: u32) -> u32 {
        1 << index
    }

    /// SSP `index`: current power active.
    pub const fn ssp_cpa(&self, index: u32) -> u32 {
        1 << (8 + index)
    }

    /// SSP `index`: clock gating disable.
    pub const fn ssp_cgd(&self, index: u32) -> u32 {
        1 << (16 + index)
    }

    /// Clock control register of GP-DMA controller `index`.
    pub const fn gpdma_clkctl(&self, index: u32) -> usize {
        self.gpdma_clkctl_base + index as usize * self.gpdma_stride
    }

    /// Power-gating control of HP-SRAM `bank`.
    pub const fn hpsram_pgctl(&self, bank: usize) -> usize {
        self.hpsram_pm_base + bank * self.hpsram_pm_stride
    }

    /// Power-gating status of HP-SRAM `bank`.
    pub const fn hpsram_pgists(&self, bank: usize) -> usize {
        self.hpsram_pgctl(bank) + self.hpsram_pgists_offset
    }
}

/// Delays, retry budgets and timeouts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlatformTiming {
    /// Cycles the forced L1 exit is held
    pub force_l1_exit_cycles: u64,
    /// Power-status polls after powering a secondary core
    pub dsp_power_tries: u32,
    /// Cycles between those polls
    pub dsp_power_delay_cycles: u64,
    /// Generic inter-poll delay in cycles
    pub default_delay_cycles: u64,
    /// Power-status polls for SSP/DMIC links
    pub link_power_tries: u32,
    /// Power-status polls for one HP-SRAM bank
    pub sram_bank_tries: u32,
    /// Wait for the IPC channel to drain before power-off
    pub ipc_busy_timeout_us: u64,
    /// Interval between core-ready polls
    pub core_ready_poll_us: u64,
    /// Core-ready polls before a bring-up is declared failed
    pub core_ready_tries: u32,
    /// Wait for a secondary core to go idle before halting it
    pub core_disable_timeout_ms: u64,
}

/// Compile-time checks on a platform description.
pub const fn validate(config: &PlatformConfig) -> bool {
    let memory = &config.memory;
    memory.core_count >= 1
        && memory.core_count <= MAX_CORE_COUNT
        && memory.primary_core.index() < memory.core_count
        && memory.sram.banks_per_segment >= 1
        && memory.sram.banks_per_segment <= 32
        && memory.sram.segments() <= MAX_SRAM_SEGMENTS
        && memory.sram.bank_size.is_power_of_two()
        && memory.core_memory.block_size != 0
        && memory.core_memory.block_size % memory.sram.bank_size == 0
        && memory.core_memory.base.wrapping_sub(memory.sram.base) % memory.sram.bank_size == 0
}
