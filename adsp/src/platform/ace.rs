//! ACE Platform Description
//!
//! Default description of an ACE-class audio DSP: a cluster of up to five
//! cores sharing banked HP-SRAM, reachable uncached at `0x4000_0000` and
//! cached at `0xA000_0000`, with long-lived IMR memory for the persistent heap.
//!
//! # Memory Map
//!
//! ```text
//! 0x40000000 - 0x400FFFFF : firmware image, boot stacks
//! 0x40100000 - 0x4017FFFF : secondary core private memory (one 128 KiB bank each)
//! 0x40180000 - 0x402FFFFF : system heap
//! 0x40300000 - 0x403BFFFF : rest of HP-SRAM (30 banks of 128 KiB in total)
//! 0xA0000000 - 0xA03BFFFF : cached alias of the above
//! 0xA1000000 - 0xA10FFFFF : IMR, persistent heap after the reserved layout page
//! ```

#![deny(missing_docs)]

use super::{
    CoreMemoryLayout, PlatformConfig, PlatformMemoryMap, PlatformTiming, RegisterMap, SramLayout,
    StackLayout,
};
use crate::cpu::CoreId;
use crate::memory::{HeapRegion, PAGE_SIZE, PersistentRegion};

/// Distance from the uncached to the cached SRAM alias
pub const SRAM_ALIAS_OFFSET: usize = 0x6000_0000;

/// HP-SRAM bank size
pub const SRAM_BANK_SIZE: usize = 128 * 1024;

/// Banks described by one power-gating mask word
pub const EBB_BANKS_IN_SEGMENT: usize = 32;

/// HP-SRAM banks present
pub const HPSRAM_EBB_COUNT: usize = 30;

/// Cores in the cluster
pub const CORE_COUNT: usize = 5;

/// Shim register block
pub const SHIM_BASE: usize = 0x0007_1f00;

/// IPC register block facing the host
pub const IPC_HOST_BASE: usize = 0x0007_3000;

/// Low-power GP-DMA register blocks
pub const GPDMA_BASE: usize = 0x0007_c400;

/// IMR, cached alias
pub const IMR_BASE: usize = 0xa100_0000;

/// IMR layout page handed to the boot ROM
pub const IMR_LAYOUT_ADDRESS: usize = IMR_BASE + 0x2_0000;

/// Cycles the forced L1 exit is held
pub const FORCE_L1_EXIT_TIME: u64 = 985;

const fn bit(n: u32) -> u32 {
    1 << n
}

/// Register layout of the ACE shim, link and IPC blocks.
pub const REGISTERS: RegisterMap = RegisterMap {
    svcfg: SHIM_BASE + 0xf4,
    svcfg_force_l1_exit: bit(1),
    pwrctl: SHIM_BASE + 0x90,
    pwrsts: SHIM_BASE + 0x92,
    pwrctl_tcpctlpg: 1 << 4,
    lpsctl: SHIM_BASE + 0x94,
    lpsctl_bid: bit(7),
    lpsctl_battr_0: bit(12),
    lpsctl_fdsprun: bit(9),
    clkctl: SHIM_BASE + 0x78,
    clkctl_hp_low_power: bit(2),
    i2slctl: 0x0007_1c04,
    dmiclctl: 0x0007_1e04,
    dmic_spa: bit(0),
    dmic_cpa: bit(8),
    dmic_dcgd: bit(30),
    gpdma_clkctl_base: GPDMA_BASE + 0x04,
    gpdma_stride: 0x100,
    gpdma_dgcd: bit(30),
    gpdma_osel: 0x3 << 24,
    ipc_dipcidr: IPC_HOST_BASE + 0x10,
    dipcidr_busy: bit(31),
    hpsram_pm_base: 0x0017_a800,
    hpsram_pm_stride: 0x8,
    hpsram_pgists_offset: 0x4,
    hpsram_pg_bit: bit(0),
};

/// ACE memory layout.
pub const MEMORY: PlatformMemoryMap = PlatformMemoryMap {
    system_heap: HeapRegion::new(0x4018_0000, 0x18_0000, SRAM_ALIAS_OFFSET),
    persistent: Some(PersistentRegion {
        base: IMR_BASE,
        size: 0x10_0000,
        page_size: PAGE_SIZE,
        reserved: IMR_LAYOUT_ADDRESS - IMR_BASE + PAGE_SIZE,
    }),
    imr_layout: Some(IMR_LAYOUT_ADDRESS),
    core_memory: CoreMemoryLayout {
        base: 0x4010_0000,
        block_size: SRAM_BANK_SIZE,
    },
    stacks: StackLayout {
        base: 0x400f_6000,
        size: 0x2000,
    },
    sram: SramLayout {
        base: 0x4000_0000,
        bank_size: SRAM_BANK_SIZE,
        bank_count: HPSRAM_EBB_COUNT,
        banks_per_segment: EBB_BANKS_IN_SEGMENT,
    },
    core_count: CORE_COUNT,
    primary_core: CoreId::PRIMARY,
};

/// ACE timing budgets.
pub const TIMING: PlatformTiming = PlatformTiming {
    force_l1_exit_cycles: FORCE_L1_EXIT_TIME,
    dsp_power_tries: 32,
    dsp_power_delay_cycles: 256,
    default_delay_cycles: 12,
    link_power_tries: 32,
    sram_bank_tries: 256,
    ipc_busy_timeout_us: 2000,
    core_ready_poll_us: 100,
    core_ready_tries: 1000,
    core_disable_timeout_ms: 5000,
};

/// The default ACE platform.
pub const CONFIG: PlatformConfig = PlatformConfig {
    memory: MEMORY,
    registers: REGISTERS,
    timing: TIMING,
};

static_assertions::const_assert!(super::validate(&CONFIG));
