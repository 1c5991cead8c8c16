//! ADSP Platform Core Library
//!
//! Memory, power-domain and secondary-core management for multi-core audio
//! DSP firmware. This library provides the services every other firmware
//! subsystem builds on: cache-aware heaps, the runtime power governor, the
//! secondary core lifecycle and the platform power sequencing.
//!
//! # Architecture
//!
//! ```text
//!            ┌──────────────┐   ┌───────────────┐   ┌──────────────────────┐
//!  callers ─▶│ MemoryManager│   │ CoreLifecycle │──▶│ PlatformPowerSequencer│
//!            └──────┬───────┘   └───────┬───────┘   └──────────┬───────────┘
//!                   │                   ▼                      │
//!                   │           ┌───────────────┐              │
//!                   └──────────▶│ PowerRuntime  │◀─────────────┘
//!                               └───────┬───────┘
//!                                       ▼
//!                               arch::Hal (registers, cache, cores)
//! ```
//!
//! - The heaps are built from the platform memory map; the power bookkeeping
//!   is allocated from the shared uncached zone.
//! - All hardware access goes through [`arch::Hal`], so the whole core runs
//!   against a test double on the host.
//! - [`FirmwareCore`] builds everything once at bring-up. Nothing is ever torn
//!   down.
//!
//! # Safety
//!
//! The only unsafe operations are heap construction over raw memory regions
//! and the raw block handling inside the heaps. Every such block documents the
//! invariant it relies on.

#![cfg_attr(not(test), no_std)]
#![deny(unsafe_op_in_unsafe_fn)]
#![deny(missing_docs)]
#![warn(clippy::undocumented_unsafe_blocks)]
#![warn(clippy::unwrap_used)]

pub mod arch;
pub mod cpu;
pub mod macros;
pub mod memory;
pub mod platform;
pub mod power;

use core::sync::atomic::{AtomicBool, Ordering};

use thiserror_no_std::Error;

use arch::{ArchError, BootHandshake, Hal};
use cpu::{CoreError, CoreLifecycle, MAX_CORE_COUNT};
use memory::{MemoryError, MemoryManager};
use platform::{PlatformConfig, PlatformPowerSequencer};
use power::{PowerRuntime, PowerRuntimeData};

/// Platform core error types
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// Heap setup or allocation failed
    #[error("memory: {0}")]
    Memory(#[from] MemoryError),
    /// Core lifecycle request failed
    #[error("core: {0}")]
    Core(#[from] CoreError),
    /// Hardware primitive failed
    #[error("arch: {0}")]
    Arch(#[from] ArchError),
    /// The platform description is inconsistent
    #[error("invalid platform configuration")]
    InvalidConfig,
    /// Bring-up already ran
    #[error("platform core already initialised")]
    AlreadyInitialised,
}

/// Result type for platform core operations
pub type Result<T> = core::result::Result<T, Error>;

static INITIALISED: AtomicBool = AtomicBool::new(false);

/// Every platform core service, built once at bring-up.
pub struct FirmwareCore<'a, H: Hal + ?Sized> {
    hal: &'a H,
    config: &'a PlatformConfig,
    memory: MemoryManager<'a, H>,
    power: PowerRuntime<'a, H>,
    cores: CoreLifecycle<'a, H>,
    sequencer: PlatformPowerSequencer<'a, H>,
}

impl<'a, H: Hal + ?Sized> FirmwareCore<'a, H> {
    /// Bring the platform core up. Succeeds at most once per firmware image.
    ///
    /// # Safety
    /// Every memory region in `config` must be valid and otherwise unused for
    /// the rest of the program.
    pub unsafe fn init(hal: &'a H, config: &'a PlatformConfig) -> Result<Self> {
        if INITIALISED.swap(true, Ordering::AcqRel) {
            return Err(Error::AlreadyInitialised);
        }
        // SAFETY: forwarded from the caller; the handshakes are used by this
        // instance only since bring-up runs once.
        unsafe { Self::new(hal, config, &cpu::BOOT_HANDSHAKES) }
    }

    /// Build the services without the once-only check.
    ///
    /// # Safety
    /// As [`FirmwareCore::init`]. In addition no other instance may use
    /// `handshakes`.
    pub unsafe fn new(
        hal: &'a H,
        config: &'a PlatformConfig,
        handshakes: &'static [BootHandshake; MAX_CORE_COUNT],
    ) -> Result<Self> {
        if !platform::validate(config) {
            log_error!(hal, "invalid platform configuration");
            return Err(Error::InvalidConfig);
        }
        // SAFETY: forwarded from the caller.
        let memory = unsafe { MemoryManager::from_memory_map(hal, &config.memory)? };
        let data: &'static PowerRuntimeData = PowerRuntimeData::allocate(&memory)?;
        let power = PowerRuntime::new(hal, config, data);
        let cores = CoreLifecycle::new(hal, config, power, handshakes);
        let sequencer = PlatformPowerSequencer::new(hal, config, power);
        log_info!(hal, "platform core ready", config.memory.core_count);
        Ok(Self {
            hal,
            config,
            memory,
            power,
            cores,
            sequencer,
        })
    }

    /// Hardware interface.
    pub fn hal(&self) -> &'a H {
        self.hal
    }

    /// Platform description.
    pub fn config(&self) -> &'a PlatformConfig {
        self.config
    }

    /// Allocation interface.
    pub fn memory(&self) -> &MemoryManager<'a, H> {
        &self.memory
    }

    /// Runtime power governor.
    pub fn power(&self) -> &PowerRuntime<'a, H> {
        &self.power
    }

    /// Secondary core lifecycle.
    pub fn cores(&self) -> &CoreLifecycle<'a, H> {
        &self.cores
    }

    /// Platform power sequencing.
    pub fn sequencer(&self) -> &PlatformPowerSequencer<'a, H> {
        &self.sequencer
    }
}
